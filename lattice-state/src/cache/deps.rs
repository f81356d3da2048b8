//! Change Detection
//!
//! The deps cache remembers, per resolution-instance key, the inputs that
//! mattered the last time a derived variable was computed and what it
//! computed. A resolution is a cache hit iff the freshly computed relevant
//! inputs deep-equal the stored ones.
//!
//! Relevant inputs are the declared dependency values followed by every
//! trigger counter in the subtree, root first. Counters are compared
//! positionally, so the trigger list must be order-stable.

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::error::Result;
use crate::resolve::{set_nested_force_key, PathSegment, ResolvedVariable, TriggerHandle};

/// Last relevant inputs of a derived variable and the value they produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DepsCacheEntry {
    pub args: Vec<Value>,
    pub result: Value,
}

/// A trigger handle read during resolution, with its place in the tree.
#[derive(Debug, Clone)]
pub struct TriggerSnapshot {
    pub path: Vec<PathSegment>,
    pub handle: TriggerHandle,
}

/// Outcome of comparing fresh inputs to the cached ones.
#[derive(Debug, Clone, PartialEq)]
pub enum DerivedResolution {
    /// Nothing relevant changed; reuse the cached result.
    Previous(Value),
    /// Recompute with these values. `force_key` applies to the root request;
    /// a nested force token, if any, is already embedded in `values`.
    Current {
        relevant_inputs: Vec<Value>,
        force_key: Option<String>,
        values: Vec<ResolvedVariable>,
    },
}

/// Memoization table of one engine.
#[derive(Default)]
pub struct DepsCache {
    entries: DashMap<String, DepsCacheEntry>,
}

impl DepsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<DepsCacheEntry> {
        self.entries.get(key).map(|entry| entry.clone())
    }

    /// Overwrite the entry for `key`.
    pub fn store(&self, key: &str, args: Vec<Value>, result: Value) {
        self.entries
            .insert(key.to_string(), DepsCacheEntry { args, result });
    }

    pub fn remove(&self, key: &str) -> Option<DepsCacheEntry> {
        self.entries.remove(key).map(|(_, entry)| entry)
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Decide whether the derived variable at `key` must be recomputed.
    ///
    /// `deps` are the positions of the cache-relevant entries of
    /// `resolved_values`; `triggers` is the snapshot of the trigger list,
    /// root first. Only the first changed trigger is acted on.
    pub fn resolve_derived_value(
        &self,
        key: &str,
        deps: &[usize],
        resolved_values: Vec<ResolvedVariable>,
        triggers: &[TriggerSnapshot],
    ) -> Result<DerivedResolution> {
        let mut relevant_inputs = Vec::with_capacity(deps.len() + triggers.len());
        for idx in deps {
            if let Some(value) = resolved_values.get(*idx) {
                relevant_inputs.push(serde_json::to_value(value)?);
            }
        }
        let value_count = relevant_inputs.len();
        relevant_inputs.extend(triggers.iter().map(|t| Value::from(t.handle.inc)));

        let Some(previous) = self.get(key) else {
            debug!(key, "first resolution");
            return Ok(DerivedResolution::Current {
                relevant_inputs,
                force_key: None,
                values: resolved_values,
            });
        };

        if previous.args == relevant_inputs {
            debug!(key, "relevant inputs unchanged");
            return Ok(DerivedResolution::Previous(previous.result));
        }

        let mut values = resolved_values;
        let mut force_key = None;
        if let Some(changed) = first_changed_trigger(&previous.args, &relevant_inputs, value_count)
        {
            let snapshot = &triggers[changed];
            match (&snapshot.handle.force_key, snapshot.path.is_empty()) {
                (token, true) => force_key = token.clone(),
                (Some(token), false) => {
                    if !set_nested_force_key(&mut values, &snapshot.path, token) {
                        debug!(key, ?snapshot.path, "force token has no nested request");
                    }
                }
                (None, false) => {}
            }
        }

        debug!(key, forced = force_key.is_some(), "relevant inputs changed");
        Ok(DerivedResolution::Current {
            relevant_inputs,
            force_key,
            values,
        })
    }
}

/// Index into the trigger list of the first counter that moved.
fn first_changed_trigger(previous: &[Value], current: &[Value], value_count: usize) -> Option<usize> {
    let before = previous.get(value_count..)?;
    let after = current.get(value_count..)?;
    if before.len() != after.len() {
        return None;
    }
    before.iter().zip(after).position(|(a, b)| a != b)
}
