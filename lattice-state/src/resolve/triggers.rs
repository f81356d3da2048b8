//! Trigger Registry
//!
//! Every derived and server variable gets a trigger handle per context, on
//! first resolution. A handle is a monotonic counter plus an optional force
//! token; advancing the counter makes the next resolution miss the cache, and
//! the token tells the server to bypass its own cache as well.
//!
//! Handles live in [`Signal`]s so that observers of a variable hear about a
//! refresh the moment it is requested.

use dashmap::DashMap;
use serde::Serialize;
use tracing::trace;

use crate::error::{Result, UsageError};
use crate::reactive::{Signal, Subscriber, SubscriberId};
use crate::variable::{Dependency, DerivedVariable, Operand, Uid, Variable};

/// `{force_key, inc}` for one variable under one context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TriggerHandle {
    pub force_key: Option<String>,
    pub inc: u64,
}

/// Holds the trigger handles of one engine, keyed by resolution-instance key.
#[derive(Default)]
pub struct TriggerRegistry {
    handles: DashMap<String, Signal<TriggerHandle>>,
}

impl TriggerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn signal(&self, key: &str) -> Signal<TriggerHandle> {
        self.handles
            .entry(key.to_string())
            .or_insert_with(|| Signal::new(TriggerHandle::default()))
            .clone()
    }

    /// Current handle, created at `inc = 0` on first use.
    pub fn ensure(&self, key: &str) -> TriggerHandle {
        self.signal(key).get()
    }

    pub fn get(&self, key: &str) -> Option<TriggerHandle> {
        self.handles.get(key).map(|signal| signal.get())
    }

    pub fn is_registered(&self, key: &str) -> bool {
        self.handles.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Advance the counter. A forced bump also mints a new force token;
    /// an unforced one clears any previous token.
    pub fn bump(&self, key: &str, force: bool) -> TriggerHandle {
        let signal = self.signal(key);
        signal.update(|handle| TriggerHandle {
            force_key: force.then(|| ulid::Ulid::new().to_string()),
            inc: handle.inc + 1,
        });
        let handle = signal.get();
        trace!(key, inc = handle.inc, force, "trigger advanced");
        handle
    }

    pub fn subscribe(&self, key: &str, subscriber: Subscriber) -> SubscriberId {
        self.signal(key).subscribe(subscriber)
    }

    pub fn unsubscribe(&self, key: &str, subscriber_id: SubscriberId) {
        if let Some(signal) = self.handles.get(key) {
            signal.unsubscribe(subscriber_id);
        }
    }

    pub fn clear(&self) {
        self.handles.clear();
    }
}

/// One step from a derived request down into its subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PathSegment {
    /// Dependency `n` of a derived variable.
    Value(usize),
    Selector,
    ValueMap,
    Default,
    /// The variable a condition tests.
    Operand,
    /// The value a condition compares against.
    Other,
}

/// A trigger-bearing node found below (or at) a derived variable.
#[derive(Debug, Clone)]
pub struct TriggerEntry {
    /// Empty for the root itself.
    pub path: Vec<PathSegment>,
    pub variable: Variable,
}

/// Flat, order-stable list of every trigger in `root`'s tree, root first.
///
/// Derived and server variables contribute a trigger; derived variables are
/// also descended into. The order is depth-first in dependency order, and
/// later resolutions diff these lists positionally.
pub fn build_trigger_list(root: &DerivedVariable) -> Result<Vec<TriggerEntry>, UsageError> {
    let mut entries = vec![TriggerEntry {
        path: Vec::new(),
        variable: Variable::Derived(root.clone()),
    }];
    let mut ancestors = vec![root.uid().clone()];
    let mut path = Vec::new();
    walk_dependencies(root.dependencies(), &mut path, &mut ancestors, &mut entries)?;
    Ok(entries)
}

fn walk_dependencies(
    dependencies: &[Dependency],
    path: &mut Vec<PathSegment>,
    ancestors: &mut Vec<Uid>,
    entries: &mut Vec<TriggerEntry>,
) -> Result<(), UsageError> {
    for (idx, dependency) in dependencies.iter().enumerate() {
        if let Dependency::Variable(variable) = dependency {
            path.push(PathSegment::Value(idx));
            walk_variable(variable, path, ancestors, entries)?;
            path.pop();
        }
    }
    Ok(())
}

fn walk_variable(
    variable: &Variable,
    path: &mut Vec<PathSegment>,
    ancestors: &mut Vec<Uid>,
    entries: &mut Vec<TriggerEntry>,
) -> Result<(), UsageError> {
    match variable {
        Variable::Derived(derived) => {
            if ancestors.contains(derived.uid()) {
                return Err(UsageError::Cycle {
                    uid: derived.uid().to_string(),
                });
            }
            entries.push(TriggerEntry {
                path: path.clone(),
                variable: variable.clone(),
            });
            ancestors.push(derived.uid().clone());
            walk_dependencies(derived.dependencies(), path, ancestors, entries)?;
            ancestors.pop();
        }
        Variable::Server(_) => entries.push(TriggerEntry {
            path: path.clone(),
            variable: variable.clone(),
        }),
        Variable::Switch(switch) => {
            for (segment, operand) in [
                (PathSegment::Selector, switch.value()),
                (PathSegment::ValueMap, switch.value_map()),
                (PathSegment::Default, switch.default_value()),
            ] {
                path.push(segment);
                walk_operand(operand, path, ancestors, entries)?;
                path.pop();
            }
        }
        Variable::Plain(_) | Variable::State(_) | Variable::Stream(_) => {}
    }
    Ok(())
}

fn walk_operand(
    operand: &Operand,
    path: &mut Vec<PathSegment>,
    ancestors: &mut Vec<Uid>,
    entries: &mut Vec<TriggerEntry>,
) -> Result<(), UsageError> {
    match operand {
        Operand::Variable(variable) => walk_variable(variable, path, ancestors, entries),
        Operand::Condition(condition) => {
            path.push(PathSegment::Operand);
            walk_variable(&condition.variable, path, ancestors, entries)?;
            path.pop();
            if let Dependency::Variable(other) = &condition.other {
                path.push(PathSegment::Other);
                walk_variable(other, path, ancestors, entries)?;
                path.pop();
            }
            Ok(())
        }
        Operand::Constant(_) => Ok(()),
    }
}
