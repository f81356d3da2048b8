//! Result Registry
//!
//! One result node per (variable, context). A node holds the last
//! materialized value of a derived variable, its status, and the observers
//! that want to hear about changes.
//!
//! # Eviction
//!
//! The policy is "most recent": for each variable only the node of the
//! context that resolved it last is kept unconditionally. Nodes of other
//! contexts are dropped as soon as nobody observes them. The deps cache is
//! unaffected, so a dropped node costs no remote call when it comes back.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use crate::error::EngineError;
use crate::reactive::{Signal, Subscriber, SubscriberId};
use crate::variable::Uid;

/// Where a node is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    /// Never resolved.
    Vacant,
    /// A remote computation is in flight.
    Pending,
    /// Holds a materialized value.
    Ready,
    /// The last computation failed.
    Failed,
}

/// Committed state of a node, as observers see it.
#[derive(Debug, Clone)]
pub struct NodeSnapshot {
    pub status: NodeStatus,
    /// Last successfully materialized value; kept while pending or failed.
    pub value: Option<Value>,
    pub error: Option<EngineError>,
    /// Relevant inputs of the failed computation.
    failed_inputs: Option<Vec<Value>>,
}

impl NodeSnapshot {
    fn vacant() -> Self {
        Self {
            status: NodeStatus::Vacant,
            value: None,
            error: None,
            failed_inputs: None,
        }
    }
}

/// Memoized result of one derived variable under one context.
pub struct ResultNode {
    key: String,
    uid: Uid,
    state: Signal<NodeSnapshot>,
    observers: AtomicUsize,
}

impl ResultNode {
    fn new(key: &str, uid: &Uid) -> Self {
        Self {
            key: key.to_string(),
            uid: uid.clone(),
            state: Signal::new(NodeSnapshot::vacant()),
            observers: AtomicUsize::new(0),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn uid(&self) -> &Uid {
        &self.uid
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        self.state.get()
    }

    pub fn status(&self) -> NodeStatus {
        self.state.with(|state| state.status)
    }

    /// Last materialized value, if any.
    pub fn value(&self) -> Option<Value> {
        self.state.with(|state| state.value.clone())
    }

    pub fn observer_count(&self) -> usize {
        self.observers.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_pending(&self) {
        if self.status() == NodeStatus::Pending {
            return;
        }
        self.state.update(|state| NodeSnapshot {
            status: NodeStatus::Pending,
            error: None,
            failed_inputs: None,
            ..state.clone()
        });
    }

    /// Commit a value. Observers are only told if something visible changed.
    pub(crate) fn commit(&self, value: Value) {
        let unchanged = self.state.with(|state| {
            state.status == NodeStatus::Ready && state.value.as_ref() == Some(&value)
        });
        if unchanged {
            return;
        }
        self.state.set(NodeSnapshot {
            status: NodeStatus::Ready,
            value: Some(value),
            error: None,
            failed_inputs: None,
        });
    }

    /// Leave the pending state without a new value.
    pub(crate) fn settle(&self) {
        if self.status() != NodeStatus::Pending {
            return;
        }
        self.state.update(|state| NodeSnapshot {
            status: if state.value.is_some() {
                NodeStatus::Ready
            } else {
                NodeStatus::Vacant
            },
            ..state.clone()
        });
    }

    pub(crate) fn fail(&self, error: EngineError, inputs: Vec<Value>) {
        self.state.update(|state| NodeSnapshot {
            status: NodeStatus::Failed,
            value: state.value.clone(),
            error: Some(error),
            failed_inputs: Some(inputs),
        });
    }

    /// The stored failure, if it was raised for exactly these inputs.
    pub(crate) fn failure_for(&self, inputs: &[Value]) -> Option<EngineError> {
        self.state.with(|state| match (&state.error, &state.failed_inputs) {
            (Some(error), Some(failed)) if failed.as_slice() == inputs => Some(error.clone()),
            _ => None,
        })
    }

    pub(crate) fn subscribe(&self, subscriber: Subscriber) -> SubscriberId {
        self.state.subscribe(subscriber)
    }

    pub(crate) fn unsubscribe(&self, subscriber_id: SubscriberId) {
        self.state.unsubscribe(subscriber_id);
    }
}

/// All result nodes of one engine.
#[derive(Default)]
pub struct ResultRegistry {
    nodes: DashMap<String, Arc<ResultNode>>,
    latest: DashMap<Uid, String>,
}

impl ResultRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Node for `key`, created on first use. Marks `key` as the most recent
    /// instance of `uid`.
    pub fn node(&self, uid: &Uid, key: &str) -> Arc<ResultNode> {
        let node = self
            .nodes
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(ResultNode::new(key, uid)))
            .clone();

        let previous = self.latest.insert(uid.clone(), key.to_string());
        if let Some(previous) = previous.filter(|previous| previous != key) {
            self.prune(&previous);
        }
        node
    }

    pub fn get(&self, key: &str) -> Option<Arc<ResultNode>> {
        self.nodes.get(key).map(|node| node.clone())
    }

    pub fn is_registered(&self, key: &str) -> bool {
        self.nodes.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Count one more observer of `key`.
    pub fn retain(&self, node: &ResultNode) {
        node.observers.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop one observer of `key`, pruning the node if it became stale.
    pub fn release(&self, key: &str) {
        let Some(node) = self.get(key) else {
            return;
        };
        let before = node
            .observers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if before == Ok(1) {
            self.prune(key);
        }
    }

    /// Remove `key` unconditionally.
    pub fn evict(&self, key: &str) -> bool {
        let removed = self.nodes.remove(key);
        if let Some((_, node)) = &removed {
            self.latest.remove_if(&node.uid, |_, latest| latest == key);
        }
        removed.is_some()
    }

    pub fn clear(&self) {
        self.nodes.clear();
        self.latest.clear();
    }

    /// Drop `key` if it is unobserved and not the most recent instance.
    fn prune(&self, key: &str) {
        let removed = self.nodes.remove_if(key, |_, node| {
            node.observer_count() == 0
                && node.status() != NodeStatus::Pending
                && self
                    .latest
                    .get(&node.uid)
                    .map_or(true, |latest| latest.as_str() != key)
        });
        if removed.is_some() {
            debug!(key, "evicted stale result node");
        }
    }
}

/// Keeps a subscription alive. Dropping it unsubscribes.
#[must_use = "dropping an Observation unsubscribes immediately"]
pub struct Observation {
    release: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl Observation {
    pub(crate) fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Mutex::new(vec![Box::new(release)]),
        }
    }

    /// Combine several observations into one.
    pub(crate) fn merge(observations: impl IntoIterator<Item = Observation>) -> Self {
        let mut release = Vec::new();
        for observation in observations {
            release.append(&mut observation.release.lock());
        }
        Self {
            release: Mutex::new(release),
        }
    }
}

impl Drop for Observation {
    fn drop(&mut self) {
        for release in self.release.get_mut().drain(..) {
            release();
        }
    }
}

impl std::fmt::Debug for Observation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observation")
            .field("handles", &self.release.lock().len())
            .finish()
    }
}
