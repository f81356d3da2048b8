//! Transport seam.
//!
//! The engine never talks to the network itself. Hosts implement
//! [`Transport`] for request/response calls and feed server pushes in as
//! [`Notification`]s.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::ResolutionContext;
use crate::error::TransportError;
use crate::resolve::ResolvedVariable;

/// Body of a derived-variable fetch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DerivedRequest {
    /// Resolved dependency values, `deps` markers stripped.
    pub values: Vec<ResolvedVariable>,
    pub force_key: Option<String>,
    pub channel_id: Option<String>,
}

/// What the server answers to a derived fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RemoteResponse {
    /// The computation was offloaded; wait for the task.
    Task { task_id: String },
    /// The value, computed inline.
    Value { value: Value },
}

/// Server-initiated messages from the push channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    TaskCompleted { task_id: String },
    TaskFailed { task_id: String, error: String },
    TaskCancelled { task_id: String },
    /// A server variable changed; `context` is the resolution context id.
    ServerTrigger { uid: String, context: String },
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Issue a derived fetch.
    async fn remote_call(
        &self,
        endpoint: &str,
        body: &DerivedRequest,
        ctx: &ResolutionContext,
    ) -> Result<RemoteResponse, TransportError>;

    /// Collect the value of a task. Called once the push channel reported
    /// the task as completed.
    async fn await_task(
        &self,
        task_id: &str,
        ctx: &ResolutionContext,
    ) -> Result<Value, TransportError>;

    /// Ask the server to stop a superseded task.
    async fn cancel_task(&self, task_id: &str, ctx: &ResolutionContext)
        -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn response_shapes() {
        let task: RemoteResponse = serde_json::from_value(json!({"task_id": "t1"})).unwrap();
        assert_eq!(task, RemoteResponse::Task { task_id: "t1".into() });

        let value: RemoteResponse = serde_json::from_value(json!({"value": [1, 2]})).unwrap();
        assert_eq!(value, RemoteResponse::Value { value: json!([1, 2]) });
    }

    #[test]
    fn notifications_are_tagged() {
        let notification: Notification = serde_json::from_value(json!({
            "type": "task_failed", "task_id": "t1", "error": "boom"
        }))
        .unwrap();
        assert_eq!(
            notification,
            Notification::TaskFailed {
                task_id: "t1".into(),
                error: "boom".into()
            }
        );
    }

    #[test]
    fn request_body_shape() {
        let body = DerivedRequest {
            values: vec![ResolvedVariable::Value(json!(1))],
            force_key: None,
            channel_id: Some("ws-1".into()),
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({"values": [1], "force_key": null, "channel_id": "ws-1"})
        );
    }
}
