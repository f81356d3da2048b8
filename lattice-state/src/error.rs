//! Error types for the resolution engine.
//!
//! `EngineError` is `Clone`: a single remote failure fans out to every caller
//! that was coalesced onto the same call, so the error has to be shareable.

use std::sync::Arc;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = EngineError> = std::result::Result<T, E>;

/// Errors surfaced by the engine.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// A variable was used somewhere it cannot be resolved. Never retried.
    #[error("usage error: {0}")]
    Usage(#[from] UsageError),

    /// The task was superseded by a newer resolution.
    #[error("task {task_id} was cancelled")]
    TaskCancelled { task_id: String },

    /// The remote task ran and failed.
    #[error("task {task_id} failed for {key}: {message}")]
    Task {
        key: String,
        context: String,
        task_id: String,
        message: Arc<str>,
    },

    /// The remote call itself failed.
    #[error("remote computation failed for {key}: {message}")]
    Remote {
        key: String,
        context: String,
        message: Arc<str>,
    },

    /// A request body could not be serialized.
    #[error("serialization failed: {0}")]
    Serialization(Arc<str>),
}

impl EngineError {
    /// The resolution-instance key this failure belongs to, if any.
    ///
    /// Error boundaries pass it to [`Engine::evict`](crate::Engine::evict) so
    /// the next read retries exactly the failed entry.
    pub fn cache_key(&self) -> Option<&str> {
        match self {
            EngineError::Task { key, .. } | EngineError::Remote { key, .. } => Some(key),
            _ => None,
        }
    }

    /// The context id the failure was raised under, if any.
    pub fn context(&self) -> Option<&str> {
        match self {
            EngineError::Task { context, .. } | EngineError::Remote { context, .. } => {
                Some(context)
            }
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::TaskCancelled { .. })
    }

    pub(crate) fn remote(key: &str, context: &str, source: TransportError) -> Self {
        EngineError::Remote {
            key: key.to_string(),
            context: context.to_string(),
            message: source.to_string().into(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string().into())
    }
}

/// Developer mistakes: unsupported variants or malformed graphs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UsageError {
    #[error("{kind} variable {uid} cannot be resolved here; use {accessor}")]
    Unsupported {
        kind: &'static str,
        uid: String,
        accessor: &'static str,
    },

    #[error("derived variable {uid} depends on itself")]
    Cycle { uid: String },

    #[error("{kind} variable {uid} has no trigger")]
    NotTriggerable { kind: &'static str, uid: String },
}

/// Failures reported by a [`Transport`](crate::fetch::Transport).
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("request to {endpoint} failed: {message}")]
    Request { endpoint: String, message: String },

    #[error("task {task_id} failed: {message}")]
    TaskFailed { task_id: String, message: String },

    #[error("task {task_id} is unknown to the server")]
    UnknownTask { task_id: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_only_on_tagged_errors() {
        let err = EngineError::Task {
            key: "uid@ctx".into(),
            context: "ctx".into(),
            task_id: "t1".into(),
            message: "boom".into(),
        };
        assert_eq!(err.cache_key(), Some("uid@ctx"));
        assert_eq!(err.context(), Some("ctx"));

        let cancelled = EngineError::TaskCancelled { task_id: "t1".into() };
        assert_eq!(cancelled.cache_key(), None);
        assert!(cancelled.is_cancelled());
    }

    #[test]
    fn transport_errors_become_remote_errors() {
        let err = EngineError::remote(
            "k",
            "c",
            TransportError::Request {
                endpoint: "/x".into(),
                message: "503".into(),
            },
        );
        assert_eq!(err.cache_key(), Some("k"));
        assert!(err.to_string().contains("503"));
    }
}
