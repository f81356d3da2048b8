//! Engine configuration.
//!
//! Every field has a default, so hosts only spell out what they change:
//!
//! ```json
//! { "debounce_window_ms": 25 }
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Tunables for one [`Engine`](crate::Engine) instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Coalescing window for derived fetches, in milliseconds.
    ///
    /// Zero skips the delay; callers that arrive before the spawned call
    /// runs are still coalesced.
    #[serde(default = "default_debounce_window_ms")]
    pub debounce_window_ms: u64,

    /// Endpoint prefix; the uid of the derived variable is appended.
    #[serde(default = "default_derived_endpoint_prefix")]
    pub derived_endpoint_prefix: String,

    /// Also cancel superseded tasks through the transport, not only locally.
    #[serde(default = "default_true")]
    pub cancel_remote_tasks: bool,
}

fn default_debounce_window_ms() -> u64 {
    10
}

fn default_derived_endpoint_prefix() -> String {
    "/api/core/derived-variable".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debounce_window_ms: default_debounce_window_ms(),
            derived_endpoint_prefix: default_derived_endpoint_prefix(),
            cancel_remote_tasks: true,
        }
    }
}

impl EngineConfig {
    /// Parse a JSON config document.
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(EngineError::from)
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_window_ms)
    }

    /// Endpoint for fetching the derived variable `uid`.
    pub fn derived_endpoint(&self, uid: &str) -> String {
        format!("{}/{}", self.derived_endpoint_prefix.trim_end_matches('/'), uid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = EngineConfig::from_json("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.debounce_window(), Duration::from_millis(10));
    }

    #[test]
    fn partial_document_overrides_fields() {
        let config =
            EngineConfig::from_json(r#"{"debounce_window_ms": 0, "cancel_remote_tasks": false}"#)
                .unwrap();
        assert_eq!(config.debounce_window_ms, 0);
        assert!(!config.cancel_remote_tasks);
        assert_eq!(config.derived_endpoint_prefix, "/api/core/derived-variable");
    }

    #[test]
    fn endpoint_joins_prefix_and_uid() {
        let config = EngineConfig {
            derived_endpoint_prefix: "/derived/".into(),
            ..EngineConfig::default()
        };
        assert_eq!(config.derived_endpoint("abc"), "/derived/abc");
    }

    #[test]
    fn malformed_document_is_an_error() {
        assert!(EngineConfig::from_json("[1, 2]").is_err());
    }
}
