//! Resolution Context
//!
//! A resolution context partitions every registry of the engine. The same
//! variable resolved under two contexts gets two independent trigger
//! handles, deps cache entries, result nodes and task scopes.
//!
//! Contexts are cheap to clone; the host usually creates one per
//! authenticated session and passes it along with every read.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::variable::Uid;

const GLOBAL: &str = "global";

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ResolutionContext {
    id: Arc<str>,
    channel_id: Option<Arc<str>>,
    headers: Arc<BTreeMap<String, String>>,
}

impl ResolutionContext {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self {
            id: id.into(),
            channel_id: None,
            headers: Arc::new(BTreeMap::new()),
        }
    }

    /// The context used when the host has no notion of sessions.
    pub fn global() -> Self {
        Self::new(GLOBAL)
    }

    /// Attach the id of the push channel the server should address task
    /// notifications to.
    pub fn with_channel(mut self, channel_id: impl Into<Arc<str>>) -> Self {
        self.channel_id = Some(channel_id.into());
        self
    }

    /// Attach a request header (auth token, tenant, ...) for the transport.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.headers).insert(name.into(), value.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn channel_id(&self) -> Option<&str> {
        self.channel_id.as_deref()
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    /// Resolution-instance key of `uid` under this context.
    pub fn instance_key(&self, uid: &Uid) -> String {
        format!("{uid}@{}", self.id)
    }
}

impl Default for ResolutionContext {
    fn default() -> Self {
        Self::global()
    }
}

impl fmt::Debug for ResolutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Header values may carry credentials.
        f.debug_struct("ResolutionContext")
            .field("id", &self.id)
            .field("channel_id", &self.channel_id)
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_keys_differ_per_context() {
        let uid = Uid::from("total");
        let a = ResolutionContext::new("alice");
        let b = ResolutionContext::new("bob");
        assert_eq!(a.instance_key(&uid), "total@alice");
        assert_ne!(a.instance_key(&uid), b.instance_key(&uid));
    }

    #[test]
    fn headers_do_not_leak_between_clones() {
        let base = ResolutionContext::new("s1");
        let authed = base.clone().with_header("authorization", "Bearer x");
        assert!(base.headers().is_empty());
        assert_eq!(authed.headers()["authorization"], "Bearer x");
    }

    #[test]
    fn debug_hides_header_values() {
        let ctx = ResolutionContext::global().with_header("authorization", "secret");
        let rendered = format!("{ctx:?}");
        assert!(rendered.contains("authorization"));
        assert!(!rendered.contains("secret"));
    }
}
