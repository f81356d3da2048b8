//! Debounced Fetch Coordinator
//!
//! Requests for the same resolution-instance key that arrive within a short
//! window collapse into one remote call made with the latest arguments.
//! Every caller of the window receives the same response or the same error.
//!
//! The first caller of a window spawns the call, so the fetch runs to
//! completion even if that caller stops waiting. Each caller learns whether
//! the call was made with its own request.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{FutureExt, Shared};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use super::transport::{DerivedRequest, RemoteResponse};
use crate::error::{EngineError, Result};

/// Ticket of the request the call was made with, and its outcome.
type SharedResponse = Shared<oneshot::Receiver<(u64, Result<RemoteResponse>)>>;

struct PendingFetch {
    /// Ticket of the caller that opened the window.
    window: u64,
    /// Ticket of the caller whose request is current.
    latest: u64,
    request: DerivedRequest,
    done: SharedResponse,
}

/// The response of one window, as seen by one of its callers.
#[derive(Debug, Clone, PartialEq)]
pub struct Coalesced {
    pub response: RemoteResponse,
    /// The remote call carried this caller's request.
    pub own_request: bool,
}

/// Coalesces fetches per key.
pub struct DebouncedFetcher {
    window: Duration,
    tickets: AtomicU64,
    pending: Arc<Mutex<HashMap<String, PendingFetch>>>,
}

impl DebouncedFetcher {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            tickets: AtomicU64::new(0),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Number of windows currently collecting callers.
    pub fn pending_windows(&self) -> usize {
        self.pending.lock().len()
    }

    /// Fetch through the window of `key`.
    ///
    /// `call` performs the remote call; only the first caller's closure runs,
    /// with whichever request arrived last before the window closed.
    pub async fn fetch<F, Fut>(
        &self,
        key: &str,
        context: &str,
        request: DerivedRequest,
        call: F,
    ) -> Result<Coalesced>
    where
        F: FnOnce(DerivedRequest) -> Fut + Send + 'static,
        Fut: Future<Output = Result<RemoteResponse>> + Send + 'static,
    {
        let ticket = self.tickets.fetch_add(1, Ordering::Relaxed);
        let (leader, done) = {
            let mut pending = self.pending.lock();
            match pending.get_mut(key) {
                Some(window) => {
                    debug!(key, "coalesced into pending fetch");
                    window.request = request;
                    window.latest = ticket;
                    (None, window.done.clone())
                }
                None => {
                    let (tx, rx) = oneshot::channel();
                    let done = rx.shared();
                    pending.insert(
                        key.to_string(),
                        PendingFetch {
                            window: ticket,
                            latest: ticket,
                            request,
                            done: done.clone(),
                        },
                    );
                    (Some(tx), done)
                }
            }
        };

        if let Some(tx) = leader {
            let pending = Arc::clone(&self.pending);
            let delay = self.window;
            let key = key.to_string();
            tokio::spawn(async move {
                if delay.is_zero() {
                    tokio::task::yield_now().await;
                } else {
                    tokio::time::sleep(delay).await;
                }
                let window = {
                    let mut pending = pending.lock();
                    match pending.get(&key) {
                        Some(open) if open.window == ticket => pending.remove(&key),
                        _ => None,
                    }
                };
                let Some(window) = window else {
                    debug!(key = %key, "window was cleared, not fetching");
                    return;
                };
                debug!(key = %key, "window closed, fetching");
                let _ = tx.send((window.latest, call(window.request).await));
            });
        }

        match done.await {
            Ok((latest, result)) => result.map(|response| Coalesced {
                response,
                own_request: latest == ticket,
            }),
            Err(_) => Err(EngineError::Remote {
                key: key.to_string(),
                context: context.to_string(),
                message: "fetch abandoned before completion".into(),
            }),
        }
    }

    /// Abandon every open window; their callers fail.
    pub fn clear(&self) {
        self.pending.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::resolve::ResolvedVariable;

    fn request(n: i64) -> DerivedRequest {
        DerivedRequest {
            values: vec![ResolvedVariable::Value(json!(n))],
            force_key: None,
            channel_id: None,
        }
    }

    fn echo(calls: Arc<AtomicUsize>) -> impl FnOnce(DerivedRequest) -> futures_util::future::BoxFuture<'static, Result<RemoteResponse>> {
        move |request| {
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(RemoteResponse::Value {
                    value: serde_json::to_value(&request.values)?,
                })
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn callers_in_one_window_share_one_call_with_latest_args() {
        let fetcher = DebouncedFetcher::new(Duration::from_millis(10));
        let calls = Arc::new(AtomicUsize::new(0));

        let (a, b, c) = tokio::join!(
            fetcher.fetch("k", "ctx", request(1), echo(calls.clone())),
            fetcher.fetch("k", "ctx", request(2), echo(calls.clone())),
            fetcher.fetch("k", "ctx", request(3), echo(calls.clone())),
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let expected = RemoteResponse::Value { value: json!([3]) };
        let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());
        assert_eq!(a.response, expected);
        assert_eq!(b.response, expected);
        assert_eq!(c.response, expected);
        assert!(!a.own_request && !b.own_request && c.own_request);
        assert_eq!(fetcher.pending_windows(), 0);
    }

    #[tokio::test]
    async fn distinct_keys_fetch_independently() {
        let fetcher = DebouncedFetcher::new(Duration::from_millis(5));
        let calls = Arc::new(AtomicUsize::new(0));

        let (a, b) = tokio::join!(
            fetcher.fetch("a", "ctx", request(1), echo(calls.clone())),
            fetcher.fetch("b", "ctx", request(2), echo(calls.clone())),
        );

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_ne!(a.response, b.response);
        assert!(a.own_request && b.own_request);
    }

    #[tokio::test]
    async fn failure_rejects_every_coalesced_caller() {
        let fetcher = DebouncedFetcher::new(Duration::ZERO);
        let fail = |_: DerivedRequest| async {
            Err(EngineError::Remote {
                key: "k".into(),
                context: "ctx".into(),
                message: "boom".into(),
            })
        };

        let (a, b) = tokio::join!(
            fetcher.fetch("k", "ctx", request(1), fail),
            fetcher.fetch("k", "ctx", request(2), fail),
        );
        assert_eq!(a.unwrap_err().cache_key(), Some("k"));
        assert_eq!(b.unwrap_err().cache_key(), Some("k"));
    }

    #[tokio::test]
    async fn sequential_windows_make_separate_calls() {
        let fetcher = DebouncedFetcher::new(Duration::ZERO);
        let calls = Arc::new(AtomicUsize::new(0));

        fetcher.fetch("k", "ctx", request(1), echo(calls.clone())).await.unwrap();
        fetcher.fetch("k", "ctx", request(2), echo(calls.clone())).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cleared_window_does_not_steal_the_next_one() {
        let fetcher = Arc::new(DebouncedFetcher::new(Duration::from_millis(30)));
        let calls = Arc::new(AtomicUsize::new(0));

        let old = {
            let fetcher = fetcher.clone();
            let calls = calls.clone();
            tokio::spawn(async move { fetcher.fetch("k", "ctx", request(1), echo(calls)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        fetcher.clear();

        let fresh = fetcher.fetch("k", "ctx", request(2), echo(calls.clone())).await;
        assert_eq!(
            fresh.unwrap().response,
            RemoteResponse::Value { value: json!([2]) }
        );
        assert!(old.await.unwrap().is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
