//! Remote fetch plumbing: the transport seam, per-key debouncing, in-flight
//! generations and task tracking.

mod debounce;
mod inflight;
mod tasks;
mod transport;

pub use debounce::{Coalesced, DebouncedFetcher};
pub use inflight::{InFlight, SharedFetch};
pub use tasks::{TaskFailure, TaskGuard, TaskManager, TaskStart, TaskStatus};
pub use transport::{DerivedRequest, Notification, RemoteResponse, Transport};
