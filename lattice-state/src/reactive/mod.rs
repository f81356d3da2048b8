//! Reactive Primitives
//!
//! Signals hold the mutable state the engine exposes to observers: client
//! values, trigger handles and result node snapshots. Writing a signal
//! notifies its subscribers synchronously, outside of any lock.
//!
//! There is no automatic dependency tracking here. The host's reactive
//! runtime decides when to re-read; subscribers only tell it that
//! something it read may have moved.

mod signal;
mod subscriber;

pub use signal::Signal;
pub use subscriber::{Subscriber, SubscriberId};
