//! Signal Implementation
//!
//! A Signal holds a value and a list of subscribers that are told when the
//! value changes. The engine uses signals for client-side variable values and
//! for the committed value of every result node.
//!
//! # Thread Safety
//!
//! The value and the subscriber list sit behind separate `RwLock`s. Callbacks
//! run after both locks are released, so a callback may read the signal or
//! subscribe to it again without deadlocking.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::subscriber::{Subscriber, SubscriberId};

/// Counter for generating unique signal IDs.
static SIGNAL_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a new unique signal ID.
fn next_signal_id() -> u64 {
    SIGNAL_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// A reactive signal holding a value of type T.
///
/// # Example
///
/// ```rust
/// use lattice_state::reactive::Signal;
///
/// let count = Signal::new(0);
/// count.set(5);
/// assert_eq!(count.get(), 5);
/// ```
pub struct Signal<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Unique identifier for this signal.
    id: u64,

    /// The current value.
    value: Arc<RwLock<T>>,

    /// Subscribers notified after every write.
    subscribers: Arc<RwLock<Vec<Subscriber>>>,
}

impl<T> Signal<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a new signal with the given initial value.
    pub fn new(value: T) -> Self {
        Self {
            id: next_signal_id(),
            value: Arc::new(RwLock::new(value)),
            subscribers: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Get the signal's unique ID.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Get a clone of the current value.
    pub fn get(&self) -> T {
        self.value.read().clone()
    }

    /// Read the value through a closure without cloning it.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.value.read())
    }

    /// Set a new value and notify subscribers.
    pub fn set(&self, value: T) {
        *self.value.write() = value;
        self.notify_subscribers();
    }

    /// Update the value using a function, then notify subscribers.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&T) -> T,
    {
        {
            let mut guard = self.value.write();
            let next = f(&guard);
            *guard = next;
        }
        self.notify_subscribers();
    }

    /// Register a subscriber. Returns its ID for later removal.
    pub fn subscribe(&self, subscriber: Subscriber) -> SubscriberId {
        let id = subscriber.id();
        self.subscribers.write().push(subscriber);
        id
    }

    /// Remove a subscriber.
    pub fn unsubscribe(&self, subscriber_id: SubscriberId) {
        self.subscribers
            .write()
            .retain(|subscriber| subscriber.id() != subscriber_id);
    }

    /// Notify all subscribers without changing the value.
    pub fn notify_subscribers(&self) {
        let subscribers = self.subscribers.read().clone();
        for subscriber in subscribers {
            subscriber.notify();
        }
    }

    /// Get the number of subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl<T> Signal<T>
where
    T: Clone + Send + Sync + PartialEq + 'static,
{
    /// Set a new value, notifying subscribers only if it differs from the
    /// current one. Returns whether the value changed.
    pub fn set_if_changed(&self, value: T) -> bool {
        {
            let mut guard = self.value.write();
            if *guard == value {
                return false;
            }
            *guard = value;
        }
        self.notify_subscribers();
        true
    }
}

impl<T> Clone for Signal<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            value: Arc::clone(&self.value),
            subscribers: Arc::clone(&self.subscribers),
        }
    }
}

impl<T> Debug for Signal<T>
where
    T: Clone + Send + Sync + Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("id", &self.id)
            .field("value", &self.get())
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;

    fn counting_subscriber() -> (Subscriber, Arc<AtomicI32>) {
        let count = Arc::new(AtomicI32::new(0));
        let count_clone = count.clone();
        let subscriber = Subscriber::new(move || {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });
        (subscriber, count)
    }

    #[test]
    fn signal_get_and_set() {
        let signal = Signal::new(0);
        assert_eq!(signal.get(), 0);

        signal.set(42);
        assert_eq!(signal.get(), 42);
    }

    #[test]
    fn signal_update() {
        let signal = Signal::new(10);
        signal.update(|v| v + 5);
        assert_eq!(signal.get(), 15);
    }

    #[test]
    fn signal_notifies_subscribers() {
        let signal = Signal::new(0);
        let (subscriber, call_count) = counting_subscriber();
        signal.subscribe(subscriber);

        signal.set(1);
        assert_eq!(call_count.load(Ordering::SeqCst), 1);

        signal.set(2);
        assert_eq!(call_count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn signal_unsubscribe() {
        let signal = Signal::new(0);
        let (subscriber, call_count) = counting_subscriber();
        let id = signal.subscribe(subscriber);

        signal.set(1);
        signal.unsubscribe(id);
        signal.set(2);

        assert_eq!(call_count.load(Ordering::SeqCst), 1);
        assert_eq!(signal.subscriber_count(), 0);
    }

    #[test]
    fn set_if_changed_skips_equal_values() {
        let signal = Signal::new("a".to_string());
        let (subscriber, call_count) = counting_subscriber();
        signal.subscribe(subscriber);

        assert!(!signal.set_if_changed("a".to_string()));
        assert!(signal.set_if_changed("b".to_string()));
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callback_may_read_the_signal() {
        let signal = Signal::new(1);
        let seen = Arc::new(AtomicI32::new(0));
        let (reader, seen_clone) = (signal.clone(), seen.clone());
        signal.subscribe(Subscriber::new(move || {
            seen_clone.store(reader.get(), Ordering::SeqCst);
        }));

        signal.set(7);
        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn signal_clone_shares_state() {
        let signal1 = Signal::new(0);
        let signal2 = signal1.clone();

        signal1.set(42);
        assert_eq!(signal2.get(), 42);
        assert_eq!(signal1.id(), signal2.id());
    }
}
