//! Event distribution for playout components
//!
//! Playout uses hybrid communication:
//! - **EventBus** (tokio::broadcast): one-to-many event broadcasting to
//!   observers outside the controller
//! - **Synchronous callbacks**: bookkeeping that must complete before a
//!   mutation returns (collection observers, item subscribers)
//!
//! The bus is generic over the event type so that each crate can publish its
//! own enum without this crate knowing about it.

use tokio::sync::broadcast;

/// Broadcast channel for one crate's event enum
///
/// Producers never block: a receiver that falls more than `capacity` events
/// behind gets `RecvError::Lagged` and resumes at the oldest retained event.
/// Receivers that are dropped simply stop counting as subscribers.
///
/// ```
/// use playout_common::events::EventBus;
///
/// #[derive(Debug, Clone, PartialEq)]
/// enum Cue {
///     Go,
/// }
///
/// let bus = EventBus::new(16);
/// let mut rx = bus.subscribe();
///
/// bus.emit(Cue::Go).ok();
/// assert_eq!(rx.try_recv().unwrap(), Cue::Go);
/// ```
pub struct EventBus<E> {
    tx: broadcast::Sender<E>,
    capacity: usize,
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            capacity: self.capacity,
        }
    }
}

impl<E: Clone> EventBus<E> {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// # Arguments
    ///
    /// * `capacity` - Number of events to buffer before lagging receivers
    ///   start losing the oldest ones. Must be non-zero.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists.
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(&self, event: E) -> Result<usize, broadcast::error::SendError<E>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    ///
    /// Used for notifications where it is acceptable that no component is
    /// currently observing.
    pub fn emit_lossy(&self, event: E) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
