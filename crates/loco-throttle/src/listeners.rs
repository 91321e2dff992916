//! Ordered listener registry with isolated failures
//!
//! Listeners run on the connection task, in registration order. A listener
//! that returns an error or panics is logged and skipped; the remaining
//! listeners still receive the event.

use std::panic::{catch_unwind, AssertUnwindSafe};

use tokio::sync::mpsc;
use tracing::warn;

/// Error a listener may report
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// Receives events of type `E`
pub trait Listener<E>: Send {
    /// Handle one event
    fn notify(&mut self, event: &E) -> Result<(), ListenerError>;
}

impl<E, F> Listener<E> for F
where
    F: FnMut(&E) -> Result<(), ListenerError> + Send,
{
    fn notify(&mut self, event: &E) -> Result<(), ListenerError> {
        self(event)
    }
}

/// Listener that forwards clones of each event into an unbounded channel
pub struct ChannelListener<E> {
    tx: mpsc::UnboundedSender<E>,
}

impl<E> ChannelListener<E> {
    /// Create a listener and the receiving end of its channel
    pub fn new() -> (Self, mpsc::UnboundedReceiver<E>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl<E: Clone + Send> Listener<E> for ChannelListener<E> {
    fn notify(&mut self, event: &E) -> Result<(), ListenerError> {
        self.tx
            .send(event.clone())
            .map_err(|_| "listener channel closed".into())
    }
}

/// Identifies one registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

/// Registration-ordered set of listeners
pub struct ListenerRegistry<E> {
    next_id: u64,
    entries: Vec<(ListenerId, Box<dyn Listener<E>>)>,
}

impl<E> Default for ListenerRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> ListenerRegistry<E> {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            next_id: 0,
            entries: Vec::new(),
        }
    }

    /// Register a listener; it is notified after every earlier registration
    pub fn add(&mut self, listener: Box<dyn Listener<E>>) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.entries.push((id, listener));
        id
    }

    /// Remove a listener, returning whether it was registered
    pub fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry, _)| *entry != id);
        self.entries.len() != before
    }

    /// Number of registered listeners
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no listener is registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every registration
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Deliver `event` to every listener in order, returning the failure count
    pub fn broadcast(&mut self, event: &E) -> usize {
        let mut failures = 0;
        for (id, listener) in &mut self.entries {
            match catch_unwind(AssertUnwindSafe(|| listener.notify(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("Listener {} failed: {}", id.0, e);
                    failures += 1;
                }
                Err(_) => {
                    warn!("Listener {} panicked", id.0);
                    failures += 1;
                }
            }
        }
        failures
    }
}
