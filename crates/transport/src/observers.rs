//! Fan-out registries for inbound frames and close notifications.

use crate::frame::Frame;

use std::fmt::{self, Debug};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::trace;

/// Callback invoked for every inbound frame.
pub type ReceiveHandler = Arc<dyn Fn(Frame) + Send + Sync>;

/// Callback invoked once when a transport closes.
pub type CloseObserver = Arc<dyn Fn(&CloseEvent) + Send + Sync>;

/// Details of a closed transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    /// Close code reported by the medium, if any.
    pub code: Option<u16>,
    /// Close reason reported by the medium (may be empty).
    pub reason: String,
    /// Whether this side asked for the close.
    pub initiated_locally: bool,
}

/// Handle of a registered receive handler, used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReceiverId(u64);

/// Registered receive handlers of one transport.
#[derive(Clone, Default)]
pub struct Receivers {
    handlers: Arc<RwLock<Vec<(ReceiverId, ReceiveHandler)>>>,
    next_id: Arc<AtomicU64>,
}

impl Receivers {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler.
    pub fn register(&self, handler: ReceiveHandler) -> ReceiverId {
        let id = ReceiverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().push((id, handler));
        id
    }

    /// Remove a handler. Returns whether it was still registered.
    pub fn unregister(&self, id: ReceiverId) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|(registered, _)| *registered != id);
        handlers.len() != before
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    /// Whether no handler has been registered yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    /// Deliver a frame to every handler, in registration order.
    pub fn dispatch(&self, frame: &Frame) {
        // Snapshot so handlers may register further handlers without deadlocking.
        let handlers = self.handlers.read().clone();
        if handlers.is_empty() {
            trace!(
                "Dropping frame {} ({:?}): no receivers",
                frame.correlation_id, frame.frame_type
            );
            return;
        }
        for (_, handler) in handlers {
            handler(frame.clone());
        }
    }
}

impl Debug for Receivers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receivers")
            .field("count", &self.len())
            .finish()
    }
}

/// Registered close observers of one transport.
#[derive(Clone, Default)]
pub struct CloseObservers {
    observers: Arc<RwLock<Vec<CloseObserver>>>,
}

impl CloseObservers {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an observer.
    pub fn register(&self, observer: CloseObserver) {
        self.observers.write().push(observer);
    }

    /// Notify every observer.
    pub fn notify(&self, event: &CloseEvent) {
        let observers = self.observers.read().clone();
        for observer in observers {
            observer(event);
        }
    }
}

impl Debug for CloseObservers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloseObservers")
            .field("count", &self.observers.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Value;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use uuid::Uuid;

    #[test]
    fn test_dispatch_reaches_every_handler() {
        let receivers = Receivers::new();
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let count = Arc::clone(&count);
            receivers.register(Arc::new(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            }));
        }

        receivers.dispatch(&Frame::send(1, Value::Null, Uuid::new_v4()));
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(receivers.len(), 3);
    }

    #[test]
    fn test_unregistered_handler_is_skipped() {
        let receivers = Receivers::new();
        let count = Arc::new(AtomicUsize::new(0));

        let ids: Vec<ReceiverId> = (0..2)
            .map(|_| {
                let count = Arc::clone(&count);
                receivers.register(Arc::new(move |_| {
                    count.fetch_add(1, Ordering::SeqCst);
                }))
            })
            .collect();

        assert!(receivers.unregister(ids[0]));
        assert!(!receivers.unregister(ids[0]));
        assert_eq!(receivers.len(), 1);

        receivers.dispatch(&Frame::send(1, Value::Null, Uuid::new_v4()));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_close_observers_see_event() {
        let observers = CloseObservers::new();
        let seen = Arc::new(RwLock::new(None));

        let seen_clone = Arc::clone(&seen);
        observers.register(Arc::new(move |event| {
            *seen_clone.write() = Some(event.clone());
        }));

        let event = CloseEvent {
            code: Some(1008),
            reason: "unsupported path: /nope".to_string(),
            initiated_locally: false,
        };
        observers.notify(&event);

        assert_eq!(seen.read().as_ref(), Some(&event));
    }
}
