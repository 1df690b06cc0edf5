//! Listener containers: ordered multi-subscriber registries
//!
//! Thread-safe via `RwLock` for concurrent registration from application
//! tasks and iteration from the dispatch task. Iteration operates over a
//! point-in-time snapshot, so listeners added or removed during a dispatch
//! pass do not affect that pass.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::error::CanopyError;
use crate::event::CanopyEvent;
use crate::state::ConnectionState;

/// Identity handed back by [`ListenerContainer::add`], used for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(u64);

/// Ordered registry of listeners. Dispatch order is insertion order.
pub struct ListenerContainer<L: ?Sized> {
    entries: RwLock<Vec<(u64, Arc<L>)>>,
    next_id: AtomicU64,
}

impl<L: ?Sized> ListenerContainer<L> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a listener; returns a handle for later removal.
    pub fn add(&self, listener: Arc<L>) -> ListenerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.write().unwrap();
        entries.push((id, listener));
        ListenerHandle(id)
    }

    /// Remove a previously registered listener. Returns false if the handle
    /// is unknown (already removed or from another container).
    pub fn remove(&self, handle: ListenerHandle) -> bool {
        let mut entries = self.entries.write().unwrap();
        let before = entries.len();
        entries.retain(|(id, _)| *id != handle.0);
        entries.len() != before
    }

    /// Drop every listener.
    pub fn clear(&self) {
        self.entries.write().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Point-in-time copy of the registered listeners, in insertion order.
    pub fn snapshot(&self) -> Vec<Arc<L>> {
        self.entries.read().unwrap().iter().map(|(_, l)| l.clone()).collect()
    }

    /// Invoke `f` for each listener registered at the moment of the call.
    pub fn for_each(&self, mut f: impl FnMut(&Arc<L>)) {
        for listener in self.snapshot() {
            f(&listener);
        }
    }
}

impl<L: ?Sized> Default for ListenerContainer<L> {
    fn default() -> Self {
        Self::new()
    }
}

/// Receives framework events (background results, watch fires, closing).
///
/// An error returned here is forwarded to the unhandled-error listeners;
/// it never aborts dispatch to the remaining listeners.
pub trait EventListener: Send + Sync {
    fn event_received(&self, event: &CanopyEvent) -> Result<(), CanopyError>;
}

impl<F> EventListener for F
where
    F: Fn(&CanopyEvent) -> Result<(), CanopyError> + Send + Sync,
{
    fn event_received(&self, event: &CanopyEvent) -> Result<(), CanopyError> {
        self(event)
    }
}

/// Receives logical connection-state transitions.
pub trait ConnectionStateListener: Send + Sync {
    fn state_changed(&self, state: ConnectionState);
}

impl<F> ConnectionStateListener for F
where
    F: Fn(ConnectionState) + Send + Sync,
{
    fn state_changed(&self, state: ConnectionState) {
        self(state)
    }
}

/// Receives errors raised by other listeners while handling events.
pub trait UnhandledErrorListener: Send + Sync {
    fn unhandled_error(&self, error: &CanopyError);
}

impl<F> UnhandledErrorListener for F
where
    F: Fn(&CanopyError) + Send + Sync,
{
    fn unhandled_error(&self, error: &CanopyError) {
        self(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_dispatch_in_insertion_order() {
        let container: ListenerContainer<dyn EventListener> = ListenerContainer::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = order.clone();
            container.add(Arc::new(move |_: &CanopyEvent| {
                order.lock().unwrap().push(tag);
                Ok(())
            }));
        }

        container.for_each(|l| {
            let _ = l.event_received(&CanopyEvent::Closing);
        });

        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_remove_by_handle() {
        let container: ListenerContainer<dyn ConnectionStateListener> = ListenerContainer::new();
        let handle = container.add(Arc::new(|_state: ConnectionState| {}));
        let _keep = container.add(Arc::new(|_state: ConnectionState| {}));

        assert_eq!(container.len(), 2);
        assert!(container.remove(handle));
        assert_eq!(container.len(), 1);
        assert!(!container.remove(handle));
    }

    #[test]
    fn test_add_during_dispatch_not_seen_in_same_pass() {
        let container: Arc<ListenerContainer<dyn EventListener>> = Arc::new(ListenerContainer::new());
        let invoked = Arc::new(Mutex::new(0usize));

        let inner = container.clone();
        let invoked_inner = invoked.clone();
        container.add(Arc::new(move |_: &CanopyEvent| {
            *invoked_inner.lock().unwrap() += 1;
            // Registering from inside a callback must not extend this pass.
            let invoked2 = invoked_inner.clone();
            inner.add(Arc::new(move |_: &CanopyEvent| {
                *invoked2.lock().unwrap() += 1;
                Ok(())
            }));
            Ok(())
        }));

        container.for_each(|l| {
            let _ = l.event_received(&CanopyEvent::Closing);
        });
        assert_eq!(*invoked.lock().unwrap(), 1);

        // The next pass sees both.
        container.for_each(|l| {
            let _ = l.event_received(&CanopyEvent::Closing);
        });
        assert_eq!(*invoked.lock().unwrap(), 3);
    }

    #[test]
    fn test_remove_during_dispatch_keeps_unrelated_listeners() {
        let container: Arc<ListenerContainer<dyn EventListener>> = Arc::new(ListenerContainer::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let handle_cell: Arc<Mutex<Option<ListenerHandle>>> = Arc::new(Mutex::new(None));

        let inner = container.clone();
        let seen_a = seen.clone();
        let cell = handle_cell.clone();
        container.add(Arc::new(move |_: &CanopyEvent| {
            seen_a.lock().unwrap().push("a");
            if let Some(handle) = cell.lock().unwrap().take() {
                inner.remove(handle);
            }
            Ok(())
        }));

        let seen_b = seen.clone();
        let handle_b = container.add(Arc::new(move |_: &CanopyEvent| {
            seen_b.lock().unwrap().push("b");
            Ok(())
        }));
        *handle_cell.lock().unwrap() = Some(handle_b);

        let seen_c = seen.clone();
        container.add(Arc::new(move |_: &CanopyEvent| {
            seen_c.lock().unwrap().push("c");
            Ok(())
        }));

        // "b" was removed mid-pass but the snapshot still delivers to it and
        // to the unrelated "c".
        container.for_each(|l| {
            let _ = l.event_received(&CanopyEvent::Closing);
        });
        assert_eq!(*seen.lock().unwrap(), vec!["a", "b", "c"]);

        // Next pass no longer includes "b".
        seen.lock().unwrap().clear();
        container.for_each(|l| {
            let _ = l.event_received(&CanopyEvent::Closing);
        });
        assert_eq!(*seen.lock().unwrap(), vec!["a", "c"]);
    }

    #[test]
    fn test_clear() {
        let container: ListenerContainer<dyn UnhandledErrorListener> = ListenerContainer::new();
        container.add(Arc::new(|_: &CanopyError| {}));
        container.add(Arc::new(|_: &CanopyError| {}));
        assert_eq!(container.len(), 2);

        container.clear();
        assert!(container.is_empty());
    }
}
