//! Connection-state classification and delivery
//!
//! Raw session events from the wire client are coalesced into a small set of
//! logical [`ConnectionState`] values and delivered to subscribers from a
//! dedicated task, decoupled from the event source by a bounded queue. A slow
//! listener can therefore never stall protocol processing; if it falls far
//! enough behind, the oldest undelivered state is dropped and counted.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{CanopyError, Result};
use crate::listen::{ConnectionStateListener, ListenerContainer};
use crate::wire::SessionEvent;

/// Bound on undelivered state transitions. Beyond this the oldest is dropped.
const STATE_QUEUE_CAPACITY: usize = 25;

/// Logical classification of session health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// First successful handshake of this client.
    Connected,
    /// Transport lost; the client is retrying and the session may survive.
    Suspended,
    /// Healthy again after Suspended or Lost.
    Reconnected,
    /// The session expired server-side; a full re-handshake with a new
    /// session identity is required.
    Lost,
    /// Serving from a partitioned read-only member.
    ReadOnly,
}

impl ConnectionState {
    /// True when operations can be expected to reach the service.
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            ConnectionState::Connected | ConnectionState::Reconnected | ConnectionState::ReadOnly
        )
    }
}

struct StateInner {
    queue: Mutex<VecDeque<ConnectionState>>,
    notify: Notify,
    running: AtomicBool,
    missed: AtomicU64,
    has_been_connected: AtomicBool,
    current_tx: watch::Sender<Option<ConnectionState>>,
    listeners: ListenerContainer<dyn ConnectionStateListener>,
}

/// Consumes raw session events, classifies them, and fans the resulting
/// state transitions out to registered listeners.
pub struct ConnectionStateManager {
    inner: Arc<StateInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionStateManager {
    pub fn new() -> Self {
        let (current_tx, _) = watch::channel(None);
        Self {
            inner: Arc::new(StateInner {
                queue: Mutex::new(VecDeque::with_capacity(STATE_QUEUE_CAPACITY)),
                notify: Notify::new(),
                running: AtomicBool::new(false),
                missed: AtomicU64::new(0),
                has_been_connected: AtomicBool::new(false),
                current_tx,
                listeners: ListenerContainer::new(),
            }),
            task: Mutex::new(None),
        }
    }

    /// Begin the delivery loop. Idempotent-hostile by design: the framework
    /// calls this exactly once from `start`.
    pub fn start(&self) {
        self.inner.running.store(true, Ordering::Release);
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            deliver_loop(inner).await;
        });
        *self.task.lock().unwrap() = Some(handle);
    }

    /// Stop the delivery loop. The in-flight delivery completes; queued
    /// transitions that were never delivered are discarded.
    pub async fn close(&self) -> Result<()> {
        self.inner.running.store(false, Ordering::Release);
        self.inner.notify.notify_one();

        let handle = self.task.lock().unwrap().take();
        if let Some(handle) = handle {
            handle
                .await
                .map_err(|e| CanopyError::Wire(format!("state delivery task failed: {e}")))?;
        }
        Ok(())
    }

    /// Classify a raw session event and enqueue the resulting transition.
    pub(crate) fn handle_session_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::Connecting => {
                // Handshake in progress; nothing logical to report yet.
            }
            SessionEvent::Connected => {
                if self.inner.has_been_connected.swap(true, Ordering::AcqRel) {
                    self.post_state(ConnectionState::Reconnected);
                } else {
                    self.post_state(ConnectionState::Connected);
                }
            }
            SessionEvent::Disconnected => self.post_state(ConnectionState::Suspended),
            SessionEvent::Expired => self.post_state(ConnectionState::Lost),
            SessionEvent::ReadOnly => self.post_state(ConnectionState::ReadOnly),
        }
    }

    /// Enqueue a transition without blocking the caller. Drops the oldest
    /// undelivered state when the queue is full.
    pub(crate) fn post_state(&self, state: ConnectionState) {
        {
            let mut queue = self.inner.queue.lock().unwrap();
            if queue.len() >= STATE_QUEUE_CAPACITY {
                let dropped = queue.pop_front();
                self.inner.missed.fetch_add(1, Ordering::Relaxed);
                warn!(?dropped, "connection state queue full, dropping oldest");
            }
            queue.push_back(state);
        }
        self.inner.notify.notify_one();
    }

    /// The most recently delivered state, if any transition has been
    /// delivered yet.
    pub fn current_state(&self) -> Option<ConnectionState> {
        *self.inner.current_tx.borrow()
    }

    /// Number of transitions dropped because the queue overflowed.
    pub fn missed_states(&self) -> u64 {
        self.inner.missed.load(Ordering::Relaxed)
    }

    /// Registry for connection-state listeners.
    pub fn listenable(&self) -> &ListenerContainer<dyn ConnectionStateListener> {
        &self.inner.listeners
    }

    /// Suspend the calling task until the connection is usable.
    ///
    /// `max_wait` of `None` or zero waits indefinitely; otherwise a
    /// [`CanopyError::ConnectionWaitTimeout`] is returned when the deadline
    /// elapses first.
    pub async fn block_until_connected(&self, max_wait: Option<Duration>) -> Result<()> {
        let mut rx = self.inner.current_tx.subscribe();

        let wait = async move {
            loop {
                let connected = (*rx.borrow_and_update()).is_some_and(|s| s.is_connected());
                if connected {
                    return Ok(());
                }
                if rx.changed().await.is_err() {
                    return Err(CanopyError::ConnectionLoss);
                }
            }
        };

        match max_wait {
            None => wait.await,
            Some(d) if d.is_zero() => wait.await,
            Some(d) => tokio::time::timeout(d, wait)
                .await
                .map_err(|_| CanopyError::ConnectionWaitTimeout)?,
        }
    }
}

impl Default for ConnectionStateManager {
    fn default() -> Self {
        Self::new()
    }
}

async fn deliver_loop(inner: Arc<StateInner>) {
    loop {
        if !inner.running.load(Ordering::Acquire) {
            break;
        }

        let next = inner.queue.lock().unwrap().pop_front();
        match next {
            Some(state) => {
                debug!(?state, "delivering connection state");
                let _ = inner.current_tx.send(Some(state));
                inner.listeners.for_each(|l| l.state_changed(state));
            }
            None => inner.notify.notified().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[tokio::test]
    async fn test_first_connect_then_reconnect_classification() {
        let manager = ConnectionStateManager::new();
        manager.start();

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        manager.listenable().add(Arc::new(move |state: ConnectionState| {
            sink.lock().unwrap().push(state);
        }));

        manager.handle_session_event(SessionEvent::Connecting);
        manager.handle_session_event(SessionEvent::Connected);
        manager.handle_session_event(SessionEvent::Disconnected);
        manager.handle_session_event(SessionEvent::Connected);

        manager.block_until_connected(Some(Duration::from_secs(1))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ConnectionState::Connected,
                ConnectionState::Suspended,
                ConnectionState::Reconnected,
            ]
        );

        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_expiry_never_skips_lost() {
        let manager = ConnectionStateManager::new();
        manager.start();

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        manager.listenable().add(Arc::new(move |state: ConnectionState| {
            sink.lock().unwrap().push(state);
        }));

        manager.handle_session_event(SessionEvent::Connected);
        // Expiry immediately followed by a successful re-handshake must still
        // deliver Lost before Reconnected.
        manager.handle_session_event(SessionEvent::Expired);
        manager.handle_session_event(SessionEvent::Connected);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ConnectionState::Connected,
                ConnectionState::Lost,
                ConnectionState::Reconnected,
            ]
        );

        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_queue_overflow_drops_oldest_and_counts() {
        let manager = ConnectionStateManager::new();
        // Delivery loop intentionally not started: everything queues.

        for _ in 0..STATE_QUEUE_CAPACITY {
            manager.post_state(ConnectionState::Suspended);
        }
        assert_eq!(manager.missed_states(), 0);

        manager.post_state(ConnectionState::Lost);
        manager.post_state(ConnectionState::Reconnected);
        assert_eq!(manager.missed_states(), 2);
    }

    #[tokio::test]
    async fn test_block_until_connected_times_out() {
        let manager = ConnectionStateManager::new();
        manager.start();

        let result = manager.block_until_connected(Some(Duration::from_millis(20))).await;
        assert_eq!(result, Err(CanopyError::ConnectionWaitTimeout));

        manager.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_until_connected_zero_waits_indefinitely() {
        let manager = Arc::new(ConnectionStateManager::new());
        manager.start();

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.block_until_connected(Some(Duration::ZERO)).await })
        };

        // Long virtual delay: the waiter must still be pending.
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(!waiter.is_finished());

        manager.handle_session_event(SessionEvent::Connected);
        waiter.await.unwrap().unwrap();

        manager.close().await.unwrap();
    }
}
