//! Connection ownership and the retry-bounded operation path
//!
//! [`ConnectionClient`] owns the single wire session. It dials through the
//! [`EnsembleProvider`](crate::ensemble::EnsembleProvider), funnels every raw
//! event into the framework's hooks from a pump task, re-establishes the
//! session when it is lost, and exposes [`run_with_retry`], the primitive
//! every operation builder executes through.

use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use canopy_retry::RetryPolicy;

use crate::ensemble::EnsembleProvider;
use crate::error::{CanopyError, Result};
use crate::wire::{AuthInfo, DialOptions, SessionEvent, WatchedEvent, WireConn, WireDialer, WireEvent};

/// Callbacks the framework installs to receive the raw event funnel.
pub(crate) struct EventHooks {
    pub session: Box<dyn Fn(SessionEvent) + Send + Sync>,
    pub node: Box<dyn Fn(WatchedEvent) + Send + Sync>,
}

struct ClientInner {
    dialer: Arc<dyn WireDialer>,
    ensemble: Arc<dyn EnsembleProvider>,
    dial_options: DialOptions,
    auth_infos: Mutex<Vec<AuthInfo>>,
    retry_policy: Arc<dyn RetryPolicy>,
    hooks: EventHooks,
    conn: RwLock<Option<Arc<dyn WireConn>>>,
    started: AtomicBool,
    connecting: AtomicBool,
    generation: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Owns one session to the coordination service and retries operations
/// against it per the active retry policy.
pub struct ConnectionClient {
    inner: Arc<ClientInner>,
}

impl ConnectionClient {
    pub(crate) fn new(
        dialer: Arc<dyn WireDialer>,
        ensemble: Arc<dyn EnsembleProvider>,
        dial_options: DialOptions,
        retry_policy: Arc<dyn RetryPolicy>,
        auth_infos: Vec<AuthInfo>,
        hooks: EventHooks,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                dialer,
                ensemble,
                dial_options,
                auth_infos: Mutex::new(auth_infos),
                retry_policy,
                hooks,
                conn: RwLock::new(None),
                started: AtomicBool::new(false),
                connecting: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Begin connecting in the background. Operations issued before the
    /// handshake completes fail with [`CanopyError::ConnectionLoss`] and are
    /// retried per policy.
    pub fn start(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(CanopyError::Lifecycle("connection client already started".into()));
        }
        spawn_connect_episode(&self.inner);
        Ok(())
    }

    /// Tear down the session and stop background work.
    pub async fn close(&self) {
        self.inner.started.store(false, Ordering::Release);

        let tasks = std::mem::take(&mut *self.inner.tasks.lock().unwrap());
        for task in tasks {
            task.abort();
        }

        let conn = self.inner.conn.write().unwrap().take();
        if let Some(conn) = conn {
            conn.close().await;
        }
    }

    /// True once a session is established and not currently lost.
    pub fn connected(&self) -> bool {
        self.inner.conn.read().unwrap().is_some()
    }

    /// Append an authorization credential; also applied on every reconnect.
    pub async fn add_auth(&self, auth: AuthInfo) -> Result<()> {
        self.inner.auth_infos.lock().unwrap().push(auth.clone());
        let conn = self.current_conn();
        if let Some(conn) = conn {
            conn.add_auth(auth).await?;
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> Arc<dyn RetryPolicy> {
        self.inner.retry_policy.clone()
    }

    pub(crate) fn current_conn(&self) -> Option<Arc<dyn WireConn>> {
        self.inner.conn.read().unwrap().clone()
    }

    /// Run `op` against the live session, retrying retriable failures per
    /// the active policy.
    ///
    /// The closure receives the current connection and the 1-based attempt
    /// number. Terminal errors return immediately; exhausting the policy
    /// wraps the last error in [`CanopyError::RetriesExhausted`].
    pub async fn run_with_retry<T, F>(&self, mut op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnMut(Arc<dyn WireConn>, usize) -> BoxFuture<'static, Result<T>> + Send,
    {
        let started_at = Instant::now();
        let mut attempt = 0usize;

        loop {
            attempt += 1;

            let result = match self.current_conn() {
                Some(conn) => op(conn, attempt).await,
                None => {
                    // No live session; make sure a connect episode is running
                    // and treat this attempt as a connection loss.
                    spawn_connect_episode(&self.inner);
                    Err(CanopyError::ConnectionLoss)
                }
            };

            match result {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retriable() => {
                    match self.inner.retry_policy.allow_retry(attempt, started_at.elapsed()) {
                        Some(sleep) => {
                            debug!(attempt, error = %err, sleep_ms = sleep.as_millis() as u64, "retrying operation");
                            tokio::time::sleep(sleep).await;
                        }
                        None => {
                            return Err(CanopyError::RetriesExhausted {
                                attempts: attempt,
                                source: Box::new(err),
                            });
                        }
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Start a connect episode unless one is already running or the client is
/// stopped. Each episode is bounded by the retry policy; a later trigger
/// (operation failure, session event) starts a fresh episode.
fn spawn_connect_episode(inner: &Arc<ClientInner>) {
    if !inner.started.load(Ordering::Acquire) {
        return;
    }
    if inner.connecting.swap(true, Ordering::AcqRel) {
        return;
    }

    let inner = inner.clone();
    let task_inner = inner.clone();
    let handle = tokio::spawn(async move {
        connect_episode(&task_inner).await;
        task_inner.connecting.store(false, Ordering::Release);
    });
    // Stash the handle so close() can abort a sleeping episode.
    if let Ok(mut tasks) = inner.tasks.lock() {
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    };
}

async fn connect_episode(inner: &Arc<ClientInner>) {
    let started_at = Instant::now();
    let mut attempt = 0usize;

    loop {
        if !inner.started.load(Ordering::Acquire) {
            return;
        }

        (inner.hooks.session)(SessionEvent::Connecting);
        let connect_string = inner.ensemble.connection_string();

        match dial_once(inner, &connect_string).await {
            Ok(()) => {
                info!(%connect_string, "session established");
                return;
            }
            Err(err) => {
                attempt += 1;
                warn!(%connect_string, attempt, error = %err, "connect attempt failed");
                match inner.retry_policy.allow_retry(attempt, started_at.elapsed()) {
                    Some(sleep) => tokio::time::sleep(sleep).await,
                    None => {
                        error!(attempts = attempt, "connect attempts exhausted");
                        return;
                    }
                }
            }
        }
    }
}

async fn dial_once(inner: &Arc<ClientInner>, connect_string: &str) -> Result<()> {
    let session = tokio::time::timeout(
        inner.dial_options.connection_timeout,
        inner.dialer.dial(connect_string, &inner.dial_options),
    )
    .await
    .map_err(|_| CanopyError::OperationTimeout)??;

    let auths = inner.auth_infos.lock().unwrap().clone();
    for auth in auths {
        session.conn.add_auth(auth).await?;
    }

    let generation = inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
    *inner.conn.write().unwrap() = Some(session.conn);

    let pump_inner = inner.clone();
    let handle = tokio::spawn(async move {
        pump_events(pump_inner, session.events, generation).await;
    });
    if let Ok(mut tasks) = inner.tasks.lock() {
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    Ok(())
}

/// Forward raw events into the framework hooks. Never runs listener code:
/// the hooks hand off into bounded queues and return.
async fn pump_events(
    inner: Arc<ClientInner>,
    mut events: tokio::sync::mpsc::UnboundedReceiver<WireEvent>,
    generation: u64,
) {
    let mut saw_terminal = false;

    while let Some(event) = events.recv().await {
        match event {
            WireEvent::Session(session_event) => {
                (inner.hooks.session)(session_event);
                match session_event {
                    SessionEvent::Expired | SessionEvent::Disconnected => {
                        saw_terminal = true;
                        drop_session(&inner, generation);
                        spawn_connect_episode(&inner);
                    }
                    _ => {}
                }
            }
            WireEvent::Node(watched) => (inner.hooks.node)(watched),
        }
    }

    // The event stream closed without a terminal session event: the
    // transport is gone.
    if !saw_terminal && inner.started.load(Ordering::Acquire) && generation == inner.generation.load(Ordering::Acquire) {
        debug!("wire event stream closed, treating as disconnect");
        (inner.hooks.session)(SessionEvent::Disconnected);
        drop_session(&inner, generation);
        spawn_connect_episode(&inner);
    }
}

/// Clear the stored connection if it still belongs to `generation`.
fn drop_session(inner: &Arc<ClientInner>, generation: u64) {
    if generation == inner.generation.load(Ordering::Acquire) {
        *inner.conn.write().unwrap() = None;
    }
}
