//! The framework façade: lifecycle, builder factories, and event routing
//!
//! [`CanopyClient`] is the object applications hold. It composes the
//! connection client, the state manager, the listener containers, and the
//! namespace facade cache, enforces the Latent → Started → Stopped
//! lifecycle, and is the factory for every operation builder.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::builders::{
    CanopyTransaction, CreateBuilder, DeleteBuilder, ExistsBuilder, GetAclBuilder, GetChildrenBuilder,
    GetDataBuilder, SetAclBuilder, SetDataBuilder, SyncBuilder,
};
use crate::client::{ConnectionClient, EventHooks};
use crate::config::CanopyConfig;
use crate::ensemble::FixedEnsembleProvider;
use crate::error::{CanopyError, Result};
use crate::event::{BackgroundContext, CanopyEvent};
use crate::listen::{ConnectionStateListener, EventListener, ListenerContainer, UnhandledErrorListener};
use crate::namespace::{self, NamespaceFacadeCache};
use crate::providers::{AclProvider, CompressionProvider, DefaultAclProvider};
use crate::state::ConnectionStateManager;
use crate::wire::{DialOptions, WatchedEvent, WireDialer};

/// Lifecycle of a [`CanopyClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameworkState {
    /// `start` has not been called yet.
    Latent = 0,
    /// `start` has been called.
    Started = 1,
    /// `close` has been called.
    Stopped = 2,
}

/// Atomic holder for [`FrameworkState`] with compare-and-swap transitions.
struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self {
        Self(AtomicU8::new(FrameworkState::Latent as u8))
    }

    fn change(&self, from: FrameworkState, to: FrameworkState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn value(&self) -> FrameworkState {
        match self.0.load(Ordering::Acquire) {
            0 => FrameworkState::Latent,
            1 => FrameworkState::Started,
            _ => FrameworkState::Stopped,
        }
    }
}

/// State shared by the root client and every namespace facade.
pub(crate) struct Shared {
    pub(crate) client: ConnectionClient,
    pub(crate) state_manager: ConnectionStateManager,
    pub(crate) event_listeners: ListenerContainer<dyn EventListener>,
    pub(crate) unhandled_listeners: ListenerContainer<dyn UnhandledErrorListener>,
    pub(crate) default_data: Vec<u8>,
    pub(crate) compression: Option<Arc<dyn CompressionProvider>>,
    pub(crate) acl_provider: Arc<dyn AclProvider>,
    state: StateCell,
    root_namespace: String,
    facades: NamespaceFacadeCache,
    event_tx: Mutex<Option<UnboundedSender<CanopyEvent>>>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
    /// Server-side path of a registered watch -> namespace of the view that
    /// registered it, so the fired event can be stripped correctly.
    watch_routes: Mutex<HashMap<String, String>>,
    max_close_wait: Duration,
}

impl Shared {
    fn require_started(&self) -> Result<()> {
        match self.state.value() {
            FrameworkState::Started => Ok(()),
            _ => Err(CanopyError::Lifecycle(
                "client must be started before calling this method".into(),
            )),
        }
    }

    /// Queue an event onto the dedicated dispatch path.
    pub(crate) fn post_event(&self, event: CanopyEvent) {
        if let Some(tx) = &*self.event_tx.lock().unwrap() {
            let _ = tx.send(event);
        }
    }

    pub(crate) fn register_watch_route(&self, server_path: &str, namespace: &str) {
        self.watch_routes
            .lock()
            .unwrap()
            .insert(server_path.to_string(), namespace.to_string());
    }

    pub(crate) fn unregister_watch_route(&self, server_path: &str) {
        self.watch_routes.lock().unwrap().remove(server_path);
    }

    /// A one-shot watch fired: strip the registering view's namespace and
    /// hand the event to the dispatch path.
    fn route_watched_event(&self, watched: WatchedEvent) {
        let namespace = self
            .watch_routes
            .lock()
            .unwrap()
            .remove(&watched.path)
            .unwrap_or_else(|| self.root_namespace.clone());

        let stripped = namespace::unfix_for_namespace(&namespace, &watched.path);
        self.post_event(CanopyEvent::Watched(WatchedEvent {
            kind: watched.kind,
            path: stripped,
        }));
    }
}

/// One namespaced view onto the shared framework.
pub(crate) struct View {
    pub(crate) namespace: String,
    pub(crate) shared: Arc<Shared>,
}

impl View {
    pub(crate) fn require_started(&self) -> Result<()> {
        self.shared.require_started()
    }

    pub(crate) fn fix_path(&self, path: &str) -> Result<String> {
        namespace::fix_for_namespace(&self.namespace, path)
    }

    pub(crate) fn unfix_path(&self, path: &str) -> String {
        namespace::unfix_for_namespace(&self.namespace, path)
    }

    pub(crate) fn register_watch(&self, server_path: &str) {
        self.shared.register_watch_route(server_path, &self.namespace);
    }
}

/// Spawn a background operation whose resulting event goes to the
/// dispatch path. Results are delivered at most once per invocation.
pub(crate) fn spawn_background(
    view: Arc<View>,
    work: impl std::future::Future<Output = CanopyEvent> + Send + 'static,
) {
    tokio::spawn(async move {
        let event = work.await;
        view.shared.post_event(event);
    });
}

/// Client framework façade for a tree-structured coordination service.
///
/// Cheap to clone; clones and namespace facades share one underlying
/// session, retry machinery, and listener graph.
///
/// # Example
///
/// ```rust,no_run
/// use canopy::{CanopyClient, CanopyConfig};
/// use canopy::testing::MemoryDialer;
/// use std::sync::Arc;
///
/// # async fn example() -> canopy::Result<()> {
/// let dialer = Arc::new(MemoryDialer::new());
/// let client = CanopyClient::with_config(CanopyConfig::new("memory:2181"), dialer)?;
///
/// client.start()?;
/// client.block_until_connected().await?;
///
/// client.create().for_path_with_data("/service/config", b"v1".to_vec()).await?;
/// let data = client.get_data().for_path("/service/config").await?;
/// assert_eq!(data, b"v1");
///
/// client.close().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct CanopyClient {
    view: Arc<View>,
}

/// Facade identity: two clients compare equal when they are the same view
/// (the facade cache relies on this to hand back the identical instance).
impl PartialEq for CanopyClient {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.view, &other.view)
    }
}

impl Eq for CanopyClient {}

impl std::fmt::Debug for CanopyClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CanopyClient")
            .field("namespace", &self.view.namespace)
            .field("state", &self.state())
            .finish()
    }
}

impl CanopyClient {
    /// Build a client from configuration and a wire dialer.
    pub fn with_config(config: CanopyConfig, dialer: Arc<dyn WireDialer>) -> Result<Self> {
        namespace::validate_namespace(&config.namespace)?;

        let CanopyConfig {
            connect_string,
            ensemble,
            session_timeout,
            connection_timeout,
            max_close_wait,
            namespace: root_namespace,
            default_data,
            retry_policy,
            compression,
            acl_provider,
            can_be_read_only,
            auth_infos,
        } = config;

        let ensemble = ensemble.unwrap_or_else(|| Arc::new(FixedEnsembleProvider::new(&connect_string)));
        let acl_provider = acl_provider.unwrap_or_else(|| Arc::new(DefaultAclProvider));

        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let session_weak = weak.clone();
            let node_weak = weak.clone();
            let hooks = EventHooks {
                session: Box::new(move |event| {
                    if let Some(shared) = session_weak.upgrade() {
                        shared.state_manager.handle_session_event(event);
                    }
                }),
                node: Box::new(move |watched| {
                    if let Some(shared) = node_weak.upgrade() {
                        shared.route_watched_event(watched);
                    }
                }),
            };

            let client = ConnectionClient::new(
                dialer,
                ensemble,
                DialOptions {
                    session_timeout,
                    connection_timeout,
                    read_only: can_be_read_only,
                },
                retry_policy,
                auth_infos,
                hooks,
            );

            Shared {
                client,
                state_manager: ConnectionStateManager::new(),
                event_listeners: ListenerContainer::new(),
                unhandled_listeners: ListenerContainer::new(),
                default_data,
                compression,
                acl_provider,
                state: StateCell::new(),
                root_namespace: root_namespace.clone(),
                facades: NamespaceFacadeCache::new(),
                event_tx: Mutex::new(None),
                dispatch_task: Mutex::new(None),
                watch_routes: Mutex::new(HashMap::new()),
                max_close_wait,
            }
        });

        Ok(Self {
            view: Arc::new(View {
                namespace: root_namespace,
                shared,
            }),
        })
    }

    /// Convenience constructor with default timeouts.
    pub fn new(
        connect_string: &str,
        retry_policy: Arc<dyn canopy_retry::RetryPolicy>,
        dialer: Arc<dyn WireDialer>,
    ) -> Result<Self> {
        Self::with_config(
            CanopyConfig::new(connect_string).with_retry_policy(retry_policy),
            dialer,
        )
    }

    /// Convenience constructor with explicit timeouts.
    pub fn new_timeout(
        connect_string: &str,
        session_timeout: Duration,
        connection_timeout: Duration,
        retry_policy: Arc<dyn canopy_retry::RetryPolicy>,
        dialer: Arc<dyn WireDialer>,
    ) -> Result<Self> {
        let mut config = CanopyConfig::new(connect_string).with_retry_policy(retry_policy);
        config.session_timeout = session_timeout;
        config.connection_timeout = connection_timeout;
        Self::with_config(config, dialer)
    }

    pub(crate) fn facade(shared: Arc<Shared>, namespace: String) -> Self {
        Self {
            view: Arc::new(View { namespace, shared }),
        }
    }

    /// Start the client. Most methods will not work until this is called.
    /// Returns an error if called more than once.
    pub fn start(&self) -> Result<()> {
        let shared = &self.view.shared;
        if !shared.state.change(FrameworkState::Latent, FrameworkState::Started) {
            return Err(CanopyError::Lifecycle("cannot be started more than once".into()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *shared.event_tx.lock().unwrap() = Some(tx);
        let weak = Arc::downgrade(shared);
        *shared.dispatch_task.lock().unwrap() = Some(tokio::spawn(dispatch_loop(rx, weak)));

        shared.state_manager.start();
        shared.client.start()?;

        info!("canopy client started");
        Ok(())
    }

    /// Stop the client. Safe to call more than once; the second call is a
    /// no-op. Teardown errors from the state manager are logged, never
    /// escalated, so resources are always released.
    pub async fn close(&self) -> Result<()> {
        let shared = &self.view.shared;
        if !shared.state.change(FrameworkState::Started, FrameworkState::Stopped) {
            return Ok(());
        }

        // Tell listeners we are going away before the containers drain.
        let closing = CanopyEvent::Closing;
        shared.event_listeners.for_each(|listener| {
            if let Err(err) = listener.event_received(&closing) {
                shared.unhandled_listeners.for_each(|u| u.unhandled_error(&err));
            }
        });

        shared.event_listeners.clear();
        shared.unhandled_listeners.clear();
        shared.state_manager.listenable().clear();

        if let Err(err) = shared.state_manager.close().await {
            error!(error = %err, "state manager teardown failed");
        }
        shared.client.close().await;

        let tx = shared.event_tx.lock().unwrap().take();
        drop(tx);
        let dispatch = shared.dispatch_task.lock().unwrap().take();
        if let Some(dispatch) = dispatch {
            if tokio::time::timeout(shared.max_close_wait, dispatch).await.is_err() {
                warn!("event dispatch did not drain within max_close_wait");
            }
        }

        shared.facades.clear();
        info!("canopy client closed");
        Ok(())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> FrameworkState {
        self.view.shared.state.value()
    }

    /// True if the client is started and not closed.
    pub fn started(&self) -> bool {
        self.state() == FrameworkState::Started
    }

    // --- builder factories -------------------------------------------------

    pub fn create(&self) -> CreateBuilder {
        CreateBuilder::new(self.view.clone())
    }

    pub fn delete(&self) -> DeleteBuilder {
        DeleteBuilder::new(self.view.clone())
    }

    pub fn check_exists(&self) -> ExistsBuilder {
        ExistsBuilder::new(self.view.clone())
    }

    pub fn get_data(&self) -> GetDataBuilder {
        GetDataBuilder::new(self.view.clone())
    }

    pub fn set_data(&self) -> SetDataBuilder {
        SetDataBuilder::new(self.view.clone())
    }

    pub fn get_children(&self) -> GetChildrenBuilder {
        GetChildrenBuilder::new(self.view.clone())
    }

    pub fn get_acl(&self) -> GetAclBuilder {
        GetAclBuilder::new(self.view.clone())
    }

    pub fn set_acl(&self) -> SetAclBuilder {
        SetAclBuilder::new(self.view.clone())
    }

    pub fn in_transaction(&self) -> CanopyTransaction {
        CanopyTransaction::new(self.view.clone())
    }

    /// Start a sync builder. Syncs always execute in the background, even
    /// without an explicit background selection.
    pub fn sync(&self) -> SyncBuilder {
        SyncBuilder::new(self.view.clone())
    }

    /// Perform a background sync on `path`, tagging the resulting event
    /// with `context`.
    pub fn do_sync<T: std::any::Any + Send + Sync>(&self, path: &str, context: T) -> Result<()> {
        self.sync().with_context(context).for_path(path)
    }

    // --- listenables -------------------------------------------------------

    /// Registry for framework events (background results, watches, closing).
    pub fn listenable(&self) -> &ListenerContainer<dyn EventListener> {
        &self.view.shared.event_listeners
    }

    /// Registry for connection-state transitions.
    pub fn connection_state_listenable(&self) -> &ListenerContainer<dyn ConnectionStateListener> {
        self.view.shared.state_manager.listenable()
    }

    /// Registry for errors raised inside other listeners.
    pub fn unhandled_error_listenable(&self) -> &ListenerContainer<dyn UnhandledErrorListener> {
        &self.view.shared.unhandled_listeners
    }

    // --- namespaces --------------------------------------------------------

    /// The namespace of this view, or `""` for the root view.
    pub fn namespace(&self) -> &str {
        &self.view.namespace
    }

    /// A facade of this client under `namespace` (or the non-namespaced
    /// view when empty). Repeated calls with the same namespace return the
    /// identical facade instance.
    pub fn using_namespace(&self, namespace: &str) -> Result<CanopyClient> {
        self.view.shared.require_started()?;
        namespace::validate_namespace(namespace)?;
        Ok(self.view.shared.facades.get(&self.view.shared, namespace))
    }

    /// A facade that applies no namespace prefix at all.
    pub fn non_namespace_view(&self) -> Result<CanopyClient> {
        self.using_namespace("")
    }

    // --- connection --------------------------------------------------------

    /// The managed connection client.
    pub fn connection_client(&self) -> &ConnectionClient {
        &self.view.shared.client
    }

    /// The connection-state manager (current state, missed-state count).
    pub fn state_manager(&self) -> &ConnectionStateManager {
        &self.view.shared.state_manager
    }

    /// Block until a connection to the service is available.
    pub async fn block_until_connected(&self) -> Result<()> {
        self.view.shared.state_manager.block_until_connected(None).await
    }

    /// Block until connected or `max_wait` elapses. A zero duration waits
    /// indefinitely.
    pub async fn block_until_connected_timeout(&self, max_wait: Duration) -> Result<()> {
        self.view.shared.state_manager.block_until_connected(Some(max_wait)).await
    }
}

async fn dispatch_loop(mut rx: UnboundedReceiver<CanopyEvent>, shared: Weak<Shared>) {
    while let Some(event) = rx.recv().await {
        let Some(shared) = shared.upgrade() else { break };
        debug!(kind = event.kind(), path = event.path().unwrap_or(""), "dispatching event");
        shared.event_listeners.for_each(|listener| {
            if let Err(err) = listener.event_received(&event) {
                warn!(error = %err, "listener failed, routing to unhandled-error listeners");
                shared.unhandled_listeners.for_each(|u| u.unhandled_error(&err));
            }
        });
    }
}

/// Opaque-context helper shared by the background terminals.
pub(crate) fn make_context<T: std::any::Any + Send + Sync>(value: T) -> BackgroundContext {
    BackgroundContext::new(value)
}
