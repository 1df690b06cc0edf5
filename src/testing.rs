//! In-memory wire client for tests
//!
//! [`MemoryDialer`] stands in for a real protocol client: one process-local
//! tree with versions, sequential counters, ephemeral ownership, and
//! one-shot watches, plus fault-injection handles (refuse connects, fail
//! operations, drop connections, expire sessions) so connection-management
//! behavior can be exercised without a running service.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc::{self, UnboundedSender};

use crate::error::{CanopyError, Result};
use crate::wire::{
    Acl, AuthInfo, CreateMode, DialOptions, MultiOp, MultiOpResult, NodeEventKind, SessionEvent, Stat,
    WatchedEvent, WireConn, WireDialer, WireEvent, WireSession, ANY_VERSION,
};

#[derive(Debug, Clone)]
struct Node {
    data: Vec<u8>,
    acl: Vec<Acl>,
    mode: CreateMode,
    owner: i64,
    czxid: i64,
    mzxid: i64,
    ctime: i64,
    mtime: i64,
    version: i32,
    cversion: i32,
    aversion: i32,
    next_sequence: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionStatus {
    Alive,
    Disconnected,
    Expired,
    Closed,
}

struct Session {
    status: SessionStatus,
    events: UnboundedSender<WireEvent>,
}

struct FaultPlan {
    remaining: usize,
    error: CanopyError,
    /// Apply the operation's effect before reporting the error, modelling a
    /// write that landed server-side before the transport failure was
    /// observed.
    apply_first: bool,
}

#[derive(Default)]
struct ServerState {
    nodes: HashMap<String, Node>,
    sessions: HashMap<i64, Session>,
    data_watches: HashMap<String, Vec<i64>>,
    exist_watches: HashMap<String, Vec<i64>>,
    child_watches: HashMap<String, Vec<i64>>,
    next_zxid: i64,
    unreachable: bool,
    fault: Option<FaultPlan>,
    dial_count: usize,
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn parent_of(path: &str) -> Option<String> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/".to_string()),
        Some(idx) => Some(path[..idx].to_string()),
        None => None,
    }
}

impl ServerState {
    fn new() -> Self {
        let mut state = Self::default();
        state.nodes.insert(
            "/".to_string(),
            Node {
                data: Vec::new(),
                acl: Acl::open_unsafe(),
                mode: CreateMode::Persistent,
                owner: 0,
                czxid: 0,
                mzxid: 0,
                ctime: now_millis(),
                mtime: now_millis(),
                version: 0,
                cversion: 0,
                aversion: 0,
                next_sequence: 0,
            },
        );
        state.next_zxid = 1;
        state
    }

    fn stat_of(&self, path: &str) -> Option<Stat> {
        let node = self.nodes.get(path)?;
        Some(Stat {
            czxid: node.czxid,
            mzxid: node.mzxid,
            ctime: node.ctime,
            mtime: node.mtime,
            version: node.version,
            cversion: node.cversion,
            aversion: node.aversion,
            ephemeral_owner: if node.mode.is_ephemeral() { node.owner } else { 0 },
            data_length: node.data.len() as i32,
            num_children: self.children_of(path).len() as i32,
            pzxid: node.czxid,
        })
    }

    fn children_of(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" { "/".to_string() } else { format!("{path}/") };
        let mut children: Vec<String> = self
            .nodes
            .keys()
            .filter_map(|key| {
                let rest = key.strip_prefix(&prefix)?;
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect();
        children.sort();
        children
    }

    /// Pop the watchers registered for `path` in `kind`, producing the
    /// deliveries to make once the lock is released.
    fn fire(&mut self, registry: WatchKind, path: &str, event: NodeEventKind) -> Vec<(i64, WatchedEvent)> {
        let map = match registry {
            WatchKind::Data => &mut self.data_watches,
            WatchKind::Exist => &mut self.exist_watches,
            WatchKind::Child => &mut self.child_watches,
        };
        map.remove(path)
            .unwrap_or_default()
            .into_iter()
            .map(|session| {
                (
                    session,
                    WatchedEvent {
                        kind: event,
                        path: path.to_string(),
                    },
                )
            })
            .collect()
    }

    fn apply_create(
        &mut self,
        session_id: i64,
        path: &str,
        data: &[u8],
        acl: &[Acl],
        mode: CreateMode,
    ) -> Result<(String, Vec<(i64, WatchedEvent)>)> {
        let parent = parent_of(path).ok_or_else(|| CanopyError::NoNode(path.to_string()))?;
        if !self.nodes.contains_key(&parent) {
            return Err(CanopyError::NoNode(parent));
        }

        let actual_path = if mode.is_sequential() {
            let parent_node = self.nodes.get_mut(&parent).expect("parent checked above");
            let seq = parent_node.next_sequence;
            parent_node.next_sequence += 1;
            format!("{path}{seq:010}")
        } else {
            path.to_string()
        };

        if self.nodes.contains_key(&actual_path) {
            return Err(CanopyError::NodeExists(actual_path));
        }

        let zxid = self.next_zxid;
        self.next_zxid += 1;
        let now = now_millis();
        self.nodes.insert(
            actual_path.clone(),
            Node {
                data: data.to_vec(),
                acl: acl.to_vec(),
                mode,
                owner: if mode.is_ephemeral() { session_id } else { 0 },
                czxid: zxid,
                mzxid: zxid,
                ctime: now,
                mtime: now,
                version: 0,
                cversion: 0,
                aversion: 0,
                next_sequence: 0,
            },
        );
        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            parent_node.cversion += 1;
        }

        let mut fired = self.fire(WatchKind::Exist, &actual_path, NodeEventKind::Created);
        fired.extend(self.fire(WatchKind::Child, &parent, NodeEventKind::ChildrenChanged));
        Ok((actual_path, fired))
    }

    fn apply_delete(&mut self, path: &str, version: i32) -> Result<Vec<(i64, WatchedEvent)>> {
        let node = self.nodes.get(path).ok_or_else(|| CanopyError::NoNode(path.to_string()))?;
        if version != ANY_VERSION && node.version != version {
            return Err(CanopyError::BadVersion(path.to_string()));
        }
        if !self.children_of(path).is_empty() {
            return Err(CanopyError::NotEmpty(path.to_string()));
        }

        self.nodes.remove(path);
        self.next_zxid += 1;

        let mut fired = self.fire(WatchKind::Data, path, NodeEventKind::Deleted);
        fired.extend(self.fire(WatchKind::Child, path, NodeEventKind::Deleted));
        if let Some(parent) = parent_of(path) {
            if let Some(parent_node) = self.nodes.get_mut(&parent) {
                parent_node.cversion += 1;
            }
            fired.extend(self.fire(WatchKind::Child, &parent, NodeEventKind::ChildrenChanged));
        }
        Ok(fired)
    }

    fn apply_set_data(&mut self, path: &str, data: &[u8], version: i32) -> Result<(Stat, Vec<(i64, WatchedEvent)>)> {
        let zxid = self.next_zxid;
        {
            let node = self.nodes.get_mut(path).ok_or_else(|| CanopyError::NoNode(path.to_string()))?;
            if version != ANY_VERSION && node.version != version {
                return Err(CanopyError::BadVersion(path.to_string()));
            }
            node.data = data.to_vec();
            node.version += 1;
            node.mzxid = zxid;
            node.mtime = now_millis();
        }
        self.next_zxid += 1;

        let fired = self.fire(WatchKind::Data, path, NodeEventKind::DataChanged);
        let stat = self.stat_of(path).expect("node updated above");
        Ok((stat, fired))
    }

    /// Remove a dead session's ephemeral nodes, firing their watches.
    fn reap_ephemerals(&mut self, session_id: i64) -> Vec<(i64, WatchedEvent)> {
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.mode.is_ephemeral() && node.owner == session_id)
            .map(|(path, _)| path.clone())
            .collect();

        let mut fired = Vec::new();
        for path in owned {
            if let Ok(events) = self.apply_delete(&path, ANY_VERSION) {
                fired.extend(events);
            }
        }
        fired
    }
}

#[derive(Clone, Copy)]
enum WatchKind {
    Data,
    Exist,
    Child,
}

struct MemoryServer {
    state: Mutex<ServerState>,
    next_session: AtomicI64,
}

impl MemoryServer {
    fn new() -> Self {
        Self {
            state: Mutex::new(ServerState::new()),
            next_session: AtomicI64::new(1),
        }
    }

    /// Deliver fired watches to their sessions, outside the state lock.
    fn deliver(&self, fired: Vec<(i64, WatchedEvent)>) {
        let state = self.state.lock().unwrap();
        for (session_id, event) in fired {
            if let Some(session) = state.sessions.get(&session_id) {
                if session.status == SessionStatus::Alive {
                    let _ = session.events.send(WireEvent::Node(event));
                }
            }
        }
    }
}

/// Dials sessions against a process-local in-memory tree, with handles for
/// injecting connection and operation failures.
#[derive(Clone)]
pub struct MemoryDialer {
    server: Arc<MemoryServer>,
}

impl MemoryDialer {
    pub fn new() -> Self {
        Self {
            server: Arc::new(MemoryServer::new()),
        }
    }

    /// Refuse dials while set; existing sessions are unaffected.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.server.state.lock().unwrap().unreachable = unreachable;
    }

    /// Fail the next `n` operations with clones of `error`.
    pub fn fail_ops(&self, n: usize, error: CanopyError) {
        self.server.state.lock().unwrap().fault = Some(FaultPlan {
            remaining: n,
            error,
            apply_first: false,
        });
    }

    /// Fail the next `n` operations with clones of `error`, but apply each
    /// operation's effect first. Models a write that landed before the
    /// transport error was observed.
    pub fn fail_ops_after_apply(&self, n: usize, error: CanopyError) {
        self.server.state.lock().unwrap().fault = Some(FaultPlan {
            remaining: n,
            error,
            apply_first: true,
        });
    }

    /// Drop the transport of every live session. The sessions stay alive
    /// server-side; clients observe a disconnect and must re-dial.
    pub fn drop_connections(&self) {
        let mut state = self.server.state.lock().unwrap();
        for session in state.sessions.values_mut() {
            if session.status == SessionStatus::Alive {
                session.status = SessionStatus::Disconnected;
                let _ = session.events.send(WireEvent::Session(SessionEvent::Disconnected));
            }
        }
    }

    /// Expire every live session, reaping its ephemeral nodes.
    pub fn expire_sessions(&self) {
        let fired = {
            let mut state = self.server.state.lock().unwrap();
            let live: Vec<i64> = state
                .sessions
                .iter()
                .filter(|(_, s)| s.status == SessionStatus::Alive)
                .map(|(id, _)| *id)
                .collect();

            let mut fired = Vec::new();
            for id in live {
                if let Some(session) = state.sessions.get_mut(&id) {
                    session.status = SessionStatus::Expired;
                    let _ = session.events.send(WireEvent::Session(SessionEvent::Expired));
                }
                fired.extend(state.reap_ephemerals(id));
            }
            fired
        };
        self.server.deliver(fired);
    }

    /// Server-side inspection: does `path` exist in the raw tree?
    pub fn node_exists(&self, path: &str) -> bool {
        self.server.state.lock().unwrap().nodes.contains_key(path)
    }

    /// Server-side inspection: raw data stored at `path`.
    pub fn node_data(&self, path: &str) -> Option<Vec<u8>> {
        self.server.state.lock().unwrap().nodes.get(path).map(|n| n.data.clone())
    }

    /// Server-side inspection: raw children of `path`.
    pub fn node_children(&self, path: &str) -> Vec<String> {
        self.server.state.lock().unwrap().children_of(path)
    }

    /// Number of successful dials so far.
    pub fn dial_count(&self) -> usize {
        self.server.state.lock().unwrap().dial_count
    }
}

impl Default for MemoryDialer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WireDialer for MemoryDialer {
    async fn dial(&self, _connect_string: &str, _options: &DialOptions) -> Result<WireSession> {
        let (tx, rx) = mpsc::unbounded_channel();
        let session_id = {
            let mut state = self.server.state.lock().unwrap();
            if state.unreachable {
                return Err(CanopyError::ConnectionLoss);
            }
            let session_id = self.server.next_session.fetch_add(1, Ordering::Relaxed);
            state.sessions.insert(
                session_id,
                Session {
                    status: SessionStatus::Alive,
                    events: tx.clone(),
                },
            );
            state.dial_count += 1;
            session_id
        };

        let _ = tx.send(WireEvent::Session(SessionEvent::Connected));

        Ok(WireSession {
            conn: Arc::new(MemoryConn {
                server: self.server.clone(),
                session_id,
            }),
            events: rx,
        })
    }
}

struct MemoryConn {
    server: Arc<MemoryServer>,
    session_id: i64,
}

/// Outcome of the per-operation session and fault-injection gate.
enum Gate {
    Pass,
    Fail(CanopyError),
    /// Apply the operation's effect, then report the error anyway.
    ApplyThenFail(CanopyError),
}

impl Gate {
    /// For read operations, apply-then-fail collapses into a plain failure.
    fn deny(self) -> Option<CanopyError> {
        match self {
            Gate::Pass => None,
            Gate::Fail(err) | Gate::ApplyThenFail(err) => Some(err),
        }
    }
}

impl MemoryConn {
    fn gate(&self, state: &mut ServerState) -> Gate {
        match state.sessions.get(&self.session_id).map(|s| s.status) {
            Some(SessionStatus::Alive) => {}
            Some(SessionStatus::Expired) => return Gate::Fail(CanopyError::SessionExpired),
            _ => return Gate::Fail(CanopyError::ConnectionLoss),
        }

        if let Some(fault) = &mut state.fault {
            if fault.remaining > 0 {
                fault.remaining -= 1;
                let error = fault.error.clone();
                let apply_first = fault.apply_first;
                if fault.remaining == 0 {
                    state.fault = None;
                }
                return if apply_first {
                    Gate::ApplyThenFail(error)
                } else {
                    Gate::Fail(error)
                };
            }
        }
        Gate::Pass
    }
}

#[async_trait]
impl WireConn for MemoryConn {
    async fn create(&self, path: &str, data: &[u8], acl: &[Acl], mode: CreateMode) -> Result<String> {
        let (outcome, fired) = {
            let mut state = self.server.state.lock().unwrap();
            match self.gate(&mut state) {
                Gate::Pass => match state.apply_create(self.session_id, path, data, acl, mode) {
                    Ok((created, fired)) => (Ok(created), fired),
                    Err(err) => (Err(err), Vec::new()),
                },
                Gate::ApplyThenFail(err) => {
                    let fired = state
                        .apply_create(self.session_id, path, data, acl, mode)
                        .map(|(_, fired)| fired)
                        .unwrap_or_default();
                    (Err(err), fired)
                }
                Gate::Fail(err) => (Err(err), Vec::new()),
            }
        };
        self.server.deliver(fired);
        outcome
    }

    async fn delete(&self, path: &str, version: i32) -> Result<()> {
        let (outcome, fired) = {
            let mut state = self.server.state.lock().unwrap();
            match self.gate(&mut state) {
                Gate::Pass => match state.apply_delete(path, version) {
                    Ok(fired) => (Ok(()), fired),
                    Err(err) => (Err(err), Vec::new()),
                },
                Gate::ApplyThenFail(err) => {
                    let fired = state.apply_delete(path, version).unwrap_or_default();
                    (Err(err), fired)
                }
                Gate::Fail(err) => (Err(err), Vec::new()),
            }
        };
        self.server.deliver(fired);
        outcome
    }

    async fn exists(&self, path: &str, watch: bool) -> Result<Option<Stat>> {
        let mut state = self.server.state.lock().unwrap();
        if let Some(err) = self.gate(&mut state).deny() {
            return Err(err);
        }

        let stat = state.stat_of(path);
        if watch {
            let registry = if stat.is_some() {
                &mut state.data_watches
            } else {
                &mut state.exist_watches
            };
            registry.entry(path.to_string()).or_default().push(self.session_id);
        }
        Ok(stat)
    }

    async fn get_data(&self, path: &str, watch: bool) -> Result<(Vec<u8>, Stat)> {
        let mut state = self.server.state.lock().unwrap();
        if let Some(err) = self.gate(&mut state).deny() {
            return Err(err);
        }

        let data = state
            .nodes
            .get(path)
            .map(|n| n.data.clone())
            .ok_or_else(|| CanopyError::NoNode(path.to_string()))?;
        if watch {
            state.data_watches.entry(path.to_string()).or_default().push(self.session_id);
        }
        let stat = state.stat_of(path).expect("node present");
        Ok((data, stat))
    }

    async fn set_data(&self, path: &str, data: &[u8], version: i32) -> Result<Stat> {
        let (outcome, fired) = {
            let mut state = self.server.state.lock().unwrap();
            match self.gate(&mut state) {
                Gate::Pass => match state.apply_set_data(path, data, version) {
                    Ok((stat, fired)) => (Ok(stat), fired),
                    Err(err) => (Err(err), Vec::new()),
                },
                Gate::ApplyThenFail(err) => {
                    let fired = state
                        .apply_set_data(path, data, version)
                        .map(|(_, fired)| fired)
                        .unwrap_or_default();
                    (Err(err), fired)
                }
                Gate::Fail(err) => (Err(err), Vec::new()),
            }
        };
        self.server.deliver(fired);
        outcome
    }

    async fn get_children(&self, path: &str, watch: bool) -> Result<(Vec<String>, Stat)> {
        let mut state = self.server.state.lock().unwrap();
        if let Some(err) = self.gate(&mut state).deny() {
            return Err(err);
        }

        if !state.nodes.contains_key(path) {
            return Err(CanopyError::NoNode(path.to_string()));
        }
        if watch {
            state.child_watches.entry(path.to_string()).or_default().push(self.session_id);
        }
        let children = state.children_of(path);
        let stat = state.stat_of(path).expect("node present");
        Ok((children, stat))
    }

    async fn get_acl(&self, path: &str) -> Result<(Vec<Acl>, Stat)> {
        let mut state = self.server.state.lock().unwrap();
        if let Some(err) = self.gate(&mut state).deny() {
            return Err(err);
        }

        let acl = state
            .nodes
            .get(path)
            .map(|n| n.acl.clone())
            .ok_or_else(|| CanopyError::NoNode(path.to_string()))?;
        let stat = state.stat_of(path).expect("node present");
        Ok((acl, stat))
    }

    async fn set_acl(&self, path: &str, acl: &[Acl], version: i32) -> Result<Stat> {
        let mut state = self.server.state.lock().unwrap();
        if let Some(err) = self.gate(&mut state).deny() {
            return Err(err);
        }

        {
            let node = state.nodes.get_mut(path).ok_or_else(|| CanopyError::NoNode(path.to_string()))?;
            if version != ANY_VERSION && node.aversion != version {
                return Err(CanopyError::BadVersion(path.to_string()));
            }
            node.acl = acl.to_vec();
            node.aversion += 1;
        }
        let stat = state.stat_of(path).expect("node present");
        Ok(stat)
    }

    async fn sync(&self, _path: &str) -> Result<()> {
        // Syncing a missing path is legal; only the channel is flushed.
        let mut state = self.server.state.lock().unwrap();
        match self.gate(&mut state).deny() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn multi(&self, ops: Vec<MultiOp>) -> Result<Vec<MultiOpResult>> {
        let (outcome, fired) = {
            let mut state = self.server.state.lock().unwrap();
            if let Some(err) = self.gate(&mut state).deny() {
                return Err(err);
            }

            // Validate against a scratch copy so a mid-batch failure leaves
            // the real tree untouched.
            let mut scratch = ServerState {
                nodes: state.nodes.clone(),
                next_zxid: state.next_zxid,
                ..Default::default()
            };
            for (index, op) in ops.iter().enumerate() {
                let check: Result<()> = match op {
                    MultiOp::Create { path, data, acl, mode } => scratch
                        .apply_create(self.session_id, path, data, acl, *mode)
                        .map(|_| ()),
                    MultiOp::Delete { path, version } => scratch.apply_delete(path, *version).map(|_| ()),
                    MultiOp::SetData { path, data, version } => {
                        scratch.apply_set_data(path, data, *version).map(|_| ())
                    }
                    MultiOp::Check { path, version } => match scratch.nodes.get(path.as_str()) {
                        None => Err(CanopyError::NoNode(path.clone())),
                        Some(node) if *version != ANY_VERSION && node.version != *version => {
                            Err(CanopyError::BadVersion(path.clone()))
                        }
                        Some(_) => Ok(()),
                    },
                };
                if let Err(cause) = check {
                    return Err(CanopyError::TransactionAborted {
                        index,
                        source: Box::new(cause),
                    });
                }
            }

            // The batch is valid; apply for real, collecting watch fires.
            let mut results = Vec::with_capacity(ops.len());
            let mut fired = Vec::new();
            for op in &ops {
                match op {
                    MultiOp::Create { path, data, acl, mode } => {
                        let (created, events) = state
                            .apply_create(self.session_id, path, data, acl, *mode)
                            .expect("validated above");
                        fired.extend(events);
                        results.push(MultiOpResult::Created { path: created });
                    }
                    MultiOp::Delete { path, version } => {
                        fired.extend(state.apply_delete(path, *version).expect("validated above"));
                        results.push(MultiOpResult::Deleted);
                    }
                    MultiOp::SetData { path, data, version } => {
                        let (stat, events) =
                            state.apply_set_data(path, data, *version).expect("validated above");
                        fired.extend(events);
                        results.push(MultiOpResult::SetData { stat });
                    }
                    MultiOp::Check { .. } => results.push(MultiOpResult::Checked),
                }
            }
            (Ok(results), fired)
        };
        self.server.deliver(fired);
        outcome
    }

    async fn add_auth(&self, _auth: AuthInfo) -> Result<()> {
        Ok(())
    }

    fn session_id(&self) -> i64 {
        self.session_id
    }

    async fn close(&self) {
        let fired = {
            let mut state = self.server.state.lock().unwrap();
            if let Some(session) = state.sessions.get_mut(&self.session_id) {
                session.status = SessionStatus::Closed;
            }
            state.reap_ephemerals(self.session_id)
        };
        self.server.deliver(fired);
    }
}
