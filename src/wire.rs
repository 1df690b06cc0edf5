//! Wire-client abstraction: the contract a supplied protocol client fulfills
//!
//! Canopy does not implement the coordination-service wire protocol. It
//! drives a [`WireConn`] supplied by the embedder through a [`WireDialer`],
//! so real, remote, and in-memory transports all sit behind one async
//! trait. The in-memory implementation used by the test suite lives in
//! [`crate::testing`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::Result;

/// Version argument accepted by delete/set-data/set-ACL meaning "any version".
pub const ANY_VERSION: i32 = -1;

/// Permission bits carried by an [`Acl`] entry.
pub mod perms {
    pub const READ: u32 = 1 << 0;
    pub const WRITE: u32 = 1 << 1;
    pub const CREATE: u32 = 1 << 2;
    pub const DELETE: u32 = 1 << 3;
    pub const ADMIN: u32 = 1 << 4;
    pub const ALL: u32 = READ | WRITE | CREATE | DELETE | ADMIN;
}

/// One access-control entry on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acl {
    pub perms: u32,
    pub scheme: String,
    pub id: String,
}

impl Acl {
    pub fn new(perms: u32, scheme: &str, id: &str) -> Self {
        Self {
            perms,
            scheme: scheme.to_string(),
            id: id.to_string(),
        }
    }

    /// The world-readable, world-writable ACL list.
    pub fn open_unsafe() -> Vec<Acl> {
        vec![Acl::new(perms::ALL, "world", "anyone")]
    }

    /// Read-only access for everyone.
    pub fn read_unsafe() -> Vec<Acl> {
        vec![Acl::new(perms::READ, "world", "anyone")]
    }
}

/// How a node is created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateMode {
    /// Survives the creating session.
    #[default]
    Persistent,
    /// Removed when the creating session ends.
    Ephemeral,
    /// Persistent, name suffixed with a server-assigned counter.
    PersistentSequential,
    /// Ephemeral, name suffixed with a server-assigned counter.
    EphemeralSequential,
    /// Persistent parent for ephemeral children; reclaimable when empty.
    Container,
}

impl CreateMode {
    pub fn is_sequential(self) -> bool {
        matches!(self, CreateMode::PersistentSequential | CreateMode::EphemeralSequential)
    }

    pub fn is_ephemeral(self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }
}

/// Node metadata as reported by the service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    pub czxid: i64,
    pub mzxid: i64,
    pub ctime: i64,
    pub mtime: i64,
    pub version: i32,
    pub cversion: i32,
    pub aversion: i32,
    pub ephemeral_owner: i64,
    pub data_length: i32,
    pub num_children: i32,
    pub pzxid: i64,
}

/// What changed at a watched path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeEventKind {
    Created,
    Deleted,
    DataChanged,
    ChildrenChanged,
}

/// A fired one-shot watch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchedEvent {
    pub kind: NodeEventKind,
    pub path: String,
}

/// Raw session-health transitions reported by the wire client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Handshake in progress.
    Connecting,
    /// Session established (first time or after re-handshake).
    Connected,
    /// Transport lost; the session may still be alive server-side.
    Disconnected,
    /// The server declared the session dead; a new identity is required.
    Expired,
    /// Serving from a partitioned read-only member.
    ReadOnly,
}

/// Everything the single low-level watcher funnels back to the framework.
#[derive(Debug, Clone)]
pub enum WireEvent {
    Session(SessionEvent),
    Node(WatchedEvent),
}

/// Authorization credential applied to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthInfo {
    pub scheme: String,
    pub auth: Vec<u8>,
}

impl AuthInfo {
    pub fn new(scheme: &str, auth: impl Into<Vec<u8>>) -> Self {
        Self {
            scheme: scheme.to_string(),
            auth: auth.into(),
        }
    }
}

/// One sub-operation of an atomic multi-op batch.
#[derive(Debug, Clone)]
pub enum MultiOp {
    Create {
        path: String,
        data: Vec<u8>,
        acl: Vec<Acl>,
        mode: CreateMode,
    },
    Delete {
        path: String,
        version: i32,
    },
    SetData {
        path: String,
        data: Vec<u8>,
        version: i32,
    },
    Check {
        path: String,
        version: i32,
    },
}

/// Per-sub-operation result of a committed multi-op batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MultiOpResult {
    Created { path: String },
    Deleted,
    SetData { stat: Stat },
    Checked,
}

/// Options handed to the dialer for every (re)connect.
#[derive(Debug, Clone)]
pub struct DialOptions {
    pub session_timeout: Duration,
    pub connection_timeout: Duration,
    pub read_only: bool,
}

/// A live session plus the event stream funneling its raw events.
pub struct WireSession {
    pub conn: std::sync::Arc<dyn WireConn>,
    pub events: mpsc::UnboundedReceiver<WireEvent>,
}

/// One session to the coordination service.
///
/// Implementations return classified [`CanopyError`](crate::CanopyError)
/// values so the retry loop can distinguish retriable transport failures
/// from terminal answers. The `watch` flags register the session's single
/// low-level watcher for the path, one-shot per registration.
#[async_trait]
pub trait WireConn: Send + Sync {
    async fn create(&self, path: &str, data: &[u8], acl: &[Acl], mode: CreateMode) -> Result<String>;

    async fn delete(&self, path: &str, version: i32) -> Result<()>;

    async fn exists(&self, path: &str, watch: bool) -> Result<Option<Stat>>;

    async fn get_data(&self, path: &str, watch: bool) -> Result<(Vec<u8>, Stat)>;

    async fn set_data(&self, path: &str, data: &[u8], version: i32) -> Result<Stat>;

    async fn get_children(&self, path: &str, watch: bool) -> Result<(Vec<String>, Stat)>;

    async fn get_acl(&self, path: &str) -> Result<(Vec<Acl>, Stat)>;

    async fn set_acl(&self, path: &str, acl: &[Acl], version: i32) -> Result<Stat>;

    /// Flush the leader/follower channel for reads after `path`.
    async fn sync(&self, path: &str) -> Result<()>;

    /// Submit an atomic batch; all applied or none.
    async fn multi(&self, ops: Vec<MultiOp>) -> Result<Vec<MultiOpResult>>;

    async fn add_auth(&self, auth: AuthInfo) -> Result<()>;

    /// Server-assigned session identity.
    fn session_id(&self) -> i64;

    /// Tear down the session. Idempotent.
    async fn close(&self);
}

/// Creates sessions against whatever endpoint set the ensemble currently
/// reports. Supplied by the embedder.
#[async_trait]
pub trait WireDialer: Send + Sync {
    async fn dial(&self, connect_string: &str, options: &DialOptions) -> Result<WireSession>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_mode_flags() {
        assert!(CreateMode::EphemeralSequential.is_sequential());
        assert!(CreateMode::EphemeralSequential.is_ephemeral());
        assert!(CreateMode::PersistentSequential.is_sequential());
        assert!(!CreateMode::PersistentSequential.is_ephemeral());
        assert!(!CreateMode::Persistent.is_sequential());
        assert!(!CreateMode::Container.is_ephemeral());
    }

    #[test]
    fn test_open_acl_grants_all() {
        let acl = Acl::open_unsafe();
        assert_eq!(acl.len(), 1);
        assert_eq!(acl[0].perms, perms::ALL);
        assert_eq!(acl[0].scheme, "world");
    }

    #[test]
    fn test_stat_serde_roundtrip() {
        let stat = Stat {
            czxid: 7,
            mzxid: 9,
            version: 2,
            num_children: 3,
            ..Default::default()
        };
        let json = serde_json::to_string(&stat).expect("serialize");
        let back: Stat = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, stat);
    }
}
