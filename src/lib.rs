//! Canopy: client framework for tree-structured coordination services
//!
//! # Overview
//!
//! Canopy sits between application code and a raw coordination-service wire
//! client (paths with data and children, ephemeral/sequential nodes,
//! watches, ACLs), adding the machinery applications otherwise rebuild
//! every time:
//!
//! - **Session lifecycle**: one owned connection, re-established
//!   transparently on loss, with logical state notifications
//!   (Connected / Suspended / Reconnected / Lost / ReadOnly)
//! - **Retry policies**: every operation runs under a pluggable
//!   [`RetryPolicy`](canopy_retry::RetryPolicy) from the `canopy-retry` crate
//! - **Operation builders**: fluent create/delete/exists/get/set/children/
//!   ACL/sync/transaction builders with synchronous and background execution
//! - **Namespaces**: per-view path prefixes applied and stripped so
//!   applications never observe them
//! - **Listener fan-out**: ordered, snapshot-iterating containers for
//!   framework events, connection state, and unhandled errors
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            Application                  │
//! └────────────────┬────────────────────────┘
//!                  ▼
//! ┌─────────────────────────────────────────┐
//! │      CanopyClient (façade)              │  ← lifecycle, factories
//! │   namespace views · listenables         │
//! └────────────────┬────────────────────────┘
//!                  ▼
//! ┌─────────────────────────────────────────┐
//! │      Operation builders                 │  ← options, ForPath terminal
//! └────────────────┬────────────────────────┘
//!                  ▼
//! ┌─────────────────────────────────────────┐
//! │      ConnectionClient                   │  ← run_with_retry, re-dial
//! └────────────────┬────────────────────────┘
//!                  ▼
//! ┌─────────────────────────────────────────┐
//! │      WireConn (supplied)                │  ← raw protocol client
//! └─────────────────────────────────────────┘
//!
//!  Raw events flow back:
//!   WireConn → event pump → ConnectionStateManager (bounded queue)
//!                         → event dispatch task → listener containers
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use canopy::{CanopyClient, CanopyConfig, CreateMode};
//! use canopy::testing::MemoryDialer;
//! use canopy_retry::ExponentialBackoffRetry;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> canopy::Result<()> {
//! let config = CanopyConfig::new("10.0.0.5:2181")
//!     .with_namespace("app")
//!     .with_retry_policy(Arc::new(ExponentialBackoffRetry::new(
//!         Duration::from_secs(1),
//!         3,
//!         Duration::from_secs(15),
//!     )));
//!
//! let client = CanopyClient::with_config(config, Arc::new(MemoryDialer::new()))?;
//! client.start()?;
//! client.block_until_connected().await?;
//!
//! let worker = client
//!     .create()
//!     .with_mode(CreateMode::EphemeralSequential)
//!     .for_path_with_data("/workers/member-", b"host-a".to_vec())
//!     .await?;
//! println!("registered as {worker}");
//!
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

pub mod builders;
pub mod client;
pub mod config;
pub mod ensemble;
pub mod error;
pub mod event;
pub mod framework;
pub mod listen;
pub mod namespace;
pub mod providers;
pub mod state;
pub mod testing;
pub mod wire;

// Re-export main types for convenience
pub use builders::{
    CanopyTransaction, CreateBuilder, DeleteBuilder, ExistsBuilder, GetAclBuilder, GetChildrenBuilder,
    GetDataBuilder, InBackground, SetAclBuilder, SetDataBuilder, SyncBuilder, TransactionResult,
};
pub use client::ConnectionClient;
pub use config::CanopyConfig;
pub use ensemble::{EnsembleProvider, FixedEnsembleProvider};
pub use error::{CanopyError, Result};
pub use event::{BackgroundContext, CanopyEvent};
pub use framework::{CanopyClient, FrameworkState};
pub use listen::{
    ConnectionStateListener, EventListener, ListenerContainer, ListenerHandle, UnhandledErrorListener,
};
pub use providers::{AclProvider, CompressionProvider, DefaultAclProvider};
pub use state::{ConnectionState, ConnectionStateManager};
pub use wire::{
    perms, Acl, AuthInfo, CreateMode, DialOptions, MultiOp, MultiOpResult, NodeEventKind, SessionEvent,
    Stat, WatchedEvent, WireConn, WireDialer, WireEvent, WireSession, ANY_VERSION,
};
