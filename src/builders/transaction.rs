//! Transaction builder
//!
//! Accumulates create/delete/set-data/check sub-operations and submits them
//! as one atomic unit. All applied or none; a failed commit reports which
//! sub-operation index caused the abort via
//! [`CanopyError::TransactionAborted`](crate::CanopyError::TransactionAborted).

use futures::future::BoxFuture;
use std::sync::Arc;

use crate::error::Result;
use crate::framework::View;
use crate::wire::{Acl, CreateMode, MultiOp, MultiOpResult, Stat};

enum PendingOp {
    Create {
        path: String,
        data: Vec<u8>,
        acl: Option<Vec<Acl>>,
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

/// Outcome of one sub-operation of a committed transaction. Paths are
/// namespace-stripped, relative to the committing view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionResult {
    Created { path: String },
    Deleted { path: String },
    SetData { path: String, stat: Stat },
    Checked { path: String },
}

/// Accumulates sub-operations for an atomic commit.
pub struct CanopyTransaction {
    view: Arc<View>,
    ops: Vec<PendingOp>,
}

impl CanopyTransaction {
    pub(crate) fn new(view: Arc<View>) -> Self {
        Self { view, ops: Vec::new() }
    }

    pub fn create(mut self, path: &str, data: Vec<u8>, mode: CreateMode) -> Self {
        self.ops.push(PendingOp::Create {
            path: path.to_string(),
            data,
            acl: None,
            mode,
        });
        self
    }

    pub fn create_with_acl(mut self, path: &str, data: Vec<u8>, acl: Vec<Acl>, mode: CreateMode) -> Self {
        self.ops.push(PendingOp::Create {
            path: path.to_string(),
            data,
            acl: Some(acl),
            mode,
        });
        self
    }

    pub fn delete(mut self, path: &str, version: i32) -> Self {
        self.ops.push(PendingOp::Delete {
            path: path.to_string(),
            version,
        });
        self
    }

    pub fn set_data(mut self, path: &str, data: Vec<u8>, version: i32) -> Self {
        self.ops.push(PendingOp::SetData {
            path: path.to_string(),
            data,
            version,
        });
        self
    }

    /// Assert a node exists at `version` without mutating it.
    pub fn check(mut self, path: &str, version: i32) -> Self {
        self.ops.push(PendingOp::Check {
            path: path.to_string(),
            version,
        });
        self
    }

    /// Submit the batch atomically.
    pub async fn commit(self) -> Result<Vec<TransactionResult>> {
        let Self { view, ops } = self;
        view.require_started()?;

        let mut wire_ops = Vec::with_capacity(ops.len());
        let mut client_paths = Vec::with_capacity(ops.len());
        for op in &ops {
            match op {
                PendingOp::Create { path, data, acl, mode } => {
                    let acl = acl
                        .clone()
                        .unwrap_or_else(|| view.shared.acl_provider.acl_for_path(path));
                    wire_ops.push(MultiOp::Create {
                        path: view.fix_path(path)?,
                        data: data.clone(),
                        acl,
                        mode: *mode,
                    });
                    client_paths.push(path.clone());
                }
                PendingOp::Delete { path, version } => {
                    wire_ops.push(MultiOp::Delete {
                        path: view.fix_path(path)?,
                        version: *version,
                    });
                    client_paths.push(path.clone());
                }
                PendingOp::SetData { path, data, version } => {
                    wire_ops.push(MultiOp::SetData {
                        path: view.fix_path(path)?,
                        data: data.clone(),
                        version: *version,
                    });
                    client_paths.push(path.clone());
                }
                PendingOp::Check { path, version } => {
                    wire_ops.push(MultiOp::Check {
                        path: view.fix_path(path)?,
                        version: *version,
                    });
                    client_paths.push(path.clone());
                }
            }
        }

        let namespace_prefix = super::create::namespace_prefix(&view);
        let parent_acl = view.shared.acl_provider.default_acl();
        let results = view
            .shared
            .client
            .run_with_retry(move |conn, _attempt| {
                let wire_ops = wire_ops.clone();
                let namespace_prefix = namespace_prefix.clone();
                let parent_acl = parent_acl.clone();
                Box::pin(async move {
                    if let Some(prefix) = &namespace_prefix {
                        super::create::ensure_path(conn.as_ref(), prefix, &parent_acl).await?;
                    }
                    conn.multi(wire_ops).await
                }) as BoxFuture<'static, Result<Vec<MultiOpResult>>>
            })
            .await?;

        Ok(results
            .into_iter()
            .zip(client_paths)
            .map(|(result, client_path)| match result {
                MultiOpResult::Created { path } => TransactionResult::Created {
                    path: view.unfix_path(&path),
                },
                MultiOpResult::Deleted => TransactionResult::Deleted { path: client_path },
                MultiOpResult::SetData { stat } => TransactionResult::SetData {
                    path: client_path,
                    stat,
                },
                MultiOpResult::Checked => TransactionResult::Checked { path: client_path },
            })
            .collect())
    }
}
