//! Delete builder

use futures::future::BoxFuture;
use std::any::Any;
use std::sync::Arc;

use crate::error::{CanopyError, Result};
use crate::event::CanopyEvent;
use crate::framework::{make_context, spawn_background, View};
use crate::wire::{WireConn, ANY_VERSION};

use super::InBackground;

/// Builds a delete operation: version guard and optional recursive
/// child deletion.
pub struct DeleteBuilder {
    view: Arc<View>,
    version: i32,
    delete_children: bool,
}

impl DeleteBuilder {
    pub(crate) fn new(view: Arc<View>) -> Self {
        Self {
            view,
            version: ANY_VERSION,
            delete_children: false,
        }
    }

    /// Require the server's version to match; [`ANY_VERSION`] (the default)
    /// deletes regardless of version.
    pub fn with_version(mut self, version: i32) -> Self {
        self.version = version;
        self
    }

    /// Best-effort recursive deletion of descendants before the target.
    /// Partial failures are reported as an aggregate
    /// [`CanopyError::PartialDelete`] listing the paths that failed.
    pub fn deleting_children_if_needed(mut self) -> Self {
        self.delete_children = true;
        self
    }

    pub fn in_background(self) -> InBackground<Self> {
        InBackground::new(self, None)
    }

    pub fn in_background_with_context<T: Any + Send + Sync>(self, context: T) -> InBackground<Self> {
        InBackground::new(self, Some(make_context(context)))
    }

    pub async fn for_path(self, path: &str) -> Result<()> {
        execute_delete(&self.view, self.version, self.delete_children, path).await
    }
}

impl InBackground<DeleteBuilder> {
    pub fn for_path(self, path: &str) -> Result<()> {
        let InBackground { builder, context } = self;
        builder.view.require_started()?;

        let view = builder.view.clone();
        let path = path.to_string();
        spawn_background(view.clone(), async move {
            let error = execute_delete(&view, builder.version, builder.delete_children, &path)
                .await
                .err();
            CanopyEvent::Deleted { path, error, context }
        });
        Ok(())
    }
}

pub(crate) async fn execute_delete(
    view: &Arc<View>,
    version: i32,
    delete_children: bool,
    path: &str,
) -> Result<()> {
    view.require_started()?;
    let server_path = view.fix_path(path)?;

    view.shared
        .client
        .run_with_retry(move |conn, _attempt| {
            let server_path = server_path.clone();
            Box::pin(async move {
                if delete_children {
                    let failures = delete_descendants(conn.as_ref(), server_path.clone()).await?;
                    if !failures.is_empty() {
                        return Err(CanopyError::PartialDelete { failures });
                    }
                }
                conn.delete(&server_path, version).await
            }) as BoxFuture<'static, Result<()>>
        })
        .await
}

/// Depth-first removal of every descendant of `path`. Nodes that vanish
/// mid-walk are fine; terminal per-node failures are collected, retriable
/// transport failures propagate so the outer retry loop handles them.
fn delete_descendants(conn: &dyn WireConn, path: String) -> BoxFuture<'_, Result<Vec<(String, String)>>> {
    Box::pin(async move {
        let children = match conn.get_children(&path, false).await {
            Ok((children, _stat)) => children,
            Err(CanopyError::NoNode(_)) => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };

        let mut failures = Vec::new();
        for child in children {
            let child_path = if path == "/" {
                format!("/{child}")
            } else {
                format!("{path}/{child}")
            };

            failures.extend(delete_descendants(conn, child_path.clone()).await?);

            match conn.delete(&child_path, ANY_VERSION).await {
                Ok(()) | Err(CanopyError::NoNode(_)) => {}
                Err(err) if err.is_retriable() => return Err(err),
                Err(err) => failures.push((child_path, err.to_string())),
            }
        }
        Ok(failures)
    })
}
