//! Get-children builder

use futures::future::BoxFuture;
use std::any::Any;
use std::sync::Arc;

use crate::error::Result;
use crate::event::CanopyEvent;
use crate::framework::{make_context, spawn_background, View};
use crate::wire::Stat;

use super::InBackground;

/// Builds a child listing, optionally watched.
pub struct GetChildrenBuilder {
    view: Arc<View>,
    watch: bool,
}

impl GetChildrenBuilder {
    pub(crate) fn new(view: Arc<View>) -> Self {
        Self { view, watch: false }
    }

    /// Register the one-shot low-level watch for this path.
    pub fn watched(mut self) -> Self {
        self.watch = true;
        self
    }

    pub fn in_background(self) -> InBackground<Self> {
        InBackground::new(self, None)
    }

    pub fn in_background_with_context<T: Any + Send + Sync>(self, context: T) -> InBackground<Self> {
        InBackground::new(self, Some(make_context(context)))
    }

    /// Returns the node's child names (relative, not full paths).
    pub async fn for_path(self, path: &str) -> Result<Vec<String>> {
        let (children, _stat) = execute_get_children(&self.view, self.watch, path).await?;
        Ok(children)
    }
}

impl InBackground<GetChildrenBuilder> {
    pub fn for_path(self, path: &str) -> Result<()> {
        let InBackground { builder, context } = self;
        builder.view.require_started()?;

        let view = builder.view.clone();
        let path = path.to_string();
        spawn_background(view.clone(), async move {
            let (children, error) = match execute_get_children(&view, builder.watch, &path).await {
                Ok((children, _stat)) => (children, None),
                Err(err) => (Vec::new(), Some(err)),
            };
            CanopyEvent::Children {
                path,
                children,
                error,
                context,
            }
        });
        Ok(())
    }
}

pub(crate) async fn execute_get_children(
    view: &Arc<View>,
    watch: bool,
    path: &str,
) -> Result<(Vec<String>, Stat)> {
    view.require_started()?;
    let server_path = view.fix_path(path)?;

    if watch {
        view.register_watch(&server_path);
    }

    let op_path = server_path.clone();
    let result = view
        .shared
        .client
        .run_with_retry(move |conn, _attempt| {
            let server_path = op_path.clone();
            Box::pin(async move { conn.get_children(&server_path, watch).await })
                as BoxFuture<'static, Result<(Vec<String>, Stat)>>
        })
        .await;

    if result.is_err() && watch {
        view.shared.unregister_watch_route(&server_path);
    }
    result
}
