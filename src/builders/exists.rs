//! Exists builder

use futures::future::BoxFuture;
use std::any::Any;
use std::sync::Arc;

use crate::error::Result;
use crate::event::CanopyEvent;
use crate::framework::{make_context, spawn_background, View};
use crate::wire::Stat;

use super::InBackground;

/// Builds an existence check, optionally watched.
pub struct ExistsBuilder {
    view: Arc<View>,
    watch: bool,
}

impl ExistsBuilder {
    pub(crate) fn new(view: Arc<View>) -> Self {
        Self { view, watch: false }
    }

    /// Register the one-shot low-level watch for this path; the next
    /// triggering change arrives as a `Watched` event.
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

    /// Returns the node's stat, or `None` if it does not exist.
    pub async fn for_path(self, path: &str) -> Result<Option<Stat>> {
        execute_exists(&self.view, self.watch, path).await
    }
}

impl InBackground<ExistsBuilder> {
    pub fn for_path(self, path: &str) -> Result<()> {
        let InBackground { builder, context } = self;
        builder.view.require_started()?;

        let view = builder.view.clone();
        let path = path.to_string();
        spawn_background(view.clone(), async move {
            let (stat, error) = match execute_exists(&view, builder.watch, &path).await {
                Ok(stat) => (stat, None),
                Err(err) => (None, Some(err)),
            };
            CanopyEvent::Exists {
                path,
                stat,
                error,
                context,
            }
        });
        Ok(())
    }
}

pub(crate) async fn execute_exists(view: &Arc<View>, watch: bool, path: &str) -> Result<Option<Stat>> {
    view.require_started()?;
    let server_path = view.fix_path(path)?;

    if watch {
        view.register_watch(&server_path);
    }

    let watched_path = server_path.clone();
    let result = view
        .shared
        .client
        .run_with_retry(move |conn, _attempt| {
            let server_path = watched_path.clone();
            Box::pin(async move { conn.exists(&server_path, watch).await })
                as BoxFuture<'static, Result<Option<Stat>>>
        })
        .await;

    if result.is_err() && watch {
        view.shared.unregister_watch_route(&server_path);
    }
    result
}
