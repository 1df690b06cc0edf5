//! Sync builder
//!
//! A sync flushes the server's replication channel so subsequent reads
//! observe all prior writes. Syncs always execute in the background, even
//! when no background mode is requested; the caller's context is still
//! honored for correlation.

use futures::future::BoxFuture;
use std::any::Any;
use std::sync::Arc;

use crate::error::Result;
use crate::event::{BackgroundContext, CanopyEvent};
use crate::framework::{make_context, spawn_background, View};

/// Builds a sync operation.
pub struct SyncBuilder {
    view: Arc<View>,
    context: Option<BackgroundContext>,
}

impl SyncBuilder {
    pub(crate) fn new(view: Arc<View>) -> Self {
        Self { view, context: None }
    }

    /// Tag the resulting `Synced` event with an opaque correlation value.
    pub fn with_context<T: Any + Send + Sync>(mut self, context: T) -> Self {
        self.context = Some(make_context(context));
        self
    }

    /// Start the sync. Returns immediately; completion is reported as a
    /// `Synced` event through the listener containers.
    pub fn for_path(self, path: &str) -> Result<()> {
        let Self { view, context } = self;
        view.require_started()?;
        let server_path = view.fix_path(path)?;

        let path = path.to_string();
        spawn_background(view.clone(), async move {
            let error = view
                .shared
                .client
                .run_with_retry(move |conn, _attempt| {
                    let server_path = server_path.clone();
                    Box::pin(async move { conn.sync(&server_path).await }) as BoxFuture<'static, Result<()>>
                })
                .await
                .err();
            CanopyEvent::Synced { path, error, context }
        });
        Ok(())
    }
}
