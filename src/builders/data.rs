//! Get-data and set-data builders

use futures::future::BoxFuture;
use std::any::Any;
use std::sync::Arc;

use crate::error::{CanopyError, Result};
use crate::event::CanopyEvent;
use crate::framework::{make_context, spawn_background, View};
use crate::wire::{Stat, ANY_VERSION};

use super::InBackground;

/// Builds a data read, optionally watched and/or decompressed.
pub struct GetDataBuilder {
    view: Arc<View>,
    watch: bool,
    decompress: bool,
}

impl GetDataBuilder {
    pub(crate) fn new(view: Arc<View>) -> Self {
        Self {
            view,
            watch: false,
            decompress: false,
        }
    }

    /// Register the one-shot low-level watch for this path.
    pub fn watched(mut self) -> Self {
        self.watch = true;
        self
    }

    /// Decompress the payload through the configured provider.
    pub fn decompressed(mut self) -> Self {
        self.decompress = true;
        self
    }

    pub fn in_background(self) -> InBackground<Self> {
        InBackground::new(self, None)
    }

    pub fn in_background_with_context<T: Any + Send + Sync>(self, context: T) -> InBackground<Self> {
        InBackground::new(self, Some(make_context(context)))
    }

    pub async fn for_path(self, path: &str) -> Result<Vec<u8>> {
        let (data, _stat) = execute_get_data(&self.view, self.watch, self.decompress, path).await?;
        Ok(data)
    }

    /// Like `for_path`, also returning the node's stat.
    pub async fn for_path_with_stat(self, path: &str) -> Result<(Vec<u8>, Stat)> {
        execute_get_data(&self.view, self.watch, self.decompress, path).await
    }
}

impl InBackground<GetDataBuilder> {
    pub fn for_path(self, path: &str) -> Result<()> {
        let InBackground { builder, context } = self;
        builder.view.require_started()?;

        let view = builder.view.clone();
        let path = path.to_string();
        spawn_background(view.clone(), async move {
            let (data, stat, error) = match execute_get_data(&view, builder.watch, builder.decompress, &path).await
            {
                Ok((data, stat)) => (Some(data), Some(stat), None),
                Err(err) => (None, None, Some(err)),
            };
            CanopyEvent::GetData {
                path,
                data,
                stat,
                error,
                context,
            }
        });
        Ok(())
    }
}

pub(crate) async fn execute_get_data(
    view: &Arc<View>,
    watch: bool,
    decompress: bool,
    path: &str,
) -> Result<(Vec<u8>, Stat)> {
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
            Box::pin(async move { conn.get_data(&server_path, watch).await })
                as BoxFuture<'static, Result<(Vec<u8>, Stat)>>
        })
        .await;

    if result.is_err() && watch {
        view.shared.unregister_watch_route(&server_path);
    }
    let (data, stat) = result?;

    let data = if decompress {
        match &view.shared.compression {
            Some(provider) => provider.decompress(path, &data)?,
            None => return Err(CanopyError::Wire("no compression provider configured".into())),
        }
    } else {
        data
    };

    Ok((data, stat))
}

/// Builds a data write with a version guard.
pub struct SetDataBuilder {
    view: Arc<View>,
    version: i32,
    compress: bool,
}

impl SetDataBuilder {
    pub(crate) fn new(view: Arc<View>) -> Self {
        Self {
            view,
            version: ANY_VERSION,
            compress: false,
        }
    }

    /// Require the server's version to match; [`ANY_VERSION`] (the default)
    /// writes regardless of version.
    pub fn with_version(mut self, version: i32) -> Self {
        self.version = version;
        self
    }

    /// Compress the payload through the configured provider.
    pub fn compressed(mut self) -> Self {
        self.compress = true;
        self
    }

    pub fn in_background(self) -> InBackground<Self> {
        InBackground::new(self, None)
    }

    pub fn in_background_with_context<T: Any + Send + Sync>(self, context: T) -> InBackground<Self> {
        InBackground::new(self, Some(make_context(context)))
    }

    pub async fn for_path(self, path: &str, data: Vec<u8>) -> Result<Stat> {
        execute_set_data(&self.view, self.version, self.compress, path, data).await
    }
}

impl InBackground<SetDataBuilder> {
    pub fn for_path(self, path: &str, data: Vec<u8>) -> Result<()> {
        let InBackground { builder, context } = self;
        builder.view.require_started()?;

        let view = builder.view.clone();
        let path = path.to_string();
        spawn_background(view.clone(), async move {
            let (stat, error) = match execute_set_data(&view, builder.version, builder.compress, &path, data).await
            {
                Ok(stat) => (Some(stat), None),
                Err(err) => (None, Some(err)),
            };
            CanopyEvent::SetData {
                path,
                stat,
                error,
                context,
            }
        });
        Ok(())
    }
}

pub(crate) async fn execute_set_data(
    view: &Arc<View>,
    version: i32,
    compress: bool,
    path: &str,
    data: Vec<u8>,
) -> Result<Stat> {
    view.require_started()?;

    let payload = if compress {
        match &view.shared.compression {
            Some(provider) => provider.compress(path, &data)?,
            None => return Err(CanopyError::Wire("no compression provider configured".into())),
        }
    } else {
        data
    };

    let server_path = view.fix_path(path)?;

    view.shared
        .client
        .run_with_retry(move |conn, _attempt| {
            let server_path = server_path.clone();
            let payload = payload.clone();
            Box::pin(async move { conn.set_data(&server_path, &payload, version).await })
                as BoxFuture<'static, Result<Stat>>
        })
        .await
}
