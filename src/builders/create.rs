//! Create builder

use futures::future::BoxFuture;
use std::any::Any;
use std::sync::Arc;

use crate::error::{CanopyError, Result};
use crate::event::CanopyEvent;
use crate::framework::{make_context, spawn_background, View};
use crate::wire::{Acl, CreateMode, WireConn};

use super::InBackground;

/// Builds a create operation: mode, ACL, parent handling, compression.
pub struct CreateBuilder {
    view: Arc<View>,
    mode: CreateMode,
    acl: Option<Vec<Acl>>,
    create_parents: bool,
    compress: bool,
}

impl CreateBuilder {
    pub(crate) fn new(view: Arc<View>) -> Self {
        Self {
            view,
            mode: CreateMode::Persistent,
            acl: None,
            create_parents: false,
            compress: false,
        }
    }

    pub fn with_mode(mut self, mode: CreateMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_acl(mut self, acl: Vec<Acl>) -> Self {
        self.acl = Some(acl);
        self
    }

    /// Create missing ancestors first (persistent, provider-default ACLs).
    pub fn creating_parents_if_needed(mut self) -> Self {
        self.create_parents = true;
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

    /// Create `path` with the configured default data. Returns the created
    /// path, namespace-stripped; sequential modes return the
    /// server-assigned suffixed name.
    pub async fn for_path(self, path: &str) -> Result<String> {
        let view = self.view.clone();
        execute_create(&view, self.mode, self.acl, self.create_parents, self.compress, path, None).await
    }

    /// Create `path` with an explicit payload.
    pub async fn for_path_with_data(self, path: &str, data: Vec<u8>) -> Result<String> {
        let view = self.view.clone();
        execute_create(&view, self.mode, self.acl, self.create_parents, self.compress, path, Some(data)).await
    }
}

impl InBackground<CreateBuilder> {
    pub fn for_path(self, path: &str) -> Result<()> {
        self.dispatch(path, None)
    }

    pub fn for_path_with_data(self, path: &str, data: Vec<u8>) -> Result<()> {
        self.dispatch(path, Some(data))
    }

    fn dispatch(self, path: &str, data: Option<Vec<u8>>) -> Result<()> {
        let InBackground { builder, context } = self;
        builder.view.require_started()?;

        let view = builder.view.clone();
        let path = path.to_string();
        spawn_background(view.clone(), async move {
            let result = execute_create(
                &view,
                builder.mode,
                builder.acl,
                builder.create_parents,
                builder.compress,
                &path,
                data,
            )
            .await;
            let (created_path, error) = match result {
                Ok(created) => (Some(created), None),
                Err(err) => (None, Some(err)),
            };
            CanopyEvent::Created {
                path,
                created_path,
                error,
                context,
            }
        });
        Ok(())
    }
}

pub(crate) async fn execute_create(
    view: &Arc<View>,
    mode: CreateMode,
    acl: Option<Vec<Acl>>,
    create_parents: bool,
    compress: bool,
    path: &str,
    data: Option<Vec<u8>>,
) -> Result<String> {
    view.require_started()?;

    let payload = data.unwrap_or_else(|| view.shared.default_data.clone());
    let payload = if compress {
        match &view.shared.compression {
            Some(provider) => provider.compress(path, &payload)?,
            None => return Err(CanopyError::Wire("no compression provider configured".into())),
        }
    } else {
        payload
    };

    let acl = acl.unwrap_or_else(|| view.shared.acl_provider.acl_for_path(path));
    let parent_acl = view.shared.acl_provider.default_acl();
    let server_path = view.fix_path(path)?;
    let namespace_prefix = namespace_prefix(view);
    let sequential = mode.is_sequential();

    let created = view
        .shared
        .client
        .run_with_retry(move |conn, attempt| {
            let server_path = server_path.clone();
            let payload = payload.clone();
            let acl = acl.clone();
            let parent_acl = parent_acl.clone();
            let namespace_prefix = namespace_prefix.clone();
            Box::pin(async move {
                match conn.create(&server_path, &payload, &acl, mode).await {
                    Err(CanopyError::NoNode(_)) if create_parents => {
                        create_parent_chain(conn.as_ref(), &server_path, &parent_acl).await?;
                        conn.create(&server_path, &payload, &acl, mode).await
                    }
                    // The namespace root is materialized on demand; a
                    // missing direct parent still surfaces as NoNode.
                    Err(CanopyError::NoNode(_)) if namespace_prefix.is_some() => {
                        ensure_path(conn.as_ref(), namespace_prefix.as_deref().unwrap(), &parent_acl).await?;
                        conn.create(&server_path, &payload, &acl, mode).await
                    }
                    // A duplicate observed on a retry means the earlier
                    // attempt landed before its transport error was
                    // reported. Sequential names cannot be matched to that
                    // attempt, so only plain creates are de-duplicated.
                    Err(CanopyError::NodeExists(_)) if attempt > 1 && !sequential => Ok(server_path.clone()),
                    other => other,
                }
            }) as BoxFuture<'static, Result<String>>
        })
        .await?;

    Ok(view.unfix_path(&created))
}

/// The view's namespace as a server-side path, if it has one.
pub(crate) fn namespace_prefix(view: &View) -> Option<String> {
    (!view.namespace.is_empty()).then(|| format!("/{}", view.namespace))
}

/// Create every missing segment of `path` (persistent, given ACL).
pub(crate) async fn ensure_path(conn: &dyn WireConn, path: &str, acl: &[Acl]) -> Result<()> {
    let mut prefix = String::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        prefix.push('/');
        prefix.push_str(segment);
        match conn.create(&prefix, &[], acl, CreateMode::Persistent).await {
            Ok(_) | Err(CanopyError::NodeExists(_)) => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

async fn create_parent_chain(conn: &dyn WireConn, server_path: &str, acl: &[Acl]) -> Result<()> {
    match server_path.rfind('/') {
        Some(idx) if idx > 0 => ensure_path(conn, &server_path[..idx], acl).await,
        _ => Ok(()),
    }
}
