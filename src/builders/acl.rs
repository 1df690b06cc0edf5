//! Get-ACL and set-ACL builders

use futures::future::BoxFuture;
use std::any::Any;
use std::sync::Arc;

use crate::error::Result;
use crate::event::CanopyEvent;
use crate::framework::{make_context, spawn_background, View};
use crate::wire::{Acl, Stat, ANY_VERSION};

use super::InBackground;

/// Builds an ACL read.
pub struct GetAclBuilder {
    view: Arc<View>,
}

impl GetAclBuilder {
    pub(crate) fn new(view: Arc<View>) -> Self {
        Self { view }
    }

    pub fn in_background(self) -> InBackground<Self> {
        InBackground::new(self, None)
    }

    pub fn in_background_with_context<T: Any + Send + Sync>(self, context: T) -> InBackground<Self> {
        InBackground::new(self, Some(make_context(context)))
    }

    pub async fn for_path(self, path: &str) -> Result<(Vec<Acl>, Stat)> {
        execute_get_acl(&self.view, path).await
    }
}

impl InBackground<GetAclBuilder> {
    pub fn for_path(self, path: &str) -> Result<()> {
        let InBackground { builder, context } = self;
        builder.view.require_started()?;

        let view = builder.view.clone();
        let path = path.to_string();
        spawn_background(view.clone(), async move {
            let (acl, stat, error) = match execute_get_acl(&view, &path).await {
                Ok((acl, stat)) => (acl, Some(stat), None),
                Err(err) => (Vec::new(), None, Some(err)),
            };
            CanopyEvent::GetAcl {
                path,
                acl,
                stat,
                error,
                context,
            }
        });
        Ok(())
    }
}

pub(crate) async fn execute_get_acl(view: &Arc<View>, path: &str) -> Result<(Vec<Acl>, Stat)> {
    view.require_started()?;
    let server_path = view.fix_path(path)?;

    view.shared
        .client
        .run_with_retry(move |conn, _attempt| {
            let server_path = server_path.clone();
            Box::pin(async move { conn.get_acl(&server_path).await })
                as BoxFuture<'static, Result<(Vec<Acl>, Stat)>>
        })
        .await
}

/// Builds an ACL write with a version guard.
pub struct SetAclBuilder {
    view: Arc<View>,
    acl: Option<Vec<Acl>>,
    version: i32,
}

impl SetAclBuilder {
    pub(crate) fn new(view: Arc<View>) -> Self {
        Self {
            view,
            acl: None,
            version: ANY_VERSION,
        }
    }

    pub fn with_acl(mut self, acl: Vec<Acl>) -> Self {
        self.acl = Some(acl);
        self
    }

    /// Require the server's ACL version to match; [`ANY_VERSION`] (the
    /// default) writes regardless of version.
    pub fn with_version(mut self, version: i32) -> Self {
        self.version = version;
        self
    }

    pub fn in_background(self) -> InBackground<Self> {
        InBackground::new(self, None)
    }

    pub fn in_background_with_context<T: Any + Send + Sync>(self, context: T) -> InBackground<Self> {
        InBackground::new(self, Some(make_context(context)))
    }

    pub async fn for_path(self, path: &str) -> Result<Stat> {
        execute_set_acl(&self.view, self.acl, self.version, path).await
    }
}

impl InBackground<SetAclBuilder> {
    pub fn for_path(self, path: &str) -> Result<()> {
        let InBackground { builder, context } = self;
        builder.view.require_started()?;

        let view = builder.view.clone();
        let path = path.to_string();
        spawn_background(view.clone(), async move {
            let (stat, error) = match execute_set_acl(&view, builder.acl, builder.version, &path).await {
                Ok(stat) => (Some(stat), None),
                Err(err) => (None, Some(err)),
            };
            CanopyEvent::SetAcl {
                path,
                stat,
                error,
                context,
            }
        });
        Ok(())
    }
}

pub(crate) async fn execute_set_acl(
    view: &Arc<View>,
    acl: Option<Vec<Acl>>,
    version: i32,
    path: &str,
) -> Result<Stat> {
    view.require_started()?;

    let acl = acl.unwrap_or_else(|| view.shared.acl_provider.acl_for_path(path));
    let server_path = view.fix_path(path)?;

    view.shared
        .client
        .run_with_retry(move |conn, _attempt| {
            let server_path = server_path.clone();
            let acl = acl.clone();
            Box::pin(async move { conn.set_acl(&server_path, &acl, version).await })
                as BoxFuture<'static, Result<Stat>>
        })
        .await
}
