//! Framework events delivered to registered listeners

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::error::CanopyError;
use crate::wire::{Acl, Stat, WatchedEvent};

/// Opaque correlation value supplied by a caller of a background operation
/// and handed back unchanged on the resulting event.
#[derive(Clone)]
pub struct BackgroundContext(Arc<dyn Any + Send + Sync>);

impl BackgroundContext {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    /// Recover the original value, if it was of type `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl fmt::Debug for BackgroundContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BackgroundContext")
    }
}

/// One event delivered through the framework's listener containers.
///
/// Each variant carries only the payload its operation produces, plus the
/// error (background failures are reported here, never thrown to the
/// original caller) and the caller's opaque context.
#[derive(Debug, Clone)]
pub enum CanopyEvent {
    Created {
        path: String,
        created_path: Option<String>,
        error: Option<CanopyError>,
        context: Option<BackgroundContext>,
    },
    Deleted {
        path: String,
        error: Option<CanopyError>,
        context: Option<BackgroundContext>,
    },
    Exists {
        path: String,
        stat: Option<Stat>,
        error: Option<CanopyError>,
        context: Option<BackgroundContext>,
    },
    GetData {
        path: String,
        data: Option<Vec<u8>>,
        stat: Option<Stat>,
        error: Option<CanopyError>,
        context: Option<BackgroundContext>,
    },
    SetData {
        path: String,
        stat: Option<Stat>,
        error: Option<CanopyError>,
        context: Option<BackgroundContext>,
    },
    Children {
        path: String,
        children: Vec<String>,
        error: Option<CanopyError>,
        context: Option<BackgroundContext>,
    },
    GetAcl {
        path: String,
        acl: Vec<Acl>,
        stat: Option<Stat>,
        error: Option<CanopyError>,
        context: Option<BackgroundContext>,
    },
    SetAcl {
        path: String,
        stat: Option<Stat>,
        error: Option<CanopyError>,
        context: Option<BackgroundContext>,
    },
    Synced {
        path: String,
        error: Option<CanopyError>,
        context: Option<BackgroundContext>,
    },
    /// A one-shot watch fired. The path is already namespace-stripped for
    /// the view that registered it.
    Watched(WatchedEvent),
    /// The framework is closing; last event a listener will see.
    Closing,
}

impl CanopyEvent {
    /// The path this event concerns, if any.
    pub fn path(&self) -> Option<&str> {
        match self {
            CanopyEvent::Created { path, .. }
            | CanopyEvent::Deleted { path, .. }
            | CanopyEvent::Exists { path, .. }
            | CanopyEvent::GetData { path, .. }
            | CanopyEvent::SetData { path, .. }
            | CanopyEvent::Children { path, .. }
            | CanopyEvent::GetAcl { path, .. }
            | CanopyEvent::SetAcl { path, .. }
            | CanopyEvent::Synced { path, .. } => Some(path),
            CanopyEvent::Watched(watched) => Some(&watched.path),
            CanopyEvent::Closing => None,
        }
    }

    /// The error carried by a background result, if any.
    pub fn error(&self) -> Option<&CanopyError> {
        match self {
            CanopyEvent::Created { error, .. }
            | CanopyEvent::Deleted { error, .. }
            | CanopyEvent::Exists { error, .. }
            | CanopyEvent::GetData { error, .. }
            | CanopyEvent::SetData { error, .. }
            | CanopyEvent::Children { error, .. }
            | CanopyEvent::GetAcl { error, .. }
            | CanopyEvent::SetAcl { error, .. }
            | CanopyEvent::Synced { error, .. } => error.as_ref(),
            CanopyEvent::Watched(_) | CanopyEvent::Closing => None,
        }
    }

    /// The caller-supplied background context, if any.
    pub fn context(&self) -> Option<&BackgroundContext> {
        match self {
            CanopyEvent::Created { context, .. }
            | CanopyEvent::Deleted { context, .. }
            | CanopyEvent::Exists { context, .. }
            | CanopyEvent::GetData { context, .. }
            | CanopyEvent::SetData { context, .. }
            | CanopyEvent::Children { context, .. }
            | CanopyEvent::GetAcl { context, .. }
            | CanopyEvent::SetAcl { context, .. }
            | CanopyEvent::Synced { context, .. } => context.as_ref(),
            CanopyEvent::Watched(_) | CanopyEvent::Closing => None,
        }
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            CanopyEvent::Created { .. } => "created",
            CanopyEvent::Deleted { .. } => "deleted",
            CanopyEvent::Exists { .. } => "exists",
            CanopyEvent::GetData { .. } => "get_data",
            CanopyEvent::SetData { .. } => "set_data",
            CanopyEvent::Children { .. } => "children",
            CanopyEvent::GetAcl { .. } => "get_acl",
            CanopyEvent::SetAcl { .. } => "set_acl",
            CanopyEvent::Synced { .. } => "synced",
            CanopyEvent::Watched(_) => "watched",
            CanopyEvent::Closing => "closing",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_roundtrip() {
        let ctx = BackgroundContext::new(42u32);
        assert_eq!(ctx.downcast_ref::<u32>(), Some(&42));
        assert!(ctx.downcast_ref::<String>().is_none());
    }

    #[test]
    fn test_event_accessors() {
        let event = CanopyEvent::Created {
            path: "/a".to_string(),
            created_path: Some("/a".to_string()),
            error: None,
            context: Some(BackgroundContext::new("req-7".to_string())),
        };
        assert_eq!(event.path(), Some("/a"));
        assert!(event.error().is_none());
        assert_eq!(
            event.context().and_then(|c| c.downcast_ref::<String>()).map(String::as_str),
            Some("req-7")
        );
        assert_eq!(event.kind(), "created");

        assert_eq!(CanopyEvent::Closing.path(), None);
    }
}
