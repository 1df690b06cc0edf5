//! Client configuration

use std::sync::Arc;
use std::time::Duration;

use canopy_retry::{ExponentialBackoffRetry, RetryPolicy};

use crate::ensemble::EnsembleProvider;
use crate::providers::{AclProvider, CompressionProvider};
use crate::wire::AuthInfo;

pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_MAX_CLOSE_WAIT: Duration = Duration::from_secs(1);

/// Configuration for a [`CanopyClient`](crate::CanopyClient).
///
/// Plain fields with a usable [`Default`]; `with_*` helpers cover the
/// common adjustments.
#[derive(Clone)]
pub struct CanopyConfig {
    /// Server list handed to the dialer, e.g. `"10.0.0.5:2181,10.0.0.6:2181"`.
    /// Ignored when an explicit `ensemble` provider is set.
    pub connect_string: String,

    /// Dynamic endpoint source; overrides `connect_string` when present.
    pub ensemble: Option<Arc<dyn EnsembleProvider>>,

    pub session_timeout: Duration,

    pub connection_timeout: Duration,

    /// How long `close` waits for background dispatch to drain.
    pub max_close_wait: Duration,

    /// Path prefix isolating this client's view of the shared tree.
    pub namespace: String,

    /// Payload used when a create supplies no data.
    pub default_data: Vec<u8>,

    pub retry_policy: Arc<dyn RetryPolicy>,

    pub compression: Option<Arc<dyn CompressionProvider>>,

    /// Supplies ACLs for creates without an explicit list; defaults to the
    /// open ACL when unset.
    pub acl_provider: Option<Arc<dyn AclProvider>>,

    /// Allow the session to keep serving reads from a partitioned
    /// read-only member.
    pub can_be_read_only: bool,

    /// Credentials applied to the session on every (re)connect.
    pub auth_infos: Vec<AuthInfo>,
}

impl Default for CanopyConfig {
    fn default() -> Self {
        Self {
            connect_string: String::new(),
            ensemble: None,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            max_close_wait: DEFAULT_MAX_CLOSE_WAIT,
            namespace: String::new(),
            default_data: Vec::new(),
            retry_policy: Arc::new(ExponentialBackoffRetry::new(
                Duration::from_millis(100),
                3,
                Duration::from_secs(30),
            )),
            compression: None,
            acl_provider: None,
            can_be_read_only: false,
            auth_infos: Vec::new(),
        }
    }
}

impl CanopyConfig {
    pub fn new(connect_string: &str) -> Self {
        Self {
            connect_string: connect_string.to_string(),
            ..Default::default()
        }
    }

    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.namespace = namespace.to_string();
        self
    }

    pub fn with_retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_default_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.default_data = data.into();
        self
    }

    /// Append an authorization credential.
    pub fn with_authorization(mut self, scheme: &str, auth: impl Into<Vec<u8>>) -> Self {
        self.auth_infos.push(AuthInfo::new(scheme, auth));
        self
    }

    pub fn with_compression(mut self, provider: Arc<dyn CompressionProvider>) -> Self {
        self.compression = Some(provider);
        self
    }

    pub fn with_acl_provider(mut self, provider: Arc<dyn AclProvider>) -> Self {
        self.acl_provider = Some(provider);
        self
    }

    pub fn with_read_only_allowed(mut self) -> Self {
        self.can_be_read_only = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CanopyConfig::new("localhost:2181");
        assert_eq!(config.connect_string, "localhost:2181");
        assert_eq!(config.session_timeout, DEFAULT_SESSION_TIMEOUT);
        assert_eq!(config.connection_timeout, DEFAULT_CONNECTION_TIMEOUT);
        assert!(config.namespace.is_empty());
        assert!(!config.can_be_read_only);
    }

    #[test]
    fn test_with_helpers_accumulate() {
        let config = CanopyConfig::new("localhost:2181")
            .with_namespace("app")
            .with_default_data(b"seed".to_vec())
            .with_authorization("digest", b"user:pass".to_vec())
            .with_authorization("digest", b"other:pass".to_vec());

        assert_eq!(config.namespace, "app");
        assert_eq!(config.default_data, b"seed");
        assert_eq!(config.auth_infos.len(), 2);
    }
}
