//! Pluggable strategy traits: payload compression and default ACLs
//!
//! Concrete compression algorithms are supplied by the embedder; the
//! framework only routes payloads through whichever provider is configured
//! when a builder opts in with `compressed()`.

use crate::error::Result;
use crate::wire::Acl;

/// Compresses payloads on write and decompresses them on read.
pub trait CompressionProvider: Send + Sync {
    fn compress(&self, path: &str, data: &[u8]) -> Result<Vec<u8>>;
    fn decompress(&self, path: &str, data: &[u8]) -> Result<Vec<u8>>;
}

/// Supplies ACLs for nodes created without an explicit ACL list.
pub trait AclProvider: Send + Sync {
    /// ACL used when no path-specific answer exists.
    fn default_acl(&self) -> Vec<Acl>;

    /// ACL for a specific path about to be created.
    fn acl_for_path(&self, path: &str) -> Vec<Acl>;
}

/// Grants the open ACL everywhere.
#[derive(Debug, Clone, Default)]
pub struct DefaultAclProvider;

impl AclProvider for DefaultAclProvider {
    fn default_acl(&self) -> Vec<Acl> {
        Acl::open_unsafe()
    }

    fn acl_for_path(&self, _path: &str) -> Vec<Acl> {
        Acl::open_unsafe()
    }
}
