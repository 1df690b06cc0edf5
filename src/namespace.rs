//! Path namespacing: prefix application, stripping, and the facade cache
//!
//! A namespace gives an application an isolated view of the shared tree.
//! Paths are prefixed on the way to the service and stripped from results
//! and watch-event paths on the way back, so application code never
//! observes the prefix.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{CanopyError, Result};
use crate::framework::{CanopyClient, Shared};

/// Validate an absolute tree path.
pub fn validate_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(CanopyError::InvalidPath("path is empty".into()));
    }
    if !path.starts_with('/') {
        return Err(CanopyError::InvalidPath(format!("{path}: must start with '/'")));
    }
    if path.len() > 1 && path.ends_with('/') {
        return Err(CanopyError::InvalidPath(format!("{path}: must not end with '/'")));
    }
    if path.contains('\0') {
        return Err(CanopyError::InvalidPath(format!("{path}: contains a null character")));
    }
    for segment in path.split('/').skip(1) {
        if segment.is_empty() {
            return Err(CanopyError::InvalidPath(format!("{path}: empty path segment")));
        }
        if segment == "." || segment == ".." {
            return Err(CanopyError::InvalidPath(format!("{path}: relative segments not allowed")));
        }
    }
    Ok(())
}

/// Validate a namespace string. An empty namespace means "no namespace".
pub fn validate_namespace(namespace: &str) -> Result<()> {
    if namespace.is_empty() {
        return Ok(());
    }
    if namespace.starts_with('/') || namespace.ends_with('/') {
        return Err(CanopyError::InvalidPath(format!(
            "namespace {namespace}: must not start or end with '/'"
        )));
    }
    validate_path(&format!("/{namespace}"))
}

/// Prefix `path` with the namespace, validating both.
pub fn fix_for_namespace(namespace: &str, path: &str) -> Result<String> {
    validate_path(path)?;
    if namespace.is_empty() {
        return Ok(path.to_string());
    }
    if path == "/" {
        return Ok(format!("/{namespace}"));
    }
    Ok(format!("/{namespace}{path}"))
}

/// Strip the namespace prefix from a server-side path. Paths outside the
/// namespace are returned unchanged.
pub fn unfix_for_namespace(namespace: &str, path: &str) -> String {
    if namespace.is_empty() {
        return path.to_string();
    }
    let prefix = format!("/{namespace}");
    if path == prefix {
        return "/".to_string();
    }
    match path.strip_prefix(&format!("{prefix}/")) {
        Some(rest) => format!("/{rest}"),
        None => path.to_string(),
    }
}

/// Memoizes one facade per namespace string for the lifetime of the owning
/// framework. Concurrent `get` calls for the same namespace never construct
/// two distinct facades.
pub(crate) struct NamespaceFacadeCache {
    facades: Mutex<HashMap<String, CanopyClient>>,
}

impl NamespaceFacadeCache {
    pub fn new() -> Self {
        Self {
            facades: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, shared: &Arc<Shared>, namespace: &str) -> CanopyClient {
        let mut facades = self.facades.lock().unwrap();
        facades
            .entry(namespace.to_string())
            .or_insert_with(|| CanopyClient::facade(shared.clone(), namespace.to_string()))
            .clone()
    }

    pub fn clear(&self) {
        self.facades.lock().unwrap().clear();
    }
}
