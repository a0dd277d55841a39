//! This module defines the core data structures for the proxy.
//!
//! It contains the `Target` struct, which describes a single upstream
//! endpoint, the immutable `UpstreamPool` built once at startup, and the
//! `ProxyError` enum for the error conditions that can halt the process.

use crate::config::ConfigError;
use crate::shutdown::ShutdownError;
use crate::store::StoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Cache store error: {0}")]
    StoreError(String),
    #[error("Upstream error: {0}")]
    UpstreamError(String),
    #[error("Failed to bind listener: {0}")]
    BindError(String),
    #[error("Server error: {0}")]
    ServerError(String),
}

impl From<ConfigError> for ProxyError {
    fn from(err: ConfigError) -> Self {
        ProxyError::ConfigError(err.to_string())
    }
}

impl From<ShutdownError> for ProxyError {
    fn from(err: ShutdownError) -> Self {
        ProxyError::ServerError(err.to_string())
    }
}

impl From<StoreError> for ProxyError {
    fn from(err: StoreError) -> Self {
        ProxyError::StoreError(err.to_string())
    }
}

/// An upstream endpoint requests can be routed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub scheme: String,
    /// `host:port` of the upstream.
    pub host: String,
    /// Prepended to the path of every request routed here. Empty for pool members.
    #[serde(rename = "path", default)]
    pub path_prefix: String,
}

impl Target {
    pub fn new(scheme: &str, host: &str) -> Self {
        Self { scheme: scheme.to_string(), host: host.to_string(), path_prefix: String::new() }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}{}", self.scheme, self.host, self.path_prefix)
    }
}

/// The ordered, immutable list of upstream targets.
///
/// Index stability matters: region ordinals returned by the resolver are
/// mapped onto positions in this list.
#[derive(Debug, Clone)]
pub struct UpstreamPool {
    targets: Vec<Target>,
}

impl UpstreamPool {
    /// Builds the pool from `host:port` strings, all sharing `scheme`.
    ///
    /// Fails if the list is empty, since no routing decision is possible.
    pub fn new<S: AsRef<str>>(upstreams: &[S], scheme: &str) -> Result<Self, ProxyError> {
        let targets: Vec<Target> =
            upstreams.iter().map(|u| Target::new(scheme, u.as_ref())).collect();

        if targets.is_empty() {
            return Err(ProxyError::ConfigError("Upstream pool is empty".to_string()));
        }

        Ok(Self { targets })
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Always `false` for a constructed pool; present for API completeness.
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Target> {
        self.targets.get(index)
    }

    /// The first target, used as the fallback for unusable region ordinals.
    pub fn first(&self) -> &Target {
        &self.targets[0]
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    pub fn contains(&self, target: &Target) -> bool {
        self.targets.iter().any(|t| t.scheme == target.scheme && t.host == target.host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_builds_targets_with_scheme_and_empty_prefix() {
        let pool = UpstreamPool::new(&["a:1", "b:2"], "http").unwrap();
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.get(0).unwrap(), &Target::new("http", "a:1"));
        assert_eq!(pool.get(1).unwrap().host, "b:2");
        assert!(pool.targets().iter().all(|t| t.path_prefix.is_empty()));
    }

    #[test]
    fn test_empty_pool_is_rejected() {
        let empty: Vec<String> = Vec::new();
        let result = UpstreamPool::new(&empty, "http");
        assert!(matches!(result, Err(ProxyError::ConfigError(_))));
    }

    #[test]
    fn test_pool_preserves_order() {
        let pool = UpstreamPool::new(&["c:3", "a:1", "b:2"], "https").unwrap();
        let hosts: Vec<&str> = pool.targets().iter().map(|t| t.host.as_str()).collect();
        assert_eq!(hosts, vec!["c:3", "a:1", "b:2"]);
        assert_eq!(pool.first().host, "c:3");
        assert_eq!(pool.first().scheme, "https");
    }

    #[test]
    fn test_contains_ignores_path_prefix() {
        let pool = UpstreamPool::new(&["a:1"], "http").unwrap();
        let mut target = Target::new("http", "a:1");
        target.path_prefix = "/api".to_string();
        assert!(pool.contains(&target));
        assert!(!pool.contains(&Target::new("http", "z:9")));
        assert!(!pool.contains(&Target::new("https", "a:1")));
    }

    #[test]
    fn test_target_display() {
        let target = Target::new("http", "localhost:9091");
        assert_eq!(target.to_string(), "http://localhost:9091");
    }
}
