//! The per-request routing logic.
//!
//! The `Director` derives a client key from the request, asks the session
//! cache for that client's upstream (selecting and persisting a new one on a
//! miss), and rewrites the request destination. It never fails: every internal
//! problem degrades to some valid pool member.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::http::{HeaderMap, Uri};
use serde_json::Value;
use tracing::info;

use crate::{
    cache::SessionCache,
    region::RegionResolver,
    strategy,
    upstream::{Target, UpstreamPool},
};

pub const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// A request destination chosen by the director.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedRequest {
    pub client_key: String,
    pub target: Target,
    /// Absolute URL to forward to: target scheme and host, joined path, original query.
    pub url: String,
}

pub struct Director {
    pool: Arc<UpstreamPool>,
    cache: SessionCache,
    resolver: Option<RegionResolver>,
}

impl Director {
    pub fn new(
        pool: Arc<UpstreamPool>,
        cache: SessionCache,
        resolver: Option<RegionResolver>,
    ) -> Self {
        info!(
            upstreams = ?pool.targets().iter().map(|t| t.host.as_str()).collect::<Vec<_>>(),
            ttl_secs = cache.ttl().as_secs(),
            region_resolver = resolver.is_some(),
            serialize_per_key = cache.serializes_per_key(),
            "Director initialized"
        );
        Self { pool, cache, resolver }
    }

    pub fn pool(&self) -> &UpstreamPool {
        &self.pool
    }

    pub fn cache(&self) -> &SessionCache {
        &self.cache
    }

    /// Returns the sticky upstream for `client_key`.
    pub async fn assign(&self, client_key: &str) -> Target {
        self.cache
            .resolve_or_create(client_key, || async {
                let region = match &self.resolver {
                    Some(resolver) => resolver.resolve(client_key).await.ok(),
                    None => None,
                };
                strategy::select(&self.pool, region)
            })
            .await
    }

    /// Picks the upstream for a request and computes its rewritten URL.
    pub async fn route(&self, uri: &Uri, headers: &HeaderMap, peer: SocketAddr) -> RoutedRequest {
        let client_key = client_key(headers, peer);
        let target = self.assign(&client_key).await;
        let url = rewrite_url(&target, uri);
        RoutedRequest { client_key, target, url }
    }

    pub fn status(&self) -> Value {
        serde_json::json!({
            "upstreams": self.pool.targets().iter().enumerate().map(|(i, t)| {
                serde_json::json!({
                    "index": i,
                    "region_ordinal": i + 1,
                    "url": t.to_string(),
                })
            }).collect::<Vec<_>>(),
            "ttl_secs": self.cache.ttl().as_secs(),
            "serialize_per_key": self.cache.serializes_per_key(),
            "region_resolver": self.resolver.as_ref().map(|r| serde_json::json!({
                "timeout_ms": r.timeout().as_millis() as u64,
            })),
        })
    }
}

/// Derives the cache key for a request.
///
/// Prefers the left-most parseable address of the `X-Forwarded-For` chain,
/// skipping tokens such as `unknown`; falls back to the peer address.
/// Ports are stripped.
pub fn client_key(headers: &HeaderMap, peer: SocketAddr) -> String {
    headers
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .find_map(parse_client_addr)
        .unwrap_or_else(|| peer.ip())
        .to_string()
}

/// Parses `1.2.3.4`, `1.2.3.4:5678`, `::1` or `[::1]:80` into an IP address.
fn parse_client_addr(raw: &str) -> Option<IpAddr> {
    if let Ok(ip) = raw.parse::<IpAddr>() {
        return Some(ip);
    }
    if let Ok(addr) = raw.parse::<SocketAddr>() {
        return Some(addr.ip());
    }
    raw.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>().ok()
}

fn rewrite_url(target: &Target, uri: &Uri) -> String {
    let path = single_joining_slash(&target.path_prefix, uri.path());
    match uri.query() {
        Some(query) => format!("{}://{}{}?{}", target.scheme, target.host, path, query),
        None => format!("{}://{}{}", target.scheme, target.host, path),
    }
}

/// Joins a path prefix and a request path with exactly one slash between them.
pub fn single_joining_slash(a: &str, b: &str) -> String {
    let a_slash = a.ends_with('/');
    let b_slash = b.starts_with('/');
    match (a_slash, b_slash) {
        (true, true) => format!("{}{}", a, &b[1..]),
        (false, false) => format!("{}/{}", a, b),
        _ => format!("{}{}", a, b),
    }
}
