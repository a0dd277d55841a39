//! Region lookup for client addresses.
//!
//! A `RegionSource` is whatever knows which region a client belongs to; the
//! bundled `HttpRegionSource` asks an HTTP service. Sources report their own
//! failures through `RegionError`.
//!
//! `RegionResolver` is the adapter the request path uses. It bounds every
//! lookup with a timeout and folds every way a lookup can go wrong (errors,
//! empty answers, timeouts, and panics inside the source) into a single
//! `Unavailable` result. Nothing a source does can fail a request.
//!
//! Ordinals are one-based; `0` means the client has no region assigned.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::metrics::{REGION_LOOKUPS, REGION_LOOKUP_LATENCY};

/// Failures reported by a region source.
#[derive(Debug, Error)]
pub enum RegionError {
    #[error("Region source unreachable: {0}")]
    Transport(String),
    #[error("Region query failed: {0}")]
    Query(String),
    #[error("Malformed region response: {0}")]
    Malformed(String),
}

/// Why the resolver could not produce an ordinal.
#[derive(Debug, Error)]
pub enum Unavailable {
    #[error(transparent)]
    Source(#[from] RegionError),
    #[error("No region known for client")]
    Empty,
    #[error("Region lookup timed out after {0:?}")]
    Timeout(Duration),
    #[error("Region source faulted: {0}")]
    Fault(String),
}

impl Unavailable {
    fn label(&self) -> &'static str {
        match self {
            Unavailable::Source(_) => "error",
            Unavailable::Empty => "empty",
            Unavailable::Timeout(_) => "timeout",
            Unavailable::Fault(_) => "fault",
        }
    }
}

/// Something that can map a client address to a region ordinal.
#[async_trait]
pub trait RegionSource: Send + Sync {
    /// Returns `Ok(None)` when the source has no entry for `client`.
    async fn query(&self, client: &str) -> Result<Option<i64>, RegionError>;
}

#[derive(Debug, Deserialize)]
struct RegionResponse {
    region: Option<i64>,
}

/// Queries `GET <url>?ip=<client>` and expects `{"region": <int|null>}`.
///
/// A `404 Not Found` is read as "no entry" rather than an error.
#[derive(Debug, Clone)]
pub struct HttpRegionSource {
    client: Client,
    url: String,
}

impl HttpRegionSource {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self { client, url: url.into() }
    }
}

#[async_trait]
impl RegionSource for HttpRegionSource {
    async fn query(&self, client: &str) -> Result<Option<i64>, RegionError> {
        let response = self
            .client
            .get(&self.url)
            .query(&[("ip", client)])
            .send()
            .await
            .map_err(|e| RegionError::Transport(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(RegionError::Query(format!("region service returned {}", status)));
        }

        let body = response.bytes().await.map_err(|e| RegionError::Transport(e.to_string()))?;
        let parsed: RegionResponse =
            serde_json::from_slice(&body).map_err(|e| RegionError::Malformed(e.to_string()))?;
        Ok(parsed.region)
    }
}

/// The request-path adapter around a `RegionSource`.
#[derive(Clone)]
pub struct RegionResolver {
    source: Arc<dyn RegionSource>,
    timeout: Duration,
}

impl RegionResolver {
    pub fn new(source: Arc<dyn RegionSource>, timeout: Duration) -> Self {
        Self { source, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Looks up the region ordinal for `client_key`.
    pub async fn resolve(&self, client_key: &str) -> Result<i64, Unavailable> {
        let start = Instant::now();
        let lookup = AssertUnwindSafe(self.source.query(client_key)).catch_unwind();

        let result = match tokio::time::timeout(self.timeout, lookup).await {
            Err(_) => Err(Unavailable::Timeout(self.timeout)),
            Ok(Err(panic)) => Err(Unavailable::Fault(panic_message(panic.as_ref()))),
            Ok(Ok(Err(e))) => Err(Unavailable::Source(e)),
            Ok(Ok(Ok(None))) => Err(Unavailable::Empty),
            Ok(Ok(Ok(Some(ordinal)))) => Ok(ordinal),
        };
        REGION_LOOKUP_LATENCY.observe(start.elapsed().as_secs_f64());

        match &result {
            Ok(ordinal) => {
                REGION_LOOKUPS.with_label_values(&["ok"]).inc();
                debug!(client = %client_key, ordinal = ordinal, "Resolved client region");
            }
            Err(reason) => {
                REGION_LOOKUPS.with_label_values(&[reason.label()]).inc();
                warn!(
                    client = %client_key,
                    reason = %reason,
                    "Region unavailable, falling back to random upstream"
                );
            }
        }
        result
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
