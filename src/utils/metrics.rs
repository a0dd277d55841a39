use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter, register_int_counter_vec,
    register_int_gauge, Histogram, HistogramVec, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::LazyLock;

// --- Session Cache Metrics ---

/// Total number of requests served from a fresh cached assignment.
///
/// Together with `session_cache_misses_total` and `session_cache_expired_total`
/// this gives the stickiness ratio of the proxy.
/// Example query: `rate(session_cache_hits_total[5m])`.
pub static CACHE_HITS: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!("session_cache_hits_total", "Requests routed from a fresh assignment")
        .unwrap()
});

/// Total number of requests for clients with no cached assignment.
pub static CACHE_MISSES: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!("session_cache_misses_total", "Requests with no cached assignment")
        .unwrap()
});

/// Total number of cached assignments found stale and replaced.
///
/// Expiry is lazy, so this only counts records some request actually touched.
pub static CACHE_EXPIRED: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "session_cache_expired_total",
        "Cached assignments found stale and replaced"
    )
    .unwrap()
});

/// Total number of cache records that could not be decoded.
///
/// Each one is treated as a miss and overwritten. A steady rate here usually
/// means something else writes into the store.
pub static CACHE_CORRUPT_RECORDS: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!("session_cache_corrupt_records_total", "Undecodable cache records")
        .unwrap()
});

/// Total number of assignments that could not be persisted.
///
/// The request is still routed; the client just loses stickiness.
pub static CACHE_WRITE_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "session_cache_write_failures_total",
        "Assignments that could not be persisted"
    )
    .unwrap()
});

// --- Selection Metrics ---

/// Total number of upstream selections, by upstream and by how it was chosen
/// (`random`, `region`, or `fallback` for unusable region ordinals).
/// Example query: `sum by (source) (rate(upstream_selected_total[5m]))`.
pub static UPSTREAM_SELECTED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "upstream_selected_total",
        "Upstream selections by upstream and selection source",
        &["upstream", "source"]
    )
    .unwrap()
});

/// Total number of region lookups by outcome
/// (`ok`, `error`, `empty`, `timeout`, `fault`).
pub static REGION_LOOKUPS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "region_lookups_total",
        "Region lookups by outcome",
        &["outcome"]
    )
    .unwrap()
});

/// Histogram of region lookup durations in seconds, timeouts included.
pub static REGION_LOOKUP_LATENCY: LazyLock<Histogram> = LazyLock::new(|| {
    register_histogram!(
        "region_lookup_duration_seconds",
        "Region lookup latency",
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0]
    )
    .unwrap()
});

/// Number of upstreams in the pool.
pub static TOTAL_UPSTREAMS: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge!("total_upstreams", "Number of configured upstreams").unwrap()
});

// --- Forwarding Metrics ---

/// Total number of requests forwarded to any upstream.
/// Example query: `rate(proxy_requests_total[5m])` for requests per second.
pub static PROXY_REQUESTS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!("proxy_requests_total", "Total number of forwarded requests").unwrap()
});

/// Total number of forwarded requests that failed at the transport level, per upstream.
pub static PROXY_REQUESTS_FAILED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "proxy_requests_failed_total",
        "Forwarded requests that got no upstream response",
        &["upstream"]
    )
    .unwrap()
});

/// Histogram of forwarded request durations in seconds per upstream.
///
/// Buckets: `[0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]`.
/// Example query: `histogram_quantile(0.95, sum(rate(proxy_request_duration_seconds_bucket[5m])) by (le, upstream))`.
pub static REQUEST_LATENCY_PER_UPSTREAM: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        "proxy_request_duration_seconds",
        "Forwarded request duration in seconds per upstream",
        &["upstream"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    )
    .unwrap()
});
