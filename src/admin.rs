//! Operator endpoints served on the separate metrics listener:
//! `/metrics`, `/health`, `/status` and `/assignments`.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use serde_json::json;
use tracing::error;

use crate::cache::now_millis;
use crate::director::Director;

/// Upper bound on rows returned by `/assignments`.
pub const MAX_ASSIGNMENTS_LISTED: usize = 1000;

#[derive(Debug, Default, Deserialize)]
pub struct AssignmentsQuery {
    pub prefix: Option<String>,
    pub limit: Option<usize>,
}

/// Full admin surface for the proxy.
pub fn router(director: Arc<Director>) -> Router {
    Router::new()
        .route("/status", get(handle_status))
        .route("/assignments", get(handle_assignments))
        .with_state(director)
        .merge(metrics_router())
}

/// Just `/metrics` and `/health`, for processes without a director.
pub fn metrics_router() -> Router {
    Router::new().route("/metrics", get(metrics_handler)).route("/health", get(handle_health))
}

/// Exposes Prometheus metrics.
async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => {
            (StatusCode::OK, [(header::CONTENT_TYPE, encoder.format_type().to_string())], buffer)
        }
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, "text/plain".to_string())],
                format!("Error encoding metrics: {}", e).into_bytes(),
            )
        }
    }
}

async fn handle_health() -> impl IntoResponse {
    Json(json!({"status": "healthy"}))
}

async fn handle_status(State(director): State<Arc<Director>>) -> impl IntoResponse {
    Json(director.status())
}

/// Lists cached assignments whose client key starts with `prefix`.
///
/// Stale records are included and flagged, since expiry only happens when a
/// request for that client arrives.
async fn handle_assignments(
    State(director): State<Arc<Director>>,
    Query(query): Query<AssignmentsQuery>,
) -> Response {
    let prefix = query.prefix.unwrap_or_default();
    let limit = query.limit.unwrap_or(MAX_ASSIGNMENTS_LISTED).min(MAX_ASSIGNMENTS_LISTED);
    let cache = director.cache();

    let records = match cache.scan(&prefix) {
        Ok(records) => records,
        Err(e) => {
            error!(prefix = %prefix, error = %e, "Failed to scan session cache");
            return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e.to_string()})))
                .into_response();
        }
    };

    let now = now_millis();
    let total = records.len();
    let rows: Vec<_> = records
        .into_iter()
        .take(limit)
        .map(|(client, assignment)| {
            json!({
                "client": client,
                "upstream": assignment.target.to_string(),
                "assigned_at_ms": assignment.assigned_at,
                "fresh": assignment.is_fresh(now, cache.ttl()),
            })
        })
        .collect();

    Json(json!({
        "prefix": prefix,
        "total": total,
        "assignments": rows,
    }))
    .into_response()
}
