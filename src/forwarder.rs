//! The I/O side of the proxy.
//!
//! Takes a request the director has already routed, sends it to the chosen
//! upstream with the shared `reqwest::Client`, and relays status, headers and
//! body back to the client. Upstream failures become `502 Bad Gateway`.
//! The client's `Host` header is passed through unchanged.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, DefaultBodyLimit, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};
use bytes::Bytes;
use reqwest::Client;
use tracing::{debug, error};

use crate::director::{Director, RoutedRequest, X_FORWARDED_FOR};
use crate::metrics::{PROXY_REQUESTS_FAILED, PROXY_REQUESTS_TOTAL, REQUEST_LATENCY_PER_UPSTREAM};
use crate::upstream::ProxyError;

pub struct ProxyState {
    pub director: Arc<Director>,
    pub client: Client,
}

/// The proxy surface: every path and method goes through `handle_proxy`.
///
/// Request bodies are unbounded unless `max_body_bytes` is set, in which
/// case larger bodies are refused with `413`.
pub fn router(state: Arc<ProxyState>, max_body_bytes: Option<usize>) -> Router {
    let body_limit = match max_body_bytes {
        Some(limit) => DefaultBodyLimit::max(limit),
        None => DefaultBodyLimit::disable(),
    };
    Router::new().fallback(handle_proxy).layer(body_limit).with_state(state)
}

/// Routes a request to the client's sticky upstream and relays the answer.
async fn handle_proxy(
    State(state): State<Arc<ProxyState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let routed = state.director.route(&uri, &headers, peer).await;
    forward_request(&state.client, method, &routed, headers, peer, body).await
}

/// Headers that describe a single connection and must not be forwarded.
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Removes hop-by-hop headers, including any listed in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
        .collect();

    for name in listed {
        headers.remove(name.as_str());
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

/// Appends the peer address to the `X-Forwarded-For` chain, merging any
/// repeated header lines into one.
pub fn append_forwarded_for(headers: &mut HeaderMap, peer: SocketAddr) {
    let peer_ip = peer.ip().to_string();
    let prior: Vec<&str> = headers
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .collect();

    let chain = if prior.is_empty() {
        peer_ip
    } else {
        format!("{}, {}", prior.join(", "), peer_ip)
    };

    if let Ok(value) = HeaderValue::from_str(&chain) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

/// Forwards a routed request and returns the upstream's response.
pub async fn forward_request(
    client: &Client,
    method: Method,
    routed: &RoutedRequest,
    mut headers: HeaderMap,
    peer: SocketAddr,
    body: Bytes,
) -> Response {
    let upstream = routed.target.host.as_str();
    let timer = REQUEST_LATENCY_PER_UPSTREAM.with_label_values(&[upstream]).start_timer();
    PROXY_REQUESTS_TOTAL.inc();

    strip_hop_by_hop(&mut headers);
    append_forwarded_for(&mut headers, peer);

    let result = send(client, method, &routed.url, headers, body).await;
    timer.observe_duration();

    match result {
        Ok((status, headers, body)) => {
            debug!(
                client = %routed.client_key,
                upstream = %upstream,
                status = %status,
                "Upstream responded"
            );
            (status, headers, body).into_response()
        }
        Err(e) => {
            PROXY_REQUESTS_FAILED.with_label_values(&[upstream]).inc();
            error!(
                client = %routed.client_key,
                upstream = %upstream,
                error = %e,
                "Upstream request failed"
            );
            (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response()
        }
    }
}

async fn send(
    client: &Client,
    method: Method,
    url: &str,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, HeaderMap, Bytes), ProxyError> {
    let response = client
        .request(method, url)
        .headers(headers)
        .body(body)
        .send()
        .await
        .map_err(|e| ProxyError::UpstreamError(e.to_string()))?;

    let status = response.status();
    let mut headers = response.headers().clone();
    strip_hop_by_hop(&mut headers);

    let body = response.bytes().await.map_err(|e| ProxyError::UpstreamError(e.to_string()))?;
    Ok((status, headers, body))
}
