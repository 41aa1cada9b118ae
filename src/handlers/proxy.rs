//! The proxy pipeline: every path not claimed by the payment, config or
//! health routes lands here.
//!
//! Order of operations: size guards, bounded body capture, JSON-RPC
//! classification, conditional auth + rate limit, shard routing, forward,
//! relay. Any forwarding failure is a plain 502; stack traces never reach
//! a response body.

use axum::{
    body::{to_bytes, Body, Bytes},
    extract::{Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::Value;
use std::collections::HashSet;
use tracing::{error, trace, warn};

use crate::rate_limit::RateDecision;
use crate::routing::RouteError;
use crate::AppState;

pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;
pub const MAX_HEADER_COUNT: usize = 200;

const REQUEST_ID_COOKIE: &str = "UNICITY_REQUEST_ID";
const SHARD_ID_COOKIE: &str = "UNICITY_SHARD_ID";

/// Hop-by-hop and credential headers, never forwarded to a backend.
const BLOCKED_REQUEST_HEADERS: &[&str] = &[
    "host",
    "connection",
    "content-length",
    "expect",
    "upgrade",
    "te",
    "transfer-encoding",
    "keep-alive",
    "proxy-connection",
    "trailer",
    "proxy-authenticate",
    "proxy-authorization",
    "authorization",
    "x-api-key",
];

const BLOCKED_RESPONSE_HEADERS: &[&str] = &["connection", "transfer-encoding"];

/// What the pipeline learned from a JSON-RPC body.
#[derive(Debug, Clone, PartialEq, Eq)]
struct JsonRpcCall {
    method: String,
    request_id: Option<String>,
    shard_id: Option<String>,
}

pub async fn proxy(State(state): State<AppState>, req: Request) -> Response {
    // Both guards run before any other work.
    if let Some(length) = declared_content_length(req.headers()) {
        if length > MAX_BODY_BYTES as u64 {
            return (StatusCode::BAD_REQUEST, "Request body too large").into_response();
        }
    }
    if req.headers().len() > MAX_HEADER_COUNT {
        return (StatusCode::BAD_REQUEST, "Too many headers").into_response();
    }

    let (parts, body) = req.into_parts();

    let body_bytes = if matches!(
        parts.method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    ) {
        match to_bytes(body, MAX_BODY_BYTES).await {
            Ok(bytes) => bytes,
            Err(_) => {
                return (StatusCode::BAD_REQUEST, "Request body too large").into_response()
            }
        }
    } else {
        Bytes::new()
    };

    if !body_bytes.is_empty() && tracing::enabled!(tracing::Level::TRACE) {
        let shown = &body_bytes[..body_bytes.len().min(1024)];
        trace!(body = %String::from_utf8_lossy(shown), "Request body");
    }

    // Parse failures are silent: the request simply is not JSON-RPC.
    let call = classify_json_rpc(&parts.method, &body_bytes);

    let mut rate_limit_remaining: Option<u64> = None;
    if let Some(call) = &call {
        if state.config.protected_methods.contains(&call.method) {
            let Some(api_key) = state.auth.extract_key(&parts.headers) else {
                return unauthorized();
            };

            let limits = match state
                .auth
                .effective_limits(&state.db, &api_key, state.time.now())
                .await
            {
                Ok(Some(limits)) => limits,
                Ok(None) => return unauthorized(),
                Err(e) => {
                    error!("Key lookup failed during auth: {}", e);
                    return (StatusCode::INTERNAL_SERVER_ERROR, "Internal error")
                        .into_response();
                }
            };

            match state.rate_limiter.try_consume(&api_key, limits).await {
                RateDecision::Allowed { remaining } => {
                    rate_limit_remaining = Some(remaining);
                }
                RateDecision::Denied { retry_after_secs } => {
                    return (
                        StatusCode::TOO_MANY_REQUESTS,
                        [(header::RETRY_AFTER, retry_after_secs.to_string())],
                        "Too Many Requests",
                    )
                        .into_response();
                }
            }
        }
    }

    // Routing identifiers come from the JSON-RPC params, or for plain HTTP
    // traffic from the sharding cookies, else a random shard is used.
    let (request_id, shard_id, is_json_rpc) = match &call {
        Some(call) => (call.request_id.clone(), call.shard_id.clone(), true),
        None => (
            cookie_value(&parts.headers, REQUEST_ID_COOKIE),
            cookie_value(&parts.headers, SHARD_ID_COOKIE),
            false,
        ),
    };

    let router = state.router.load().await;
    let target = match router.resolve(request_id.as_deref(), shard_id.as_deref(), is_json_rpc)
    {
        Ok(url) => url.to_string(),
        Err(RouteError::Unavailable) => {
            return (StatusCode::SERVICE_UNAVAILABLE, "Routing unavailable").into_response()
        }
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    };

    forward(&state, &parts, body_bytes, &target, rate_limit_remaining).await
}

async fn forward(
    state: &AppState,
    parts: &axum::http::request::Parts,
    body: Bytes,
    target: &str,
    rate_limit_remaining: Option<u64>,
) -> Response {
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");
    let url = join_target(target, path_and_query);

    let Ok(method) = reqwest::Method::from_bytes(parts.method.as_str().as_bytes()) else {
        return (StatusCode::BAD_REQUEST, "Unsupported method").into_response();
    };

    let connection_listed = connection_tokens(&parts.headers);
    let mut backend_headers = reqwest::header::HeaderMap::new();
    for (name, value) in parts.headers.iter() {
        if !should_forward_request_header(name.as_str(), &connection_listed) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            backend_headers.append(name, value);
        }
    }

    let result = state
        .http
        .request(method, &url)
        .headers(backend_headers)
        .body(body.to_vec())
        .timeout(state.config.read_timeout())
        .send()
        .await;

    let backend_response = match result {
        Ok(response) => response,
        Err(e) => {
            warn!(target = %url, "Backend request failed: {}", e);
            return (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response();
        }
    };

    let status = StatusCode::from_u16(backend_response.status().as_u16())
        .unwrap_or(StatusCode::BAD_GATEWAY);

    let mut builder = Response::builder().status(status);
    for (name, value) in backend_response.headers() {
        if !should_relay_response_header(name.as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            builder = builder.header(name, value);
        }
    }
    if let Some(remaining) = rate_limit_remaining {
        builder = builder.header("x-ratelimit-remaining", remaining.to_string());
    }

    match builder.body(Body::from_stream(backend_response.bytes_stream())) {
        Ok(response) => response,
        Err(e) => {
            error!("Failed to assemble relay response: {}", e);
            (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response()
        }
    }
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Bearer")],
        "Unauthorized",
    )
        .into_response()
}

fn declared_content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

fn classify_json_rpc(method: &Method, body: &[u8]) -> Option<JsonRpcCall> {
    if *method != Method::POST || body.is_empty() {
        return None;
    }
    let value: Value = serde_json::from_slice(body).ok()?;
    let rpc_method = value.get("method")?.as_str()?.to_string();
    let params = value.get("params");
    let string_param = |key: &str| {
        params
            .and_then(|p| p.get(key))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    };

    Some(JsonRpcCall {
        method: rpc_method,
        request_id: string_param("requestId"),
        shard_id: string_param("shardId"),
    })
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    for cookie_header in headers.get_all(header::COOKIE) {
        let Ok(raw) = cookie_header.to_str() else {
            continue;
        };
        for pair in raw.split(';') {
            if let Some((key, value)) = pair.split_once('=') {
                if key.trim() == name {
                    let value = value.trim();
                    if !value.is_empty() {
                        return Some(value.to_string());
                    }
                }
            }
        }
    }
    None
}

/// Lowercased tokens from the request's `Connection` headers; RFC 7230
/// requires dropping any header they name.
fn connection_tokens(headers: &HeaderMap) -> HashSet<String> {
    let mut tokens = HashSet::new();
    for value in headers.get_all(header::CONNECTION) {
        if let Ok(raw) = value.to_str() {
            for token in raw.split(',') {
                let token = token.trim().to_ascii_lowercase();
                if !token.is_empty() {
                    tokens.insert(token);
                }
            }
        }
    }
    tokens
}

fn should_forward_request_header(name: &str, connection_listed: &HashSet<String>) -> bool {
    let lower = name.to_ascii_lowercase();
    !BLOCKED_REQUEST_HEADERS.contains(&lower.as_str()) && !connection_listed.contains(&lower)
}

fn should_relay_response_header(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    !BLOCKED_RESPONSE_HEADERS.contains(&lower.as_str())
        && !lower.starts_with("access-control-")
}

fn join_target(base: &str, path_and_query: &str) -> String {
    let base = base.trim_end_matches('/');
    if path_and_query.starts_with('/') {
        format!("{}{}", base, path_and_query)
    } else {
        format!("{}/{}", base, path_and_query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_extracts_method_and_params() {
        let body = br#"{"jsonrpc":"2.0","method":"submit_commitment","params":{"requestId":"0001","shardId":"2"},"id":1}"#;
        let call = classify_json_rpc(&Method::POST, body).unwrap();
        assert_eq!(call.method, "submit_commitment");
        assert_eq!(call.request_id.as_deref(), Some("0001"));
        assert_eq!(call.shard_id.as_deref(), Some("2"));
    }

    #[test]
    fn classification_is_silent_on_parse_failure() {
        assert_eq!(classify_json_rpc(&Method::POST, b"{not json"), None);
        assert_eq!(classify_json_rpc(&Method::POST, b""), None);
        assert_eq!(classify_json_rpc(&Method::POST, br#"{"params":{}}"#), None);
        // Non-string method is not JSON-RPC for our purposes
        assert_eq!(classify_json_rpc(&Method::POST, br#"{"method":5}"#), None);
    }

    #[test]
    fn classification_only_applies_to_post() {
        let body = br#"{"method":"submit_commitment"}"#;
        assert_eq!(classify_json_rpc(&Method::GET, body), None);
        assert!(classify_json_rpc(&Method::POST, body).is_some());
    }

    #[test]
    fn cookie_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("foo=1; UNICITY_REQUEST_ID=00ab; UNICITY_SHARD_ID=3"),
        );
        assert_eq!(
            cookie_value(&headers, REQUEST_ID_COOKIE).as_deref(),
            Some("00ab")
        );
        assert_eq!(cookie_value(&headers, SHARD_ID_COOKIE).as_deref(), Some("3"));
        assert_eq!(cookie_value(&headers, "MISSING"), None);
    }

    #[test]
    fn credential_and_hop_headers_are_not_forwarded() {
        let empty = HashSet::new();
        for name in ["Authorization", "X-API-Key", "Host", "Transfer-Encoding", "Keep-Alive"] {
            assert!(!should_forward_request_header(name, &empty), "{}", name);
        }
        assert!(should_forward_request_header("Content-Type", &empty));
        assert!(should_forward_request_header("X-Custom", &empty));
    }

    #[test]
    fn connection_listed_headers_are_dropped() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONNECTION,
            HeaderValue::from_static("close, X-Internal-Token"),
        );
        let tokens = connection_tokens(&headers);
        assert!(tokens.contains("x-internal-token"));
        assert!(!should_forward_request_header("X-Internal-Token", &tokens));
        assert!(should_forward_request_header("X-Other", &tokens));
    }

    #[test]
    fn response_headers_filter_cors_and_hop_by_hop() {
        assert!(!should_relay_response_header("Connection"));
        assert!(!should_relay_response_header("Transfer-Encoding"));
        assert!(!should_relay_response_header("Access-Control-Allow-Origin"));
        assert!(should_relay_response_header("Content-Type"));
        assert!(should_relay_response_header("X-Backend-Version"));
    }

    #[test]
    fn target_join() {
        assert_eq!(
            join_target("http://backend:3000", "/"),
            "http://backend:3000/"
        );
        assert_eq!(
            join_target("http://backend:3000/", "/rpc?x=1"),
            "http://backend:3000/rpc?x=1"
        );
    }

    #[test]
    fn content_length_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("10485760"));
        assert_eq!(declared_content_length(&headers), Some(10 * 1024 * 1024));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("nope"));
        assert_eq!(declared_content_length(&headers), None);
    }
}
