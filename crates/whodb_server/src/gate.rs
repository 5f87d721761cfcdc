use crate::auth::ResolvedCredential;
use axum::body::{Body, to_bytes};
use axum::extract::{Request, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::middleware::Next;
use axum::response::Response;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use uuid::Uuid;
use whodb_core::EngineError;

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(90);
pub const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

const MAX_CONCURRENT: usize = 100;
const MAX_QUEUED: usize = 50;
const QUEUE_WAIT: Duration = Duration::from_secs(5);

/// Operations that never require a session.
const PUBLIC_OPERATIONS: &[&str] = &["Login", "LoginWithProfile", "Logout", "GetProfiles"];

/// Extra operations allowed without a session in development mode only.
const DEV_OPERATIONS: &[&str] = &["GetDatabase", "IntrospectionQuery"];

/// GraphQL-shaped error body so middleware failures read the same as
/// resolver failures.
pub fn error_response(status: StatusCode, error: &EngineError) -> Response {
    let body = serde_json::json!({
        "errors": [{
            "message": error.to_string(),
            "extensions": { "code": error.code() }
        }]
    });
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap_or_default()
}

#[derive(Debug, Clone)]
pub struct RequestId(pub String);

pub async fn request_id(mut request: Request, next: Next) -> Response {
    let id = RequestId(Uuid::new_v4().to_string());
    request.extensions_mut().insert(id.clone());

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&id.0) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

#[derive(Debug, Clone)]
pub struct RealIp(pub Option<String>);

pub async fn real_ip(mut request: Request, next: Next) -> Response {
    let ip = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .or_else(|| {
            request
                .headers()
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .map(String::from)
        });

    request.extensions_mut().insert(RealIp(ip));
    next.run(request).await
}

/// Generous timeout so LLM-assisted clients with slow queries still finish.
pub async fn timeout(request: Request, next: Next) -> Response {
    match tokio::time::timeout(REQUEST_TIMEOUT, next.run(request)).await {
        Ok(response) => response,
        Err(_) => error_response(StatusCode::GATEWAY_TIMEOUT, &EngineError::DeadlineExceeded),
    }
}

/// Edge concurrency limiter: a fixed number of requests run, a bounded
/// number wait up to `QUEUE_WAIT`, and the rest are shed immediately.
pub struct Throttle {
    running: Semaphore,
    queued: AtomicUsize,
}

impl Throttle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            running: Semaphore::new(MAX_CONCURRENT),
            queued: AtomicUsize::new(0),
        })
    }
}

pub async fn throttle(
    State(throttle): State<Arc<Throttle>>,
    request: Request,
    next: Next,
) -> Response {
    if let Ok(_permit) = throttle.running.try_acquire() {
        return next.run(request).await;
    }

    if throttle.queued.fetch_add(1, Ordering::AcqRel) >= MAX_QUEUED {
        throttle.queued.fetch_sub(1, Ordering::AcqRel);
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            &EngineError::unavailable("the gateway is at capacity"),
        );
    }

    let acquired = tokio::time::timeout(QUEUE_WAIT, throttle.running.acquire()).await;
    throttle.queued.fetch_sub(1, Ordering::AcqRel);

    match acquired {
        Ok(Ok(_permit)) => next.run(request).await,
        _ => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            &EngineError::unavailable("timed out waiting for a request slot"),
        ),
    }
}

/// Operation gate: peeks at the GraphQL payload and rejects operations
/// outside the public allow-list when no credential was resolved.
pub async fn operation_gate(
    State(dev_mode): State<bool>,
    request: Request,
    next: Next,
) -> Response {
    let has_credential = request
        .extensions()
        .get::<ResolvedCredential>()
        .is_some_and(|resolved| resolved.0.is_some());

    if has_credential {
        return next.run(request).await;
    }

    let (parts, body) = request.into_parts();
    let bytes = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return error_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                &EngineError::payload_too_large("request body exceeds the configured cap"),
            );
        }
    };

    if !operation_is_public(&bytes, dev_mode) {
        return error_response(
            StatusCode::UNAUTHORIZED,
            &EngineError::unauthorized("this operation requires a session"),
        );
    }

    let request = Request::from_parts(parts, Body::from(bytes));
    next.run(request).await
}

fn operation_is_public(body: &[u8], dev_mode: bool) -> bool {
    let Ok(payload) = serde_json::from_slice::<serde_json::Value>(body) else {
        return false;
    };

    let operation = payload["operationName"].as_str().unwrap_or_default();
    if PUBLIC_OPERATIONS.contains(&operation) {
        return true;
    }
    if dev_mode && DEV_OPERATIONS.contains(&operation) {
        return true;
    }
    if dev_mode {
        // GraphiQL issues the introspection query without an operation name.
        let query = payload["query"].as_str().unwrap_or_default();
        return query.contains("__schema") || query.contains("__type");
    }
    false
}

/// Pattern match for configured CORS origins; `*` matches any run of
/// characters (`https://*`, `http://*.example.com`).
pub fn origin_matches(pattern: &str, origin: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == origin,
        Some((prefix, suffix)) => {
            origin.len() >= prefix.len() + suffix.len()
                && origin.starts_with(prefix)
                && origin.ends_with(suffix)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_operations_bypass_credentials() {
        let body = br#"{"operationName":"Login","query":"mutation Login { }"}"#;
        assert!(operation_is_public(body, false));

        let body = br#"{"operationName":"Other","query":"{ database }"}"#;
        assert!(!operation_is_public(body, false));
    }

    #[test]
    fn dev_mode_extends_the_allow_list() {
        let body = br#"{"operationName":"GetDatabase","query":"{ database }"}"#;
        assert!(!operation_is_public(body, false));
        assert!(operation_is_public(body, true));

        let introspection = br#"{"query":"query { __schema { types { name } } }"}"#;
        assert!(operation_is_public(introspection, true));
        assert!(!operation_is_public(introspection, false));
    }

    #[test]
    fn malformed_payloads_are_not_public() {
        assert!(!operation_is_public(b"not json", true));
    }

    #[test]
    fn origin_patterns_support_wildcards() {
        assert!(origin_matches("https://*", "https://app.example.com"));
        assert!(!origin_matches("https://*", "http://app.example.com"));
        assert!(origin_matches("http://*.example.com", "http://a.example.com"));
        assert!(origin_matches("http://localhost:3000", "http://localhost:3000"));
        assert!(!origin_matches("http://localhost:3000", "http://localhost:4000"));
    }
}
