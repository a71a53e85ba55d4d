//! Axum middleware that enforces a [`RateLimiter`] on inbound requests.
//!
//! Attaches `X-RateLimit-Limit/Remaining/Reset` response headers and, on
//! denial, short-circuits with `429` and a JSON body of
//! `{error, retry_after_seconds}`. The limiter is fail-open: if the
//! underlying store errors, the request is allowed through and the error is
//! logged once.

use crate::rate_limit::{Decision, RateLimiter};
use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;

/// Derives the rate-limit key for an inbound request. Defaults to client IP;
/// override for per-tenant or per-route keys.
pub type KeyFn = Arc<dyn Fn(&Request<Body>) -> String + Send + Sync>;

#[derive(Clone)]
pub struct RateLimitState {
    pub limiter: Arc<dyn RateLimiter>,
    pub key_fn: KeyFn,
}

impl RateLimitState {
    pub fn new(limiter: Arc<dyn RateLimiter>) -> Self {
        Self { limiter, key_fn: Arc::new(default_key_fn) }
    }

    pub fn with_key_fn(mut self, key_fn: impl Fn(&Request<Body>) -> String + Send + Sync + 'static) -> Self {
        self.key_fn = Arc::new(key_fn);
        self
    }
}

fn default_key_fn(req: &Request<Body>) -> String {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

#[derive(Serialize)]
struct RateLimitedBody {
    error: &'static str,
    retry_after_seconds: f64,
}

/// `axum::middleware::from_fn_with_state` entry point.
pub async fn rate_limit_middleware(
    State(state): State<RateLimitState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let key = (state.key_fn)(&req);

    match state.limiter.acquire(1).await {
        Ok(Decision::Allowed { remaining, limit, metadata }) => {
            let mut response = next.run(req).await;
            apply_headers(&mut response, remaining, limit, &metadata);
            response
        }
        Ok(Decision::Denied { wait, limit, reason: _ }) => {
            let body =
                RateLimitedBody { error: "rate limit exceeded", retry_after_seconds: wait.as_secs_f64() };
            let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
            if let Ok(header) = HeaderValue::from_str(&wait.as_secs_f64().ceil().to_string()) {
                response.headers_mut().insert("Retry-After", header);
            }
            apply_headers(&mut response, 0, limit, &std::collections::HashMap::new());
            response
        }
        Err(err) => {
            // Fail-open: the limiter malfunctioning never denies a request.
            tracing::error!(key = %key, error = %err, "rate limiter store error, failing open");
            next.run(req).await
        }
    }
}

fn apply_headers(
    response: &mut Response,
    remaining: u32,
    limit: u32,
    metadata: &std::collections::HashMap<String, String>,
) {
    let headers = response.headers_mut();
    if let Ok(v) = HeaderValue::from_str(&limit.to_string()) {
        headers.insert("X-RateLimit-Limit", v);
    }
    if let Ok(v) = HeaderValue::from_str(&remaining.to_string()) {
        headers.insert("X-RateLimit-Remaining", v);
    }
    if let Some(reset_at_ms) = metadata.get("reset_at_ms") {
        if let Ok(v) = HeaderValue::from_str(reset_at_ms) {
            headers.insert("X-RateLimit-Reset", v);
        }
    }
}
