//! Route registration and layering. One [`build_router`] wires every group
//! of handlers onto a shared [`AppState`] and applies the cross-cutting
//! middleware (ingress rate limiting, CORS, request tracing).

pub mod health;
pub mod notifications;
pub mod realtime;
pub mod tracking;

use std::sync::Arc;

use axum::middleware;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use notifyhub::rate_limit::middleware::{rate_limit_middleware, RateLimitState};
use notifyhub::rate_limit::store::InMemoryTokenStore;
use notifyhub::rate_limit::strategies::TokenBucket;
use notifyhub::rate_limit::RateLimiter;

use crate::state::AppState;

/// Ingress-wide request cap, independent of the per-channel rate limits the
/// processors enforce downstream. This one guards the HTTP boundary itself;
/// `KeyedLimiters` inside each processor guards the outbound transport.
fn ingress_rate_limit_state() -> RateLimitState {
    let limiter: Arc<dyn RateLimiter> =
        Arc::new(TokenBucket::new(InMemoryTokenStore::new(), "ingress", 200.0, 400.0));
    RateLimitState::new(limiter)
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(health::router())
        .merge(realtime::router())
        .merge(notifications::router())
        .merge(tracking::router())
        .layer(middleware::from_fn_with_state(ingress_rate_limit_state(), rate_limit_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
