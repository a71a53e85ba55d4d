//! Rate limiting primitives.
//!
//! This module provides the building blocks for rate limiting:
//! - [`RateLimiter`]: The core trait for rate limiting logic.
//! - [`rate_limit_middleware`](middleware::rate_limit_middleware): axum middleware enforcing it.
//! - [`Decision`]: The result of a rate limit check (Allowed/Denied).
//!
//! # Architecture
//!
//! The system is designed to be modular:
//! - **Middleware**: `rate_limit_middleware` wraps an axum router. It doesn't know *how*
//!   limiting works, only that it should ask a `RateLimiter`.
//! - **Logic**: Implementations in `strategies` (token bucket, leaky bucket, fixed window,
//!   sliding window) handle the math.
//! - **Storage**: `TokenStore`/`WindowStore` (in `store` module) handle the state, enabling
//!   in-memory or distributed backends.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub mod middleware;
pub mod store;
pub mod strategies;
pub use middleware::{rate_limit_middleware, RateLimitState};

/// The decision returned by a rate limiter.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// The request is allowed to proceed.
    Allowed {
        /// Number of permits remaining after this acquisition.
        /// Useful for `X-RateLimit-Remaining` headers.
        remaining: u32,
        /// The configured ceiling this decision was evaluated against.
        /// Useful for `X-RateLimit-Limit` headers.
        limit: u32,
        /// Optional metadata (e.g., "reset time", "tier").
        metadata: HashMap<String, String>,
    },
    /// The request is denied.
    Denied {
        /// How long the caller should wait before retrying.
        /// Useful for `Retry-After` headers.
        wait: Duration,
        /// The configured ceiling this decision was evaluated against.
        /// Useful for `X-RateLimit-Limit` headers.
        limit: u32,
        /// Reason for denial (e.g., "global_limit", "user_limit").
        reason: String,
    },
}

impl Decision {
    /// Helper to check if allowed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }
}

/// Core interface for rate limiting logic.
///
/// This trait allows decoupling the middleware from the implementation (Token Bucket,
/// Leaky Bucket, Fixed Window) and the storage (Memory, Redis).
#[async_trait::async_trait]
pub trait RateLimiter: Send + Sync {
    /// Attempt to acquire the specified number of permits.
    async fn acquire(&self, permits: u32) -> Result<Decision, Box<dyn std::error::Error + Send + Sync>>;
}

/// Lazily instantiates and caches one [`RateLimiter`] per bucket identity
/// (`<scope>:<identity>`, e.g. `push:<tenant>`). Each channel processor and
/// the ingress middleware share this rather than each hand-rolling a keyed
/// map over raw strategy structs.
pub struct KeyedLimiters {
    limiters: dashmap::DashMap<String, Arc<dyn RateLimiter>>,
    factory: Box<dyn Fn(&str) -> Arc<dyn RateLimiter> + Send + Sync>,
}

impl KeyedLimiters {
    pub fn new(factory: impl Fn(&str) -> Arc<dyn RateLimiter> + Send + Sync + 'static) -> Self {
        Self { limiters: dashmap::DashMap::new(), factory: Box::new(factory) }
    }

    pub fn get_or_create(&self, key: &str) -> Arc<dyn RateLimiter> {
        self.limiters.entry(key.to_string()).or_insert_with(|| (self.factory)(key)).clone()
    }

    /// Fail-open: a storage error from the underlying limiter is logged once
    /// and treated as allowed, matching the middleware's fail-open policy.
    pub async fn check(&self, key: &str, permits: u32) -> Decision {
        let limiter = self.get_or_create(key);
        match limiter.acquire(permits).await {
            Ok(decision) => decision,
            Err(e) => {
                tracing::error!(key, error = %e, "rate limiter store error, failing open");
                Decision::Allowed { remaining: u32::MAX, limit: u32::MAX, metadata: HashMap::new() }
            }
        }
    }
}

#[cfg(test)]
mod keyed_tests {
    use super::*;

    struct AlwaysDeny;

    #[async_trait::async_trait]
    impl RateLimiter for AlwaysDeny {
        async fn acquire(&self, _permits: u32) -> Result<Decision, Box<dyn std::error::Error + Send + Sync>> {
            Ok(Decision::Denied { wait: Duration::from_secs(1), limit: 0, reason: "always".into() })
        }
    }

    #[tokio::test]
    async fn reuses_limiter_per_key() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let keyed = KeyedLimiters::new(move |_key| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            Arc::new(AlwaysDeny) as Arc<dyn RateLimiter>
        });

        keyed.check("email:acme", 1).await;
        keyed.check("email:acme", 1).await;
        keyed.check("push:acme", 1).await;

        assert_eq!(calls.load(Ordering::SeqCst), 2, "one limiter per distinct key");
    }
}
