//! Built-in rate limiting strategies.
//!
//! All four strategies share one idiom: read current state, compute the next
//! state, compare-and-set against the previously observed version, retry a
//! bounded number of times, and fall back to a store-contention denial if the
//! loop never lands. [`TokenBucket`] and [`LeakyBucket`] model state as a
//! single `(value, last_updated)` pair via [`TokenStore`]; [`FixedWindow`]
//! partitions storage by window index so expiry is implicit in the key;
//! [`SlidingWindow`] needs an ordered timestamp set and so uses [`WindowStore`]
//! instead, but follows the same read-compute-CAS-retry shape.

use crate::adaptive::Adaptive;
use crate::rate_limit::store::{TokenStore, WindowStore};
use crate::rate_limit::{Decision, RateLimiter};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const MAX_CAS_ATTEMPTS: usize = 3;

fn now_nanos() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos() as u64
}

fn contention_denial(limit: u32) -> Decision {
    Decision::Denied { wait: Duration::from_millis(100), limit, reason: "store_contention".into() }
}

/// A Token Bucket rate limiter.
///
/// Replenishes tokens at a fixed `rate` per second, up to `capacity`.
pub struct TokenBucket<S> {
    store: Arc<S>,
    bucket_key: String,
    rate: Adaptive<f64>,    // Tokens per second
    capacity: Adaptive<f64>, // Max tokens
}

impl<S> TokenBucket<S>
where
    S: TokenStore + Send + Sync + 'static,
{
    /// Create a new TokenBucket backed by `store`.
    pub fn new(store: S, key: impl Into<String>, rate: f64, capacity: f64) -> Self {
        Self {
            store: Arc::new(store),
            bucket_key: key.into(),
            rate: Adaptive::new(rate),
            capacity: Adaptive::new(capacity),
        }
    }
}

#[async_trait]
impl<S> RateLimiter for TokenBucket<S>
where
    S: TokenStore + Send + Sync + 'static,
{
    async fn acquire(&self, permits: u32) -> Result<Decision, Box<dyn std::error::Error + Send + Sync>> {
        let now = now_nanos();
        let cost = permits as f64;
        let rate = *self.rate.get();
        let capacity = *self.capacity.get();

        for _ in 0..MAX_CAS_ATTEMPTS {
            let (current_tokens, last_updated) = match self.store.get_state(&self.bucket_key).await? {
                Some((t, u)) => (t, u),
                None => (capacity, now),
            };

            let elapsed_secs = (now.saturating_sub(last_updated) as f64) / 1_000_000_000.0;
            let new_tokens = (current_tokens + (elapsed_secs * rate).floor()).min(capacity);

            if new_tokens >= cost {
                let final_tokens = new_tokens - cost;
                if self.store.set_state(&self.bucket_key, final_tokens, now, Some(last_updated)).await? {
                    return Ok(Decision::Allowed {
                        remaining: final_tokens as u32,
                        limit: capacity as u32,
                        metadata: reset_metadata(now + (1.0 / rate * 1_000_000_000.0) as u64),
                    });
                }
            } else {
                let missing = cost - new_tokens;
                let wait_secs = missing / rate;
                return Ok(Decision::Denied {
                    wait: Duration::from_secs_f64(wait_secs.max(0.0)),
                    limit: capacity as u32,
                    reason: "token_bucket_empty".into(),
                });
            }
        }

        Ok(contention_denial(capacity as u32))
    }
}

/// A Leaky Bucket rate limiter.
///
/// The bucket "leaks" at `leak_rate` per second; each admitted request adds
/// one unit to the level. Requests are denied once the level reaches
/// `bucket_size`.
pub struct LeakyBucket<S> {
    store: Arc<S>,
    key: String,
    leak_rate: Adaptive<f64>,
    bucket_size: Adaptive<f64>,
}

impl<S> LeakyBucket<S>
where
    S: TokenStore + Send + Sync + 'static,
{
    pub fn new(store: S, key: impl Into<String>, leak_rate: f64, bucket_size: f64) -> Self {
        Self {
            store: Arc::new(store),
            key: key.into(),
            leak_rate: Adaptive::new(leak_rate),
            bucket_size: Adaptive::new(bucket_size),
        }
    }
}

#[async_trait]
impl<S> RateLimiter for LeakyBucket<S>
where
    S: TokenStore + Send + Sync + 'static,
{
    async fn acquire(&self, _permits: u32) -> Result<Decision, Box<dyn std::error::Error + Send + Sync>> {
        let now = now_nanos();
        let leak_rate = *self.leak_rate.get();
        let bucket_size = *self.bucket_size.get();

        for _ in 0..MAX_CAS_ATTEMPTS {
            let (level, last_leak) = match self.store.get_state(&self.key).await? {
                Some((l, u)) => (l, u),
                None => (0.0, now),
            };

            let elapsed_secs = (now.saturating_sub(last_leak) as f64) / 1_000_000_000.0;
            let leaked = (elapsed_secs * leak_rate).floor();
            let level = (level - leaked).max(0.0);

            if level < bucket_size {
                let new_level = level + 1.0;
                if self.store.set_state(&self.key, new_level, now, Some(last_leak)).await? {
                    return Ok(Decision::Allowed {
                        remaining: (bucket_size - new_level) as u32,
                        limit: bucket_size as u32,
                        metadata: reset_metadata(now + (1.0 / leak_rate * 1_000_000_000.0) as u64),
                    });
                }
            } else {
                return Ok(Decision::Denied {
                    wait: Duration::from_secs_f64(1.0 / leak_rate),
                    limit: bucket_size as u32,
                    reason: "leaky_bucket_full".into(),
                });
            }
        }

        Ok(contention_denial(bucket_size as u32))
    }
}

/// A Fixed Window counter.
///
/// Storage is partitioned by `floor(now / window)`, so a window's count
/// expires naturally once the clock moves into the next window — no explicit
/// TTL bookkeeping is needed.
pub struct FixedWindow<S> {
    store: Arc<S>,
    key: String,
    limit: Adaptive<u32>,
    window: Duration,
}

impl<S> FixedWindow<S>
where
    S: TokenStore + Send + Sync + 'static,
{
    pub fn new(store: S, key: impl Into<String>, limit: u32, window: Duration) -> Self {
        Self { store: Arc::new(store), key: key.into(), limit: Adaptive::new(limit), window }
    }

    fn window_key(&self, now: u64) -> String {
        let window_nanos = self.window.as_nanos().max(1) as u64;
        let index = now / window_nanos;
        format!("ratelimit:fixed:{}:{}", self.key, index)
    }
}

#[async_trait]
impl<S> RateLimiter for FixedWindow<S>
where
    S: TokenStore + Send + Sync + 'static,
{
    async fn acquire(&self, permits: u32) -> Result<Decision, Box<dyn std::error::Error + Send + Sync>> {
        let now = now_nanos();
        let limit = *self.limit.get() as f64;
        let storage_key = self.window_key(now);
        let window_nanos = self.window.as_nanos().max(1) as u64;
        let window_start = (now / window_nanos) * window_nanos;
        let reset_at = window_start + window_nanos;

        for _ in 0..MAX_CAS_ATTEMPTS {
            let (count, prev_updated) = match self.store.get_state(&storage_key).await? {
                Some((c, u)) => (c, Some(u)),
                None => (0.0, None),
            };

            let new_count = count + permits as f64;

            if self.store.set_state(&storage_key, new_count, now, prev_updated).await? {
                if new_count <= limit {
                    return Ok(Decision::Allowed {
                        remaining: (limit - new_count).max(0.0) as u32,
                        limit: limit as u32,
                        metadata: reset_metadata(reset_at),
                    });
                }
                return Ok(Decision::Denied {
                    wait: Duration::from_nanos(reset_at.saturating_sub(now)),
                    limit: limit as u32,
                    reason: "fixed_window_exceeded".into(),
                });
            }
        }

        Ok(contention_denial(limit as u32))
    }
}

/// A Sliding Window counter.
///
/// Maintains an ordered set of admission timestamps per key; each check
/// evicts entries older than `window` before counting.
pub struct SlidingWindow<S> {
    store: Arc<S>,
    key: String,
    limit: Adaptive<u32>,
    window: Duration,
}

impl<S> SlidingWindow<S>
where
    S: WindowStore + Send + Sync + 'static,
{
    pub fn new(store: S, key: impl Into<String>, limit: u32, window: Duration) -> Self {
        Self { store: Arc::new(store), key: key.into(), limit: Adaptive::new(limit), window }
    }
}

#[async_trait]
impl<S> RateLimiter for SlidingWindow<S>
where
    S: WindowStore + Send + Sync + 'static,
{
    async fn acquire(&self, _permits: u32) -> Result<Decision, Box<dyn std::error::Error + Send + Sync>> {
        let now = now_nanos();
        let limit = *self.limit.get() as usize;
        let window_nanos = self.window.as_nanos() as u64;
        let cutoff = now.saturating_sub(window_nanos);

        for _ in 0..MAX_CAS_ATTEMPTS {
            let (timestamps, generation) = self.store.get_window(&self.key).await?;
            let mut survivors: Vec<u64> = timestamps.into_iter().filter(|&ts| ts > cutoff).collect();
            let stored_count = survivors.len();

            if stored_count < limit {
                survivors.push(now);
                if self.store.set_window(&self.key, survivors, generation).await? {
                    return Ok(Decision::Allowed {
                        remaining: (limit - stored_count - 1) as u32,
                        limit: limit as u32,
                        metadata: reset_metadata(now + window_nanos),
                    });
                }
                // Lost the race; retry with fresh state.
            } else {
                return Ok(Decision::Denied {
                    wait: Duration::from_nanos(window_nanos),
                    limit: limit as u32,
                    reason: "sliding_window_exceeded".into(),
                });
            }
        }

        Ok(contention_denial(limit as u32))
    }
}

fn reset_metadata(reset_at_nanos: u64) -> HashMap<String, String> {
    let mut metadata = HashMap::new();
    metadata.insert("reset_at_ms".into(), (reset_at_nanos / 1_000_000).to_string());
    metadata
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::store::{InMemoryTokenStore, InMemoryWindowStore};

    #[tokio::test]
    async fn token_bucket_allows_then_denies() {
        let limiter = TokenBucket::new(InMemoryTokenStore::new(), "k", 1.0, 2.0);
        assert!(limiter.acquire(1).await.unwrap().is_allowed());
        assert!(limiter.acquire(1).await.unwrap().is_allowed());
        assert!(!limiter.acquire(1).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn leaky_bucket_allows_then_denies() {
        let limiter = LeakyBucket::new(InMemoryTokenStore::new(), "k", 1.0, 2.0);
        assert!(limiter.acquire(1).await.unwrap().is_allowed());
        assert!(limiter.acquire(1).await.unwrap().is_allowed());
        assert!(!limiter.acquire(1).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn fixed_window_enforces_limit() {
        let limiter = FixedWindow::new(InMemoryTokenStore::new(), "k", 2, Duration::from_secs(60));
        assert!(limiter.acquire(1).await.unwrap().is_allowed());
        assert!(limiter.acquire(1).await.unwrap().is_allowed());
        assert!(!limiter.acquire(1).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn sliding_window_enforces_limit() {
        let limiter = SlidingWindow::new(InMemoryWindowStore::new(), "k", 2, Duration::from_secs(60));
        assert!(limiter.acquire(1).await.unwrap().is_allowed());
        assert!(limiter.acquire(1).await.unwrap().is_allowed());
        assert!(!limiter.acquire(1).await.unwrap().is_allowed());
    }
}
