use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Abstract storage interface for rate limit state expressible as one numeric
/// value plus a timestamp: token bucket tokens, leaky bucket level, or a
/// fixed-window counter alongside its window-start.
///
/// This trait is designed to support both in-memory and distributed backends.
#[async_trait]
pub trait TokenStore: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Fetch the current state for a key. Returns `(value, last_updated_nanos)`.
    async fn get_state(&self, key: &str) -> Result<Option<(f64, u64)>, Self::Error>;

    /// Update the state for a key using a compare-and-set semantic.
    ///
    /// * `prev_updated_at`: the previous timestamp read (optimistic locking).
    ///   `None` implies unconditional write (first write for this key).
    ///
    /// Returns `Ok(true)` if the update succeeded, `Ok(false)` if a race was
    /// detected (caller should retry from `get_state`).
    async fn set_state(
        &self,
        key: &str,
        value: f64,
        updated_at: u64,
        prev_updated_at: Option<u64>,
    ) -> Result<bool, Self::Error>;
}

/// Simple in-memory token store keyed by string.
#[derive(Default, Clone, Debug)]
pub struct InMemoryTokenStore {
    data: Arc<Mutex<HashMap<String, (f64, u64)>>>,
}

impl InMemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    type Error = std::convert::Infallible;

    async fn get_state(&self, key: &str) -> Result<Option<(f64, u64)>, Self::Error> {
        let guard = self.data.lock().unwrap_or_else(|p| p.into_inner());
        Ok(guard.get(key).copied())
    }

    async fn set_state(
        &self,
        key: &str,
        value: f64,
        updated_at: u64,
        prev_updated_at: Option<u64>,
    ) -> Result<bool, Self::Error> {
        let mut guard = self.data.lock().unwrap_or_else(|p| p.into_inner());

        if let Some(prev) = prev_updated_at {
            match guard.get(key) {
                Some(&(_, current_ts)) if current_ts != prev => return Ok(false),
                None => return Ok(false),
                _ => {}
            }
        } else if guard.contains_key(key) {
            return Ok(false);
        }

        guard.insert(key.to_string(), (value, updated_at));
        Ok(true)
    }
}

/// Storage for the sliding-window strategy, which needs a per-key ordered set
/// of timestamps rather than a single numeric value. Uses the same
/// optimistic-CAS discipline as [`TokenStore`]: read a generation, compute the
/// next set, write conditioned on the generation being unchanged.
#[async_trait]
pub trait WindowStore: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Fetch the current timestamps for a key and an opaque generation token.
    async fn get_window(&self, key: &str) -> Result<(Vec<u64>, u64), Self::Error>;

    /// Replace the timestamps for a key, conditioned on the generation
    /// observed by the matching `get_window` call. Returns `Ok(true)` on
    /// success, `Ok(false)` if the generation no longer matches (retry).
    async fn set_window(
        &self,
        key: &str,
        timestamps: Vec<u64>,
        prev_generation: u64,
    ) -> Result<bool, Self::Error>;
}

#[derive(Default, Clone, Debug)]
pub struct InMemoryWindowStore {
    data: Arc<Mutex<HashMap<String, (Vec<u64>, u64)>>>,
}

impl InMemoryWindowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WindowStore for InMemoryWindowStore {
    type Error = std::convert::Infallible;

    async fn get_window(&self, key: &str) -> Result<(Vec<u64>, u64), Self::Error> {
        let guard = self.data.lock().unwrap_or_else(|p| p.into_inner());
        Ok(guard.get(key).cloned().unwrap_or_else(|| (Vec::new(), 0)))
    }

    async fn set_window(
        &self,
        key: &str,
        timestamps: Vec<u64>,
        prev_generation: u64,
    ) -> Result<bool, Self::Error> {
        let mut guard = self.data.lock().unwrap_or_else(|p| p.into_inner());
        let current_generation = guard.get(key).map(|(_, g)| *g).unwrap_or(0);
        if current_generation != prev_generation {
            return Ok(false);
        }
        guard.insert(key.to_string(), (timestamps, prev_generation + 1));
        Ok(true)
    }
}
