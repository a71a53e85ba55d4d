//! Dispatcher (C6): priority-bucketed queue and retry engine. Owns the
//! notification lifecycle end to end — accepts requests, selects batches for
//! the Channel Router, interprets routing outcomes into the next state, and
//! ages completed work out of memory.

pub mod stats;

use crate::model::{
    now_ms, Channel, Notification, NotificationRequest, NotificationStatus, Priority,
};
use crate::router::ChannelRouter;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::telemetry::{emit_best_effort, DispatchEvent, Sink};
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

pub use stats::{DispatcherSnapshot, DispatcherStats};

/// Retry delay is capped regardless of how many attempts have accumulated,
/// so a misconfigured backoff multiplier can't push a retry out for hours.
const MAX_RETRY_DELAY_MS: u64 = 5 * 60 * 1000;

#[derive(Debug, thiserror::Error)]
pub enum DispatcherError {
    #[error("queue full (max {0})")]
    QueueFull(usize),
    #[error("queue closed, no longer accepting notifications")]
    QueueClosed,
    #[error("invalid notification: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Drain Critical before Urgent before High, and so on; FIFO within a
    /// priority.
    Priority,
    /// Visit each priority bucket in turn so lower priorities aren't starved
    /// under sustained high-priority load.
    RoundRobin,
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub max_size: usize,
    pub batch_size: usize,
    pub mode: DispatchMode,
    pub max_concurrency: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self { max_size: 100_000, batch_size: 50, mode: DispatchMode::Priority, max_concurrency: 32 }
    }
}

pub(crate) fn priority_index(p: Priority) -> usize {
    match p {
        Priority::Critical => 0,
        Priority::Urgent => 1,
        Priority::High => 2,
        Priority::Normal => 3,
        Priority::Low => 4,
    }
}

#[derive(Clone, Copy)]
enum Location {
    Queued(Priority),
    InFlight,
    Completed,
}

/// Filters accepted by [`Dispatcher::list`].
#[derive(Debug, Clone, Default)]
pub struct NotificationFilters {
    pub tenant_id: Option<String>,
    pub status: Option<NotificationStatus>,
    pub channel: Option<Channel>,
    pub from_ms: Option<u64>,
    pub to_ms: Option<u64>,
}

impl NotificationFilters {
    fn matches(&self, n: &Notification) -> bool {
        if let Some(tenant_id) = &self.tenant_id {
            if &n.tenant_id != tenant_id {
                return false;
            }
        }
        if let Some(status) = self.status {
            if n.status != status {
                return false;
            }
        }
        if let Some(channel) = self.channel {
            if !n.channels.contains(&channel) {
                return false;
            }
        }
        if let Some(from) = self.from_ms {
            if n.created_at_ms < from {
                return false;
            }
        }
        if let Some(to) = self.to_ms {
            if n.created_at_ms > to {
                return false;
            }
        }
        true
    }
}

/// Exactly-at `expires_at_ms` counts as expired, not merely past it.
fn is_expired(n: &Notification, now: u64) -> bool {
    n.scheduling.expires_at_ms.is_some_and(|exp| now >= exp)
}

fn not_yet_due(n: &Notification, now: u64) -> bool {
    n.scheduling.send_at_ms.is_some_and(|at| now < at)
}

/// `base × multiplier^(attempts-1)`, capped at [`MAX_RETRY_DELAY_MS`].
fn retry_delay_for(base_delay_ms: u64, backoff_multiplier: f64, attempts: u32) -> Duration {
    let factor = backoff_multiplier.powi(attempts.saturating_sub(1) as i32);
    let millis = (base_delay_ms as f64 * factor).min(MAX_RETRY_DELAY_MS as f64);
    Duration::from_millis(millis as u64)
}

/// Priority-bucketed FIFO queue, retry engine, and lifecycle tracker for
/// queued notifications. Generic over [`Sleeper`] purely to match the
/// [`ChannelRouter`] it wraps; production code uses the default
/// [`TokioSleeper`].
pub struct Dispatcher<S: Sleeper = TokioSleeper> {
    buckets: [Mutex<VecDeque<Notification>>; 5],
    index: DashMap<String, Location>,
    in_flight: DashMap<String, Notification>,
    completed: DashMap<String, Notification>,
    router: Arc<ChannelRouter<S>>,
    sink: Option<Arc<dyn Sink<DispatchEvent> + Send + Sync>>,
    config: DispatcherConfig,
    closed: AtomicBool,
    rr_cursor: AtomicUsize,
    stats: DispatcherStats,
}

impl<S: Sleeper> Dispatcher<S> {
    pub fn new(
        router: Arc<ChannelRouter<S>>,
        config: DispatcherConfig,
        sink: Option<Arc<dyn Sink<DispatchEvent> + Send + Sync>>,
    ) -> Self {
        Self {
            buckets: std::array::from_fn(|_| Mutex::new(VecDeque::new())),
            index: DashMap::new(),
            in_flight: DashMap::new(),
            completed: DashMap::new(),
            router,
            sink,
            config,
            closed: AtomicBool::new(false),
            rr_cursor: AtomicUsize::new(0),
            stats: DispatcherStats::default(),
        }
    }

    fn queued_count(&self) -> usize {
        self.buckets.iter().map(|b| b.lock().expect("bucket lock poisoned").len()).sum()
    }

    /// Total notifications tracked anywhere: queued, in flight, or completed
    /// but not yet aged out.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn enqueue(&self, request: NotificationRequest) -> Result<String, DispatcherError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DispatcherError::QueueClosed);
        }
        if request.channels.is_empty() {
            return Err(DispatcherError::Invalid("channel set must not be empty".to_string()));
        }
        if self.queued_count() >= self.config.max_size {
            return Err(DispatcherError::QueueFull(self.config.max_size));
        }
        let delivery_policy = request.delivery_policy.unwrap_or_default();
        if delivery_policy.max_attempts == 0 {
            return Err(DispatcherError::Invalid("max_attempts must be greater than zero".to_string()));
        }

        let id = Uuid::new_v4().to_string();
        let now = now_ms();
        let priority = request.priority;
        let notification = Notification {
            id: id.clone(),
            tenant_id: request.tenant_id,
            site_id: request.site_id,
            user_id: request.user_id,
            priority,
            channels: request.channels,
            payload: request.payload,
            targeting: request.targeting,
            scheduling: request.scheduling,
            delivery_policy,
            metadata: request.metadata,
            created_at_ms: now,
            updated_at_ms: now,
            status: NotificationStatus::Pending,
            attempts: 0,
            last_attempt_ms: None,
            last_error: None,
            delivered_channels: Default::default(),
            failed_channels: Default::default(),
            retry_at_ms: None,
        };

        self.buckets[priority_index(priority)].lock().expect("bucket lock poisoned").push_back(notification);
        self.index.insert(id.clone(), Location::Queued(priority));
        self.stats.record_enqueued(priority);
        emit_best_effort(&self.sink, DispatchEvent::Enqueued { notification_id: id.clone(), priority: priority as u8 })
            .await;
        Ok(id)
    }

    /// Removes a still-pending notification. Returns `false` for anything
    /// in flight, already completed, or unknown.
    pub async fn cancel(&self, id: &str) -> bool {
        let Some(Location::Queued(priority)) = self.index.get(id).map(|e| *e.value()) else {
            return false;
        };
        let removed = {
            let mut bucket = self.buckets[priority_index(priority)].lock().expect("bucket lock poisoned");
            bucket.iter().position(|n| n.id == id).map(|pos| bucket.remove(pos))
        };
        if removed.is_some() {
            self.index.remove(id);
            self.stats.record_cancelled();
            emit_best_effort(&self.sink, DispatchEvent::Cancelled { notification_id: id.to_string() }).await;
            true
        } else {
            false
        }
    }

    pub fn status(&self, id: &str) -> Option<NotificationStatus> {
        if let Some(n) = self.in_flight.get(id) {
            return Some(n.status);
        }
        if let Some(n) = self.completed.get(id) {
            return Some(n.status);
        }
        self.buckets.iter().find_map(|b| {
            b.lock().expect("bucket lock poisoned").iter().find(|n| n.id == id).map(|n| n.status)
        })
    }

    pub fn get(&self, id: &str) -> Option<Notification> {
        if let Some(n) = self.in_flight.get(id) {
            return Some(n.clone());
        }
        if let Some(n) = self.completed.get(id) {
            return Some(n.clone());
        }
        self.buckets
            .iter()
            .find_map(|b| b.lock().expect("bucket lock poisoned").iter().find(|n| n.id == id).cloned())
    }

    pub fn stats(&self) -> DispatcherSnapshot {
        self.stats.snapshot()
    }

    /// Snapshot of every tracked notification (queued, in flight, or
    /// completed-but-not-yet-aged-out) matching `filters`, newest first,
    /// paginated by `limit`/`offset`.
    pub fn list(&self, filters: &NotificationFilters, limit: usize, offset: usize) -> Vec<Notification> {
        let mut all: Vec<Notification> = self
            .buckets
            .iter()
            .flat_map(|b| b.lock().expect("bucket lock poisoned").iter().cloned().collect::<Vec<_>>())
            .chain(self.in_flight.iter().map(|e| e.value().clone()))
            .chain(self.completed.iter().map(|e| e.value().clone()))
            .filter(|n| filters.matches(n))
            .collect();
        all.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms));
        all.into_iter().skip(offset).take(limit).collect()
    }

    async fn expire(&self, mut notification: Notification, now: u64) {
        notification.status = NotificationStatus::Expired;
        notification.updated_at_ms = now;
        let id = notification.id.clone();
        self.completed.insert(id.clone(), notification);
        self.index.insert(id.clone(), Location::Completed);
        self.stats.record_expired();
        emit_best_effort(&self.sink, DispatchEvent::Expired { notification_id: id }).await;
    }

    async fn select_batch(&self) -> Vec<Notification> {
        match self.config.mode {
            DispatchMode::Priority => self.select_batch_priority().await,
            DispatchMode::RoundRobin => self.select_batch_round_robin().await,
        }
    }

    async fn select_batch_priority(&self) -> Vec<Notification> {
        let mut batch = Vec::with_capacity(self.config.batch_size);
        let now = now_ms();

        'priorities: for priority in Priority::dispatch_order() {
            let idx = priority_index(priority);
            loop {
                if batch.len() >= self.config.batch_size {
                    break 'priorities;
                }
                let Some(mut notification) = self.buckets[idx].lock().expect("bucket lock poisoned").pop_front()
                else {
                    break;
                };
                if is_expired(&notification, now) {
                    self.expire(notification, now).await;
                    continue;
                }
                if not_yet_due(&notification, now) {
                    self.buckets[idx].lock().expect("bucket lock poisoned").push_back(notification);
                    break;
                }
                notification.status = NotificationStatus::Processing;
                batch.push(notification);
            }
        }
        batch
    }

    async fn select_batch_round_robin(&self) -> Vec<Notification> {
        let mut batch = Vec::with_capacity(self.config.batch_size);
        let now = now_ms();
        let order = Priority::ALL;
        let n = order.len();
        let mut cursor = self.rr_cursor.load(Ordering::Relaxed);
        let mut empty_streak = 0usize;

        while batch.len() < self.config.batch_size && empty_streak < n {
            let priority = order[cursor % n];
            let idx = priority_index(priority);
            cursor = (cursor + 1) % n;

            let candidate = self.buckets[idx].lock().expect("bucket lock poisoned").pop_front();
            match candidate {
                None => empty_streak += 1,
                Some(mut notification) => {
                    empty_streak = 0;
                    if is_expired(&notification, now) {
                        self.expire(notification, now).await;
                        continue;
                    }
                    if not_yet_due(&notification, now) {
                        self.buckets[idx].lock().expect("bucket lock poisoned").push_back(notification);
                        continue;
                    }
                    notification.status = NotificationStatus::Processing;
                    batch.push(notification);
                }
            }
        }
        self.rr_cursor.store(cursor, Ordering::Relaxed);
        batch
    }

    async fn finish(&self, notification: Notification) {
        let id = notification.id.clone();
        self.in_flight.remove(&id);
        self.completed.insert(id.clone(), notification);
        self.index.insert(id, Location::Completed);
    }

    async fn process_one(&self, mut notification: Notification) {
        let dispatch_started = now_ms();
        notification.attempts += 1;
        notification.last_attempt_ms = Some(dispatch_started);
        notification.updated_at_ms = dispatch_started;
        let id = notification.id.clone();
        let attempt = notification.attempts;

        self.index.insert(id.clone(), Location::InFlight);
        self.in_flight.insert(id.clone(), notification.clone());
        emit_best_effort(&self.sink, DispatchEvent::Dispatched { notification_id: id.clone(), attempt }).await;

        let result = self.router.route(&notification).await;
        let now = now_ms();
        notification.delivered_channels.extend(result.delivered_channels.iter().copied());

        if result.failed_channels.is_empty() {
            notification.failed_channels.clear();
            notification.status = NotificationStatus::Delivered;
            notification.updated_at_ms = now;
            self.stats.record_delivered(now, now.saturating_sub(dispatch_started) as f64);
            self.finish(notification).await;
            emit_best_effort(&self.sink, DispatchEvent::Delivered { notification_id: id, attempt }).await;
            return;
        }

        notification.channels = result.failed_channels.clone();
        notification.failed_channels = result.failed_channels;
        notification.last_error = result.errors.values().next().cloned();

        if notification.attempts >= notification.delivery_policy.max_attempts {
            notification.status = NotificationStatus::Failed;
            notification.updated_at_ms = now;
            let error = notification.last_error.clone().unwrap_or_else(|| "delivery failed".to_string());
            self.stats.record_failed();
            self.finish(notification).await;
            emit_best_effort(&self.sink, DispatchEvent::Failed { notification_id: id, attempts: attempt, error })
                .await;
        } else {
            let delay = retry_delay_for(
                notification.delivery_policy.base_retry_delay_ms,
                notification.delivery_policy.backoff_multiplier,
                notification.attempts,
            );
            notification.status = NotificationStatus::Retrying;
            notification.retry_at_ms = Some(now + delay.as_millis() as u64);
            notification.updated_at_ms = now;
            self.stats.record_retrying();
            let next_delay_ms = delay.as_millis() as u64;
            self.finish(notification).await;
            emit_best_effort(&self.sink, DispatchEvent::Retrying { notification_id: id, attempt, next_delay_ms })
                .await;
        }
    }

    /// Pulls one batch and drives every member through the Channel Router,
    /// bounded by `max_concurrency` concurrent in-flight deliveries.
    pub async fn dispatch_tick(&self) {
        let batch = self.select_batch().await;
        if batch.is_empty() {
            return;
        }
        let max_concurrency = self.config.max_concurrency.max(1);
        stream::iter(batch).for_each_concurrent(max_concurrency, |n| self.process_one(n)).await;
    }

    /// Scans completed `Retrying` entries whose delay has elapsed and
    /// requeues them, or marks them `Failed` if attempts are exhausted.
    pub async fn retry_tick(&self) {
        let now = now_ms();
        let due: Vec<String> = self
            .completed
            .iter()
            .filter(|e| e.value().status == NotificationStatus::Retrying)
            .filter(|e| now >= e.value().retry_at_ms.unwrap_or(0))
            .map(|e| e.key().clone())
            .collect();

        for id in due {
            let Some((_, mut notification)) = self.completed.remove(&id) else { continue };
            if notification.attempts >= notification.delivery_policy.max_attempts {
                notification.status = NotificationStatus::Failed;
                notification.updated_at_ms = now_ms();
                let error = "max retries exceeded".to_string();
                notification.last_error = Some(error.clone());
                let attempts = notification.attempts;
                self.completed.insert(id.clone(), notification);
                self.index.insert(id.clone(), Location::Completed);
                self.stats.record_failed();
                emit_best_effort(&self.sink, DispatchEvent::Failed { notification_id: id, attempts, error }).await;
            } else {
                notification.status = NotificationStatus::Pending;
                notification.updated_at_ms = now_ms();
                let priority = notification.priority;
                self.buckets[priority_index(priority)].lock().expect("bucket lock poisoned").push_back(notification);
                self.index.insert(id, Location::Queued(priority));
            }
        }
    }

    /// Drops completed (terminal) entries older than `retention`. Returns
    /// the number of entries dropped.
    pub fn age_out_tick(&self, retention: Duration) -> usize {
        let cutoff = now_ms().saturating_sub(retention.as_millis() as u64);
        let stale: Vec<String> = self
            .completed
            .iter()
            .filter(|e| e.value().status.is_terminal())
            .filter(|e| e.value().updated_at_ms < cutoff)
            .map(|e| e.key().clone())
            .collect();
        for id in &stale {
            self.completed.remove(id);
            self.index.remove(id);
        }
        stale.len()
    }

    /// Stops accepting new work and waits (up to `deadline`) for in-flight
    /// deliveries to finish.
    pub async fn shutdown(&self, deadline: Duration) {
        self.closed.store(true, Ordering::SeqCst);
        let start = std::time::Instant::now();
        while !self.in_flight.is_empty() && start.elapsed() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl<S: Sleeper + 'static> Dispatcher<S> {
    pub fn spawn_processing_task(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if self.is_closed() {
                    break;
                }
                self.dispatch_tick().await;
            }
        })
    }

    pub fn spawn_retry_task(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if self.is_closed() {
                    break;
                }
                self.retry_tick().await;
            }
        })
    }

    pub fn spawn_age_out_task(self: Arc<Self>, interval: Duration, retention: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if self.is_closed() {
                    break;
                }
                let dropped = self.age_out_tick(retention);
                if dropped > 0 {
                    tracing::debug!(dropped, "dispatcher age-out sweep");
                }
            }
        })
    }
}
