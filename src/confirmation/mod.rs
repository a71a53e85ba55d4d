//! Delivery Confirmation Store: append-only status-transition log with
//! batched flushing, an age-based retention sweeper, and analytics roll-ups.

mod analytics;

pub use analytics::ConfirmationAnalytics;

use crate::model::{now_ms, Channel, ConfirmationMetadata, ConfirmationStatus, DeliveryConfirmation};
use crate::telemetry::{emit_best_effort, ConfirmationEvent, Sink};
use dashmap::DashMap;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ConfirmationError {
    #[error("unknown notification id: {0}")]
    UnknownNotification(String),
    #[error("pending batch is at capacity ({0})")]
    BatchFull(usize),
}

/// Filters accepted by [`ConfirmationStore::get_for_tenant`].
#[derive(Debug, Clone, Default)]
pub struct ConfirmationFilters {
    pub channel: Option<Channel>,
    pub status: Option<ConfirmationStatus>,
    pub from_ms: Option<u64>,
    pub to_ms: Option<u64>,
}

impl ConfirmationFilters {
    fn matches(&self, c: &DeliveryConfirmation) -> bool {
        if let Some(channel) = self.channel {
            if c.channel != channel {
                return false;
            }
        }
        if let Some(status) = self.status {
            if c.status != status {
                return false;
            }
        }
        if let Some(from) = self.from_ms {
            if c.timestamp_ms < from {
                return false;
            }
        }
        if let Some(to) = self.to_ms {
            if c.timestamp_ms > to {
                return false;
            }
        }
        true
    }
}

struct Inner {
    /// Append-only log, insertion order. Source of truth for analytics/retention.
    log: Mutex<VecDeque<DeliveryConfirmation>>,
    /// Secondary index: notification id -> confirmation ids, for O(1) lookup.
    by_notification: DashMap<String, Vec<String>>,
    by_id: DashMap<String, DeliveryConfirmation>,
    pending: Mutex<Vec<DeliveryConfirmation>>,
    max_pending: usize,
    flushed_total: AtomicU64,
    sink: Option<Arc<dyn Sink<ConfirmationEvent> + Send + Sync>>,
}

#[derive(Clone)]
pub struct ConfirmationStore {
    inner: Arc<Inner>,
}

impl ConfirmationStore {
    pub fn new(max_pending: usize) -> Self {
        Self::with_sink(max_pending, None)
    }

    pub fn with_sink(
        max_pending: usize,
        sink: Option<Arc<dyn Sink<ConfirmationEvent> + Send + Sync>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                log: Mutex::new(VecDeque::new()),
                by_notification: DashMap::new(),
                by_id: DashMap::new(),
                pending: Mutex::new(Vec::new()),
                max_pending,
                flushed_total: AtomicU64::new(0),
                sink,
            }),
        }
    }

    /// Records a confirmation. Confirmations are append-only: no call ever
    /// rewrites a prior record.
    pub fn record(
        &self,
        notification_id: impl Into<String>,
        tenant_id: impl Into<String>,
        channel: Channel,
        status: ConfirmationStatus,
        metadata: ConfirmationMetadata,
    ) -> Result<String, ConfirmationError> {
        let notification_id = notification_id.into();
        let confirmation = DeliveryConfirmation {
            id: Uuid::new_v4().to_string(),
            notification_id: notification_id.clone(),
            tenant_id: tenant_id.into(),
            channel,
            status,
            timestamp_ms: now_ms(),
            metadata,
        };

        {
            let mut pending = self.inner.pending.lock().expect("pending lock poisoned");
            if pending.len() >= self.inner.max_pending {
                // Oldest overflow dropped; the log itself is unbounded-by-design
                // within retention, only the pending flush buffer is capped.
                pending.remove(0);
            }
            pending.push(confirmation.clone());
        }

        self.inner
            .by_notification
            .entry(notification_id)
            .or_default()
            .push(confirmation.id.clone());
        self.inner.by_id.insert(confirmation.id.clone(), confirmation.clone());
        self.inner.log.lock().expect("log lock poisoned").push_back(confirmation.clone());

        Ok(confirmation.id)
    }

    pub fn record_sent(&self, notification_id: impl Into<String>, tenant_id: impl Into<String>, channel: Channel) -> Result<String, ConfirmationError> {
        self.record(notification_id, tenant_id, channel, ConfirmationStatus::Sent, ConfirmationMetadata::default())
    }

    pub fn record_delivered(&self, notification_id: impl Into<String>, tenant_id: impl Into<String>, channel: Channel) -> Result<String, ConfirmationError> {
        self.record(notification_id, tenant_id, channel, ConfirmationStatus::Delivered, ConfirmationMetadata::default())
    }

    pub fn record_failed(
        &self,
        notification_id: impl Into<String>,
        tenant_id: impl Into<String>,
        channel: Channel,
        error_text: impl Into<String>,
    ) -> Result<String, ConfirmationError> {
        let meta = ConfirmationMetadata { error_text: Some(error_text.into()), ..Default::default() };
        self.record(notification_id, tenant_id, channel, ConfirmationStatus::Failed, meta)
    }

    pub fn record_read(
        &self,
        notification_id: impl Into<String>,
        tenant_id: impl Into<String>,
        channel: Channel,
        user_agent: Option<String>,
    ) -> Result<String, ConfirmationError> {
        let meta = ConfirmationMetadata { user_agent, ..Default::default() };
        self.record(notification_id, tenant_id, channel, ConfirmationStatus::Read, meta)
    }

    pub fn record_clicked(
        &self,
        notification_id: impl Into<String>,
        tenant_id: impl Into<String>,
        channel: Channel,
        user_agent: Option<String>,
        clicked_url: Option<String>,
    ) -> Result<String, ConfirmationError> {
        let meta = ConfirmationMetadata { user_agent, clicked_url, ..Default::default() };
        self.record(notification_id, tenant_id, channel, ConfirmationStatus::Clicked, meta)
    }

    pub fn record_bounced(
        &self,
        notification_id: impl Into<String>,
        tenant_id: impl Into<String>,
        channel: Channel,
        error_text: impl Into<String>,
    ) -> Result<String, ConfirmationError> {
        let meta = ConfirmationMetadata { error_text: Some(error_text.into()), ..Default::default() };
        self.record(notification_id, tenant_id, channel, ConfirmationStatus::Bounced, meta)
    }

    pub fn record_unsubscribed(
        &self,
        notification_id: impl Into<String>,
        tenant_id: impl Into<String>,
        channel: Channel,
    ) -> Result<String, ConfirmationError> {
        self.record(notification_id, tenant_id, channel, ConfirmationStatus::Unsubscribed, ConfirmationMetadata::default())
    }

    pub fn get_for_notification(&self, notification_id: &str) -> Vec<DeliveryConfirmation> {
        self.inner
            .by_notification
            .get(notification_id)
            .map(|ids| {
                ids.iter().filter_map(|id| self.inner.by_id.get(id).map(|e| e.value().clone())).collect()
            })
            .unwrap_or_default()
    }

    pub fn get_for_tenant(&self, tenant_id: &str, filters: &ConfirmationFilters) -> Vec<DeliveryConfirmation> {
        self.inner
            .log
            .lock()
            .expect("log lock poisoned")
            .iter()
            .filter(|c| c.tenant_id == tenant_id && filters.matches(c))
            .cloned()
            .collect()
    }

    /// The latest recorded status per channel for a notification.
    pub fn aggregate_status(&self, notification_id: &str) -> HashMap<Channel, ConfirmationStatus> {
        let mut out = HashMap::new();
        for confirmation in self.get_for_notification(notification_id) {
            out.insert(confirmation.channel, confirmation.status);
        }
        out
    }

    /// Opaque tracking-pixel URL; fetching it records a `Read` confirmation
    /// and (by convention of the caller) serves a 1x1 transparent pixel.
    pub fn tracking_pixel_url(&self, base_url: &str, notification_id: &str, channel: Channel) -> String {
        format!("{base_url}/track/pixel/{notification_id}/{channel}")
    }

    /// Opaque click-tracking URL; fetching it records a `Clicked` confirmation
    /// then redirects to `target_url`.
    pub fn click_tracking_url(&self, base_url: &str, notification_id: &str, channel: Channel, target_url: &str) -> String {
        let encoded = urlencoding_lite(target_url);
        format!("{base_url}/track/click/{notification_id}/{channel}?to={encoded}")
    }

    pub fn analytics(&self, tenant_id: &str, from_ms: u64, to_ms: u64) -> ConfirmationAnalytics {
        let filters = ConfirmationFilters { from_ms: Some(from_ms), to_ms: Some(to_ms), ..Default::default() };
        let records = self.get_for_tenant(tenant_id, &filters);
        ConfirmationAnalytics::compute(&records)
    }

    /// Flushes the pending batch, calling `persist` with the drained records.
    /// On `persist` error, records are prepended back so nothing is lost.
    pub async fn flush<F, Fut, E>(&self, persist: F) -> Result<usize, E>
    where
        F: FnOnce(Vec<DeliveryConfirmation>) -> Fut,
        Fut: std::future::Future<Output = Result<(), E>>,
    {
        let batch = {
            let mut pending = self.inner.pending.lock().expect("pending lock poisoned");
            std::mem::take(&mut *pending)
        };
        if batch.is_empty() {
            return Ok(0);
        }
        let count = batch.len();
        match persist(batch.clone()).await {
            Ok(()) => {
                self.inner.flushed_total.fetch_add(count as u64, Ordering::Relaxed);
                emit_best_effort(&self.inner.sink, ConfirmationEvent::BatchFlushed { count, flushed_at_ms: now_ms() })
                    .await;
                Ok(count)
            }
            Err(e) => {
                let mut pending = self.inner.pending.lock().expect("pending lock poisoned");
                let mut restored = batch;
                restored.append(&mut pending);
                *pending = restored;
                Err(e)
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().expect("pending lock poisoned").len()
    }

    pub fn flushed_total(&self) -> u64 {
        self.inner.flushed_total.load(Ordering::Relaxed)
    }

    /// Drops confirmations older than `retention`. Intended to run on a
    /// periodic tick via [`spawn_retention_task`].
    pub fn sweep_retention(&self, retention: Duration) -> usize {
        let cutoff = now_ms().saturating_sub(retention.as_millis() as u64);
        let mut log = self.inner.log.lock().expect("log lock poisoned");
        let mut dropped = 0;
        while let Some(front) = log.front() {
            if front.timestamp_ms < cutoff {
                let removed = log.pop_front().unwrap();
                self.inner.by_id.remove(&removed.id);
                if let Some(mut ids) = self.inner.by_notification.get_mut(&removed.notification_id) {
                    ids.retain(|id| id != &removed.id);
                }
                dropped += 1;
            } else {
                break;
            }
        }
        dropped
    }

    /// Spawns the periodic flush task. `persist` is called with each drained
    /// batch; errors are logged and the batch is restored for the next tick.
    pub fn spawn_flush_task<F, Fut>(
        self,
        interval: Duration,
        persist: F,
    ) -> tokio::task::JoinHandle<()>
    where
        F: Fn(Vec<DeliveryConfirmation>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), String>> + Send,
    {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = self.flush(|batch| persist(batch)).await {
                    tracing::error!(error = %e, "confirmation batch flush failed, restoring pending");
                }
            }
        })
    }

    pub fn spawn_retention_task(self, interval: Duration, retention: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let dropped = self.sweep_retention(retention);
                if dropped > 0 {
                    tracing::debug!(dropped, "confirmation retention sweep");
                }
            }
        })
    }
}

/// Minimal query-string escaping; avoids pulling in a full URL crate for one
/// call site.
fn urlencoding_lite(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(b as char),
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_is_append_only_and_queryable() {
        let store = ConfirmationStore::new(100);
        store.record_sent("n1", "acme", Channel::Email).unwrap();
        store.record_delivered("n1", "acme", Channel::Email).unwrap();

        let confirmations = store.get_for_notification("n1");
        assert_eq!(confirmations.len(), 2);

        let agg = store.aggregate_status("n1");
        assert_eq!(agg[&Channel::Email], ConfirmationStatus::Delivered);
    }

    #[test]
    fn read_and_click_and_bounce_and_unsubscribe_are_recorded() {
        let store = ConfirmationStore::new(100);
        store.record_sent("n1", "acme", Channel::Email).unwrap();
        store.record_read("n1", "acme", Channel::Email, Some("curl/8".to_string())).unwrap();
        store
            .record_clicked("n1", "acme", Channel::Email, Some("curl/8".to_string()), Some("https://dest".to_string()))
            .unwrap();
        store.record_bounced("n1", "acme", Channel::Email, "mailbox full").unwrap();
        store.record_unsubscribed("n1", "acme", Channel::Email).unwrap();

        let confirmations = store.get_for_notification("n1");
        assert_eq!(confirmations.len(), 5);
        assert_eq!(store.aggregate_status("n1")[&Channel::Email], ConfirmationStatus::Unsubscribed);
    }

    #[test]
    fn max_pending_drops_oldest() {
        let store = ConfirmationStore::new(2);
        store.record_sent("n1", "acme", Channel::Web).unwrap();
        store.record_sent("n2", "acme", Channel::Web).unwrap();
        store.record_sent("n3", "acme", Channel::Web).unwrap();
        assert_eq!(store.pending_count(), 2);
    }

    #[tokio::test]
    async fn flush_restores_batch_on_error() {
        let store = ConfirmationStore::new(100);
        store.record_sent("n1", "acme", Channel::Web).unwrap();

        let result: Result<usize, String> = store.flush(|_batch| async { Err("boom".to_string()) }).await;
        assert!(result.is_err());
        assert_eq!(store.pending_count(), 1, "batch restored after failed persist");
    }

    #[tokio::test]
    async fn flush_clears_batch_on_success() {
        let store = ConfirmationStore::new(100);
        store.record_sent("n1", "acme", Channel::Web).unwrap();

        let result: Result<usize, String> = store.flush(|_batch| async { Ok(()) }).await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(store.pending_count(), 0);
        assert_eq!(store.flushed_total(), 1);
    }

    #[test]
    fn retention_sweep_drops_old_entries() {
        let store = ConfirmationStore::new(100);
        store.record_sent("n1", "acme", Channel::Web).unwrap();
        let dropped = store.sweep_retention(Duration::from_secs(0));
        assert_eq!(dropped, 1);
        assert!(store.get_for_notification("n1").is_empty());
    }

    #[test]
    fn tracking_urls_are_well_formed() {
        let store = ConfirmationStore::new(10);
        let pixel = store.tracking_pixel_url("https://hub.example", "n1", Channel::Email);
        assert_eq!(pixel, "https://hub.example/track/pixel/n1/email");

        let click = store.click_tracking_url("https://hub.example", "n1", Channel::Email, "https://dest/a b");
        assert!(click.starts_with("https://hub.example/track/click/n1/email?to="));
        assert!(click.contains("%20"));
    }
}
