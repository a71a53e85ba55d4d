//! Dispatcher-wide counters: totals per status and priority, an EWMA of
//! processing time, and a trailing-60s throughput window. Per-channel
//! counters live on each Channel Processor's own `ProcessorStats` instead of
//! being duplicated here.

use crate::model::Priority;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use super::priority_index;

const EWMA_ALPHA: f64 = 0.2;
const THROUGHPUT_WINDOW_MS: u64 = 60_000;

pub struct DispatcherStats {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    retrying: AtomicU64,
    expired: AtomicU64,
    cancelled: AtomicU64,
    per_priority: [AtomicU64; 5],
    ewma_processing_ms: Mutex<Option<f64>>,
    delivered_timestamps: Mutex<VecDeque<u64>>,
}

impl Default for DispatcherStats {
    fn default() -> Self {
        Self {
            enqueued: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retrying: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            per_priority: std::array::from_fn(|_| AtomicU64::new(0)),
            ewma_processing_ms: Mutex::new(None),
            delivered_timestamps: Mutex::new(VecDeque::new()),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DispatcherSnapshot {
    pub enqueued: u64,
    pub delivered: u64,
    pub failed: u64,
    pub retrying: u64,
    pub expired: u64,
    pub cancelled: u64,
    pub per_priority: [u64; 5],
    pub avg_processing_ms: Option<f64>,
    pub throughput_last_60s: usize,
}

impl DispatcherStats {
    pub fn record_enqueued(&self, priority: Priority) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        self.per_priority[priority_index(priority)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivered(&self, now_ms: u64, processing_ms: f64) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        {
            let mut ewma = self.ewma_processing_ms.lock().expect("ewma lock poisoned");
            *ewma = Some(match *ewma {
                Some(prev) => EWMA_ALPHA * processing_ms + (1.0 - EWMA_ALPHA) * prev,
                None => processing_ms,
            });
        }
        let mut ts = self.delivered_timestamps.lock().expect("throughput lock poisoned");
        ts.push_back(now_ms);
        while ts.front().is_some_and(|t| now_ms.saturating_sub(*t) > THROUGHPUT_WINDOW_MS) {
            ts.pop_front();
        }
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retrying(&self) {
        self.retrying.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_expired(&self) {
        self.expired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn throughput_last_60s(&self, now_ms: u64) -> usize {
        let mut ts = self.delivered_timestamps.lock().expect("throughput lock poisoned");
        while ts.front().is_some_and(|t| now_ms.saturating_sub(*t) > THROUGHPUT_WINDOW_MS) {
            ts.pop_front();
        }
        ts.len()
    }

    pub fn snapshot(&self) -> DispatcherSnapshot {
        let now_ms = crate::model::now_ms();
        DispatcherSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retrying: self.retrying.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            per_priority: std::array::from_fn(|i| self.per_priority[i].load(Ordering::Relaxed)),
            avg_processing_ms: *self.ewma_processing_ms.lock().expect("ewma lock poisoned"),
            throughput_last_60s: self.throughput_last_60s(now_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivered_updates_ewma_and_throughput() {
        let stats = DispatcherStats::default();
        stats.record_delivered(1_000, 100.0);
        stats.record_delivered(1_500, 50.0);
        let snap = stats.snapshot();
        assert_eq!(snap.delivered, 2);
        assert!(snap.avg_processing_ms.unwrap() < 100.0);
    }

    #[test]
    fn throughput_drops_entries_outside_window() {
        let stats = DispatcherStats::default();
        stats.record_delivered(0, 10.0);
        assert_eq!(stats.throughput_last_60s(120_000), 0);
    }

    #[test]
    fn per_priority_counts_enqueue() {
        let stats = DispatcherStats::default();
        stats.record_enqueued(Priority::Critical);
        stats.record_enqueued(Priority::Low);
        let snap = stats.snapshot();
        assert_eq!(snap.per_priority[0], 1);
        assert_eq!(snap.per_priority[4], 1);
    }
}
