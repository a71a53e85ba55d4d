//! Per-processor delivery counters and an exponentially-weighted moving
//! average of delivery time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Smoothing factor for the EWMA: higher weights recent samples more.
const EWMA_ALPHA: f64 = 0.2;

#[derive(Debug, Default)]
pub struct ProcessorStats {
    sent: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    bounced: AtomicU64,
    opened: AtomicU64,
    clicked: AtomicU64,
    ewma_delivery_ms: Mutex<Option<f64>>,
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct ProcessorSnapshot {
    pub sent: u64,
    pub delivered: u64,
    pub failed: u64,
    pub bounced: u64,
    pub opened: u64,
    pub clicked: u64,
    pub avg_delivery_ms: Option<f64>,
}

impl ProcessorStats {
    pub fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivered(&self, delivery_ms: f64) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        self.observe_delivery_time(delivery_ms);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bounced(&self) {
        self.bounced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_opened(&self) {
        self.opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_clicked(&self) {
        self.clicked.fetch_add(1, Ordering::Relaxed);
    }

    fn observe_delivery_time(&self, sample_ms: f64) {
        let mut ewma = self.ewma_delivery_ms.lock().expect("ewma lock poisoned");
        *ewma = Some(match *ewma {
            Some(prev) => EWMA_ALPHA * sample_ms + (1.0 - EWMA_ALPHA) * prev,
            None => sample_ms,
        });
    }

    pub fn snapshot(&self) -> ProcessorSnapshot {
        ProcessorSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            bounced: self.bounced.load(Ordering::Relaxed),
            opened: self.opened.load(Ordering::Relaxed),
            clicked: self.clicked.load(Ordering::Relaxed),
            avg_delivery_ms: *self.ewma_delivery_ms.lock().expect("ewma lock poisoned"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ewma_converges_toward_recent_samples() {
        let stats = ProcessorStats::default();
        stats.record_delivered(100.0);
        assert_eq!(stats.snapshot().avg_delivery_ms, Some(100.0));

        stats.record_delivered(200.0);
        let avg = stats.snapshot().avg_delivery_ms.unwrap();
        assert!(avg > 100.0 && avg < 200.0);
        assert_eq!(stats.snapshot().delivered, 2);
    }

    #[test]
    fn counters_are_independent() {
        let stats = ProcessorStats::default();
        stats.record_sent();
        stats.record_failed();
        stats.record_bounced();
        let snap = stats.snapshot();
        assert_eq!(snap.sent, 1);
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.bounced, 1);
        assert_eq!(snap.delivered, 0);
    }
}
