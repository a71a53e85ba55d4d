//! Built-in [`Sink`] implementations shared by the Dispatcher and the
//! Delivery Confirmation Store.

use super::Sink;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Discards every event. The default when no sink is registered.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

#[async_trait]
impl<E: Send + Sync + 'static> Sink<E> for NullSink {
    async fn emit(&self, _event: E) {}
}

/// Logs events via `tracing` at INFO level.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

#[async_trait]
impl<E: std::fmt::Display + Send + Sync + 'static> Sink<E> for LogSink {
    async fn emit(&self, event: E) {
        tracing::info!(event = %event, "notifyhub_event");
    }
}

/// Broadcasts events to any number of subscribers via `tokio::sync::broadcast`.
///
/// Slow subscribers miss events rather than backpressuring the emitter —
/// telemetry must never slow down the dispatch loop.
#[derive(Clone, Debug)]
pub struct StreamingSink<E> {
    sender: Arc<tokio::sync::broadcast::Sender<E>>,
    dropped: Arc<AtomicU64>,
    last_drop_ns: Arc<AtomicU64>,
}

impl<E: Clone + Send + 'static> StreamingSink<E> {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender: Arc::new(sender), dropped: Arc::new(AtomicU64::new(0)), last_drop_ns: Arc::new(AtomicU64::new(0)) }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<E> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn last_drop(&self) -> Option<SystemTime> {
        match self.last_drop_ns.load(Ordering::Relaxed) {
            0 => None,
            ns => UNIX_EPOCH.checked_add(Duration::from_nanos(ns)),
        }
    }
}

#[async_trait]
impl<E: Clone + Send + Sync + 'static> Sink<E> for StreamingSink<E> {
    async fn emit(&self, event: E) {
        if self.sender.send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            self.last_drop_ns.store(
                SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos() as u64,
                Ordering::Relaxed,
            );
        }
    }
}

/// Emits to an `Arc<dyn Sink<E>>`, swallowing the call entirely if `None`.
///
/// This is how subsystems hold an optional, pluggable sink without needing a
/// generic parameter threaded through every struct: `Option<Arc<dyn Sink<E>>>`.
pub async fn emit_best_effort<E>(sink: &Option<Arc<dyn Sink<E> + Send + Sync>>, event: E)
where
    E: Send + Sync + 'static,
{
    if let Some(sink) = sink {
        sink.emit(event).await;
    }
}
