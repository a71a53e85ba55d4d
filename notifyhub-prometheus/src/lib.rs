//! Prometheus metrics sink. Bring your own `prometheus::Registry`; counters
//! are registered once and incremented per event, labeled by event kind.

use async_trait::async_trait;
use notifyhub::telemetry::{ConfirmationEvent, DispatchEvent, Sink};
use prometheus::{IntCounterVec, Registry};
use std::sync::Arc;

#[derive(Clone, Debug)]
pub struct PrometheusSink {
    registry: Arc<Registry>,
    dispatch_events: IntCounterVec,
    confirmation_events: IntCounterVec,
}

impl PrometheusSink {
    /// Creates a sink and registers its counters into the provided registry.
    ///
    /// # Errors
    /// Returns an error if a metric name conflicts with one already registered.
    pub fn new<R: Into<Arc<Registry>>>(registry: R) -> Result<Self, prometheus::Error> {
        let registry = registry.into();
        let dispatch_events = IntCounterVec::new(
            prometheus::Opts::new("notifyhub_dispatch_events_total", "Dispatcher events by kind"),
            &["kind"],
        )?;
        let confirmation_events = IntCounterVec::new(
            prometheus::Opts::new("notifyhub_confirmation_events_total", "Confirmation store events by kind"),
            &["kind"],
        )?;
        registry.register(Box::new(dispatch_events.clone()))?;
        registry.register(Box::new(confirmation_events.clone()))?;
        Ok(Self { registry, dispatch_events, confirmation_events })
    }

    /// Exposes the registry for HTTP scraping.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

fn dispatch_kind(event: &DispatchEvent) -> &'static str {
    match event {
        DispatchEvent::Enqueued { .. } => "enqueued",
        DispatchEvent::Dispatched { .. } => "dispatched",
        DispatchEvent::Delivered { .. } => "delivered",
        DispatchEvent::Retrying { .. } => "retrying",
        DispatchEvent::Failed { .. } => "failed",
        DispatchEvent::Expired { .. } => "expired",
        DispatchEvent::Cancelled { .. } => "cancelled",
    }
}

fn confirmation_kind(event: &ConfirmationEvent) -> &'static str {
    match event {
        ConfirmationEvent::BatchFlushed { .. } => "batch_flushed",
    }
}

#[async_trait]
impl Sink<DispatchEvent> for PrometheusSink {
    async fn emit(&self, event: DispatchEvent) {
        self.dispatch_events.with_label_values(&[dispatch_kind(&event)]).inc();
    }
}

#[async_trait]
impl Sink<ConfirmationEvent> for PrometheusSink {
    async fn emit(&self, event: ConfirmationEvent) {
        self.confirmation_events.with_label_values(&[confirmation_kind(&event)]).inc();
    }
}
