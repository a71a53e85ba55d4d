//! Feature-gated wiring from [`ServerConfig`] to the sinks the library's
//! dispatcher and confirmation store accept. `jsonl-sink` takes priority over
//! `prometheus-sink` when both are enabled; with neither, both helpers
//! return `None` and telemetry is disabled.

use std::sync::Arc;

use notifyhub::telemetry::{ConfirmationEvent, DispatchEvent, Sink};

use crate::config::ServerConfig;

#[cfg(feature = "jsonl-sink")]
pub fn dispatch_sink(config: &ServerConfig) -> Option<Arc<dyn Sink<DispatchEvent> + Send + Sync>> {
    Some(Arc::new(notifyhub_jsonl::JsonlSink::new(config.event_log_path.clone())))
}

#[cfg(feature = "jsonl-sink")]
pub fn confirmation_sink(config: &ServerConfig) -> Option<Arc<dyn Sink<ConfirmationEvent> + Send + Sync>> {
    Some(Arc::new(notifyhub_jsonl::JsonlSink::new(config.event_log_path.clone())))
}

#[cfg(all(feature = "prometheus-sink", not(feature = "jsonl-sink")))]
pub fn dispatch_sink(_config: &ServerConfig) -> Option<Arc<dyn Sink<DispatchEvent> + Send + Sync>> {
    match notifyhub_prometheus::PrometheusSink::new(prometheus::default_registry().clone()) {
        Ok(sink) => Some(Arc::new(sink)),
        Err(e) => {
            tracing::warn!(error = %e, "failed to build prometheus sink, telemetry disabled");
            None
        }
    }
}

#[cfg(all(feature = "prometheus-sink", not(feature = "jsonl-sink")))]
pub fn confirmation_sink(_config: &ServerConfig) -> Option<Arc<dyn Sink<ConfirmationEvent> + Send + Sync>> {
    match notifyhub_prometheus::PrometheusSink::new(prometheus::default_registry().clone()) {
        Ok(sink) => Some(Arc::new(sink)),
        Err(e) => {
            tracing::warn!(error = %e, "failed to build prometheus sink, telemetry disabled");
            None
        }
    }
}

#[cfg(not(any(feature = "jsonl-sink", feature = "prometheus-sink")))]
pub fn dispatch_sink(_config: &ServerConfig) -> Option<Arc<dyn Sink<DispatchEvent> + Send + Sync>> {
    None
}

#[cfg(not(any(feature = "jsonl-sink", feature = "prometheus-sink")))]
pub fn confirmation_sink(_config: &ServerConfig) -> Option<Arc<dyn Sink<ConfirmationEvent> + Send + Sync>> {
    None
}
