#![forbid(unsafe_code)]

//! # notifyhub
//!
//! A multi-channel notification delivery pipeline: a priority-bucketed
//! dispatcher, a preference-aware channel router, per-channel delivery
//! processors (web, email, push), a real-time connection fabric for
//! browser subscribers, a delivery confirmation store, and adaptive rate
//! limiting across all of it.
//!
//! The channel processors in [`processors`] wrap their outbound transport
//! calls in the [`TimeoutPolicy`]/[`BulkheadPolicy`]/[`CircuitBreakerPolicy`]
//! primitives below, and the dispatcher's own retry loop is a thin
//! re-implementation of the same backoff math as [`RetryPolicy`]/[`Backoff`].
//!
//! ## Quick Start
//!
//! ```rust
//! use std::collections::HashSet;
//! use notifyhub::dispatcher::{Dispatcher, DispatcherConfig};
//! use notifyhub::model::{Channel, NotificationRequest, Priority};
//! use notifyhub::processors::ProcessorRegistry;
//! use notifyhub::router::{ChannelRouter, InMemoryPreferenceStore, RouterConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let processors = Arc::new(ProcessorRegistry::new());
//!     let preferences = Arc::new(InMemoryPreferenceStore::new());
//!     let router = Arc::new(ChannelRouter::new(processors, preferences, RouterConfig::default()));
//!     let dispatcher = Dispatcher::new(router, DispatcherConfig::default(), None);
//!
//!     let request = NotificationRequest {
//!         tenant_id: "acme".to_string(),
//!         site_id: None,
//!         user_id: Some("user-1".to_string()),
//!         priority: Priority::Normal,
//!         channels: HashSet::from([Channel::Web]),
//!         payload: Default::default(),
//!         targeting: Default::default(),
//!         scheduling: Default::default(),
//!         delivery_policy: None,
//!         metadata: Default::default(),
//!     };
//!     let _id = dispatcher.enqueue(request).await.unwrap();
//!     dispatcher.dispatch_tick().await;
//! }
//! ```

mod adaptive;
mod backoff;
mod bulkhead;
mod circuit_breaker;
mod clock;
mod error;
mod retry;
mod sleeper;
mod timeout;

pub mod confirmation;
pub mod config;
pub mod dispatcher;
pub mod model;
pub mod processors;
pub mod rate_limit;
pub mod realtime;
pub mod router;
pub mod telemetry;

// Re-exports
pub use adaptive::Adaptive;
pub use backoff::Backoff;
pub use bulkhead::BulkheadPolicy;
pub use circuit_breaker::{CircuitBreakerConfig, CircuitBreakerPolicy, CircuitState};
pub use clock::{Clock, MonotonicClock};
pub use error::{ResilienceError, MAX_RETRY_FAILURES};
pub use retry::{BuildError, RetryPolicy, RetryPolicyBuilder};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use timeout::{TimeoutError, TimeoutPolicy, MAX_TIMEOUT};

pub mod prelude;
