//! Convenient re-exports for common notifyhub types.
pub use crate::{
    model::{
        Channel, ChannelPreference, Connection, ConnectionState, DeliveryConfirmation,
        DeliveryPolicy, FallbackStrategy, FrequencyPolicy, Notification, NotificationMetadata,
        NotificationRequest, NotificationStatus, Payload, Priority, QuietHours, Scheduling,
        Targeting, TransportKind,
    },
    rate_limit::{Decision as RateLimitDecision, RateLimiter},
    telemetry::{ConfirmationEvent, DispatchEvent, LogSink, NullSink, Sink, StreamingSink},
    Adaptive, Backoff, BulkheadPolicy, CircuitBreakerConfig, CircuitBreakerPolicy, CircuitState,
    Clock, MonotonicClock, ResilienceError, RetryPolicy, RetryPolicyBuilder, Sleeper,
    TimeoutError, TimeoutPolicy, TokioSleeper,
};
