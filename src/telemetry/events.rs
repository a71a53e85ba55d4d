use std::fmt;

/// Events emitted by the Dispatcher, synchronously from the worker that
/// caused them. See the per-variant docs for exactly when each fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchEvent {
    /// A notification was accepted into a priority bucket.
    Enqueued { notification_id: String, priority: u8 },
    /// A notification was pulled off its bucket and handed to the router.
    Dispatched { notification_id: String, attempt: u32 },
    /// Every requested channel delivered successfully.
    Delivered { notification_id: String, attempt: u32 },
    /// At least one channel failed but attempts remain; requeued with a delay.
    Retrying { notification_id: String, attempt: u32, next_delay_ms: u64 },
    /// Attempts exhausted with residual failures.
    Failed { notification_id: String, attempts: u32, error: String },
    /// `expires_at` had already passed at selection time.
    Expired { notification_id: String },
    /// `cancel(id)` removed a pending notification.
    Cancelled { notification_id: String },
}

impl fmt::Display for DispatchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchEvent::Enqueued { notification_id, priority } => {
                write!(f, "Enqueued(id={notification_id}, priority={priority})")
            }
            DispatchEvent::Dispatched { notification_id, attempt } => {
                write!(f, "Dispatched(id={notification_id}, attempt={attempt})")
            }
            DispatchEvent::Delivered { notification_id, attempt } => {
                write!(f, "Delivered(id={notification_id}, attempt={attempt})")
            }
            DispatchEvent::Retrying { notification_id, attempt, next_delay_ms } => {
                write!(
                    f,
                    "Retrying(id={notification_id}, attempt={attempt}, delay_ms={next_delay_ms})"
                )
            }
            DispatchEvent::Failed { notification_id, attempts, error } => {
                write!(f, "Failed(id={notification_id}, attempts={attempts}, error={error})")
            }
            DispatchEvent::Expired { notification_id } => {
                write!(f, "Expired(id={notification_id})")
            }
            DispatchEvent::Cancelled { notification_id } => {
                write!(f, "Cancelled(id={notification_id})")
            }
        }
    }
}

/// Events emitted by the Delivery Confirmation Store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationEvent {
    /// The pending batch was flushed to the persistence collaborator.
    BatchFlushed { count: usize, flushed_at_ms: u64 },
}

impl fmt::Display for ConfirmationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfirmationEvent::BatchFlushed { count, flushed_at_ms } => {
                write!(f, "BatchFlushed(count={count}, at_ms={flushed_at_ms})")
            }
        }
    }
}

/// Convert a [`DispatchEvent`] into a JSON value for the JSON-Lines sink.
pub fn dispatch_event_to_json(event: &DispatchEvent) -> serde_json::Value {
    use serde_json::json;
    match event {
        DispatchEvent::Enqueued { notification_id, priority } => json!({
            "kind": "enqueued", "notification_id": notification_id, "priority": priority,
        }),
        DispatchEvent::Dispatched { notification_id, attempt } => json!({
            "kind": "dispatched", "notification_id": notification_id, "attempt": attempt,
        }),
        DispatchEvent::Delivered { notification_id, attempt } => json!({
            "kind": "delivered", "notification_id": notification_id, "attempt": attempt,
        }),
        DispatchEvent::Retrying { notification_id, attempt, next_delay_ms } => json!({
            "kind": "retrying", "notification_id": notification_id, "attempt": attempt,
            "next_delay_ms": next_delay_ms,
        }),
        DispatchEvent::Failed { notification_id, attempts, error } => json!({
            "kind": "failed", "notification_id": notification_id, "attempts": attempts,
            "error": error,
        }),
        DispatchEvent::Expired { notification_id } => json!({
            "kind": "expired", "notification_id": notification_id,
        }),
        DispatchEvent::Cancelled { notification_id } => json!({
            "kind": "cancelled", "notification_id": notification_id,
        }),
    }
}

/// Convert a [`ConfirmationEvent`] into a JSON value for the JSON-Lines sink.
pub fn confirmation_event_to_json(event: &ConfirmationEvent) -> serde_json::Value {
    use serde_json::json;
    match event {
        ConfirmationEvent::BatchFlushed { count, flushed_at_ms } => json!({
            "kind": "batch_flushed", "count": count, "flushed_at_ms": flushed_at_ms,
        }),
    }
}
