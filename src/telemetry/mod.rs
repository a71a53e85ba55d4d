//! Generic event-sink abstraction shared by every subsystem that wants to
//! expose an observable stream without taking a dependency on what's
//! listening.
//!
//! The resilience-primitive sinks this module used to carry were built
//! around one `PolicyEvent` enum and a `tower::Service` adapter. The
//! dispatcher and confirmation store each have their own event vocabulary
//! (`DispatchEvent`, `ConfirmationEvent`), so the sink abstraction is
//! generalized to `Sink<E>` and the built-in sinks (null, log, streaming)
//! are implemented once, generically, rather than once per event type.

pub mod events;
pub mod sinks;

pub use events::{ConfirmationEvent, DispatchEvent};
pub use sinks::{emit_best_effort, LogSink, NullSink, StreamingSink};

use async_trait::async_trait;

/// A sink that consumes events of type `E`.
///
/// Implementations must not block the emitting worker for long: a slow or
/// panicking observer is the observer's problem, not the emitter's. Callers
/// use [`emit_best_effort`] to enforce that.
#[async_trait]
pub trait Sink<E>: Send + Sync {
    async fn emit(&self, event: E);
}
