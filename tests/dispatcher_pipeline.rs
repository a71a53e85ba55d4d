use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use notifyhub::dispatcher::{Dispatcher, DispatcherConfig};
use notifyhub::model::{Channel, Notification, NotificationRequest, NotificationStatus, Priority};
use notifyhub::processors::{ChannelProcessor, ProcessOutcome, ProcessorRegistry, ProcessorSnapshot};
use notifyhub::router::{ChannelRouter, InMemoryPreferenceStore, RouterConfig};

struct AlwaysDelivers(Channel);

#[async_trait]
impl ChannelProcessor for AlwaysDelivers {
    fn channel(&self) -> Channel {
        self.0
    }

    async fn process(&self, _notification: &Notification) -> ProcessOutcome {
        ProcessOutcome::delivered(self.0)
    }

    fn stats(&self) -> ProcessorSnapshot {
        ProcessorSnapshot::default()
    }
}

struct AlwaysFails(Channel);

#[async_trait]
impl ChannelProcessor for AlwaysFails {
    fn channel(&self) -> Channel {
        self.0
    }

    async fn process(&self, _notification: &Notification) -> ProcessOutcome {
        ProcessOutcome::failed(self.0, "transport down", true)
    }

    fn stats(&self) -> ProcessorSnapshot {
        ProcessorSnapshot::default()
    }
}

fn build_dispatcher(processors: ProcessorRegistry) -> Arc<Dispatcher> {
    let preferences = Arc::new(InMemoryPreferenceStore::new());
    let router = Arc::new(ChannelRouter::new(Arc::new(processors), preferences, RouterConfig::default()));
    Arc::new(Dispatcher::new(router, DispatcherConfig::default(), None))
}

fn request(channels: &[Channel]) -> NotificationRequest {
    NotificationRequest {
        tenant_id: "acme".to_string(),
        site_id: None,
        user_id: Some("user-1".to_string()),
        priority: Priority::Normal,
        channels: channels.iter().copied().collect::<HashSet<_>>(),
        payload: Default::default(),
        targeting: Default::default(),
        scheduling: Default::default(),
        delivery_policy: None,
        metadata: Default::default(),
    }
}

/// Same as [`request`] but with a fast, fixed retry delay so tests don't
/// have to wait out the default multi-second backoff.
fn request_with_fast_retries(channels: &[Channel]) -> NotificationRequest {
    NotificationRequest {
        delivery_policy: Some(notifyhub::model::DeliveryPolicy {
            max_attempts: 3,
            base_retry_delay_ms: 10,
            backoff_multiplier: 1.0,
        }),
        ..request(channels)
    }
}

#[tokio::test]
async fn enqueue_then_tick_delivers_and_marks_completed() {
    let mut processors = ProcessorRegistry::new();
    processors.register(Arc::new(AlwaysDelivers(Channel::Web)));
    let dispatcher = build_dispatcher(processors);

    let id = dispatcher.enqueue(request(&[Channel::Web])).await.unwrap();
    assert_eq!(dispatcher.status(&id), Some(NotificationStatus::Pending));

    dispatcher.dispatch_tick().await;

    let notification = dispatcher.get(&id).expect("notification tracked after tick");
    assert_eq!(notification.status, NotificationStatus::Delivered);
}

#[tokio::test]
async fn failed_delivery_is_retried_until_exhausted() {
    let mut processors = ProcessorRegistry::new();
    processors.register(Arc::new(AlwaysFails(Channel::Web)));
    let dispatcher = build_dispatcher(processors);

    let id = dispatcher.enqueue(request_with_fast_retries(&[Channel::Web])).await.unwrap();
    dispatcher.dispatch_tick().await;

    // Still retryable immediately after the first attempt.
    assert_eq!(dispatcher.status(&id), Some(NotificationStatus::Retrying));

    // Alternate retry-tick (requeue what's due) and dispatch-tick (attempt
    // it again) until the notification reaches a terminal state or we give
    // up waiting.
    for _ in 0..10 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        dispatcher.retry_tick().await;
        dispatcher.dispatch_tick().await;
        if dispatcher.status(&id).map(|s| s.is_terminal()).unwrap_or(false) {
            break;
        }
    }

    assert_eq!(dispatcher.status(&id), Some(NotificationStatus::Failed));
}

#[tokio::test]
async fn cancel_removes_a_still_queued_notification() {
    let mut processors = ProcessorRegistry::new();
    processors.register(Arc::new(AlwaysDelivers(Channel::Web)));
    let dispatcher = build_dispatcher(processors);

    let id = dispatcher.enqueue(request(&[Channel::Web])).await.unwrap();
    assert!(dispatcher.cancel(&id).await);
    assert_eq!(dispatcher.status(&id), None);

    // Cancelling twice is a no-op, not an error.
    assert!(!dispatcher.cancel(&id).await);
}

#[tokio::test]
async fn enqueue_rejects_empty_channel_set() {
    let dispatcher = build_dispatcher(ProcessorRegistry::new());
    let result = dispatcher.enqueue(request(&[])).await;
    assert!(result.is_err());
}
