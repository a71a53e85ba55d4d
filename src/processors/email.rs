//! Email processor: resolves a recipient address, selects a template, and
//! hands the message to an HTTP transport collaborator, wrapped in a
//! circuit breaker, timeout, and bulkhead per the component's resilience
//! contract.

use super::{ChannelProcessor, ProcessOutcome, ProcessorSnapshot, ProcessorStats};
use crate::confirmation::ConfirmationStore;
use crate::model::{now_ms, Channel, Notification};
use crate::rate_limit::KeyedLimiters;
use crate::{BulkheadPolicy, CircuitBreakerPolicy, ResilienceError, TimeoutPolicy};
use async_trait::async_trait;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum EmailTransportError {
    #[error("provider request failed: {0}")]
    Provider(String),
}

#[derive(Debug, Clone)]
pub struct EmailMessage {
    pub to: String,
    pub template_id: String,
    pub subject: String,
    pub vars: serde_json::Map<String, serde_json::Value>,
}

/// Abstracts the actual HTTP call so processor logic is testable without a
/// live provider.
#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<String, EmailTransportError>;
}

pub struct HttpEmailTransport {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl HttpEmailTransport {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self { client: reqwest::Client::new(), endpoint: endpoint.into(), api_key: api_key.into() }
    }
}

#[async_trait]
impl EmailTransport for HttpEmailTransport {
    async fn send(&self, message: &EmailMessage) -> Result<String, EmailTransportError> {
        #[derive(serde::Deserialize)]
        struct ProviderResponse {
            message_id: String,
        }

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "to": message.to,
                "template_id": message.template_id,
                "subject": message.subject,
                "vars": message.vars,
            }))
            .send()
            .await
            .map_err(|e| EmailTransportError::Provider(e.to_string()))?;

        if !response.status().is_success() {
            return Err(EmailTransportError::Provider(format!("provider returned {}", response.status())));
        }

        let parsed: ProviderResponse =
            response.json().await.map_err(|e| EmailTransportError::Provider(e.to_string()))?;
        Ok(parsed.message_id)
    }
}

fn recipient_email(notification: &Notification) -> Option<String> {
    notification
        .payload
        .data
        .get("customer")
        .and_then(|c| c.get("email"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .or_else(|| notification.payload.data.get("email").and_then(|v| v.as_str()).map(str::to_string))
}

fn template_id_for(notification: &Notification) -> String {
    if let Some(template_id) = &notification.payload.template_id {
        return template_id.clone();
    }
    match notification.payload.event_type.as_deref() {
        Some("order") => "order-confirmation".to_string(),
        Some("password-reset") => "password-reset".to_string(),
        Some(other) => format!("{other}-default"),
        None => "generic".to_string(),
    }
}

fn subject_for(notification: &Notification) -> String {
    notification.payload.title.clone().unwrap_or_else(|| "Notification".to_string())
}

pub struct EmailProcessor {
    transport: Arc<dyn EmailTransport>,
    limiters: Arc<KeyedLimiters>,
    confirmations: ConfirmationStore,
    circuit_breaker: CircuitBreakerPolicy,
    timeout: TimeoutPolicy,
    bulkhead: BulkheadPolicy,
    stats: ProcessorStats,
}

impl EmailProcessor {
    pub fn new(
        transport: Arc<dyn EmailTransport>,
        limiters: Arc<KeyedLimiters>,
        confirmations: ConfirmationStore,
        circuit_breaker: CircuitBreakerPolicy,
        timeout: TimeoutPolicy,
        bulkhead: BulkheadPolicy,
    ) -> Self {
        Self { transport, limiters, confirmations, circuit_breaker, timeout, bulkhead, stats: ProcessorStats::default() }
    }
}

#[async_trait]
impl ChannelProcessor for EmailProcessor {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn process(&self, notification: &Notification) -> ProcessOutcome {
        if !notification.channels.contains(&Channel::Email) {
            return ProcessOutcome::not_requested();
        }

        let Some(to) = recipient_email(notification) else {
            self.stats.record_failed();
            return ProcessOutcome::failed(Channel::Email, "no recipient email address", false);
        };

        let key = format!("email:{}", notification.tenant_id);
        if !self.limiters.check(&key, 1).await.is_allowed() {
            self.stats.record_failed();
            return ProcessOutcome::failed(Channel::Email, "rate limit exceeded", true);
        }

        let message = EmailMessage {
            to,
            template_id: template_id_for(notification),
            subject: subject_for(notification),
            vars: notification.payload.data.clone(),
        };

        self.stats.record_sent();
        let _ = self.confirmations.record_sent(&notification.id, &notification.tenant_id, Channel::Email);

        let start = now_ms();
        let transport = self.transport.clone();
        let result = self
            .circuit_breaker
            .execute(|| {
                let timeout = self.timeout.clone();
                let bulkhead = self.bulkhead.clone();
                let transport = transport.clone();
                let message = message.clone();
                async move {
                    timeout
                        .execute(|| {
                            let bulkhead = bulkhead.clone();
                            let transport = transport.clone();
                            let message = message.clone();
                            async move {
                                bulkhead
                                    .execute(|| {
                                        let transport = transport.clone();
                                        let message = message.clone();
                                        async move {
                                            transport.send(&message).await.map_err(ResilienceError::Inner)
                                        }
                                    })
                                    .await
                            }
                        })
                        .await
                }
            })
            .await;

        match result {
            Ok(_provider_message_id) => {
                self.stats.record_delivered((now_ms() - start) as f64);
                let _ =
                    self.confirmations.record_delivered(&notification.id, &notification.tenant_id, Channel::Email);
                ProcessOutcome::delivered(Channel::Email)
            }
            Err(e) => {
                self.stats.record_failed();
                let message = e.to_string();
                let _ = self.confirmations.record_failed(
                    &notification.id,
                    &notification.tenant_id,
                    Channel::Email,
                    message.clone(),
                );
                let retryable =
                    !matches!(e, ResilienceError::Bulkhead { .. } | ResilienceError::CircuitOpen { .. });
                ProcessOutcome::failed(Channel::Email, message, retryable)
            }
        }
    }

    fn stats(&self) -> ProcessorSnapshot {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        DeliveryPolicy, NotificationMetadata, NotificationStatus, Payload, Scheduling, Targeting,
    };
    use crate::rate_limit::{Decision, RateLimiter};
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct AlwaysAllow;
    #[async_trait]
    impl RateLimiter for AlwaysAllow {
        async fn acquire(&self, _permits: u32) -> Result<Decision, Box<dyn std::error::Error + Send + Sync>> {
            Ok(Decision::Allowed { remaining: 10, limit: 10, metadata: HashMap::new() })
        }
    }

    struct StubTransport {
        fail: AtomicBool,
    }

    #[async_trait]
    impl EmailTransport for StubTransport {
        async fn send(&self, _message: &EmailMessage) -> Result<String, EmailTransportError> {
            if self.fail.load(Ordering::SeqCst) {
                Err(EmailTransportError::Provider("boom".to_string()))
            } else {
                Ok("msg-123".to_string())
            }
        }
    }

    fn notification_with(channels: HashSet<Channel>, email: Option<&str>) -> Notification {
        let mut payload = Payload::default();
        if let Some(email) = email {
            let mut customer = serde_json::Map::new();
            customer.insert("email".into(), serde_json::json!(email));
            payload.data.insert("customer".into(), serde_json::Value::Object(customer));
        }
        Notification {
            id: "n1".into(),
            tenant_id: "acme".into(),
            site_id: None,
            user_id: None,
            priority: crate::model::Priority::Normal,
            channels,
            payload,
            targeting: Targeting::default(),
            scheduling: Scheduling::default(),
            delivery_policy: DeliveryPolicy::default(),
            metadata: NotificationMetadata::default(),
            created_at_ms: 0,
            updated_at_ms: 0,
            status: NotificationStatus::Processing,
            attempts: 1,
            last_attempt_ms: None,
            last_error: None,
            delivered_channels: HashSet::new(),
            failed_channels: HashSet::new(),
            retry_at_ms: None,
        }
    }

    fn processor(transport: Arc<StubTransport>) -> EmailProcessor {
        let limiters = Arc::new(KeyedLimiters::new(|_| Arc::new(AlwaysAllow)));
        EmailProcessor::new(
            transport,
            limiters,
            ConfirmationStore::new(100),
            CircuitBreakerPolicy::new(5, Duration::from_secs(30)),
            TimeoutPolicy::new(Duration::from_secs(5)).unwrap(),
            BulkheadPolicy::new(8),
        )
    }

    #[tokio::test]
    async fn delivers_with_valid_recipient() {
        let transport = Arc::new(StubTransport { fail: AtomicBool::new(false) });
        let proc = processor(transport);
        let n = notification_with(HashSet::from([Channel::Email]), Some("a@example.com"));

        let outcome = proc.process(&n).await;
        assert!(outcome.success);
        assert!(outcome.delivered.contains(&Channel::Email));
        assert_eq!(proc.confirmations.get_for_notification("n1").len(), 2);
    }

    #[tokio::test]
    async fn fails_without_recipient_and_does_not_retry() {
        let transport = Arc::new(StubTransport { fail: AtomicBool::new(false) });
        let proc = processor(transport);
        let n = notification_with(HashSet::from([Channel::Email]), None);

        let outcome = proc.process(&n).await;
        assert!(!outcome.success);
        assert!(!outcome.retryable);
    }

    #[tokio::test]
    async fn transport_failure_is_recorded_and_retryable() {
        let transport = Arc::new(StubTransport { fail: AtomicBool::new(true) });
        let proc = processor(transport);
        let n = notification_with(HashSet::from([Channel::Email]), Some("a@example.com"));

        let outcome = proc.process(&n).await;
        assert!(!outcome.success);
        assert!(outcome.retryable);
        let confirmations = proc.confirmations.get_for_notification("n1");
        assert_eq!(confirmations.len(), 2);
    }

    #[test]
    fn template_selection_uses_event_type() {
        let mut n = notification_with(HashSet::from([Channel::Email]), Some("a@example.com"));
        n.payload.event_type = Some("order".to_string());
        assert_eq!(template_id_for(&n), "order-confirmation");
    }
}
