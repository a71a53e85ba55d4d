//! Push processor: resolves device tokens for a tenant (optionally scoped
//! to specific users), maps priority to provider push priority, and sends
//! through a transport collaborator wrapped in circuit breaker + timeout +
//! bulkhead.

use super::{ChannelProcessor, ProcessOutcome, ProcessorSnapshot, ProcessorStats};
use crate::confirmation::ConfirmationStore;
use crate::model::{now_ms, Channel, Notification, Priority};
use crate::rate_limit::KeyedLimiters;
use crate::{BulkheadPolicy, CircuitBreakerPolicy, ResilienceError, TimeoutPolicy};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, thiserror::Error)]
pub enum PushTransportError {
    #[error("provider request failed: {0}")]
    Provider(String),
    #[error("token rejected by provider: {0}")]
    InvalidToken(String),
}

#[derive(Debug, Clone)]
pub struct PushMessage {
    pub tokens: Vec<String>,
    pub title: String,
    pub body: String,
    pub priority: &'static str,
    pub ttl: Duration,
    pub badge: Option<u32>,
    pub sound: Option<String>,
    pub click_action: Option<String>,
    pub data: serde_json::Map<String, serde_json::Value>,
}

/// Outcome of one send call: tokens the provider rejected are reported so
/// the caller can deactivate them.
#[derive(Debug, Default)]
pub struct PushSendResult {
    pub invalid_tokens: Vec<String>,
}

#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn send(&self, message: &PushMessage) -> Result<PushSendResult, PushTransportError>;
}

pub struct HttpPushTransport {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl HttpPushTransport {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self { client: reqwest::Client::new(), endpoint: endpoint.into(), api_key: api_key.into() }
    }
}

#[async_trait]
impl PushTransport for HttpPushTransport {
    async fn send(&self, message: &PushMessage) -> Result<PushSendResult, PushTransportError> {
        #[derive(serde::Deserialize, Default)]
        struct ProviderResponse {
            #[serde(default)]
            invalid_tokens: Vec<String>,
        }

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "tokens": message.tokens,
                "title": message.title,
                "body": message.body,
                "priority": message.priority,
                "ttl_seconds": message.ttl.as_secs(),
                "badge": message.badge,
                "sound": message.sound,
                "click_action": message.click_action,
                "data": message.data,
            }))
            .send()
            .await
            .map_err(|e| PushTransportError::Provider(e.to_string()))?;

        if !response.status().is_success() {
            return Err(PushTransportError::Provider(format!("provider returned {}", response.status())));
        }

        let parsed: ProviderResponse =
            response.json().await.map_err(|e| PushTransportError::Provider(e.to_string()))?;
        Ok(PushSendResult { invalid_tokens: parsed.invalid_tokens })
    }
}

/// Tenant/user -> device token registry. Tokens are opaque strings handed
/// back by the client SDK at registration time.
#[derive(Default)]
pub struct DeviceTokenRegistry {
    by_user: DashMap<String, Vec<String>>,
}

impl DeviceTokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, user_id: impl Into<String>, token: impl Into<String>) {
        self.by_user.entry(user_id.into()).or_default().push(token.into());
    }

    pub fn deactivate(&self, token: &str) {
        for mut entry in self.by_user.iter_mut() {
            entry.retain(|t| t != token);
        }
    }

    /// Tokens for the given users, or for every known user if `user_ids` is empty.
    pub fn tokens_for(&self, user_ids: &[String]) -> Vec<String> {
        if user_ids.is_empty() {
            self.by_user.iter().flat_map(|e| e.value().clone()).collect()
        } else {
            user_ids.iter().filter_map(|u| self.by_user.get(u).map(|v| v.value().clone())).flatten().collect()
        }
    }
}

fn push_priority(priority: Priority) -> &'static str {
    if priority >= Priority::Urgent {
        "high"
    } else {
        "normal"
    }
}

fn title_and_body(notification: &Notification) -> (String, String) {
    (
        notification.payload.title.clone().unwrap_or_else(|| "Notification".to_string()),
        notification.payload.message.clone().unwrap_or_default(),
    )
}

pub struct PushProcessor {
    transport: Arc<dyn PushTransport>,
    tokens: Arc<DeviceTokenRegistry>,
    limiters: Arc<KeyedLimiters>,
    confirmations: ConfirmationStore,
    circuit_breaker: CircuitBreakerPolicy,
    timeout: TimeoutPolicy,
    bulkhead: BulkheadPolicy,
    stats: ProcessorStats,
}

impl PushProcessor {
    pub fn new(
        transport: Arc<dyn PushTransport>,
        tokens: Arc<DeviceTokenRegistry>,
        limiters: Arc<KeyedLimiters>,
        confirmations: ConfirmationStore,
        circuit_breaker: CircuitBreakerPolicy,
        timeout: TimeoutPolicy,
        bulkhead: BulkheadPolicy,
    ) -> Self {
        Self {
            transport,
            tokens,
            limiters,
            confirmations,
            circuit_breaker,
            timeout,
            bulkhead,
            stats: ProcessorStats::default(),
        }
    }
}

#[async_trait]
impl ChannelProcessor for PushProcessor {
    fn channel(&self) -> Channel {
        Channel::Push
    }

    async fn process(&self, notification: &Notification) -> ProcessOutcome {
        if !notification.channels.contains(&Channel::Push) {
            return ProcessOutcome::not_requested();
        }

        let tokens = self.tokens.tokens_for(&notification.targeting.user_ids);
        if tokens.is_empty() {
            self.stats.record_failed();
            return ProcessOutcome::failed(Channel::Push, "no device tokens", false);
        }

        let key = format!("push:{}", notification.tenant_id);
        if !self.limiters.check(&key, 1).await.is_allowed() {
            self.stats.record_failed();
            return ProcessOutcome::failed(Channel::Push, "rate limit exceeded", true);
        }

        let (title, body) = title_and_body(notification);
        let message = PushMessage {
            tokens,
            title,
            body,
            priority: push_priority(notification.priority),
            ttl: DEFAULT_TTL,
            badge: None,
            sound: None,
            click_action: None,
            data: notification.payload.data.clone(),
        };

        self.stats.record_sent();
        let _ = self.confirmations.record_sent(&notification.id, &notification.tenant_id, Channel::Push);

        let start = now_ms();
        let transport = self.transport.clone();
        let result = self
            .circuit_breaker
            .execute(|| {
                let timeout = self.timeout;
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
            Ok(send_result) => {
                for token in &send_result.invalid_tokens {
                    self.tokens.deactivate(token);
                }
                self.stats.record_delivered((now_ms() - start) as f64);
                let _ =
                    self.confirmations.record_delivered(&notification.id, &notification.tenant_id, Channel::Push);
                ProcessOutcome::delivered(Channel::Push)
            }
            Err(e) => {
                self.stats.record_failed();
                let message = e.to_string();
                let _ = self.confirmations.record_failed(
                    &notification.id,
                    &notification.tenant_id,
                    Channel::Push,
                    message.clone(),
                );
                let retryable =
                    !matches!(e, ResilienceError::Bulkhead { .. } | ResilienceError::CircuitOpen { .. });
                ProcessOutcome::failed(Channel::Push, message, retryable)
            }
        }
    }

    fn stats(&self) -> ProcessorSnapshot {
        self.stats.snapshot()
    }
}
