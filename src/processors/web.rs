//! Web processor: delivers a notification over the Real-Time Fabric to
//! whichever connections it resolves to (by user, then site, then tenant).

use super::{ChannelProcessor, ProcessOutcome, ProcessorSnapshot, ProcessorStats};
use crate::model::{now_ms, Channel, Notification, Priority};
use crate::rate_limit::KeyedLimiters;
use crate::realtime::BroadcastTarget;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

/// `toast`/`modal` placement driven entirely by priority.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct DisplayOptions {
    pub style: &'static str,
    pub position: &'static str,
    pub duration_ms: u64,
}

fn display_options_for(priority: Priority) -> DisplayOptions {
    if priority >= Priority::Urgent {
        DisplayOptions { style: "modal", position: "center", duration_ms: 10_000 }
    } else {
        DisplayOptions { style: "toast", position: "bottom-right", duration_ms: 4_000 }
    }
}

fn synthesize_title_and_body(notification: &Notification) -> (String, String) {
    if let (Some(title), Some(message)) = (&notification.payload.title, &notification.payload.message) {
        return (title.clone(), message.clone());
    }

    match notification.payload.event_type.as_deref() {
        Some("order") => {
            let product = notification.payload.data.get("product").and_then(|v| v.as_str()).unwrap_or("an item");
            let location =
                notification.payload.data.get("location").and_then(|v| v.as_str()).unwrap_or("your area");
            let name = notification.payload.data.get("name").and_then(|v| v.as_str()).unwrap_or("Someone");
            (
                "\u{1F6CD}\u{FE0F} New Purchase!".to_string(),
                format!("{name} just bought {product} from {location}"),
            )
        }
        Some(other) => (format!("New {other} event"), String::new()),
        None => ("Notification".to_string(), String::new()),
    }
}

pub struct WebProcessor {
    fabric: Arc<dyn BroadcastTarget>,
    limiters: Arc<KeyedLimiters>,
    stats: ProcessorStats,
}

impl WebProcessor {
    pub fn new(fabric: Arc<dyn BroadcastTarget>, limiters: Arc<KeyedLimiters>) -> Self {
        Self { fabric, limiters, stats: ProcessorStats::default() }
    }

    fn build_payload(&self, notification: &Notification) -> serde_json::Value {
        let (title, body) = synthesize_title_and_body(notification);
        let display = display_options_for(notification.priority);
        json!({
            "id": notification.id,
            "type": notification.payload.event_type,
            "title": title,
            "body": body,
            "data": notification.payload.data,
            "timestamp": now_ms(),
            "tenant": notification.tenant_id,
            "site": notification.site_id,
            "priority": notification.priority,
            "display": display,
            "content": notification.payload.message,
            "image": notification.payload.image_url,
        })
    }
}

#[async_trait]
impl ChannelProcessor for WebProcessor {
    fn channel(&self) -> Channel {
        Channel::Web
    }

    async fn process(&self, notification: &Notification) -> ProcessOutcome {
        if !notification.channels.contains(&Channel::Web) {
            return ProcessOutcome::not_requested();
        }

        let key = format!("web:{}", notification.tenant_id);
        if !self.limiters.check(&key, 1).await.is_allowed() {
            self.stats.record_failed();
            return ProcessOutcome::failed(Channel::Web, "rate limit exceeded", true);
        }

        self.stats.record_sent();
        let start = now_ms();
        let payload = self.build_payload(notification);
        let message: Arc<str> = Arc::from(payload.to_string());

        let (matched, sent) = self.fabric.send_targeted(
            &notification.tenant_id,
            notification.site_id.as_deref(),
            &notification.targeting.user_ids,
            message,
        );

        if matched == 0 || sent == matched {
            self.stats.record_delivered((now_ms() - start) as f64);
            ProcessOutcome::delivered(Channel::Web)
        } else if sent == 0 {
            self.stats.record_failed();
            ProcessOutcome::failed(Channel::Web, "no connection accepted delivery", true)
        } else {
            // Partial: some connections delivered, some didn't. Still counted
            // as success at the router level.
            self.stats.record_delivered((now_ms() - start) as f64);
            ProcessOutcome::delivered(Channel::Web)
        }
    }

    fn stats(&self) -> ProcessorSnapshot {
        self.stats.snapshot()
    }
}
