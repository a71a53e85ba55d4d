//! Core data model shared by every component: the notification envelope,
//! its lifecycle states, real-time connections, and per-user preferences.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Delivery priority. Ordered so `Critical > High > Normal > Low`, with
/// `Urgent` sitting between `High` and `Critical` per the channel
/// processors' display-option threshold (`priority >= Urgent`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
    Critical,
}

impl Priority {
    pub const ALL: [Priority; 5] =
        [Priority::Critical, Priority::Urgent, Priority::High, Priority::Normal, Priority::Low];

    /// Priorities in dispatch order: highest first.
    pub fn dispatch_order() -> impl Iterator<Item = Priority> {
        Self::ALL.into_iter()
    }
}

/// A deliverable channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Web,
    Email,
    Push,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Web, Channel::Email, Channel::Push];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Web => "web",
            Channel::Email => "email",
            Channel::Push => "push",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Runtime lifecycle status of a queued notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Pending,
    Processing,
    Delivered,
    Failed,
    Retrying,
    Expired,
}

impl NotificationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NotificationStatus::Delivered | NotificationStatus::Failed | NotificationStatus::Expired)
    }
}

/// Per-channel frequency policy from a user's preferences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrequencyPolicy {
    Immediate,
    Hourly,
    Daily,
    Weekly,
    Disabled,
}

/// Fallback strategy applied by the Channel Router after retries exhaust
/// with residual failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackStrategy {
    None,
    Email,
    Web,
    All,
}

/// Arbitrary event payload carried by a notification.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Payload {
    #[serde(rename = "type", default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub data: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub template_id: Option<String>,
    #[serde(default)]
    pub template_vars: HashMap<String, String>,
}

/// Who a notification is aimed at.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Targeting {
    #[serde(default)]
    pub user_ids: Vec<String>,
    #[serde(default)]
    pub segments: Vec<String>,
    #[serde(default)]
    pub site_id: Option<String>,
}

/// Scheduling constraints on when a notification may be attempted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Scheduling {
    pub send_at_ms: Option<u64>,
    pub expires_at_ms: Option<u64>,
    pub timezone: Option<String>,
}

/// Retry shape for a single notification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DeliveryPolicy {
    pub max_attempts: u32,
    pub base_retry_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3, base_retry_delay_ms: 5_000, backoff_multiplier: 2.0 }
    }
}

/// Campaign/source bookkeeping, not interpreted by the pipeline itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationMetadata {
    pub campaign_id: Option<String>,
    pub ab_variant: Option<String>,
    pub source: Option<String>,
}

/// A queued notification: the unit of work the Dispatcher schedules, the
/// Channel Router routes, and the Channel Processors deliver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub tenant_id: String,
    pub site_id: Option<String>,
    pub user_id: Option<String>,
    pub priority: Priority,
    pub channels: HashSet<Channel>,
    pub payload: Payload,
    pub targeting: Targeting,
    pub scheduling: Scheduling,
    pub delivery_policy: DeliveryPolicy,
    pub metadata: NotificationMetadata,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,

    pub status: NotificationStatus,
    pub attempts: u32,
    pub last_attempt_ms: Option<u64>,
    pub last_error: Option<String>,
    pub delivered_channels: HashSet<Channel>,
    pub failed_channels: HashSet<Channel>,
    /// Wall-clock time the current `Retrying` delay expires; unused otherwise.
    pub retry_at_ms: Option<u64>,
}

impl Notification {
    /// Checks invariant 1 from the testable-properties section: delivered
    /// and failed channel sets are always disjoint.
    pub fn channels_disjoint(&self) -> bool {
        self.delivered_channels.is_disjoint(&self.failed_channels)
    }
}

/// A request to enqueue a notification, before an ID/status are assigned.
#[derive(Debug, Clone, Deserialize)]
pub struct NotificationRequest {
    pub tenant_id: String,
    pub site_id: Option<String>,
    pub user_id: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: Priority,
    pub channels: HashSet<Channel>,
    #[serde(default)]
    pub payload: Payload,
    #[serde(default)]
    pub targeting: Targeting,
    #[serde(default)]
    pub scheduling: Scheduling,
    #[serde(default)]
    pub delivery_policy: Option<DeliveryPolicy>,
    #[serde(default)]
    pub metadata: NotificationMetadata,
}

fn default_priority() -> Priority {
    Priority::Normal
}

/// A real-time subscriber's transport kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    PushStream,
    BidirectionalFrame,
}

/// State machine for a single real-time connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Handshaking,
    Authenticated,
    Active,
    Terminal,
}

/// A live real-time subscriber.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: String,
    pub transport: TransportKind,
    pub tenant_id: String,
    pub site_id: Option<String>,
    pub user_id: Option<String>,
    pub subscriptions: HashSet<String>,
    pub connected_at_ms: u64,
    pub last_activity_ms: u64,
    pub state: ConnectionState,
}

impl Connection {
    /// A subscription channel is authorized only if it is scoped to this
    /// connection's tenant, site, or user.
    pub fn authorizes_channel(&self, channel: &str) -> bool {
        if let Some(rest) = channel.strip_prefix("org:") {
            return rest == self.tenant_id;
        }
        if let Some(rest) = channel.strip_prefix("site:") {
            return self.site_id.as_deref() == Some(rest);
        }
        if let Some(rest) = channel.strip_prefix("user:") {
            return self.user_id.as_deref() == Some(rest);
        }
        false
    }
}

/// Delivery confirmation status, append-only once recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfirmationStatus {
    Sent,
    Delivered,
    Read,
    Clicked,
    Failed,
    Bounced,
    Unsubscribed,
}

/// Free-form confirmation metadata; fields are all optional by design since
/// different channels populate different subsets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfirmationMetadata {
    pub user_agent: Option<String>,
    pub ip: Option<String>,
    pub provider_message_id: Option<String>,
    pub error_code: Option<String>,
    pub error_text: Option<String>,
    pub clicked_url: Option<String>,
}

/// A single append-only delivery confirmation record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfirmation {
    pub id: String,
    pub notification_id: String,
    pub tenant_id: String,
    pub channel: Channel,
    pub status: ConfirmationStatus,
    pub timestamp_ms: u64,
    pub metadata: ConfirmationMetadata,
}

/// Per-user, per-channel preference record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelPreference {
    pub user_id: String,
    pub channel: Channel,
    pub opted_in: bool,
    pub quiet_hours: Option<QuietHours>,
    pub frequency: FrequencyPolicy,
}

/// A daily quiet-hours window expressed in the user's own timezone.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QuietHours {
    pub start_hour: u8,
    pub end_hour: u8,
}

impl QuietHours {
    /// Whether `hour` (0-23, already resolved to the user's timezone) falls
    /// inside the quiet window. Handles windows that wrap past midnight.
    pub fn contains(&self, hour: u8) -> bool {
        if self.start_hour <= self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}
