//! Channel Router (C5): filters a notification's channel set by
//! preference/quiet-hours/frequency rules, fans delivery out across Channel
//! Processors in parallel, retries the channels that failed, then applies a
//! fallback strategy for whatever is still failing.

use crate::model::{Channel, ChannelPreference, FallbackStrategy, FrequencyPolicy, Notification};
use crate::processors::ProcessorRegistry;
use crate::sleeper::{Sleeper, TokioSleeper};
use chrono::{FixedOffset, Timelike, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Per-user, per-channel preference lookup. Kept separate from the
/// Confirmation Store and rate limiter since preferences are configuration,
/// not runtime telemetry.
pub trait PreferenceStore: Send + Sync {
    fn get(&self, user_id: &str, channel: Channel) -> Option<ChannelPreference>;
}

#[derive(Default)]
pub struct InMemoryPreferenceStore {
    prefs: DashMap<(String, Channel), ChannelPreference>,
}

impl InMemoryPreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, pref: ChannelPreference) {
        self.prefs.insert((pref.user_id.clone(), pref.channel), pref);
    }
}

impl PreferenceStore for InMemoryPreferenceStore {
    fn get(&self, user_id: &str, channel: Channel) -> Option<ChannelPreference> {
        self.prefs.get(&(user_id.to_string(), channel)).map(|e| e.value().clone())
    }
}

/// Outcome of routing one notification across channels.
#[derive(Debug, Clone, Default)]
pub struct RouteResult {
    pub success: bool,
    pub delivered_channels: HashSet<Channel>,
    pub failed_channels: HashSet<Channel>,
    pub total: usize,
    pub errors: HashMap<Channel, String>,
    pub retry_count: u32,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub max_retries: u32,
    pub initial_retry_delay: Duration,
    pub backoff_multiplier: f64,
    pub fallback: FallbackStrategy,
    pub globally_enabled: HashSet<Channel>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_retry_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            fallback: FallbackStrategy::None,
            globally_enabled: HashSet::from(Channel::ALL),
        }
    }
}

/// `initial × multiplier^retry_count`, overflow-safe the same way
/// `Backoff::delay` guards its exponentiation.
fn retry_delay(initial: Duration, multiplier: f64, retry_count: u32) -> Duration {
    let factor = multiplier.powi(retry_count as i32);
    let millis = (initial.as_millis() as f64 * factor).min(u64::MAX as f64);
    Duration::from_millis(millis as u64)
}

/// Resolves the current hour-of-day (0-23) in `timezone`. `timezone` is a
/// fixed UTC offset string (e.g. `"+09:00"`); anything else, including
/// absence, resolves to UTC. A full IANA tz database is outside this
/// component's scope (see design notes).
fn current_hour_in(timezone: Option<&str>) -> u8 {
    match timezone.and_then(parse_fixed_offset) {
        Some(offset) => Utc::now().with_timezone(&offset).hour() as u8,
        None => Utc::now().hour() as u8,
    }
}

fn parse_fixed_offset(tz: &str) -> Option<FixedOffset> {
    let (sign, rest) = match tz.as_bytes().first()? {
        b'+' => (1, &tz[1..]),
        b'-' => (-1, &tz[1..]),
        _ => return None,
    };
    let (hours, minutes) = rest.split_once(':')?;
    let hours: i32 = hours.parse().ok()?;
    let minutes: i32 = minutes.parse().ok()?;
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

pub struct ChannelRouter<S: Sleeper = TokioSleeper> {
    processors: Arc<ProcessorRegistry>,
    preferences: Arc<dyn PreferenceStore>,
    config: RouterConfig,
    sleeper: S,
}

impl ChannelRouter<TokioSleeper> {
    pub fn new(processors: Arc<ProcessorRegistry>, preferences: Arc<dyn PreferenceStore>, config: RouterConfig) -> Self {
        Self { processors, preferences, config, sleeper: TokioSleeper }
    }
}

impl<S: Sleeper> ChannelRouter<S> {
    pub fn with_sleeper(
        processors: Arc<ProcessorRegistry>,
        preferences: Arc<dyn PreferenceStore>,
        config: RouterConfig,
        sleeper: S,
    ) -> Self {
        Self { processors, preferences, config, sleeper }
    }

    /// Step 1: channels surviving preferences, quiet hours, frequency, and
    /// the global enable set.
    fn filter_channels(&self, notification: &Notification) -> HashSet<Channel> {
        notification
            .channels
            .iter()
            .copied()
            .filter(|channel| self.config.globally_enabled.contains(channel))
            .filter(|channel| {
                let Some(user_id) = &notification.user_id else {
                    return true;
                };
                match self.preferences.get(user_id, *channel) {
                    None => true,
                    Some(pref) => {
                        if !pref.opted_in || pref.frequency == FrequencyPolicy::Disabled {
                            return false;
                        }
                        if let Some(quiet) = &pref.quiet_hours {
                            let hour = current_hour_in(notification.scheduling.timezone.as_deref());
                            if quiet.contains(hour) {
                                return false;
                            }
                        }
                        true
                    }
                }
            })
            .collect()
    }

    async fn attempt(
        &self,
        notification: &Notification,
        channels: &HashSet<Channel>,
    ) -> (HashSet<Channel>, HashMap<Channel, String>) {
        let attempts = channels.iter().copied().map(|channel| {
            let processor = self.processors.get(channel);
            async move {
                match processor {
                    Some(p) => (channel, p.process(notification).await),
                    None => (
                        channel,
                        crate::processors::ProcessOutcome::failed(channel, "no processor registered", false),
                    ),
                }
            }
        });

        let mut delivered = HashSet::new();
        let mut errors = HashMap::new();
        for (channel, outcome) in join_all(attempts).await {
            if outcome.delivered.contains(&channel) {
                delivered.insert(channel);
            } else if let Some(err) = outcome.error {
                errors.insert(channel, err);
            } else {
                errors.insert(channel, "delivery failed".to_string());
            }
        }
        (delivered, errors)
    }

    pub async fn route(&self, notification: &Notification) -> RouteResult {
        let start = Instant::now();
        let surviving = self.filter_channels(notification);
        if surviving.is_empty() {
            return RouteResult { success: true, elapsed: start.elapsed(), ..Default::default() };
        }

        let mut delivered = HashSet::new();
        let mut failed: HashSet<Channel> = surviving.clone();
        let mut errors = HashMap::new();
        let mut retry_count = 0u32;

        let (first_delivered, first_errors) = self.attempt(notification, &failed).await;
        failed.retain(|c| !first_delivered.contains(c));
        delivered.extend(first_delivered);
        errors.extend(first_errors);

        while !failed.is_empty() && retry_count < self.config.max_retries {
            let delay = retry_delay(self.config.initial_retry_delay, self.config.backoff_multiplier, retry_count);
            self.sleeper.sleep(delay).await;

            let (retried_delivered, retried_errors) = self.attempt(notification, &failed).await;
            failed.retain(|c| !retried_delivered.contains(c));
            delivered.extend(retried_delivered);
            errors.extend(retried_errors);
            retry_count += 1;
        }

        if !failed.is_empty() {
            let fallback_channels: HashSet<Channel> = match self.config.fallback {
                FallbackStrategy::None => HashSet::new(),
                FallbackStrategy::Email => HashSet::from([Channel::Email]),
                FallbackStrategy::Web => HashSet::from([Channel::Web]),
                FallbackStrategy::All => Channel::ALL.into_iter().collect(),
            };
            let to_try: HashSet<Channel> = fallback_channels
                .into_iter()
                .filter(|c| self.config.globally_enabled.contains(c) && !delivered.contains(c))
                .collect();
            if !to_try.is_empty() {
                let (fallback_delivered, fallback_errors) = self.attempt(notification, &to_try).await;
                failed.retain(|c| !fallback_delivered.contains(c));
                delivered.extend(fallback_delivered);
                errors.extend(fallback_errors);
            }
        }

        RouteResult {
            success: failed.is_empty(),
            total: surviving.len(),
            delivered_channels: delivered,
            failed_channels: failed,
            errors,
            retry_count,
            elapsed: start.elapsed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        DeliveryPolicy, NotificationMetadata, NotificationStatus, Payload, Priority, QuietHours, Scheduling,
        Targeting,
    };
    use crate::processors::{ChannelProcessor, ProcessOutcome, ProcessorSnapshot};
    use crate::sleeper::InstantSleeper;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedProcessor {
        channel: Channel,
        fail_first_n: AtomicU32,
    }

    #[async_trait]
    impl ChannelProcessor for ScriptedProcessor {
        fn channel(&self) -> Channel {
            self.channel
        }

        async fn process(&self, _notification: &Notification) -> ProcessOutcome {
            let remaining = self.fail_first_n.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_first_n.fetch_sub(1, Ordering::SeqCst);
                ProcessOutcome::failed(self.channel, "transient", true)
            } else {
                ProcessOutcome::delivered(self.channel)
            }
        }

        fn stats(&self) -> ProcessorSnapshot {
            ProcessorSnapshot::default()
        }
    }

    fn notification(channels: HashSet<Channel>, user_id: Option<String>) -> Notification {
        Notification {
            id: "n1".into(),
            tenant_id: "acme".into(),
            site_id: None,
            user_id,
            priority: Priority::Normal,
            channels,
            payload: Payload::default(),
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

    fn router_with(
        processors: ProcessorRegistry,
        preferences: InMemoryPreferenceStore,
        config: RouterConfig,
    ) -> ChannelRouter<InstantSleeper> {
        ChannelRouter::with_sleeper(Arc::new(processors), Arc::new(preferences), config, InstantSleeper)
    }

    #[tokio::test]
    async fn empty_surviving_set_is_success_with_nothing_delivered() {
        let mut registry = ProcessorRegistry::new();
        registry.register(Arc::new(ScriptedProcessor { channel: Channel::Web, fail_first_n: AtomicU32::new(0) }));
        let router = router_with(registry, InMemoryPreferenceStore::new(), RouterConfig::default());

        let n = notification(HashSet::new(), None);
        let result = router.route(&n).await;
        assert!(result.success);
        assert!(result.delivered_channels.is_empty());
    }

    #[tokio::test]
    async fn retry_loop_recovers_transient_failure() {
        let mut registry = ProcessorRegistry::new();
        registry.register(Arc::new(ScriptedProcessor { channel: Channel::Web, fail_first_n: AtomicU32::new(1) }));
        let config = RouterConfig { max_retries: 2, ..Default::default() };
        let router = router_with(registry, InMemoryPreferenceStore::new(), config);

        let n = notification(HashSet::from([Channel::Web]), None);
        let result = router.route(&n).await;
        assert!(result.success);
        assert_eq!(result.retry_count, 1);
        assert!(result.delivered_channels.contains(&Channel::Web));
    }

    #[tokio::test]
    async fn fallback_strategy_covers_residual_failure() {
        let mut registry = ProcessorRegistry::new();
        registry.register(Arc::new(ScriptedProcessor { channel: Channel::Push, fail_first_n: AtomicU32::new(100) }));
        registry.register(Arc::new(ScriptedProcessor { channel: Channel::Email, fail_first_n: AtomicU32::new(0) }));
        let config = RouterConfig { max_retries: 0, fallback: FallbackStrategy::Email, ..Default::default() };
        let router = router_with(registry, InMemoryPreferenceStore::new(), config);

        let n = notification(HashSet::from([Channel::Push]), None);
        let result = router.route(&n).await;
        assert!(result.success);
        assert!(result.delivered_channels.contains(&Channel::Email));
    }

    #[tokio::test]
    async fn disabled_preference_removes_channel_before_dispatch() {
        let mut registry = ProcessorRegistry::new();
        registry.register(Arc::new(ScriptedProcessor { channel: Channel::Email, fail_first_n: AtomicU32::new(0) }));
        let prefs = InMemoryPreferenceStore::new();
        prefs.set(ChannelPreference {
            user_id: "u1".into(),
            channel: Channel::Email,
            opted_in: false,
            quiet_hours: None,
            frequency: FrequencyPolicy::Immediate,
        });
        let router = router_with(registry, prefs, RouterConfig::default());

        let n = notification(HashSet::from([Channel::Email]), Some("u1".into()));
        let result = router.route(&n).await;
        assert!(result.success);
        assert!(result.delivered_channels.is_empty());
    }

    #[test]
    fn quiet_hours_block_matching_hour() {
        let window = QuietHours { start_hour: 0, end_hour: 23 };
        assert!(window.contains(12));
    }

    #[test]
    fn retry_delay_grows_with_multiplier() {
        assert_eq!(retry_delay(Duration::from_millis(100), 2.0, 0), Duration::from_millis(100));
        assert_eq!(retry_delay(Duration::from_millis(100), 2.0, 1), Duration::from_millis(200));
        assert_eq!(retry_delay(Duration::from_millis(100), 2.0, 2), Duration::from_millis(400));
    }

    #[test]
    fn fixed_offset_parses_signed_hhmm() {
        assert!(parse_fixed_offset("+09:00").is_some());
        assert!(parse_fixed_offset("-05:00").is_some());
        assert!(parse_fixed_offset("garbage").is_none());
    }
}
