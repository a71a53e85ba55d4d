use crate::model::{Channel, ConfirmationStatus, DeliveryConfirmation};
use std::collections::HashMap;

/// Totals and rates computed from a confirmation set for one tenant/time range.
/// No time-series bucketing; a single roll-up over the queried range.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ConfirmationAnalytics {
    pub total: usize,
    pub delivered: usize,
    pub read: usize,
    pub clicked: usize,
    pub bounced: usize,
    pub failed: usize,
    pub delivery_rate: f64,
    pub read_rate: f64,
    pub click_rate: f64,
    pub bounce_rate: f64,
    pub per_channel: HashMap<Channel, ChannelBreakdown>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ChannelBreakdown {
    pub total: usize,
    pub delivered: usize,
    pub read: usize,
    pub clicked: usize,
    pub bounced: usize,
    pub failed: usize,
}

impl ConfirmationAnalytics {
    pub fn compute(records: &[DeliveryConfirmation]) -> Self {
        let mut out = ConfirmationAnalytics { total: records.len(), ..Default::default() };

        for record in records {
            let channel_entry = out.per_channel.entry(record.channel).or_default();
            channel_entry.total += 1;
            match record.status {
                ConfirmationStatus::Delivered => {
                    out.delivered += 1;
                    channel_entry.delivered += 1;
                }
                ConfirmationStatus::Read => {
                    out.read += 1;
                    channel_entry.read += 1;
                }
                ConfirmationStatus::Clicked => {
                    out.clicked += 1;
                    channel_entry.clicked += 1;
                }
                ConfirmationStatus::Bounced => {
                    out.bounced += 1;
                    channel_entry.bounced += 1;
                }
                ConfirmationStatus::Failed => {
                    out.failed += 1;
                    channel_entry.failed += 1;
                }
                ConfirmationStatus::Sent | ConfirmationStatus::Unsubscribed => {}
            }
        }

        let denom = out.total.max(1) as f64;
        out.delivery_rate = out.delivered as f64 / denom;
        out.read_rate = out.read as f64 / denom;
        out.click_rate = out.clicked as f64 / denom;
        out.bounce_rate = out.bounced as f64 / denom;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ConfirmationMetadata;

    fn confirmation(channel: Channel, status: ConfirmationStatus) -> DeliveryConfirmation {
        DeliveryConfirmation {
            id: "x".into(),
            notification_id: "n".into(),
            tenant_id: "t".into(),
            channel,
            status,
            timestamp_ms: 0,
            metadata: ConfirmationMetadata::default(),
        }
    }

    #[test]
    fn computes_rates_over_mixed_statuses() {
        let records = vec![
            confirmation(Channel::Email, ConfirmationStatus::Delivered),
            confirmation(Channel::Email, ConfirmationStatus::Read),
            confirmation(Channel::Push, ConfirmationStatus::Bounced),
            confirmation(Channel::Push, ConfirmationStatus::Sent),
        ];
        let analytics = ConfirmationAnalytics::compute(&records);
        assert_eq!(analytics.total, 4);
        assert_eq!(analytics.delivered, 1);
        assert_eq!(analytics.bounced, 1);
        assert_eq!(analytics.delivery_rate, 0.25);
        assert_eq!(analytics.per_channel[&Channel::Email].total, 2);
    }

    #[test]
    fn empty_set_has_zero_rates_without_division_by_zero() {
        let analytics = ConfirmationAnalytics::compute(&[]);
        assert_eq!(analytics.total, 0);
        assert_eq!(analytics.delivery_rate, 0.0);
    }
}
