//! Channel Processors (C3): take a notification, deliver through exactly
//! one channel, and report a per-channel outcome. A *channel → processor*
//! mapping is data (a [`ProcessorRegistry`]), not an inheritance hierarchy.

pub mod email;
pub mod push;
pub mod stats;
pub mod web;

pub use stats::{ProcessorSnapshot, ProcessorStats};

use crate::model::{Channel, Notification};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Outcome of attempting delivery through one channel.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutcome {
    pub success: bool,
    pub delivered: HashSet<Channel>,
    pub failed: HashSet<Channel>,
    pub error: Option<String>,
    /// Set by processors that know an error will never resolve on retry
    /// (e.g. "no device tokens"). The Dispatcher still counts the attempt,
    /// but callers that want to short-circuit retries may check this.
    pub retryable: bool,
}

impl ProcessOutcome {
    pub fn not_requested() -> Self {
        Self { success: true, ..Default::default() }
    }

    pub fn delivered(channel: Channel) -> Self {
        Self { success: true, delivered: HashSet::from([channel]), ..Default::default() }
    }

    pub fn failed(channel: Channel, error: impl Into<String>, retryable: bool) -> Self {
        Self {
            success: false,
            failed: HashSet::from([channel]),
            error: Some(error.into()),
            retryable,
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait ChannelProcessor: Send + Sync {
    fn channel(&self) -> Channel;
    async fn process(&self, notification: &Notification) -> ProcessOutcome;
    fn stats(&self) -> ProcessorSnapshot;
}

/// Channel-name-keyed processor lookup. Registration is data: callers build
/// this once at the construction root and hand it to the Channel Router.
#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    processors: HashMap<Channel, Arc<dyn ChannelProcessor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, processor: Arc<dyn ChannelProcessor>) {
        self.processors.insert(processor.channel(), processor);
    }

    pub fn get(&self, channel: Channel) -> Option<Arc<dyn ChannelProcessor>> {
        self.processors.get(&channel).cloned()
    }

    pub fn channels(&self) -> impl Iterator<Item = Channel> + '_ {
        self.processors.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubProcessor(Channel);

    #[async_trait]
    impl ChannelProcessor for StubProcessor {
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

    #[test]
    fn registry_looks_up_by_channel() {
        let mut registry = ProcessorRegistry::new();
        registry.register(Arc::new(StubProcessor(Channel::Web)));
        assert!(registry.get(Channel::Web).is_some());
        assert!(registry.get(Channel::Email).is_none());
    }
}
