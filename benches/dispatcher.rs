use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};

use notifyhub::dispatcher::{Dispatcher, DispatcherConfig, DispatchMode};
use notifyhub::model::{Channel, Notification, NotificationRequest, Priority};
use notifyhub::processors::{ChannelProcessor, ProcessOutcome, ProcessorRegistry, ProcessorSnapshot};
use notifyhub::router::{ChannelRouter, InMemoryPreferenceStore, RouterConfig};

/// Always reports success; exists purely to let the router/dispatcher stack
/// run under criterion without a live transport behind it.
struct EchoProcessor(Channel);

#[async_trait]
impl ChannelProcessor for EchoProcessor {
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

fn build_dispatcher(mode: DispatchMode) -> Arc<Dispatcher> {
    let mut processors = ProcessorRegistry::new();
    processors.register(Arc::new(EchoProcessor(Channel::Web)));
    processors.register(Arc::new(EchoProcessor(Channel::Email)));
    processors.register(Arc::new(EchoProcessor(Channel::Push)));

    let preferences = Arc::new(InMemoryPreferenceStore::new());
    let router = Arc::new(ChannelRouter::new(Arc::new(processors), preferences, RouterConfig::default()));

    let config = DispatcherConfig { batch_size: 50, mode, ..DispatcherConfig::default() };
    Arc::new(Dispatcher::new(router, config, None))
}

fn request(priority: Priority) -> NotificationRequest {
    NotificationRequest {
        tenant_id: "bench-tenant".to_string(),
        site_id: None,
        user_id: Some("bench-user".to_string()),
        priority,
        channels: HashSet::from([Channel::Web]),
        payload: Default::default(),
        targeting: Default::default(),
        scheduling: Default::default(),
        delivery_policy: None,
        metadata: Default::default(),
    }
}

const PRIORITIES: [Priority; 5] =
    [Priority::Critical, Priority::Urgent, Priority::High, Priority::Normal, Priority::Low];

/// Refills the queue with exactly one batch's worth of mixed-priority
/// notifications before each timed iteration, so every `dispatch_tick` call
/// measures a full batch rather than draining the queue over successive
/// iterations.
async fn refill_batch(dispatcher: &Dispatcher, batch_size: usize) {
    for i in 0..batch_size {
        dispatcher.enqueue(request(PRIORITIES[i % PRIORITIES.len()])).await.unwrap();
    }
}

/// How long a batch-selection tick takes with a full queue of mixed
/// priorities, priority-drain mode.
fn dispatch_tick_priority(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let dispatcher = build_dispatcher(DispatchMode::Priority);

    c.bench_function("dispatch_tick_priority_batch50", |b| {
        b.to_async(&rt).iter_batched(
            || rt.block_on(refill_batch(&dispatcher, 50)),
            |_| async { black_box(dispatcher.dispatch_tick().await) },
            BatchSize::SmallInput,
        );
    });
}

/// Same mixed-priority load under round-robin mode, which walks every bucket
/// once per tick instead of draining highest-priority first.
fn dispatch_tick_round_robin(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let dispatcher = build_dispatcher(DispatchMode::RoundRobin);

    c.bench_function("dispatch_tick_round_robin_batch50", |b| {
        b.to_async(&rt).iter_batched(
            || rt.block_on(refill_batch(&dispatcher, 50)),
            |_| async { black_box(dispatcher.dispatch_tick().await) },
            BatchSize::SmallInput,
        );
    });
}

/// Enqueue throughput alone, no tick — the FIFO bucket push path.
fn enqueue_throughput(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let dispatcher = build_dispatcher(DispatchMode::Priority);

    c.bench_function("enqueue_normal_priority", |b| {
        b.to_async(&rt).iter(|| async {
            let _ = black_box(dispatcher.enqueue(request(Priority::Normal)).await);
        });
    });
}

criterion_group!(benches, dispatch_tick_priority, dispatch_tick_round_robin, enqueue_throughput);
criterion_main!(benches);
