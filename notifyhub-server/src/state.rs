//! Construction root. One [`AppState`] is built once in `main` and handed to
//! every route; there is no global mutable state beyond it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use notifyhub::config::RateLimitTriple;
use notifyhub::confirmation::ConfirmationStore;
use notifyhub::dispatcher::{Dispatcher, DispatchMode, DispatcherConfig};
use notifyhub::processors::email::{EmailProcessor, HttpEmailTransport};
use notifyhub::processors::push::{DeviceTokenRegistry, HttpPushTransport, PushProcessor};
use notifyhub::processors::web::WebProcessor;
use notifyhub::processors::ProcessorRegistry;
use notifyhub::rate_limit::store::InMemoryTokenStore;
use notifyhub::rate_limit::strategies::FixedWindow;
use notifyhub::rate_limit::{KeyedLimiters, RateLimiter};
use notifyhub::realtime::{Authenticator, BroadcastTarget, DefaultAuthenticator, RealtimeFabric};
use notifyhub::router::{ChannelRouter, InMemoryPreferenceStore, RouterConfig};
use notifyhub::{BulkheadPolicy, CircuitBreakerPolicy, TimeoutPolicy};

use crate::config::ServerConfig;
use crate::error::NotifyError;

/// Chooses a per-channel rate limit triple for a `"{channel}:{tenant}"` key,
/// falling back to the configured default when the channel has no explicit
/// override.
fn channel_limiter_factory(
    limits: HashMap<String, RateLimitTriple>,
) -> impl Fn(&str) -> Arc<dyn RateLimiter> + Send + Sync + 'static {
    move |key: &str| {
        let channel = key.split(':').next().unwrap_or(key);
        let triple = limits.get(channel).copied().unwrap_or_default();
        Arc::new(FixedWindow::new(
            InMemoryTokenStore::new(),
            key.to_string(),
            triple.per_second,
            Duration::from_secs(1),
        ))
    }
}

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub confirmations: ConfirmationStore,
    pub realtime: Arc<RealtimeFabric>,
    pub tokens: Arc<DeviceTokenRegistry>,
    pub authenticator: Arc<dyn Authenticator>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    /// Wires every component together: processors into a router, the router
    /// into the dispatcher, plus the confirmation store and real-time fabric
    /// each processor needs a handle to.
    pub fn build(config: ServerConfig) -> Result<Self, NotifyError> {
        let config = Arc::new(config);
        let pipeline = &config.pipeline;
        let channel_limits =
            pipeline.channel_rate_limits().map_err(|e| NotifyError::Internal(e.to_string()))?;

        let dispatch_sink = crate::telemetry::dispatch_sink(&config);
        let confirmation_sink = crate::telemetry::confirmation_sink(&config);

        let confirmations = ConfirmationStore::with_sink(pipeline.confirmation_max_pending, confirmation_sink);
        let realtime = Arc::new(RealtimeFabric::new(
            pipeline.max_connections_push_stream,
            pipeline.max_connections_bidirectional,
        ));
        let tokens = Arc::new(DeviceTokenRegistry::new());
        let limiters = Arc::new(KeyedLimiters::new(channel_limiter_factory(channel_limits)));

        let mut processors = ProcessorRegistry::new();
        processors.register(Arc::new(WebProcessor::new(
            realtime.clone() as Arc<dyn BroadcastTarget>,
            limiters.clone(),
        )));
        processors.register(Arc::new(EmailProcessor::new(
            Arc::new(HttpEmailTransport::new(
                config.email_provider_endpoint.clone(),
                config.email_provider_api_key.clone(),
            )),
            limiters.clone(),
            confirmations.clone(),
            CircuitBreakerPolicy::new(5, Duration::from_secs(30)),
            TimeoutPolicy::new(Duration::from_secs(10)).map_err(|e| NotifyError::Internal(e.to_string()))?,
            BulkheadPolicy::new(32),
        )));
        processors.register(Arc::new(PushProcessor::new(
            Arc::new(HttpPushTransport::new(
                config.push_provider_endpoint.clone(),
                config.push_provider_api_key.clone(),
            )),
            tokens.clone(),
            limiters,
            confirmations.clone(),
            CircuitBreakerPolicy::new(5, Duration::from_secs(30)),
            TimeoutPolicy::new(Duration::from_secs(10)).map_err(|e| NotifyError::Internal(e.to_string()))?,
            BulkheadPolicy::new(32),
        )));

        let preferences = Arc::new(InMemoryPreferenceStore::new());
        let router_config = RouterConfig {
            max_retries: pipeline.max_retries,
            initial_retry_delay: Duration::from_millis(pipeline.default_retry_delay_ms),
            backoff_multiplier: pipeline.default_retry_backoff,
            ..RouterConfig::default()
        };
        let router = Arc::new(ChannelRouter::new(Arc::new(processors), preferences, router_config));

        let dispatcher_config = DispatcherConfig {
            max_size: pipeline.max_queue_size,
            batch_size: pipeline.batch_size,
            mode: DispatchMode::Priority,
            ..DispatcherConfig::default()
        };
        let dispatcher = Arc::new(Dispatcher::new(router, dispatcher_config, dispatch_sink));

        Ok(Self {
            dispatcher,
            confirmations,
            realtime,
            tokens,
            authenticator: Arc::new(DefaultAuthenticator),
            config,
        })
    }
}
