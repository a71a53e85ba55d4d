//! Pipeline-wide configuration. One [`PipelineConfig`] is parsed once at the
//! binary entry point and handed down to every subsystem's constructor.

use clap::Parser;
use std::collections::HashMap;
use std::time::Duration;

/// Per-channel rate limit triple, parsed from a `perSecond,perMinute,perHour`
/// environment convention rather than a config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitTriple {
    pub per_second: u32,
    pub per_minute: u32,
    pub per_hour: u32,
}

impl Default for RateLimitTriple {
    fn default() -> Self {
        Self { per_second: 10, per_minute: 300, per_hour: 5000 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseTripleError(String);

impl std::fmt::Display for ParseTripleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid rate limit triple: {}", self.0)
    }
}

impl std::error::Error for ParseTripleError {}

impl std::str::FromStr for RateLimitTriple {
    type Err = ParseTripleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(',').collect();
        if parts.len() != 3 {
            return Err(ParseTripleError(format!(
                "expected 3 comma-separated values, got {}: {s}",
                parts.len()
            )));
        }
        let parse = |p: &str| p.trim().parse::<u32>().map_err(|_| ParseTripleError(s.to_string()));
        Ok(Self { per_second: parse(parts[0])?, per_minute: parse(parts[1])?, per_hour: parse(parts[2])? })
    }
}

/// Parses `CHANNEL=perSecond,perMinute,perHour` entries into a per-channel map.
/// Unrecognized channel names are kept verbatim as keys; callers decide whether
/// to reject them.
pub fn parse_channel_rate_limits(raw: &str) -> Result<HashMap<String, RateLimitTriple>, ParseTripleError> {
    let mut out = HashMap::new();
    for entry in raw.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        let (channel, triple) = entry
            .split_once('=')
            .ok_or_else(|| ParseTripleError(format!("missing '=' in entry: {entry}")))?;
        out.insert(channel.trim().to_string(), triple.parse()?);
    }
    Ok(out)
}

/// Every tunable named in the environment table, overridable by env var or
/// CLI flag. Defaults mirror the documented environment convention exactly.
#[derive(Debug, Clone, Parser)]
#[command(name = "notifyhub", about = "Multi-channel notification delivery pipeline")]
pub struct PipelineConfig {
    #[arg(long, env = "MAX_QUEUE_SIZE", default_value_t = 100_000)]
    pub max_queue_size: usize,

    #[arg(long, env = "BATCH_SIZE", default_value_t = 50)]
    pub batch_size: usize,

    #[arg(long, env = "PROCESSING_INTERVAL_MS", default_value_t = 1_000)]
    pub processing_interval_ms: u64,

    #[arg(long, env = "RETRY_INTERVAL_MS", default_value_t = 5_000)]
    pub retry_interval_ms: u64,

    #[arg(long, env = "MAX_RETRIES", default_value_t = 3)]
    pub max_retries: u32,

    #[arg(long, env = "DEFAULT_RETRY_DELAY_MS", default_value_t = 5_000)]
    pub default_retry_delay_ms: u64,

    #[arg(long, env = "DEFAULT_RETRY_BACKOFF", default_value_t = 2.0)]
    pub default_retry_backoff: f64,

    #[arg(long, env = "SSE_PING_INTERVAL_MS", default_value_t = 30_000)]
    pub sse_ping_interval_ms: u64,

    #[arg(long, env = "SSE_TIMEOUT_MS", default_value_t = 60_000)]
    pub sse_timeout_ms: u64,

    #[arg(long, env = "MAX_CONNECTIONS_PUSH_STREAM", default_value_t = 5_000)]
    pub max_connections_push_stream: usize,

    #[arg(long, env = "MAX_CONNECTIONS_BIDIRECTIONAL", default_value_t = 10_000)]
    pub max_connections_bidirectional: usize,

    /// `CHANNEL=perSecond,perMinute,perHour;CHANNEL2=...`
    #[arg(long, env = "CHANNEL_RATE_LIMITS", default_value = "")]
    pub channel_rate_limits_raw: String,

    #[arg(long, env = "CONFIRMATION_FLUSH_INTERVAL_MS", default_value_t = 2_000)]
    pub confirmation_flush_interval_ms: u64,

    #[arg(long, env = "CONFIRMATION_FLUSH_BATCH_SIZE", default_value_t = 200)]
    pub confirmation_flush_batch_size: usize,

    #[arg(long, env = "CONFIRMATION_MAX_PENDING", default_value_t = 50_000)]
    pub confirmation_max_pending: usize,

    #[arg(long, env = "CONFIRMATION_RETENTION_SECS", default_value_t = 2_592_000)]
    pub confirmation_retention_secs: u64,

    #[arg(long, env = "NOTIFICATION_RETENTION_SECS", default_value_t = 86_400)]
    pub notification_retention_secs: u64,

    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub rust_log: String,

    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8080")]
    pub bind_addr: String,
}

impl PipelineConfig {
    pub fn processing_interval(&self) -> Duration {
        Duration::from_millis(self.processing_interval_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn sse_ping_interval(&self) -> Duration {
        Duration::from_millis(self.sse_ping_interval_ms)
    }

    pub fn sse_timeout(&self) -> Duration {
        Duration::from_millis(self.sse_timeout_ms)
    }

    pub fn confirmation_flush_interval(&self) -> Duration {
        Duration::from_millis(self.confirmation_flush_interval_ms)
    }

    pub fn confirmation_retention(&self) -> Duration {
        Duration::from_secs(self.confirmation_retention_secs)
    }

    pub fn notification_retention(&self) -> Duration {
        Duration::from_secs(self.notification_retention_secs)
    }

    pub fn channel_rate_limits(&self) -> Result<HashMap<String, RateLimitTriple>, ParseTripleError> {
        parse_channel_rate_limits(&self.channel_rate_limits_raw)
    }
}
