//! Server-binary configuration: the pipeline-wide tunables plus the
//! transport credentials only this binary needs (the library crate has no
//! opinion on which email/push provider is behind the wire).

use clap::Parser;
use notifyhub::config::PipelineConfig;

#[derive(Debug, Clone, Parser)]
#[command(name = "notifyhub-server", about = "notifyhub HTTP + real-time server")]
pub struct ServerConfig {
    #[command(flatten)]
    pub pipeline: PipelineConfig,

    #[arg(long, env = "EMAIL_PROVIDER_ENDPOINT", default_value = "https://api.example.com/v1/send")]
    pub email_provider_endpoint: String,

    #[arg(long, env = "EMAIL_PROVIDER_API_KEY", default_value = "")]
    pub email_provider_api_key: String,

    #[arg(long, env = "PUSH_PROVIDER_ENDPOINT", default_value = "https://api.example.com/v1/push")]
    pub push_provider_endpoint: String,

    #[arg(long, env = "PUSH_PROVIDER_API_KEY", default_value = "")]
    pub push_provider_api_key: String,

    /// Where to write the JSONL telemetry stream, when the `jsonl-sink`
    /// feature is enabled.
    #[arg(long, env = "EVENT_LOG_PATH", default_value = "notifyhub-events.jsonl")]
    pub event_log_path: String,
}
