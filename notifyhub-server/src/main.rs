use clap::Parser;
use tracing::error;

use notifyhub_server::config::ServerConfig;

#[tokio::main]
async fn main() {
    let config = ServerConfig::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.pipeline.rust_log.clone())),
        )
        .init();

    if let Err(e) = notifyhub_server::run(config).await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}
