//! notifyhub-server: the HTTP + real-time front door for the notification
//! pipeline. `run` is the construction root — it builds [`state::AppState`],
//! spawns the background tick tasks every subsystem needs, and serves the
//! axum router until shutdown.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;
pub mod telemetry;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;

use config::ServerConfig;
use state::AppState;

pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    let pipeline = config.pipeline.clone();
    let state = Arc::new(AppState::build(config)?);

    state.dispatcher.clone().spawn_processing_task(pipeline.processing_interval());
    state.dispatcher.clone().spawn_retry_task(pipeline.retry_interval());
    state.dispatcher.clone().spawn_age_out_task(pipeline.processing_interval(), pipeline.notification_retention());

    state.confirmations.clone().spawn_retention_task(pipeline.confirmation_flush_interval(), pipeline.confirmation_retention());
    state.confirmations.clone().spawn_flush_task(pipeline.confirmation_flush_interval(), |batch| async move {
        tracing::debug!(count = batch.len(), "flushed confirmation batch");
        Ok(())
    });
    spawn_heartbeat(&state, &pipeline);

    let router = routes::build_router(state);
    let listener = TcpListener::bind(&pipeline.bind_addr).await?;
    tracing::info!(addr = %pipeline.bind_addr, "notifyhub-server listening");

    axum::serve(listener, router).with_graceful_shutdown(shutdown_signal()).await?;
    Ok(())
}

fn spawn_heartbeat(state: &Arc<AppState>, pipeline: &notifyhub::config::PipelineConfig) {
    let realtime = state.realtime.clone();
    let ping_interval = pipeline.sse_ping_interval();
    let timeout = pipeline.sse_timeout();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(ping_interval);
        loop {
            ticker.tick().await;
            let ping = serde_json::json!({"event": "ping", "data": {}}).to_string();
            let closed = realtime.heartbeat_tick(std::sync::Arc::from(ping), timeout);
            if closed > 0 {
                tracing::debug!(closed, "heartbeat sweep closed stale connections");
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
