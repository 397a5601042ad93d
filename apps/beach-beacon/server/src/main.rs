use std::sync::Arc;

use anyhow::{Context, Result};
use beach_beacon_core::{BroadcastHub, HubConfig};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal;
use tracing::info;

mod config;
mod http;
mod stream;
mod telemetry;

use crate::config::{Cli, ServerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    let telemetry = telemetry::Telemetry::init(&config.telemetry)?;

    info!(
        listen_addr = %config.listen_addr,
        heartbeat_secs = config.heartbeat_interval.as_secs(),
        channel_depth = config.channel_depth,
        "starting beach-beacon server"
    );

    run(config, telemetry.metrics_handle()).await
}

async fn run(config: ServerConfig, metrics: PrometheusHandle) -> Result<()> {
    let hub = BroadcastHub::new(HubConfig {
        heartbeat_interval: config.heartbeat_interval,
    });
    let state = Arc::new(http::AppState::new(hub.clone(), config.channel_depth, metrics));
    let router = http::build_router(state);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;

    info!("beach-beacon listening on {}", config.listen_addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(hub))
        .await
        .context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");

    Ok(())
}

/// Event streams never finish on their own, so the hub is shut down as soon as
/// the signal arrives; that ends every stream and lets the server drain.
async fn shutdown_signal(hub: BroadcastHub) {
    let _ = signal::ctrl_c().await;
    let closed = hub.shutdown();
    info!(closed, "closed push connections");
}
