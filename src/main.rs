//! Wintermute Gateway - sharded Discord gateway client
//!
//! This is a standalone gateway process that:
//! - Discovers the gateway URL and shard count via the REST API
//! - Runs one websocket shard per shard id with staggered identifies
//! - Reconnects, resumes, and re-shards autonomously
//! - Exposes health/ready endpoints and Prometheus metrics

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use wintermute_gateway::config::GatewayConfig;
use wintermute_gateway::health::{self, AppState};
use wintermute_gateway::metrics::GatewayMetrics;
use wintermute_gateway::rest::{self, Discovery, RestClient};
use wintermute_gateway::shard::{PoolCommand, ShardPool, ShardPoolOptions};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first to get log level
    let config = GatewayConfig::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("wintermute_gateway={}", config.log_level).parse()?)
                .add_directive("tungstenite=info".parse()?),
        )
        .json()
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting gateway");

    let metrics = Arc::new(GatewayMetrics::new());

    let discovery: Arc<dyn Discovery> = Arc::new(RestClient::new(config.discord_token.clone()));
    let gateway = discovery.gateway_bot().await?;
    let shard_count = config.total_shards.unwrap_or(gateway.shards);

    info!(
        shard_count,
        recommended_shards = gateway.shards,
        remaining_starts = gateway.session_start_limit.remaining,
        "gateway discovered"
    );

    let (output_tx, mut output_rx) = mpsc::unbounded_channel();
    let (command_tx, command_rx) = mpsc::unbounded_channel();

    let pool = ShardPool::new(
        ShardPoolOptions {
            token: config.discord_token.clone(),
            gateway_url: rest::versioned_gateway_url(&gateway.url),
            shard_count,
            shard_ids: (0..shard_count).collect(),
            stop_on_fatal: config.stop_on_fatal,
            handle_reshard: config.handle_reshard,
            buffer_size: config.buffer_size,
        },
        discovery,
        output_tx,
        Arc::clone(&metrics),
    );
    let status = pool.status();

    // Drain the output channel; a real application routes these into
    // its event bus.
    tokio::spawn(async move {
        while let Some(event) = output_rx.recv().await {
            let (event_type, _) = event.parts();
            debug!(event_type, "output event");
        }
    });

    let app_state = AppState {
        status,
        metrics: Arc::clone(&metrics),
    };
    let router = health::router(app_state);
    let addr: SocketAddr = ([0, 0, 0, 0], config.http_port).into();

    info!(port = config.http_port, "starting HTTP server");
    let http_server = axum::serve(tokio::net::TcpListener::bind(addr).await?, router);

    let mut bot = tokio::spawn(pool.run(command_rx));

    tokio::select! {
        result = &mut bot => {
            match result {
                Ok(Ok(())) => info!("bot loop exited"),
                Ok(Err(e)) => error!(error = %e, "bot loop error"),
                Err(e) => error!(error = %e, "bot task failed"),
            }
        }
        result = http_server => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server error");
            }
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received, draining shards");
            let _ = command_tx.send(PoolCommand::Disconnect);
            if let Ok(Err(e)) = bot.await {
                error!(error = %e, "bot loop error during shutdown");
            }
        }
    }

    info!("gateway shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
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
