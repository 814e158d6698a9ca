//! Viaduct Proxy Server - Entry Point
//!
//! Starts the proxy server with graceful shutdown support.

use std::sync::Arc;

use tokio::signal;
use tokio::sync::{broadcast, watch};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod error;
mod models;
mod proxy;

use config::Config;
use models::RelayRecord;
use proxy::counters::ServerStats;
use proxy::server::{ProxyServerBuilder, StaticPrepare};

#[tokio::main]
async fn main() -> error::Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("viaduct={}", config.log.level).into());
    if config.log.format == "json" {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    info!("Starting Viaduct Proxy Server");
    if let Some(upstream) = &config.upstream {
        info!("Routing through upstream proxy {}", upstream.redacted());
    }

    // Relay completion records (bounded to prevent memory leaks)
    let (record_tx, mut record_rx) = broadcast::channel::<RelayRecord>(1024);
    let stats = Arc::new(ServerStats::new());

    // Access-log style reporting of completed relays
    let record_task = tokio::spawn(async move {
        loop {
            match record_rx.recv().await {
                Ok(record) => {
                    info!(
                        method = %record.method,
                        target = %record.target,
                        outcome = %record.outcome,
                        status = record.status_code,
                        bytes_sent = record.bytes_sent,
                        bytes_received = record.bytes_received,
                        duration_ms = record.duration_ms,
                        "relay finished"
                    );
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    error!("relay record logger lagged, skipped {} records", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Create proxy server
    let server = ProxyServerBuilder::new(config.server.clone())
        .prepare(Arc::new(StaticPrepare::new(config.handler_config())))
        .record_sender(record_tx)
        .stats(stats.clone())
        .build();

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server_task = tokio::spawn(async move {
        if let Err(e) = server.run(shutdown_rx).await {
            error!("Proxy server error: {}", e);
        }
    });

    info!("Proxy server started on {}", config.listen_addr());

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(true);
    let _ = server_task.await;
    record_task.abort();

    let snapshot = stats.snapshot();
    info!(
        connections = snapshot.connections,
        relays = snapshot.relays,
        tunnels = snapshot.tunnels,
        failures = snapshot.failures,
        bytes_sent = snapshot.bytes_sent,
        bytes_received = snapshot.bytes_received,
        "Viaduct Proxy Server stopped"
    );
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
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
