//! Configuration relay server.
//!
//! # Architecture Overview
//!
//! ```text
//!                  ┌──────────────────────────────────────────────────────────┐
//!                  │                      CONFIG RELAY                        │
//!                  │                                                          │
//!   REST writes ───┼─▶ http ──▶ StorageGateway ──▶ endpoint ring (failover)   │
//!                  │                   │                                      │
//!                  │                   ▼ watch                                │
//!                  │             ChangeFeed (resync on compaction)            │
//!                  │                   │                                      │
//!                  │                   ▼                                      │
//!   WebSocket  ◀───┼── http ◀── BroadcastHub (per-scope queues, heartbeats)   │
//!                  │                   │                                      │
//!                  │                   ▼                                      │
//!                  │             ClientCache (TTL, stale bound, defaults)     │
//!                  │                                                          │
//!                  │   ClusterMonitor · tracing · metrics · lifecycle         │
//!                  └──────────────────────────────────────────────────────────┘
//! ```

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;

use config_relay::config::loader::load_or_default;
use config_relay::lifecycle::{signals::shutdown_signal, startup::memory_cluster};
use config_relay::observability::{logging::init_logging, metrics::init_metrics};
use config_relay::{HttpServer, RelayRuntime};

#[derive(Parser)]
#[command(name = "config-relay")]
#[command(about = "Replicated configuration relay", long_about = None)]
struct Args {
    /// TOML configuration file; built-in defaults when omitted.
    #[arg(short, long, env = "CONFIG_RELAY_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_or_default(args.config.as_deref())?;

    init_logging(&config.observability);
    tracing::info!("config-relay v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        bind_address = %config.listener.bind_address,
        endpoints = config.storage.endpoints.len(),
        retry_budget = config.storage.retry_budget,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        if let Ok(addr) = config.observability.metrics_address.parse() {
            init_metrics(addr);
        } else {
            tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            );
        }
    }

    let cluster = memory_cluster(&config)?;
    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let runtime = Arc::new(RelayRuntime::build(config, cluster.backends()));
    runtime.start();

    let server = HttpServer::new(runtime.clone());
    server.run(listener, shutdown_signal()).await?;

    runtime.shutdown().await;

    tracing::info!("Shutdown complete");
    Ok(())
}
