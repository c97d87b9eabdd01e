//! Request lifecycle server.
//!
//! # Architecture Overview
//!
//! ```text
//!                       ┌──────────────────────────────────────────────┐
//!     Client Request    │  ┌─────────────┐   ┌───────────┐   ┌───────┐ │
//!     ──────────────────┼─▶│ correlation │──▶│ signaler  │──▶│ rate  │ │
//!                       │  │   layer     │   │ (headers) │   │ limit │ │
//!                       │  └─────────────┘   └───────────┘   └───┬───┘ │
//!                       │                                        ▼     │
//!     Client Response   │                                   ┌────────┐ │
//!     ◀─────────────────┼──── X-Correlation-ID, X-RateLimit-*│handler │ │
//!                       │                                   └────────┘ │
//!                       └──────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;

use request_lifecycle::config::{load_config, LifecycleConfig};
use request_lifecycle::observability::{logging, metrics};
use request_lifecycle::{HttpServer, Shutdown};

#[derive(Parser)]
#[command(name = "request-lifecycle")]
#[command(about = "HTTP server with correlation ids and rate limit signaling", long_about = None)]
struct Args {
    /// Path to a TOML config file; defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => LifecycleConfig::default(),
    };

    logging::init(&config.observability)?;
    tracing::info!("request-lifecycle v{} starting", env!("CARGO_PKG_VERSION"));

    tracing::info!(
        bind_address = %config.listener.bind_address,
        rate_limit_enabled = config.rate_limit.enabled,
        max_requests = config.rate_limit.max_requests,
        window_secs = config.rate_limit.window_secs,
        request_timeout_secs = config.timeouts.request_secs,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let shutdown = Shutdown::new();
    let server = HttpServer::new(config);
    server.run(listener, shutdown.subscribe()).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
