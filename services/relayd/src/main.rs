//! faultline relayd
//!
//! Standalone fault-injecting TCP relay.
//!
//! This service:
//! - Listens on a loopback port and relays every client to one upstream
//! - Reads fault commands (drop, suspend, reset, disconnect) from stdin
//! - Tears everything down on Ctrl-C, `quit`, or end of input

use std::time::Duration;

use anyhow::{Context, Result};
use faultline_relay::Proxy;
use faultline_relayd::{console, Config};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Grace period for blocking tasks at exit; a pending stdin read never finishes.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

fn main() -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start tokio runtime")?;

    let result = runtime.block_on(run());
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    result
}

async fn run() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to FAULTLINE_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting faultline relayd");
    info!(
        target_host = %config.target_host,
        target_port = config.target_port,
        listen_port = config.listen_port,
        buffer_size = config.buffer_size,
        backlog = config.backlog,
        "Configuration loaded"
    );

    let proxy = Proxy::bind(config.relay_config())
        .await
        .with_context(|| format!("Failed to listen on port {}", config.listen_port))?;

    info!(listen_addr = %proxy.local_addr(), "Relay listening");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = console::run(&proxy, tokio::io::stdin()) => {
            match result {
                Ok(()) => info!("Console closed"),
                Err(e) => error!(error = %e, "Console read failed"),
            }
        }
    }

    proxy.dispose();

    let stats = proxy.stats();
    info!(
        connections_accepted = stats.connections_accepted,
        connections_closed = stats.connections_closed,
        upstream_connect_failed = stats.upstream_connect_failed,
        bytes_client_to_upstream = stats.bytes_client_to_upstream,
        bytes_upstream_to_client = stats.bytes_upstream_to_client,
        bytes_dropped = stats.bytes_dropped,
        "Relayd shutdown complete"
    );

    Ok(())
}
