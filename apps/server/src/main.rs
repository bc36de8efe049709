//! Squelch Server - standalone headless voice relay.
//!
//! Accepts WebSocket clients on `/ws`, groups them into named channels,
//! and relays per-listener mix-minus audio at a 20 ms cadence. The admin
//! HTTP API and panel are served from the same port.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use squelch_core::constants::DEFAULT_ADMIN_TOKEN;
use squelch_core::{start_server, watchdog, AppState, ConnectionManager, Relay};
use tokio::signal;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;

/// Squelch Server - channel-based push-to-talk voice relay.
#[derive(Parser, Debug)]
#[command(name = "squelch-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "SQUELCH_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Bind port (overrides config file).
    #[arg(short = 'p', long, env = "PORT")]
    port: Option<u16>,

    /// Admin bearer token (overrides config file).
    #[arg(long, env = "ADMIN_TOKEN", hide_env_values = true)]
    admin_token: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Squelch Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config =
        ServerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    // Apply CLI overrides
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(token) = args.admin_token {
        config.admin_token = token;
    }
    if config.admin_token == DEFAULT_ADMIN_TOKEN {
        log::warn!("Using the default admin token - set ADMIN_TOKEN in production");
    }

    let relay = Arc::new(Relay::new());
    let connections = Arc::new(ConnectionManager::new());

    // Liveness watchdog evicts sessions that stop pinging.
    let watchdog_cancel = CancellationToken::new();
    tokio::spawn(watchdog::run(Arc::clone(&relay), watchdog_cancel.clone()));

    let state = AppState {
        relay,
        connections: Arc::clone(&connections),
        admin_token: config.admin_token.clone(),
    };

    let port = config.port;
    let mut server_handle = tokio::spawn(async move { start_server(state, port).await });

    tokio::select! {
        // Bind failure (the only fatal startup error) lands here.
        res = &mut server_handle => {
            watchdog_cancel.cancel();
            res.context("Server task panicked")??;
            anyhow::bail!("Server exited unexpectedly");
        }
        _ = shutdown_signal() => {
            log::info!("Shutdown signal received, cleaning up...");
            watchdog_cancel.cancel();
            let closed = connections.close_all();
            server_handle.abort();
            log::info!("Shutdown complete ({} connection(s) closed)", closed);
        }
    }

    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
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
