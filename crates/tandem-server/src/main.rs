//! tandem-server: two-peer WebRTC signaling relay.
//!
//! Accepts WebSocket connections, pairs the first two peers, tells the
//! earlier one to start the offer, and relays offer/answer/candidate
//! messages between them without looking inside.

mod config;
mod relay;
mod server;
mod transport;

use clap::Parser;
use config::ServerConfig;
use server::SignalServer;
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::{error, info};

/// tandem-server — two-peer signaling relay
#[derive(Parser, Debug)]
#[command(name = "tandem-server", version, about = "Two-peer WebRTC signaling relay")]
struct Cli {
    /// Listen port (default 8080)
    #[arg(short, long)]
    port: Option<u16>,

    /// Listen address (default 0.0.0.0)
    #[arg(long)]
    bind: Option<IpAddr>,

    /// Config file path
    #[arg(long, default_value = "~/.tandem/config.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting tandem-server");

    let config_path = PathBuf::from(&cli.config);
    let server_config = match ServerConfig::load(Some(&config_path), cli.port, cli.bind) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let server = SignalServer::new(server_config);
    if let Err(e) = server.run(shutdown_signal()).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }

    info!("tandem-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
