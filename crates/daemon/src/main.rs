// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 proxid Contributors

// proxid - Daemon
// HTTP control plane for a single local SOCKS tunnel

mod api;
mod config;
mod tunnel;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use proxid_common::HostDirectory;

use api::{create_router, AppState};
use config::DaemonConfig;
use tunnel::TunnelManager;

#[derive(Parser)]
#[command(name = "proxid")]
#[command(about = "Switch a local SOCKS tunnel between SSH hosts over HTTP", long_about = None)]
#[command(version)]
struct Args {
    /// HTTP control API port
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Local SOCKS port of the tunnel
    #[arg(short = 's', long)]
    socks_port: Option<u16>,

    /// Address the control API binds to
    #[arg(short = 'b', long)]
    bind: Option<String>,

    /// Daemon configuration file (default: ~/.config/proxid/daemon.toml)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// SSH client configuration to read hosts from (default: ~/.ssh/config)
    #[arg(long)]
    ssh_config: Option<PathBuf>,
}

impl Args {
    fn apply(self, config: &mut DaemonConfig) {
        if let Some(port) = self.port {
            config.http_port = port;
        }
        if let Some(port) = self.socks_port {
            config.socks_port = port;
        }
        if let Some(bind) = self.bind {
            config.bind_host = bind;
        }
        if let Some(path) = self.ssh_config {
            config.ssh_config_path = path;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "proxid=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    info!("proxid daemon starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut daemon_config = DaemonConfig::load(args.config.as_deref())?;
    args.apply(&mut daemon_config);
    daemon_config
        .validate()
        .context("Configuration validation failed")?;

    let hosts = HostDirectory::load(
        &daemon_config.ssh_config_path,
        daemon_config.default_user.as_deref(),
    )
    .with_context(|| {
        format!(
            "Failed to load hosts from {}",
            daemon_config.ssh_config_path.display()
        )
    })?;

    let tunnel_manager = TunnelManager::spawn(daemon_config.tunnel_command());
    info!("Tunnel SOCKS port: {}", daemon_config.socks_port);

    // Subscribe to tunnel events for logging
    let mut event_rx = tunnel_manager.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            info!("Tunnel event: {:?}", event);
        }
    });

    let state = Arc::new(AppState {
        tunnel_manager: tunnel_manager.clone(),
        hosts,
    });
    let app = create_router(state);

    let bind_address = daemon_config.bind_address();
    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("Failed to bind to {}", bind_address))?;

    info!("Serving control API on http://{}", bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    // Do not leave an orphaned tunnel behind
    if tunnel_manager.stop().await {
        info!("Tunnel stopped");
    } else {
        warn!("Failed to stop tunnel during shutdown");
    }

    info!("Daemon shut down");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
