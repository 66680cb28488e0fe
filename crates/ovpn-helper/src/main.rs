//! eduVPN OpenVPN Helper
//!
//! Privileged daemon that starts OpenVPN on behalf of the eduVPN app.
//! Before anything runs, the OpenVPN binary and every script must carry our
//! code identity, and the configuration must not contain directives that
//! execute commands.

mod config;
mod handler;
mod server;

use anyhow::{Context, Result};
use clap::Parser;
use ovpn_protocol::{HELPER_VERSION, SERVICE_NAME};
use ovpn_supervisor::{Supervisor, SystemLauncher};
use ovpn_trust::verifier_for;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{DEFAULT_CONFIG_PATH, HelperConfig};
use crate::server::ControlEndpoint;

// Use mimalloc as the global allocator
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Privileged OpenVPN helper for eduVPN
#[derive(Debug, Parser)]
#[command(name = "ovpn-helper", version, about)]
struct Args {
    /// Helper configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Validate the configuration and exit
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let loaded = HelperConfig::load(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    let from_file = loaded.is_some();
    let config = loaded.unwrap_or_default();
    config.validate().context("Invalid helper configuration")?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_filter)),
        )
        .init();

    if from_file {
        info!("Loaded configuration from {}", args.config.display());
    } else {
        info!("No configuration at {}, using defaults", args.config.display());
    }
    if args.check_config {
        info!("Configuration OK");
        return Ok(());
    }

    info!("{} {} starting", SERVICE_NAME, HELPER_VERSION);
    if !nix::unistd::geteuid().is_root() {
        warn!("Not running as root; OpenVPN will not be able to configure the tunnel");
    }

    let supervisor = Supervisor::new(
        verifier_for(&config.trust),
        config.sanitizer(),
        Arc::new(SystemLauncher),
        config.supervisor_settings(),
    );

    let endpoint = ControlEndpoint::bind(&config.socket_path, supervisor)
        .with_context(|| format!("Failed to bind {}", config.socket_path.display()))?
        .with_allowed_uids(config.allowed_uids.clone());
    if config.allowed_uids.is_empty() {
        warn!("allowed_uids is empty; any local user may connect");
    }
    endpoint.serve(shutdown_signal()).await;

    info!("{} stopped", SERVICE_NAME);
    Ok(())
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Cannot listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = interrupt => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}
