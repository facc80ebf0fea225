//! tether daemon
//!
//! Waits for capability triggers on the message bus and serves ephemeral,
//! certificate-authenticated shell sessions through a reverse tunnel.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tether_core::config::{self, DaemonConfig};
use tether_daemon::Daemon;

#[derive(Parser)]
#[command(name = "tetherd")]
#[command(about = "tether device daemon - remote shell sessions over a reverse tunnel")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "TETHER_CONFIG")]
    config: Option<PathBuf>,

    /// Device name (defaults to hostname)
    #[arg(long, env = "TETHER_DEVICE_NAME")]
    device_name: Option<String>,

    /// Directory for persisted state such as tunnel credentials
    #[arg(long, env = "TETHER_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Rendezvous server for the reverse tunnel
    #[arg(long, env = "TETHER_TUNNEL_SERVER")]
    tunnel_server: Option<String>,

    /// CA certificate for the tunnel connection
    #[arg(long, env = "TETHER_TLS_CA")]
    tls_ca: Option<PathBuf>,

    /// Client certificate for the tunnel connection
    #[arg(long, env = "TETHER_TLS_CERT")]
    tls_cert: Option<PathBuf>,

    /// Client key for the tunnel connection
    #[arg(long, env = "TETHER_TLS_KEY")]
    tls_key: Option<PathBuf>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", env = "TETHER_LOG_LEVEL")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.foreground {
        "debug"
    } else {
        &args.log_level
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("tether daemon starting...");

    let config = load_daemon_config(&args)?;
    let daemon = Daemon::new(config).context("Failed to initialise daemon")?;

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            wait_for_signal().await;
            tracing::info!("Termination signal received");
            shutdown.cancel();
        }
    });

    daemon.run(shutdown).await
}

fn load_daemon_config(args: &Args) -> Result<DaemonConfig> {
    let path = args.config.clone().unwrap_or_else(config::default_config_path);
    let mut config = if path.exists() {
        config::load_config(&path).with_context(|| format!("Failed to load config from {:?}", path))?
    } else {
        if args.config.is_some() {
            anyhow::bail!("Config file {:?} does not exist", path);
        }
        tracing::debug!("No config at {:?}, using defaults", path);
        DaemonConfig::default()
    };

    if let Some(name) = &args.device_name {
        config.device_name = Some(name.clone());
    }
    if let Some(dir) = &args.data_dir {
        config.data_dir = Some(dir.clone());
    }
    if let Some(server) = &args.tunnel_server {
        config.tunnel.server_address = Some(server.clone());
    }
    if let Some(ca) = &args.tls_ca {
        config.tunnel.tls.ca_file = Some(ca.clone());
    }
    if let Some(cert) = &args.tls_cert {
        config.tunnel.tls.cert_file = Some(cert.clone());
    }
    if let Some(key) = &args.tls_key {
        config.tunnel.tls.key_file = Some(key.clone());
    }
    config.apply_saved_credentials();

    Ok(config)
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
