//! Control-topic subscribers
//!
//! Tunnel and credential notices reconfigure the [`TunnelManager`] at
//! runtime; pings are only logged.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use tether_core::config::{SAVED_CA_FILE, SAVED_CERT_FILE, SAVED_KEY_FILE};
use tether_core::error::{BusError, TunnelError};
use tether_core::message::{CredentialNotice, TunnelNotice};
use tether_core::{BusMessage, MessageBus, RouteSpec, Subjects, Subscription, TlsBundle};

use crate::tunnel::TunnelManager;

/// Apply a tunnel notice: point the tunnel at the new server and expose
/// `client_port` on `server_port`.
pub fn apply_tunnel_notice(tunnel: &TunnelManager, data: &[u8]) -> anyhow::Result<RouteSpec> {
    let notice: TunnelNotice = serde_json::from_slice(data).context("Malformed tunnel notice")?;
    if !notice.is_complete() {
        anyhow::bail!("Tunnel notice requires server, server_port and client_port");
    }

    tunnel.set_server(&notice.server)?;
    let route = RouteSpec::remote(notice.server_port, "localhost", notice.client_port);
    tunnel.add_route(route.clone());
    restart_tunnel(tunnel);
    Ok(route)
}

/// Apply a credential notice: persist the PEM files under `dir` and swap
/// the bundle into the tunnel.
pub fn apply_credential_notice(tunnel: &TunnelManager, dir: &Path, data: &[u8]) -> anyhow::Result<()> {
    let notice: CredentialNotice =
        serde_json::from_slice(data).context("Malformed credential notice")?;
    if !notice.is_complete() {
        anyhow::bail!("Credential notice requires certificate, private_key and root_ca");
    }

    let bundle = TlsBundle::new(
        notice.root_ca.as_bytes(),
        notice.certificate.as_bytes(),
        notice.private_key.as_bytes(),
    )?;

    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    write_pem(&dir.join(SAVED_CERT_FILE), &notice.certificate, 0o644)?;
    write_pem(&dir.join(SAVED_KEY_FILE), &notice.private_key, 0o600)?;
    write_pem(&dir.join(SAVED_CA_FILE), &notice.root_ca, 0o644)?;
    tracing::info!("Saved tunnel credentials to {}", dir.display());

    tunnel.set_credentials(bundle);
    restart_tunnel(tunnel);
    Ok(())
}

fn write_pem(path: &Path, contents: &str, mode: u32) -> io::Result<()> {
    fs::write(path, contents)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    Ok(())
}

fn restart_tunnel(tunnel: &TunnelManager) {
    match tunnel.restart() {
        Ok(()) => tracing::info!("Tunnel restarted with {} route(s)", tunnel.routes().len()),
        Err(e @ TunnelError::NotReady { .. }) => tracing::info!("{}; waiting for more configuration", e),
        Err(e) => tracing::warn!("Failed to restart tunnel: {}", e),
    }
}

/// Where credential notices are written when no data directory is configured
pub fn fallback_credentials_dir() -> PathBuf {
    std::env::temp_dir().join(format!("tether-credentials-{}", std::process::id()))
}

/// Subscribe the tunnel, credential and ping consumers.
///
/// The consumers exit when `shutdown` is cancelled or the bus closes.
pub fn spawn_subscribers(
    bus: &dyn MessageBus,
    subjects: &Subjects,
    tunnel: Arc<TunnelManager>,
    credentials_dir: PathBuf,
    shutdown: CancellationToken,
) -> Result<Vec<JoinHandle<()>>, BusError> {
    let tunnels = bus.subscribe(&subjects.tunnels)?;
    let credentials = bus.subscribe(&subjects.credentials)?;
    let pings = bus.subscribe(&subjects.ping)?;

    let tunnel_notices = {
        let tunnel = Arc::clone(&tunnel);
        consume(tunnels, shutdown.clone(), move |message| {
            match apply_tunnel_notice(&tunnel, &message.data) {
                Ok(route) => tracing::info!("Tunnel notice applied, route {}", route),
                Err(e) => tracing::warn!("Dropping tunnel notice: {:#}", e),
            }
        })
    };

    let credential_notices = consume(credentials, shutdown.clone(), move |message| {
        if let Err(e) = apply_credential_notice(&tunnel, &credentials_dir, &message.data) {
            tracing::warn!("Dropping credential notice: {:#}", e);
        }
    });

    let ping = consume(pings, shutdown, |message| {
        tracing::info!(
            "Ping at {:?}: {}",
            message.time,
            String::from_utf8_lossy(&message.data)
        );
    });

    Ok(vec![tunnel_notices, credential_notices, ping])
}

fn consume(
    mut subscription: Subscription,
    shutdown: CancellationToken,
    on_message: impl Fn(BusMessage) + Send + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                message = subscription.recv() => match message {
                    Some(message) => on_message(message),
                    None => break,
                },
            }
        }
        tracing::debug!("Subscriber for {} stopped", subscription.subject());
    })
}
