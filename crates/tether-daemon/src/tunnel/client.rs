//! Outbound reverse tunnel over SSH-in-TLS
//!
//! Connects to the rendezvous server over mutual TLS, runs an SSH client
//! session inside it and asks the server to forward each route's remote
//! port back to the device. Forwarded connections are relayed to the
//! route's local address. The connection is re-established with
//! exponential backoff until the tunnel is cancelled.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Msg};
use russh::{Channel, Disconnect};
use russh_keys::PublicKey;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use tether_core::config::{BackoffConfig, TunnelConfig};
use tether_core::error::TunnelError;
use tether_core::RouteSpec;

use super::manager::{TunnelLauncher, TunnelPlan};
use super::reconnect::ExponentialBackoff;
use super::tls;

/// Default port when an `https://` address omits one
const DEFAULT_TLS_PORT: u16 = 443;

/// Bind address requested for routes with an explicit remote port
const REMOTE_BIND_ALL: &str = "0.0.0.0";

/// Split a rendezvous address into host and port.
///
/// Accepts `host:port`, `https://host:port` and `https://host`.
pub fn parse_server_address(address: &str) -> Result<(String, u16), TunnelError> {
    let invalid = || TunnelError::InvalidServer(address.to_string());
    let trimmed = address.trim();

    let (rest, default_port) = match trimmed.split_once("://") {
        Some(("https", rest)) | Some(("wss", rest)) => (rest, Some(DEFAULT_TLS_PORT)),
        Some(_) => return Err(invalid()),
        None => (trimmed, None),
    };
    let rest = rest.split('/').next().unwrap_or_default();
    if rest.is_empty() {
        return Err(invalid());
    }

    match rest.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port = port.parse::<u16>().map_err(|_| invalid())?;
            Ok((host.trim_matches(|c| c == '[' || c == ']').to_string(), port))
        }
        Some(_) => Err(invalid()),
        None => default_port.map(|port| (rest.to_string(), port)).ok_or_else(invalid),
    }
}

/// Picks the route a forwarded connection belongs to
fn route_for_port(routes: &[RouteSpec], connected_port: u32) -> Option<&RouteSpec> {
    routes
        .iter()
        .find(|r| r.remote_port != 0 && u32::from(r.remote_port) == connected_port)
        .or_else(|| routes.iter().find(|r| r.remote_port == 0))
}

/// SSH client handler that relays forwarded connections
struct ForwardHandler {
    routes: Arc<Vec<RouteSpec>>,
    /// Cancelled when the session (and thus this handler) goes away
    closed: CancellationToken,
}

impl Drop for ForwardHandler {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

#[async_trait]
impl client::Handler for ForwardHandler {
    type Error = anyhow::Error;

    /// The rendezvous server was already authenticated by mutual TLS
    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        tracing::debug!("Rendezvous host key: {}", server_public_key.fingerprint(russh_keys::HashAlg::Sha256));
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let Some(route) = route_for_port(&self.routes, connected_port).cloned() else {
            tracing::warn!(
                "No route for forwarded connection to {}:{}",
                connected_address,
                connected_port
            );
            let _ = channel.close().await;
            return Ok(());
        };

        tracing::debug!(
            "Forwarded connection from {}:{} via {}",
            originator_address,
            originator_port,
            route
        );

        tokio::spawn(async move {
            let mut local = match TcpStream::connect(route.local_addr()).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!("Cannot reach {}: {}", route.local_addr(), e);
                    let _ = channel.close().await;
                    return;
                }
            };
            let mut remote = channel.into_stream();
            match tokio::io::copy_bidirectional(&mut remote, &mut local).await {
                Ok((up, down)) => tracing::debug!("Relay {} done ({} up, {} down)", route, up, down),
                Err(e) => tracing::debug!("Relay {} ended: {}", route, e),
            }
        });

        Ok(())
    }
}

/// Production launcher: SSH reverse forwarding inside mutual TLS
pub struct SshTunnelLauncher {
    backoff: BackoffConfig,
    connect_timeout: Duration,
}

impl SshTunnelLauncher {
    pub fn new(config: &TunnelConfig) -> Self {
        Self {
            backoff: config.backoff.clone(),
            connect_timeout: config.connect_timeout,
        }
    }

    async fn with_timeout<T, E: std::fmt::Display>(
        &self,
        what: &str,
        fut: impl std::future::Future<Output = Result<T, E>>,
    ) -> Result<T, TunnelError> {
        tokio::time::timeout(self.connect_timeout, fut)
            .await
            .map_err(|_| TunnelError::Connect(format!("{} timed out", what)))?
            .map_err(|e| TunnelError::Connect(format!("{}: {}", what, e)))
    }

    /// One connection: returns once the session ends or `cancel` fires.
    async fn connect_and_serve(&self, plan: &TunnelPlan, cancel: &CancellationToken) -> Result<(), TunnelError> {
        let (host, port) = parse_server_address(&plan.server)?;
        let (connector, server_name) = tls::connector(&plan.tls, &host)?;

        tracing::debug!("Connecting to {}:{}", host, port);
        let tcp = self
            .with_timeout("tcp connect", TcpStream::connect((host.as_str(), port)))
            .await?;
        let stream = self
            .with_timeout("tls handshake", connector.connect(server_name, tcp))
            .await?;

        let closed = CancellationToken::new();
        let handler = ForwardHandler {
            routes: Arc::new(plan.routes.clone()),
            closed: closed.clone(),
        };
        let config = Arc::new(client::Config {
            keepalive_interval: Some(Duration::from_secs(25)),
            ..client::Config::default()
        });
        let mut session = self
            .with_timeout("ssh handshake", client::connect_stream(config, stream, handler))
            .await?;

        let authenticated = session
            .authenticate_none(plan.device_name.clone())
            .await
            .map_err(|e| TunnelError::Connect(format!("authentication: {}", e)))?;
        if !authenticated {
            return Err(TunnelError::Connect(format!(
                "rendezvous server rejected device {}",
                plan.device_name
            )));
        }

        for route in &plan.routes {
            let bind = if route.remote_port == 0 {
                plan.device_name.as_str()
            } else {
                REMOTE_BIND_ALL
            };
            session
                .tcpip_forward(bind, u32::from(route.remote_port))
                .await
                .map_err(|e| TunnelError::Connect(format!("forward {}: {}", route, e)))?;
            tracing::info!("Forwarding {}", route);
        }
        tracing::info!("Tunnel to {} established", plan.server);

        tokio::select! {
            _ = closed.cancelled() => {
                tracing::warn!("Tunnel to {} disconnected", plan.server);
            }
            _ = cancel.cancelled() => {
                let _ = session
                    .disconnect(Disconnect::ByApplication, "tunnel stopped", "en")
                    .await;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TunnelLauncher for SshTunnelLauncher {
    async fn run(&self, plan: TunnelPlan, cancel: CancellationToken) {
        let mut backoff = ExponentialBackoff::from_config(&self.backoff);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.connect_and_serve(&plan, &cancel) => match result {
                    Ok(()) => backoff.reset(),
                    Err(e) => tracing::warn!("Tunnel to {} failed: {}", plan.server, e),
                },
            }
            if cancel.is_cancelled() {
                break;
            }

            let delay = backoff.next_delay();
            tracing::info!("Reconnecting tunnel in {:?}", delay);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tracing::info!("Tunnel to {} stopped", plan.server);
    }
}
