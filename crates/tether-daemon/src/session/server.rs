//! Certificate-authenticated shell server
//!
//! A [`SessionServer`] cycles through `Idle -> Configured -> Listening ->
//! ShuttingDown -> Idle`. At most one listener exists at a time; a second
//! start while one is active fails with `AlreadyRunning`.
//!
//! Shutdown always runs in the same order: stop accepting, warn every
//! terminal, wait out the grace period, force-close what is left, then wait
//! for all connection tasks before reporting `Idle`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use russh_keys::PrivateKey;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use tether_core::config::SessionServerConfig;
use tether_core::error::SessionServerError;
use tether_core::message::SessionStartPayload;
use tether_core::{ServerState, SessionKey};

use super::auth::{parse_host_key, CertificateAuthority};
use super::handler::{CancellableStream, ConnectionContext, RusshTransport, SessionCleanup, ShellHandler};
use super::pty::ShellSettings;
use super::registry::SessionRegistry;

/// Pause after a failed accept so a persistent error does not spin
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Why a listening server shut down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// `stop` was called
    Stopped,
    /// The configured lifetime elapsed
    LifetimeExpired(Duration),
}

impl ShutdownReason {
    /// First half of the notice shown to connected users
    pub fn message(&self) -> String {
        match self {
            ShutdownReason::Stopped => "Server shutdown initiated.".to_string(),
            ShutdownReason::LifetimeExpired(lifetime) => format!(
                "Server is shutting down after reaching its {} lifetime limit.",
                human_duration(*lifetime)
            ),
        }
    }
}

/// Render whole hours, minutes or seconds without trailing zero units
pub fn human_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs == 0 {
        return format!("{}ms", d.as_millis());
    }
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    let mut out = String::new();
    if h > 0 {
        out.push_str(&format!("{}h", h));
    }
    if m > 0 {
        out.push_str(&format!("{}m", m));
    }
    if s > 0 {
        out.push_str(&format!("{}s", s));
    }
    out
}

/// Listener and parsed key material, ready for `run`
struct PreparedListener {
    listener: TcpListener,
    ssh_config: Arc<russh::server::Config>,
    authority: Arc<CertificateAuthority>,
}

struct ServerInner {
    state: ServerState,
    prepared: Option<PreparedListener>,
    stop: CancellationToken,
    local_addr: Option<SocketAddr>,
}

/// The certificate-authenticated shell server
pub struct SessionServer {
    config: SessionServerConfig,
    shell: Arc<ShellSettings>,
    inner: Mutex<ServerInner>,
    state_tx: watch::Sender<ServerState>,
    registry: Arc<SessionRegistry<RusshTransport>>,
    tracker: TaskTracker,
}

impl SessionServer {
    /// Create an idle server
    pub fn new(config: SessionServerConfig) -> Self {
        let shell = Arc::new(ShellSettings {
            shell: config.shell.clone(),
            env: config.env.clone(),
        });
        let (state_tx, _) = watch::channel(ServerState::Idle);
        Self {
            config,
            shell,
            inner: Mutex::new(ServerInner {
                state: ServerState::Idle,
                prepared: None,
                stop: CancellationToken::new(),
                local_addr: None,
            }),
            state_tx,
            registry: Arc::new(SessionRegistry::new()),
            tracker: TaskTracker::new(),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> ServerState {
        self.inner.lock().state
    }

    /// Watch lifecycle transitions
    pub fn subscribe_state(&self) -> watch::Receiver<ServerState> {
        self.state_tx.subscribe()
    }

    /// Bound address while listening
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.lock().local_addr
    }

    /// Authenticated connections
    pub fn registry(&self) -> &Arc<SessionRegistry<RusshTransport>> {
        &self.registry
    }

    /// Server settings
    pub fn config(&self) -> &SessionServerConfig {
        &self.config
    }

    fn set_state(&self, inner: &mut ServerInner, state: ServerState) {
        tracing::debug!("Session server {} -> {}", inner.state, state);
        inner.state = state;
        self.state_tx.send_replace(state);
    }

    /// Parse the keys, bind the listener and report the bound address.
    ///
    /// Fails with `AlreadyRunning` unless the server is idle. On any other
    /// failure the server is back to idle and nothing stays bound.
    pub async fn prepare_and_listen(
        &self,
        request: &SessionStartPayload,
    ) -> Result<SocketAddr, SessionServerError> {
        let stop = {
            let mut inner = self.inner.lock();
            match inner.state {
                ServerState::Idle => {}
                ServerState::ShuttingDown => return Err(SessionServerError::ShutdownInProgress),
                ServerState::Configured | ServerState::Listening => {
                    return Err(SessionServerError::AlreadyRunning)
                }
            }
            inner.stop = CancellationToken::new();
            self.set_state(&mut inner, ServerState::Configured);
            inner.stop.clone()
        };

        let prepared = self.prepare(request).await;

        let mut inner = self.inner.lock();
        let prepared = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                self.set_state(&mut inner, ServerState::Idle);
                return Err(e);
            }
        };
        if stop.is_cancelled() {
            tracing::info!("Session server stopped while binding; releasing listener");
            self.set_state(&mut inner, ServerState::Idle);
            return Err(SessionServerError::ShutdownInProgress);
        }

        let addr = prepared
            .listener
            .local_addr()
            .map_err(|source| SessionServerError::Bind {
                addr: self.config.bind_address.clone(),
                source,
            });
        let addr = match addr {
            Ok(addr) => addr,
            Err(e) => {
                self.set_state(&mut inner, ServerState::Idle);
                return Err(e);
            }
        };

        inner.prepared = Some(prepared);
        inner.local_addr = Some(addr);
        self.set_state(&mut inner, ServerState::Listening);
        tracing::info!("Session server bound to {}", addr);
        Ok(addr)
    }

    async fn prepare(&self, request: &SessionStartPayload) -> Result<PreparedListener, SessionServerError> {
        let authority = CertificateAuthority::from_authorized_key(&request.ca_public_key)?;
        let host_key = parse_host_key(&request.host_private_key)?;
        tracing::info!("Trusting user certificates from {}", authority.fingerprint());

        let listener = TcpListener::bind(&self.config.bind_address)
            .await
            .map_err(|source| SessionServerError::Bind {
                addr: self.config.bind_address.clone(),
                source,
            })?;

        Ok(PreparedListener {
            listener,
            ssh_config: Arc::new(self.ssh_config(host_key)),
            authority: Arc::new(authority),
        })
    }

    fn ssh_config(&self, host_key: PrivateKey) -> russh::server::Config {
        let mut config = russh::server::Config::default();
        config.methods = russh::MethodSet::PUBLICKEY;
        config.keys.push(host_key);
        config.auth_rejection_time = Duration::from_secs(1);
        config.auth_rejection_time_initial = Some(Duration::from_secs(0));
        config.inactivity_timeout = Some(self.config.idle_timeout);
        config
    }

    /// Accept connections until stopped or the lifetime elapses, then shut
    /// down. Returns once every connection task has finished.
    pub async fn run(&self) -> Result<ShutdownReason, SessionServerError> {
        let (prepared, stop, addr) = {
            let mut inner = self.inner.lock();
            let prepared = inner.prepared.take().ok_or(SessionServerError::NotListening)?;
            (prepared, inner.stop.clone(), inner.local_addr)
        };
        let PreparedListener {
            listener,
            ssh_config,
            authority,
        } = prepared;

        let lifetime = self.config.lifetime;
        tracing::info!(
            "Session server listening on {:?}, stopping automatically in {}",
            addr,
            human_duration(lifetime)
        );

        let ctx = ConnectionContext {
            authority,
            registry: Arc::clone(&self.registry),
            shell: Arc::clone(&self.shell),
            tracker: self.tracker.clone(),
        };
        let connections = CancellationToken::new();

        let deadline = tokio::time::sleep(lifetime);
        tokio::pin!(deadline);
        let reason = loop {
            tokio::select! {
                _ = stop.cancelled() => break ShutdownReason::Stopped,
                _ = &mut deadline => break ShutdownReason::LifetimeExpired(lifetime),
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer_addr)) => {
                        self.spawn_connection(socket, peer_addr, &ssh_config, &ctx, &connections);
                    }
                    Err(e) => {
                        tracing::warn!("Failed to accept connection: {}", e);
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                },
            }
        };

        {
            let mut inner = self.inner.lock();
            self.set_state(&mut inner, ServerState::ShuttingDown);
        }
        drop(listener);
        tracing::info!("Accept loop has shut down ({:?})", reason);

        let grace = self.config.grace_period;
        let notice = format!(
            "!!! {} Shutting down in {} !!!",
            reason.message(),
            human_duration(grace)
        );
        let report = self.registry.broadcast_and_close(&notice, grace).await;
        tracing::info!(
            "Notified {} session(s), closed {} connection(s)",
            report.notified,
            report.closed
        );

        // Connections still mid-handshake were never registered
        connections.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();

        let mut inner = self.inner.lock();
        inner.local_addr = None;
        self.set_state(&mut inner, ServerState::Idle);
        tracing::info!("Session server is idle");
        Ok(reason)
    }

    fn spawn_connection(
        &self,
        socket: TcpStream,
        peer_addr: SocketAddr,
        ssh_config: &Arc<russh::server::Config>,
        ctx: &ConnectionContext,
        connections: &CancellationToken,
    ) {
        let key = SessionKey::next();
        tracing::info!("New connection from {} ({})", peer_addr, key);

        let closer = connections.child_token();
        let cleanup = Arc::new(SessionCleanup::new(key, Arc::clone(&self.registry)));
        let handler = ShellHandler::new(key, peer_addr, ctx.clone(), closer.clone(), Arc::clone(&cleanup));
        let stream = CancellableStream::new(socket, closer);
        let config = Arc::clone(ssh_config);

        self.tracker.spawn(async move {
            match russh::server::run_stream(config, stream, handler).await {
                Ok(session) => match session.await {
                    Ok(()) => tracing::info!("Connection {} from {} closed", key, peer_addr),
                    Err(e) => tracing::info!("Connection {} from {} ended: {}", key, peer_addr, e),
                },
                Err(e) => tracing::warn!("Handshake with {} failed: {}", peer_addr, e),
            }
            cleanup.release().await;
        });
    }

    /// Request shutdown.
    ///
    /// Idempotent: stopping an idle or already stopping server only logs.
    /// A listener that was prepared but never run is released immediately.
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            ServerState::Idle => tracing::info!("Stop requested, but session server is not running"),
            ServerState::ShuttingDown => tracing::debug!("Session server is already shutting down"),
            ServerState::Configured => inner.stop.cancel(),
            ServerState::Listening => {
                if inner.prepared.take().is_some() {
                    tracing::info!("Releasing unused listener on {:?}", inner.local_addr);
                    inner.local_addr = None;
                    inner.stop.cancel();
                    self.set_state(&mut inner, ServerState::Idle);
                } else {
                    tracing::info!("Session server shutdown requested");
                    inner.stop.cancel();
                }
            }
        }
    }

    /// Wait until the server reports `Idle`
    pub async fn wait_idle(&self) {
        let mut rx = self.state_tx.subscribe();
        let _ = rx.wait_for(|state| *state == ServerState::Idle).await;
    }
}
