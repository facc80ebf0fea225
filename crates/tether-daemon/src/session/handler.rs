//! Per-connection SSH handler
//!
//! One [`ShellHandler`] exists per accepted TCP connection. It checks the
//! user certificate, registers the connection once authenticated, and runs
//! a PTY shell for each session channel that asks for one.

use std::collections::HashMap;
use std::future::Future;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use russh::server::{Auth, Handle, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, Pty};
use russh_keys::PublicKey;
use ssh_key::Certificate;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tokio_util::task::TaskTracker;

use tether_core::SessionKey;

use super::auth::CertificateAuthority;
use super::pty::{ShellIo, ShellSettings, ShellTerminal, TerminalSize};
use super::registry::{SessionRegistry, SessionTransport};

/// Pending keystrokes per channel
const INPUT_QUEUE: usize = 64;
/// Pending output chunks per channel
const OUTPUT_QUEUE: usize = 64;
/// How long buffered shell output may take to flush after the shell exits
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);
/// Extended-data stream number for stderr
const STDERR: u32 = 1;

/// Registry handle onto a live russh connection
#[derive(Clone)]
pub struct RusshTransport {
    handle: Handle,
    closer: CancellationToken,
}

#[async_trait]
impl SessionTransport for RusshTransport {
    type Channel = ChannelId;

    async fn notify(&self, channel: &ChannelId, text: &str) -> anyhow::Result<()> {
        self.handle
            .extended_data(*channel, STDERR, CryptoVec::from_slice(text.as_bytes()))
            .await
            .map_err(|_| anyhow::anyhow!("channel {:?} is closed", channel))
    }

    async fn close(&self) {
        self.closer.cancel();
    }
}

/// Stream wrapper that fails all I/O once its token is cancelled.
///
/// Cancelling the token is how a connection is force-closed: the SSH
/// session loop sees an aborted stream and tears itself down.
pub struct CancellableStream<S> {
    inner: S,
    token: CancellationToken,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl<S> CancellableStream<S> {
    pub fn new(inner: S, token: CancellationToken) -> Self {
        let cancelled = Box::pin(token.clone().cancelled_owned());
        Self {
            inner,
            token,
            cancelled,
        }
    }

    fn poll_aborted(&mut self, cx: &mut Context<'_>) -> bool {
        self.token.is_cancelled() || self.cancelled.as_mut().poll(cx).is_ready()
    }
}

fn aborted() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "connection closed by server")
}

impl<S: AsyncRead + Unpin> AsyncRead for CancellableStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.poll_aborted(cx) {
            return Poll::Ready(Err(aborted()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CancellableStream<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.poll_aborted(cx) {
            return Poll::Ready(Err(aborted()));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Releases a connection's registry entry exactly once.
///
/// Both the shell exit path and the connection teardown path call
/// [`SessionCleanup::release`]; whichever runs first does the work.
pub struct SessionCleanup {
    key: SessionKey,
    registry: Arc<SessionRegistry<RusshTransport>>,
    released: AtomicBool,
}

impl SessionCleanup {
    pub fn new(key: SessionKey, registry: Arc<SessionRegistry<RusshTransport>>) -> Self {
        Self {
            key,
            registry,
            released: AtomicBool::new(false),
        }
    }

    /// Whether release already ran
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Remove the registry entry and close the connection
    pub async fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(session) = self.registry.remove(self.key).await {
            session.transport.close().await;
            tracing::info!("Released {} ({})", self.key, session.remote_addr);
        }
    }
}

/// Hand keystrokes to a shell's writer without waiting.
///
/// Called from the connection's session loop, which must keep running for
/// shell output to drain. Input that arrives while the writer is backed up
/// is dropped. Returns whether the chunk was queued.
fn offer_input(key: SessionKey, input: &mpsc::Sender<Vec<u8>>, data: &[u8]) -> bool {
    match input.try_send(data.to_vec()) {
        Ok(()) => true,
        Err(TrySendError::Full(chunk)) => {
            tracing::warn!("Shell input backlog full on {}; dropped {} bytes", key, chunk.len());
            false
        }
        Err(TrySendError::Closed(_)) => {
            tracing::debug!("Shell input closed on {}", key);
            false
        }
    }
}

/// Server-wide state every connection handler shares
#[derive(Clone)]
pub struct ConnectionContext {
    pub authority: Arc<CertificateAuthority>,
    pub registry: Arc<SessionRegistry<RusshTransport>>,
    pub shell: Arc<ShellSettings>,
    pub tracker: TaskTracker,
}

#[derive(Default)]
struct ShellChannel {
    terminal: Option<ShellTerminal>,
    input: Option<mpsc::Sender<Vec<u8>>>,
}

/// Handler for a single SSH connection
pub struct ShellHandler {
    key: SessionKey,
    peer_addr: SocketAddr,
    ctx: ConnectionContext,
    closer: CancellationToken,
    cleanup: Arc<SessionCleanup>,
    /// Login name, set once a certificate is accepted
    user: Option<String>,
    channels: HashMap<ChannelId, ShellChannel>,
}

impl ShellHandler {
    pub fn new(
        key: SessionKey,
        peer_addr: SocketAddr,
        ctx: ConnectionContext,
        closer: CancellationToken,
        cleanup: Arc<SessionCleanup>,
    ) -> Self {
        Self {
            key,
            peer_addr,
            ctx,
            closer,
            cleanup,
            user: None,
            channels: HashMap::new(),
        }
    }

    /// Authenticated login name
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// Wire a spawned shell to the channel; returns the input queue
    fn start_relay(&self, channel: ChannelId, io: ShellIo, handle: Handle) -> mpsc::Sender<Vec<u8>> {
        let ShellIo {
            mut reader,
            mut writer,
            mut child,
        } = io;

        let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(INPUT_QUEUE);
        tokio::task::spawn_blocking(move || {
            while let Some(chunk) = input_rx.blocking_recv() {
                if writer.write_all(&chunk).and_then(|_| writer.flush()).is_err() {
                    break;
                }
            }
        });

        let (output_tx, mut output_rx) = mpsc::channel::<Vec<u8>>(OUTPUT_QUEUE);
        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if output_tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    // EIO once the slave side is gone
                    Err(_) => break,
                }
            }
        });

        let output_handle = handle.clone();
        let output_closer = self.closer.clone();
        let forward = self.ctx.tracker.spawn(async move {
            loop {
                let chunk = tokio::select! {
                    chunk = output_rx.recv() => chunk,
                    _ = output_closer.cancelled() => None,
                };
                let Some(chunk) = chunk else { break };
                if output_handle
                    .data(channel, CryptoVec::from_slice(&chunk))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        let key = self.key;
        let mut killer = child.clone_killer();
        let closer = self.closer.clone();
        let cleanup = Arc::clone(&self.cleanup);
        self.ctx.tracker.spawn(async move {
            let mut wait = tokio::task::spawn_blocking(move || child.wait());
            let status = tokio::select! {
                status = &mut wait => status,
                _ = closer.cancelled() => {
                    let _ = killer.kill();
                    wait.await
                }
            };
            let code = match status {
                Ok(Ok(status)) => status.exit_code(),
                Ok(Err(e)) => {
                    tracing::warn!("Waiting on shell for {} failed: {}", key, e);
                    1
                }
                Err(e) => {
                    tracing::warn!("Shell wait task for {} failed: {}", key, e);
                    1
                }
            };
            tracing::info!("Shell for {} exited with code {}", key, code);

            let _ = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, forward).await;
            let _ = handle.exit_status_request(channel, code).await;
            let _ = handle.eof(channel).await;
            let _ = handle.close(channel).await;
            cleanup.release().await;
        });

        input_tx
    }

    fn release_in_background(&self) {
        let cleanup = Arc::clone(&self.cleanup);
        self.ctx.tracker.spawn(async move {
            cleanup.release().await;
        });
    }
}

impl Drop for ShellHandler {
    fn drop(&mut self) {
        // Unblocks relays still waiting on this connection
        self.closer.cancel();
        if !self.channels.is_empty() {
            tracing::debug!("Dropping {} open channel(s) of {}", self.channels.len(), self.key);
        }
    }
}

#[async_trait]
impl Handler for ShellHandler {
    type Error = anyhow::Error;

    async fn auth_publickey(&mut self, user: &str, public_key: &PublicKey) -> Result<Auth, Self::Error> {
        tracing::warn!(
            "Rejected bare key {} for {} from {}: normal key pairs not accepted",
            public_key.fingerprint(russh_keys::HashAlg::Sha256),
            user,
            self.peer_addr
        );
        Ok(Auth::Reject {
            proceed_with_methods: None,
        })
    }

    async fn auth_openssh_certificate(
        &mut self,
        user: &str,
        certificate: &Certificate,
    ) -> Result<Auth, Self::Error> {
        match self.ctx.authority.verify(user, certificate) {
            Ok(()) => {
                tracing::info!(
                    "Accepted certificate {:?} (serial {}) for {} from {}",
                    certificate.key_id(),
                    certificate.serial(),
                    user,
                    self.peer_addr
                );
                self.user = Some(user.to_string());
                Ok(Auth::Accept)
            }
            Err(e) => {
                tracing::warn!("Rejected certificate for {} from {}: {}", user, self.peer_addr, e);
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                })
            }
        }
    }

    async fn auth_succeeded(&mut self, session: &mut Session) -> Result<(), Self::Error> {
        let transport = RusshTransport {
            handle: session.handle(),
            closer: self.closer.clone(),
        };
        self.ctx.registry.add(self.key, self.peer_addr, transport).await;
        tracing::info!(
            "{} logged in as {} from {}",
            self.key,
            self.user.as_deref().unwrap_or("?"),
            self.peer_addr
        );
        Ok(())
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let id = channel.id();
        tracing::debug!("Session channel {:?} opened on {}", id, self.key);

        self.channels.insert(id, ShellChannel::default());
        self.ctx.registry.attach_channel(self.key, id).await;
        Ok(true)
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let ready = self
            .channels
            .get(&channel)
            .map(|state| state.terminal.is_none())
            .unwrap_or(false);
        if !ready {
            tracing::warn!("Refusing pty-req on channel {:?} of {}", channel, self.key);
            session.channel_failure(channel);
            return Ok(());
        }

        let size = TerminalSize::from_wire(col_width, row_height);
        match ShellTerminal::spawn(&self.ctx.shell, term, size) {
            Ok((terminal, io)) => {
                let input = self.start_relay(channel, io, session.handle());
                if let Some(state) = self.channels.get_mut(&channel) {
                    state.terminal = Some(terminal);
                    state.input = Some(input);
                }
                session.channel_success(channel);
            }
            Err(e) => {
                tracing::error!("Failed to start shell for {}: {:#}", self.key, e);
                session.channel_failure(channel);
            }
        }
        Ok(())
    }

    async fn shell_request(&mut self, channel: ChannelId, session: &mut Session) -> Result<(), Self::Error> {
        let has_terminal = self
            .channels
            .get(&channel)
            .map(|state| state.terminal.is_some())
            .unwrap_or(false);
        if has_terminal {
            session.channel_success(channel);
        } else {
            tracing::warn!("Shell requested without a pty on {}", self.key);
            session.channel_failure(channel);
        }
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(terminal) = self.channels.get(&channel).and_then(|s| s.terminal.as_ref()) {
            if let Err(e) = terminal.resize(TerminalSize::from_wire(col_width, row_height)) {
                tracing::warn!("Resize on {} failed: {:#}", self.key, e);
            }
        }
        Ok(())
    }

    async fn data(&mut self, channel: ChannelId, data: &[u8], _session: &mut Session) -> Result<(), Self::Error> {
        if let Some(input) = self.channels.get(&channel).and_then(|s| s.input.as_ref()) {
            offer_input(self.key, input, data);
        }
        Ok(())
    }

    async fn channel_eof(&mut self, channel: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
        tracing::debug!("Channel EOF: {:?}", channel);
        if let Some(state) = self.channels.get_mut(&channel) {
            state.input = None;
        }
        Ok(())
    }

    async fn channel_close(&mut self, channel: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
        tracing::debug!("Channel closed: {:?}", channel);
        if let Some(mut state) = self.channels.remove(&channel) {
            if let Some(terminal) = state.terminal.as_mut() {
                terminal.kill();
            }
        }
        self.release_in_background();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{mint_authority, mint_user_cert, CertOptions};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn handler_for(authority: CertificateAuthority) -> ShellHandler {
        let registry = Arc::new(SessionRegistry::new());
        let key = SessionKey::next();
        let ctx = ConnectionContext {
            authority: Arc::new(authority),
            registry: Arc::clone(&registry),
            shell: Arc::new(ShellSettings::default()),
            tracker: TaskTracker::new(),
        };
        ShellHandler::new(
            key,
            SocketAddr::from(([127, 0, 0, 1], 40000)),
            ctx,
            CancellationToken::new(),
            Arc::new(SessionCleanup::new(key, registry)),
        )
    }

    #[tokio::test]
    async fn test_certificate_from_trusted_authority_accepted() {
        let ca = mint_authority();
        let authority = CertificateAuthority::from_authorized_key(&ca.authorized_key()).unwrap();
        let mut handler = handler_for(authority);

        let cert = mint_user_cert(&ca, CertOptions::default());
        let auth = handler.auth_openssh_certificate("root", &cert).await.unwrap();

        assert!(matches!(auth, Auth::Accept));
        assert_eq!(handler.user(), Some("root"));
    }

    #[tokio::test]
    async fn test_certificate_from_other_authority_rejected() {
        let ca = mint_authority();
        let authority = CertificateAuthority::from_authorized_key(&ca.authorized_key()).unwrap();
        let mut handler = handler_for(authority);

        let cert = mint_user_cert(&mint_authority(), CertOptions::default());
        let auth = handler.auth_openssh_certificate("root", &cert).await.unwrap();

        assert!(matches!(auth, Auth::Reject { .. }));
        assert_eq!(handler.user(), None);
    }

    #[tokio::test]
    async fn test_input_never_waits_on_a_stuck_writer() {
        let key = SessionKey::next();
        let (input, mut writer) = mpsc::channel(2);

        assert!(offer_input(key, &input, b"ls\r"));
        assert!(offer_input(key, &input, b"pwd\r"));
        // Writer is not draining: the third chunk is dropped instead of waiting
        assert!(!offer_input(key, &input, b"cat\r"));

        assert_eq!(writer.recv().await.unwrap(), b"ls\r".to_vec());
        assert!(offer_input(key, &input, b"exit\r"));

        drop(writer);
        assert!(!offer_input(key, &input, b"late"));
    }

    #[tokio::test]
    async fn test_cleanup_runs_once() {
        let registry: Arc<SessionRegistry<RusshTransport>> = Arc::new(SessionRegistry::new());
        let cleanup = SessionCleanup::new(SessionKey::next(), registry);
        assert!(!cleanup.is_released());
        cleanup.release().await;
        cleanup.release().await;
        assert!(cleanup.is_released());
    }

    #[tokio::test]
    async fn test_cancellable_stream_aborts_io() {
        let (client, server) = tokio::io::duplex(64);
        let token = CancellationToken::new();
        let mut stream = CancellableStream::new(server, token.clone());
        let mut client = client;

        client.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");

        let pending = tokio::spawn(async move {
            let mut buf = [0u8; 1];
            stream.read(&mut buf).await
        });
        token.cancel();
        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
    }
}
