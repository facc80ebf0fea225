//! Process-level wiring
//!
//! A [`Daemon`] is built from one [`DaemonConfig`] value; every component
//! receives what it needs from that value at construction time.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use tether_core::config::DaemonConfig;
use tether_core::{InMemoryBus, MessageBus, RouteSpec, Subjects};

use crate::dispatch::{DaemonCapabilities, Dispatcher};
use crate::session::SessionServer;
use crate::subscribers;
use crate::tunnel::{SshTunnelLauncher, TunnelLauncher, TunnelManager};

/// Every long-lived component of the daemon
pub struct Daemon {
    config: DaemonConfig,
    subjects: Subjects,
    bus: InMemoryBus,
    tunnel: Arc<TunnelManager>,
    server: Arc<SessionServer>,
    dispatcher: Dispatcher,
}

impl Daemon {
    /// Build the daemon with the SSH-over-TLS tunnel client
    pub fn new(config: DaemonConfig) -> anyhow::Result<Self> {
        let launcher = Arc::new(SshTunnelLauncher::new(&config.tunnel));
        Self::with_launcher(config, InMemoryBus::new(), launcher)
    }

    /// Build the daemon around an existing bus and tunnel launcher
    pub fn with_launcher(
        config: DaemonConfig,
        bus: InMemoryBus,
        launcher: Arc<dyn TunnelLauncher>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let device_name = config.device_name();
        let subjects = Subjects::for_device(&device_name);

        let tunnel = Arc::new(TunnelManager::new(device_name.as_str(), launcher));
        if let Some(server) = &config.tunnel.server_address {
            tunnel.set_server(server)?;
        }
        for spec in &config.tunnel.routes {
            let route: RouteSpec = spec
                .parse()
                .with_context(|| format!("Invalid tunnel route {:?}", spec))?;
            tunnel.add_route(route);
        }
        if let Some(bundle) = config.tunnel.tls.load()? {
            tunnel.set_credentials(bundle);
        }

        let server = Arc::new(SessionServer::new(config.session.clone()));
        let capabilities = DaemonCapabilities::new(Arc::clone(&server), &config.monitoring);
        let dispatcher = Dispatcher::new(Arc::new(capabilities), Arc::clone(&tunnel));

        tracing::info!("Device name: {}", device_name);
        Ok(Self {
            config,
            subjects,
            bus,
            tunnel,
            server,
            dispatcher,
        })
    }

    pub fn bus(&self) -> &InMemoryBus {
        &self.bus
    }

    pub fn subjects(&self) -> &Subjects {
        &self.subjects
    }

    pub fn tunnel(&self) -> &Arc<TunnelManager> {
        &self.tunnel
    }

    pub fn server(&self) -> &Arc<SessionServer> {
        &self.server
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    fn credentials_dir(&self) -> PathBuf {
        self.config
            .credentials_dir()
            .unwrap_or_else(subscribers::fallback_credentials_dir)
    }

    /// Run until `shutdown` is cancelled, then tear everything down
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        self.dispatcher
            .listen(&self.bus, &self.subjects)
            .context("Failed to subscribe to command subjects")?;

        let consumers = shutdown.child_token();
        let subscriber_tasks = subscribers::spawn_subscribers(
            &self.bus,
            &self.subjects,
            Arc::clone(&self.tunnel),
            self.credentials_dir(),
            consumers.clone(),
        )
        .context("Failed to subscribe to control subjects")?;

        let ingress = self.spawn_ingress(consumers.clone())?;

        if self.tunnel.is_ready() {
            if let Err(e) = self.tunnel.start() {
                tracing::warn!("Failed to start tunnel: {}", e);
            }
        } else {
            tracing::info!("Tunnel waiting for server, routes and credentials");
        }

        tracing::info!("Daemon running");
        shutdown.cancelled().await;
        tracing::info!("Daemon shutting down");

        self.dispatcher.stop().await;

        consumers.cancel();
        for task in subscriber_tasks {
            let _ = task.await;
        }
        if let Some(ingress) = ingress {
            match ingress.await {
                Ok(Err(e)) => tracing::warn!("Ingress stopped with error: {:#}", e),
                Err(e) => tracing::warn!("Ingress task failed: {}", e),
                Ok(Ok(())) => {}
            }
        }

        self.tunnel.shutdown().await;
        self.bus.close();
        tracing::info!("Daemon stopped");
        Ok(())
    }

    fn spawn_ingress(&self, shutdown: CancellationToken) -> anyhow::Result<Option<JoinHandle<anyhow::Result<()>>>> {
        let Some(bind) = &self.config.ingress.bind_address else {
            return Ok(None);
        };
        let addr: SocketAddr = bind
            .parse()
            .with_context(|| format!("Invalid ingress bind address {:?}", bind))?;

        let bus: Arc<dyn MessageBus> = Arc::new(self.bus.clone());
        Ok(Some(tokio::spawn(crate::ingress::serve(addr, bus, shutdown))))
    }
}
