//! Reverse tunnel lifecycle
//!
//! The [`TunnelManager`] collects the three things a tunnel needs (server
//! address, at least one route, TLS credentials) as they arrive from
//! configuration and bus notices, and owns the single running tunnel. Any
//! change that affects the tunnel is applied by calling
//! [`TunnelManager::restart`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use tether_core::error::TunnelError;
use tether_core::{RouteSpec, TlsBundle};

/// Everything a launcher needs to bring one tunnel up
#[derive(Debug, Clone)]
pub struct TunnelPlan {
    /// Rendezvous server address
    pub server: String,
    /// Name the device identifies itself with
    pub device_name: String,
    /// Routes to forward, in canonical key order
    pub routes: Vec<RouteSpec>,
    /// mTLS material
    pub tls: TlsBundle,
}

/// Brings a tunnel up and keeps it up until cancelled
#[async_trait]
pub trait TunnelLauncher: Send + Sync + 'static {
    /// Run the tunnel described by `plan`, reconnecting as needed, until
    /// `cancel` fires
    async fn run(&self, plan: TunnelPlan, cancel: CancellationToken);
}

struct RunningTunnel {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct ManagerState {
    server: Option<String>,
    routes: BTreeMap<String, RouteSpec>,
    tls: Option<TlsBundle>,
    running: Option<RunningTunnel>,
}

impl ManagerState {
    /// Server and credentials, provided at least one route exists too
    fn ready_parts(&self) -> Result<(String, TlsBundle), TunnelError> {
        match (&self.server, &self.tls) {
            (Some(server), Some(tls)) if !self.routes.is_empty() => Ok((server.clone(), tls.clone())),
            _ => Err(TunnelError::NotReady {
                server: self.server.is_some(),
                routes: self.routes.len(),
                credentials: self.tls.is_some(),
            }),
        }
    }
}

/// Owner of the device's reverse tunnel
pub struct TunnelManager {
    device_name: String,
    launcher: Arc<dyn TunnelLauncher>,
    state: Mutex<ManagerState>,
}

impl TunnelManager {
    /// Create a manager with no server, routes or credentials
    pub fn new(device_name: impl Into<String>, launcher: Arc<dyn TunnelLauncher>) -> Self {
        Self {
            device_name: device_name.into(),
            launcher,
            state: Mutex::new(ManagerState::default()),
        }
    }

    /// Device name used when connecting
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Set the rendezvous server address
    pub fn set_server(&self, address: &str) -> Result<(), TunnelError> {
        let address = address.trim();
        if address.is_empty() {
            return Err(TunnelError::InvalidServer(address.to_string()));
        }
        tracing::info!("Tunnel server set to {}", address);
        self.state.lock().server = Some(address.to_string());
        Ok(())
    }

    /// Current rendezvous server address
    pub fn server(&self) -> Option<String> {
        self.state.lock().server.clone()
    }

    /// Replace the TLS credentials
    pub fn set_credentials(&self, tls: TlsBundle) {
        tracing::info!("Tunnel credentials updated");
        self.state.lock().tls = Some(tls);
    }

    /// Add a route, replacing any route to the same local address.
    ///
    /// Returns whether the route set changed.
    pub fn add_route(&self, route: RouteSpec) -> bool {
        let mut state = self.state.lock();
        let key = route.key();
        if state.routes.get(&key) == Some(&route) {
            return false;
        }
        tracing::info!("Adding tunnel route {}", route);
        state.routes.insert(key, route);
        true
    }

    /// Remove the route to `route`'s local address; returns whether it existed
    pub fn remove_route(&self, route: &RouteSpec) -> bool {
        let removed = self.state.lock().routes.remove(&route.key()).is_some();
        if removed {
            tracing::info!("Removed tunnel route {}", route);
        }
        removed
    }

    /// Snapshot of the configured routes
    pub fn routes(&self) -> Vec<RouteSpec> {
        self.state.lock().routes.values().cloned().collect()
    }

    /// Whether server, routes and credentials are all present
    pub fn is_ready(&self) -> bool {
        self.state.lock().ready_parts().is_ok()
    }

    /// Whether a tunnel is currently running
    pub fn is_running(&self) -> bool {
        self.state.lock().running.is_some()
    }

    /// Start the tunnel. A no-op when one is already running.
    pub fn start(&self) -> Result<(), TunnelError> {
        let mut state = self.state.lock();
        if state.running.is_some() {
            tracing::debug!("Tunnel already running");
            return Ok(());
        }
        self.start_locked(&mut state, None)
    }

    /// Stop the running tunnel, if any
    pub fn stop(&self) {
        let mut state = self.state.lock();
        if let Some(running) = state.running.take() {
            tracing::info!("Stopping tunnel");
            running.cancel.cancel();
        }
    }

    /// Stop the running tunnel and start a new one from the current state.
    ///
    /// The new tunnel waits for the old one to wind down before connecting.
    /// When the manager is not ready the old tunnel is still stopped.
    pub fn restart(&self) -> Result<(), TunnelError> {
        let mut state = self.state.lock();
        let previous = state.running.take().map(|running| {
            running.cancel.cancel();
            running.task
        });
        self.start_locked(&mut state, previous)
    }

    /// Stop the tunnel and wait for it to finish
    pub async fn shutdown(&self) {
        let running = self.state.lock().running.take();
        if let Some(running) = running {
            running.cancel.cancel();
            let _ = running.task.await;
            tracing::info!("Tunnel shut down");
        }
    }

    fn start_locked(
        &self,
        state: &mut ManagerState,
        previous: Option<JoinHandle<()>>,
    ) -> Result<(), TunnelError> {
        let (server, tls) = state.ready_parts()?;

        let plan = TunnelPlan {
            server,
            device_name: self.device_name.clone(),
            routes: state.routes.values().cloned().collect(),
            tls,
        };
        tracing::info!(
            "Starting tunnel to {} with {} route(s)",
            plan.server,
            plan.routes.len()
        );

        let cancel = CancellationToken::new();
        let launcher = Arc::clone(&self.launcher);
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            if !token.is_cancelled() {
                launcher.run(plan, token).await;
            }
        });

        state.running = Some(RunningTunnel { cancel, task });
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::time::Duration;
    use tether_core::credentials::fixtures::{CERT_PEM, KEY_PEM};

    /// Launcher that records plans and idles until cancelled
    #[derive(Default)]
    pub(crate) struct RecordingLauncher {
        pub(crate) plans: Mutex<Vec<TunnelPlan>>,
        pub(crate) stopped: Mutex<usize>,
    }

    impl RecordingLauncher {
        pub(crate) fn launches(&self) -> usize {
            self.plans.lock().len()
        }

        pub(crate) fn last_plan(&self) -> Option<TunnelPlan> {
            self.plans.lock().last().cloned()
        }
    }

    #[async_trait]
    impl TunnelLauncher for RecordingLauncher {
        async fn run(&self, plan: TunnelPlan, cancel: CancellationToken) {
            self.plans.lock().push(plan);
            cancel.cancelled().await;
            *self.stopped.lock() += 1;
        }
    }

    pub(crate) fn bundle() -> TlsBundle {
        TlsBundle::new(CERT_PEM, CERT_PEM, KEY_PEM).unwrap()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_start_requires_readiness() {
        let launcher = Arc::new(RecordingLauncher::default());
        let manager = TunnelManager::new("rpi3", launcher.clone());

        assert!(matches!(
            manager.start(),
            Err(TunnelError::NotReady {
                server: false,
                routes: 0,
                credentials: false
            })
        ));

        manager.set_server("https://hub.example:8080").unwrap();
        manager.add_route(RouteSpec::loopback(2222));
        assert!(!manager.is_ready());
        assert!(manager.start().is_err());

        manager.set_credentials(bundle());
        assert!(manager.is_ready());
        manager.start().unwrap();
        settle().await;

        assert_eq!(launcher.launches(), 1);
        let plan = launcher.last_plan().unwrap();
        assert_eq!(plan.device_name, "rpi3");
        assert_eq!(plan.routes, vec![RouteSpec::loopback(2222)]);
    }

    #[tokio::test]
    async fn test_start_twice_is_noop() {
        let launcher = Arc::new(RecordingLauncher::default());
        let manager = TunnelManager::new("rpi3", launcher.clone());
        manager.set_server("hub:8080").unwrap();
        manager.add_route(RouteSpec::loopback(2222));
        manager.set_credentials(bundle());

        manager.start().unwrap();
        manager.start().unwrap();
        settle().await;
        assert_eq!(launcher.launches(), 1);

        manager.shutdown().await;
        assert!(!manager.is_running());
        assert_eq!(*launcher.stopped.lock(), 1);
    }

    #[tokio::test]
    async fn test_restart_replaces_tunnel_with_new_routes() {
        let launcher = Arc::new(RecordingLauncher::default());
        let manager = TunnelManager::new("rpi3", launcher.clone());
        manager.set_server("hub:8080").unwrap();
        manager.set_credentials(bundle());
        manager.add_route(RouteSpec::loopback(2222));
        manager.start().unwrap();
        settle().await;

        manager.add_route(RouteSpec::loopback(45876));
        manager.restart().unwrap();
        settle().await;

        assert_eq!(launcher.launches(), 2);
        assert_eq!(*launcher.stopped.lock(), 1);
        assert_eq!(launcher.last_plan().unwrap().routes.len(), 2);
    }

    #[tokio::test]
    async fn test_restart_when_not_ready_stops_old_tunnel() {
        let launcher = Arc::new(RecordingLauncher::default());
        let manager = TunnelManager::new("rpi3", launcher.clone());
        manager.set_server("hub:8080").unwrap();
        manager.set_credentials(bundle());
        manager.add_route(RouteSpec::loopback(2222));
        manager.start().unwrap();
        settle().await;

        assert!(manager.remove_route(&RouteSpec::loopback(2222)));
        assert!(matches!(manager.restart(), Err(TunnelError::NotReady { routes: 0, .. })));
        settle().await;

        assert!(!manager.is_running());
        assert_eq!(*launcher.stopped.lock(), 1);
    }

    #[test]
    fn test_route_keys_collapse_localhost() {
        let manager = TunnelManager::new("rpi3", Arc::new(RecordingLauncher::default()));
        assert!(manager.add_route(RouteSpec::remote(2201, "localhost", 2222)));
        assert!(!manager.add_route(RouteSpec::remote(2201, "127.0.0.1", 2222)));
        assert!(manager.add_route(RouteSpec::remote(2202, "127.0.0.1", 2222)));
        assert_eq!(manager.routes().len(), 1);
        assert_eq!(manager.routes()[0].remote_port, 2202);
    }

    #[test]
    fn test_empty_server_rejected() {
        let manager = TunnelManager::new("rpi3", Arc::new(RecordingLauncher::default()));
        assert!(manager.set_server("  ").is_err());
        assert!(manager.server().is_none());
    }
}
