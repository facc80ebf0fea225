//! `enable-beszel`: supervises the monitoring agent process

use std::path::Path;
use std::process::Stdio;

use anyhow::Context;
use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use tether_core::message::MonitoringPayload;

use super::capability::CapabilityHandler;

/// A spawned monitoring agent
pub struct MonitoringAgentHandler {
    child: Mutex<Option<Child>>,
    pid: Option<u32>,
}

impl MonitoringAgentHandler {
    /// Spawn `binary` configured from `payload`
    pub fn spawn(binary: &Path, payload: &MonitoringPayload) -> anyhow::Result<Self> {
        let child = Command::new(binary)
            .env("HUB_URL", &payload.server_url)
            .env("TOKEN", &payload.token)
            .env("KEY", &payload.ssh_public_key)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn monitoring agent {}", binary.display()))?;

        let pid = child.id();
        tracing::info!("Monitoring agent started (pid {:?}) reporting to {}", pid, payload.server_url);
        Ok(Self {
            child: Mutex::new(Some(child)),
            pid,
        })
    }

    /// Process id of the agent
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

#[async_trait]
impl CapabilityHandler for MonitoringAgentHandler {
    async fn handle(&self, scope: CancellationToken) -> anyhow::Result<()> {
        let mut guard = self.child.lock().await;
        let Some(child) = guard.as_mut() else {
            return Ok(());
        };

        let exited = tokio::select! {
            status = child.wait() => Some(status),
            _ = scope.cancelled() => None,
        };
        let Some(status) = exited else {
            return Ok(());
        };
        *guard = None;

        let status = status.context("Failed to wait on monitoring agent")?;
        if status.success() {
            tracing::info!("Monitoring agent exited");
            Ok(())
        } else {
            anyhow::bail!("Monitoring agent exited with {}", status)
        }
    }

    async fn stop(&self) -> anyhow::Result<()> {
        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            tracing::info!("Stopping monitoring agent (pid {:?})", self.pid);
            child.kill().await.context("Failed to kill monitoring agent")?;
        }
        Ok(())
    }
}
