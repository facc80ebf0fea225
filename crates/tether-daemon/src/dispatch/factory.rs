//! Maps capability ids to concrete handlers

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use tether_core::config::MonitoringConfig;
use tether_core::error::DispatchError;
use tether_core::message::{decode_payload, MonitoringPayload, SessionStartPayload};
use tether_core::types::{ENABLE_MONITORING, START_SSH};
use tether_core::CapabilityId;

use super::capability::{Capability, CapabilityFactory};
use super::monitoring::MonitoringAgentHandler;
use super::session::SessionServerHandler;
use crate::session::SessionServer;

/// The daemon's built-in capabilities
pub struct DaemonCapabilities {
    server: Arc<SessionServer>,
    agent_binary: PathBuf,
}

impl DaemonCapabilities {
    pub fn new(server: Arc<SessionServer>, monitoring: &MonitoringConfig) -> Self {
        Self {
            server,
            agent_binary: monitoring.agent_binary.clone(),
        }
    }
}

fn invalid_payload(id: &CapabilityId, e: impl std::fmt::Display) -> DispatchError {
    DispatchError::InvalidPayload {
        id: id.to_string(),
        reason: e.to_string(),
    }
}

fn construction(id: &CapabilityId, e: impl std::fmt::Display) -> DispatchError {
    DispatchError::Construction {
        id: id.to_string(),
        reason: e.to_string(),
    }
}

#[async_trait]
impl CapabilityFactory for DaemonCapabilities {
    async fn build(&self, id: &CapabilityId, payload: &serde_json::Value) -> Result<Capability, DispatchError> {
        match id.as_str() {
            START_SSH => {
                let request: SessionStartPayload =
                    decode_payload(payload).map_err(|e| invalid_payload(id, e))?;
                let addr = self
                    .server
                    .prepare_and_listen(&request)
                    .await
                    .map_err(|e| construction(id, e))?;
                let handler = SessionServerHandler::new(Arc::clone(&self.server));
                Ok(Capability::listening(Arc::new(handler), addr.port()))
            }
            ENABLE_MONITORING => {
                let config: MonitoringPayload =
                    decode_payload(payload).map_err(|e| invalid_payload(id, e))?;
                if config.server_url.is_empty() {
                    return Err(invalid_payload(id, "server_url is required"));
                }
                let handler = MonitoringAgentHandler::spawn(&self.agent_binary, &config)
                    .map_err(|e| construction(id, format!("{:#}", e)))?;
                Ok(Capability::background(Arc::new(handler)))
            }
            other => Err(DispatchError::UnknownCapability(other.to_string())),
        }
    }
}
