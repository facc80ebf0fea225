//! `start-ssh`: the session server as a capability

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use tether_core::error::SessionServerError;
use tether_core::ServerState;

use super::capability::CapabilityHandler;
use crate::session::SessionServer;

/// Drives one listening cycle of the shared [`SessionServer`]
pub struct SessionServerHandler {
    server: Arc<SessionServer>,
}

impl SessionServerHandler {
    /// Wrap a server that has already been prepared
    pub fn new(server: Arc<SessionServer>) -> Self {
        Self { server }
    }
}

#[async_trait]
impl CapabilityHandler for SessionServerHandler {
    async fn handle(&self, scope: CancellationToken) -> anyhow::Result<()> {
        let run = self.server.run();
        tokio::pin!(run);

        tokio::select! {
            result = &mut run => {
                let reason = result?;
                tracing::info!("Session server finished: {:?}", reason);
                return Ok(());
            }
            _ = scope.cancelled() => {
                tracing::info!("Session capability cancelled; stopping server");
                self.server.stop();
            }
        }

        match run.await {
            Ok(reason) => tracing::info!("Session server finished: {:?}", reason),
            // stopped before the accept loop took the listener
            Err(SessionServerError::NotListening) => tracing::info!("Session server released before running"),
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        if self.server.state() != ServerState::Idle {
            self.server.stop();
            self.server.wait_idle().await;
        }
        Ok(())
    }
}
