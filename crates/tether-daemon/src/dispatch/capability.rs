//! Capability handler contract

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use tether_core::error::DispatchError;
use tether_core::CapabilityId;

/// A running unit of daemon functionality.
///
/// `handle` runs until the work ends on its own or `scope` is cancelled.
/// Cancellation is a request to wind down, not a kill: the dispatcher
/// always follows `handle` with `stop`, and the instance only counts as
/// gone once `stop` has returned.
#[async_trait]
pub trait CapabilityHandler: Send + Sync {
    async fn handle(&self, scope: CancellationToken) -> anyhow::Result<()>;

    async fn stop(&self) -> anyhow::Result<()>;
}

/// A constructed handler plus what the dispatcher needs to know about it
pub struct Capability {
    pub handler: Arc<dyn CapabilityHandler>,
    /// Loopback port the handler listens on, to be exposed through the tunnel
    pub listen_port: Option<u16>,
}

impl Capability {
    /// Capability without a listening socket
    pub fn background(handler: Arc<dyn CapabilityHandler>) -> Self {
        Self {
            handler,
            listen_port: None,
        }
    }

    /// Capability listening on a loopback port
    pub fn listening(handler: Arc<dyn CapabilityHandler>, port: u16) -> Self {
        Self {
            handler,
            listen_port: Some(port),
        }
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capability")
            .field("listen_port", &self.listen_port)
            .finish_non_exhaustive()
    }
}

/// Builds handlers from trigger payloads
#[async_trait]
pub trait CapabilityFactory: Send + Sync {
    /// Construct and start the capability named `id`.
    ///
    /// Failing here leaves nothing running; the dispatcher frees the id so
    /// the trigger can be retried.
    async fn build(&self, id: &CapabilityId, payload: &serde_json::Value) -> Result<Capability, DispatchError>;
}
