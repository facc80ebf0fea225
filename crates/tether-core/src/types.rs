//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Capability id that starts the certificate-authenticated shell server
pub const START_SSH: &str = "start-ssh";

/// Capability id that enables the monitoring agent
pub const ENABLE_MONITORING: &str = "enable-beszel";

/// Name of a capability instance, unique within the dispatcher
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CapabilityId(pub String);

impl CapabilityId {
    /// Create a new capability id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the raw id string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CapabilityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for CapabilityId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CapabilityId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identity of an authenticated connection in the session registry.
///
/// Keys are handed out from a process-wide counter, so two connections
/// from the same remote address never share a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey(pub u64);

static NEXT_SESSION_KEY: AtomicU64 = AtomicU64::new(1);

impl SessionKey {
    /// Allocate the next unused key
    pub fn next() -> Self {
        Self(NEXT_SESSION_KEY.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Lifecycle state of the session server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// No listener, no configuration
    Idle,
    /// Keys parsed, listener not yet bound
    Configured,
    /// Listener bound, accepting (or ready to accept) connections
    Listening,
    /// Listener closed, sessions being drained
    ShuttingDown,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerState::Idle => write!(f, "idle"),
            ServerState::Configured => write!(f, "configured"),
            ServerState::Listening => write!(f, "listening"),
            ServerState::ShuttingDown => write!(f, "shutting-down"),
        }
    }
}
