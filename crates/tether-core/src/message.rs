//! JSON message shapes consumed from the bus

use serde::{Deserialize, Serialize};

/// Trigger that starts a named capability
///
/// ```json
/// { "command": "start-ssh", "payload": { ... } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerMessage {
    /// Capability id
    pub command: String,
    /// Capability configuration, decoded by the capability's handler
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Optional body of a stop signal naming the capability to stop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopMessage {
    pub command: String,
}

/// Payload of `start-ssh`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStartPayload {
    /// Authority public key in authorized-keys format
    pub ca_public_key: String,
    /// Host private key, PEM or base64-encoded PEM
    pub host_private_key: String,
}

/// Payload of `enable-beszel`
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MonitoringPayload {
    pub server_url: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub ssh_public_key: String,
}

/// Tunnel assignment pushed by the fleet backend
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelNotice {
    pub server: String,
    pub server_port: u16,
    pub client_port: u16,
}

impl TunnelNotice {
    /// All three fields are present
    pub fn is_complete(&self) -> bool {
        !self.server.is_empty() && self.server_port != 0 && self.client_port != 0
    }
}

/// Renewed tunnel credentials pushed by the fleet backend
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialNotice {
    pub certificate: String,
    pub private_key: String,
    pub root_ca: String,
}

impl CredentialNotice {
    /// All three PEM blocks are present
    pub fn is_complete(&self) -> bool {
        !self.certificate.is_empty() && !self.private_key.is_empty() && !self.root_ca.is_empty()
    }
}

/// Decode a capability's typed configuration out of a trigger payload
pub fn decode_payload<T: serde::de::DeserializeOwned>(
    payload: &serde_json::Value,
) -> Result<T, serde_json::Error> {
    T::deserialize(payload)
}
