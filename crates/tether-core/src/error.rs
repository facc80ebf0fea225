//! Core error types for tether

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for the tether daemon
#[derive(Error, Debug)]
pub enum DaemonError {
    /// Session server error
    #[error("Session server error: {0}")]
    SessionServer(#[from] SessionServerError),

    /// Tunnel error
    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    /// Dispatch error
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Message bus error
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Session server lifecycle errors
#[derive(Error, Debug)]
pub enum SessionServerError {
    /// A server instance is already active
    #[error("Session server is already running")]
    AlreadyRunning,

    /// The server is tearing down and cannot accept the request
    #[error("Session server is shutting down")]
    ShutdownInProgress,

    /// `run` was called without a prepared listener
    #[error("Session server has no listener; call prepare_and_listen first")]
    NotListening,

    /// Authority key or host key failed to parse
    #[error("Invalid key material: {0}")]
    InvalidKeyMaterial(String),

    /// Listener could not be bound
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Reasons a presented credential is refused
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// A bare public key was offered instead of a certificate
    #[error("normal key pairs not accepted")]
    NotACertificate,

    /// Certificate type was not `user`
    #[error("certificate has type {0}, expected user")]
    WrongCertType(String),

    /// Certificate was signed by a key other than the configured authority
    #[error("certificate signed by unrecognized authority")]
    UnknownAuthority,

    /// Outside the certificate's validity window
    #[error("certificate not valid at {now} (valid {after}..{before})")]
    Expired { now: u64, after: u64, before: u64 },

    /// Login name not listed as a principal
    #[error("principal {0:?} not in the set of valid principals")]
    PrincipalMismatch(String),

    /// Certificate carries a critical option this server does not honour
    #[error("unsupported critical option {0:?}")]
    UnsupportedCriticalOption(String),

    /// Signature did not verify
    #[error("certificate signature invalid: {0}")]
    BadSignature(String),
}

/// Tunnel manager and tunnel client errors
#[derive(Error, Debug)]
pub enum TunnelError {
    /// Server, routes or credentials missing
    #[error("tunnel manager not ready (server set: {server}, routes: {routes}, credentials set: {credentials})")]
    NotReady {
        server: bool,
        routes: usize,
        credentials: bool,
    },

    /// Route specification could not be parsed
    #[error("Invalid route spec {spec:?}: {reason}")]
    InvalidRoute { spec: String, reason: String },

    /// Server address could not be parsed
    #[error("Invalid tunnel server address {0:?}")]
    InvalidServer(String),

    /// TLS material is incomplete or malformed
    #[error("Invalid TLS credentials: {0}")]
    InvalidCredentials(String),

    /// Connecting to the rendezvous server failed
    #[error("Tunnel connection failed: {0}")]
    Connect(String),
}

/// Command dispatcher errors
#[derive(Error, Debug)]
pub enum DispatchError {
    /// No capability type matches the id
    #[error("Unknown capability: {0}")]
    UnknownCapability(String),

    /// Trigger payload did not decode into the capability's config
    #[error("Invalid payload for {id}: {reason}")]
    InvalidPayload { id: String, reason: String },

    /// No instance registered under the id
    #[error("Command not found: {0}")]
    NotFound(String),

    /// Handler construction failed (spawn, bind, key parsing)
    #[error("Failed to construct {id}: {reason}")]
    Construction { id: String, reason: String },
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Missing required field
    #[error("Missing required field: {0}")]
    MissingField(String),
}

/// Message bus errors
#[derive(Error, Debug)]
pub enum BusError {
    /// The bus has been closed
    #[error("bus closed")]
    Closed,
}
