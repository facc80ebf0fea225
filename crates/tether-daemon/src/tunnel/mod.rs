//! Reverse tunnel to the rendezvous server

pub mod client;
pub mod manager;
pub mod reconnect;
pub mod tls;

pub use client::{parse_server_address, SshTunnelLauncher};
pub use manager::{TunnelLauncher, TunnelManager, TunnelPlan};
pub use reconnect::ExponentialBackoff;
