//! tether-daemon: device-resident command and session daemon
//!
//! Trigger messages arriving on the bus start named capabilities. The
//! canonical capability is an ephemeral, certificate-authenticated shell
//! server whose loopback port is exposed through a reverse tunnel, so the
//! device needs no inbound connectivity.

pub mod daemon;
pub mod dispatch;
pub mod ingress;
pub mod session;
pub mod subscribers;
pub mod tunnel;

#[cfg(test)]
mod testing;

pub use daemon::Daemon;
pub use dispatch::{Dispatcher, DaemonCapabilities};
pub use session::SessionServer;
pub use tunnel::TunnelManager;
