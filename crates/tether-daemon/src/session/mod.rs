//! Certificate-authenticated interactive shell sessions

pub mod auth;
pub mod handler;
pub mod pty;
pub mod registry;
pub mod server;

pub use auth::{parse_host_key, CertificateAuthority};
pub use handler::{RusshTransport, ShellHandler};
pub use pty::{ShellSettings, ShellTerminal, TerminalSize};
pub use registry::{ActiveSession, BroadcastReport, SessionRegistry, SessionTransport};
pub use server::{SessionServer, ShutdownReason};
