//! tether-core: shared types, configuration and message bus for tether
//!
//! The device daemon (`tether-daemon`) builds on these: capability ids and
//! trigger messages, tunnel route specs and TLS bundles, the error taxonomy,
//! and the bus interface through which commands arrive.

pub mod bus;
pub mod config;
pub mod credentials;
pub mod error;
pub mod message;
pub mod route;
pub mod types;

pub use bus::{BusMessage, InMemoryBus, MessageBus, Subjects, Subscription};
pub use credentials::TlsBundle;
pub use error::DaemonError;
pub use route::RouteSpec;
pub use types::{CapabilityId, ServerState, SessionKey};
