//! Capability dispatch: triggers in, supervised handlers out

pub mod capability;
pub mod dispatcher;
pub mod factory;
pub mod monitoring;
pub mod session;

pub use capability::{Capability, CapabilityFactory, CapabilityHandler};
pub use dispatcher::{CapabilityInstance, Dispatcher};
pub use factory::DaemonCapabilities;
pub use monitoring::MonitoringAgentHandler;
pub use session::SessionServerHandler;
