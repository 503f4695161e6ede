pub mod capabilities;
pub mod config;
pub mod error;
pub mod mcp;
pub mod process;
pub mod response;

pub use capabilities::{
    validate_arguments, Capability, CapabilityDescriptor, CapabilityRegistry, SearchCapability,
};
pub use config::{BridgeConfig, SearchCommandConfig};
pub use error::BridgeError;
pub use mcp::{ServerInfo, SessionDispatcher, SessionState, StdioTransport};
pub use process::{invoke, InvocationLimits, ProcessInvocation, ProcessOutcome};
pub use response::{pack, ContentItem, InvocationResult, FAILURE_PREFIX};
