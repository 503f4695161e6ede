pub mod capability;
pub mod registry;
pub mod schema;
pub mod search;

pub use capability::{Capability, CapabilityDescriptor};
pub use registry::CapabilityRegistry;
pub use schema::validate_arguments;
pub use search::SearchCapability;
