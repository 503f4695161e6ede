pub mod packager;

pub use packager::{pack, validation_failure, ContentItem, InvocationResult, FAILURE_PREFIX};
