pub mod invoker;

pub use invoker::{invoke, InvocationLimits, ProcessInvocation, ProcessOutcome};
