pub mod jsonrpc;
pub mod server;
pub mod transport;

pub use server::{ServerInfo, SessionDispatcher, SessionState, PROTOCOL_VERSION};
pub use transport::{Incoming, ResponseWriter, StdioTransport};
