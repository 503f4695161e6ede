use thiserror::Error;

use crate::mcp::jsonrpc::JsonRpcError;

/// JSON-RPC 2.0 reserved error codes, plus the MCP "not initialized" code.
pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const NOT_INITIALIZED: i64 = -32002;
}

/// Faults that are visible to the session. Everything that goes wrong inside a
/// capability run is packaged as content instead and never shows up here.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Unknown tool: {0}")]
    UnknownCapability(String),

    #[error("duplicate capability name: {0}")]
    DuplicateCapability(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("server not initialized")]
    NotInitialized,

    #[error("parse error: {0}")]
    Parse(String),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
}

impl BridgeError {
    pub fn code(&self) -> i64 {
        match self {
            Self::UnknownCapability(_) | Self::InvalidParams(_) => codes::INVALID_PARAMS,
            Self::InvalidRequest(_) => codes::INVALID_REQUEST,
            Self::MethodNotFound(_) => codes::METHOD_NOT_FOUND,
            Self::NotInitialized => codes::NOT_INITIALIZED,
            Self::Parse(_) => codes::PARSE_ERROR,
            Self::DuplicateCapability(_) | Self::Transport(_) => codes::INTERNAL_ERROR,
        }
    }
}

impl From<&BridgeError> for JsonRpcError {
    fn from(err: &BridgeError) -> Self {
        JsonRpcError {
            code: err.code(),
            message: err.to_string(),
            data: None,
        }
    }
}
