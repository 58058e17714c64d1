//! Protocol-tier error type and JSON-RPC error codes.

use serde_json::Value;

use super::message::{JsonRpcError, JsonRpcErrorObject, RequestId, JSONRPC_VERSION};

/// Standard JSON-RPC and MCP error codes.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i32 = -32700;
    /// The JSON sent is not a valid request object.
    pub const INVALID_REQUEST: i32 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
    /// The connection closed before a response arrived.
    pub const CONNECTION_CLOSED: i32 = -32000;
    /// The request timed out.
    pub const REQUEST_TIMEOUT: i32 = -32001;
}

/// Errors raised by the protocol engine, transports, and server facade.
#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("MCP error -32000: Connection closed")]
    ConnectionClosed,

    #[error("MCP error -32001: {message}")]
    RequestTimeout { message: String, data: Value },

    /// An error response received from the peer.
    #[error("MCP error {code}: {message}")]
    Remote {
        code: i32,
        message: String,
        data: Option<Value>,
    },

    /// The caller aborted an outstanding request.
    #[error("Request cancelled: {0}")]
    Cancelled(String),

    /// A locally declared or negotiated capability does not permit the call.
    #[error("{0}")]
    CapabilityNotSupported(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience alias used throughout the crate.
pub type McpResult<T> = Result<T, McpError>;

impl McpError {
    /// The JSON-RPC error code this error maps to on the wire.
    pub fn code(&self) -> i32 {
        use error_codes::*;
        match self {
            McpError::ParseError(_) => PARSE_ERROR,
            McpError::InvalidRequest(_) => INVALID_REQUEST,
            McpError::MethodNotFound(_) => METHOD_NOT_FOUND,
            McpError::InvalidParams(_) => INVALID_PARAMS,
            McpError::ConnectionClosed => CONNECTION_CLOSED,
            McpError::RequestTimeout { .. } => REQUEST_TIMEOUT,
            McpError::Remote { code, .. } => *code,
            _ => INTERNAL_ERROR,
        }
    }

    /// The bare message, without the code prefix used by `Display`.
    pub fn message(&self) -> String {
        match self {
            McpError::ParseError(m)
            | McpError::InvalidRequest(m)
            | McpError::MethodNotFound(m)
            | McpError::InvalidParams(m)
            | McpError::InternalError(m) => m.clone(),
            McpError::ConnectionClosed => "Connection closed".to_string(),
            McpError::RequestTimeout { message, .. } | McpError::Remote { message, .. } => {
                message.clone()
            }
            other => other.to_string(),
        }
    }

    /// Structured data attached to the error, if any.
    pub fn data(&self) -> Option<Value> {
        match self {
            McpError::RequestTimeout { data, .. } => Some(data.clone()),
            McpError::Remote { data, .. } => data.clone(),
            _ => None,
        }
    }

    /// Build the error object sent back to the peer.
    pub fn to_error_object(&self) -> JsonRpcErrorObject {
        let message = self.message();
        JsonRpcErrorObject {
            code: self.code(),
            message: if message.is_empty() {
                "Internal error".to_string()
            } else {
                message
            },
            data: self.data(),
        }
    }

    /// Build a full JSON-RPC error response for the given request id.
    pub fn to_json_rpc_error(&self, id: RequestId) -> JsonRpcError {
        JsonRpcError {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            error: self.to_error_object(),
        }
    }

    /// Build an error from a received error object.
    pub fn from_error_object(error: JsonRpcErrorObject) -> Self {
        McpError::Remote {
            code: error.code,
            message: error.message,
            data: error.data,
        }
    }
}
