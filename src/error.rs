//! Error types for toolbox-mcp

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Boxed error returned by user-supplied executables, loaders, and completers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Standard JSON-RPC error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    /// Invalid JSON was received
    ParseError = -32700,
    /// The JSON sent is not a valid Request object
    InvalidRequest = -32600,
    /// The method does not exist / is not available
    MethodNotFound = -32601,
    /// Invalid method parameter(s)
    InvalidParams = -32602,
    /// Internal JSON-RPC error
    InternalError = -32603,
}

impl ErrorCode {
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// JSON-RPC error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ParseError, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            ErrorCode::MethodNotFound,
            format!("Method not found: {}", method),
        )
    }

    pub fn unknown_tool(name: &str) -> Self {
        Self::new(ErrorCode::MethodNotFound, format!("Unknown tool: {}", name))
    }

    pub fn unknown_prompt(name: &str) -> Self {
        Self::new(ErrorCode::MethodNotFound, format!("Unknown prompt: {}", name))
    }

    pub fn resource_not_found(uri: &str) -> Self {
        Self::new(
            ErrorCode::MethodNotFound,
            format!("Unknown resource: {}", uri),
        )
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidParams, message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    /// True when the error carries the given standard code
    pub fn is(&self, code: ErrorCode) -> bool {
        self.code == code.code()
    }
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// An error whose message is meant for the peer.
///
/// When a tool executable fails with a `UserError`, the call result carries
/// the message verbatim instead of the generic `Error: ...` rendering.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct UserError {
    pub message: String,
    pub extras: Option<Value>,
}

impl UserError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            extras: None,
        }
    }

    pub fn with_extras(mut self, extras: Value) -> Self {
        self.extras = Some(extras);
        self
    }
}

/// toolbox-mcp error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("JSON-RPC error: {0}")]
    JsonRpc(JsonRpcError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Internal error: {0}")]
    Internal(String),

    /// Something happened that the session state machine does not allow
    #[error("{message}")]
    UnexpectedState {
        message: String,
        extras: Option<Value>,
    },

    #[error("Unsupported transport: {0}")]
    UnsupportedTransport(String),

    #[error("Duplicate {kind} registration: {key}")]
    DuplicateRegistration { kind: &'static str, key: String },

    #[error("Invalid definition: {0}")]
    InvalidDefinition(String),
}

impl Error {
    pub fn unexpected_state(message: impl Into<String>) -> Self {
        Error::UnexpectedState {
            message: message.into(),
            extras: None,
        }
    }

    pub fn unexpected_state_with(message: impl Into<String>, extras: Value) -> Self {
        Error::UnexpectedState {
            message: message.into(),
            extras: Some(extras),
        }
    }

    /// Convert into the JSON-RPC error sent back to the peer.
    pub fn into_jsonrpc(self) -> JsonRpcError {
        match self {
            Error::JsonRpc(err) => err,
            Error::UnexpectedState { message, extras } => {
                let err = JsonRpcError::internal_error(message);
                match extras {
                    Some(extras) => err.with_data(extras),
                    None => err,
                }
            }
            Error::Serialization(e) => JsonRpcError::invalid_params(e.to_string()),
            e => JsonRpcError::internal_error(e.to_string()),
        }
    }
}

impl From<JsonRpcError> for Error {
    fn from(err: JsonRpcError) -> Self {
        Error::JsonRpc(err)
    }
}

/// Result type alias for toolbox-mcp
pub type Result<T> = std::result::Result<T, Error>;
