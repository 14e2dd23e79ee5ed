use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;

use crate::node::{NodeId, NodeState};

/// Main error type for the tokenmesh coordination service
#[derive(Debug)]
pub enum TokenMeshError {
    /// Configuration or CLI argument errors
    Config(String),

    /// Protocol violations: bad sender ids, malformed tokens, handshake mismatches
    Protocol(String),

    /// Illegal node state machine transition
    InvalidTransition { from: NodeState, to: NodeState },

    /// Node lifecycle errors (unknown node, node already stopped, ...)
    Node(String),

    /// Transport layer errors
    Transport(String),

    /// System I/O errors
    Io(std::io::Error),

    /// Serialization/deserialization errors
    Serialization(SerializationError),

    /// Internal lock poisoning or concurrency errors
    Concurrency(String),
}

/// Serialization related errors
#[derive(Debug)]
pub enum SerializationError {
    /// JSON serialization/deserialization errors
    Json(serde_json::Error),

    /// Wire encoding errors
    Encode(bincode::error::EncodeError),

    /// Wire decoding errors
    Decode(bincode::error::DecodeError),
}

impl fmt::Display for TokenMeshError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenMeshError::Config(msg) => write!(f, "Configuration error: {}", msg),
            TokenMeshError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            TokenMeshError::InvalidTransition { from, to } => {
                write!(f, "Invalid state transition: {} -> {}", from, to)
            }
            TokenMeshError::Node(msg) => write!(f, "Node error: {}", msg),
            TokenMeshError::Transport(msg) => write!(f, "Transport error: {}", msg),
            TokenMeshError::Io(err) => write!(f, "I/O error: {}", err),
            TokenMeshError::Serialization(err) => write!(f, "Serialization error: {}", err),
            TokenMeshError::Concurrency(msg) => write!(f, "Concurrency error: {}", msg),
        }
    }
}

impl fmt::Display for SerializationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SerializationError::Json(err) => write!(f, "JSON: {}", err),
            SerializationError::Encode(err) => write!(f, "Wire encode: {}", err),
            SerializationError::Decode(err) => write!(f, "Wire decode: {}", err),
        }
    }
}

impl std::error::Error for TokenMeshError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TokenMeshError::Io(err) => Some(err),
            TokenMeshError::Serialization(err) => Some(err),
            _ => None,
        }
    }
}

impl std::error::Error for SerializationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SerializationError::Json(err) => Some(err),
            SerializationError::Encode(err) => Some(err),
            SerializationError::Decode(err) => Some(err),
        }
    }
}

// Convenient type alias for Results using our error type
pub type Result<T> = std::result::Result<T, TokenMeshError>;

impl TokenMeshError {
    /// Get the appropriate HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            TokenMeshError::Config(_) => StatusCode::BAD_REQUEST,
            TokenMeshError::Protocol(_) => StatusCode::BAD_REQUEST,
            TokenMeshError::InvalidTransition { .. } => StatusCode::CONFLICT,
            TokenMeshError::Node(_) => StatusCode::NOT_FOUND,
            TokenMeshError::Transport(_) => StatusCode::SERVICE_UNAVAILABLE,
            TokenMeshError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            TokenMeshError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
            TokenMeshError::Concurrency(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error type identifier
    pub fn error_type(&self) -> &'static str {
        match self {
            TokenMeshError::Config(_) => "configuration_error",
            TokenMeshError::Protocol(_) => "protocol_error",
            TokenMeshError::InvalidTransition { .. } => "invalid_transition",
            TokenMeshError::Node(_) => "node_error",
            TokenMeshError::Transport(_) => "transport_error",
            TokenMeshError::Io(_) => "io_error",
            TokenMeshError::Serialization(_) => "serialization_error",
            TokenMeshError::Concurrency(_) => "concurrency_error",
        }
    }
}

impl IntoResponse for TokenMeshError {
    fn into_response(self) -> Response {
        let status_code = self.status_code();
        let error_response = json!({
            "error": {
                "code": status_code.as_u16(),
                "message": self.to_string(),
                "type": self.error_type(),
            }
        });

        (status_code, Json(error_response)).into_response()
    }
}

// Conversions from common error types
impl From<std::io::Error> for TokenMeshError {
    fn from(err: std::io::Error) -> Self {
        TokenMeshError::Io(err)
    }
}

impl From<serde_json::Error> for TokenMeshError {
    fn from(err: serde_json::Error) -> Self {
        TokenMeshError::Serialization(SerializationError::Json(err))
    }
}

impl From<bincode::error::EncodeError> for TokenMeshError {
    fn from(err: bincode::error::EncodeError) -> Self {
        TokenMeshError::Serialization(SerializationError::Encode(err))
    }
}

impl From<bincode::error::DecodeError> for TokenMeshError {
    fn from(err: bincode::error::DecodeError) -> Self {
        TokenMeshError::Serialization(SerializationError::Decode(err))
    }
}

impl From<SerializationError> for TokenMeshError {
    fn from(err: SerializationError) -> Self {
        TokenMeshError::Serialization(err)
    }
}

impl From<std::num::TryFromIntError> for TokenMeshError {
    fn from(err: std::num::TryFromIntError) -> Self {
        TokenMeshError::Config(format!("Integer conversion error: {}", err))
    }
}

impl TokenMeshError {
    pub fn unknown_node(node_id: NodeId) -> Self {
        TokenMeshError::Node(format!("Unknown node: {}", node_id))
    }
}

// Helper macros for common error construction patterns
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::error::TokenMeshError::Config($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::TokenMeshError::Config(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! protocol_error {
    ($msg:expr) => {
        $crate::error::TokenMeshError::Protocol($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::TokenMeshError::Protocol(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! transport_error {
    ($msg:expr) => {
        $crate::error::TokenMeshError::Transport($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::TokenMeshError::Transport(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! concurrency_error {
    ($msg:expr) => {
        $crate::error::TokenMeshError::Concurrency($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::TokenMeshError::Concurrency(format!($fmt, $($arg)*))
    };
}
