//! Error types for toolwire
//!
//! This module defines the error hierarchy for both ends of the link.

use thiserror::Error;

/// Main error type for toolwire
#[derive(Error, Debug)]
pub enum ToolwireError {
    /// Stream framing errors
    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    /// Tool registry errors
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Parameter validation errors
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Client-side call errors
    #[error("Call error: {0}")]
    Call(#[from] CallError),

    /// Transport lifecycle errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised while encoding or decoding line-delimited JSON
#[derive(Error, Debug)]
pub enum FramingError {
    #[error("line of {len} bytes exceeds the {max} byte limit")]
    LineTooLong { len: usize, max: usize },

    #[error("invalid JSON on line: {message}")]
    InvalidJson { message: String },

    #[error("line is not valid UTF-8")]
    InvalidUtf8,

    #[error("stream ended in the middle of a line ({buffered} bytes buffered)")]
    UnexpectedEof { buffered: usize },

    #[error("failed to encode message: {message}")]
    Encode { message: String },

    #[error("stream I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Tool registry errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Tool already registered: {name}")]
    DuplicateTool { name: String },

    #[error("Tool name is reserved: {name}")]
    ReservedName { name: String },

    #[error("Tool {name} not found")]
    NotFound { name: String },
}

/// Parameter validation errors. Every variant names the offending field.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid type for field {field}: expected {expected}, got {found}")]
    WrongType {
        field: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("Invalid value for field {field}: '{value}' is not one of [{allowed}]")]
    NotInEnum {
        field: String,
        value: String,
        allowed: String,
    },

    #[error("Invalid value for field {field}: {constraint}")]
    Constraint { field: String, constraint: String },
}

impl ValidationError {
    /// Path of the field that failed validation
    pub fn field(&self) -> &str {
        match self {
            ValidationError::MissingField { field }
            | ValidationError::WrongType { field, .. }
            | ValidationError::NotInEnum { field, .. }
            | ValidationError::Constraint { field, .. } => field,
        }
    }
}

/// Failures raised by a tool handler
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("Tool {tool} failed: {message}")]
    Failed { tool: String, message: String },

    #[error("Tool {tool} panicked")]
    Panicked { tool: String },
}

/// Errors seen by a single client call
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CallError {
    #[error("Tool invocation timeout: {tool} after {timeout_ms}ms")]
    Timeout { tool: String, timeout_ms: u64 },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Tool {tool} returned an error: {message}")]
    ToolFailed { tool: String, message: String },

    #[error("Tool {tool} returned an unexpected payload: {message}")]
    InvalidPayload { tool: String, message: String },

    #[error("Failed to encode request: {message}")]
    Encode { message: String },
}

/// Transport lifecycle errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to spawn server '{command}': {reason}")]
    SpawnFailed { command: String, reason: String },

    #[error("Server was not ready after {timeout_ms}ms")]
    StartupTimeout { timeout_ms: u64 },

    #[error("Server exited before signalling readiness")]
    ExitedBeforeReady,

    #[error("Failed to connect to {addr}: {reason}")]
    ConnectFailed { addr: String, reason: String },

    #[error("Transport is not connected")]
    NotConnected,

    #[error("Cannot {action} while {state}")]
    InvalidState { action: &'static str, state: String },
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {var}: '{value}'")]
    InvalidValue { var: String, value: String },
}

/// Result type alias for toolwire operations
pub type Result<T> = std::result::Result<T, ToolwireError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RegistryError::NotFound {
            name: "missing".to_string(),
        };
        assert!(err.to_string().contains("not found"));
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_error_conversion() {
        let err: ToolwireError = TransportError::ExitedBeforeReady.into();
        assert!(matches!(err, ToolwireError::Transport(_)));

        let err: ToolwireError = CallError::ConnectionClosed.into();
        assert!(matches!(err, ToolwireError::Call(CallError::ConnectionClosed)));
    }

    #[test]
    fn test_validation_error_names_field() {
        let err = ValidationError::WrongType {
            field: "address.street".to_string(),
            expected: "string",
            found: "number",
        };
        assert_eq!(err.field(), "address.street");
        assert!(err.to_string().contains("address.street"));
    }
}
