//! Error types for the kRPC engine.
//!
//! Errors fall into three groups that the update loop treats differently:
//! codec faults and framing failures close the offending connection,
//! procedure failures become error Responses, and transport disconnects are
//! absorbed by tearing the client down.

use crate::protocol::ConnectionStatus;
use thiserror::Error;

/// Faults raised while encoding or decoding a value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("{type_name} is not a serializable type")]
    NotSerializable { type_name: String },

    #[error("Malformed data: {message}")]
    Malformed { message: String },

    /// A length prefix (or fixed-width field) points past the end of the buffer.
    #[error("Truncated data: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("Type mismatch: expected {expected}, got {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("No object with handle {0}")]
    UnknownHandle(u64),

    #[error("Invalid UTF-8 string")]
    InvalidUtf8,
}

impl CodecError {
    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        CodecError::Malformed {
            message: message.into(),
        }
    }
}

/// Errors raised by the round-robin scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("Scheduler is empty")]
    Empty,

    #[error("Item is already scheduled")]
    AlreadyScheduled,

    #[error("Item is not scheduled")]
    NotScheduled,
}

/// Main error type for the engine.
#[derive(Debug, Error)]
pub enum KrpcError {
    // Wire errors
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("Malformed request: {message}")]
    MalformedRequest { message: String },

    #[error("Request of {size} bytes exceeds the {limit} byte buffer")]
    RequestTooLarge { size: usize, limit: usize },

    // Connection errors
    #[error("Client disconnected")]
    ClientDisconnected,

    #[error("Connection denied ({status}): {message}")]
    ConnectionDenied {
        status: ConnectionStatus,
        message: String,
    },

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    // Procedure errors
    #[error("Service {0} not found")]
    ServiceNotFound(String),

    #[error("Procedure {procedure} not found, in Service {service}")]
    ProcedureNotFound { service: String, procedure: String },

    #[error("Invalid argument for {procedure}: {message}")]
    InvalidArgument { procedure: String, message: String },

    #[error("Invalid return value from {procedure}: {message}")]
    InvalidReturnValue { procedure: String, message: String },

    #[error("{0}")]
    Procedure(String),

    #[error("Duplicate procedure {0}")]
    DuplicateProcedure(String),

    // Stream errors
    #[error("No stream client is connected for this RPC client")]
    NoStreamClient,

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Server is not running")]
    NotRunning,
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, KrpcError>;

impl From<std::io::Error> for KrpcError {
    fn from(err: std::io::Error) -> Self {
        KrpcError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for KrpcError {
    fn from(err: serde_json::Error) -> Self {
        KrpcError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl KrpcError {
    /// Create a procedure failure from any displayable message.
    pub fn procedure(message: impl Into<String>) -> Self {
        KrpcError::Procedure(message.into())
    }

    /// Map the error onto a connection status code.
    ///
    /// Only meaningful for errors raised while a connection is being set up;
    /// everything that is not a framing or denial problem reports
    /// `MalformedMessage`.
    pub fn connection_status(&self) -> ConnectionStatus {
        match self {
            KrpcError::ConnectionDenied { status, .. } => *status,
            _ => ConnectionStatus::MalformedMessage,
        }
    }

    /// Whether the error means the connection must be closed.
    ///
    /// Procedure and lookup failures are reported to the client in a
    /// Response and the connection stays open.
    pub fn is_fatal_for_connection(&self) -> bool {
        matches!(
            self,
            KrpcError::Codec(_)
                | KrpcError::MalformedRequest { .. }
                | KrpcError::RequestTooLarge { .. }
                | KrpcError::ClientDisconnected
                | KrpcError::ConnectionDenied { .. }
                | KrpcError::Io { .. }
        )
    }
}
