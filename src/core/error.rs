/// sqlbridge Error Module
///
/// This module defines the error taxonomy for the execution service. Every
/// failure the service can observe maps onto one of these variants, and every
/// variant is eventually rendered as a structured failure payload rather than
/// a process fault.
use crate::driver::DriverError;
use thiserror::Error;

/// Comprehensive error type for sqlbridge.
///
/// The first group of variants is the service taxonomy:
/// - Connection establishment and re-establishment
/// - Transient connection loss (eligible for one silent retry)
/// - Query execution failures
/// - Cancellation
/// - Protocol violations
///
/// The remaining variants carry ambient failures (configuration, I/O, JSON).
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Initial connect or reconnect failed. Carries the raw driver text.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The backend reported the dead-connection signature.
    #[error("Connection lost: {0}")]
    TransientConnection(String),

    /// Any other statement failure. Carries the raw driver text.
    #[error("Query error: {0}")]
    Query(String),

    /// The statement with this result set id was cancelled.
    #[error("Query cancelled: {0}")]
    Cancelled(String),

    /// Malformed or unknown request.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No live connection to run against.
    #[error("Not connected to database")]
    NotConnected,

    /// Errors surfaced by a driver outside statement execution
    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    /// Configuration loading and validation errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// File system and I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing and serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic application errors for unexpected conditions
    #[error("Application error: {0}")]
    App(String),
}

impl BridgeError {
    /// Returns the unmodified backend text when the error carries one.
    ///
    /// This is what gets classified and what is echoed back as `rawError`.
    pub fn raw_text(&self) -> Option<&str> {
        match self {
            BridgeError::Connection(raw)
            | BridgeError::TransientConnection(raw)
            | BridgeError::Query(raw) => Some(raw),
            _ => None,
        }
    }

    /// Whether the retry coordinator may reconnect and retry after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, BridgeError::TransientConnection(_))
    }

    /// Whether this error is the result of a cancellation request.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, BridgeError::Cancelled(_))
    }
}

/// Type alias for Result to use BridgeError as the error type.
pub type Result<T> = std::result::Result<T, BridgeError>;
