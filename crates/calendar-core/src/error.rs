//! Unified error types for the calendar services.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Result type alias using CalendarError.
pub type Result<T> = std::result::Result<T, CalendarError>;

/// Coarse classification of a [`CalendarError`].
///
/// Adapters branch on this instead of matching message text: validation maps
/// to bad input, conflict to a conflict response, and so on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller-correctable input problem.
    Validation,
    /// Identity or interval conflict with existing state.
    Conflict,
    /// Infrastructure hiccup scoped to one call (nack, confirm timeout, lost link).
    Transient,
    /// Retries exhausted or the link is gone for good.
    Fatal,
    /// Broken invariant inside the process.
    Internal,
    /// The operation observed a cancellation signal.
    Cancelled,
    /// Everything else (config, io, serialization, backend).
    Other,
}

#[derive(Error, Debug)]
pub enum CalendarError {
    // Validation errors
    #[error("Invalid event field '{field}': {message}")]
    Validation { field: &'static str, message: String },

    // Conflict errors
    #[error("Event with id {0} already exists")]
    IdAlreadyExists(Uuid),

    #[error("Event with id {0} does not exist")]
    IdNotFound(Uuid),

    #[error("Time interval is already taken by another event")]
    IntervalConflict,

    // Internal consistency
    #[error("Storage inconsistency: {0}")]
    Inconsistent(String),

    // Storage backend errors
    #[error("Storage backend error: {0}")]
    Storage(String),

    // Broker errors
    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Broker connection lost: {0}")]
    ConnectionLost(String),

    #[error("Failed to connect after {attempts} attempts: {reason}")]
    ConnectionExhausted { attempts: u32, reason: String },

    #[error("Message not acknowledged by broker")]
    NotAcknowledged,

    #[error("Timed out after {0:?} waiting for publish confirmation")]
    ConfirmTimeout(Duration),

    #[error("Message decode error: {0}")]
    Decode(String),

    #[error("Channel is closed")]
    Closed,

    #[error("Shutdown completed with errors: {}", .0.join("; "))]
    Shutdown(Vec<String>),

    #[error("Operation cancelled")]
    Cancelled,

    // Config errors
    #[error("Configuration error: {0}")]
    Config(String),

    // General errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl CalendarError {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation { field, message: message.into() }
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn broker(msg: impl Into<String>) -> Self {
        Self::Broker(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::IdAlreadyExists(_) | Self::IdNotFound(_) | Self::IntervalConflict => {
                ErrorKind::Conflict
            }
            Self::Inconsistent(_) => ErrorKind::Internal,
            Self::Broker(_)
            | Self::ConnectionLost(_)
            | Self::NotAcknowledged
            | Self::ConfirmTimeout(_) => ErrorKind::Transient,
            Self::ConnectionExhausted { .. } | Self::Closed => ErrorKind::Fatal,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Storage(_)
            | Self::Decode(_)
            | Self::Shutdown(_)
            | Self::Config(_)
            | Self::Io(_)
            | Self::Json(_)
            | Self::Other(_) => ErrorKind::Other,
        }
    }

    /// True when retrying the same call cannot succeed without outside help.
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }
}
