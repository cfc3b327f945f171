//! Custom error types for the application.
//!
//! This module defines the layered error types used by the instrument stack and
//! the crate-level `GseError` that ties them together. Using the `thiserror`
//! crate keeps every layer explicit while `#[from]` lets the `?` operator lift
//! lower-level failures into higher-level ones.
//!
//! ## Error Hierarchy
//!
//! - **`TransportError`**: timeouts, disconnections and open failures on a
//!   byte channel (serial port, SCPI socket, VISA session).
//! - **`SessionError`**: failures of an instrument session operation, most
//!   importantly "not open" preconditions.
//! - **`ProcedureError`**: busy-guard and worker failures of long-running test
//!   procedures.
//! - **`RemoteError`**: failures of short-lived remote shell/file-transfer and
//!   REST sessions against network appliances.
//! - **`GseError`**: the crate-level union, classified into the five
//!   categories of [`ErrorCategory`] so the outermost boundary can decide what
//!   a caller is allowed to see.

use crate::config::ConfigError;
use crate::procedure::ProcedureKind;
use crate::protocol::sas_frame::{FrameError, RangeError};
use std::time::Duration;
use thiserror::Error;

/// Message shown to callers for unexpected failures.
pub const UNEXPECTED_MESSAGE: &str = "Unexpected error. See log for details";

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, GseError>;

/// Errors raised by a byte-oriented transport.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Transport '{0}' is not open")]
    NotOpen(String),

    #[error("Timed out after {timeout:?} waiting to {operation} on '{endpoint}'")]
    Timeout {
        endpoint: String,
        operation: &'static str,
        timeout: Duration,
    },

    #[error("Connection to '{0}' closed by peer")]
    Disconnected(String),

    #[error("Failed to open '{endpoint}': {reason}")]
    OpenFailed { endpoint: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported resource string '{0}'")]
    UnsupportedResource(String),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    #[error("Transport worker panicked: {0}")]
    Worker(String),
}

impl TransportError {
    /// Whether the error is a bounded-wait expiry rather than a hard failure.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout { .. })
    }
}

/// Errors raised by instrument session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("{0} is not open")]
    NotOpen(&'static str),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Range(#[from] RangeError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors raised when starting or supervising a long-running procedure.
#[derive(Error, Debug)]
pub enum ProcedureError {
    #[error("{0} procedure is already running")]
    Busy(ProcedureKind),

    #[error("{0} procedure is not running")]
    NotRunning(ProcedureKind),
}

/// Errors raised by remote appliance sessions.
#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("Failed to connect to {host}:{port}: {reason}")]
    Connect {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("Authentication rejected for user '{0}'")]
    Authentication(String),

    #[error("Remote path '{0}' does not exist")]
    NotFound(String),

    #[error("Remote operation '{operation}' failed: {reason}")]
    Operation {
        operation: &'static str,
        reason: String,
    },

    #[error("HTTP request to '{url}' failed: {reason}")]
    Http { url: String, reason: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Local file error at '{path}': {source}")]
    Local {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    #[error("Remote worker panicked: {0}")]
    Worker(String),
}

/// The five error classes a caller-facing boundary distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Timeout or disconnection on a channel.
    Transport,
    /// Frame not found, wrong length or checksum mismatch.
    Protocol,
    /// Caller-supplied parameters outside instrument-safe bounds.
    Validation,
    /// Session not open, procedure already busy, instrument unavailable.
    Precondition,
    /// Anything else.
    Unexpected,
}

/// Crate-level error type.
#[derive(Error, Debug)]
pub enum GseError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Frame(#[from] FrameError),

    #[error("Validation error: {0}")]
    Range(#[from] RangeError),

    #[error("{0}")]
    Session(#[from] SessionError),

    #[error("{0}")]
    Procedure(#[from] ProcedureError),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("{0} is unavailable (not configured)")]
    InstrumentUnavailable(&'static str),

    #[error("{0} returned no data")]
    NoData(&'static str),

    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl GseError {
    /// Classify the error for the caller-facing boundary.
    pub fn category(&self) -> ErrorCategory {
        match self {
            GseError::Transport(_) => ErrorCategory::Transport,
            GseError::Frame(_) | GseError::NoData(_) => ErrorCategory::Protocol,
            GseError::Range(_) => ErrorCategory::Validation,
            GseError::Session(err) => match err {
                SessionError::NotOpen(_) | SessionError::InvalidArgument(_) => {
                    ErrorCategory::Precondition
                }
                SessionError::Range(_) => ErrorCategory::Validation,
                SessionError::Transport(_) => ErrorCategory::Transport,
            },
            GseError::Procedure(_) | GseError::InstrumentUnavailable(_) => {
                ErrorCategory::Precondition
            }
            GseError::Remote(err) => match err {
                RemoteError::InvalidRequest(_) | RemoteError::NotFound(_) => {
                    ErrorCategory::Precondition
                }
                RemoteError::Worker(_) | RemoteError::Local { .. } => ErrorCategory::Unexpected,
                _ => ErrorCategory::Transport,
            },
            GseError::Config(_) | GseError::Unexpected(_) => ErrorCategory::Unexpected,
        }
    }

    /// Text a caller may see. Unexpected failures collapse to
    /// [`UNEXPECTED_MESSAGE`]; their detail belongs in the log only.
    pub fn caller_message(&self) -> String {
        match self.category() {
            ErrorCategory::Unexpected => UNEXPECTED_MESSAGE.to_string(),
            _ => self.to_string(),
        }
    }
}
