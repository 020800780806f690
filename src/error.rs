//! Error types for the power-supply control core.
//!
//! This module defines the primary error type, `PsuError`, and the lower-level
//! `TransportError` raised by transports. Using the `thiserror` crate, it provides a
//! single vocabulary for everything that can stop an operation, from bad caller input
//! to a dead serial link.
//!
//! ## Error Hierarchy
//!
//! `PsuError` consolidates the failure classes an operation can end with:
//!
//! - **`Connection`**: No active session. Raised before an operation is scheduled, so
//!   nothing is sent to the instrument.
//! - **`Validation`**: Caller-supplied parameters failed a type, range or enum check.
//!   Also raised before scheduling.
//! - **`Transport`**: Wraps `TransportError`. The command could not be delivered or the
//!   response could not be received (I/O failure, timeout, malformed resource string).
//! - **`Protocol`**: A response arrived but did not decode as the expected type.
//! - **`Precondition`**: The session state does not allow the operation (for example a
//!   restore with nothing captured).
//! - **`Busy`**: Another operation is in flight and the session rejects concurrent work.
//! - **`Config`**: Wraps `ConfigError` from the configuration layer.
//! - **`SessionClosed`**: The session task has stopped and can no longer accept work.
//!
//! `Transport` and `Protocol` are treated identically by the sequencer: the current
//! operation fails at the step boundary and no further steps run. [`ErrorKind`] is the
//! serializable classification carried on operation reports.

use crate::config::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type PsuResult<T> = std::result::Result<T, PsuError>;

#[derive(Error, Debug)]
pub enum PsuError {
    #[error("Not connected: {0}")]
    Connection(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Session busy: {0} is still running")]
    Busy(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Session task has stopped")]
    SessionClosed,
}

impl PsuError {
    /// Classifies this error into the reporting taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PsuError::Connection(_) => ErrorKind::Connection,
            PsuError::Validation(_) => ErrorKind::Validation,
            PsuError::Transport(_) => ErrorKind::Transport,
            PsuError::Protocol(_) => ErrorKind::Protocol,
            PsuError::Precondition(_) => ErrorKind::Precondition,
            PsuError::Busy(_) => ErrorKind::Busy,
            PsuError::Config(_) => ErrorKind::Config,
            PsuError::SessionClosed => ErrorKind::SessionClosed,
        }
    }

    pub(crate) fn protocol(what: &str, response: &str) -> Self {
        PsuError::Protocol(format!("expected {what}, got {response:?}"))
    }
}

/// Errors raised by a [`Transport`](crate::transport::Transport) implementation.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No response within {0:?}")]
    Timeout(Duration),

    #[error("Invalid resource identifier '{0}'")]
    InvalidResource(String),

    #[error("Transport is not open")]
    NotOpen,

    #[error("{0} support not enabled. Rebuild with --features {1}")]
    FeatureDisabled(&'static str, &'static str),

    #[error("Injected failure on '{0}'")]
    Injected(String),

    #[error("Transport task failed: {0}")]
    TaskFailed(String),
}

/// Serializable error classification attached to failed operation reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connection,
    Validation,
    Transport,
    Protocol,
    Precondition,
    Busy,
    Config,
    SessionClosed,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Connection => "ConnectionError",
            ErrorKind::Validation => "ValidationError",
            ErrorKind::Transport => "TransportError",
            ErrorKind::Protocol => "ProtocolError",
            ErrorKind::Precondition => "PreconditionError",
            ErrorKind::Busy => "BusyError",
            ErrorKind::Config => "ConfigError",
            ErrorKind::SessionClosed => "SessionClosed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PsuError::Validation("voltage must be numeric".to_string());
        assert_eq!(err.to_string(), "Invalid input: voltage must be numeric");
    }

    #[test]
    fn test_transport_error_converts() {
        let err: PsuError = TransportError::Timeout(Duration::from_secs(1)).into();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(err.to_string().contains("No response within"));
    }

    #[test]
    fn test_protocol_helper_quotes_response() {
        let err = PsuError::protocol("a decimal number", "measured");
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert_eq!(
            err.to_string(),
            "Protocol error: expected a decimal number, got \"measured\""
        );
    }

    #[test]
    fn test_kind_display_names() {
        assert_eq!(ErrorKind::Transport.to_string(), "TransportError");
        assert_eq!(ErrorKind::Precondition.to_string(), "PreconditionError");
    }
}
