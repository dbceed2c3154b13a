//! Error type shared by every relay component.
//!
//! Setup failures (bad configuration, wrong socket mode, bind/connect errors)
//! must reach the caller. Steady-state failures are recoverable and callers
//! decide whether to retry.

use crate::connection::SocketMode;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("{operation}() is not supported in {mode} mode")]
    Mode {
        operation: &'static str,
        mode: SocketMode,
    },

    #[error("{context}: {source}")]
    Connection {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(&'static str),

    #[error("{operation} failed: {source}")]
    TransientIo {
        operation: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("Connection is closed")]
    Closed,

    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("Peer with ID already exists: {0}")]
    DuplicateId(String),
}

/// Which side of the propagation policy an error falls on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Non-recoverable; the operation was aborted during setup.
    Setup,
    /// Recoverable; reported as "no data" or a failed attempt.
    SteadyState,
}

impl RelayError {
    pub fn class(&self) -> ErrorClass {
        match self {
            RelayError::Configuration(_)
            | RelayError::Mode { .. }
            | RelayError::Connection { .. }
            | RelayError::InvalidInput(_) => ErrorClass::Setup,
            RelayError::TransientIo { .. }
            | RelayError::Closed
            | RelayError::PeerNotFound(_)
            | RelayError::DuplicateId(_) => ErrorClass::SteadyState,
        }
    }

    pub fn is_setup(&self) -> bool {
        self.class() == ErrorClass::Setup
    }

    pub(crate) fn connection(context: impl Into<String>, source: io::Error) -> Self {
        RelayError::Connection {
            context: context.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_errors_are_classified() {
        let err = RelayError::Configuration("bad".into());
        assert_eq!(err.class(), ErrorClass::Setup);

        let err = RelayError::Mode {
            operation: "accept",
            mode: SocketMode::StreamClient,
        };
        assert!(err.is_setup());
        assert_eq!(
            err.to_string(),
            "accept() is not supported in STREAM_CLIENT mode"
        );
    }

    #[test]
    fn test_steady_state_errors_are_classified() {
        assert_eq!(RelayError::Closed.class(), ErrorClass::SteadyState);
        assert_eq!(
            RelayError::PeerNotFound("a".into()).class(),
            ErrorClass::SteadyState
        );
        assert!(!RelayError::DuplicateId("a".into()).is_setup());
    }
}
