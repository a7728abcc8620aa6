//! Error types for invite-core
//!
//! Errors fall into the four protocol categories reported to the application
//! ([`ErrorKind`]) plus a handful of local usage errors (calling an operation in
//! a state where it makes no sense, configuration problems, unknown sessions).
//!
//! | Kind | Recovery |
//! |------|----------|
//! | `ProtocolViolation` | offending exchange rejected, session continues |
//! | `GlareCollision` | randomized backoff and retry |
//! | `AckTimeout` | fatal, session terminates and sends BYE |
//! | `ApplicationRejection` | only the in-flight modification ends |

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::InviteState;
use crate::types::{Method, SessionId, StatusCode};

/// Result type for invite-core operations
pub type InviteResult<T> = Result<T, InviteError>;

/// Protocol error taxonomy surfaced to the application in notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    ProtocolViolation,
    GlareCollision,
    AckTimeout,
    ApplicationRejection,
}

impl ErrorKind {
    /// Whether this kind of error ends the session
    pub fn is_fatal(&self) -> bool {
        matches!(self, ErrorKind::AckTimeout)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::ProtocolViolation => "protocol violation",
            ErrorKind::GlareCollision => "glare collision",
            ErrorKind::AckTimeout => "ACK timeout",
            ErrorKind::ApplicationRejection => "application rejection",
        };
        f.write_str(name)
    }
}

/// Errors produced by the INVITE session core
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InviteError {
    /// Offer/answer sequencing or message flow violated the protocol
    #[error("Protocol violation: {message}")]
    ProtocolViolation { message: String },

    /// A renegotiation collided with one from the peer
    #[error("Glare collision on {method}")]
    GlareCollision { method: Method },

    /// No ACK arrived for a 2xx within the retransmission budget
    #[error("No ACK received after {attempts} retransmissions")]
    AckTimeout { attempts: u32 },

    /// The application rejected an offer from the peer
    #[error("Application rejected offer with {status}")]
    ApplicationRejection { status: StatusCode },

    /// Operation is not valid in the current state
    #[error("Cannot {operation} in state {state}")]
    InvalidState {
        operation: &'static str,
        state: InviteState,
    },

    /// A subsidiary request (INFO/REFER) is already outstanding
    #[error("Subsidiary {method} request already outstanding")]
    SubsidiaryPending { method: Method },

    /// Status code not usable for the requested operation
    #[error("Invalid status code {status}: {reason}")]
    InvalidStatus { status: StatusCode, reason: String },

    /// Session has already terminated
    #[error("Session {0} has terminated")]
    Terminated(SessionId),

    /// No session with this identifier
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    /// Configuration error
    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

impl InviteError {
    /// Create a protocol violation error
    pub fn protocol_violation(message: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            message: message.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(operation: &'static str, state: InviteState) -> Self {
        Self::InvalidState { operation, state }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an invalid status error
    pub fn invalid_status(status: StatusCode, reason: impl Into<String>) -> Self {
        Self::InvalidStatus {
            status,
            reason: reason.into(),
        }
    }

    /// Protocol category of this error, if it is one
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            InviteError::ProtocolViolation { .. } => Some(ErrorKind::ProtocolViolation),
            InviteError::GlareCollision { .. } => Some(ErrorKind::GlareCollision),
            InviteError::AckTimeout { .. } => Some(ErrorKind::AckTimeout),
            InviteError::ApplicationRejection { .. } => Some(ErrorKind::ApplicationRejection),
            _ => None,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind().map(|kind| kind.is_fatal()).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_mapping() {
        assert_eq!(
            InviteError::protocol_violation("two offers").kind(),
            Some(ErrorKind::ProtocolViolation)
        );
        assert_eq!(
            InviteError::AckTimeout { attempts: 10 }.kind(),
            Some(ErrorKind::AckTimeout)
        );
        assert!(InviteError::AckTimeout { attempts: 10 }.is_fatal());
        assert!(!InviteError::GlareCollision { method: Method::Invite }.is_fatal());
        assert_eq!(InviteError::config("bad t1").kind(), None);
    }

    #[test]
    fn test_error_display() {
        let err = InviteError::invalid_state("accept", InviteState::Connected);
        assert_eq!(err.to_string(), "Cannot accept in state Connected");
        let err = InviteError::SubsidiaryPending { method: Method::Info };
        assert_eq!(err.to_string(), "Subsidiary INFO request already outstanding");
    }
}
