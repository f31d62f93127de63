//! Session-level error taxonomy
//!
//! Every variant names the operation and register address involved.

use super::protocol::{DecodeError, EncodeError, Frame};
use super::registers::AccessViolation;
use super::transport::TransportError;
use thiserror::Error;

/// Result alias for session operations
pub type HarpResult<T> = Result<T, HarpError>;

/// Errors surfaced by [`DeviceSession`](super::session::DeviceSession)
#[derive(Debug, Error)]
pub enum HarpError {
    /// Transport failed; the session is closed
    #[error("{operation} register {address}: transport failure: {source}")]
    Transport {
        /// Operation in progress
        operation: &'static str,
        /// Register address
        address: u8,
        /// Underlying error
        #[source]
        source: TransportError,
    },

    /// No correlated reply within the retry budget
    #[error("{operation} register {address}: no reply after {attempts} attempt(s)")]
    Timeout {
        /// Operation in progress
        operation: &'static str,
        /// Register address
        address: u8,
        /// Requests sent
        attempts: u32,
    },

    /// Only corrupt data arrived within the retry budget
    #[error("{operation} register {address}: corrupt reply stream: {source}")]
    Corrupted {
        /// Operation in progress
        operation: &'static str,
        /// Register address
        address: u8,
        /// Last decode failure
        #[source]
        source: DecodeError,
    },

    /// Device answered with ReadError or WriteError
    #[error("{operation} register {address}: device replied {}", .reply.message_type)]
    Device {
        /// Operation in progress
        operation: &'static str,
        /// Register address
        address: u8,
        /// The error reply
        reply: Box<Frame>,
    },

    /// Request rejected by the register catalog; nothing was sent
    #[error("{operation}: {source}")]
    AccessViolation {
        /// Operation in progress
        operation: &'static str,
        /// Catalog verdict
        #[source]
        source: AccessViolation,
    },

    /// Request could not be encoded; nothing was sent
    #[error("{operation} register {address}: {source}")]
    Encode {
        /// Operation in progress
        operation: &'static str,
        /// Register address
        address: u8,
        /// Encoder verdict
        #[source]
        source: EncodeError,
    },

    /// Frame is not a request a host may send
    #[error("{operation} register {address}: {reason}")]
    InvalidRequest {
        /// Operation in progress
        operation: &'static str,
        /// Register address
        address: u8,
        /// Why it was rejected
        reason: String,
    },

    /// Reply decoded but did not carry the expected payload
    #[error("{operation} register {address}: unexpected payload: {detail}")]
    UnexpectedPayload {
        /// Operation in progress
        operation: &'static str,
        /// Register address
        address: u8,
        /// What was wrong
        detail: String,
    },

    /// Session is closed
    #[error("{operation} register {address}: session closed ({reason})")]
    SessionClosed {
        /// Operation in progress
        operation: &'static str,
        /// Register address
        address: u8,
        /// Why the session closed
        reason: String,
    },
}

impl HarpError {
    /// Register address involved
    pub fn address(&self) -> u8 {
        match self {
            Self::AccessViolation { source, .. } => source.address(),
            Self::Transport { address, .. }
            | Self::Timeout { address, .. }
            | Self::Corrupted { address, .. }
            | Self::Device { address, .. }
            | Self::Encode { address, .. }
            | Self::InvalidRequest { address, .. }
            | Self::UnexpectedPayload { address, .. }
            | Self::SessionClosed { address, .. } => *address,
        }
    }

    /// Operation involved
    pub fn operation(&self) -> &'static str {
        match self {
            Self::Transport { operation, .. }
            | Self::Timeout { operation, .. }
            | Self::Corrupted { operation, .. }
            | Self::Device { operation, .. }
            | Self::AccessViolation { operation, .. }
            | Self::Encode { operation, .. }
            | Self::InvalidRequest { operation, .. }
            | Self::UnexpectedPayload { operation, .. }
            | Self::SessionClosed { operation, .. } => operation,
        }
    }

    /// Whether the session can no longer be used
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::SessionClosed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::{MessageType, Payload};

    #[test]
    fn test_messages_name_register_and_operation() {
        let err = HarpError::Timeout {
            operation: "read",
            address: 8,
            attempts: 3,
        };
        assert_eq!(err.to_string(), "read register 8: no reply after 3 attempt(s)");
        assert_eq!(err.address(), 8);
        assert!(!err.is_fatal());

        let reply = Frame::with_payload(MessageType::WriteError, 0, &Payload::from(1u16));
        let err = HarpError::Device {
            operation: "write",
            address: 0,
            reply: Box::new(reply),
        };
        assert_eq!(err.to_string(), "write register 0: device replied WriteError");
    }

    #[test]
    fn test_access_violation_address() {
        let err = HarpError::AccessViolation {
            operation: "write",
            source: AccessViolation::NotWritable { address: 16, name: "UUID" },
        };
        assert_eq!(err.address(), 16);
        assert_eq!(err.to_string(), "write: register UUID (16) is read-only");
    }
}
