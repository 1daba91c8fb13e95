//! Error types for the session layer.

use std::fmt;
use tether_wire::{ControlFlags, PeerId, RejectCode};
use thiserror::Error;

/// Failure classification surfaced through transport events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The handshake message could not be parsed or was not a handshake
    MalformedHandshake,
    /// No valid handshake completed within the configured window
    HandshakeTimeout,
    /// The link reported an error
    ConnectionError,
    /// The link closed
    ConnectionClosed,
    /// No inbound traffic for the liveness window
    LivenessTimeout,
    /// An unacknowledged message was evicted from the replay buffer
    DeliveryLoss,
    /// Peers speak different protocol versions
    ProtocolVersionMismatch,
    /// The session could not be resumed without losing or duplicating data
    SessionStateMismatch,
    /// The handshake handler refused the peer
    HandshakeRejected,
    /// The peer broke the sequencing or acknowledgment rules
    ProtocolViolation,
}

impl ErrorKind {
    /// Wire-style code of this kind
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::MalformedHandshake => "MALFORMED_HANDSHAKE",
            ErrorKind::HandshakeTimeout => "HANDSHAKE_TIMEOUT",
            ErrorKind::ConnectionError => "CONNECTION_ERROR",
            ErrorKind::ConnectionClosed => "CONNECTION_CLOSED",
            ErrorKind::LivenessTimeout => "LIVENESS_TIMEOUT",
            ErrorKind::DeliveryLoss => "DELIVERY_LOSS",
            ErrorKind::ProtocolVersionMismatch => "PROTOCOL_VERSION_MISMATCH",
            ErrorKind::SessionStateMismatch => "SESSION_STATE_MISMATCH",
            ErrorKind::HandshakeRejected => "HANDSHAKE_REJECTED",
            ErrorKind::ProtocolViolation => "PROTOCOL_VIOLATION",
        }
    }

    /// Whether the session survives this failure and may reconnect
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ErrorKind::MalformedHandshake
                | ErrorKind::HandshakeTimeout
                | ErrorKind::ConnectionError
                | ErrorKind::ConnectionClosed
                | ErrorKind::LivenessTimeout
                | ErrorKind::DeliveryLoss
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl From<RejectCode> for ErrorKind {
    fn from(code: RejectCode) -> Self {
        match code {
            RejectCode::ProtocolVersionMismatch => ErrorKind::ProtocolVersionMismatch,
            RejectCode::SessionStateMismatch => ErrorKind::SessionStateMismatch,
            RejectCode::MalformedHandshake => ErrorKind::MalformedHandshake,
            RejectCode::RejectedByHandler => ErrorKind::HandshakeRejected,
        }
    }
}

/// Errors returned synchronously by [`crate::Transport`] operations
#[derive(Error, Debug)]
pub enum TransportError {
    /// The transport has been closed
    #[error("transport is closed")]
    Closed,
    /// No session exists and none can be dialed
    #[error("no session for peer {0} and no connector to dial it")]
    UnknownPeer(PeerId),
    /// The session ended before the command could be handed over
    #[error("session with peer {0} is closed")]
    SessionClosed(PeerId),
    /// An application message carried session control bits
    #[error("control flags {0:?} are reserved for the session protocol")]
    ReservedFlags(ControlFlags),
    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_codes() {
        assert_eq!(ErrorKind::HandshakeTimeout.to_string(), "HANDSHAKE_TIMEOUT");
        assert_eq!(ErrorKind::DeliveryLoss.code(), "DELIVERY_LOSS");
    }

    #[test]
    fn test_recoverable_kinds() {
        assert!(ErrorKind::LivenessTimeout.is_recoverable());
        assert!(ErrorKind::ConnectionClosed.is_recoverable());
        assert!(!ErrorKind::SessionStateMismatch.is_recoverable());
        assert!(!ErrorKind::ProtocolViolation.is_recoverable());
    }
}
