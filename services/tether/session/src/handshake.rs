//! Session-side handshake rules.
//!
//! The dialing side sends a [`HandshakeRequest`] describing what it believes
//! about the session; the accepting side validates it, runs the application
//! [`HandshakeHandler`] and decides between a fresh session, a resumption and
//! a rejection.

use crate::extensions::Extensions;
use crate::reliability::{RecvState, SendState};
use std::collections::BTreeMap;
use tether_wire::{
    ExpectedSessionState, HandshakeRequest, PeerId, RejectCode, TransportMessage, PROTOCOL_VERSION,
};
use tracing::debug;

/// Application hook run on the accepting side for every handshake
pub trait HandshakeHandler: Send + Sync + 'static {
    /// Accept the peer and produce its session extensions, or refuse with a reason
    fn validate(
        &self,
        peer: &PeerId,
        metadata: &BTreeMap<String, String>,
    ) -> Result<Extensions, String>;
}

/// Handler that accepts every peer with empty extensions
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl HandshakeHandler for AcceptAll {
    fn validate(
        &self,
        _peer: &PeerId,
        _metadata: &BTreeMap<String, String>,
    ) -> Result<Extensions, String> {
        Ok(Extensions::new())
    }
}

/// A handshake the accepting side refuses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// Code sent to the peer
    pub code: RejectCode,
    /// Detail sent to the peer and logged locally
    pub reason: String,
}

impl Rejection {
    fn new(code: RejectCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

/// Request a client sends for its current session
pub fn build_request(
    session_id: &str,
    send: &SendState,
    recv: &RecvState,
    metadata: &BTreeMap<String, String>,
) -> HandshakeRequest {
    HandshakeRequest {
        protocol_version: PROTOCOL_VERSION,
        session_id: session_id.to_string(),
        expected_session_state: ExpectedSessionState {
            last_received: recv.last_received(),
            next_unacked_seq: send.next_unacked_seq(),
            last_acked: send.cum_acked(),
        },
        metadata: metadata.clone(),
    }
}

/// Parse and validate the first message of an inbound connection
pub fn accept_request(
    local_id: &PeerId,
    msg: &TransportMessage,
    handler: &dyn HandshakeHandler,
) -> Result<(HandshakeRequest, Extensions), Rejection> {
    if &msg.to != local_id {
        return Err(Rejection::new(
            RejectCode::MalformedHandshake,
            format!("handshake addressed to {}, this is {}", msg.to, local_id),
        ));
    }
    let request = HandshakeRequest::from_message(msg)
        .map_err(|e| Rejection::new(RejectCode::MalformedHandshake, e.to_string()))?;
    if request.protocol_version != PROTOCOL_VERSION {
        return Err(Rejection::new(
            RejectCode::ProtocolVersionMismatch,
            format!(
                "peer speaks protocol {}, expected {}",
                request.protocol_version, PROTOCOL_VERSION
            ),
        ));
    }
    if request.session_id.is_empty() {
        return Err(Rejection::new(
            RejectCode::MalformedHandshake,
            "empty session id",
        ));
    }
    let extensions = handler
        .validate(&msg.from, &request.metadata)
        .map_err(|reason| Rejection::new(RejectCode::RejectedByHandler, reason))?;

    debug!(
        "Accepted handshake from {} for session {}",
        msg.from, request.session_id
    );
    Ok((request, extensions))
}

/// Whether the accepting side can resume its session for `expected`.
///
/// Both directions must be recoverable: every message this side is missing
/// must still be buffered by the dialer or have been evicted there, and the
/// same holds the other way round.
pub fn check_resume(
    expected: &ExpectedSessionState,
    send: &SendState,
    recv: &RecvState,
) -> Result<(), Rejection> {
    if expected.last_acked > recv.last_received() {
        return Err(Rejection::new(
            RejectCode::SessionStateMismatch,
            format!(
                "received up to seq {} but the peer holds acks through seq {}",
                recv.last_received(),
                expected.last_acked
            ),
        ));
    }
    send.can_resume_from(expected.last_received)
        .map_err(|reason| Rejection::new(RejectCode::SessionStateMismatch, reason))
}
