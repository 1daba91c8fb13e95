//! Handshake payloads.
//!
//! The first message on every new connection is a handshake request from the
//! dialing side; the accepting side answers with exactly one handshake
//! response. Both travel inside a regular [`TransportMessage`] flagged
//! `HANDSHAKE`, with the structure below CBOR-encoded as the payload.

use crate::codec::CodecError;
use crate::message::{ControlFlags, PeerId, TransportMessage};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Session protocol version spoken by this crate
pub const PROTOCOL_VERSION: u32 = 1;

/// Stream id used by handshake messages
pub const HANDSHAKE_STREAM_ID: &str = "handshake";

/// What the dialing side believes about the session it wants to resume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedSessionState {
    /// Highest seq the dialing side has received from the acceptor
    pub last_received: u64,
    /// Oldest seq still held in the dialing side's replay buffer
    /// (its next send seq when the buffer is empty)
    pub next_unacked_seq: u64,
    /// Highest seq the acceptor has acknowledged to the dialing side. Any
    /// seq between this and `next_unacked_seq` was evicted before delivery.
    #[serde(default)]
    pub last_acked: u64,
}

impl ExpectedSessionState {
    /// State of a session that has never exchanged a message
    pub fn fresh() -> Self {
        Self {
            last_received: 0,
            next_unacked_seq: 1,
            last_acked: 0,
        }
    }
}

/// Handshake request sent by the dialing side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    /// Protocol version of the sender
    pub protocol_version: u32,
    /// Session instance the sender wants to establish or resume
    pub session_id: String,
    /// Sender's view of the session
    pub expected_session_state: ExpectedSessionState,
    /// Application metadata for the acceptor's handshake handler
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl HandshakeRequest {
    /// Whether this request carries no prior session state.
    ///
    /// A dialer whose first messages were all evicted before it ever connected
    /// still counts as fresh: nothing was exchanged with any acceptor.
    pub fn is_fresh(&self) -> bool {
        let state = &self.expected_session_state;
        state.last_received == 0 && state.last_acked == 0
    }

    /// Wrap into the envelope sent on the wire
    pub fn into_message(&self, from: PeerId, to: PeerId) -> Result<TransportMessage, CodecError> {
        Ok(TransportMessage::control(
            from,
            to,
            HANDSHAKE_STREAM_ID,
            ControlFlags::HANDSHAKE,
            0,
            encode_payload(self)?,
        ))
    }

    /// Extract from a received envelope
    pub fn from_message(msg: &TransportMessage) -> Result<Self, CodecError> {
        expect_handshake(msg)?;
        decode_payload(&msg.payload)
    }
}

/// Why an acceptor refused a handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectCode {
    /// Peers speak different protocol versions
    ProtocolVersionMismatch,
    /// The session cannot be resumed without losing or duplicating data
    SessionStateMismatch,
    /// The request could not be parsed
    MalformedHandshake,
    /// The application handshake handler refused the metadata
    RejectedByHandler,
}

/// Handshake response sent by the accepting side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeResponse {
    /// Session established or resumed
    Accepted {
        /// Session instance now in effect
        session_id: String,
        /// Highest seq the acceptor has received from the dialing side
        last_received: u64,
        /// Oldest seq the acceptor still holds for replay; anything the
        /// dialing side is missing below it was evicted
        #[serde(default)]
        next_unacked_seq: u64,
    },
    /// Handshake refused
    Rejected {
        /// Machine-readable reason
        code: RejectCode,
        /// Human-readable detail
        reason: String,
    },
}

impl HandshakeResponse {
    /// Wrap into the envelope sent on the wire
    pub fn into_message(&self, from: PeerId, to: PeerId) -> Result<TransportMessage, CodecError> {
        Ok(TransportMessage::control(
            from,
            to,
            HANDSHAKE_STREAM_ID,
            ControlFlags::HANDSHAKE,
            0,
            encode_payload(self)?,
        ))
    }

    /// Extract from a received envelope
    pub fn from_message(msg: &TransportMessage) -> Result<Self, CodecError> {
        expect_handshake(msg)?;
        decode_payload(&msg.payload)
    }
}

fn expect_handshake(msg: &TransportMessage) -> Result<(), CodecError> {
    if msg.is_handshake() {
        Ok(())
    } else {
        Err(CodecError::Handshake(format!(
            "expected handshake, got flags {:?} on stream {}",
            msg.control_flags, msg.stream_id
        )))
    }
}

fn encode_payload<T: Serialize>(value: &T) -> Result<Bytes, CodecError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|_| CodecError::MetaEncode)?;
    Ok(Bytes::from(buf))
}

fn decode_payload<T: DeserializeOwned>(raw: &[u8]) -> Result<T, CodecError> {
    ciborium::from_reader(raw).map_err(|e| CodecError::Handshake(e.to_string()))
}
