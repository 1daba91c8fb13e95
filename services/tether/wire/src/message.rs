//! The transport message envelope.
//!
//! Every frame exchanged on a connection decodes to a [`TransportMessage`].
//! Routing and stream fields are carried for the dispatch layer above; this
//! crate only interprets `control_flags`, `seq` and `ack`.

use bitflags::bitflags;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stream id used by heartbeat messages
pub const HEARTBEAT_STREAM_ID: &str = "heartbeat";

/// Stable identifier of a peer (client id), unchanged across reconnects
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub String);

impl PeerId {
    /// Create a peer id from anything string-like
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

bitflags! {
    /// Control flags bitmask
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ControlFlags: u8 {
        /// Pure acknowledgment / heartbeat; never delivered, never sequenced
        const ACK = 1 << 0;
        /// First message of a stream
        const STREAM_OPEN = 1 << 1;
        /// Stream aborted by the sender
        const STREAM_CANCEL = 1 << 2;
        /// Last message of a stream
        const STREAM_CLOSED = 1 << 3;
        /// Handshake request or response
        const HANDSHAKE = 1 << 4;
        /// Protocol-level session close; the receiver must not reconnect
        const SESSION_CLOSE = 1 << 5;
    }
}

impl ControlFlags {
    /// Bits an application message may carry
    pub const STREAM_BITS: Self = Self::STREAM_OPEN
        .union(Self::STREAM_CANCEL)
        .union(Self::STREAM_CLOSED);

    /// Bits reserved for the session protocol
    pub fn reserved(self) -> Self {
        self.difference(Self::STREAM_BITS)
    }
}

impl Default for ControlFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// Generate a fresh message id
pub fn new_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// The wire envelope for every message on a connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportMessage {
    /// Unique message id
    pub id: String,
    /// Sending peer
    pub from: PeerId,
    /// Receiving peer
    pub to: PeerId,
    /// Target service, if the message opens or belongs to a call
    pub service_name: Option<String>,
    /// Target procedure, if the message opens or belongs to a call
    pub procedure_name: Option<String>,
    /// Groups the messages of one logical call or stream
    pub stream_id: String,
    /// Stream and session control bits
    pub control_flags: ControlFlags,
    /// Per-session send sequence, starting at 1; 0 on unsequenced messages
    pub seq: u64,
    /// Highest seq received from the peer so far
    pub ack: u64,
    /// Opaque payload
    pub payload: Bytes,
}

impl TransportMessage {
    /// Heartbeats carry only an ack and never reach the application
    pub fn is_heartbeat(&self) -> bool {
        self.control_flags.contains(ControlFlags::ACK)
    }

    /// Handshake request or response
    pub fn is_handshake(&self) -> bool {
        self.control_flags.contains(ControlFlags::HANDSHAKE)
    }

    /// Protocol-level close of the whole session
    pub fn is_session_close(&self) -> bool {
        self.control_flags.contains(ControlFlags::SESSION_CLOSE)
    }

    /// Whether this message is sequenced and delivered to the application
    pub fn is_application(&self) -> bool {
        !self.control_flags.intersects(
            ControlFlags::ACK | ControlFlags::HANDSHAKE | ControlFlags::SESSION_CLOSE,
        )
    }

    /// Build an unsequenced control message
    pub fn control(
        from: PeerId,
        to: PeerId,
        stream_id: &str,
        control_flags: ControlFlags,
        ack: u64,
        payload: Bytes,
    ) -> Self {
        Self {
            id: new_message_id(),
            from,
            to,
            service_name: None,
            procedure_name: None,
            stream_id: stream_id.to_string(),
            control_flags,
            seq: 0,
            ack,
            payload,
        }
    }
}

/// An application message before the session stamps ids and sequence numbers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    /// Target service
    pub service_name: Option<String>,
    /// Target procedure
    pub procedure_name: Option<String>,
    /// Stream the message belongs to
    pub stream_id: String,
    /// Stream control bits (`STREAM_*` only)
    pub control_flags: ControlFlags,
    /// Opaque payload
    pub payload: Bytes,
}

impl OutgoingMessage {
    /// Create a plain message on a stream
    pub fn new(stream_id: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            service_name: None,
            procedure_name: None,
            stream_id: stream_id.into(),
            control_flags: ControlFlags::empty(),
            payload: payload.into(),
        }
    }

    /// Address a procedure
    pub fn with_procedure(
        mut self,
        service_name: impl Into<String>,
        procedure_name: impl Into<String>,
    ) -> Self {
        self.service_name = Some(service_name.into());
        self.procedure_name = Some(procedure_name.into());
        self
    }

    /// Set stream control bits; anything outside [`ControlFlags::STREAM_BITS`]
    /// is refused at send time
    pub fn with_flags(mut self, flags: ControlFlags) -> Self {
        self.control_flags = flags;
        self
    }

    /// Stamp the envelope fields owned by the session
    pub fn into_transport(
        self,
        id: String,
        from: PeerId,
        to: PeerId,
        seq: u64,
        ack: u64,
    ) -> TransportMessage {
        TransportMessage {
            id,
            from,
            to,
            service_name: self.service_name,
            procedure_name: self.procedure_name,
            stream_id: self.stream_id,
            control_flags: self.control_flags,
            seq,
            ack,
            payload: self.payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_classification() {
        let heartbeat = TransportMessage::control(
            PeerId::from("a"),
            PeerId::from("b"),
            HEARTBEAT_STREAM_ID,
            ControlFlags::ACK,
            7,
            Bytes::new(),
        );
        assert!(heartbeat.is_heartbeat());
        assert!(!heartbeat.is_application());
        assert_eq!(heartbeat.seq, 0);

        let data = OutgoingMessage::new("stream-1", Bytes::from_static(b"hi"))
            .with_flags(ControlFlags::STREAM_OPEN)
            .into_transport(new_message_id(), "a".into(), "b".into(), 1, 0);
        assert!(data.is_application());
        assert!(!data.is_handshake());
    }

    #[test]
    fn test_reserved_flags() {
        let stream = ControlFlags::STREAM_OPEN | ControlFlags::STREAM_CLOSED;
        assert!(stream.reserved().is_empty());
        let mixed = ControlFlags::STREAM_OPEN | ControlFlags::ACK | ControlFlags::SESSION_CLOSE;
        assert_eq!(mixed.reserved(), ControlFlags::ACK | ControlFlags::SESSION_CLOSE);
    }

    #[test]
    fn test_outgoing_procedure_fields() {
        let msg = OutgoingMessage::new("s", Bytes::new()).with_procedure("kv", "get");
        assert_eq!(msg.service_name.as_deref(), Some("kv"));
        assert_eq!(msg.procedure_name.as_deref(), Some("get"));
    }

    #[test]
    fn test_message_ids_unique() {
        assert_ne!(new_message_id(), new_message_id());
    }
}
