//! Events the transport reports to its owner

use crate::connection::ConnectionId;
use crate::error::ErrorKind;
use crate::extensions::Extensions;
use std::fmt;
use std::sync::Arc;
use tether_wire::{PeerId, TransportMessage};
use tokio::time::Instant;

/// Who a delivered message came from
#[derive(Debug, Clone)]
pub struct SessionContext {
    /// Remote peer
    pub peer: PeerId,
    /// Session instance the message belongs to
    pub session_id: String,
    /// Values produced by the handshake handler for this session
    pub extensions: Arc<Extensions>,
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed through the local API
    LocalClose,
    /// The peer sent a session close
    PeerClose,
    /// Nobody reconnected within the disconnect grace period
    GraceExpired,
    /// The reconnect attempt ceiling was reached
    ReconnectExhausted,
    /// A fresh session from the same peer took over
    Replaced,
    /// Resumption would have lost or duplicated messages
    StateMismatch,
    /// The peer refused the handshake
    HandshakeRejected,
    /// The peer broke the sequencing rules
    ProtocolViolation,
    /// The whole transport was closed
    TransportClosed,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::LocalClose => "local close",
            CloseReason::PeerClose => "peer close",
            CloseReason::GraceExpired => "grace period expired",
            CloseReason::ReconnectExhausted => "reconnect attempts exhausted",
            CloseReason::Replaced => "replaced by a new session",
            CloseReason::StateMismatch => "session state mismatch",
            CloseReason::HandshakeRejected => "handshake rejected",
            CloseReason::ProtocolViolation => "protocol violation",
            CloseReason::TransportClosed => "transport closed",
        };
        f.write_str(s)
    }
}

/// Transport event stream item
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// An application message was delivered, in order and exactly once
    Message {
        /// Sender and session
        ctx: SessionContext,
        /// The message
        message: TransportMessage,
    },
    /// A handshake completed
    SessionConnected {
        /// Remote peer
        peer: PeerId,
        /// Session instance
        session_id: String,
        /// Whether an existing session was resumed
        resumed: bool,
    },
    /// The link of a live session went away; the session waits for a reconnect
    SessionLost {
        /// Remote peer
        peer: PeerId,
        /// Session instance
        session_id: String,
        /// What took the link down
        kind: ErrorKind,
    },
    /// The session ended; nothing buffered in it will be delivered
    SessionClosed {
        /// Remote peer
        peer: PeerId,
        /// Session instance
        session_id: String,
        /// Why
        reason: CloseReason,
    },
    /// An unacknowledged message was evicted from the replay buffer
    DeliveryLoss {
        /// Remote peer
        peer: PeerId,
        /// Session instance
        session_id: String,
        /// Seq of the evicted message
        seq: u64,
        /// Id of the evicted message
        message_id: String,
    },
    /// An accepted message was never sequenced: it could not be encoded or
    /// its session closed first
    SendFailed {
        /// Remote peer
        peer: PeerId,
        /// Id assigned to the message
        message_id: String,
        /// What went wrong
        detail: String,
    },
    /// A connection-level failure not tied to a live session
    ProtocolError {
        /// Peer, once known
        peer: Option<PeerId>,
        /// Offending connection
        connection: Option<ConnectionId>,
        /// Classification
        kind: ErrorKind,
        /// Human-readable detail
        detail: String,
    },
}

/// Observable state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// No link; buffering sends, reconnecting or awaiting one
    #[default]
    NoConnection,
    /// Link accepted; awaiting the peer's handshake request
    WaitingForHandshake,
    /// Handshake request sent; awaiting the response
    Handshaking,
    /// Handshake done; traffic flows
    Connected,
    /// Terminal
    Closed,
}

impl SessionState {
    /// Whether moving from `self` to `next` is allowed
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (NoConnection, WaitingForHandshake)
                | (NoConnection, Handshaking)
                | (NoConnection, Closed)
                | (WaitingForHandshake, Connected)
                | (WaitingForHandshake, NoConnection)
                | (WaitingForHandshake, Closed)
                | (Handshaking, Connected)
                | (Handshaking, NoConnection)
                | (Handshaking, Closed)
                | (Connected, NoConnection)
                | (Connected, Closed)
        )
    }
}

/// Point-in-time counters of one session
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    /// Current state
    pub state: SessionState,
    /// Session instance
    pub session_id: String,
    /// Seq the next sent message will carry
    pub next_seq: u64,
    /// Highest seq acknowledged by the peer
    pub last_acked: u64,
    /// Highest seq delivered from the peer
    pub last_received: u64,
    /// Messages awaiting acknowledgment
    pub buffered: usize,
    /// Payload bytes awaiting acknowledgment
    pub buffered_bytes: usize,
    /// Set once any message has been lost to eviction
    pub degraded: bool,
    /// Application messages sent
    pub messages_sent: u64,
    /// Application messages delivered
    pub messages_delivered: u64,
    /// Duplicate messages dropped
    pub duplicates_dropped: u64,
    /// Messages re-sent during resumption
    pub messages_replayed: u64,
    /// Messages evicted from the replay buffer
    pub messages_evicted: u64,
    /// Seqs the peer evicted before they arrived here
    pub messages_skipped: u64,
    /// Heartbeats sent
    pub heartbeats_sent: u64,
    /// Links lost while connected
    pub links_lost: u64,
    /// Successful resumptions
    pub resumptions: u64,
    /// Last inbound frame
    pub last_frame_at: Option<Instant>,
}
