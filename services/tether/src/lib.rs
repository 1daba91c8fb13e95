//! Reconnect-tolerant sessions for message-oriented connections.
//!
//! `tether` sits between an application and any transport that can carry
//! discrete frames between two peers. It is split into two crates:
//!
//! - [`wire`]: the message envelope, control flags, handshake payloads and codecs
//! - [`session`]: the connection capability, session state machine, heartbeats,
//!   replay buffer and reconnection logic
//!
//! The most common types of both are re-exported at the crate root.

pub use tether_session as session;
pub use tether_wire as wire;

pub use tether_session::{
    AcceptAll, BackoffConfig, CloseReason, Connection, ConnectionId, Connector, ErrorKind,
    EventReceiver, Extensions, HandshakeHandler, LinkError, MemConnection, MemConnector,
    ReplayConfig, SessionContext, SessionState, SessionStats, Transport, TransportBuilder,
    TransportConfig, TransportError, TransportEvent,
};
pub use tether_wire::{
    BinaryCodec, Codec, CodecError, ControlFlags, JsonCodec, OutgoingMessage, PeerId,
    TransportMessage,
};
