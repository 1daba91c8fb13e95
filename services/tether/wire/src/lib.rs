//! Transport message envelope, control flags, codecs and handshake payloads for tether.
//!
//! This crate defines what travels over a single connection between two peers:
//! the [`TransportMessage`] envelope, the [`ControlFlags`] bitset, the handshake
//! request/response carried as the first exchange on every new link, and the
//! pluggable [`Codec`] capability that turns envelopes into byte frames.
//!
//! ## Binary Frame Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | Envelope Header (32B)| version, flags, seq, ack,  |
//! |                      | section lengths, crc32     |
//! +----------------------+----------------------------+
//! | meta_bytes           | ids + names (CBOR map)     |
//! +----------------------+----------------------------+
//! | payload              | opaque application bytes   |
//! +----------------------+----------------------------+
//! ```
//!
//! Connections are message oriented, so a frame never needs an outer length
//! prefix: one `send` carries exactly one frame.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod handshake;
pub mod header;
pub mod message;

// Re-export main types
pub use codec::{
    get_meta_str, parse_meta, BinaryCodec, Codec, CodecError, JsonCodec, MetaBuilder,
    DEFAULT_MAX_FRAME_SIZE,
};
pub use error::WireError;
pub use handshake::{
    ExpectedSessionState, HandshakeRequest, HandshakeResponse, RejectCode, HANDSHAKE_STREAM_ID,
    PROTOCOL_VERSION,
};
pub use header::{crc32_envelope_header, EnvelopeHeader, ENVELOPE_HEADER_SIZE, WIRE_VERSION};
pub use message::{
    new_message_id, ControlFlags, OutgoingMessage, PeerId, TransportMessage,
    HEARTBEAT_STREAM_ID,
};
