//! Encoding and decoding of transport messages.
//!
//! The session layer only ever talks to the [`Codec`] trait. Two codecs ship
//! with the crate: [`BinaryCodec`] (fixed header + CBOR metadata + raw
//! payload) and [`JsonCodec`] (whole envelope as JSON, handy when debugging a
//! link with a packet capture).

use crate::header::{EnvelopeHeader, ENVELOPE_HEADER_SIZE};
use crate::message::{PeerId, TransportMessage};
use crate::WireError;
use bytes::{Bytes, BytesMut};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Default maximum encoded frame size (16 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    /// Wire format error
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
    /// Metadata encoding error
    #[error("metadata encoding failed")]
    MetaEncode,
    /// Metadata decoding error
    #[error("metadata decoding failed")]
    MetaDecode,
    /// A required envelope field is absent
    #[error("missing field: {0}")]
    MissingField(&'static str),
    /// JSON encoding or decoding error
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    /// Payload is not the expected handshake structure
    #[error("invalid handshake payload: {0}")]
    Handshake(String),
}

/// Pluggable message codec
pub trait Codec: Send + Sync + fmt::Debug + 'static {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Encode one envelope into one frame
    fn to_bytes(&self, msg: &TransportMessage) -> Result<Bytes, CodecError>;

    /// Decode one frame into one envelope
    fn from_bytes(&self, frame: &[u8]) -> Result<TransportMessage, CodecError>;
}

/// CBOR metadata builder helper
#[derive(Debug, Clone, Default)]
pub struct MetaBuilder {
    map: BTreeMap<String, ciborium::Value>,
}

impl MetaBuilder {
    /// Create a new metadata builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a string value
    pub fn insert_str(mut self, key: &str, value: &str) -> Self {
        self.map
            .insert(key.to_string(), ciborium::Value::Text(value.to_string()));
        self
    }

    /// Insert a string value when present
    pub fn insert_opt_str(self, key: &str, value: Option<&str>) -> Self {
        match value {
            Some(value) => self.insert_str(key, value),
            None => self,
        }
    }

    /// Build the metadata as CBOR bytes
    pub fn build(self) -> Result<Bytes, CodecError> {
        let value = ciborium::Value::Map(
            self.map
                .into_iter()
                .map(|(k, v)| (ciborium::Value::Text(k), v))
                .collect(),
        );

        let mut buf = Vec::new();
        ciborium::into_writer(&value, &mut buf).map_err(|_| CodecError::MetaEncode)?;

        Ok(Bytes::from(buf))
    }
}

/// Parse CBOR metadata into a map
pub fn parse_meta(meta_raw: &[u8]) -> Result<BTreeMap<String, ciborium::Value>, CodecError> {
    let value: ciborium::Value =
        ciborium::from_reader(meta_raw).map_err(|_| CodecError::MetaDecode)?;

    if let ciborium::Value::Map(map) = value {
        let mut result = BTreeMap::new();
        for (key, value) in map {
            if let ciborium::Value::Text(key_str) = key {
                result.insert(key_str, value);
            }
        }
        Ok(result)
    } else {
        Err(CodecError::MetaDecode)
    }
}

/// Get string value from metadata
pub fn get_meta_str(meta: &BTreeMap<String, ciborium::Value>, key: &str) -> Option<String> {
    meta.get(key).and_then(|v| {
        if let ciborium::Value::Text(s) = v {
            Some(s.clone())
        } else {
            None
        }
    })
}

/// Binary codec: envelope header, CBOR metadata, raw payload
#[derive(Debug, Clone)]
pub struct BinaryCodec {
    max_frame: usize,
}

impl BinaryCodec {
    /// Create a codec with the default frame limit
    pub fn new() -> Self {
        Self::with_max_frame(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a codec with a custom frame limit
    pub fn with_max_frame(max_frame: usize) -> Self {
        Self { max_frame }
    }
}

impl Default for BinaryCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec for BinaryCodec {
    fn name(&self) -> &'static str {
        "binary"
    }

    fn to_bytes(&self, msg: &TransportMessage) -> Result<Bytes, CodecError> {
        let meta = MetaBuilder::new()
            .insert_str("id", &msg.id)
            .insert_str("from", msg.from.as_str())
            .insert_str("to", msg.to.as_str())
            .insert_str("stream", &msg.stream_id)
            .insert_opt_str("service", msg.service_name.as_deref())
            .insert_opt_str("procedure", msg.procedure_name.as_deref())
            .build()?;

        let frame_len = ENVELOPE_HEADER_SIZE + meta.len() + msg.payload.len();
        if frame_len > self.max_frame {
            return Err(WireError::Size(frame_len).into());
        }

        let header = EnvelopeHeader::new(
            msg.control_flags,
            msg.seq,
            msg.ack,
            meta.len() as u32,
            msg.payload.len() as u32,
        );

        let mut buf = BytesMut::with_capacity(frame_len);
        header.encode(&mut buf);
        buf.extend_from_slice(&meta);
        buf.extend_from_slice(&msg.payload);
        Ok(buf.freeze())
    }

    fn from_bytes(&self, frame: &[u8]) -> Result<TransportMessage, CodecError> {
        if frame.len() > self.max_frame {
            return Err(WireError::Size(frame.len()).into());
        }

        let mut buf = Bytes::copy_from_slice(frame);
        let header = EnvelopeHeader::decode(&mut buf)?;

        let meta_len = header.meta_len as usize;
        let payload_len = header.payload_len as usize;
        if buf.len() < meta_len + payload_len {
            return Err(WireError::Incomplete.into());
        }
        if buf.len() > meta_len + payload_len {
            return Err(WireError::Malformed.into());
        }

        let meta_raw = buf.split_to(meta_len);
        let payload = buf;
        let meta = parse_meta(&meta_raw)?;

        Ok(TransportMessage {
            id: get_meta_str(&meta, "id").ok_or(CodecError::MissingField("id"))?,
            from: PeerId(get_meta_str(&meta, "from").ok_or(CodecError::MissingField("from"))?),
            to: PeerId(get_meta_str(&meta, "to").ok_or(CodecError::MissingField("to"))?),
            service_name: get_meta_str(&meta, "service"),
            procedure_name: get_meta_str(&meta, "procedure"),
            stream_id: get_meta_str(&meta, "stream").ok_or(CodecError::MissingField("stream"))?,
            control_flags: header.flags,
            seq: header.seq,
            ack: header.ack,
            payload,
        })
    }
}

/// JSON codec for debugging
#[derive(Debug, Clone, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn to_bytes(&self, msg: &TransportMessage) -> Result<Bytes, CodecError> {
        Ok(Bytes::from(serde_json::to_vec(msg)?))
    }

    fn from_bytes(&self, frame: &[u8]) -> Result<TransportMessage, CodecError> {
        Ok(serde_json::from_slice(frame)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ControlFlags, OutgoingMessage};

    fn sample() -> TransportMessage {
        OutgoingMessage::new("stream-7", Bytes::from_static(b"hello world"))
            .with_procedure("kv", "put")
            .with_flags(ControlFlags::STREAM_OPEN | ControlFlags::STREAM_CLOSED)
            .into_transport("msg-1".to_string(), "client".into(), "server".into(), 5, 3)
    }

    #[test]
    fn test_meta_builder() {
        let meta = MetaBuilder::new()
            .insert_str("stream", "s-1")
            .insert_opt_str("service", None)
            .build()
            .unwrap();

        let parsed = parse_meta(&meta).unwrap();
        assert_eq!(get_meta_str(&parsed, "stream"), Some("s-1".to_string()));
        assert_eq!(get_meta_str(&parsed, "service"), None);
    }

    #[test]
    fn test_binary_codec_preserves_envelope() {
        let codec = BinaryCodec::new();
        let msg = sample();
        let frame = codec.to_bytes(&msg).unwrap();
        assert_eq!(codec.from_bytes(&frame).unwrap(), msg);
    }

    #[test]
    fn test_binary_codec_rejects_truncated_and_trailing() {
        let codec = BinaryCodec::new();
        let frame = codec.to_bytes(&sample()).unwrap();

        let truncated = &frame[..frame.len() - 1];
        assert!(matches!(
            codec.from_bytes(truncated),
            Err(CodecError::Wire(WireError::Incomplete))
        ));

        let mut trailing = frame.to_vec();
        trailing.push(0);
        assert!(matches!(
            codec.from_bytes(&trailing),
            Err(CodecError::Wire(WireError::Malformed))
        ));
    }

    #[test]
    fn test_binary_codec_frame_limit() {
        let codec = BinaryCodec::with_max_frame(64);
        let mut msg = sample();
        msg.payload = Bytes::from(vec![0u8; 128]);
        assert!(matches!(
            codec.to_bytes(&msg),
            Err(CodecError::Wire(WireError::Size(_)))
        ));
    }

    #[test]
    fn test_garbage_is_a_parse_failure() {
        assert!(BinaryCodec::new().from_bytes(b"not a frame").is_err());
        assert!(JsonCodec.from_bytes(b"{\"id\":").is_err());
    }

    #[test]
    fn test_json_codec_preserves_envelope() {
        let msg = sample();
        let frame = JsonCodec.to_bytes(&msg).unwrap();
        assert_eq!(JsonCodec.from_bytes(&frame).unwrap(), msg);
    }
}
