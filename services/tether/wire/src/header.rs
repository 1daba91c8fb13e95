//! Fixed envelope header for the binary codec.
//!
//! The 32-byte header carries everything the session layer needs (flags,
//! seq, ack) so a frame can be classified without touching the metadata or
//! payload sections.

use crate::message::ControlFlags;
use crate::WireError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Envelope format version
pub const WIRE_VERSION: u8 = 1;

/// Envelope header size in bytes
pub const ENVELOPE_HEADER_SIZE: usize = 32;

/// Bytes of the header covered by the checksum
const CHECKSUMMED_LEN: usize = ENVELOPE_HEADER_SIZE - 4;

/// Envelope header (32 bytes, big-endian)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvelopeHeader {
    /// Format version (must be 1)
    pub ver: u8,
    /// Control flags
    pub flags: ControlFlags,
    /// Reserved field (must be zero)
    pub reserved0: u16,
    /// Send sequence
    pub seq: u64,
    /// Cumulative ack
    pub ack: u64,
    /// Length of the CBOR metadata section
    pub meta_len: u32,
    /// Length of the payload section
    pub payload_len: u32,
}

impl EnvelopeHeader {
    /// Create a header for the given sections
    pub fn new(flags: ControlFlags, seq: u64, ack: u64, meta_len: u32, payload_len: u32) -> Self {
        Self {
            ver: WIRE_VERSION,
            flags,
            reserved0: 0,
            seq,
            ack,
            meta_len,
            payload_len,
        }
    }

    /// Total frame length announced by this header
    pub fn frame_len(&self) -> usize {
        ENVELOPE_HEADER_SIZE + self.meta_len as usize + self.payload_len as usize
    }

    fn encode_fields(&self, buf: &mut BytesMut) {
        buf.put_u8(self.ver);
        buf.put_u8(self.flags.bits());
        buf.put_u16(self.reserved0);
        buf.put_u64(self.seq);
        buf.put_u64(self.ack);
        buf.put_u32(self.meta_len);
        buf.put_u32(self.payload_len);
    }

    /// Encode the header including its trailing checksum
    pub fn encode(&self, buf: &mut BytesMut) {
        let start = buf.len();
        self.encode_fields(buf);
        let checksum = crc32fast::hash(&buf[start..start + CHECKSUMMED_LEN]);
        buf.put_u32(checksum);
    }

    /// Decode and validate the header, consuming it from `buf`
    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        if buf.len() < ENVELOPE_HEADER_SIZE {
            return Err(WireError::Incomplete);
        }

        let expected = crc32fast::hash(&buf[..CHECKSUMMED_LEN]);

        let ver = buf.get_u8();
        if ver != WIRE_VERSION {
            return Err(WireError::Version(ver));
        }

        let raw_flags = buf.get_u8();
        let flags = ControlFlags::from_bits(raw_flags).ok_or(WireError::Flags(raw_flags))?;
        let reserved0 = buf.get_u16();
        if reserved0 != 0 {
            return Err(WireError::Reserved);
        }

        let seq = buf.get_u64();
        let ack = buf.get_u64();
        let meta_len = buf.get_u32();
        let payload_len = buf.get_u32();

        if buf.get_u32() != expected {
            return Err(WireError::HdrCsum);
        }

        Ok(Self {
            ver,
            flags,
            reserved0,
            seq,
            ack,
            meta_len,
            payload_len,
        })
    }
}

/// Calculate the CRC32 of an encoded header's checksummed prefix
pub fn crc32_envelope_header(header: &EnvelopeHeader) -> u32 {
    let mut buf = BytesMut::with_capacity(ENVELOPE_HEADER_SIZE);
    header.encode_fields(&mut buf);
    crc32fast::hash(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_decode() {
        let header = EnvelopeHeader::new(ControlFlags::STREAM_OPEN, 42, 17, 12, 99);

        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), ENVELOPE_HEADER_SIZE);

        let mut bytes = buf.freeze();
        let decoded = EnvelopeHeader::decode(&mut bytes).unwrap();
        assert_eq!(header, decoded);
        assert!(bytes.is_empty());
        assert_eq!(decoded.frame_len(), ENVELOPE_HEADER_SIZE + 12 + 99);
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let header = EnvelopeHeader::new(ControlFlags::empty(), 1, 0, 0, 0);
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        buf[9] ^= 0xFF; // flip a bit inside seq

        let mut bytes = buf.freeze();
        assert!(matches!(
            EnvelopeHeader::decode(&mut bytes),
            Err(WireError::HdrCsum)
        ));
    }

    #[test]
    fn test_header_validation() {
        let header = EnvelopeHeader::new(ControlFlags::ACK, 0, 3, 0, 0);
        let mut buf = BytesMut::new();
        header.encode(&mut buf);

        let mut bad_version = buf.clone();
        bad_version[0] = 9;
        assert!(matches!(
            EnvelopeHeader::decode(&mut bad_version.freeze()),
            Err(WireError::Version(9))
        ));

        let mut bad_flags = buf.clone();
        bad_flags[1] = 0x80;
        assert!(matches!(
            EnvelopeHeader::decode(&mut bad_flags.freeze()),
            Err(WireError::Flags(0x80))
        ));

        let mut short = buf.freeze();
        short.truncate(10);
        assert!(matches!(
            EnvelopeHeader::decode(&mut short),
            Err(WireError::Incomplete)
        ));
    }

    #[test]
    fn test_crc_helper_matches_encoding() {
        let header = EnvelopeHeader::new(ControlFlags::HANDSHAKE, 0, 0, 5, 6);
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        let trailer = u32::from_be_bytes([buf[28], buf[29], buf[30], buf[31]]);
        assert_eq!(trailer, crc32_envelope_header(&header));
    }
}
