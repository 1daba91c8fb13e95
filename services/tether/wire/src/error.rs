//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Incomplete frame (fewer bytes than the header announces)
    #[error("incomplete frame")]
    Incomplete,

    /// Unsupported envelope version
    #[error("version unsupported: {0}")]
    Version(u8),

    /// Size limit exceeded
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Header checksum mismatch
    #[error("hdr checksum mismatch")]
    HdrCsum,

    /// Reserved bits nonzero
    #[error("reserved bits nonzero")]
    Reserved,

    /// Unknown control flag bits
    #[error("unknown control flags {0:#04x}")]
    Flags(u8),

    /// Trailing bytes after the announced sections
    #[error("malformed frame")]
    Malformed,
}
