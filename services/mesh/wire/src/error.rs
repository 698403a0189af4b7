//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
///
/// Every variant describes a packet or fragment that must be dropped; none of
/// them are fatal to the node.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Fewer bytes than a header or fragment header needs
    #[error("truncated: need {needed} bytes, got {got}")]
    Truncated {
        /// Minimum bytes required
        needed: usize,
        /// Bytes available
        got: usize,
    },

    /// Unsupported protocol version
    #[error("version unsupported: {0}")]
    Version(u8),

    /// TTL outside 0..=MAX_TTL, or decrement of an exhausted TTL
    #[error("invalid ttl {0}")]
    Ttl(u8),

    /// Payload does not fit the one-byte length field or the link MTU
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Reserved packet type code
    #[error("reserved type {0:#04x}")]
    Type(u8),

    /// Declared payload length disagrees with the bytes present
    #[error("payload length mismatch: declared {declared}, actual {actual}")]
    Length {
        /// Value of the payload_len header field
        declared: usize,
        /// Bytes actually following the header
        actual: usize,
    },

    /// Fragment header is inconsistent with its reassembly buffer
    #[error("bad fragment: {0}")]
    Fragment(&'static str),

    /// Payload layout is not what its packet type requires
    #[error("malformed payload")]
    Malformed,
}
