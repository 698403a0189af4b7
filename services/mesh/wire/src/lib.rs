//! Packet framing, fixed headers, and fragmentation for the mesh.
//!
//! This crate provides the low-level wire protocol used between mesh peers:
//! the 13-byte packet header, packet encoding/decoding, payload layouts shared
//! by every node, and fragmentation/reassembly of messages that exceed the
//! link MTU.
//!
//! ## Features
//!
//! - **Fixed Header**: 13 bytes, big-endian, enough to route without touching the payload
//! - **Zero-Copy I/O**: Uses `Bytes`/`BytesMut` for minimal allocations
//! - **Forward Compatibility**: unknown packet types decode and relay opaquely
//! - **Fragmentation**: ordered fragments with a random id and 30s reassembly timeout
//!
//! ## Wire Format
//!
//! ```text
//! +--------------------+-----------------------------------+
//! | u8  version        | always WIRE_VERSION               |
//! | u8  type           | PacketType code                   |
//! | u8  ttl            | 0..=7, decremented per relay      |
//! | u8  flags          | Flags bitset                      |
//! | u32 source         | sender peer id                    |
//! | u32 dest           | recipient peer id, 0 = broadcast  |
//! | u8  payload_len    | length of bytes that follow       |
//! +--------------------+-----------------------------------+
//! | payload            | 0..=255 bytes                     |
//! +--------------------+-----------------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod fragment;
pub mod header;
pub mod packet;

// Re-export main types
pub use codec::{Announce, PacketBuilder};
pub use error::WireError;
pub use fragment::{
    fragment, fragment_packet, reassemble, Fragment, FragmentKey, Reassembler,
    DEFAULT_FRAGMENT_TIMEOUT, FRAGMENT_HEADER_SIZE, MAX_PENDING_FRAGMENT_BUFFERS,
    MAX_REASSEMBLED_SIZE,
};
pub use header::{
    Flags, PacketHeader, PacketType, PeerId, HEADER_SIZE, MAX_PACKET_SIZE, MAX_PAYLOAD_SIZE,
    MAX_TTL, WIRE_VERSION,
};
pub use packet::Packet;
