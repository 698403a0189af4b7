//! Fixed header processing for the wire protocol.
//!
//! This module defines the 13-byte header that lets relays route a packet
//! without parsing its payload.

use bitflags::bitflags;
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

/// Wire protocol version
pub const WIRE_VERSION: u8 = 1;

/// Header size in bytes
pub const HEADER_SIZE: usize = 13;

/// Largest hop budget a packet may carry
pub const MAX_TTL: u8 = 7;

/// Largest payload the one-byte length field can describe
pub const MAX_PAYLOAD_SIZE: usize = u8::MAX as usize;

/// Largest encoded packet
pub const MAX_PACKET_SIZE: usize = HEADER_SIZE + MAX_PAYLOAD_SIZE;

/// Mesh peer identifier (4 bytes on the wire, 0 reserved for broadcast)
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub u32);

impl PeerId {
    /// Destination id addressing every peer
    pub const BROADCAST: PeerId = PeerId(0);

    /// Whether this id is the broadcast address
    pub fn is_broadcast(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Parses the hex form printed by `Display`, with or without `0x`
impl FromStr for PeerId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix("0x").unwrap_or(s);
        u32::from_str_radix(digits, 16).map(PeerId)
    }
}

/// Packet types carried in the header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketType {
    /// Presence announcement with nickname
    Announce,
    /// Graceful departure
    Leave,
    /// Encrypted private message
    Message,
    /// First fragment of a larger message
    FragmentStart,
    /// Middle fragment
    FragmentContinue,
    /// Final fragment
    FragmentEnd,
    /// Password-encrypted channel message
    ChannelMessage,
    /// Public plaintext message
    Broadcast,
    /// Handshake message 1 (initiator ephemeral)
    HandshakeInit,
    /// Handshake message 2 (responder ephemeral + static proof)
    HandshakeResponse,
    /// Handshake message 3 (initiator static proof)
    HandshakeFinal,
    /// Well-formed type this node does not understand
    Unknown(u8),
}

impl PacketType {
    /// Whether this type is one of the three fragment types
    pub fn is_fragment(self) -> bool {
        matches!(
            self,
            PacketType::FragmentStart | PacketType::FragmentContinue | PacketType::FragmentEnd
        )
    }

    /// Whether this type belongs to the handshake
    pub fn is_handshake(self) -> bool {
        matches!(
            self,
            PacketType::HandshakeInit | PacketType::HandshakeResponse | PacketType::HandshakeFinal
        )
    }
}

impl From<u8> for PacketType {
    fn from(value: u8) -> Self {
        match value {
            0x01 => PacketType::Announce,
            0x03 => PacketType::Leave,
            0x04 => PacketType::Message,
            0x05 => PacketType::FragmentStart,
            0x06 => PacketType::FragmentContinue,
            0x07 => PacketType::FragmentEnd,
            0x08 => PacketType::ChannelMessage,
            0x09 => PacketType::Broadcast,
            0x10 => PacketType::HandshakeInit,
            0x11 => PacketType::HandshakeResponse,
            0x12 => PacketType::HandshakeFinal,
            other => PacketType::Unknown(other),
        }
    }
}

impl From<PacketType> for u8 {
    fn from(value: PacketType) -> Self {
        match value {
            PacketType::Announce => 0x01,
            PacketType::Leave => 0x03,
            PacketType::Message => 0x04,
            PacketType::FragmentStart => 0x05,
            PacketType::FragmentContinue => 0x06,
            PacketType::FragmentEnd => 0x07,
            PacketType::ChannelMessage => 0x08,
            PacketType::Broadcast => 0x09,
            PacketType::HandshakeInit => 0x10,
            PacketType::HandshakeResponse => 0x11,
            PacketType::HandshakeFinal => 0x12,
            PacketType::Unknown(code) => code,
        }
    }
}

bitflags! {
    /// Packet flags bitmask
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Flags: u8 {
        /// Payload is sealed with a pairwise session key
        const ENCRYPTED = 1 << 0;
        /// Payload is sealed with a channel key
        const CHANNEL = 1 << 1;
        /// Packet was released from a store-and-forward queue
        const STORED = 1 << 2;
    }
}

/// Decoded packet header (13 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Protocol version (must be 1)
    pub version: u8,
    /// Packet type
    pub typ: PacketType,
    /// Remaining hop budget
    pub ttl: u8,
    /// Packet flags, undefined bits retained
    pub flags: Flags,
    /// Source peer
    pub source: PeerId,
    /// Destination peer (broadcast when zero)
    pub dest: PeerId,
    /// Length of the payload that follows
    pub payload_len: u8,
}

impl PacketHeader {
    /// Encode the header to bytes (big-endian)
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.version);
        buf.put_u8(self.typ.into());
        buf.put_u8(self.ttl);
        buf.put_u8(self.flags.bits());
        buf.put_u32(self.source.0);
        buf.put_u32(self.dest.0);
        buf.put_u8(self.payload_len);
    }

    /// Decode the header from bytes (big-endian)
    pub fn decode(buf: &mut impl Buf) -> Result<Self, crate::WireError> {
        if buf.remaining() < HEADER_SIZE {
            return Err(crate::WireError::Truncated {
                needed: HEADER_SIZE,
                got: buf.remaining(),
            });
        }

        let version = buf.get_u8();
        if version != WIRE_VERSION {
            return Err(crate::WireError::Version(version));
        }

        let code = buf.get_u8();
        if code == 0 {
            return Err(crate::WireError::Type(code));
        }
        let typ = PacketType::from(code);

        let ttl = buf.get_u8();
        if ttl > MAX_TTL {
            return Err(crate::WireError::Ttl(ttl));
        }

        let flags = Flags::from_bits_retain(buf.get_u8());
        let source = PeerId(buf.get_u32());
        let dest = PeerId(buf.get_u32());
        let payload_len = buf.get_u8();

        Ok(Self {
            version,
            typ,
            ttl,
            flags,
            source,
            dest,
            payload_len,
        })
    }

    /// Decrement TTL for forwarding
    ///
    /// Fails only when the budget is already exhausted; a header may leave
    /// this node with TTL zero and is then delivered but never relayed again.
    pub fn decrement_ttl(&mut self) -> Result<(), crate::WireError> {
        if self.ttl == 0 {
            return Err(crate::WireError::Ttl(0));
        }
        self.ttl -= 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WireError;

    #[test]
    fn test_peer_id_text_form() {
        let id = PeerId(0xbeef);
        assert_eq!(id.to_string(), "0000beef");
        assert_eq!("0000beef".parse::<PeerId>().unwrap(), id);
        assert_eq!("0xBEEF".parse::<PeerId>().unwrap(), id);
        assert!("zz".parse::<PeerId>().is_err());
    }

    fn sample() -> PacketHeader {
        PacketHeader {
            version: WIRE_VERSION,
            typ: PacketType::Message,
            ttl: 5,
            flags: Flags::ENCRYPTED,
            source: PeerId(0x0A0B0C0D),
            dest: PeerId(0x01020304),
            payload_len: 42,
        }
    }

    #[test]
    fn test_packet_type_conversion() {
        assert_eq!(PacketType::from(0x04), PacketType::Message);
        assert_eq!(PacketType::from(0x12), PacketType::HandshakeFinal);
        assert_eq!(PacketType::from(0x7F), PacketType::Unknown(0x7F));
        assert_eq!(u8::from(PacketType::Unknown(0x7F)), 0x7F);
        assert_eq!(u8::from(PacketType::FragmentEnd), 0x07);
        assert!(PacketType::FragmentContinue.is_fragment());
        assert!(PacketType::HandshakeInit.is_handshake());
        assert!(!PacketType::Broadcast.is_handshake());
    }

    #[test]
    fn test_header_layout_is_big_endian() {
        let mut buf = BytesMut::new();
        sample().encode(&mut buf);

        assert_eq!(buf.len(), HEADER_SIZE);
        assert_eq!(
            &buf[..],
            &[1, 0x04, 5, 0x01, 0x0A, 0x0B, 0x0C, 0x0D, 0x01, 0x02, 0x03, 0x04, 42]
        );
    }

    #[test]
    fn test_header_encode_decode() {
        let header = sample();
        let mut buf = BytesMut::new();
        header.encode(&mut buf);

        let mut bytes = buf.freeze();
        let decoded = PacketHeader::decode(&mut bytes).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn test_unknown_flag_bits_survive() {
        let mut header = sample();
        header.flags = Flags::from_bits_retain(0b1000_0001);

        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        let decoded = PacketHeader::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded.flags.bits(), 0b1000_0001);
        assert!(decoded.flags.contains(Flags::ENCRYPTED));
    }

    #[test]
    fn test_header_rejections() {
        let mut buf = BytesMut::new();
        sample().encode(&mut buf);

        let mut bad_version = buf.clone();
        bad_version[0] = 2;
        assert_eq!(
            PacketHeader::decode(&mut bad_version.freeze()),
            Err(WireError::Version(2))
        );

        let mut bad_ttl = buf.clone();
        bad_ttl[2] = MAX_TTL + 1;
        assert_eq!(
            PacketHeader::decode(&mut bad_ttl.freeze()),
            Err(WireError::Ttl(MAX_TTL + 1))
        );

        let mut reserved_type = buf.clone();
        reserved_type[1] = 0;
        assert_eq!(
            PacketHeader::decode(&mut reserved_type.freeze()),
            Err(WireError::Type(0))
        );

        let mut short = buf.clone().freeze().slice(..HEADER_SIZE - 1);
        assert!(matches!(
            PacketHeader::decode(&mut short),
            Err(WireError::Truncated { needed: HEADER_SIZE, .. })
        ));
    }

    #[test]
    fn test_ttl_decrement() {
        let mut header = sample();
        header.ttl = 1;

        assert!(header.decrement_ttl().is_ok());
        assert_eq!(header.ttl, 0);
        assert_eq!(header.decrement_ttl(), Err(WireError::Ttl(0)));
    }

    #[test]
    fn test_broadcast_id() {
        assert!(PeerId::BROADCAST.is_broadcast());
        assert!(!PeerId(7).is_broadcast());
        assert_eq!(PeerId(0xABCD).to_string(), "0000abcd");
    }
}
