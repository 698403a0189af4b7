//! Complete packets: header plus payload.

use crate::header::{
    Flags, PacketHeader, PacketType, PeerId, HEADER_SIZE, MAX_PAYLOAD_SIZE, MAX_TTL, WIRE_VERSION,
};
use bytes::{BufMut, Bytes, BytesMut};

/// A decoded mesh packet
///
/// Payloads larger than [`MAX_PAYLOAD_SIZE`] may exist in memory (before
/// fragmentation or after reassembly) but cannot be encoded directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Protocol version
    pub version: u8,
    /// Packet type
    pub typ: PacketType,
    /// Remaining hop budget
    pub ttl: u8,
    /// Packet flags
    pub flags: Flags,
    /// Originating peer
    pub source: PeerId,
    /// Destination peer, broadcast when zero
    pub dest: PeerId,
    /// Payload bytes
    pub payload: Bytes,
}

impl Packet {
    /// Create a packet with the maximum TTL and no flags
    pub fn new(typ: PacketType, source: PeerId, dest: PeerId, payload: Bytes) -> Self {
        Self {
            version: WIRE_VERSION,
            typ,
            ttl: MAX_TTL,
            flags: Flags::empty(),
            source,
            dest,
            payload,
        }
    }

    /// Whether the packet is addressed to every peer
    pub fn is_broadcast(&self) -> bool {
        self.dest.is_broadcast()
    }

    /// Size of the packet once encoded
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Whether the packet can be sent unfragmented over a link with this MTU
    pub fn fits(&self, mtu: usize) -> bool {
        self.payload.len() <= MAX_PAYLOAD_SIZE && self.encoded_len() <= mtu
    }

    /// Header describing this packet
    pub fn header(&self) -> Result<PacketHeader, crate::WireError> {
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(crate::WireError::Size(self.payload.len()));
        }
        Ok(PacketHeader {
            version: self.version,
            typ: self.typ,
            ttl: self.ttl,
            flags: self.flags,
            source: self.source,
            dest: self.dest,
            payload_len: self.payload.len() as u8,
        })
    }

    /// Encode the packet to a contiguous buffer
    pub fn encode(&self) -> Result<Bytes, crate::WireError> {
        if self.ttl > MAX_TTL {
            return Err(crate::WireError::Ttl(self.ttl));
        }
        let header = self.header()?;

        let mut buf = BytesMut::with_capacity(self.encoded_len());
        header.encode(&mut buf);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Decode one packet occupying the whole buffer
    ///
    /// Trailing or missing payload bytes are a length mismatch; the link
    /// delivers exactly one packet per frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, crate::WireError> {
        let mut buf = bytes;
        let header = PacketHeader::decode(&mut buf)?;

        let declared = header.payload_len as usize;
        if buf.len() != declared {
            return Err(crate::WireError::Length {
                declared,
                actual: buf.len(),
            });
        }

        Ok(Self {
            version: header.version,
            typ: header.typ,
            ttl: header.ttl,
            flags: header.flags,
            source: header.source,
            dest: header.dest,
            payload: Bytes::copy_from_slice(buf),
        })
    }

    /// Copy of this packet with one hop consumed
    pub fn relayed(&self) -> Result<Self, crate::WireError> {
        if self.ttl == 0 {
            return Err(crate::WireError::Ttl(0));
        }
        let mut next = self.clone();
        next.ttl -= 1;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WireError;

    fn packet(typ: PacketType, payload: &'static [u8]) -> Packet {
        Packet::new(typ, PeerId(0x11), PeerId(0x22), Bytes::from_static(payload))
    }

    #[test]
    fn test_packet_roundtrip_across_types() {
        let types = [
            PacketType::Announce,
            PacketType::Message,
            PacketType::ChannelMessage,
            PacketType::HandshakeFinal,
            PacketType::FragmentContinue,
            PacketType::Unknown(0xC3),
        ];
        for (ttl, typ) in types.into_iter().enumerate() {
            let mut p = packet(typ, b"payload bytes");
            p.ttl = ttl as u8;
            p.flags = Flags::ENCRYPTED | Flags::STORED;
            let decoded = Packet::decode(&p.encode().unwrap()).unwrap();
            assert_eq!(decoded, p);
        }
    }

    #[test]
    fn test_empty_and_full_payloads() {
        let empty = packet(PacketType::Leave, b"");
        assert_eq!(empty.encode().unwrap().len(), HEADER_SIZE);
        assert_eq!(Packet::decode(&empty.encode().unwrap()).unwrap(), empty);

        let full = Packet::new(
            PacketType::Broadcast,
            PeerId(1),
            PeerId::BROADCAST,
            Bytes::from(vec![0xAB; MAX_PAYLOAD_SIZE]),
        );
        let encoded = full.encode().unwrap();
        assert_eq!(encoded.len(), HEADER_SIZE + MAX_PAYLOAD_SIZE);
        assert_eq!(Packet::decode(&encoded).unwrap(), full);
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let p = Packet::new(
            PacketType::Broadcast,
            PeerId(1),
            PeerId::BROADCAST,
            Bytes::from(vec![0; MAX_PAYLOAD_SIZE + 1]),
        );
        assert_eq!(p.encode(), Err(WireError::Size(MAX_PAYLOAD_SIZE + 1)));
        assert!(!p.fits(4096));
    }

    #[test]
    fn test_decode_rejects_length_mismatch() {
        let encoded = packet(PacketType::Message, b"abcdef").encode().unwrap();

        let truncated = &encoded[..encoded.len() - 1];
        assert_eq!(
            Packet::decode(truncated),
            Err(WireError::Length {
                declared: 6,
                actual: 5
            })
        );

        let mut padded = encoded.to_vec();
        padded.push(0);
        assert_eq!(
            Packet::decode(&padded),
            Err(WireError::Length {
                declared: 6,
                actual: 7
            })
        );

        assert!(matches!(
            Packet::decode(&encoded[..4]),
            Err(WireError::Truncated { .. })
        ));
    }

    #[test]
    fn test_relayed_consumes_one_hop() {
        let mut p = packet(PacketType::Broadcast, b"x");
        p.ttl = 1;
        let next = p.relayed().unwrap();
        assert_eq!(next.ttl, 0);
        assert_eq!(next.payload, p.payload);
        assert_eq!(next.relayed(), Err(WireError::Ttl(0)));
    }

    #[test]
    fn test_fits_respects_mtu() {
        let p = packet(PacketType::Broadcast, &[0u8; 100]);
        assert!(p.fits(HEADER_SIZE + 100));
        assert!(!p.fits(HEADER_SIZE + 99));
    }
}
