//! Packet construction and the shared payload layouts.
//!
//! This module provides a builder for outbound packets and encode/decode
//! helpers for payload formats every node must understand without holding
//! any key material.

use crate::header::{Flags, PacketType, PeerId, MAX_TTL, WIRE_VERSION};
use crate::packet::Packet;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Packet builder for constructing outbound packets
#[derive(Debug, Clone)]
pub struct PacketBuilder {
    typ: PacketType,
    source: PeerId,
    dest: PeerId,
    ttl: u8,
    flags: Flags,
    payload: Bytes,
}

impl PacketBuilder {
    /// Create a new builder for a broadcast packet with the maximum TTL
    pub fn new(typ: PacketType, source: PeerId) -> Self {
        Self {
            typ,
            source,
            dest: PeerId::BROADCAST,
            ttl: MAX_TTL,
            flags: Flags::empty(),
            payload: Bytes::new(),
        }
    }

    /// Address the packet to one peer
    pub fn dest(mut self, dest: PeerId) -> Self {
        self.dest = dest;
        self
    }

    /// Set the hop budget (clamped to [`MAX_TTL`])
    pub fn ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl.min(MAX_TTL);
        self
    }

    /// Add flags
    pub fn flags(mut self, flags: Flags) -> Self {
        self.flags |= flags;
        self
    }

    /// Set payload
    pub fn payload(mut self, payload: Bytes) -> Self {
        self.payload = payload;
        self
    }

    /// Build the packet
    pub fn build(self) -> Packet {
        Packet {
            version: WIRE_VERSION,
            typ: self.typ,
            ttl: self.ttl,
            flags: self.flags,
            source: self.source,
            dest: self.dest,
            payload: self.payload,
        }
    }
}

/// Announce payload: presence plus display name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announce {
    /// Per-sender announce counter, keeps repeated announces distinct
    pub sequence: u32,
    /// Display name, UTF-8
    pub nickname: String,
}

impl Announce {
    /// Encode as `sequence:u32 | nickname`
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.nickname.len());
        buf.put_u32(self.sequence);
        buf.put_slice(self.nickname.as_bytes());
        buf.freeze()
    }

    /// Decode an announce payload
    pub fn decode(payload: &[u8]) -> Result<Self, crate::WireError> {
        if payload.len() < 4 {
            return Err(crate::WireError::Truncated {
                needed: 4,
                got: payload.len(),
            });
        }
        let mut buf = payload;
        let sequence = buf.get_u32();
        let nickname = std::str::from_utf8(buf)
            .map_err(|_| crate::WireError::Malformed)?
            .to_string();
        Ok(Self { sequence, nickname })
    }
}
