//! Message fragmentation for payloads larger than one packet.
//!
//! This module splits oversized payloads into ordered fragments sharing a
//! random id, and reassembles them on the receiving side. Reassembly buffers
//! are independent per `(source, fragment_id)` and expire after a period of
//! inactivity whether or not they completed.

use crate::header::{Flags, PacketType, PeerId, HEADER_SIZE, MAX_PACKET_SIZE, WIRE_VERSION};
use crate::packet::Packet;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// Fragment header size: `fragment_id:u32 | index:u16 | total:u16`
pub const FRAGMENT_HEADER_SIZE: usize = 8;

/// Reassembly buffers idle this long are discarded
pub const DEFAULT_FRAGMENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on concurrently open reassembly buffers
pub const MAX_PENDING_FRAGMENT_BUFFERS: usize = 128;

/// Default upper bound on the bytes one reassembly buffer may hold
pub const MAX_REASSEMBLED_SIZE: usize = 64 * 1024;

/// One piece of a fragmented message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// Random id shared by every fragment of one message
    pub fragment_id: u32,
    /// 0-based position
    pub index: u16,
    /// Number of fragments in the message
    pub total: u16,
    /// Slice of the original payload
    pub data: Bytes,
}

impl Fragment {
    /// Packet type this fragment travels as
    pub fn packet_type(&self) -> PacketType {
        if self.index == 0 {
            PacketType::FragmentStart
        } else if self.index + 1 == self.total {
            PacketType::FragmentEnd
        } else {
            PacketType::FragmentContinue
        }
    }

    /// Encode fragment header and data as a packet payload
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAGMENT_HEADER_SIZE + self.data.len());
        buf.put_u32(self.fragment_id);
        buf.put_u16(self.index);
        buf.put_u16(self.total);
        buf.put_slice(&self.data);
        buf.freeze()
    }

    /// Decode a fragment from a packet payload
    pub fn decode(payload: &[u8]) -> Result<Self, crate::WireError> {
        if payload.len() < FRAGMENT_HEADER_SIZE {
            return Err(crate::WireError::Truncated {
                needed: FRAGMENT_HEADER_SIZE,
                got: payload.len(),
            });
        }
        let mut buf = payload;
        let fragment_id = buf.get_u32();
        let index = buf.get_u16();
        let total = buf.get_u16();

        if total == 0 {
            return Err(crate::WireError::Fragment("zero total"));
        }
        if index >= total {
            return Err(crate::WireError::Fragment("index beyond total"));
        }

        Ok(Self {
            fragment_id,
            index,
            total,
            data: Bytes::copy_from_slice(buf),
        })
    }
}

/// Split a payload into fragments of at most `max_fragment_size` data bytes
///
/// An empty payload yields a single empty fragment so that reassembly still
/// produces a message.
pub fn fragment(payload: &[u8], max_fragment_size: usize) -> Result<Vec<Fragment>, crate::WireError> {
    if max_fragment_size == 0 {
        return Err(crate::WireError::Size(0));
    }

    let total = payload.len().div_ceil(max_fragment_size).max(1);
    if total > u16::MAX as usize {
        return Err(crate::WireError::Size(payload.len()));
    }

    let fragment_id = rand::random::<u32>();
    let payload = Bytes::copy_from_slice(payload);
    let mut fragments = Vec::with_capacity(total);

    for index in 0..total {
        let start = index * max_fragment_size;
        let end = std::cmp::min(start + max_fragment_size, payload.len());
        fragments.push(Fragment {
            fragment_id,
            index: index as u16,
            total: total as u16,
            data: payload.slice(start..end),
        });
    }

    debug!(
        "Fragmented {} bytes into {} pieces (id {:08x})",
        payload.len(),
        total,
        fragment_id
    );
    Ok(fragments)
}

/// Reassemble a complete set of fragments, in any order
pub fn reassemble(fragments: &[Fragment]) -> Result<Bytes, crate::WireError> {
    let first = fragments
        .first()
        .ok_or(crate::WireError::Fragment("no fragments"))?;

    let mut ordered = BTreeMap::new();
    for f in fragments {
        if f.fragment_id != first.fragment_id {
            return Err(crate::WireError::Fragment("mixed fragment ids"));
        }
        if f.total != first.total {
            return Err(crate::WireError::Fragment("total mismatch"));
        }
        ordered.entry(f.index).or_insert_with(|| f.data.clone());
    }

    if ordered.len() != first.total as usize {
        return Err(crate::WireError::Fragment("missing fragments"));
    }
    Ok(concat(ordered.values()))
}

/// Split a logical packet into fragment packets that fit the link MTU
///
/// The reassembled stream is `type | flags | payload`; each fragment packet
/// inherits source, destination and TTL from the original.
pub fn fragment_packet(packet: &Packet, mtu: usize) -> Result<Vec<Packet>, crate::WireError> {
    let budget = mtu.min(MAX_PACKET_SIZE);
    if budget <= HEADER_SIZE + FRAGMENT_HEADER_SIZE {
        return Err(crate::WireError::Size(mtu));
    }
    let max_data = budget - HEADER_SIZE - FRAGMENT_HEADER_SIZE;

    let mut stream = BytesMut::with_capacity(2 + packet.payload.len());
    stream.put_u8(packet.typ.into());
    stream.put_u8(packet.flags.bits());
    stream.put_slice(&packet.payload);

    Ok(fragment(&stream, max_data)?
        .into_iter()
        .map(|f| Packet {
            version: WIRE_VERSION,
            typ: f.packet_type(),
            ttl: packet.ttl,
            flags: Flags::empty(),
            source: packet.source,
            dest: packet.dest,
            payload: f.encode(),
        })
        .collect())
}

fn concat<'a>(parts: impl Iterator<Item = &'a Bytes>) -> Bytes {
    let mut out = BytesMut::new();
    for part in parts {
        out.extend_from_slice(part);
    }
    out.freeze()
}

/// Reassembly buffer key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentKey {
    /// Peer that fragmented the message
    pub source: PeerId,
    /// Random fragment id
    pub fragment_id: u32,
}

#[derive(Debug)]
struct FragmentBuffer {
    total: u16,
    received: BTreeMap<u16, Bytes>,
    held: usize,
    last_activity: Instant,
}

impl FragmentBuffer {
    fn new(total: u16, now: Instant) -> Self {
        Self {
            total,
            received: BTreeMap::new(),
            held: 0,
            last_activity: now,
        }
    }
}

/// Reassembler for collecting fragments into complete messages
///
/// Memory is bounded twice: by the number of open buffers and by the bytes a
/// single buffer may hold. A fragment that would push its buffer past the
/// byte limit discards the whole buffer.
#[derive(Debug)]
pub struct Reassembler {
    buffers: DashMap<FragmentKey, FragmentBuffer>,
    timeout: Duration,
    max_buffers: usize,
    max_message_bytes: usize,
}

impl Reassembler {
    /// Create a new reassembler with the given inactivity timeout
    pub fn new(timeout: Duration) -> Self {
        Self::with_limits(timeout, MAX_PENDING_FRAGMENT_BUFFERS, MAX_REASSEMBLED_SIZE)
    }

    /// Create a reassembler with explicit buffer and per-message byte bounds
    pub fn with_limits(timeout: Duration, max_buffers: usize, max_message_bytes: usize) -> Self {
        Self {
            buffers: DashMap::new(),
            timeout,
            max_buffers: max_buffers.max(1),
            max_message_bytes: max_message_bytes.max(1),
        }
    }

    /// Add a fragment and return the complete payload once every index arrived
    pub fn ingest(
        &self,
        source: PeerId,
        fragment: Fragment,
        now: Instant,
    ) -> Result<Option<Bytes>, crate::WireError> {
        let key = FragmentKey {
            source,
            fragment_id: fragment.fragment_id,
        };

        // Every piece but a lone one carries data, so `total` bounds the size
        if fragment.total as usize > self.max_message_bytes {
            return Err(crate::WireError::Size(fragment.total as usize));
        }
        if fragment.data.is_empty() && fragment.total > 1 {
            return Err(crate::WireError::Fragment("empty fragment"));
        }

        if !self.buffers.contains_key(&key) && self.buffers.len() >= self.max_buffers {
            self.sweep(now);
            if self.buffers.len() >= self.max_buffers {
                self.evict_oldest();
            }
        }

        let (held, complete) = {
            let mut buffer = self
                .buffers
                .entry(key)
                .or_insert_with(|| FragmentBuffer::new(fragment.total, now));

            if now.duration_since(buffer.last_activity) >= self.timeout {
                debug!("Fragment buffer {:08x} from {} expired, restarting", key.fragment_id, source);
                *buffer = FragmentBuffer::new(fragment.total, now);
            }
            if buffer.total != fragment.total {
                return Err(crate::WireError::Fragment("total mismatch"));
            }

            if !buffer.received.contains_key(&fragment.index) {
                buffer.held += fragment.data.len();
                buffer.received.insert(fragment.index, fragment.data);
            }
            buffer.last_activity = now;
            (buffer.held, buffer.received.len() == buffer.total as usize)
        };

        if held > self.max_message_bytes {
            self.buffers.remove(&key);
            debug!(
                "Fragment buffer {:08x} from {} exceeded {} bytes, discarded",
                key.fragment_id, source, self.max_message_bytes
            );
            return Err(crate::WireError::Size(held));
        }
        if !complete {
            return Ok(None);
        }

        match self.buffers.remove(&key) {
            Some((_, buffer)) => {
                debug!(
                    "Reassembled {} fragments (id {:08x}) from {}",
                    buffer.total, key.fragment_id, source
                );
                Ok(Some(concat(buffer.received.values())))
            }
            None => Ok(None),
        }
    }

    /// Ingest a fragment packet, returning the reassembled logical packet
    pub fn ingest_packet(
        &self,
        packet: &Packet,
        now: Instant,
    ) -> Result<Option<Packet>, crate::WireError> {
        if !packet.typ.is_fragment() {
            return Err(crate::WireError::Malformed);
        }
        let fragment = Fragment::decode(&packet.payload)?;
        if fragment.packet_type() != packet.typ {
            return Err(crate::WireError::Fragment("type disagrees with index"));
        }

        let Some(stream) = self.ingest(packet.source, fragment, now)? else {
            return Ok(None);
        };
        if stream.len() < 2 {
            return Err(crate::WireError::Malformed);
        }

        let typ = PacketType::from(stream[0]);
        if typ.is_fragment() || u8::from(typ) == 0 {
            return Err(crate::WireError::Malformed);
        }

        Ok(Some(Packet {
            version: packet.version,
            typ,
            ttl: packet.ttl,
            flags: Flags::from_bits_retain(stream[1]),
            source: packet.source,
            dest: packet.dest,
            payload: stream.slice(2..),
        }))
    }

    /// Drop every buffer idle longer than the timeout
    pub fn sweep(&self, now: Instant) -> usize {
        let before = self.buffers.len();
        self.buffers.retain(|key, buffer| {
            let keep = now.duration_since(buffer.last_activity) < self.timeout;
            if !keep {
                debug!(
                    "Fragment timeout: dropping {}/{} pieces of {:08x} from {}",
                    buffer.received.len(),
                    buffer.total,
                    key.fragment_id,
                    key.source
                );
            }
            keep
        });
        before - self.buffers.len()
    }

    /// Number of incomplete messages
    pub fn pending(&self) -> usize {
        self.buffers.len()
    }

    fn evict_oldest(&self) {
        let oldest = self
            .buffers
            .iter()
            .min_by_key(|entry| entry.value().last_activity)
            .map(|entry| *entry.key());
        if let Some(key) = oldest {
            debug!("Reassembly buffers full, evicting {:08x}", key.fragment_id);
            self.buffers.remove(&key);
        }
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(DEFAULT_FRAGMENT_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WireError;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn test_1500_bytes_over_500_byte_fragments() {
        let message = payload(1500);
        let fragments = fragment(&message, 500).unwrap();

        assert_eq!(fragments.len(), 3);
        assert_eq!(fragments[0].packet_type(), PacketType::FragmentStart);
        assert_eq!(fragments[1].packet_type(), PacketType::FragmentContinue);
        assert_eq!(fragments[2].packet_type(), PacketType::FragmentEnd);
        assert!(fragments.iter().all(|f| f.fragment_id == fragments[0].fragment_id));
        assert!(fragments.iter().all(|f| f.total == 3));

        assert_eq!(reassemble(&fragments).unwrap(), Bytes::from(message));
    }

    #[test]
    fn test_reassemble_identity_for_many_sizes() {
        for len in [0usize, 1, 7, 99, 100, 101, 1024] {
            for size in [1usize, 3, 100, 4096] {
                let message = payload(len);
                let mut fragments = fragment(&message, size).unwrap();
                fragments.reverse();
                assert_eq!(reassemble(&fragments).unwrap(), Bytes::from(message));
            }
        }
    }

    #[test]
    fn test_fragment_rejects_zero_size() {
        assert_eq!(fragment(b"abc", 0), Err(WireError::Size(0)));
    }

    #[test]
    fn test_reassemble_detects_gaps() {
        let mut fragments = fragment(&payload(300), 100).unwrap();
        fragments.remove(1);
        assert_eq!(
            reassemble(&fragments),
            Err(WireError::Fragment("missing fragments"))
        );
    }

    #[test]
    fn test_fragment_header_roundtrip_and_validation() {
        let f = Fragment {
            fragment_id: 0xDEADBEEF,
            index: 2,
            total: 5,
            data: Bytes::from_static(b"chunk"),
        };
        let encoded = f.encode();
        assert_eq!(&encoded[..8], &[0xDE, 0xAD, 0xBE, 0xEF, 0, 2, 0, 5]);
        assert_eq!(Fragment::decode(&encoded).unwrap(), f);

        assert!(Fragment::decode(&[0, 0, 0, 1, 0, 5, 0, 5]).is_err());
        assert!(Fragment::decode(&[0, 0, 0, 1, 0, 0, 0, 0]).is_err());
        assert!(Fragment::decode(&[0, 0, 0]).is_err());
    }

    #[test]
    fn test_reassembler_out_of_order_and_duplicates() {
        let reassembler = Reassembler::default();
        let now = Instant::now();
        let message = payload(1000);
        let fragments = fragment(&message, 300).unwrap();
        let source = PeerId(5);

        assert_eq!(reassembler.ingest(source, fragments[3].clone(), now).unwrap(), None);
        assert_eq!(reassembler.ingest(source, fragments[1].clone(), now).unwrap(), None);
        assert_eq!(reassembler.ingest(source, fragments[1].clone(), now).unwrap(), None);
        assert_eq!(reassembler.ingest(source, fragments[0].clone(), now).unwrap(), None);
        assert_eq!(reassembler.pending(), 1);

        let done = reassembler.ingest(source, fragments[2].clone(), now).unwrap();
        assert_eq!(done, Some(Bytes::from(message)));
        assert_eq!(reassembler.pending(), 0);
    }

    #[test]
    fn test_reassembler_keeps_sources_apart() {
        let reassembler = Reassembler::default();
        let now = Instant::now();
        let fragments = fragment(&payload(20), 10).unwrap();

        assert_eq!(reassembler.ingest(PeerId(1), fragments[0].clone(), now).unwrap(), None);
        assert_eq!(reassembler.ingest(PeerId(2), fragments[1].clone(), now).unwrap(), None);
        assert_eq!(reassembler.pending(), 2);
    }

    #[test]
    fn test_reassembler_rejects_total_mismatch() {
        let reassembler = Reassembler::default();
        let now = Instant::now();
        let mut fragments = fragment(&payload(30), 10).unwrap();
        reassembler.ingest(PeerId(1), fragments[0].clone(), now).unwrap();

        fragments[1].total = 4;
        fragments[1].index = 3;
        assert_eq!(
            reassembler.ingest(PeerId(1), fragments[1].clone(), now),
            Err(WireError::Fragment("total mismatch"))
        );
    }

    #[test]
    fn test_fragment_timeout_discards_partial_buffer() {
        let reassembler = Reassembler::new(Duration::from_secs(30));
        let start = Instant::now();
        let fragments = fragment(&payload(30), 10).unwrap();

        reassembler.ingest(PeerId(1), fragments[0].clone(), start).unwrap();
        reassembler.ingest(PeerId(1), fragments[1].clone(), start).unwrap();

        assert_eq!(reassembler.sweep(start + Duration::from_secs(29)), 0);
        assert_eq!(reassembler.sweep(start + Duration::from_secs(31)), 1);
        assert_eq!(reassembler.pending(), 0);

        // The final piece alone no longer completes anything
        let late = reassembler
            .ingest(PeerId(1), fragments[2].clone(), start + Duration::from_secs(32))
            .unwrap();
        assert_eq!(late, None);
    }

    #[test]
    fn test_stale_buffer_restarts_on_ingest() {
        let reassembler = Reassembler::new(Duration::from_secs(30));
        let start = Instant::now();
        let fragments = fragment(&payload(20), 10).unwrap();

        reassembler.ingest(PeerId(1), fragments[0].clone(), start).unwrap();
        let late = reassembler
            .ingest(PeerId(1), fragments[1].clone(), start + Duration::from_secs(45))
            .unwrap();
        assert_eq!(late, None);
        assert_eq!(reassembler.pending(), 1);
    }

    #[test]
    fn test_buffer_bound_evicts_oldest() {
        let reassembler = Reassembler::with_limits(Duration::from_secs(30), 2, 1024);
        let start = Instant::now();
        for (i, source) in [PeerId(1), PeerId(2), PeerId(3)].into_iter().enumerate() {
            let fragments = fragment(&payload(20), 10).unwrap();
            reassembler
                .ingest(source, fragments[0].clone(), start + Duration::from_secs(i as u64))
                .unwrap();
        }
        assert_eq!(reassembler.pending(), 2);
    }

    #[test]
    fn test_buffer_byte_limit() {
        let reassembler = Reassembler::with_limits(Duration::from_secs(30), 8, 1000);
        let now = Instant::now();
        let piece = |index: u16, total: u16| Fragment {
            fragment_id: 7,
            index,
            total,
            data: Bytes::from(payload(247)),
        };

        // A declared total no message within the limit could need
        assert_eq!(
            reassembler.ingest(PeerId(1), piece(0, u16::MAX), now),
            Err(WireError::Size(u16::MAX as usize))
        );
        assert_eq!(reassembler.pending(), 0);

        // Plausible total, but the pieces add up past the limit
        for index in 0..4 {
            assert_eq!(reassembler.ingest(PeerId(1), piece(index, 600), now).unwrap(), None);
        }
        assert_eq!(
            reassembler.ingest(PeerId(1), piece(4, 600), now),
            Err(WireError::Size(5 * 247))
        );
        assert_eq!(reassembler.pending(), 0);

        let empty = Fragment {
            data: Bytes::new(),
            ..piece(1, 3)
        };
        assert_eq!(
            reassembler.ingest(PeerId(2), empty, now),
            Err(WireError::Fragment("empty fragment"))
        );

        // Messages inside the limit still complete
        let message = payload(990);
        let mut result = None;
        for f in fragment(&message, 247).unwrap() {
            result = reassembler.ingest(PeerId(3), f, now).unwrap().or(result);
        }
        assert_eq!(result, Some(Bytes::from(message)));
    }

    #[test]
    fn test_packet_fragmentation_roundtrip() {
        let original = Packet {
            version: WIRE_VERSION,
            typ: PacketType::Message,
            ttl: 6,
            flags: Flags::ENCRYPTED,
            source: PeerId(0x10),
            dest: PeerId(0x20),
            payload: Bytes::from(payload(700)),
        };

        let pieces = fragment_packet(&original, 128).unwrap();
        assert!(pieces.len() > 1);
        for piece in &pieces {
            assert!(piece.fits(128));
            assert!(piece.typ.is_fragment());
            assert_eq!(piece.ttl, 6);
        }

        let reassembler = Reassembler::default();
        let now = Instant::now();
        let mut result = None;
        for piece in pieces.iter().rev() {
            let decoded = Packet::decode(&piece.encode().unwrap()).unwrap();
            result = reassembler.ingest_packet(&decoded, now).unwrap().or(result);
        }
        assert_eq!(result, Some(original));
    }

    #[test]
    fn test_fragment_packet_rejects_tiny_mtu() {
        let p = Packet::new(PacketType::Broadcast, PeerId(1), PeerId::BROADCAST, Bytes::new());
        assert!(fragment_packet(&p, HEADER_SIZE + FRAGMENT_HEADER_SIZE).is_err());
    }

    #[test]
    fn test_ingest_packet_checks_type_position() {
        let pieces = fragment_packet(
            &Packet::new(
                PacketType::Broadcast,
                PeerId(1),
                PeerId::BROADCAST,
                Bytes::from(payload(400)),
            ),
            64,
        )
        .unwrap();
        let mut wrong = pieces[1].clone();
        wrong.typ = PacketType::FragmentStart;

        let reassembler = Reassembler::default();
        assert_eq!(
            reassembler.ingest_packet(&wrong, Instant::now()),
            Err(WireError::Fragment("type disagrees with index"))
        );
    }
}
