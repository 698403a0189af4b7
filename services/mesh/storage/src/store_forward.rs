//! Store-and-forward cache for peers that are not currently reachable

use mesh_wire::{Packet, PeerId};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::debug;

/// Store-and-forward limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreForwardConfig {
    /// Entries held across all peers
    pub max_total: usize,
    /// Entries held for any one peer
    pub max_per_peer: usize,
    /// How long an entry stays deliverable
    pub expiry: Duration,
}

impl Default for StoreForwardConfig {
    fn default() -> Self {
        Self {
            max_total: 1000,
            max_per_peer: 100,
            expiry: Duration::from_secs(12 * 60 * 60),
        }
    }
}

/// A packet parked for a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedMessage {
    /// Peer the packet is addressed to
    pub target: PeerId,
    /// The packet as it would have been sent
    pub packet: Packet,
    /// When the packet was parked
    pub enqueued_at: Instant,
    /// After this instant the packet is dropped undelivered
    pub expiry: Instant,
    seq: u64,
}

impl CachedMessage {
    /// Whether the entry is past its expiry
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expiry
    }
}

/// Bounded per-peer FIFO queues with oldest-first eviction
#[derive(Debug, Default)]
pub struct StoreForwardCache {
    config: StoreForwardConfig,
    queues: HashMap<PeerId, VecDeque<CachedMessage>>,
    total: usize,
    next_seq: u64,
}

impl StoreForwardCache {
    /// Create an empty cache
    pub fn new(config: StoreForwardConfig) -> Self {
        Self {
            config: StoreForwardConfig {
                max_total: config.max_total.max(1),
                max_per_peer: config.max_per_peer.max(1),
                expiry: config.expiry,
            },
            queues: HashMap::new(),
            total: 0,
            next_seq: 0,
        }
    }

    /// Park a packet for `target`
    ///
    /// Returns the entries evicted to make room, oldest first. A non-empty
    /// result means those messages will never be delivered from here.
    pub fn enqueue(&mut self, target: PeerId, packet: Packet, now: Instant) -> Vec<CachedMessage> {
        let mut evicted = Vec::new();

        let peer_len = self.queues.get(&target).map_or(0, VecDeque::len);
        if peer_len >= self.config.max_per_peer {
            if let Some(oldest) = self.pop_front(target) {
                evicted.push(oldest);
            }
        }
        while self.total >= self.config.max_total {
            match self.evict_oldest() {
                Some(oldest) => evicted.push(oldest),
                None => break,
            }
        }

        let entry = CachedMessage {
            target,
            packet,
            enqueued_at: now,
            expiry: now + self.config.expiry,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.queues.entry(target).or_default().push_back(entry);
        self.total += 1;

        if !evicted.is_empty() {
            debug!(
                "Store-and-forward overflow: evicted {} entries while queueing for {}",
                evicted.len(),
                target
            );
        }
        evicted
    }

    /// Take every unexpired entry for a reconnected peer, in enqueue order
    ///
    /// Expired entries are discarded. Entries the caller fails to send should
    /// go back through [`StoreForwardCache::requeue_front`].
    pub fn on_peer_reconnected(&mut self, peer: PeerId, now: Instant) -> Vec<CachedMessage> {
        let Some(queue) = self.queues.remove(&peer) else {
            return Vec::new();
        };
        self.total -= queue.len();

        let before = queue.len();
        let ready: Vec<_> = queue.into_iter().filter(|m| !m.is_expired(now)).collect();
        if ready.len() < before {
            debug!(
                "Dropped {} expired store-and-forward entries for {}",
                before - ready.len(),
                peer
            );
        }
        ready
    }

    /// Put undelivered entries back at the head of their peer's queue
    pub fn requeue_front(&mut self, peer: PeerId, entries: Vec<CachedMessage>) {
        let queue = self.queues.entry(peer).or_default();
        for entry in entries.into_iter().rev() {
            queue.push_front(entry);
            self.total += 1;
        }
    }

    /// Drop expired entries everywhere
    pub fn purge_expired(&mut self, now: Instant) -> usize {
        let mut removed = 0;
        for queue in self.queues.values_mut() {
            let before = queue.len();
            queue.retain(|m| !m.is_expired(now));
            removed += before - queue.len();
        }
        self.queues.retain(|_, q| !q.is_empty());
        self.total -= removed;
        removed
    }

    /// Entries parked for one peer
    pub fn pending_for(&self, peer: PeerId) -> usize {
        self.queues.get(&peer).map_or(0, VecDeque::len)
    }

    /// Entries parked in total
    pub fn len(&self) -> usize {
        self.total
    }

    /// Whether nothing is parked
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    fn pop_front(&mut self, peer: PeerId) -> Option<CachedMessage> {
        let queue = self.queues.get_mut(&peer)?;
        let entry = queue.pop_front();
        if queue.is_empty() {
            self.queues.remove(&peer);
        }
        if entry.is_some() {
            self.total -= 1;
        }
        entry
    }

    fn evict_oldest(&mut self) -> Option<CachedMessage> {
        let peer = self
            .queues
            .iter()
            .filter_map(|(peer, q)| q.front().map(|m| (m.seq, *peer)))
            .min()
            .map(|(_, peer)| peer)?;
        self.pop_front(peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use mesh_wire::PacketType;

    fn msg(dest: u32, body: &'static [u8]) -> Packet {
        Packet::new(
            PacketType::Message,
            PeerId(1),
            PeerId(dest),
            Bytes::from_static(body),
        )
    }

    fn cache(max_total: usize, max_per_peer: usize) -> StoreForwardCache {
        StoreForwardCache::new(StoreForwardConfig {
            max_total,
            max_per_peer,
            expiry: Duration::from_secs(60),
        })
    }

    #[test]
    fn test_flush_in_enqueue_order_exactly_once() {
        let mut sf = cache(10, 10);
        let now = Instant::now();
        sf.enqueue(PeerId(2), msg(2, b"one"), now);
        sf.enqueue(PeerId(3), msg(3, b"other"), now);
        sf.enqueue(PeerId(2), msg(2, b"two"), now);

        let flushed = sf.on_peer_reconnected(PeerId(2), now);
        let bodies: Vec<_> = flushed.iter().map(|m| m.packet.payload.clone()).collect();
        assert_eq!(bodies, vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]);

        assert!(sf.on_peer_reconnected(PeerId(2), now).is_empty());
        assert_eq!(sf.len(), 1);
        assert_eq!(sf.pending_for(PeerId(3)), 1);
    }

    #[test]
    fn test_expired_entries_not_delivered() {
        let mut sf = cache(10, 10);
        let start = Instant::now();
        sf.enqueue(PeerId(2), msg(2, b"old"), start);
        sf.enqueue(PeerId(2), msg(2, b"new"), start + Duration::from_secs(30));

        let flushed = sf.on_peer_reconnected(PeerId(2), start + Duration::from_secs(61));
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].packet.payload, Bytes::from_static(b"new"));
        assert!(sf.is_empty());
    }

    #[test]
    fn test_per_peer_bound_evicts_oldest() {
        let mut sf = cache(10, 2);
        let now = Instant::now();
        assert!(sf.enqueue(PeerId(2), msg(2, b"a"), now).is_empty());
        assert!(sf.enqueue(PeerId(2), msg(2, b"b"), now).is_empty());

        let evicted = sf.enqueue(PeerId(2), msg(2, b"c"), now);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].packet.payload, Bytes::from_static(b"a"));
        assert_eq!(sf.pending_for(PeerId(2)), 2);
    }

    #[test]
    fn test_total_bound_evicts_globally_oldest() {
        let mut sf = cache(2, 10);
        let now = Instant::now();
        sf.enqueue(PeerId(2), msg(2, b"first"), now);
        sf.enqueue(PeerId(3), msg(3, b"second"), now);

        let evicted = sf.enqueue(PeerId(3), msg(3, b"third"), now);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].target, PeerId(2));
        assert_eq!(sf.len(), 2);
        assert_eq!(sf.pending_for(PeerId(2)), 0);
    }

    #[test]
    fn test_requeue_front_preserves_order() {
        let mut sf = cache(10, 10);
        let now = Instant::now();
        sf.enqueue(PeerId(2), msg(2, b"a"), now);
        sf.enqueue(PeerId(2), msg(2, b"b"), now);

        let mut flushed = sf.on_peer_reconnected(PeerId(2), now);
        // First one delivered, the rest failed
        let unsent = flushed.split_off(1);
        sf.enqueue(PeerId(2), msg(2, b"c"), now);
        sf.requeue_front(PeerId(2), unsent);

        let again = sf.on_peer_reconnected(PeerId(2), now);
        let bodies: Vec<_> = again.iter().map(|m| m.packet.payload.clone()).collect();
        assert_eq!(bodies, vec![Bytes::from_static(b"b"), Bytes::from_static(b"c")]);
    }

    #[test]
    fn test_purge_expired() {
        let mut sf = cache(10, 10);
        let start = Instant::now();
        sf.enqueue(PeerId(2), msg(2, b"a"), start);
        sf.enqueue(PeerId(3), msg(3, b"b"), start + Duration::from_secs(50));

        assert_eq!(sf.purge_expired(start + Duration::from_secs(60)), 1);
        assert_eq!(sf.len(), 1);
        assert_eq!(sf.pending_for(PeerId(2)), 0);
    }
}
