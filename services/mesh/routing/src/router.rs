//! Flood router and routing decision logic

use crate::seen::{MessageId, SeenMessageCache};
use dashmap::DashMap;
use mesh_wire::{Packet, PeerId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Default window in which a recently heard peer counts as reachable
pub const DEFAULT_REACHABILITY_WINDOW: Duration = Duration::from_secs(60);

/// How a packet leaves this node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardMode {
    /// Send to every connected neighbor except `exclude`
    Flood {
        /// Neighbor the packet arrived from, if any
        exclude: Option<PeerId>,
    },
    /// Send to one directly connected neighbor
    Direct(PeerId),
}

/// Routing decision result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingDecision {
    /// Deliver locally, do not relay
    Deliver,
    /// Relay without local delivery
    Forward(ForwardMode),
    /// Deliver locally and relay (broadcasts)
    DeliverAndForward(ForwardMode),
    /// Destination unreachable, park the packet for this peer
    Store(PeerId),
    /// Drop the packet
    Drop(DropReason),
}

/// Reason for dropping a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DropReason {
    /// Header or payload failed to decode
    Malformed,
    /// Identity already in the seen cache
    Duplicate,
    /// Our own packet echoed back
    OwnPacket,
    /// Source id is the broadcast address
    InvalidSource,
    /// Hop budget exhausted before reaching the destination
    RouteExhausted,
    /// AEAD open failed, replay, or no session to decrypt with
    AuthenticationFailure,
    /// Channel message for a channel we have not joined
    UnknownChannel,
    /// Handshake message rejected by the state machine
    HandshakeRejected,
    /// Locally addressed type this node does not handle
    Unhandled,
}

impl DropReason {
    /// Stable label used as a statistics key
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::Malformed => "malformed",
            DropReason::Duplicate => "duplicate",
            DropReason::OwnPacket => "own_packet",
            DropReason::InvalidSource => "invalid_source",
            DropReason::RouteExhausted => "route_exhausted",
            DropReason::AuthenticationFailure => "authentication_failure",
            DropReason::UnknownChannel => "unknown_channel",
            DropReason::HandshakeRejected => "handshake_rejected",
            DropReason::Unhandled => "unhandled",
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::Malformed => write!(f, "malformed packet"),
            DropReason::Duplicate => write!(f, "duplicate message"),
            DropReason::OwnPacket => write!(f, "own packet echoed back"),
            DropReason::InvalidSource => write!(f, "invalid source"),
            DropReason::RouteExhausted => write!(f, "TTL exhausted"),
            DropReason::AuthenticationFailure => write!(f, "authentication failure"),
            DropReason::UnknownChannel => write!(f, "unknown channel"),
            DropReason::HandshakeRejected => write!(f, "handshake rejected"),
            DropReason::Unhandled => write!(f, "unhandled packet type"),
        }
    }
}

/// View of the peer table the router consults for reachability
pub trait Reachability {
    /// Whether the peer is a currently connected neighbor
    fn is_neighbor(&self, peer: PeerId) -> bool;

    /// Whether an Established session exists with the peer
    fn has_session(&self, peer: PeerId) -> bool;

    /// Last time any valid packet from the peer was seen
    fn last_seen(&self, peer: PeerId) -> Option<Instant>;
}

/// Router statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterStats {
    /// Number of routing decisions made
    pub decisions_made: u64,
    /// Packets delivered locally
    pub packets_delivered: u64,
    /// Packets relayed or sent onward
    pub packets_forwarded: u64,
    /// Packets parked for store-and-forward
    pub packets_stored: u64,
    /// Packets dropped
    pub packets_dropped: u64,
    /// Breakdown of drop reasons
    pub drop_reasons: HashMap<String, u64>,
}

/// Live counters behind [`RouterStats`]
#[derive(Debug, Default)]
pub struct StatsRecorder {
    decisions: AtomicU64,
    delivered: AtomicU64,
    forwarded: AtomicU64,
    stored: AtomicU64,
    dropped: AtomicU64,
    drop_reasons: DashMap<DropReason, u64>,
}

impl StatsRecorder {
    /// Account for one decision
    pub fn record(&self, decision: &RoutingDecision) {
        self.decisions.fetch_add(1, Ordering::Relaxed);
        match decision {
            RoutingDecision::Deliver => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
            }
            RoutingDecision::Forward(_) => {
                self.forwarded.fetch_add(1, Ordering::Relaxed);
            }
            RoutingDecision::DeliverAndForward(_) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                self.forwarded.fetch_add(1, Ordering::Relaxed);
            }
            RoutingDecision::Store(_) => {
                self.stored.fetch_add(1, Ordering::Relaxed);
            }
            RoutingDecision::Drop(reason) => self.record_drop(*reason),
        }
    }

    /// Account for a drop decided outside the router (decode, decrypt)
    pub fn record_drop(&self, reason: DropReason) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        *self.drop_reasons.entry(reason).or_insert(0) += 1;
    }

    /// Snapshot the counters
    pub fn snapshot(&self) -> RouterStats {
        RouterStats {
            decisions_made: self.decisions.load(Ordering::Relaxed),
            packets_delivered: self.delivered.load(Ordering::Relaxed),
            packets_forwarded: self.forwarded.load(Ordering::Relaxed),
            packets_stored: self.stored.load(Ordering::Relaxed),
            packets_dropped: self.dropped.load(Ordering::Relaxed),
            drop_reasons: self
                .drop_reasons
                .iter()
                .map(|entry| (entry.key().as_str().to_string(), *entry.value()))
                .collect(),
        }
    }
}

/// TTL-bounded flooding router with duplicate suppression
#[derive(Debug)]
pub struct FloodRouter {
    local: PeerId,
    seen: SeenMessageCache,
    reachability_window: Duration,
    stats: StatsRecorder,
}

impl FloodRouter {
    /// Create a router for the local peer
    pub fn new(local: PeerId, seen: SeenMessageCache, reachability_window: Duration) -> Self {
        Self {
            local,
            seen,
            reachability_window,
            stats: StatsRecorder::default(),
        }
    }

    /// Local peer id
    pub fn local_peer(&self) -> PeerId {
        self.local
    }

    /// Duplicate cache
    pub fn seen(&self) -> &SeenMessageCache {
        &self.seen
    }

    /// Statistics recorder
    pub fn stats(&self) -> &StatsRecorder {
        &self.stats
    }

    /// Whether a packet for `dest` can be sent now rather than stored
    pub fn is_reachable(&self, dest: PeerId, peers: &impl Reachability, now: Instant) -> bool {
        peers.is_neighbor(dest)
            || peers.has_session(dest)
            || peers
                .last_seen(dest)
                .is_some_and(|at| now.duration_since(at) < self.reachability_window)
    }

    /// Decide what to do with a packet received from neighbor `from`
    ///
    /// The packet's identity is recorded, so a second call with the same
    /// message drops it as a duplicate. Relaying consumes one hop; the caller
    /// applies it with [`Packet::relayed`].
    pub fn decide(
        &self,
        packet: &Packet,
        from: PeerId,
        peers: &impl Reachability,
        now: Instant,
    ) -> RoutingDecision {
        let decision = self.decide_inner(packet, from, peers, now);
        self.stats.record(&decision);
        if let RoutingDecision::Drop(reason) = decision {
            debug!(
                "Dropping {:?} from {} via {}: {}",
                packet.typ, packet.source, from, reason
            );
        }
        decision
    }

    fn decide_inner(
        &self,
        packet: &Packet,
        from: PeerId,
        peers: &impl Reachability,
        now: Instant,
    ) -> RoutingDecision {
        if packet.source.is_broadcast() {
            return RoutingDecision::Drop(DropReason::InvalidSource);
        }
        if packet.source == self.local {
            return RoutingDecision::Drop(DropReason::OwnPacket);
        }
        if !self.seen.check_and_insert(MessageId::of(packet), now) {
            return RoutingDecision::Drop(DropReason::Duplicate);
        }

        if packet.dest == self.local {
            return RoutingDecision::Deliver;
        }

        if packet.is_broadcast() {
            if packet.ttl == 0 {
                return RoutingDecision::Deliver;
            }
            return RoutingDecision::DeliverAndForward(ForwardMode::Flood {
                exclude: Some(from),
            });
        }

        if packet.ttl == 0 {
            return RoutingDecision::Drop(DropReason::RouteExhausted);
        }
        if peers.is_neighbor(packet.dest) {
            return RoutingDecision::Forward(ForwardMode::Direct(packet.dest));
        }
        if self.is_reachable(packet.dest, peers, now) {
            return RoutingDecision::Forward(ForwardMode::Flood {
                exclude: Some(from),
            });
        }
        RoutingDecision::Store(packet.dest)
    }

    /// Decide how to send a packet that originates here
    ///
    /// The identity is recorded first so echoes from neighbors are dropped.
    pub fn route_outbound(
        &self,
        packet: &Packet,
        peers: &impl Reachability,
        now: Instant,
    ) -> RoutingDecision {
        self.seen.check_and_insert(MessageId::of(packet), now);

        let decision = if packet.is_broadcast() {
            RoutingDecision::Forward(ForwardMode::Flood { exclude: None })
        } else if peers.is_neighbor(packet.dest) {
            RoutingDecision::Forward(ForwardMode::Direct(packet.dest))
        } else if self.is_reachable(packet.dest, peers, now) {
            RoutingDecision::Forward(ForwardMode::Flood { exclude: None })
        } else {
            RoutingDecision::Store(packet.dest)
        };
        self.stats.record(&decision);
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use mesh_wire::PacketType;
    use std::collections::HashSet;

    const LOCAL: PeerId = PeerId(0x100);

    #[derive(Default)]
    struct Peers {
        neighbors: HashSet<PeerId>,
        sessions: HashSet<PeerId>,
        seen: HashMap<PeerId, Instant>,
    }

    impl Reachability for Peers {
        fn is_neighbor(&self, peer: PeerId) -> bool {
            self.neighbors.contains(&peer)
        }
        fn has_session(&self, peer: PeerId) -> bool {
            self.sessions.contains(&peer)
        }
        fn last_seen(&self, peer: PeerId) -> Option<Instant> {
            self.seen.get(&peer).copied()
        }
    }

    fn router() -> FloodRouter {
        FloodRouter::new(LOCAL, SeenMessageCache::default(), DEFAULT_REACHABILITY_WINDOW)
    }

    fn packet(source: u32, dest: PeerId, ttl: u8) -> Packet {
        let mut p = Packet::new(
            PacketType::Message,
            PeerId(source),
            dest,
            Bytes::from_static(b"sealed"),
        );
        p.ttl = ttl;
        p
    }

    #[test]
    fn test_local_destination_is_delivered_only() {
        let r = router();
        let decision = r.decide(&packet(1, LOCAL, 3), PeerId(1), &Peers::default(), Instant::now());
        assert_eq!(decision, RoutingDecision::Deliver);
    }

    #[test]
    fn test_broadcast_delivered_and_flooded_except_sender() {
        let r = router();
        let decision = r.decide(
            &packet(7, PeerId::BROADCAST, 4),
            PeerId(2),
            &Peers::default(),
            Instant::now(),
        );
        assert_eq!(
            decision,
            RoutingDecision::DeliverAndForward(ForwardMode::Flood {
                exclude: Some(PeerId(2))
            })
        );
    }

    #[test]
    fn test_duplicate_is_handled_once() {
        let r = router();
        let now = Instant::now();
        let p = packet(7, PeerId::BROADCAST, 4);

        assert!(matches!(
            r.decide(&p, PeerId(2), &Peers::default(), now),
            RoutingDecision::DeliverAndForward(_)
        ));
        // Same message relayed by another neighbor with one hop fewer
        let relayed = p.relayed().unwrap();
        assert_eq!(
            r.decide(&relayed, PeerId(3), &Peers::default(), now),
            RoutingDecision::Drop(DropReason::Duplicate)
        );

        let stats = r.stats().snapshot();
        assert_eq!(stats.packets_delivered, 1);
        assert_eq!(stats.packets_dropped, 1);
        assert_eq!(stats.drop_reasons.get("duplicate"), Some(&1));
    }

    #[test]
    fn test_ttl_zero_never_forwarded() {
        let r = router();
        let mut peers = Peers::default();
        peers.neighbors.insert(PeerId(9));

        assert_eq!(
            r.decide(&packet(1, PeerId(9), 0), PeerId(1), &peers, Instant::now()),
            RoutingDecision::Drop(DropReason::RouteExhausted)
        );
        // Broadcast at ttl 0 still reaches the application here
        assert_eq!(
            r.decide(&packet(1, PeerId::BROADCAST, 0), PeerId(1), &peers, Instant::now()),
            RoutingDecision::Deliver
        );
    }

    #[test]
    fn test_direct_neighbor_gets_direct_forward() {
        let r = router();
        let mut peers = Peers::default();
        peers.neighbors.insert(PeerId(9));

        assert_eq!(
            r.decide(&packet(1, PeerId(9), 2), PeerId(1), &peers, Instant::now()),
            RoutingDecision::Forward(ForwardMode::Direct(PeerId(9)))
        );
    }

    #[test]
    fn test_recently_seen_destination_is_flooded() {
        let r = router();
        let now = Instant::now() + Duration::from_secs(600);
        let mut peers = Peers::default();
        peers.seen.insert(PeerId(9), now - Duration::from_secs(5));

        assert_eq!(
            r.decide(&packet(1, PeerId(9), 2), PeerId(1), &peers, now),
            RoutingDecision::Forward(ForwardMode::Flood {
                exclude: Some(PeerId(1))
            })
        );
    }

    #[test]
    fn test_unreachable_destination_is_stored() {
        let r = router();
        let now = Instant::now() + Duration::from_secs(600);
        let mut peers = Peers::default();
        peers.seen.insert(PeerId(9), now - Duration::from_secs(300));

        assert_eq!(
            r.decide(&packet(1, PeerId(9), 2), PeerId(1), &peers, now),
            RoutingDecision::Store(PeerId(9))
        );
        assert_eq!(r.stats().snapshot().packets_stored, 1);
    }

    #[test]
    fn test_own_and_invalid_sources_dropped() {
        let r = router();
        let now = Instant::now();
        assert_eq!(
            r.decide(&packet(LOCAL.0, PeerId::BROADCAST, 3), PeerId(1), &Peers::default(), now),
            RoutingDecision::Drop(DropReason::OwnPacket)
        );
        assert_eq!(
            r.decide(&packet(0, PeerId::BROADCAST, 3), PeerId(1), &Peers::default(), now),
            RoutingDecision::Drop(DropReason::InvalidSource)
        );
    }

    #[test]
    fn test_outbound_records_identity() {
        let r = router();
        let now = Instant::now();
        let p = packet(LOCAL.0, PeerId::BROADCAST, 7);
        assert_eq!(
            r.route_outbound(&p, &Peers::default(), now),
            RoutingDecision::Forward(ForwardMode::Flood { exclude: None })
        );
        assert!(r.seen().contains(&MessageId::of(&p), now));

        let mut peers = Peers::default();
        peers.sessions.insert(PeerId(4));
        assert_eq!(
            r.route_outbound(&packet(LOCAL.0, PeerId(4), 7), &peers, now),
            RoutingDecision::Forward(ForwardMode::Flood { exclude: None })
        );
        assert_eq!(
            r.route_outbound(&packet(LOCAL.0, PeerId(5), 7), &peers, now),
            RoutingDecision::Store(PeerId(5))
        );
    }

    #[test]
    fn test_drop_reason_display() {
        assert_eq!(DropReason::RouteExhausted.to_string(), "TTL exhausted");
        assert_eq!(DropReason::Duplicate.to_string(), "duplicate message");
        assert_eq!(DropReason::AuthenticationFailure.as_str(), "authentication_failure");
    }
}
