//! Peer and session table
//!
//! One entry per known peer, keyed by id. Handshake state, transport keys and
//! the pending outbox all live inside the entry, so every mutation of a peer's
//! crypto state happens under that entry's lock and nothing else holds a
//! reference to it.

use crate::handshake::HandshakeState;
use crate::transport::TransportSession;
use bytes::Bytes;
use dashmap::DashMap;
use mesh_routing::Reachability;
use mesh_wire::PeerId;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::debug;

/// Default inactivity window after which a non-neighbor peer is forgotten
pub const DEFAULT_PEER_EVICTION: Duration = Duration::from_secs(10 * 60);

/// Handshake progress of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    /// No handshake in flight and no keys
    Idle,
    /// We sent message 1 and wait for message 2
    SentInit,
    /// We answered with message 2 and wait for message 3
    SentResp,
    /// Transport keys available
    Established,
    /// Last handshake attempt failed; may be re-initiated
    Failed,
}

impl SessionState {
    /// Whether a handshake is currently in flight
    pub fn is_handshaking(self) -> bool {
        matches!(self, SessionState::SentInit | SessionState::SentResp)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::SentInit => "sent_init",
            SessionState::SentResp => "sent_resp",
            SessionState::Established => "established",
            SessionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Mutable per-peer state
#[derive(Debug)]
pub struct PeerEntry {
    /// Peer id
    pub id: PeerId,
    /// Static key proven in the last completed handshake
    pub static_key: Option<[u8; 32]>,
    /// Display name from the handshake or the latest announce
    pub nickname: Option<String>,
    /// Last valid packet from this peer
    pub last_seen: Option<Instant>,
    /// Whether the link reports the peer as a direct neighbor
    pub neighbor: bool,
    /// Handshake progress
    pub state: SessionState,
    pub(crate) handshake: Option<HandshakeState>,
    pub(crate) step_started: Option<Instant>,
    pub(crate) session: Option<TransportSession>,
    pub(crate) previous: Option<TransportSession>,
    pub(crate) outbox: VecDeque<Bytes>,
}

impl PeerEntry {
    fn new(id: PeerId) -> Self {
        Self {
            id,
            static_key: None,
            nickname: None,
            last_seen: None,
            neighbor: false,
            state: SessionState::Idle,
            handshake: None,
            step_started: None,
            session: None,
            previous: None,
            outbox: VecDeque::new(),
        }
    }

    /// Whether transport keys are available
    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    /// Drop any in-flight handshake, keeping an existing session
    pub(crate) fn abort_handshake(&mut self) {
        self.handshake = None;
        self.step_started = None;
        self.state = if self.session.is_some() {
            SessionState::Established
        } else {
            SessionState::Idle
        };
    }

    /// Forget all keys and pending traffic
    pub(crate) fn reset(&mut self) {
        self.handshake = None;
        self.step_started = None;
        self.session = None;
        self.previous = None;
        self.outbox.clear();
        self.state = SessionState::Idle;
    }

    fn info(&self) -> PeerInfo {
        PeerInfo {
            id: self.id,
            nickname: self.nickname.clone(),
            static_key: self.static_key,
            last_seen: self.last_seen,
            neighbor: self.neighbor,
            state: self.state,
            pending_outbox: self.outbox.len(),
        }
    }
}

/// Read-only snapshot of a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// Peer id
    pub id: PeerId,
    /// Display name
    pub nickname: Option<String>,
    /// Proven static key
    pub static_key: Option<[u8; 32]>,
    /// Last valid packet
    pub last_seen: Option<Instant>,
    /// Direct neighbor
    pub neighbor: bool,
    /// Handshake progress
    pub state: SessionState,
    /// Private messages waiting for a session
    pub pending_outbox: usize,
}

/// Bounded table of known peers
#[derive(Debug)]
pub struct PeerTable {
    peers: DashMap<PeerId, PeerEntry>,
    max_peers: usize,
}

impl PeerTable {
    /// Create a table holding at most `max_peers` entries
    pub fn new(max_peers: usize) -> Self {
        Self {
            peers: DashMap::new(),
            max_peers: max_peers.max(1),
        }
    }

    /// Run `f` on an existing entry
    pub fn with_entry<R>(&self, peer: PeerId, f: impl FnOnce(&mut PeerEntry) -> R) -> Option<R> {
        self.peers.get_mut(&peer).map(|mut entry| f(&mut entry))
    }

    /// Run `f` on the entry for `peer`, creating it first if needed
    pub fn with_entry_or_insert<R>(&self, peer: PeerId, f: impl FnOnce(&mut PeerEntry) -> R) -> R {
        if !self.peers.contains_key(&peer) && self.peers.len() >= self.max_peers {
            self.evict_one();
        }
        let mut entry = self
            .peers
            .entry(peer)
            .or_insert_with(|| PeerEntry::new(peer));
        f(&mut entry)
    }

    /// Record a valid packet from `peer`
    pub fn touch(&self, peer: PeerId, now: Instant) {
        self.with_entry_or_insert(peer, |entry| entry.last_seen = Some(now));
    }

    /// Mark `peer` as connected or disconnected on the link
    pub fn set_neighbor(&self, peer: PeerId, neighbor: bool, now: Instant) {
        self.with_entry_or_insert(peer, |entry| {
            entry.neighbor = neighbor;
            entry.last_seen = Some(now);
        });
    }

    /// Connected neighbors, sorted by id
    pub fn neighbors(&self) -> Vec<PeerId> {
        let mut neighbors: Vec<_> = self
            .peers
            .iter()
            .filter(|entry| entry.neighbor)
            .map(|entry| entry.id)
            .collect();
        neighbors.sort();
        neighbors
    }

    /// Number of connected neighbors
    pub fn neighbor_count(&self) -> usize {
        self.peers.iter().filter(|entry| entry.neighbor).count()
    }

    /// Snapshot of one peer
    pub fn info(&self, peer: PeerId) -> Option<PeerInfo> {
        self.peers.get(&peer).map(|entry| entry.info())
    }

    /// Snapshot of every peer, sorted by id
    pub fn all(&self) -> Vec<PeerInfo> {
        let mut all: Vec<_> = self.peers.iter().map(|entry| entry.info()).collect();
        all.sort_by_key(|info| info.id);
        all
    }

    /// Peers whose current handshake step started more than `timeout` ago
    pub fn expired_handshakes(&self, now: Instant, timeout: Duration) -> Vec<PeerId> {
        self.peers
            .iter()
            .filter(|entry| {
                entry.state.is_handshaking()
                    && entry
                        .step_started
                        .is_some_and(|at| now.saturating_duration_since(at) >= timeout)
            })
            .map(|entry| entry.id)
            .collect()
    }

    /// Drop superseded sessions older than `grace`
    pub fn retire_previous(&self, now: Instant, grace: Duration) -> usize {
        let mut retired = 0;
        for mut entry in self.peers.iter_mut() {
            let expired = entry.session.as_ref().is_some_and(|s| {
                now.saturating_duration_since(s.established_at()) >= grace
            });
            if expired && entry.previous.take().is_some() {
                retired += 1;
            }
        }
        retired
    }

    /// Forget non-neighbor peers not heard from within `window`
    ///
    /// A peer holding transport keys younger than `session_lifetime` is kept:
    /// the remote side still encrypts with them and would otherwise be unable
    /// to reach us until its own rekey.
    pub fn evict_idle(
        &self,
        now: Instant,
        window: Duration,
        session_lifetime: Duration,
    ) -> Vec<PeerId> {
        let stale: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|entry| {
                !entry.neighbor
                    && !entry.state.is_handshaking()
                    && !entry.session.as_ref().is_some_and(|session| {
                        now.saturating_duration_since(session.established_at()) < session_lifetime
                    })
                    && entry
                        .last_seen
                        .map_or(true, |at| now.saturating_duration_since(at) >= window)
            })
            .map(|entry| entry.id)
            .collect();

        for peer in &stale {
            self.peers.remove(peer);
            debug!("Evicted idle peer {}", peer);
        }
        stale
    }

    /// Remove a peer entirely
    pub fn remove(&self, peer: PeerId) -> bool {
        self.peers.remove(&peer).is_some()
    }

    /// Number of known peers
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether no peer is known
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    // Least recently seen non-neighbor; peers without keys go first
    fn evict_one(&self) {
        let victim = self
            .peers
            .iter()
            .filter(|entry| !entry.neighbor)
            .min_by_key(|entry| (entry.session.is_some(), entry.last_seen))
            .map(|entry| entry.id);

        if let Some(peer) = victim {
            self.peers.remove(&peer);
            debug!("Peer table full, evicted {}", peer);
        }
    }
}

impl Reachability for PeerTable {
    fn is_neighbor(&self, peer: PeerId) -> bool {
        self.peers.get(&peer).is_some_and(|entry| entry.neighbor)
    }

    fn has_session(&self, peer: PeerId) -> bool {
        self.peers.get(&peer).is_some_and(|entry| entry.has_session())
    }

    fn last_seen(&self, peer: PeerId) -> Option<Instant> {
        self.peers.get(&peer).and_then(|entry| entry.last_seen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_neighbors_and_reachability() {
        let table = PeerTable::new(16);
        let now = Instant::now();
        table.set_neighbor(PeerId(3), true, now);
        table.set_neighbor(PeerId(1), true, now);
        table.touch(PeerId(9), now);

        assert_eq!(table.neighbors(), vec![PeerId(1), PeerId(3)]);
        assert_eq!(table.neighbor_count(), 2);
        assert!(table.is_neighbor(PeerId(3)));
        assert!(!table.is_neighbor(PeerId(9)));
        assert_eq!(table.last_seen(PeerId(9)), Some(now));
        assert!(!table.has_session(PeerId(1)));

        table.set_neighbor(PeerId(3), false, now);
        assert_eq!(table.neighbors(), vec![PeerId(1)]);
    }

    #[test]
    fn test_full_table_evicts_least_recent_non_neighbor() {
        let table = PeerTable::new(3);
        let base = Instant::now();
        table.set_neighbor(PeerId(1), true, base);
        table.touch(PeerId(2), base + Duration::from_secs(1));
        table.touch(PeerId(3), base + Duration::from_secs(2));

        table.touch(PeerId(4), base + Duration::from_secs(3));
        assert_eq!(table.len(), 3);
        assert!(table.info(PeerId(2)).is_none());
        assert!(table.info(PeerId(1)).is_some());
        assert!(table.info(PeerId(4)).is_some());
    }

    #[test]
    fn test_evict_idle_spares_neighbors() {
        let table = PeerTable::new(16);
        let base = Instant::now();
        table.set_neighbor(PeerId(1), true, base);
        table.touch(PeerId(2), base);
        table.touch(PeerId(3), base + Duration::from_secs(50));

        let evicted = table.evict_idle(
            base + Duration::from_secs(60),
            Duration::from_secs(30),
            Duration::from_secs(3600),
        );
        assert_eq!(evicted, vec![PeerId(2)]);
        assert!(table.info(PeerId(1)).is_some());
        assert!(table.info(PeerId(3)).is_some());
    }

    #[test]
    fn test_expired_handshakes() {
        let table = PeerTable::new(16);
        let base = Instant::now();
        table.with_entry_or_insert(PeerId(5), |entry| {
            entry.state = SessionState::SentInit;
            entry.step_started = Some(base);
        });
        table.with_entry_or_insert(PeerId(6), |entry| {
            entry.state = SessionState::Failed;
            entry.step_started = Some(base);
        });

        let timeout = Duration::from_secs(30);
        assert!(table
            .expired_handshakes(base + Duration::from_secs(29), timeout)
            .is_empty());
        assert_eq!(
            table.expired_handshakes(base + Duration::from_secs(30), timeout),
            vec![PeerId(5)]
        );
    }

    #[test]
    fn test_abort_and_reset() {
        let table = PeerTable::new(4);
        table.with_entry_or_insert(PeerId(2), |entry| {
            entry.state = SessionState::SentResp;
            entry.outbox.push_back(Bytes::from_static(b"queued"));
            entry.abort_handshake();
            assert_eq!(entry.state, SessionState::Idle);
            assert_eq!(entry.outbox.len(), 1);
            entry.reset();
        });
        let info = table.info(PeerId(2)).unwrap();
        assert_eq!(info.pending_outbox, 0);
        assert_eq!(info.state, SessionState::Idle);
        assert_eq!(SessionState::SentResp.to_string(), "sent_resp");
    }
}
