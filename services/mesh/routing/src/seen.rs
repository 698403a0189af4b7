//! Message identity and the rolling duplicate cache

use mesh_wire::{Flags, Packet, PeerId};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Default time an identity stays in the cache
pub const DEFAULT_SEEN_WINDOW: Duration = Duration::from_secs(120);

/// Default number of identities remembered
pub const DEFAULT_SEEN_CAPACITY: usize = 4096;

/// Identity of one logical message as seen by every hop
///
/// TTL and the STORED flag change along the way and are left out, so a relay
/// and the original sender compute the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId {
    /// Originating peer
    pub source: PeerId,
    /// Truncated digest over type, destination, flags and payload
    pub digest: u64,
}

impl MessageId {
    /// Compute the identity of a packet
    pub fn of(packet: &Packet) -> Self {
        let mut hasher = Sha256::new();
        hasher.update([u8::from(packet.typ)]);
        hasher.update(packet.dest.0.to_be_bytes());
        hasher.update([packet.flags.difference(Flags::STORED).bits()]);
        hasher.update(&packet.payload);
        let hash = hasher.finalize();

        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&hash[..8]);
        Self {
            source: packet.source,
            digest: u64::from_be_bytes(prefix),
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:016x}", self.source, self.digest)
    }
}

#[derive(Debug, Default)]
struct SeenInner {
    entries: HashMap<MessageId, Instant>,
    order: VecDeque<(MessageId, Instant)>,
}

impl SeenInner {
    fn expire(&mut self, now: Instant, window: Duration) -> usize {
        let mut removed = 0;
        while let Some(&(id, at)) = self.order.front() {
            if now.duration_since(at) < window {
                break;
            }
            self.order.pop_front();
            // A newer insertion of the same id keeps its own queue slot
            if self.entries.get(&id) == Some(&at) {
                self.entries.remove(&id);
                removed += 1;
            }
        }
        removed
    }

    fn evict_oldest(&mut self) {
        while let Some((id, at)) = self.order.pop_front() {
            if self.entries.get(&id) == Some(&at) {
                self.entries.remove(&id);
                return;
            }
        }
    }
}

/// Rolling set of recently observed message identities
///
/// Bounded both by a time window and by a capacity; when full the oldest
/// identity is forgotten first.
#[derive(Debug)]
pub struct SeenMessageCache {
    inner: Mutex<SeenInner>,
    window: Duration,
    capacity: usize,
}

impl SeenMessageCache {
    /// Create a cache with the given window and capacity
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(SeenInner::default()),
            window,
            capacity: capacity.max(1),
        }
    }

    /// Record an identity, returning `true` when it was not already present
    pub fn check_and_insert(&self, id: MessageId, now: Instant) -> bool {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.expire(now, self.window);

        if inner.entries.contains_key(&id) {
            return false;
        }
        if inner.entries.len() >= self.capacity {
            inner.evict_oldest();
        }
        inner.entries.insert(id, now);
        inner.order.push_back((id, now));
        true
    }

    /// Whether an identity is currently remembered
    pub fn contains(&self, id: &MessageId, now: Instant) -> bool {
        let inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner
            .entries
            .get(id)
            .is_some_and(|at| now.duration_since(*at) < self.window)
    }

    /// Forget identities older than the window
    pub fn purge_expired(&self, now: Instant) -> usize {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.expire(now, self.window)
    }

    /// Number of identities remembered
    pub fn len(&self) -> usize {
        match self.inner.lock() {
            Ok(guard) => guard.entries.len(),
            Err(poisoned) => poisoned.into_inner().entries.len(),
        }
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SeenMessageCache {
    fn default() -> Self {
        Self::new(DEFAULT_SEEN_WINDOW, DEFAULT_SEEN_CAPACITY)
    }
}
