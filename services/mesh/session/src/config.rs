//! Engine tunables

use crate::channel::ChannelKdfParams;
use crate::peer::DEFAULT_PEER_EVICTION;
use mesh_routing::{DEFAULT_REACHABILITY_WINDOW, DEFAULT_SEEN_CAPACITY, DEFAULT_SEEN_WINDOW};
use mesh_storage::StoreForwardConfig;
use mesh_wire::{DEFAULT_FRAGMENT_TIMEOUT, MAX_PENDING_FRAGMENT_BUFFERS, MAX_TTL};
use std::time::Duration;

/// Default handshake step timeout
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Mesh engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Hop budget stamped on packets this node originates
    pub ttl: u8,
    /// Inactivity after which a partial reassembly is discarded
    pub fragment_timeout: Duration,
    /// Bound on concurrently pending reassemblies
    pub max_fragment_buffers: usize,
    /// Time allowed for each handshake step
    pub handshake_timeout: Duration,
    /// How long message identities are remembered
    pub seen_window: Duration,
    /// Bound on remembered message identities
    pub seen_capacity: usize,
    /// Store-and-forward limits
    pub store_forward: StoreForwardConfig,
    /// Inactivity after which a non-neighbor peer is forgotten
    pub peer_eviction: Duration,
    /// A peer heard from within this window counts as reachable
    pub reachability_window: Duration,
    /// Maximum direct neighbors; further connections are rejected
    pub max_neighbors: usize,
    /// Maximum known peers
    pub max_peers: usize,
    /// Largest frame the link carries
    pub mtu: usize,
    /// Rotate a session after this many sent messages
    pub rekey_after_messages: u64,
    /// Rotate a session after this much time
    pub rekey_after: Duration,
    /// Handshake failures tolerated per peer inside `handshake_retry_window`
    pub handshake_retry_limit: u32,
    /// Window for counting handshake failures
    pub handshake_retry_window: Duration,
    /// Argon2id cost for channel keys
    pub channel_kdf: ChannelKdfParams,
    /// Private messages held per peer while a handshake runs
    pub outbox_capacity: usize,
    /// Largest application payload accepted for sending
    pub max_message_size: usize,
    /// Maintenance interval used by [`crate::MeshEngine::run`]
    pub tick_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ttl: MAX_TTL,
            fragment_timeout: DEFAULT_FRAGMENT_TIMEOUT,
            max_fragment_buffers: MAX_PENDING_FRAGMENT_BUFFERS,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            seen_window: DEFAULT_SEEN_WINDOW,
            seen_capacity: DEFAULT_SEEN_CAPACITY,
            store_forward: StoreForwardConfig::default(),
            peer_eviction: DEFAULT_PEER_EVICTION,
            reachability_window: DEFAULT_REACHABILITY_WINDOW,
            max_neighbors: 8,
            max_peers: 256,
            mtu: 512,
            rekey_after_messages: 10_000,
            rekey_after: Duration::from_secs(60 * 60),
            handshake_retry_limit: 3,
            handshake_retry_window: Duration::from_secs(5 * 60),
            channel_kdf: ChannelKdfParams::default(),
            outbox_capacity: 32,
            max_message_size: 16 * 1024,
            tick_interval: Duration::from_secs(1),
        }
    }
}
