//! Mesh engine
//!
//! Owns the peer table, router, reassembler, store-and-forward cache and
//! joined channels, and drives them from [`LinkEvent`]s. Everything the
//! application needs to hear about leaves through the [`MeshEvent`] channel
//! returned by [`MeshEngine::new`].
//!
//! Inbound flow for one frame:
//!
//! ```text
//! bytes -> Packet::decode -> FloodRouter::decide -+-> relay (ttl - 1)
//!                                                 +-> store-and-forward
//!                                                 +-> deliver -> reassemble
//!                                                       -> handshake | decrypt | channel | broadcast
//! ```
//!
//! Peer state is only touched through short closures on the peer table so no
//! lock is ever held across an `.await`.

use crate::channel::{
    decrypt_for_channel, encrypt_for_channel, peek_channel_id, Channel, ChannelId, ChannelRecord,
    CHANNEL_OVERHEAD,
};
use crate::config::EngineConfig;
use crate::error::{MeshError, NoiseError};
use crate::failure_tracker::HandshakeRetryTracker;
use crate::handshake::{
    wins_tie_break, HandshakeRole, HandshakeState, HANDSHAKE_MSG1_SIZE, MAX_NICKNAME_LEN,
};
use crate::link::{Link, LinkEvent};
use crate::peer::{PeerEntry, PeerInfo, PeerTable, SessionState};
use crate::transport::{TransportSession, TRANSPORT_OVERHEAD};
use bytes::{BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use mesh_routing::{
    DropReason, FloodRouter, ForwardMode, Reachability, RouterStats, RoutingDecision,
    SeenMessageCache,
};
use mesh_storage::{load_json, PersistenceStore, StoreForwardCache};
use mesh_wire::{
    fragment_packet, Announce, Flags, Packet, PacketBuilder, PacketType, PeerId, Reassembler,
    WireError,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use x25519_dalek::{PublicKey, StaticSecret};

/// Persistence key prefix for identity pins
pub const PEER_RECORD_PREFIX: &str = "peer/";

/// Persistence key prefix for channel memberships
pub const CHANNEL_RECORD_PREFIX: &str = "channel/";

/// This node's identity
#[derive(Clone)]
pub struct LocalIdentity {
    /// Mesh address
    pub peer_id: PeerId,
    /// Long-term X25519 key proven in every handshake
    pub static_secret: StaticSecret,
    /// Display name sent in handshakes and announces
    pub nickname: String,
}

impl LocalIdentity {
    /// Identity with a fresh random static key
    pub fn generate(peer_id: PeerId, nickname: impl Into<String>) -> Self {
        Self {
            peer_id,
            static_secret: StaticSecret::random_from_rng(rand::rngs::OsRng),
            nickname: clamp_nickname(&nickname.into()),
        }
    }

    /// Identity from stored key bytes
    pub fn from_secret_bytes(peer_id: PeerId, secret: [u8; 32], nickname: impl Into<String>) -> Self {
        Self {
            peer_id,
            static_secret: StaticSecret::from(secret),
            nickname: clamp_nickname(&nickname.into()),
        }
    }

    /// Static public key
    pub fn public_key(&self) -> [u8; 32] {
        PublicKey::from(&self.static_secret).to_bytes()
    }
}

impl fmt::Debug for LocalIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalIdentity")
            .field("peer_id", &self.peer_id)
            .field("nickname", &self.nickname)
            .finish_non_exhaustive()
    }
}

/// Where a delivered payload came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryKind {
    /// Decrypted with the pairwise session
    Private,
    /// Decrypted with a channel key
    Channel {
        /// Channel id
        id: ChannelId,
        /// Channel name as joined
        name: String,
        /// Whether the application should keep history
        retention: bool,
    },
    /// Public plaintext
    Broadcast,
}

/// A payload handed to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Originating peer
    pub from: PeerId,
    /// Decrypt path taken
    pub kind: DeliveryKind,
    /// Application bytes
    pub payload: Bytes,
}

/// Events surfaced to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    /// A direct neighbor connected
    PeerConnected(PeerId),
    /// A direct neighbor went away
    PeerDisconnected(PeerId),
    /// Connection refused because the neighbor limit is reached
    ConnectionRejected(PeerId),
    /// A session is Established
    HandshakeCompleted {
        /// Remote peer
        peer: PeerId,
        /// Nickname carried in the handshake
        nickname: String,
    },
    /// A handshake was aborted; queued private messages were discarded
    HandshakeFailed {
        /// Remote peer
        peer: PeerId,
        /// What went wrong
        reason: String,
    },
    /// A peer proved a different static key than the one pinned
    IdentityChanged {
        /// Remote peer
        peer: PeerId,
        /// Pinned key
        previous: [u8; 32],
        /// Key proven now
        current: [u8; 32],
    },
    /// A payload was delivered
    MessageDelivered(Delivery),
    /// A peer announced itself
    PeerAnnounced {
        /// Announcing peer
        peer: PeerId,
        /// Announced nickname
        nickname: String,
    },
    /// A peer announced its departure
    PeerLeft(PeerId),
}

/// Identity pin as persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Last known nickname
    pub nickname: String,
    /// Pinned static key
    pub static_key: [u8; 32],
}

fn peer_record_key(peer: PeerId) -> String {
    format!("{}{}", PEER_RECORD_PREFIX, peer)
}

fn channel_record_key(name: &str) -> String {
    format!("{}{}", CHANNEL_RECORD_PREFIX, name)
}

fn clamp_nickname(raw: &str) -> String {
    if raw.len() <= MAX_NICKNAME_LEN {
        return raw.to_string();
    }
    let mut end = MAX_NICKNAME_LEN;
    while !raw.is_char_boundary(end) {
        end -= 1;
    }
    raw[..end].to_string()
}

fn nickname_from_payload(payload: Option<&[u8]>) -> String {
    clamp_nickname(&String::from_utf8_lossy(payload.unwrap_or_default()))
}

// AAD for private messages: type | source | dest
fn message_aad(source: PeerId, dest: PeerId) -> [u8; 9] {
    let mut aad = [0u8; 9];
    aad[0] = PacketType::Message.into();
    aad[1..5].copy_from_slice(&source.0.to_be_bytes());
    aad[5..].copy_from_slice(&dest.0.to_be_bytes());
    aad
}

fn drop_reason_for(err: &MeshError) -> DropReason {
    match err {
        MeshError::MalformedPacket(_) => DropReason::Malformed,
        MeshError::AuthenticationFailure => DropReason::AuthenticationFailure,
        MeshError::HandshakeFailure { .. } => DropReason::HandshakeRejected,
        MeshError::UnknownChannel(_) => DropReason::UnknownChannel,
        MeshError::RouteExhausted => DropReason::RouteExhausted,
        _ => DropReason::Unhandled,
    }
}

// Largest stream a peer may legitimately fragment: type and flags, then the
// widest envelope around a maximum-size payload
fn reassembly_limit(config: &EngineConfig) -> usize {
    2 + CHANNEL_OVERHEAD.max(TRANSPORT_OVERHEAD) + config.max_message_size
}

// Try the current session, then the one it replaced
fn decrypt_with_sessions(
    entry: &mut PeerEntry,
    payload: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, NoiseError> {
    let current = match entry.session.as_mut() {
        Some(session) => session.decrypt(payload, aad),
        None => Err(NoiseError::HandshakeNotComplete),
    };
    match (current, entry.previous.as_mut()) {
        (Ok(plaintext), _) => Ok(plaintext),
        (Err(_), Some(previous)) => previous.decrypt(payload, aad),
        (Err(err), None) => Err(err),
    }
}

// Writes queued from the routing path, applied in order by `write_behind`
enum PersistOp {
    Put { key: String, value: Vec<u8> },
    Flush(oneshot::Sender<()>),
}

async fn write_behind(
    store: Arc<dyn PersistenceStore>,
    mut ops: mpsc::UnboundedReceiver<PersistOp>,
) {
    while let Some(op) = ops.recv().await {
        match op {
            PersistOp::Put { key, value } => {
                if let Err(e) = store.put(&key, value).await {
                    warn!("Failed to persist {}: {}", key, e);
                }
            }
            PersistOp::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("Persistence writer stopped");
}

struct EngineInner {
    config: EngineConfig,
    identity: LocalIdentity,
    link: Arc<dyn Link>,
    persistence: Option<Arc<dyn PersistenceStore>>,
    writes: Option<mpsc::UnboundedSender<PersistOp>>,
    peers: PeerTable,
    router: FloodRouter,
    reassembler: Reassembler,
    store_forward: Mutex<StoreForwardCache>,
    channels: DashMap<ChannelId, Channel>,
    retries: HandshakeRetryTracker,
    events: mpsc::UnboundedSender<MeshEvent>,
    announce_seq: AtomicU32,
    broadcast_seq: AtomicU32,
    // Random start so a restarted node's leave is not a duplicate
    leave_seq: AtomicU32,
}

/// Handle to a running mesh node; cheap to clone
#[derive(Clone)]
pub struct MeshEngine {
    inner: Arc<EngineInner>,
}

impl fmt::Debug for MeshEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeshEngine")
            .field("local", &self.inner.identity.peer_id)
            .field("peers", &self.inner.peers.len())
            .field("channels", &self.inner.channels.len())
            .finish()
    }
}

impl MeshEngine {
    /// Build an engine around its collaborators
    ///
    /// Returns the engine and the receiver for application events. With
    /// `persistence` set this spawns the background writer, so it must be
    /// called from within a Tokio runtime.
    pub fn new(
        config: EngineConfig,
        identity: LocalIdentity,
        link: Arc<dyn Link>,
        persistence: Option<Arc<dyn PersistenceStore>>,
    ) -> (Self, mpsc::UnboundedReceiver<MeshEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let local = identity.peer_id;

        let writes = persistence.clone().map(|store| {
            let (tx, ops) = mpsc::unbounded_channel();
            tokio::spawn(write_behind(store, ops));
            tx
        });

        let inner = EngineInner {
            peers: PeerTable::new(config.max_peers),
            router: FloodRouter::new(
                local,
                SeenMessageCache::new(config.seen_window, config.seen_capacity),
                config.reachability_window,
            ),
            reassembler: Reassembler::with_limits(
                config.fragment_timeout,
                config.max_fragment_buffers,
                reassembly_limit(&config),
            ),
            store_forward: Mutex::new(StoreForwardCache::new(config.store_forward)),
            channels: DashMap::new(),
            retries: HandshakeRetryTracker::new(
                config.handshake_retry_limit,
                config.handshake_retry_window,
            ),
            events,
            announce_seq: AtomicU32::new(0),
            broadcast_seq: AtomicU32::new(0),
            leave_seq: AtomicU32::new(rand::random()),
            config,
            identity,
            link,
            persistence,
            writes,
        };

        info!("Mesh engine created for {}", local);
        (
            Self {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    /// Local peer id
    pub fn local_peer(&self) -> PeerId {
        self.inner.identity.peer_id
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Routing counters
    pub fn stats(&self) -> RouterStats {
        self.inner.router.stats().snapshot()
    }

    /// Snapshot of one peer
    pub fn peer(&self, peer: PeerId) -> Option<PeerInfo> {
        self.inner.peers.info(peer)
    }

    /// Snapshot of every known peer
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.inner.peers.all()
    }

    /// Packets parked for unreachable peers
    pub fn pending_store_forward(&self) -> usize {
        self.lock_store_forward().len()
    }

    /// Incomplete fragment reassemblies
    pub fn pending_fragments(&self) -> usize {
        self.inner.reassembler.pending()
    }

    /// Joined channels as `(id, name)`
    pub fn channels(&self) -> Vec<(ChannelId, String)> {
        let mut channels: Vec<_> = self
            .inner
            .channels
            .iter()
            .map(|c| (c.id, c.name.clone()))
            .collect();
        channels.sort();
        channels
    }

    // ---- link events -------------------------------------------------

    /// Feed one link event into the engine
    pub async fn handle_link_event(&self, event: LinkEvent) {
        self.handle_link_event_at(event, Instant::now()).await
    }

    /// Feed one link event with an explicit clock
    pub async fn handle_link_event_at(&self, event: LinkEvent, now: Instant) {
        match event {
            LinkEvent::Connected(peer) => self.on_connected(peer, now).await,
            LinkEvent::Disconnected(peer) => self.on_disconnected(peer, now),
            LinkEvent::Frame { from, bytes } => self.on_frame(from, &bytes, now).await,
        }
    }

    async fn on_connected(&self, peer: PeerId, now: Instant) {
        let inner = &self.inner;
        if peer == self.local_peer() || peer.is_broadcast() {
            debug!("Ignoring link connect for reserved id {}", peer);
            return;
        }
        if inner.peers.is_neighbor(peer) {
            return;
        }
        if inner.peers.neighbor_count() >= inner.config.max_neighbors {
            warn!(
                "Rejecting connection from {}: {} neighbors already connected",
                peer, inner.config.max_neighbors
            );
            inner.link.disconnect(peer);
            self.emit(MeshEvent::ConnectionRejected(peer));
            return;
        }

        inner.peers.set_neighbor(peer, true, now);
        info!("Neighbor {} connected", peer);
        self.emit(MeshEvent::PeerConnected(peer));

        if let Err(e) = self.announce_at(now) {
            debug!("Failed to announce to new neighbor {}: {}", peer, e);
        }
        self.peer_became_reachable(peer, now).await;
    }

    fn on_disconnected(&self, peer: PeerId, now: Instant) {
        if !self.inner.peers.is_neighbor(peer) {
            return;
        }
        self.inner.peers.set_neighbor(peer, false, now);
        info!("Neighbor {} disconnected", peer);
        self.emit(MeshEvent::PeerDisconnected(peer));
    }

    async fn on_frame(&self, from: PeerId, bytes: &[u8], now: Instant) {
        let inner = &self.inner;
        let packet = match Packet::decode(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("Malformed frame from {}: {}", from, e);
                inner.router.stats().record_drop(DropReason::Malformed);
                return;
            }
        };

        let decision = inner.router.decide(&packet, from, &inner.peers, now);
        if matches!(decision, RoutingDecision::Drop(_)) {
            return;
        }
        inner.peers.touch(packet.source, now);

        match decision {
            RoutingDecision::Deliver => self.deliver(packet, now).await,
            RoutingDecision::Forward(mode) => self.relay(&packet, mode, now),
            RoutingDecision::DeliverAndForward(mode) => {
                self.relay(&packet, mode, now);
                self.deliver(packet, now).await;
            }
            RoutingDecision::Store(target) => match packet.relayed() {
                Ok(next) => self.park(target, next, now),
                Err(_) => inner.router.stats().record_drop(DropReason::RouteExhausted),
            },
            RoutingDecision::Drop(_) => {}
        }
    }

    async fn peer_became_reachable(&self, peer: PeerId, now: Instant) {
        self.flush_store_forward(peer, now);

        let wants_handshake = self
            .inner
            .peers
            .with_entry(peer, |entry| {
                !entry.outbox.is_empty() && !entry.has_session() && !entry.state.is_handshaking()
            })
            .unwrap_or(false);
        if wants_handshake {
            if let Err(e) = self.start_handshake(peer, now).await {
                debug!("Could not start handshake with {}: {}", peer, e);
            }
        }
    }

    // ---- outbound plumbing -------------------------------------------

    fn build(&self, typ: PacketType, dest: PeerId, flags: Flags, payload: Bytes) -> Packet {
        PacketBuilder::new(typ, self.local_peer())
            .dest(dest)
            .ttl(self.inner.config.ttl)
            .flags(flags)
            .payload(payload)
            .build()
    }

    fn send_frame(&self, to: PeerId, frame: Bytes) -> bool {
        match self.inner.link.send(to, frame) {
            Ok(()) => true,
            Err(e) => {
                debug!("Link send to {} failed: {}", to, e);
                false
            }
        }
    }

    // Returns how many neighbors accepted the frame
    fn transmit(&self, packet: &Packet, mode: ForwardMode) -> usize {
        let frame = match packet.encode() {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Cannot encode {:?} for {}: {}", packet.typ, packet.dest, e);
                return 0;
            }
        };
        match mode {
            ForwardMode::Direct(peer) => usize::from(self.send_frame(peer, frame)),
            ForwardMode::Flood { exclude } => self
                .inner
                .peers
                .neighbors()
                .into_iter()
                .filter(|n| Some(*n) != exclude && *n != packet.source)
                .filter(|n| self.send_frame(*n, frame.clone()))
                .count(),
        }
    }

    fn relay(&self, packet: &Packet, mode: ForwardMode, now: Instant) {
        let next = match packet.relayed() {
            Ok(next) => next,
            Err(_) => {
                self.inner
                    .router
                    .stats()
                    .record_drop(DropReason::RouteExhausted);
                return;
            }
        };
        if self.transmit(&next, mode) == 0 && !next.is_broadcast() {
            self.park(next.dest, next, now);
        }
    }

    /// Originate a packet: fragment if needed, then route each piece
    fn send_packet(&self, packet: Packet, now: Instant) -> Result<(), MeshError> {
        let mtu = self.inner.config.mtu;
        let pieces = if packet.fits(mtu) {
            vec![packet]
        } else {
            fragment_packet(&packet, mtu)?
        };

        for piece in pieces {
            match self.inner.router.route_outbound(&piece, &self.inner.peers, now) {
                RoutingDecision::Forward(mode) => {
                    if self.transmit(&piece, mode) == 0 && !piece.is_broadcast() {
                        self.park(piece.dest, piece, now);
                    }
                }
                RoutingDecision::Store(target) => self.park(target, piece, now),
                other => debug!("Unexpected outbound decision {:?}", other),
            }
        }
        Ok(())
    }

    // ---- store-and-forward -------------------------------------------

    fn lock_store_forward(&self) -> MutexGuard<'_, StoreForwardCache> {
        self.inner
            .store_forward
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn park(&self, target: PeerId, packet: Packet, now: Instant) {
        debug!("Parking {:?} for unreachable {}", packet.typ, target);
        let evicted = self.lock_store_forward().enqueue(target, packet, now);
        if !evicted.is_empty() {
            let err = MeshError::CacheOverflow {
                evicted: evicted.len(),
            };
            debug!("{}", err);
        }
    }

    /// Send everything parked for `peer`, in enqueue order
    fn flush_store_forward(&self, peer: PeerId, now: Instant) -> usize {
        let ready = self.lock_store_forward().on_peer_reconnected(peer, now);
        if ready.is_empty() {
            return 0;
        }

        let mode = if self.inner.peers.is_neighbor(peer) {
            ForwardMode::Direct(peer)
        } else {
            ForwardMode::Flood { exclude: None }
        };

        let mut delivered = 0;
        let mut entries = ready.into_iter();
        while let Some(entry) = entries.next() {
            let mut packet = entry.packet.clone();
            packet.flags |= Flags::STORED;
            if self.transmit(&packet, mode) == 0 {
                let mut unsent = vec![entry];
                unsent.extend(entries.by_ref());
                self.lock_store_forward().requeue_front(peer, unsent);
                break;
            }
            delivered += 1;
        }

        info!("Flushed {} stored packets to {}", delivered, peer);
        delivered
    }

    // ---- delivery ----------------------------------------------------

    async fn deliver(&self, packet: Packet, now: Instant) {
        if !packet.typ.is_fragment() {
            return self.deliver_logical(packet, now).await;
        }
        match self.inner.reassembler.ingest_packet(&packet, now) {
            Ok(Some(logical)) => self.deliver_logical(logical, now).await,
            Ok(None) => {}
            Err(e) => {
                debug!("Dropping fragment from {}: {}", packet.source, e);
                self.inner.router.stats().record_drop(DropReason::Malformed);
            }
        }
    }

    async fn deliver_logical(&self, packet: Packet, now: Instant) {
        let result = match packet.typ {
            PacketType::Announce => self.on_announce(&packet, now).await,
            PacketType::Leave => {
                self.on_leave(packet.source);
                Ok(())
            }
            PacketType::HandshakeInit
            | PacketType::HandshakeResponse
            | PacketType::HandshakeFinal => self.on_handshake(&packet, now).await,
            PacketType::Message => self.on_private_message(&packet),
            PacketType::ChannelMessage => self.on_channel_message(&packet).await,
            PacketType::Broadcast => self.on_broadcast(&packet),
            other => {
                debug!("No handler for {:?} from {}", other, packet.source);
                self.inner.router.stats().record_drop(DropReason::Unhandled);
                Ok(())
            }
        };

        if let Err(e) = result {
            self.inner.router.stats().record_drop(drop_reason_for(&e));
            debug!("Dropped {:?} from {}: {}", packet.typ, packet.source, e);
        }
    }

    async fn on_announce(&self, packet: &Packet, now: Instant) -> Result<(), MeshError> {
        let announce = Announce::decode(&packet.payload)?;
        let nickname = clamp_nickname(&announce.nickname);
        self.inner
            .peers
            .with_entry_or_insert(packet.source, |entry| {
                entry.nickname = Some(nickname.clone())
            });

        debug!("Announce from {} ({})", packet.source, nickname);
        self.emit(MeshEvent::PeerAnnounced {
            peer: packet.source,
            nickname,
        });
        self.peer_became_reachable(packet.source, now).await;
        Ok(())
    }

    fn on_leave(&self, peer: PeerId) {
        self.inner.peers.with_entry(peer, |entry| {
            entry.reset();
            entry.last_seen = None;
        });
        info!("Peer {} left the mesh", peer);
        self.emit(MeshEvent::PeerLeft(peer));
    }

    fn on_private_message(&self, packet: &Packet) -> Result<(), MeshError> {
        if packet.dest != self.local_peer() {
            return Err(MeshError::InvalidDestination(packet.dest));
        }
        let aad = message_aad(packet.source, packet.dest);
        let plaintext = self
            .inner
            .peers
            .with_entry(packet.source, |entry| {
                decrypt_with_sessions(entry, &packet.payload, &aad)
            })
            .unwrap_or(Err(NoiseError::HandshakeNotComplete))
            .map_err(|e| {
                debug!("Private message from {} rejected: {}", packet.source, e);
                MeshError::AuthenticationFailure
            })?;

        self.emit(MeshEvent::MessageDelivered(Delivery {
            from: packet.source,
            kind: DeliveryKind::Private,
            payload: Bytes::from(plaintext),
        }));
        Ok(())
    }

    async fn on_channel_message(&self, packet: &Packet) -> Result<(), MeshError> {
        let id = peek_channel_id(&packet.payload).ok_or(MeshError::AuthenticationFailure)?;
        let (name, key, retention) = self
            .inner
            .channels
            .get(&id)
            .map(|c| (c.name.clone(), c.key.clone(), c.retention))
            .ok_or_else(|| MeshError::UnknownChannel(id.to_string()))?;

        let (_, plaintext) = decrypt_for_channel(&key, packet.source, &packet.payload)?;

        let new_member = self
            .inner
            .channels
            .get_mut(&id)
            .map(|mut c| c.members.insert(packet.source))
            .unwrap_or(false);
        if new_member {
            self.persist_channel(id);
        }

        self.emit(MeshEvent::MessageDelivered(Delivery {
            from: packet.source,
            kind: DeliveryKind::Channel {
                id,
                name,
                retention,
            },
            payload: Bytes::from(plaintext),
        }));
        Ok(())
    }

    fn on_broadcast(&self, packet: &Packet) -> Result<(), MeshError> {
        if packet.payload.len() < 4 {
            return Err(WireError::Truncated {
                needed: 4,
                got: packet.payload.len(),
            }
            .into());
        }
        self.emit(MeshEvent::MessageDelivered(Delivery {
            from: packet.source,
            kind: DeliveryKind::Broadcast,
            payload: packet.payload.slice(4..),
        }));
        Ok(())
    }

    // ---- handshake ---------------------------------------------------

    async fn on_handshake(&self, packet: &Packet, now: Instant) -> Result<(), MeshError> {
        if packet.dest != self.local_peer() {
            return Err(MeshError::HandshakeFailure {
                peer: packet.source,
                reason: format!("handshake addressed to {}", packet.dest),
            });
        }
        match packet.typ {
            PacketType::HandshakeInit => self.on_handshake_init(packet.source, &packet.payload, now),
            PacketType::HandshakeResponse => {
                self.on_handshake_response(packet.source, &packet.payload, now)
                    .await
            }
            _ => {
                self.on_handshake_final(packet.source, &packet.payload, now)
                    .await
            }
        }
    }

    fn on_handshake_init(&self, peer: PeerId, message: &[u8], now: Instant) -> Result<(), MeshError> {
        if message.len() != HANDSHAKE_MSG1_SIZE {
            return Err(NoiseError::MessageTooShort {
                expected: HANDSHAKE_MSG1_SIZE,
                got: message.len(),
            }
            .into());
        }
        let mut remote_ephemeral = [0u8; 32];
        remote_ephemeral.copy_from_slice(message);

        let identity = &self.inner.identity;
        let handshake_timeout = self.inner.config.handshake_timeout;
        let reply = self.inner.peers.with_entry_or_insert(peer, |entry| {
            // Message 1 of an attempt we already beat, delayed past our message 3
            let just_won = entry.state == SessionState::Established
                && entry.session.as_ref().is_some_and(|session| {
                    session.role() == HandshakeRole::Initiator
                        && now.saturating_duration_since(session.established_at())
                            < handshake_timeout
                });
            if just_won {
                debug!("Stale handshake from {} after our session came up", peer);
                return Ok(None);
            }

            if entry.state == SessionState::SentInit {
                let ours = entry.handshake.as_ref().and_then(|h| h.local_ephemeral());
                if let Some(ours) = ours {
                    if wins_tie_break(&ours, &remote_ephemeral) {
                        debug!("Simultaneous open with {}: keeping our attempt", peer);
                        return Ok(None);
                    }
                    debug!("Simultaneous open with {}: yielding to theirs", peer);
                }
            }

            let mut handshake = HandshakeState::new_responder(identity.static_secret.clone());
            handshake.read_message_1(message)?;
            let reply = handshake.write_message_2(identity.nickname.as_bytes())?;
            entry.handshake = Some(handshake);
            entry.state = SessionState::SentResp;
            entry.step_started = Some(now);
            Ok::<_, NoiseError>(Some(reply))
        })?;

        match reply {
            Some(reply) => {
                debug!("Answering handshake from {}", peer);
                let packet = self.build(
                    PacketType::HandshakeResponse,
                    peer,
                    Flags::empty(),
                    Bytes::from(reply),
                );
                self.send_packet(packet, now)
            }
            None => {
                self.inner
                    .router
                    .stats()
                    .record_drop(DropReason::HandshakeRejected);
                Ok(())
            }
        }
    }

    async fn on_handshake_response(
        &self,
        peer: PeerId,
        message: &[u8],
        now: Instant,
    ) -> Result<(), MeshError> {
        let nickname = &self.inner.identity.nickname;
        let step = self.inner.peers.with_entry(peer, |entry| {
            if entry.state != SessionState::SentInit {
                return Ok(None);
            }
            let Some(mut handshake) = entry.handshake.take() else {
                return Ok(None);
            };
            handshake.read_message_2(message)?;
            let remote_nickname = nickname_from_payload(handshake.remote_payload());
            let reply = handshake.write_message_3(nickname.as_bytes())?;
            let session = handshake.into_session(now)?;
            Ok::<_, NoiseError>(Some((reply, session, remote_nickname)))
        });

        match step {
            Some(Ok(Some((reply, session, remote_nickname)))) => {
                let packet = self.build(
                    PacketType::HandshakeFinal,
                    peer,
                    Flags::empty(),
                    Bytes::from(reply),
                );
                self.send_packet(packet, now)?;
                self.establish(peer, session, remote_nickname, now).await;
                Ok(())
            }
            Some(Err(e)) => {
                self.handshake_failed(peer, e.to_string(), now).await;
                Err(MeshError::HandshakeFailure {
                    peer,
                    reason: e.to_string(),
                })
            }
            _ => Err(MeshError::HandshakeFailure {
                peer,
                reason: "unexpected handshake response".to_string(),
            }),
        }
    }

    async fn on_handshake_final(
        &self,
        peer: PeerId,
        message: &[u8],
        now: Instant,
    ) -> Result<(), MeshError> {
        let step = self.inner.peers.with_entry(peer, |entry| {
            if entry.state != SessionState::SentResp {
                return Ok(None);
            }
            let Some(mut handshake) = entry.handshake.take() else {
                return Ok(None);
            };
            handshake.read_message_3(message)?;
            let remote_nickname = nickname_from_payload(handshake.remote_payload());
            let session = handshake.into_session(now)?;
            Ok::<_, NoiseError>(Some((session, remote_nickname)))
        });

        match step {
            Some(Ok(Some((session, remote_nickname)))) => {
                self.establish(peer, session, remote_nickname, now).await;
                Ok(())
            }
            Some(Err(e)) => {
                self.handshake_failed(peer, e.to_string(), now).await;
                Err(MeshError::HandshakeFailure {
                    peer,
                    reason: e.to_string(),
                })
            }
            _ => Err(MeshError::HandshakeFailure {
                peer,
                reason: "unexpected handshake final".to_string(),
            }),
        }
    }

    async fn establish(
        &self,
        peer: PeerId,
        session: TransportSession,
        nickname: String,
        now: Instant,
    ) {
        let remote_static = *session.remote_static();
        let (known_key, outbox) = self.inner.peers.with_entry_or_insert(peer, |entry| {
            if let Some(old) = entry.session.replace(session) {
                entry.previous = Some(old);
            }
            entry.handshake = None;
            entry.step_started = None;
            entry.state = SessionState::Established;
            entry.nickname = Some(nickname.clone());
            let known = entry.static_key.replace(remote_static);
            let outbox: Vec<Bytes> = entry.outbox.drain(..).collect();
            (known, outbox)
        });

        self.inner.retries.record_success(peer).await;
        info!("Session with {} ({}) established", peer, nickname);
        self.pin_identity(peer, &nickname, remote_static, known_key)
            .await;
        self.emit(MeshEvent::HandshakeCompleted {
            peer,
            nickname,
        });

        for plaintext in outbox {
            if let Err(e) = self.send_encrypted(peer, &plaintext, now).await {
                warn!("Failed to send queued message to {}: {}", peer, e);
            }
        }
    }

    async fn pin_identity(
        &self,
        peer: PeerId,
        nickname: &str,
        static_key: [u8; 32],
        known: Option<[u8; 32]>,
    ) {
        let store = self.inner.persistence.as_ref();
        let key = peer_record_key(peer);

        let pinned = match (known, store) {
            (Some(known), _) => Some(known),
            (None, Some(store)) => match load_json::<PeerRecord>(store.as_ref(), &key).await {
                Ok(record) => record.map(|r| r.static_key),
                Err(e) => {
                    warn!("Failed to load identity pin for {}: {}", peer, e);
                    None
                }
            },
            (None, None) => None,
        };

        if let Some(previous) = pinned.filter(|p| *p != static_key) {
            warn!("Static key of {} changed", peer);
            self.emit(MeshEvent::IdentityChanged {
                peer,
                previous,
                current: static_key,
            });
        }

        let record = PeerRecord {
            nickname: nickname.to_string(),
            static_key,
        };
        self.persist_later(key, &record);
    }

    // Queue a JSON write without waiting for the backend
    fn persist_later<T: Serialize>(&self, key: String, value: &T) {
        let Some(writes) = self.inner.writes.as_ref() else {
            return;
        };
        match serde_json::to_vec(value) {
            Ok(value) => {
                if writes.send(PersistOp::Put { key, value }).is_err() {
                    warn!("Persistence writer is gone");
                }
            }
            Err(e) => warn!("Failed to encode {}: {}", key, e),
        }
    }

    // Wait until every queued write has reached the backend
    async fn flush_persistence(&self) {
        let Some(writes) = self.inner.writes.as_ref() else {
            return;
        };
        let (done, wait) = oneshot::channel();
        if writes.send(PersistOp::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }

    async fn handshake_failed(&self, peer: PeerId, reason: String, now: Instant) {
        let discarded = self
            .inner
            .peers
            .with_entry(peer, |entry| {
                let discarded = if entry.has_session() {
                    0
                } else {
                    let n = entry.outbox.len();
                    entry.outbox.clear();
                    n
                };
                entry.abort_handshake();
                if !entry.has_session() {
                    entry.state = SessionState::Failed;
                }
                discarded
            })
            .unwrap_or(0);

        let (count, _) = self.inner.retries.record_failure(peer, now).await;
        warn!(
            "Handshake with {} failed: {} (failure {}, {} queued messages discarded)",
            peer, reason, count, discarded
        );
        self.emit(MeshEvent::HandshakeFailed { peer, reason });
    }

    async fn start_handshake(&self, peer: PeerId, now: Instant) -> Result<(), MeshError> {
        if peer == self.local_peer() || peer.is_broadcast() {
            return Err(MeshError::InvalidDestination(peer));
        }
        if !self.inner.retries.allow(peer, now).await {
            return Err(MeshError::RetryLimited(peer));
        }
        if !self.inner.router.is_reachable(peer, &self.inner.peers, now) {
            return Err(MeshError::HandshakeFailure {
                peer,
                reason: "peer unreachable".to_string(),
            });
        }

        let secret = &self.inner.identity.static_secret;
        let message = self.inner.peers.with_entry_or_insert(peer, |entry| {
            if entry.state.is_handshaking() {
                return Ok(None);
            }
            let mut handshake = HandshakeState::new_initiator(secret.clone());
            let message = handshake.write_message_1()?;
            entry.handshake = Some(handshake);
            entry.state = SessionState::SentInit;
            entry.step_started = Some(now);
            Ok::<_, NoiseError>(Some(message))
        })?;

        let Some(message) = message else {
            debug!("Handshake with {} already in flight", peer);
            return Ok(());
        };
        info!("Initiating handshake with {}", peer);
        let packet = self.build(
            PacketType::HandshakeInit,
            peer,
            Flags::empty(),
            Bytes::from(message),
        );
        self.send_packet(packet, now)
    }

    /// Start a handshake with `peer` now
    pub async fn initiate_handshake(&self, peer: PeerId) -> Result<(), MeshError> {
        self.start_handshake(peer, Instant::now()).await
    }

    // ---- application sends -------------------------------------------

    async fn send_encrypted(
        &self,
        peer: PeerId,
        plaintext: &[u8],
        now: Instant,
    ) -> Result<(), MeshError> {
        let config = &self.inner.config;
        let aad = message_aad(self.local_peer(), peer);
        let sealed = self.inner.peers.with_entry(peer, |entry| {
            let handshaking = entry.state.is_handshaking();
            let Some(session) = entry.session.as_mut() else {
                return Ok(None);
            };
            let payload = session.encrypt(plaintext, &aad)?;
            let rekey = !handshaking
                && session.needs_rekey(now, config.rekey_after_messages, config.rekey_after);
            Ok::<_, NoiseError>(Some((payload, rekey)))
        });

        let (payload, rekey) = match sealed {
            Some(Ok(Some(sealed))) => sealed,
            Some(Err(e)) => return Err(e.into()),
            _ => {
                return Err(MeshError::HandshakeFailure {
                    peer,
                    reason: "no established session".to_string(),
                })
            }
        };

        let packet = self.build(PacketType::Message, peer, Flags::ENCRYPTED, payload);
        self.send_packet(packet, now)?;

        if rekey {
            info!("Rotating session keys with {}", peer);
            if let Err(e) = self.start_handshake(peer, now).await {
                debug!("Rekey with {} not started: {}", peer, e);
            }
        }
        Ok(())
    }

    /// Send an encrypted private message
    ///
    /// Without an Established session the message waits in the peer's outbox
    /// while a handshake runs; it is discarded if the handshake fails.
    pub async fn send_private(&self, peer: PeerId, payload: impl Into<Bytes>) -> Result<(), MeshError> {
        let now = Instant::now();
        let plaintext: Bytes = payload.into();
        if peer == self.local_peer() || peer.is_broadcast() {
            return Err(MeshError::InvalidDestination(peer));
        }
        if plaintext.len() > self.inner.config.max_message_size {
            return Err(MeshError::PayloadTooLarge(plaintext.len()));
        }

        if self.inner.peers.has_session(peer) {
            return self.send_encrypted(peer, &plaintext, now).await;
        }
        if !self.inner.retries.allow(peer, now).await {
            return Err(MeshError::RetryLimited(peer));
        }

        let capacity = self.inner.config.outbox_capacity.max(1);
        let queued = self.inner.peers.with_entry_or_insert(peer, |entry| {
            if entry.has_session() {
                return None;
            }
            if entry.outbox.len() >= capacity {
                entry.outbox.pop_front();
                debug!("Outbox for {} full, dropped oldest message", peer);
            }
            entry.outbox.push_back(plaintext.clone());
            Some(!entry.state.is_handshaking())
        });

        match queued {
            None => self.send_encrypted(peer, &plaintext, now).await,
            Some(false) => Ok(()),
            Some(true) => {
                if self.inner.router.is_reachable(peer, &self.inner.peers, now) {
                    self.start_handshake(peer, now).await
                } else {
                    debug!("{} unreachable, message waits until it appears", peer);
                    Ok(())
                }
            }
        }
    }

    /// Encrypt and flood a message to a joined channel
    pub async fn send_channel(&self, name: &str, payload: impl Into<Bytes>) -> Result<(), MeshError> {
        let plaintext: Bytes = payload.into();
        if plaintext.len() > self.inner.config.max_message_size {
            return Err(MeshError::PayloadTooLarge(plaintext.len()));
        }
        let id = ChannelId::from_name(name);
        let key = self
            .inner
            .channels
            .get(&id)
            .map(|c| c.key.clone())
            .ok_or_else(|| MeshError::UnknownChannel(name.to_string()))?;

        let sealed = encrypt_for_channel(&key, id, self.local_peer(), &plaintext)?;
        let packet = self.build(
            PacketType::ChannelMessage,
            PeerId::BROADCAST,
            Flags::ENCRYPTED | Flags::CHANNEL,
            sealed,
        );
        self.send_packet(packet, Instant::now())
    }

    /// Flood a public plaintext message
    pub async fn broadcast(&self, payload: impl Into<Bytes>) -> Result<(), MeshError> {
        let body: Bytes = payload.into();
        if body.len() > self.inner.config.max_message_size {
            return Err(MeshError::PayloadTooLarge(body.len()));
        }
        let sequence = self.inner.broadcast_seq.fetch_add(1, Ordering::Relaxed);
        let mut buf = BytesMut::with_capacity(4 + body.len());
        buf.put_u32(sequence);
        buf.put_slice(&body);

        let packet = self.build(
            PacketType::Broadcast,
            PeerId::BROADCAST,
            Flags::empty(),
            buf.freeze(),
        );
        self.send_packet(packet, Instant::now())
    }

    fn announce_at(&self, now: Instant) -> Result<(), MeshError> {
        let announce = Announce {
            sequence: self.inner.announce_seq.fetch_add(1, Ordering::Relaxed),
            nickname: self.inner.identity.nickname.clone(),
        };
        let packet = self.build(
            PacketType::Announce,
            PeerId::BROADCAST,
            Flags::empty(),
            announce.encode(),
        );
        self.send_packet(packet, now)
    }

    /// Flood an announce with our nickname
    pub async fn announce(&self) -> Result<(), MeshError> {
        self.announce_at(Instant::now())
    }

    /// Tell the mesh we are leaving
    pub async fn leave(&self) -> Result<(), MeshError> {
        let sequence = self.inner.leave_seq.fetch_add(1, Ordering::Relaxed);
        let packet = self.build(
            PacketType::Leave,
            PeerId::BROADCAST,
            Flags::empty(),
            Bytes::copy_from_slice(&sequence.to_be_bytes()),
        );
        self.send_packet(packet, Instant::now())
    }

    // ---- channels ----------------------------------------------------

    /// Join a channel, deriving its key from the password
    ///
    /// Key derivation is deliberately slow and runs on the blocking pool.
    /// A persisted membership record restores retention and known members.
    pub async fn join_channel(&self, name: &str, password: &str) -> Result<ChannelId, MeshError> {
        let params = self.inner.config.channel_kdf;
        let (owned_name, owned_password) = (name.to_string(), password.to_string());
        let mut channel = tokio::task::spawn_blocking(move || {
            Channel::join(&owned_name, &owned_password, &params)
        })
        .await
        .map_err(|e| MeshError::KeyDerivation(e.to_string()))??;

        self.flush_persistence().await;
        if let Some(store) = self.inner.persistence.as_ref() {
            match load_json::<ChannelRecord>(store.as_ref(), &channel_record_key(name)).await {
                Ok(Some(record)) => {
                    channel.retention = record.retention;
                    channel.members = record.members.into_iter().map(PeerId).collect();
                }
                Ok(None) => {}
                Err(e) => warn!("Failed to load channel record for {}: {}", name, e),
            }
        }

        let id = channel.id;
        self.inner.channels.insert(id, channel);
        info!("Joined channel {} ({})", name, id);
        self.persist_channel(id);
        self.flush_persistence().await;
        Ok(id)
    }

    /// Leave a channel and forget its record; returns whether it was joined
    pub async fn leave_channel(&self, name: &str) -> Result<bool, MeshError> {
        let removed = self
            .inner
            .channels
            .remove(&ChannelId::from_name(name))
            .is_some();
        self.flush_persistence().await;
        if let Some(store) = self.inner.persistence.as_ref() {
            store.delete(&channel_record_key(name)).await?;
        }
        if removed {
            info!("Left channel {}", name);
        }
        Ok(removed)
    }

    /// Toggle whether delivered messages of a channel should be retained
    pub async fn set_channel_retention(&self, name: &str, retention: bool) -> Result<(), MeshError> {
        let id = ChannelId::from_name(name);
        self.inner
            .channels
            .get_mut(&id)
            .map(|mut c| c.retention = retention)
            .ok_or_else(|| MeshError::UnknownChannel(name.to_string()))?;
        self.persist_channel(id);
        self.flush_persistence().await;
        Ok(())
    }

    fn persist_channel(&self, id: ChannelId) {
        let Some(record) = self.inner.channels.get(&id).map(|c| c.record()) else {
            return;
        };
        self.persist_later(channel_record_key(&record.name), &record);
    }

    /// Channel memberships saved by earlier runs
    pub async fn persisted_channels(&self) -> Result<Vec<ChannelRecord>, MeshError> {
        let Some(store) = self.inner.persistence.as_ref() else {
            return Ok(Vec::new());
        };
        self.flush_persistence().await;
        let mut records = Vec::new();
        for (key, bytes) in store.scan(CHANNEL_RECORD_PREFIX).await? {
            match serde_json::from_slice::<ChannelRecord>(&bytes) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping unreadable channel record {}: {}", key, e),
            }
        }
        Ok(records)
    }

    /// Identity pinned for a peer by an earlier handshake
    pub async fn pinned_identity(&self, peer: PeerId) -> Result<Option<PeerRecord>, MeshError> {
        self.flush_persistence().await;
        match self.inner.persistence.as_ref() {
            Some(store) => Ok(load_json(store.as_ref(), &peer_record_key(peer)).await?),
            None => Ok(None),
        }
    }

    // ---- maintenance -------------------------------------------------

    /// Run periodic maintenance now
    pub async fn tick(&self) {
        self.tick_at(Instant::now()).await
    }

    /// Run periodic maintenance with an explicit clock
    pub async fn tick_at(&self, now: Instant) {
        let inner = &self.inner;

        let swept = inner.reassembler.sweep(now);
        if swept > 0 {
            debug!("{}: discarded {} partial messages", MeshError::FragmentTimeout, swept);
        }

        for peer in inner.peers.expired_handshakes(now, inner.config.handshake_timeout) {
            self.handshake_failed(peer, "handshake step timed out".to_string(), now)
                .await;
        }

        inner.router.seen().purge_expired(now);

        let expired = self.lock_store_forward().purge_expired(now);
        if expired > 0 {
            debug!("Dropped {} expired store-and-forward packets", expired);
        }

        inner
            .peers
            .retire_previous(now, inner.config.handshake_timeout);
        let evicted =
            inner
                .peers
                .evict_idle(now, inner.config.peer_eviction, inner.config.rekey_after);
        if !evicted.is_empty() {
            debug!("Evicted {} idle peers", evicted.len());
        }

        inner.retries.cleanup(now).await;
    }

    /// Drive the engine from link events and a maintenance timer
    ///
    /// Returns when the link event channel closes.
    pub async fn run(&self, mut link_events: mpsc::UnboundedReceiver<LinkEvent>) {
        info!("Mesh engine {} running", self.local_peer());
        let mut ticker = tokio::time::interval(self.inner.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = link_events.recv() => match event {
                    Some(event) => self.handle_link_event(event).await,
                    None => {
                        info!("Link closed, mesh engine {} stopping", self.local_peer());
                        break;
                    }
                },
                _ = ticker.tick() => self.tick().await,
            }
        }
    }

    fn emit(&self, event: MeshEvent) {
        if self.inner.events.send(event).is_err() {
            debug!("Event receiver dropped");
        }
    }
}
