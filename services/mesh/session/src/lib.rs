//! Sessions, channels and the mesh engine for meshlink.
//!
//! This crate turns the packet format from `mesh-wire`, the flood router from
//! `mesh-routing` and the stores from `mesh-storage` into a working node:
//!
//! - **Handshake**: Noise XX over X25519 / ChaCha20-Poly1305 / SHA-256,
//!   mutually authenticating long-term static keys
//! - **Transport**: counter-nonce sessions with a sliding replay window
//! - **Channels**: Argon2id password keys with AES-256-GCM sealing
//! - **Peer table**: bounded, with handshake state and per-peer outboxes
//! - **Engine**: inbound routing, relaying, store-and-forward, fragmentation,
//!   rekeying and identity pinning behind a [`Link`] abstraction
//!
//! ## Example
//!
//! ```rust,no_run
//! use mesh_session::{EngineConfig, LocalIdentity, MemoryLink, MeshEngine, MeshEvent};
//! use mesh_wire::PeerId;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let (link, _outgoing) = MemoryLink::new(PeerId(1));
//! let identity = LocalIdentity::generate(PeerId(1), "alice");
//! let (engine, mut events) =
//!     MeshEngine::new(EngineConfig::default(), identity, Arc::new(link), None);
//!
//! engine.broadcast("hello mesh").await?;
//!
//! while let Some(event) = events.recv().await {
//!     if let MeshEvent::MessageDelivered(delivery) = event {
//!         println!("{} says {:?}", delivery.from, delivery.payload);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod failure_tracker;
pub mod handshake;
pub mod link;
pub mod peer;
pub mod transport;

// Re-export main types
pub use channel::{Channel, ChannelId, ChannelKdfParams, ChannelKey, ChannelRecord};
pub use config::{EngineConfig, DEFAULT_HANDSHAKE_TIMEOUT};
pub use engine::{
    Delivery, DeliveryKind, LocalIdentity, MeshEngine, MeshEvent, PeerRecord,
    CHANNEL_RECORD_PREFIX, PEER_RECORD_PREFIX,
};
pub use error::{MeshError, NoiseError};
pub use failure_tracker::HandshakeRetryTracker;
pub use handshake::{wins_tie_break, HandshakeRole, HandshakeState};
pub use link::{Link, LinkCommand, LinkError, LinkEvent, MemoryLink};
pub use peer::{PeerInfo, PeerTable, SessionState};
pub use transport::{ReplayWindow, TransportSession};
