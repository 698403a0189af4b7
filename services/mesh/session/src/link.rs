//! Link-layer seam between the engine and whatever moves frames.
//!
//! The engine never opens sockets or radios itself. A [`Link`] sends encoded
//! packets to direct neighbors and reports what happens on the medium as
//! [`LinkEvent`]s, which the owner feeds into the engine.

use bytes::Bytes;
use mesh_wire::PeerId;
use thiserror::Error;
use tokio::sync::mpsc;

/// Link failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// Peer is not a direct neighbor on this link
    #[error("peer {0} is not connected")]
    NotConnected(PeerId),

    /// Frame exceeds the link MTU
    #[error("frame of {size} bytes exceeds link mtu {mtu}")]
    FrameTooLarge {
        /// Frame size
        size: usize,
        /// Link MTU
        mtu: usize,
    },

    /// Link has shut down
    #[error("link closed")]
    Closed,

    /// Underlying I/O failure
    #[error("link io: {0}")]
    Io(String),
}

/// Something that moves frames to direct neighbors
///
/// Sends must not block; implementations queue internally.
pub trait Link: Send + Sync {
    /// Send one encoded packet to a neighbor
    fn send(&self, to: PeerId, frame: Bytes) -> Result<(), LinkError>;

    /// Drop the connection to a neighbor
    fn disconnect(&self, peer: PeerId);
}

/// Events a link reports upward
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A neighbor became directly reachable
    Connected(PeerId),
    /// A neighbor went away
    Disconnected(PeerId),
    /// A frame arrived from a neighbor
    Frame {
        /// Neighbor that delivered the frame
        from: PeerId,
        /// Encoded packet
        bytes: Bytes,
    },
}

/// What a [`MemoryLink`] was asked to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCommand {
    /// Frame handed to the link
    Send {
        /// Neighbor addressed
        to: PeerId,
        /// Encoded packet
        bytes: Bytes,
    },
    /// Disconnect requested
    Disconnect(PeerId),
}

/// In-process link that records every command on a channel
///
/// Used to wire engines together in tests and simulations: the receiver side
/// decides when and where each frame is delivered.
#[derive(Debug, Clone)]
pub struct MemoryLink {
    local: PeerId,
    tx: mpsc::UnboundedSender<LinkCommand>,
}

impl MemoryLink {
    /// Create a link and the receiver that observes its commands
    pub fn new(local: PeerId) -> (Self, mpsc::UnboundedReceiver<LinkCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { local, tx }, rx)
    }

    /// Peer this link belongs to
    pub fn local(&self) -> PeerId {
        self.local
    }
}

impl Link for MemoryLink {
    fn send(&self, to: PeerId, frame: Bytes) -> Result<(), LinkError> {
        self.tx
            .send(LinkCommand::Send { to, bytes: frame })
            .map_err(|_| LinkError::Closed)
    }

    fn disconnect(&self, peer: PeerId) {
        let _ = self.tx.send(LinkCommand::Disconnect(peer));
    }
}
