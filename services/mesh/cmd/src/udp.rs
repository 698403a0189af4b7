//! UDP link for running nodes on a real network.
//!
//! One socket serves every neighbor. Neighbors are configured as
//! `peer_id -> address` pairs; datagrams from any other address are ignored.
//! UDP has no connection state, so a neighbor counts as connected from the
//! moment it is added.

use anyhow::{Context, Result};
use bytes::Bytes;
use mesh_session::{Link, LinkError, LinkEvent};
use mesh_wire::PeerId;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

// Largest datagram we try to read
const RECV_BUFFER_SIZE: usize = 65_535;

/// [`Link`] over a single UDP socket
pub struct UdpLink {
    neighbors: RwLock<HashMap<PeerId, SocketAddr>>,
    outgoing: mpsc::UnboundedSender<(SocketAddr, Bytes)>,
    events: mpsc::UnboundedSender<LinkEvent>,
    local_addr: SocketAddr,
    mtu: usize,
}

impl UdpLink {
    /// Bind the socket and start the send and receive loops
    ///
    /// Returns the link and the receiver of events to feed into the engine.
    pub async fn bind(
        listen: SocketAddr,
        mtu: usize,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<LinkEvent>)> {
        let socket = UdpSocket::bind(listen)
            .await
            .with_context(|| format!("failed to bind udp socket on {}", listen))?;
        let local_addr = socket.local_addr()?;
        let socket = Arc::new(socket);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();

        let link = Arc::new(Self {
            neighbors: RwLock::new(HashMap::new()),
            outgoing: outgoing_tx,
            events: events_tx,
            local_addr,
            mtu,
        });

        tokio::spawn(send_loop(socket.clone(), outgoing_rx));
        tokio::spawn(receive_loop(socket, Arc::downgrade(&link)));

        info!(component = "udp", "UDP link listening on {}", local_addr);
        Ok((link, events_rx))
    }

    /// Address the socket is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Register a neighbor and report it connected
    pub fn add_neighbor(&self, peer: PeerId, addr: SocketAddr) {
        let previous = self.write_neighbors().insert(peer, addr);
        if previous.is_none() {
            info!(component = "udp", "Neighbor {} at {}", peer, addr);
            let _ = self.events.send(LinkEvent::Connected(peer));
        }
    }

    fn read_neighbors(&self) -> RwLockReadGuard<'_, HashMap<PeerId, SocketAddr>> {
        self.neighbors
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_neighbors(&self) -> RwLockWriteGuard<'_, HashMap<PeerId, SocketAddr>> {
        self.neighbors
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn peer_for(&self, addr: SocketAddr) -> Option<PeerId> {
        self.read_neighbors()
            .iter()
            .find(|(_, a)| **a == addr)
            .map(|(peer, _)| *peer)
    }
}

impl Link for UdpLink {
    fn send(&self, to: PeerId, frame: Bytes) -> Result<(), LinkError> {
        if frame.len() > self.mtu {
            return Err(LinkError::FrameTooLarge {
                size: frame.len(),
                mtu: self.mtu,
            });
        }
        let addr = self
            .read_neighbors()
            .get(&to)
            .copied()
            .ok_or(LinkError::NotConnected(to))?;
        self.outgoing
            .send((addr, frame))
            .map_err(|_| LinkError::Closed)
    }

    fn disconnect(&self, peer: PeerId) {
        if let Some(addr) = self.write_neighbors().remove(&peer) {
            info!(component = "udp", "Dropped neighbor {} at {}", peer, addr);
        }
    }
}

async fn send_loop(
    socket: Arc<UdpSocket>,
    mut outgoing: mpsc::UnboundedReceiver<(SocketAddr, Bytes)>,
) {
    while let Some((addr, frame)) = outgoing.recv().await {
        if let Err(e) = socket.send_to(&frame, addr).await {
            warn!(component = "udp", "Send to {} failed: {}", addr, e);
        }
    }
    debug!(component = "udp", "UDP send loop stopped");
}

async fn receive_loop(socket: Arc<UdpSocket>, link: std::sync::Weak<UdpLink>) {
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    loop {
        let (len, addr) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!(component = "udp", "Receive failed: {}", e);
                continue;
            }
        };
        let Some(strong) = link.upgrade() else {
            break;
        };
        let Some(from) = strong.peer_for(addr) else {
            debug!(component = "udp", "Ignoring {} bytes from unknown {}", len, addr);
            continue;
        };
        let event = LinkEvent::Frame {
            from,
            bytes: Bytes::copy_from_slice(&buf[..len]),
        };
        if strong.events.send(event).is_err() {
            break;
        }
    }
    debug!(component = "udp", "UDP receive loop stopped");
}
