//! Mesh network node binary.
//!
//! Runs one meshlink node over UDP: neighbors come from the config file or
//! `--neighbor peer_id@host:port`, console lines are sent into the mesh and
//! everything the engine delivers is printed.

use anyhow::Context;
use clap::Parser;
use mesh_session::{DeliveryKind, Link, LocalIdentity, MeshEngine, MeshEvent};
use mesh_storage::{open_store, PersistenceStore};
use mesh_wire::PeerId;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod logging;
mod udp;

use commands::Command;
use config::{parse_neighbor, NodeConfig};
use logging::MeshLogFormatter;
use udp::UdpLink;

// Persistence key of the node's static secret
const IDENTITY_KEY: &str = "local/identity";

/// Multi-hop encrypted mesh node
#[derive(Parser, Debug)]
#[command(name = "meshlink", version, about = "Multi-hop encrypted mesh node over UDP")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "meshlink.yaml")]
    config: PathBuf,

    /// Local peer id in hex, e.g. 0000a11c
    #[arg(long)]
    peer_id: Option<String>,

    /// Nickname sent to other peers
    #[arg(long)]
    nickname: Option<String>,

    /// UDP listen address, e.g. 0.0.0.0:7331
    #[arg(long)]
    listen: Option<String>,

    /// Neighbor as peer_id@host:port (repeatable)
    #[arg(long)]
    neighbor: Vec<String>,

    /// Directory for identity, pins and channel records
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Handshake step timeout, e.g. 30s
    #[arg(long)]
    handshake_timeout: Option<humantime::Duration>,

    /// Maintenance interval, e.g. 1s
    #[arg(long)]
    tick_interval: Option<humantime::Duration>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn apply_to(&self, config: &mut NodeConfig) -> anyhow::Result<()> {
        if let Some(peer_id) = &self.peer_id {
            config.peer_id = peer_id.clone();
        }
        if let Some(nickname) = &self.nickname {
            config.nickname = nickname.clone();
        }
        if let Some(listen) = &self.listen {
            config.listen = listen.clone();
        }
        for neighbor in &self.neighbor {
            parse_neighbor(neighbor)?;
            if !config.neighbors.contains(neighbor) {
                config.neighbors.push(neighbor.clone());
            }
        }
        if let Some(dir) = &self.data_dir {
            config.data_dir = Some(dir.clone());
        }
        if let Some(timeout) = &self.handshake_timeout {
            config.engine.handshake_timeout = timeout.to_string();
        }
        if let Some(interval) = &self.tick_interval {
            config.engine.tick_interval = interval.to_string();
        }
        Ok(())
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("warn")
        .add_directive(format!("meshlink={}", args.log_level).parse()?)
        .add_directive(format!("mesh_session={}", args.log_level).parse()?)
        .add_directive(format!("mesh_routing={}", args.log_level).parse()?)
        .add_directive(format!("mesh_storage={}", args.log_level).parse()?)
        .add_directive(format!("mesh_wire={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .event_format(MeshLogFormatter::new("mesh"))
        .init();

    info!("Starting meshlink v{}", env!("CARGO_PKG_VERSION"));

    let mut node_config = NodeConfig::load_from_file(&args.config)?;
    args.apply_to(&mut node_config)?;

    let local = node_config.local_peer()?;
    let engine_config = node_config.engine_config()?;
    let store = open_store(node_config.storage_mode())
        .await
        .context("failed to open persistence")?;
    let identity = load_identity(store.as_ref(), local, &node_config.nickname).await?;
    info!(
        "Local peer {} ({}), static key {}",
        local,
        identity.nickname,
        hex_prefix(&identity.public_key())
    );

    let (link, link_events) = UdpLink::bind(node_config.listen_addr()?, engine_config.mtu).await?;
    info!("Bound {} for peer {}", link.local_addr(), local);
    for (peer, addr) in node_config.neighbor_addrs()? {
        link.add_neighbor(peer, addr);
    }

    let dyn_link: Arc<dyn Link> = link.clone();
    let (engine, events) = MeshEngine::new(engine_config, identity, dyn_link, Some(store));

    for record in engine.persisted_channels().await? {
        info!(
            "Previously joined {} ({} known members); /join it again to rejoin",
            record.name,
            record.members.len()
        );
    }

    let runner = engine.clone();
    tokio::spawn(async move { runner.run(link_events).await });
    tokio::spawn(print_events(events));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                match Command::parse(&line) {
                    Ok(Some(Command::Quit)) => break,
                    Ok(Some(command)) => {
                        if let Err(e) = execute(&engine, command).await {
                            println!("! {}", e);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => println!("! {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    if let Err(e) = engine.leave().await {
        warn!("Failed to announce departure: {}", e);
    }
    // Give the send loop a moment to flush the leave
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    info!("meshlink stopped");
    Ok(())
}

async fn load_identity(
    store: &dyn PersistenceStore,
    local: PeerId,
    nickname: &str,
) -> anyhow::Result<LocalIdentity> {
    if let Some(bytes) = store.get(IDENTITY_KEY).await? {
        match <[u8; 32]>::try_from(bytes.as_slice()) {
            Ok(secret) => return Ok(LocalIdentity::from_secret_bytes(local, secret, nickname)),
            Err(_) => warn!("Stored identity has {} bytes, generating a new one", bytes.len()),
        }
    }

    let identity = LocalIdentity::generate(local, nickname);
    store
        .put(IDENTITY_KEY, identity.static_secret.to_bytes().to_vec())
        .await
        .context("failed to persist identity")?;
    info!("Generated a new static identity");
    Ok(identity)
}

async fn execute(engine: &MeshEngine, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Broadcast(text) => engine.broadcast(text).await?,
        Command::Private { to, text } => engine.send_private(to, text).await?,
        Command::Join { channel, password } => {
            let id = engine.join_channel(&channel, &password).await?;
            println!("* joined {} ({})", channel, id);
        }
        Command::Leave(channel) => {
            if !engine.leave_channel(&channel).await? {
                println!("* not in {}", channel);
            }
        }
        Command::Channel { channel, text } => engine.send_channel(&channel, text).await?,
        Command::Retain { channel, enabled } => {
            engine.set_channel_retention(&channel, enabled).await?
        }
        Command::Handshake(peer) => engine.initiate_handshake(peer).await?,
        Command::Peers => {
            for peer in engine.peers() {
                println!(
                    "* {} {:<16} {:<11} {}{}",
                    peer.id,
                    peer.nickname.as_deref().unwrap_or("?"),
                    peer.state,
                    if peer.neighbor { "neighbor" } else { "remote" },
                    match peer.pending_outbox {
                        0 => String::new(),
                        n => format!(", {} queued", n),
                    }
                );
            }
        }
        Command::Channels => {
            for (id, name) in engine.channels() {
                println!("* {} {}", id, name);
            }
        }
        Command::Stats => {
            let stats = engine.stats();
            println!(
                "* delivered {} forwarded {} stored {} dropped {} (waiting: {} stored, {} partial)",
                stats.packets_delivered,
                stats.packets_forwarded,
                stats.packets_stored,
                stats.packets_dropped,
                engine.pending_store_forward(),
                engine.pending_fragments()
            );
            let mut reasons: Vec<_> = stats.drop_reasons.into_iter().collect();
            reasons.sort();
            for (reason, count) in reasons {
                println!("*   {} {}", reason, count);
            }
        }
        Command::Quit => {}
    }
    Ok(())
}

async fn print_events(mut events: mpsc::UnboundedReceiver<MeshEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            MeshEvent::MessageDelivered(delivery) => {
                let text = String::from_utf8_lossy(&delivery.payload);
                match delivery.kind {
                    DeliveryKind::Broadcast => println!("<{}> {}", delivery.from, text),
                    DeliveryKind::Private => println!("[{} -> me] {}", delivery.from, text),
                    DeliveryKind::Channel { name, .. } => {
                        println!("{} <{}> {}", name, delivery.from, text)
                    }
                }
            }
            MeshEvent::PeerAnnounced { peer, nickname } => {
                println!("* {} is {}", peer, nickname)
            }
            MeshEvent::HandshakeCompleted { peer, nickname } => {
                println!("* secure session with {} ({})", peer, nickname)
            }
            MeshEvent::HandshakeFailed { peer, reason } => {
                println!("! handshake with {} failed: {}", peer, reason)
            }
            MeshEvent::IdentityChanged {
                peer,
                previous,
                current,
            } => println!(
                "! {} changed its static key from {} to {}",
                peer,
                hex_prefix(&previous),
                hex_prefix(&current)
            ),
            MeshEvent::PeerLeft(peer) => println!("* {} left", peer),
            MeshEvent::PeerConnected(_)
            | MeshEvent::PeerDisconnected(_)
            | MeshEvent::ConnectionRejected(_) => {}
        }
    }
}

fn hex_prefix(key: &[u8; 32]) -> String {
    key[..8].iter().map(|b| format!("{:02x}", b)).collect()
}
