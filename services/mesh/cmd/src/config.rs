//! Configuration handling for the mesh node.
//!
//! Settings come from a YAML file, then environment variables, then the
//! command line (applied in `main`). Durations are written the humantime way
//! (`30s`, `10m`, `12h`).

use anyhow::{bail, Context, Result};
use mesh_session::EngineConfig;
use mesh_storage::{StorageMode, StoreForwardConfig};
use mesh_wire::PeerId;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// File name of the persistence map inside the data directory
pub const STORE_FILE_NAME: &str = "meshlink.json";

/// Mesh node configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Local peer id in hex
    pub peer_id: String,
    /// Nickname sent in announces and handshakes
    pub nickname: String,
    /// UDP listen address
    pub listen: String,
    /// Direct neighbors as `peer_id@host:port`
    pub neighbors: Vec<String>,
    /// Directory for persisted identity, pins and channels; memory only when unset
    pub data_dir: Option<PathBuf>,
    /// Engine tunables
    pub engine: EngineSection,
}

/// Engine tunables as written in the config file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// Hop budget for originated packets
    pub ttl: u8,
    /// Link MTU in bytes
    pub mtu: usize,
    /// Maximum direct neighbors
    pub max_neighbors: usize,
    /// Maximum known peers
    pub max_peers: usize,
    /// Partial reassembly timeout
    pub fragment_timeout: String,
    /// Handshake step timeout
    pub handshake_timeout: String,
    /// Inactivity eviction window for non-neighbors
    pub peer_eviction: String,
    /// Store-and-forward entry expiry
    pub store_forward_expiry: String,
    /// Store-and-forward entries across all peers
    pub store_forward_max_total: usize,
    /// Store-and-forward entries per peer
    pub store_forward_max_per_peer: usize,
    /// Rekey after this many messages
    pub rekey_after_messages: u64,
    /// Rekey after this much time
    pub rekey_after: String,
    /// Maintenance interval
    pub tick_interval: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            peer_id: "00000001".to_string(),
            nickname: "anon".to_string(),
            listen: "0.0.0.0:7331".to_string(),
            neighbors: Vec::new(),
            data_dir: None,
            engine: EngineSection::default(),
        }
    }
}

impl Default for EngineSection {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            ttl: engine.ttl,
            mtu: engine.mtu,
            max_neighbors: engine.max_neighbors,
            max_peers: engine.max_peers,
            fragment_timeout: format_duration(engine.fragment_timeout),
            handshake_timeout: format_duration(engine.handshake_timeout),
            peer_eviction: format_duration(engine.peer_eviction),
            store_forward_expiry: format_duration(engine.store_forward.expiry),
            store_forward_max_total: engine.store_forward.max_total,
            store_forward_max_per_peer: engine.store_forward.max_per_peer,
            rekey_after_messages: engine.rekey_after_messages,
            rekey_after: format_duration(engine.rekey_after),
            tick_interval: format_duration(engine.tick_interval),
        }
    }
}

fn format_duration(d: Duration) -> String {
    humantime::format_duration(d).to_string()
}

fn parse_duration(field: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value).with_context(|| format!("invalid duration for {}: {:?}", field, value))
}

/// Parse a unicast peer id
pub fn parse_peer_id(value: &str) -> Result<PeerId> {
    let id: PeerId = value
        .trim()
        .parse()
        .with_context(|| format!("invalid peer id {:?}", value))?;
    if id.is_broadcast() {
        bail!("peer id 00000000 is reserved for broadcast");
    }
    Ok(id)
}

/// Parse a `peer_id@host:port` neighbor entry
pub fn parse_neighbor(value: &str) -> Result<(PeerId, SocketAddr)> {
    let Some((id, addr)) = value.split_once('@') else {
        bail!("neighbor {:?} must look like peer_id@host:port", value);
    };
    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid neighbor address {:?}", addr))?;
    Ok((parse_peer_id(id)?, addr))
}

impl NodeConfig {
    /// Load configuration from file and environment variables
    ///
    /// A missing file falls back to defaults; an unreadable one is an error.
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => {
                let config: NodeConfig = serde_yaml::from_str(&content)
                    .with_context(|| format!("failed to parse config file {:?}", path))?;
                info!("Loaded configuration from {:?}", path);
                config
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
            Err(e) => return Err(e).with_context(|| format!("failed to read {:?}", path)),
        };

        config.apply_overrides(|key| std::env::var(key).ok());

        info!(
            "Node configuration: peer_id={}, nickname={}, listen={}, neighbors={}",
            config.peer_id,
            config.nickname,
            config.listen,
            config.neighbors.len()
        );
        Ok(config)
    }

    /// Apply `MESH_*` overrides from a variable lookup
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(peer_id) = lookup("MESH_PEER_ID") {
            info!("Peer id overridden by environment: {}", peer_id);
            self.peer_id = peer_id;
        }
        if let Some(nickname) = lookup("MESH_NICKNAME") {
            info!("Nickname overridden by environment: {}", nickname);
            self.nickname = nickname;
        }
        if let Some(listen) = lookup("MESH_LISTEN") {
            info!("Listen address overridden by environment: {}", listen);
            self.listen = listen;
        }
        if let Some(data_dir) = lookup("MESH_DATA_DIR") {
            info!("Data directory overridden by environment: {}", data_dir);
            self.data_dir = Some(PathBuf::from(data_dir));
        }
    }

    /// Local peer id
    pub fn local_peer(&self) -> Result<PeerId> {
        parse_peer_id(&self.peer_id)
    }

    /// UDP listen address
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.listen
            .parse()
            .with_context(|| format!("invalid listen address {:?}", self.listen))
    }

    /// Configured neighbors
    pub fn neighbor_addrs(&self) -> Result<Vec<(PeerId, SocketAddr)>> {
        self.neighbors.iter().map(|n| parse_neighbor(n)).collect()
    }

    /// Persistence backend for this node
    pub fn storage_mode(&self) -> StorageMode {
        match &self.data_dir {
            Some(dir) => StorageMode::File {
                path: dir.join(STORE_FILE_NAME),
            },
            None => StorageMode::InMemory,
        }
    }

    /// Build the engine configuration
    pub fn engine_config(&self) -> Result<EngineConfig> {
        let section = &self.engine;
        if section.ttl > mesh_wire::MAX_TTL {
            bail!("ttl {} exceeds the maximum of {}", section.ttl, mesh_wire::MAX_TTL);
        }
        if section.mtu <= mesh_wire::HEADER_SIZE + mesh_wire::FRAGMENT_HEADER_SIZE {
            bail!("mtu {} leaves no room for fragment data", section.mtu);
        }

        Ok(EngineConfig {
            ttl: section.ttl,
            mtu: section.mtu,
            max_neighbors: section.max_neighbors,
            max_peers: section.max_peers,
            fragment_timeout: parse_duration("fragment_timeout", &section.fragment_timeout)?,
            handshake_timeout: parse_duration("handshake_timeout", &section.handshake_timeout)?,
            peer_eviction: parse_duration("peer_eviction", &section.peer_eviction)?,
            store_forward: StoreForwardConfig {
                max_total: section.store_forward_max_total,
                max_per_peer: section.store_forward_max_per_peer,
                expiry: parse_duration("store_forward_expiry", &section.store_forward_expiry)?,
            },
            rekey_after_messages: section.rekey_after_messages,
            rekey_after: parse_duration("rekey_after", &section.rekey_after)?,
            tick_interval: parse_duration("tick_interval", &section.tick_interval)?,
            ..EngineConfig::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.local_peer().unwrap(), PeerId(1));
        assert_eq!(config.listen_addr().unwrap().port(), 7331);
        assert!(matches!(config.storage_mode(), StorageMode::InMemory));

        let engine = config.engine_config().unwrap();
        let defaults = EngineConfig::default();
        assert_eq!(engine.ttl, defaults.ttl);
        assert_eq!(engine.handshake_timeout, defaults.handshake_timeout);
        assert_eq!(engine.store_forward.expiry, defaults.store_forward.expiry);
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
peer_id: "0000a11c"
nickname: alice
listen: 127.0.0.1:7001
neighbors:
  - 0000b0b0@127.0.0.1:7002
  - 0xc0ffee@127.0.0.1:7003
data_dir: /var/lib/meshlink
engine:
  ttl: 5
  mtu: 256
  handshake_timeout: 10s
  store_forward_expiry: 1h
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let mut config = NodeConfig::load_from_file(temp_file.path()).unwrap();
        // Keep the assertions independent of the test process environment
        config.peer_id = "0000a11c".to_string();
        config.nickname = "alice".to_string();

        assert_eq!(config.local_peer().unwrap(), PeerId(0xa11c));
        assert_eq!(
            config.neighbor_addrs().unwrap(),
            vec![
                (PeerId(0xb0b0), "127.0.0.1:7002".parse().unwrap()),
                (PeerId(0xc0ffee), "127.0.0.1:7003".parse().unwrap()),
            ]
        );

        let engine = config.engine_config().unwrap();
        assert_eq!(engine.ttl, 5);
        assert_eq!(engine.mtu, 256);
        assert_eq!(engine.handshake_timeout, Duration::from_secs(10));
        assert_eq!(engine.store_forward.expiry, Duration::from_secs(3600));
        assert_eq!(engine.max_neighbors, EngineConfig::default().max_neighbors);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig::load_from_file(dir.path().join("absent.yaml")).unwrap();
        assert_eq!(config.engine, EngineSection::default());
    }

    #[test]
    fn test_unparsable_file_is_an_error() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"neighbors: {not: [a list").unwrap();
        assert!(NodeConfig::load_from_file(temp_file.path()).is_err());
    }

    #[test]
    fn test_environment_overrides() {
        let vars: HashMap<&str, &str> = [
            ("MESH_PEER_ID", "00000042"),
            ("MESH_NICKNAME", "bob"),
            ("MESH_DATA_DIR", "/tmp/mesh-bob"),
        ]
        .into_iter()
        .collect();

        let mut config = NodeConfig::default();
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.local_peer().unwrap(), PeerId(0x42));
        assert_eq!(config.nickname, "bob");
        assert_eq!(config.listen, NodeConfig::default().listen);
        match config.storage_mode() {
            StorageMode::File { path } => {
                assert_eq!(path, PathBuf::from("/tmp/mesh-bob").join(STORE_FILE_NAME))
            }
            other => panic!("unexpected storage mode {:?}", other),
        }
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(parse_peer_id("00000000").is_err());
        assert!(parse_peer_id("not-hex").is_err());
        assert!(parse_neighbor("127.0.0.1:7000").is_err());
        assert!(parse_neighbor("00000002@nowhere").is_err());

        let mut config = NodeConfig::default();
        config.engine.ttl = 9;
        assert!(config.engine_config().is_err());

        let mut config = NodeConfig::default();
        config.engine.handshake_timeout = "soon".to_string();
        assert!(config.engine_config().is_err());
    }
}
