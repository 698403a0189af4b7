//! Password-derived channel keys and channel message sealing.
//!
//! Channel keys come from Argon2id over the channel password with a salt
//! derived from the channel name, so every member derives the same key with
//! no handshake. Anyone holding the password can read and write the channel.
//!
//! ```text
//! +-----------------+----------------+-----------------------------+
//! | u32 channel_id  | 12-byte nonce  | ciphertext || 16-byte tag  |
//! +-----------------+----------------+-----------------------------+
//! ```

use crate::error::MeshError;
use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use argon2::{Algorithm, Argon2, Params, Version};
use bytes::{BufMut, Bytes, BytesMut};
use mesh_wire::PeerId;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;

/// Channel nonce size
pub const CHANNEL_NONCE_SIZE: usize = 12;

/// Bytes a sealed channel message adds to its plaintext
pub const CHANNEL_OVERHEAD: usize = 4 + CHANNEL_NONCE_SIZE + 16;

/// Argon2id cost parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelKdfParams {
    /// Memory cost in KiB
    pub memory_kib: u32,
    /// Number of passes
    pub iterations: u32,
    /// Degree of parallelism
    pub parallelism: u32,
}

impl Default for ChannelKdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 19 * 1024,
            iterations: 2,
            parallelism: 1,
        }
    }
}

/// Channel identifier: first four bytes of SHA-256 over the name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(pub u32);

impl ChannelId {
    /// Identifier for a channel name
    pub fn from_name(name: &str) -> Self {
        let hash = Sha256::digest(name.as_bytes());
        Self(u32::from_be_bytes([hash[0], hash[1], hash[2], hash[3]]))
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Symmetric channel key
#[derive(Clone, PartialEq, Eq)]
pub struct ChannelKey([u8; 32]);

impl ChannelKey {
    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ChannelKey([redacted])")
    }
}

/// Salt for a channel: SHA-256("channel:" || name), first 16 bytes
pub fn channel_salt(name: &str) -> [u8; 16] {
    let mut hasher = Sha256::new();
    hasher.update(b"channel:");
    hasher.update(name.as_bytes());
    let hash = hasher.finalize();
    let mut salt = [0u8; 16];
    salt.copy_from_slice(&hash[..16]);
    salt
}

/// Derive a channel key from a password with Argon2id
pub fn derive_channel_key(
    password: &str,
    salt: &[u8],
    params: &ChannelKdfParams,
) -> Result<ChannelKey, MeshError> {
    let params = Params::new(
        params.memory_kib,
        params.iterations,
        params.parallelism,
        Some(32),
    )
    .map_err(|e| MeshError::KeyDerivation(e.to_string()))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = [0u8; 32];
    argon
        .hash_password_into(password.as_bytes(), salt, &mut key)
        .map_err(|e| MeshError::KeyDerivation(e.to_string()))?;
    Ok(ChannelKey(key))
}

fn aad(channel: ChannelId, source: PeerId) -> [u8; 8] {
    let mut aad = [0u8; 8];
    aad[..4].copy_from_slice(&channel.0.to_be_bytes());
    aad[4..].copy_from_slice(&source.0.to_be_bytes());
    aad
}

/// Seal a channel message from `source`
pub fn encrypt_for_channel(
    key: &ChannelKey,
    channel: ChannelId,
    source: PeerId,
    plaintext: &[u8],
) -> Result<Bytes, MeshError> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| MeshError::KeyDerivation(e.to_string()))?;

    let mut nonce = [0u8; CHANNEL_NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);

    let aad = aad(channel, source);
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: &aad,
            },
        )
        .map_err(|_| MeshError::AuthenticationFailure)?;

    let mut out = BytesMut::with_capacity(4 + CHANNEL_NONCE_SIZE + ciphertext.len());
    out.put_u32(channel.0);
    out.put_slice(&nonce);
    out.put_slice(&ciphertext);
    Ok(out.freeze())
}

/// Channel id of a sealed payload, without decrypting
pub fn peek_channel_id(payload: &[u8]) -> Option<ChannelId> {
    if payload.len() < CHANNEL_OVERHEAD {
        return None;
    }
    Some(ChannelId(u32::from_be_bytes([
        payload[0], payload[1], payload[2], payload[3],
    ])))
}

/// Open a channel message from `source`
pub fn decrypt_for_channel(
    key: &ChannelKey,
    source: PeerId,
    payload: &[u8],
) -> Result<(ChannelId, Vec<u8>), MeshError> {
    let channel = peek_channel_id(payload).ok_or(MeshError::AuthenticationFailure)?;
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| MeshError::KeyDerivation(e.to_string()))?;

    let nonce = Nonce::from_slice(&payload[4..4 + CHANNEL_NONCE_SIZE]);
    let aad = aad(channel, source);
    let plaintext = cipher
        .decrypt(
            nonce,
            Payload {
                msg: &payload[4 + CHANNEL_NONCE_SIZE..],
                aad: &aad,
            },
        )
        .map_err(|_| MeshError::AuthenticationFailure)?;
    Ok((channel, plaintext))
}

/// A joined channel
#[derive(Debug, Clone)]
pub struct Channel {
    /// Identifier
    pub id: ChannelId,
    /// Name as joined
    pub name: String,
    /// Derived key
    pub key: ChannelKey,
    /// Peers heard on the channel
    pub members: BTreeSet<PeerId>,
    /// Whether the application should keep message history
    pub retention: bool,
}

impl Channel {
    /// Join a channel by deriving its key from the password
    pub fn join(name: &str, password: &str, params: &ChannelKdfParams) -> Result<Self, MeshError> {
        let key = derive_channel_key(password, &channel_salt(name), params)?;
        Ok(Self {
            id: ChannelId::from_name(name),
            name: name.to_string(),
            key,
            members: BTreeSet::new(),
            retention: false,
        })
    }

    /// Persistable membership record
    pub fn record(&self) -> ChannelRecord {
        ChannelRecord {
            name: self.name.clone(),
            retention: self.retention,
            members: self.members.iter().map(|p| p.0).collect(),
        }
    }
}

/// Channel membership as persisted; holds no key material
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRecord {
    /// Channel name
    pub name: String,
    /// Retention flag
    pub retention: bool,
    /// Known member peer ids
    pub members: Vec<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    // Cheap parameters so tests run fast
    fn params() -> ChannelKdfParams {
        ChannelKdfParams {
            memory_kib: 64,
            iterations: 1,
            parallelism: 1,
        }
    }

    #[test]
    fn test_correct_password_decrypts_wrong_password_fails() {
        let name = "#general";
        let good = Channel::join(name, "correct-horse", &params()).unwrap();
        let same = Channel::join(name, "correct-horse", &params()).unwrap();
        let bad = Channel::join(name, "wrong-password", &params()).unwrap();

        let sealed = encrypt_for_channel(&good.key, good.id, PeerId(7), b"meet at noon").unwrap();

        let (id, plaintext) = decrypt_for_channel(&same.key, PeerId(7), &sealed).unwrap();
        assert_eq!(id, good.id);
        assert_eq!(plaintext, b"meet at noon");

        assert!(matches!(
            decrypt_for_channel(&bad.key, PeerId(7), &sealed),
            Err(MeshError::AuthenticationFailure)
        ));
    }

    #[test]
    fn test_sender_is_bound() {
        let channel = Channel::join("#ops", "pw", &params()).unwrap();
        let sealed = encrypt_for_channel(&channel.key, channel.id, PeerId(7), b"x").unwrap();
        assert!(decrypt_for_channel(&channel.key, PeerId(8), &sealed).is_err());
    }

    #[test]
    fn test_salt_and_id_depend_on_name() {
        assert_ne!(channel_salt("#a"), channel_salt("#b"));
        assert_eq!(ChannelId::from_name("#a"), ChannelId::from_name("#a"));
        assert_ne!(ChannelId::from_name("#a"), ChannelId::from_name("#b"));

        let a = derive_channel_key("pw", &channel_salt("#a"), &params()).unwrap();
        let b = derive_channel_key("pw", &channel_salt("#b"), &params()).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_layout_and_nonce_freshness() {
        let channel = Channel::join("#x", "pw", &params()).unwrap();
        let one = encrypt_for_channel(&channel.key, channel.id, PeerId(1), b"same").unwrap();
        let two = encrypt_for_channel(&channel.key, channel.id, PeerId(1), b"same").unwrap();

        assert_eq!(one.len(), 4 + CHANNEL_OVERHEAD);
        assert_eq!(peek_channel_id(&one), Some(channel.id));
        assert_ne!(one, two);
    }

    #[test]
    fn test_invalid_kdf_params() {
        let bad = ChannelKdfParams {
            memory_kib: 0,
            iterations: 0,
            parallelism: 0,
        };
        assert!(matches!(
            derive_channel_key("pw", &channel_salt("#x"), &bad),
            Err(MeshError::KeyDerivation(_))
        ));
    }

    #[test]
    fn test_record_has_no_key() {
        let mut channel = Channel::join("#x", "pw", &params()).unwrap();
        channel.members.insert(PeerId(3));
        channel.retention = true;
        let record = channel.record();
        assert_eq!(record.members, vec![3]);
        assert!(record.retention);
        assert!(peek_channel_id(&[0u8; 5]).is_none());
    }
}
