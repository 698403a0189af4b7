//! Error taxonomy for the mesh engine.

use mesh_storage::StorageError;
use mesh_wire::{PeerId, WireError};
use thiserror::Error;

/// Errors from the Noise handshake and transport ciphers
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NoiseError {
    /// Operation not valid in the current handshake state
    #[error("wrong handshake state: expected {expected}, got {got}")]
    WrongState {
        /// State the operation needs
        expected: &'static str,
        /// State the handshake is in
        got: &'static str,
    },

    /// Handshake has not produced keys yet
    #[error("handshake not complete")]
    HandshakeNotComplete,

    /// Public key rejected (low-order point)
    #[error("invalid public key")]
    InvalidPublicKey,

    /// AEAD open failed
    #[error("decryption failed")]
    DecryptionFailed,

    /// AEAD seal failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// Message shorter than its fixed parts
    #[error("message too short: expected at least {expected}, got {got}")]
    MessageTooShort {
        /// Minimum length
        expected: usize,
        /// Actual length
        got: usize,
    },

    /// Send counter exhausted
    #[error("nonce overflow")]
    NonceOverflow,

    /// Counter already accepted or older than the replay window
    #[error("replay detected: counter {0} already seen or too old")]
    ReplayDetected(u64),
}

/// Mesh engine errors
///
/// The first six variants are the network-facing taxonomy; every one of them
/// ends in a drop, a session reset, or a bounded retry. The rest are returned
/// to local callers of the engine API.
#[derive(Debug, Error)]
pub enum MeshError {
    /// Packet or payload failed to decode
    #[error("malformed packet: {0}")]
    MalformedPacket(#[from] WireError),

    /// Handshake aborted; the peer may be retried
    #[error("handshake with {peer} failed: {reason}")]
    HandshakeFailure {
        /// Remote peer
        peer: PeerId,
        /// What went wrong
        reason: String,
    },

    /// AEAD verification or replay check failed for one packet
    #[error("authentication failure")]
    AuthenticationFailure,

    /// Partial reassembly discarded after inactivity
    #[error("fragment reassembly timed out")]
    FragmentTimeout,

    /// Hop budget reached zero before the destination
    #[error("route exhausted")]
    RouteExhausted,

    /// Store-and-forward entries were evicted to make room
    #[error("store-and-forward overflow: {evicted} entries evicted")]
    CacheOverflow {
        /// Number of entries dropped undelivered
        evicted: usize,
    },

    /// Channel has not been joined
    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    /// Application payload exceeds what fragmentation can carry
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    /// Destination cannot be used for this kind of message
    #[error("invalid destination {0}")]
    InvalidDestination(PeerId),

    /// Too many recent handshake failures with the peer
    #[error("handshake retries exhausted for {0}")]
    RetryLimited(PeerId),

    /// Channel key derivation rejected its parameters
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    /// Link refused a frame
    #[error("link error: {0}")]
    Link(#[from] crate::link::LinkError),

    /// Persistence collaborator failed
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl From<NoiseError> for MeshError {
    fn from(err: NoiseError) -> Self {
        match err {
            NoiseError::DecryptionFailed | NoiseError::ReplayDetected(_) => {
                MeshError::AuthenticationFailure
            }
            NoiseError::MessageTooShort { .. } => MeshError::AuthenticationFailure,
            other => MeshError::HandshakeFailure {
                peer: PeerId::BROADCAST,
                reason: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noise_errors_map_to_taxonomy() {
        assert!(matches!(
            MeshError::from(NoiseError::ReplayDetected(4)),
            MeshError::AuthenticationFailure
        ));
        assert!(matches!(
            MeshError::from(NoiseError::InvalidPublicKey),
            MeshError::HandshakeFailure { .. }
        ));
        assert!(matches!(
            MeshError::from(WireError::Malformed),
            MeshError::MalformedPacket(_)
        ));
    }

    #[test]
    fn test_display() {
        assert_eq!(
            MeshError::CacheOverflow { evicted: 3 }.to_string(),
            "store-and-forward overflow: 3 entries evicted"
        );
        assert_eq!(
            NoiseError::ReplayDetected(9).to_string(),
            "replay detected: counter 9 already seen or too old"
        );
    }
}
