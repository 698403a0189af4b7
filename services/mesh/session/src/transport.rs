//! Transport security for established sessions.
//!
//! Every private message carries an explicit 64-bit counter ahead of the
//! ChaCha20-Poly1305 ciphertext. Counters are strictly increasing per
//! direction and each is accepted at most once through a sliding replay
//! window, so reordering by the mesh is tolerated while reuse is not.
//!
//! ```text
//! +------------------+-------------------------------+
//! | u64 counter (BE) | ciphertext || 16-byte tag     |
//! +------------------+-------------------------------+
//! ```

use crate::error::NoiseError;
use crate::handshake::HandshakeRole;
use bytes::{BufMut, Bytes, BytesMut};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use std::fmt;
use std::time::{Duration, Instant};

/// Size of the AEAD tag
pub const TAG_SIZE: usize = 16;

/// Size of the explicit counter prefix
pub const COUNTER_SIZE: usize = 8;

/// Bytes a sealed message adds to its plaintext
pub const TRANSPORT_OVERHEAD: usize = COUNTER_SIZE + TAG_SIZE;

/// Replay window width in messages
pub const REPLAY_WINDOW_SIZE: u64 = 64;

/// ChaCha20-Poly1305 key with its own nonce counter
#[derive(Clone)]
pub struct CipherState {
    key: Option<[u8; 32]>,
    nonce: u64,
}

impl CipherState {
    /// Cipher with a key and a fresh counter
    pub fn new(key: [u8; 32]) -> Self {
        Self {
            key: Some(key),
            nonce: 0,
        }
    }

    /// Cipher with no key; seal and open pass data through unchanged
    pub fn empty() -> Self {
        Self {
            key: None,
            nonce: 0,
        }
    }

    /// Install a new key and reset the counter
    pub fn initialize_key(&mut self, key: [u8; 32]) {
        self.key = Some(key);
        self.nonce = 0;
    }

    /// Whether a key is installed
    pub fn has_key(&self) -> bool {
        self.key.is_some()
    }

    /// Next counter value that [`CipherState::seal`] will use
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    /// Seal with the internal counter, returning `(counter, ciphertext)`
    pub fn seal(&mut self, plaintext: &[u8], aad: &[u8]) -> Result<(u64, Vec<u8>), NoiseError> {
        let Some(key) = self.key else {
            return Ok((self.nonce, plaintext.to_vec()));
        };
        if self.nonce == u64::MAX {
            return Err(NoiseError::NonceOverflow);
        }
        let counter = self.nonce;
        self.nonce += 1;

        let cipher =
            ChaCha20Poly1305::new_from_slice(&key).map_err(|_| NoiseError::EncryptionFailed)?;
        let ciphertext = cipher
            .encrypt(
                &Self::counter_to_nonce(counter),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| NoiseError::EncryptionFailed)?;
        Ok((counter, ciphertext))
    }

    /// Open with the internal counter (handshake payloads, strictly in order)
    pub fn open_next(&mut self, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, NoiseError> {
        if self.key.is_none() {
            return Ok(ciphertext.to_vec());
        }
        if self.nonce == u64::MAX {
            return Err(NoiseError::NonceOverflow);
        }
        let plaintext = self.open_with_counter(ciphertext, self.nonce, aad)?;
        self.nonce += 1;
        Ok(plaintext)
    }

    /// Open with an explicit counter taken from the wire
    pub fn open_with_counter(
        &self,
        ciphertext: &[u8],
        counter: u64,
        aad: &[u8],
    ) -> Result<Vec<u8>, NoiseError> {
        let Some(key) = self.key else {
            return Ok(ciphertext.to_vec());
        };
        if ciphertext.len() < TAG_SIZE {
            return Err(NoiseError::MessageTooShort {
                expected: TAG_SIZE,
                got: ciphertext.len(),
            });
        }

        let cipher =
            ChaCha20Poly1305::new_from_slice(&key).map_err(|_| NoiseError::DecryptionFailed)?;
        cipher
            .decrypt(
                &Self::counter_to_nonce(counter),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| NoiseError::DecryptionFailed)
    }

    /// Noise nonce: 4 zero bytes then the little-endian counter
    fn counter_to_nonce(counter: u64) -> Nonce {
        let mut nonce_bytes = [0u8; 12];
        nonce_bytes[4..12].copy_from_slice(&counter.to_le_bytes());
        *Nonce::from_slice(&nonce_bytes)
    }
}

impl fmt::Debug for CipherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherState")
            .field("nonce", &self.nonce)
            .field("has_key", &self.key.is_some())
            .field("key", &"[redacted]")
            .finish()
    }
}

/// 64-entry sliding window over received counters
///
/// `check` is side-effect free; `accept` commits only after the AEAD tag
/// verified, so forged counters cannot advance the window.
#[derive(Debug, Clone, Default)]
pub struct ReplayWindow {
    highest: Option<u64>,
    bitmap: u64,
}

impl ReplayWindow {
    /// Empty window
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `counter` would be accepted
    pub fn check(&self, counter: u64) -> bool {
        let Some(highest) = self.highest else {
            return true;
        };
        if counter > highest {
            return true;
        }
        let behind = highest - counter;
        if behind >= REPLAY_WINDOW_SIZE {
            return false;
        }
        self.bitmap & (1u64 << behind) == 0
    }

    /// Record `counter` as received
    pub fn accept(&mut self, counter: u64) {
        match self.highest {
            None => {
                self.highest = Some(counter);
                self.bitmap = 1;
            }
            Some(highest) if counter > highest => {
                let ahead = counter - highest;
                self.bitmap = if ahead >= REPLAY_WINDOW_SIZE {
                    0
                } else {
                    self.bitmap << ahead
                };
                self.bitmap |= 1;
                self.highest = Some(counter);
            }
            Some(highest) => {
                let behind = highest - counter;
                if behind < REPLAY_WINDOW_SIZE {
                    self.bitmap |= 1u64 << behind;
                }
            }
        }
    }

    /// Highest counter accepted so far
    pub fn highest(&self) -> Option<u64> {
        self.highest
    }
}

/// Keys and counters of one Established session
#[derive(Debug, Clone)]
pub struct TransportSession {
    send: CipherState,
    recv: CipherState,
    replay: ReplayWindow,
    remote_static: [u8; 32],
    handshake_hash: [u8; 32],
    established_at: Instant,
    role: HandshakeRole,
    messages_sent: u64,
}

impl TransportSession {
    pub(crate) fn new(
        send: CipherState,
        recv: CipherState,
        remote_static: [u8; 32],
        handshake_hash: [u8; 32],
        established_at: Instant,
        role: HandshakeRole,
    ) -> Self {
        Self {
            send,
            recv,
            replay: ReplayWindow::new(),
            remote_static,
            handshake_hash,
            established_at,
            role,
            messages_sent: 0,
        }
    }

    /// Seal a plaintext into `counter || ciphertext`
    pub fn encrypt(&mut self, plaintext: &[u8], aad: &[u8]) -> Result<Bytes, NoiseError> {
        let (counter, ciphertext) = self.send.seal(plaintext, aad)?;
        self.messages_sent += 1;

        let mut out = BytesMut::with_capacity(COUNTER_SIZE + ciphertext.len());
        out.put_u64(counter);
        out.put_slice(&ciphertext);
        Ok(out.freeze())
    }

    /// Open a `counter || ciphertext` payload
    ///
    /// Failures leave the session untouched; only the one message is lost.
    pub fn decrypt(&mut self, payload: &[u8], aad: &[u8]) -> Result<Vec<u8>, NoiseError> {
        if payload.len() < TRANSPORT_OVERHEAD {
            return Err(NoiseError::MessageTooShort {
                expected: TRANSPORT_OVERHEAD,
                got: payload.len(),
            });
        }
        let mut counter_bytes = [0u8; COUNTER_SIZE];
        counter_bytes.copy_from_slice(&payload[..COUNTER_SIZE]);
        let counter = u64::from_be_bytes(counter_bytes);

        if !self.replay.check(counter) {
            return Err(NoiseError::ReplayDetected(counter));
        }
        let plaintext = self
            .recv
            .open_with_counter(&payload[COUNTER_SIZE..], counter, aad)?;
        self.replay.accept(counter);
        Ok(plaintext)
    }

    /// Whether the session has carried enough traffic or lived long enough
    /// to warrant a fresh handshake
    pub fn needs_rekey(&self, now: Instant, after_messages: u64, after: Duration) -> bool {
        self.messages_sent >= after_messages
            || now.saturating_duration_since(self.established_at) >= after
    }

    /// Remote static public key proven during the handshake
    pub fn remote_static(&self) -> &[u8; 32] {
        &self.remote_static
    }

    /// Transcript hash of the handshake that created this session
    pub fn handshake_hash(&self) -> &[u8; 32] {
        &self.handshake_hash
    }

    /// Messages sealed so far
    pub fn messages_sent(&self) -> u64 {
        self.messages_sent
    }

    /// When the session became Established
    pub fn established_at(&self) -> Instant {
        self.established_at
    }

    /// Our side of the handshake that created this session
    pub fn role(&self) -> HandshakeRole {
        self.role
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (TransportSession, TransportSession) {
        let now = Instant::now();
        let a = TransportSession::new(
            CipherState::new([1; 32]),
            CipherState::new([2; 32]),
            [9; 32],
            [0; 32],
            now,
            HandshakeRole::Initiator,
        );
        let b = TransportSession::new(
            CipherState::new([2; 32]),
            CipherState::new([1; 32]),
            [8; 32],
            [0; 32],
            now,
            HandshakeRole::Responder,
        );
        (a, b)
    }

    #[test]
    fn test_encrypt_decrypt_with_aad() {
        let (mut a, mut b) = pair();
        let sealed = a.encrypt(b"hello", b"hdr").unwrap();
        assert_eq!(sealed.len(), 5 + TRANSPORT_OVERHEAD);
        assert_eq!(&sealed[..8], &0u64.to_be_bytes());

        assert_eq!(b.decrypt(&sealed, b"hdr").unwrap(), b"hello");
    }

    #[test]
    fn test_wrong_aad_or_tamper_fails_without_breaking_session() {
        let (mut a, mut b) = pair();
        let first = a.encrypt(b"one", b"hdr").unwrap();
        assert_eq!(b.decrypt(&first, b"other"), Err(NoiseError::DecryptionFailed));

        let mut tampered = first.to_vec();
        let last = tampered.len() - 1;
        tampered[last] ^= 0x01;
        assert_eq!(b.decrypt(&tampered, b"hdr"), Err(NoiseError::DecryptionFailed));

        // The genuine packet still opens after the failures
        assert_eq!(b.decrypt(&first, b"hdr").unwrap(), b"one");
    }

    #[test]
    fn test_replay_rejected() {
        let (mut a, mut b) = pair();
        let sealed = a.encrypt(b"once", b"").unwrap();
        b.decrypt(&sealed, b"").unwrap();
        assert_eq!(b.decrypt(&sealed, b""), Err(NoiseError::ReplayDetected(0)));
    }

    #[test]
    fn test_out_of_order_within_window() {
        let (mut a, mut b) = pair();
        let sealed: Vec<_> = (0..5).map(|i| a.encrypt(&[i], b"").unwrap()).collect();

        for i in [4usize, 0, 2, 1, 3] {
            assert_eq!(b.decrypt(&sealed[i], b"").unwrap(), vec![i as u8]);
        }
    }

    #[test]
    fn test_counters_never_repeat() {
        let (mut a, _) = pair();
        let counters: Vec<u64> = (0..10)
            .map(|_| {
                let s = a.encrypt(b"x", b"").unwrap();
                u64::from_be_bytes(s[..8].try_into().unwrap())
            })
            .collect();
        assert_eq!(counters, (0..10).collect::<Vec<_>>());
        assert_eq!(a.messages_sent(), 10);
    }

    #[test]
    fn test_replay_window_edges() {
        let mut w = ReplayWindow::new();
        assert!(w.check(100));
        w.accept(100);
        assert!(!w.check(100));
        assert!(w.check(99));
        assert!(w.check(100 - 63));
        assert!(!w.check(100 - 64));

        w.accept(300);
        assert!(!w.check(100));
        assert!(w.check(299));
        assert_eq!(w.highest(), Some(300));
    }

    #[test]
    fn test_short_payload() {
        let (_, mut b) = pair();
        assert!(matches!(
            b.decrypt(&[0u8; 10], b""),
            Err(NoiseError::MessageTooShort { .. })
        ));
    }

    #[test]
    fn test_needs_rekey() {
        let (mut a, _) = pair();
        let start = a.established_at();
        assert!(!a.needs_rekey(start, 2, Duration::from_secs(60)));
        a.encrypt(b"1", b"").unwrap();
        a.encrypt(b"2", b"").unwrap();
        assert!(a.needs_rekey(start, 2, Duration::from_secs(60)));

        let (b, _) = pair();
        let later = b.established_at() + Duration::from_secs(61);
        assert!(b.needs_rekey(later, 1000, Duration::from_secs(60)));
    }
}
