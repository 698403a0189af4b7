//! Noise XX handshake between two peers.
//!
//! Neither side needs to know the other's static key in advance; both prove
//! possession of their static key during the exchange.
//!
//! ```text
//!   -> e
//!   <- e, ee, s, es, payload
//!   -> s, se, payload
//! ```
//!
//! Payloads of messages 2 and 3 carry the sender's nickname, encrypted under
//! the handshake keys. After message 3 both sides split the chaining key into
//! one cipher per direction.

use crate::error::NoiseError;
use crate::transport::{CipherState, TransportSession, TAG_SIZE};
use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt;
use std::time::Instant;
use x25519_dalek::{PublicKey, StaticSecret};

/// Protocol name mixed into the initial handshake hash
pub(crate) const PROTOCOL_NAME: &[u8] = b"Noise_XX_25519_ChaChaPoly_SHA256";

/// Prologue binding handshakes to this protocol
const PROLOGUE: &[u8] = b"meshlink/1";

/// Size of an X25519 public key
pub const DH_LEN: usize = 32;

/// Size of message 1
pub const HANDSHAKE_MSG1_SIZE: usize = DH_LEN;

/// Smallest valid message 2 (ephemeral, encrypted static, empty payload)
pub const HANDSHAKE_MSG2_MIN: usize = DH_LEN + DH_LEN + TAG_SIZE + TAG_SIZE;

/// Smallest valid message 3 (encrypted static, empty payload)
pub const HANDSHAKE_MSG3_MIN: usize = DH_LEN + TAG_SIZE + TAG_SIZE;

/// Longest nickname carried in a handshake payload
pub const MAX_NICKNAME_LEN: usize = 64;

/// Role in the handshake
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeRole {
    /// We sent message 1
    Initiator,
    /// We answered message 1
    Responder,
}

impl fmt::Display for HandshakeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeRole::Initiator => write!(f, "initiator"),
            HandshakeRole::Responder => write!(f, "responder"),
        }
    }
}

/// Progress through the three messages
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeProgress {
    /// Nothing sent or received
    Initial,
    /// Initiator sent message 1
    SentMessage1,
    /// Responder sent message 2
    SentMessage2,
    /// Keys available
    Complete,
}

impl HandshakeProgress {
    fn as_str(self) -> &'static str {
        match self {
            HandshakeProgress::Initial => "initial",
            HandshakeProgress::SentMessage1 => "sent_message_1",
            HandshakeProgress::SentMessage2 => "sent_message_2",
            HandshakeProgress::Complete => "complete",
        }
    }
}

/// Chaining key, transcript hash and the current handshake cipher
struct SymmetricState {
    ck: [u8; 32],
    h: [u8; 32],
    cipher: CipherState,
}

impl SymmetricState {
    fn initialize() -> Self {
        let h = if PROTOCOL_NAME.len() <= 32 {
            let mut h = [0u8; 32];
            h[..PROTOCOL_NAME.len()].copy_from_slice(PROTOCOL_NAME);
            h
        } else {
            Sha256::digest(PROTOCOL_NAME).into()
        };

        let mut state = Self {
            ck: h,
            h,
            cipher: CipherState::empty(),
        };
        state.mix_hash(PROLOGUE);
        state
    }

    fn mix_hash(&mut self, data: &[u8]) {
        let mut hasher = Sha256::new();
        hasher.update(self.h);
        hasher.update(data);
        self.h = hasher.finalize().into();
    }

    fn hkdf2(&self, input_key_material: &[u8]) -> Result<([u8; 32], [u8; 32]), NoiseError> {
        let hk = Hkdf::<Sha256>::new(Some(&self.ck), input_key_material);
        let mut output = [0u8; 64];
        hk.expand(&[], &mut output)
            .map_err(|_| NoiseError::EncryptionFailed)?;

        let mut first = [0u8; 32];
        let mut second = [0u8; 32];
        first.copy_from_slice(&output[..32]);
        second.copy_from_slice(&output[32..]);
        Ok((first, second))
    }

    fn mix_key(&mut self, input_key_material: &[u8]) -> Result<(), NoiseError> {
        let (ck, key) = self.hkdf2(input_key_material)?;
        self.ck = ck;
        self.cipher.initialize_key(key);
        Ok(())
    }

    fn encrypt_and_hash(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let h = self.h;
        let (_, ciphertext) = self.cipher.seal(plaintext, &h)?;
        self.mix_hash(&ciphertext);
        Ok(ciphertext)
    }

    fn decrypt_and_hash(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let h = self.h;
        let plaintext = self.cipher.open_next(ciphertext, &h)?;
        self.mix_hash(ciphertext);
        Ok(plaintext)
    }

    fn split(&self) -> Result<(CipherState, CipherState), NoiseError> {
        let (k1, k2) = self.hkdf2(&[])?;
        Ok((CipherState::new(k1), CipherState::new(k2)))
    }
}

/// Per-peer XX handshake state machine
pub struct HandshakeState {
    role: HandshakeRole,
    progress: HandshakeProgress,
    symmetric: SymmetricState,
    local_static: StaticSecret,
    local_ephemeral: Option<StaticSecret>,
    remote_static: Option<PublicKey>,
    remote_ephemeral: Option<PublicKey>,
    remote_payload: Option<Vec<u8>>,
}

impl HandshakeState {
    fn new(role: HandshakeRole, local_static: StaticSecret) -> Self {
        Self {
            role,
            progress: HandshakeProgress::Initial,
            symmetric: SymmetricState::initialize(),
            local_static,
            local_ephemeral: None,
            remote_static: None,
            remote_ephemeral: None,
            remote_payload: None,
        }
    }

    /// Start a handshake we will initiate
    pub fn new_initiator(local_static: StaticSecret) -> Self {
        Self::new(HandshakeRole::Initiator, local_static)
    }

    /// Start a handshake answering a peer's message 1
    pub fn new_responder(local_static: StaticSecret) -> Self {
        Self::new(HandshakeRole::Responder, local_static)
    }

    /// Our role
    pub fn role(&self) -> HandshakeRole {
        self.role
    }

    /// Current progress
    pub fn progress(&self) -> HandshakeProgress {
        self.progress
    }

    /// Whether keys can be split
    pub fn is_complete(&self) -> bool {
        self.progress == HandshakeProgress::Complete
    }

    /// Our ephemeral public key, once generated
    pub fn local_ephemeral(&self) -> Option<[u8; 32]> {
        self.local_ephemeral
            .as_ref()
            .map(|e| PublicKey::from(e).to_bytes())
    }

    /// Remote static key, once proven
    pub fn remote_static(&self) -> Option<[u8; 32]> {
        self.remote_static.map(|k| k.to_bytes())
    }

    /// Decrypted payload from the remote side's last message
    pub fn remote_payload(&self) -> Option<&[u8]> {
        self.remote_payload.as_deref()
    }

    fn expect_state(
        &self,
        role: HandshakeRole,
        progress: HandshakeProgress,
    ) -> Result<(), NoiseError> {
        if self.role != role {
            return Err(NoiseError::WrongState {
                expected: match role {
                    HandshakeRole::Initiator => "initiator",
                    HandshakeRole::Responder => "responder",
                },
                got: match self.role {
                    HandshakeRole::Initiator => "initiator",
                    HandshakeRole::Responder => "responder",
                },
            });
        }
        if self.progress != progress {
            return Err(NoiseError::WrongState {
                expected: progress.as_str(),
                got: self.progress.as_str(),
            });
        }
        Ok(())
    }

    fn dh(secret: &StaticSecret, public: &PublicKey) -> Result<[u8; 32], NoiseError> {
        let shared = secret.diffie_hellman(public);
        if !shared.was_contributory() {
            return Err(NoiseError::InvalidPublicKey);
        }
        Ok(shared.to_bytes())
    }

    fn read_key(bytes: &[u8]) -> PublicKey {
        let mut key = [0u8; DH_LEN];
        key.copy_from_slice(&bytes[..DH_LEN]);
        PublicKey::from(key)
    }

    fn ephemeral(&self) -> Result<&StaticSecret, NoiseError> {
        self.local_ephemeral
            .as_ref()
            .ok_or(NoiseError::HandshakeNotComplete)
    }

    /// Write message 1: `e`
    pub fn write_message_1(&mut self) -> Result<Vec<u8>, NoiseError> {
        self.expect_state(HandshakeRole::Initiator, HandshakeProgress::Initial)?;

        let e = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let e_pub = PublicKey::from(&e).to_bytes();
        self.symmetric.mix_hash(&e_pub);
        // Empty payload, no key yet: mixes an empty string
        self.symmetric.encrypt_and_hash(&[])?;
        self.local_ephemeral = Some(e);

        self.progress = HandshakeProgress::SentMessage1;
        Ok(e_pub.to_vec())
    }

    /// Read message 1 as responder
    pub fn read_message_1(&mut self, message: &[u8]) -> Result<(), NoiseError> {
        self.expect_state(HandshakeRole::Responder, HandshakeProgress::Initial)?;
        if message.len() != HANDSHAKE_MSG1_SIZE {
            return Err(NoiseError::MessageTooShort {
                expected: HANDSHAKE_MSG1_SIZE,
                got: message.len(),
            });
        }

        let re = Self::read_key(message);
        self.symmetric.mix_hash(re.as_bytes());
        self.symmetric.decrypt_and_hash(&[])?;
        self.remote_ephemeral = Some(re);
        Ok(())
    }

    /// Write message 2: `e, ee, s, es` plus payload
    pub fn write_message_2(&mut self, payload: &[u8]) -> Result<Vec<u8>, NoiseError> {
        self.expect_state(HandshakeRole::Responder, HandshakeProgress::Initial)?;
        let re = self.remote_ephemeral.ok_or(NoiseError::WrongState {
            expected: "message 1 read",
            got: "initial",
        })?;

        let e = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let e_pub = PublicKey::from(&e).to_bytes();

        let mut message = Vec::with_capacity(HANDSHAKE_MSG2_MIN + payload.len());
        message.extend_from_slice(&e_pub);
        self.symmetric.mix_hash(&e_pub);

        // ee
        let ee = Self::dh(&e, &re)?;
        self.symmetric.mix_key(&ee)?;

        // s
        let s_pub = PublicKey::from(&self.local_static).to_bytes();
        let encrypted_static = self.symmetric.encrypt_and_hash(&s_pub)?;
        message.extend_from_slice(&encrypted_static);

        // es (responder: DH(s, re))
        let es = Self::dh(&self.local_static, &re)?;
        self.symmetric.mix_key(&es)?;

        message.extend_from_slice(&self.symmetric.encrypt_and_hash(payload)?);
        self.local_ephemeral = Some(e);

        self.progress = HandshakeProgress::SentMessage2;
        Ok(message)
    }

    /// Read message 2 as initiator
    pub fn read_message_2(&mut self, message: &[u8]) -> Result<(), NoiseError> {
        self.expect_state(HandshakeRole::Initiator, HandshakeProgress::SentMessage1)?;
        if message.len() < HANDSHAKE_MSG2_MIN {
            return Err(NoiseError::MessageTooShort {
                expected: HANDSHAKE_MSG2_MIN,
                got: message.len(),
            });
        }

        let re = Self::read_key(message);
        self.symmetric.mix_hash(re.as_bytes());

        let ee = Self::dh(self.ephemeral()?, &re)?;
        self.symmetric.mix_key(&ee)?;

        let static_end = DH_LEN + DH_LEN + TAG_SIZE;
        let rs_bytes = self
            .symmetric
            .decrypt_and_hash(&message[DH_LEN..static_end])?;
        let rs = Self::read_key(&rs_bytes);

        // es (initiator: DH(e, rs))
        let es = Self::dh(self.ephemeral()?, &rs)?;
        self.symmetric.mix_key(&es)?;

        let payload = self.symmetric.decrypt_and_hash(&message[static_end..])?;
        self.remote_ephemeral = Some(re);
        self.remote_static = Some(rs);
        self.remote_payload = Some(payload);
        Ok(())
    }

    /// Write message 3: `s, se` plus payload; the initiator is then complete
    pub fn write_message_3(&mut self, payload: &[u8]) -> Result<Vec<u8>, NoiseError> {
        self.expect_state(HandshakeRole::Initiator, HandshakeProgress::SentMessage1)?;
        let re = self.remote_ephemeral.ok_or(NoiseError::WrongState {
            expected: "message 2 read",
            got: "sent_message_1",
        })?;

        let mut message = Vec::with_capacity(HANDSHAKE_MSG3_MIN + payload.len());

        let s_pub = PublicKey::from(&self.local_static).to_bytes();
        message.extend_from_slice(&self.symmetric.encrypt_and_hash(&s_pub)?);

        // se (initiator: DH(s, re))
        let se = Self::dh(&self.local_static, &re)?;
        self.symmetric.mix_key(&se)?;

        message.extend_from_slice(&self.symmetric.encrypt_and_hash(payload)?);

        self.progress = HandshakeProgress::Complete;
        Ok(message)
    }

    /// Read message 3 as responder; the responder is then complete
    pub fn read_message_3(&mut self, message: &[u8]) -> Result<(), NoiseError> {
        self.expect_state(HandshakeRole::Responder, HandshakeProgress::SentMessage2)?;
        if message.len() < HANDSHAKE_MSG3_MIN {
            return Err(NoiseError::MessageTooShort {
                expected: HANDSHAKE_MSG3_MIN,
                got: message.len(),
            });
        }

        let static_end = DH_LEN + TAG_SIZE;
        let rs_bytes = self.symmetric.decrypt_and_hash(&message[..static_end])?;
        let rs = Self::read_key(&rs_bytes);

        // se (responder: DH(e, rs))
        let se = Self::dh(self.ephemeral()?, &rs)?;
        self.symmetric.mix_key(&se)?;

        let payload = self.symmetric.decrypt_and_hash(&message[static_end..])?;
        self.remote_static = Some(rs);
        self.remote_payload = Some(payload);

        self.progress = HandshakeProgress::Complete;
        Ok(())
    }

    /// Split the completed handshake into a transport session
    pub fn into_session(self, now: Instant) -> Result<TransportSession, NoiseError> {
        if !self.is_complete() {
            return Err(NoiseError::HandshakeNotComplete);
        }
        let remote_static = self
            .remote_static
            .ok_or(NoiseError::HandshakeNotComplete)?
            .to_bytes();

        let (c1, c2) = self.symmetric.split()?;
        // Initiator sends with c1, responder with c2
        let (send, recv) = match self.role {
            HandshakeRole::Initiator => (c1, c2),
            HandshakeRole::Responder => (c2, c1),
        };

        Ok(TransportSession::new(
            send,
            recv,
            remote_static,
            self.symmetric.h,
            now,
            self.role,
        ))
    }
}

impl fmt::Debug for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeState")
            .field("role", &self.role)
            .field("progress", &self.progress)
            .field("has_ephemeral", &self.local_ephemeral.is_some())
            .field("has_remote_static", &self.remote_static.is_some())
            .field("has_remote_ephemeral", &self.remote_ephemeral.is_some())
            .finish()
    }
}

/// Resolve two crossing message 1s
///
/// Both sides compare the same pair of ephemeral keys, so exactly one keeps
/// the initiator role. Returns `true` when our attempt survives.
pub fn wins_tie_break(local_ephemeral: &[u8; 32], remote_ephemeral: &[u8; 32]) -> bool {
    local_ephemeral.cmp(remote_ephemeral) == Ordering::Less
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret() -> StaticSecret {
        StaticSecret::random_from_rng(rand::rngs::OsRng)
    }

    fn run(
        alice: StaticSecret,
        bob: StaticSecret,
    ) -> (HandshakeState, HandshakeState) {
        let mut initiator = HandshakeState::new_initiator(alice);
        let mut responder = HandshakeState::new_responder(bob);

        let m1 = initiator.write_message_1().unwrap();
        assert_eq!(m1.len(), HANDSHAKE_MSG1_SIZE);
        responder.read_message_1(&m1).unwrap();

        let m2 = responder.write_message_2(b"bob").unwrap();
        assert_eq!(m2.len(), HANDSHAKE_MSG2_MIN + 3);
        initiator.read_message_2(&m2).unwrap();
        assert_eq!(initiator.remote_payload(), Some(&b"bob"[..]));

        let m3 = initiator.write_message_3(b"alice").unwrap();
        responder.read_message_3(&m3).unwrap();
        assert_eq!(responder.remote_payload(), Some(&b"alice"[..]));

        (initiator, responder)
    }

    #[test]
    fn test_xx_handshake_yields_symmetric_keys() {
        let alice = secret();
        let bob = secret();
        let alice_pub = PublicKey::from(&alice).to_bytes();
        let bob_pub = PublicKey::from(&bob).to_bytes();

        let (initiator, responder) = run(alice, bob);
        assert!(initiator.is_complete());
        assert!(responder.is_complete());
        assert_eq!(initiator.remote_static(), Some(bob_pub));
        assert_eq!(responder.remote_static(), Some(alice_pub));

        let now = Instant::now();
        let mut a = initiator.into_session(now).unwrap();
        let mut b = responder.into_session(now).unwrap();
        assert_eq!(a.handshake_hash(), b.handshake_hash());
        assert_eq!(a.role(), HandshakeRole::Initiator);
        assert_eq!(b.role(), HandshakeRole::Responder);

        let sealed = a.encrypt(b"hello", b"aad").unwrap();
        assert_eq!(b.decrypt(&sealed, b"aad").unwrap(), b"hello");
        let reply = b.encrypt(b"hi back", b"aad").unwrap();
        assert_eq!(a.decrypt(&reply, b"aad").unwrap(), b"hi back");
    }

    #[test]
    fn test_tampered_message_2_fails() {
        let mut initiator = HandshakeState::new_initiator(secret());
        let mut responder = HandshakeState::new_responder(secret());

        let m1 = initiator.write_message_1().unwrap();
        responder.read_message_1(&m1).unwrap();
        let mut m2 = responder.write_message_2(b"bob").unwrap();
        m2[DH_LEN + 3] ^= 0xFF;

        assert_eq!(
            initiator.read_message_2(&m2),
            Err(NoiseError::DecryptionFailed)
        );
    }

    #[test]
    fn test_tampered_message_3_fails() {
        let mut initiator = HandshakeState::new_initiator(secret());
        let mut responder = HandshakeState::new_responder(secret());

        let m1 = initiator.write_message_1().unwrap();
        responder.read_message_1(&m1).unwrap();
        let m2 = responder.write_message_2(b"").unwrap();
        initiator.read_message_2(&m2).unwrap();
        let mut m3 = initiator.write_message_3(b"").unwrap();
        let last = m3.len() - 1;
        m3[last] ^= 0x01;

        assert_eq!(
            responder.read_message_3(&m3),
            Err(NoiseError::DecryptionFailed)
        );
        assert!(!responder.is_complete());
    }

    #[test]
    fn test_out_of_order_messages_rejected() {
        let mut initiator = HandshakeState::new_initiator(secret());
        assert!(matches!(
            initiator.write_message_3(b""),
            Err(NoiseError::WrongState { .. })
        ));

        let mut responder = HandshakeState::new_responder(secret());
        assert!(matches!(
            responder.write_message_1(),
            Err(NoiseError::WrongState { .. })
        ));
        assert!(matches!(
            responder.read_message_1(&[0u8; 5]),
            Err(NoiseError::MessageTooShort { .. })
        ));
        assert!(matches!(
            initiator.into_session(Instant::now()),
            Err(NoiseError::HandshakeNotComplete)
        ));
    }

    #[test]
    fn test_low_order_ephemeral_rejected() {
        let mut responder = HandshakeState::new_responder(secret());
        responder.read_message_1(&[0u8; DH_LEN]).unwrap();
        assert_eq!(
            responder.write_message_2(b""),
            Err(NoiseError::InvalidPublicKey)
        );
    }

    #[test]
    fn test_tie_break_is_antisymmetric() {
        let low = [1u8; 32];
        let high = [2u8; 32];
        assert!(wins_tie_break(&low, &high));
        assert!(!wins_tie_break(&high, &low));
    }
}
