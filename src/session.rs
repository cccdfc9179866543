//! # Sessions and Handshakes
//!
//! A [`Session`] holds the symmetric keys shared with one remote node address.
//! Sessions are created by one of the two handshake entry points, which return
//! the new session rather than installing it; the [`SessionStore`] owns every
//! installed session and outstanding challenge.
//!
//! ## Handshake
//!
//! ```text
//! initiator                                   responder
//!    | -- Message (random or stale keys) ------> |   no session / decrypt fails
//!    | <------------- Challenge (echoes nonce) - |   challenge recorded
//!    | -- Handshake (sig, eph key, message) ---> |   session installed
//! ```
//!
//! | Side | Entry point |
//! |------|-------------|
//! | initiator | [`Session::encrypt_with_header`] |
//! | responder | [`Session::establish_from_challenge`] |

use std::num::NonZeroUsize;

use lru::LruCache;
use tokio::time::{Duration, Instant};

use crate::crypto::{self, CryptoError, EphemeralKey, SessionKey, SignatureError};
use crate::identity::{Keypair, NodeAddress, NodeId, NodeRecord};
use crate::packet::{random_nonce, Nonce, Packet};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    /// ECDH or key derivation failed.
    KeyAgreement,
    /// AEAD sealing failed.
    Encryption,
    /// The message does not authenticate under any key of the session.
    Decryption,
    /// The handshake id-signature did not verify.
    InvalidSignature,
    /// Neither the challenge nor the handshake carried the remote record.
    MissingRecord,
    /// The record attached to the handshake is malformed, unsigned, or belongs
    /// to another node.
    InvalidRecord,
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::KeyAgreement => write!(f, "key agreement failed"),
            SessionError::Encryption => write!(f, "message encryption failed"),
            SessionError::Decryption => write!(f, "message decryption failed"),
            SessionError::InvalidSignature => write!(f, "invalid handshake signature"),
            SessionError::MissingRecord => write!(f, "no record available for remote node"),
            SessionError::InvalidRecord => write!(f, "invalid remote record"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<CryptoError> for SessionError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::KeyAgreement | CryptoError::KeyDerivation => SessionError::KeyAgreement,
            CryptoError::Encryption => SessionError::Encryption,
            CryptoError::Decryption => SessionError::Decryption,
        }
    }
}

impl From<SignatureError> for SessionError {
    fn from(_: SignatureError) -> Self {
        SessionError::InvalidSignature
    }
}

// ============================================================================
// Session
// ============================================================================

#[derive(Clone, PartialEq, Eq)]
struct Keys {
    encryption_key: SessionKey,
    decryption_key: SessionKey,
}

/// A challenge we sent, awaiting the handshake that answers it.
#[derive(Debug, Clone)]
pub struct Challenge {
    /// Challenge-data of the sent WHOAREYOU packet.
    pub data: Vec<u8>,
    /// The record we held for the remote when the challenge was sent.
    pub remote_record: Option<NodeRecord>,
}

pub struct Session {
    keys: Keys,
    /// Keys replaced by a newer handshake, still accepted for decryption.
    old_keys: Option<Keys>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("rotated", &self.old_keys.is_some())
            .finish_non_exhaustive()
    }
}

impl Session {
    fn new(keys: Keys) -> Self {
        Self { keys, old_keys: None }
    }

    /// Replace the keys with those of a newer session, keeping the current
    /// ones as a decryption fallback.
    pub fn update(&mut self, newer: Session) {
        let previous = std::mem::replace(&mut self.keys, newer.keys);
        self.old_keys = Some(previous);
    }

    /// Encrypt `message` into a Message packet from `src_id`.
    pub fn encrypt_message(&self, src_id: NodeId, message: &[u8]) -> Result<Packet, SessionError> {
        let mut packet = Packet::new_message(src_id, random_nonce());
        let aad = packet.challenge_data();
        packet.message = crypto::encrypt_message(&self.keys.encryption_key, &packet.nonce, message, &aad)?;
        Ok(packet)
    }

    /// Decrypt a message body, falling back to the pre-rotation keys.
    pub fn decrypt_message(
        &mut self,
        nonce: &Nonce,
        ciphertext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, SessionError> {
        match crypto::decrypt_message(&self.keys.decryption_key, nonce, ciphertext, aad) {
            Ok(plaintext) => Ok(plaintext),
            Err(err) => match &self.old_keys {
                Some(old) => Ok(crypto::decrypt_message(&old.decryption_key, nonce, ciphertext, aad)?),
                None => Err(err.into()),
            },
        }
    }

    /// Initiator side: answer a challenge with a Handshake packet carrying
    /// `message`, and return the session it establishes.
    ///
    /// `updated_record` is attached when the challenge showed the remote holds
    /// a stale copy of our record.
    pub fn encrypt_with_header(
        remote: &NodeRecord,
        local_key: &Keypair,
        updated_record: Option<Vec<u8>>,
        challenge_data: &[u8],
        message: &[u8],
    ) -> Result<(Packet, Session), SessionError> {
        let local_id = local_key.node_id();
        let remote_id = remote.node_id();

        let ephemeral = EphemeralKey::generate();
        let secret = ephemeral.agree(remote)?;
        let (initiator_key, recipient_key) =
            crypto::derive_keys(&secret, &local_id, &remote_id, challenge_data)?;
        let keys = Keys {
            encryption_key: initiator_key,
            decryption_key: recipient_key,
        };

        let id_signature = crypto::sign_id_nonce(local_key, challenge_data, &ephemeral.public, &remote_id);
        let mut packet = Packet::new_handshake(
            local_id,
            random_nonce(),
            id_signature,
            ephemeral.public.to_vec(),
            updated_record,
        );
        let aad = packet.challenge_data();
        packet.message = crypto::encrypt_message(&keys.encryption_key, &packet.nonce, message, &aad)?;

        Ok((packet, Session::new(keys)))
    }

    /// Responder side: verify a handshake against the challenge we sent and
    /// derive the session. Returns the freshest valid record of the remote.
    pub fn establish_from_challenge(
        local_key: &Keypair,
        remote_id: &NodeId,
        challenge: &Challenge,
        id_signature: &[u8],
        ephemeral_public: &[u8],
        record: Option<&[u8]>,
    ) -> Result<(Session, NodeRecord), SessionError> {
        let record = select_record(remote_id, challenge.remote_record.as_ref(), record)?;

        crypto::verify_id_signature(
            &record,
            id_signature,
            &challenge.data,
            ephemeral_public,
            &local_key.node_id(),
        )?;

        // Keys are derived only once the signature checks out.
        let secret = local_key.ecdh(ephemeral_public)?;
        let (initiator_key, recipient_key) =
            crypto::derive_keys(&secret, remote_id, &local_key.node_id(), &challenge.data)?;
        let keys = Keys {
            encryption_key: recipient_key,
            decryption_key: initiator_key,
        };
        Ok((Session::new(keys), record))
    }
}

/// Pick between the record we already knew and the one attached to a
/// handshake, preferring the higher sequence number.
fn select_record(
    remote_id: &NodeId,
    known: Option<&NodeRecord>,
    attached: Option<&[u8]>,
) -> Result<NodeRecord, SessionError> {
    let attached = match attached {
        Some(bytes) => {
            let record = NodeRecord::decode(bytes).ok_or(SessionError::InvalidRecord)?;
            if record.node_id() != *remote_id || record.verify().is_err() {
                return Err(SessionError::InvalidRecord);
            }
            Some(record)
        }
        None => None,
    };

    match (known, attached) {
        (Some(known), Some(attached)) if attached.seq > known.seq => Ok(attached),
        (Some(known), _) => Ok(known.clone()),
        (None, Some(attached)) => Ok(attached),
        (None, None) => Err(SessionError::MissingRecord),
    }
}

// ============================================================================
// Session Store
// ============================================================================

struct Expiring<T> {
    value: T,
    expires_at: Instant,
}

/// Established sessions and outstanding challenges, keyed by node address.
///
/// Both maps are bounded LRU caches whose entries also expire a fixed time
/// after insertion.
pub struct SessionStore {
    sessions: LruCache<NodeAddress, Expiring<Session>>,
    challenges: LruCache<NodeAddress, Expiring<Challenge>>,
    session_timeout: Duration,
    challenge_timeout: Duration,
}

impl SessionStore {
    pub fn new(capacity: usize, session_timeout: Duration, challenge_timeout: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            sessions: LruCache::new(capacity),
            challenges: LruCache::new(capacity),
            session_timeout,
            challenge_timeout,
        }
    }

    /// Install a freshly established session.
    ///
    /// If one already exists for the address its keys are rotated in place,
    /// so the previous keys keep decrypting late packets. Returns true when the
    /// address had no session before.
    pub fn establish(&mut self, addr: NodeAddress, session: Session) -> bool {
        let expires_at = Instant::now() + self.session_timeout;
        if let Some(existing) = self.live_session(&addr) {
            existing.value.update(session);
            existing.expires_at = expires_at;
            false
        } else {
            self.sessions.put(addr, Expiring { value: session, expires_at });
            true
        }
    }

    pub fn get_mut(&mut self, addr: &NodeAddress) -> Option<&mut Session> {
        self.live_session(addr).map(|entry| &mut entry.value)
    }

    pub fn contains(&mut self, addr: &NodeAddress) -> bool {
        self.live_session(addr).is_some()
    }

    pub fn remove(&mut self, addr: &NodeAddress) -> Option<Session> {
        self.sessions.pop(addr).map(|entry| entry.value)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn live_session(&mut self, addr: &NodeAddress) -> Option<&mut Expiring<Session>> {
        let expired = self
            .sessions
            .peek(addr)
            .is_some_and(|entry| entry.expires_at <= Instant::now());
        if expired {
            self.sessions.pop(addr);
            return None;
        }
        self.sessions.get_mut(addr)
    }

    pub fn insert_challenge(&mut self, addr: NodeAddress, challenge: Challenge) {
        let expires_at = Instant::now() + self.challenge_timeout;
        self.challenges.put(addr, Expiring { value: challenge, expires_at });
    }

    /// Whether a live challenge is outstanding, without touching LRU order.
    pub fn has_challenge(&self, addr: &NodeAddress) -> bool {
        self.challenges
            .peek(addr)
            .is_some_and(|entry| entry.expires_at > Instant::now())
    }

    pub fn take_challenge(&mut self, addr: &NodeAddress) -> Option<Challenge> {
        self.challenges
            .pop(addr)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.value)
    }

    /// Drop every expired session and challenge, returning the addresses whose
    /// sessions ended.
    pub fn prune_expired(&mut self) -> Vec<NodeAddress> {
        let now = Instant::now();
        let expired: Vec<NodeAddress> = self
            .sessions
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(addr, _)| *addr)
            .collect();
        for addr in &expired {
            self.sessions.pop(addr);
        }

        let stale: Vec<NodeAddress> = self
            .challenges
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(addr, _)| *addr)
            .collect();
        for addr in &stale {
            self.challenges.pop(addr);
        }
        expired
    }

    pub fn clear(&mut self) {
        self.sessions.clear();
        self.challenges.clear();
    }
}
