//! # Cryptographic Infrastructure
//!
//! This module provides the primitives used by records, packets and sessions:
//!
//! - **Signatures**: Domain-separated Ed25519 signing and verification for records
//! - **Header masking**: AES-128-CTR keyed by the destination node id
//! - **Key agreement**: X25519 between an ephemeral key and a node's long-term key
//! - **Key derivation**: HKDF-SHA256 salted with the handshake challenge data
//! - **Id signatures**: proof of possession of the long-term key during a handshake
//! - **Message encryption**: AES-128-GCM with the packet header as associated data
//!
//! ## Key Agreement
//!
//! Long-term keys are Ed25519. For agreement the initiator uses the Montgomery
//! form of the remote public key, while the responder uses the scalar of its
//! own signing key against the initiator's ephemeral X25519 key. Both sides
//! arrive at the same 32-byte secret.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Nonce};
use ctr::cipher::{KeyIvInit, StreamCipher};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use crate::identity::{Keypair, NodeId, NodeRecord};

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;

/// Symmetric session key.
pub type SessionKey = [u8; KEY_LENGTH];

/// Length of a session key in bytes.
pub const KEY_LENGTH: usize = 16;

/// Length of the AES-GCM authentication tag appended to every ciphertext.
pub const MAC_LENGTH: usize = 16;

/// Length of the AES-GCM nonce, equal to the packet header nonce.
pub const NONCE_LENGTH: usize = 12;

/// Info prefix for session key derivation.
const KEY_AGREEMENT_STRING: &[u8] = b"discovery v5 key agreement";

/// Prefix of the id-signature input.
const ID_SIGNATURE_TEXT: &[u8] = b"discovery v5 identity proof";

// ============================================================================
// Error Types
// ============================================================================

/// Error type for signature verification failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// Signature is missing (empty).
    Missing,
    /// Signature has invalid length (expected 64 bytes for Ed25519).
    InvalidLength,
    /// Cryptographic verification failed.
    VerificationFailed,
    /// The public key is not a valid Ed25519 point.
    InvalidPublicKey,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::Missing => write!(f, "signature is missing"),
            SignatureError::InvalidLength => write!(f, "signature has invalid length"),
            SignatureError::VerificationFailed => write!(f, "signature verification failed"),
            SignatureError::InvalidPublicKey => write!(f, "invalid public key"),
        }
    }
}

impl std::error::Error for SignatureError {}

/// Failures of the symmetric and key-agreement primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    /// The remote key is not usable for agreement, or the shared secret is degenerate.
    KeyAgreement,
    /// HKDF could not produce the requested output length.
    KeyDerivation,
    /// AEAD sealing failed.
    Encryption,
    /// AEAD opening failed: wrong key, nonce, associated data or tampered ciphertext.
    Decryption,
}

impl std::fmt::Display for CryptoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CryptoError::KeyAgreement => write!(f, "key agreement failed"),
            CryptoError::KeyDerivation => write!(f, "key derivation failed"),
            CryptoError::Encryption => write!(f, "message encryption failed"),
            CryptoError::Decryption => write!(f, "message decryption failed"),
        }
    }
}

impl std::error::Error for CryptoError {}

// ============================================================================
// Domain-Separated Signatures
// ============================================================================

/// Domain separation prefix for node record signatures.
pub const RECORD_SIGNATURE_DOMAIN: &[u8] = b"discv5-record-v1:";

/// Sign data with a domain prefix. Returns the 64-byte Ed25519 signature.
pub fn sign_with_domain(keypair: &Keypair, domain: &[u8], data: &[u8]) -> Vec<u8> {
    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);
    keypair.sign(&prefixed).to_bytes().to_vec()
}

/// Verify a signature made with [`sign_with_domain`].
pub fn verify_with_domain(
    public_key: &[u8; 32],
    domain: &[u8],
    data: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::Missing);
    }
    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| SignatureError::InvalidLength)?;
    let verifying_key =
        VerifyingKey::from_bytes(public_key).map_err(|_| SignatureError::InvalidPublicKey)?;

    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);

    verifying_key
        .verify(&prefixed, &Signature::from_bytes(&sig_bytes))
        .map_err(|_| SignatureError::VerificationFailed)
}

// ============================================================================
// Header Masking
// ============================================================================

/// AES-128-CTR keystream over the masked part of a packet.
///
/// The keystream is consumed across calls, so the header and the authdata can
/// be unmasked in two steps once the authdata size is known.
pub struct HeaderMask {
    cipher: Aes128Ctr,
}

impl HeaderMask {
    pub fn new(key: &[u8; 16], iv: &[u8; 16]) -> Self {
        Self {
            cipher: Aes128Ctr::new(key.into(), iv.into()),
        }
    }

    pub fn apply(&mut self, data: &mut [u8]) {
        self.cipher.apply_keystream(data);
    }
}

/// XOR `data` with the AES-128-CTR keystream for `(key, iv)`.
///
/// Masking and unmasking are the same operation.
pub fn apply_masking(key: &[u8; 16], iv: &[u8; 16], data: &mut [u8]) {
    HeaderMask::new(key, iv).apply(data);
}

/// Masking key for packets addressed to `dest`: its first 16 bytes.
pub fn masking_key(dest: &NodeId) -> [u8; 16] {
    let mut key = [0u8; 16];
    key.copy_from_slice(&dest.as_bytes()[..16]);
    key
}

// ============================================================================
// Key Agreement and Derivation
// ============================================================================

/// Ephemeral X25519 keypair generated for a single handshake.
pub struct EphemeralKey {
    secret: [u8; 32],
    pub public: [u8; 32],
}

impl EphemeralKey {
    pub fn generate() -> Self {
        let mut secret = [0u8; 32];
        OsRng.fill_bytes(&mut secret);
        let public = x25519_dalek::x25519(secret, x25519_dalek::X25519_BASEPOINT_BYTES);
        Self { secret, public }
    }

    /// Shared secret with the long-term key carried by `remote`.
    pub fn agree(&self, remote: &NodeRecord) -> Result<[u8; 32], CryptoError> {
        let key = remote.verifying_key().map_err(|_| CryptoError::KeyAgreement)?;
        let shared = x25519_dalek::x25519(self.secret, key.to_montgomery().to_bytes());
        reject_degenerate(shared)
    }
}

/// Shared secret between the local long-term key and a remote ephemeral key.
pub fn agree_with_ephemeral(keypair: &Keypair, ephemeral_public: &[u8]) -> Result<[u8; 32], CryptoError> {
    let public: [u8; 32] = ephemeral_public
        .try_into()
        .map_err(|_| CryptoError::KeyAgreement)?;
    let shared = x25519_dalek::x25519(keypair.agreement_scalar(), public);
    reject_degenerate(shared)
}

fn reject_degenerate(shared: [u8; 32]) -> Result<[u8; 32], CryptoError> {
    if shared.iter().all(|b| *b == 0) {
        return Err(CryptoError::KeyAgreement);
    }
    Ok(shared)
}

/// Derive `(initiator_key, recipient_key)` from a shared secret.
///
/// `first_id` is always the initiator and `second_id` the recipient, so both
/// sides call this with the same argument order.
pub fn derive_keys(
    secret: &[u8; 32],
    first_id: &NodeId,
    second_id: &NodeId,
    challenge_data: &[u8],
) -> Result<(SessionKey, SessionKey), CryptoError> {
    let mut info = Vec::with_capacity(KEY_AGREEMENT_STRING.len() + 64);
    info.extend_from_slice(KEY_AGREEMENT_STRING);
    info.extend_from_slice(first_id.as_bytes());
    info.extend_from_slice(second_id.as_bytes());

    let hk = Hkdf::<Sha256>::new(Some(challenge_data), secret);
    let mut okm = [0u8; 2 * KEY_LENGTH];
    hk.expand(&info, &mut okm)
        .map_err(|_| CryptoError::KeyDerivation)?;

    let mut initiator_key = [0u8; KEY_LENGTH];
    let mut recipient_key = [0u8; KEY_LENGTH];
    initiator_key.copy_from_slice(&okm[..KEY_LENGTH]);
    recipient_key.copy_from_slice(&okm[KEY_LENGTH..]);
    Ok((initiator_key, recipient_key))
}

// ============================================================================
// Id Signature
// ============================================================================

fn id_signature_input(challenge_data: &[u8], ephemeral_public: &[u8], dest_id: &NodeId) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(ID_SIGNATURE_TEXT);
    hasher.update(challenge_data);
    hasher.update(ephemeral_public);
    hasher.update(dest_id.as_bytes());
    hasher.finalize().into()
}

/// Sign the handshake transcript, proving ownership of the local key.
pub fn sign_id_nonce(
    keypair: &Keypair,
    challenge_data: &[u8],
    ephemeral_public: &[u8],
    dest_id: &NodeId,
) -> Vec<u8> {
    let input = id_signature_input(challenge_data, ephemeral_public, dest_id);
    keypair.sign(&input).to_bytes().to_vec()
}

/// Verify a handshake id-signature against the signer's record.
pub fn verify_id_signature(
    remote: &NodeRecord,
    signature: &[u8],
    challenge_data: &[u8],
    ephemeral_public: &[u8],
    local_id: &NodeId,
) -> Result<(), SignatureError> {
    let input = id_signature_input(challenge_data, ephemeral_public, local_id);
    remote.verify_signature(&input, signature)
}

// ============================================================================
// Message Encryption
// ============================================================================

pub fn encrypt_message(
    key: &SessionKey,
    nonce: &[u8; NONCE_LENGTH],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes128Gcm::new(key.into());
    cipher
        .encrypt(Nonce::from_slice(nonce), Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::Encryption)
}

pub fn decrypt_message(
    key: &SessionKey,
    nonce: &[u8; NONCE_LENGTH],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < MAC_LENGTH {
        return Err(CryptoError::Decryption);
    }
    let cipher = Aes128Gcm::new(key.into());
    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::Decryption)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masking_is_an_involution() {
        let key = [7u8; 16];
        let iv = [9u8; 16];
        let original = b"static header and authdata".to_vec();
        let mut data = original.clone();
        apply_masking(&key, &iv, &mut data);
        assert_ne!(data, original);
        apply_masking(&key, &iv, &mut data);
        assert_eq!(data, original);
    }

    #[test]
    fn split_unmasking_matches_one_shot() {
        let key = [1u8; 16];
        let iv = [2u8; 16];
        let mut whole = vec![0xAAu8; 40];
        apply_masking(&key, &iv, &mut whole);

        let mut split = vec![0xAAu8; 40];
        let mut mask = HeaderMask::new(&key, &iv);
        let (head, tail) = split.split_at_mut(23);
        mask.apply(head);
        mask.apply(tail);
        assert_eq!(split, whole);
    }

    #[test]
    fn both_sides_agree_on_shared_secret() {
        let responder = Keypair::generate();
        let record = responder.create_record(1, None);
        let ephemeral = EphemeralKey::generate();

        let initiator_secret = ephemeral.agree(&record).unwrap();
        let responder_secret = agree_with_ephemeral(&responder, &ephemeral.public).unwrap();
        assert_eq!(initiator_secret, responder_secret);
    }

    #[test]
    fn agreement_rejects_low_order_points() {
        let responder = Keypair::generate();
        assert_eq!(
            agree_with_ephemeral(&responder, &[0u8; 32]),
            Err(CryptoError::KeyAgreement)
        );
        assert_eq!(
            agree_with_ephemeral(&responder, &[1u8; 5]),
            Err(CryptoError::KeyAgreement)
        );
    }

    #[test]
    fn derived_keys_depend_on_every_input() {
        let secret = [3u8; 32];
        let a = NodeId::from_bytes([1u8; 32]);
        let b = NodeId::from_bytes([2u8; 32]);
        let (k1, k2) = derive_keys(&secret, &a, &b, b"challenge").unwrap();
        assert_ne!(k1, k2);

        assert_ne!(derive_keys(&secret, &b, &a, b"challenge").unwrap(), (k1, k2));
        assert_ne!(derive_keys(&secret, &a, &b, b"other").unwrap(), (k1, k2));
        assert_ne!(derive_keys(&[4u8; 32], &a, &b, b"challenge").unwrap(), (k1, k2));
    }

    #[test]
    fn id_signature_binds_destination() {
        let signer = Keypair::generate();
        let record = signer.create_record(1, None);
        let dest = NodeId::random();
        let ephemeral = EphemeralKey::generate();

        let sig = sign_id_nonce(&signer, b"challenge-data", &ephemeral.public, &dest);
        assert!(verify_id_signature(&record, &sig, b"challenge-data", &ephemeral.public, &dest).is_ok());

        let other = NodeId::random();
        assert_eq!(
            verify_id_signature(&record, &sig, b"challenge-data", &ephemeral.public, &other),
            Err(SignatureError::VerificationFailed)
        );
        assert_eq!(
            verify_id_signature(&record, &sig, b"tampered", &ephemeral.public, &dest),
            Err(SignatureError::VerificationFailed)
        );
    }

    #[test]
    fn message_encryption_authenticates_aad() {
        let key = [5u8; 16];
        let nonce = [6u8; 12];
        let ct = encrypt_message(&key, &nonce, b"ping", b"header").unwrap();
        assert_eq!(ct.len(), 4 + MAC_LENGTH);
        assert_eq!(decrypt_message(&key, &nonce, &ct, b"header").unwrap(), b"ping");
        assert_eq!(
            decrypt_message(&key, &nonce, &ct, b"other header"),
            Err(CryptoError::Decryption)
        );
        assert_eq!(
            decrypt_message(&[0u8; 16], &nonce, &ct, b"header"),
            Err(CryptoError::Decryption)
        );
        assert_eq!(decrypt_message(&key, &nonce, &[0u8; 3], b"header"), Err(CryptoError::Decryption));
    }

    #[test]
    fn domain_signatures_do_not_cross_domains() {
        let keypair = Keypair::generate();
        let sig = sign_with_domain(&keypair, RECORD_SIGNATURE_DOMAIN, b"payload");
        let pk = keypair.public_key_bytes();
        assert!(verify_with_domain(&pk, RECORD_SIGNATURE_DOMAIN, b"payload", &sig).is_ok());
        assert_eq!(
            verify_with_domain(&pk, b"other-domain:", b"payload", &sig),
            Err(SignatureError::VerificationFailed)
        );
        assert_eq!(
            verify_with_domain(&pk, RECORD_SIGNATURE_DOMAIN, b"payload", &[]),
            Err(SignatureError::Missing)
        );
        assert_eq!(
            verify_with_domain(&pk, RECORD_SIGNATURE_DOMAIN, b"payload", &sig[..10]),
            Err(SignatureError::InvalidLength)
        );
    }
}
