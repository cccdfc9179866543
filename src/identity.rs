//! # Node Identity and Signed Records
//!
//! This module defines the identity types shared by every other layer:
//!
//! - [`Keypair`]: Ed25519 signing keypair of the local node
//! - [`NodeId`]: 32-byte identifier, `SHA-256(public key)`, used for XOR routing
//! - [`NodeRecord`]: signed, versioned record binding a public key to an address
//!
//! ## Identity Model
//!
//! A node is identified by the hash of its Ed25519 public key. The record that
//! carries the public key is self-certifying: whoever can produce a valid
//! signature for it owns the identifier derived from it. Records carry a
//! monotonic sequence number so peers can tell which of two records is newer.
//!
//! ## Distance
//!
//! | Function | Meaning |
//! |----------|---------|
//! | [`NodeId::xor_distance`] | `a XOR b` as a big-endian 256-bit integer |
//! | [`NodeId::log2_distance`] | index of the highest set bit of the XOR, 0 when equal |
//! | [`distance_cmp`] | ordering of two XOR distances |

use std::net::{IpAddr, SocketAddr};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::crypto::{SignatureError, RECORD_SIGNATURE_DOMAIN};

/// Largest encoded record accepted from the wire.
pub const MAX_RECORD_SIZE: usize = 300;

/// Length of a node identifier in bytes.
pub const NODE_ID_LENGTH: usize = 32;

// ============================================================================
// Keypair
// ============================================================================

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn node_id(&self) -> NodeId {
        NodeId::from_public_key(&self.public_key_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Scalar bytes of the signing key, used for X25519 agreement with
    /// ephemeral keys.
    pub(crate) fn agreement_scalar(&self) -> [u8; 32] {
        self.signing_key.to_scalar_bytes()
    }

    /// X25519 shared secret with a remote ephemeral public key.
    pub fn ecdh(&self, remote_ephemeral_public: &[u8]) -> Result<[u8; 32], crate::crypto::CryptoError> {
        crate::crypto::agree_with_ephemeral(self, remote_ephemeral_public)
    }

    /// Create a signed record for this keypair.
    pub fn create_record(&self, seq: u64, addr: Option<SocketAddr>) -> NodeRecord {
        let public_key = self.public_key_bytes();
        let payload = NodeRecord::build_signed_payload(&public_key, seq, addr);
        let signature = crate::crypto::sign_with_domain(self, RECORD_SIGNATURE_DOMAIN, &payload);
        NodeRecord {
            public_key,
            seq,
            addr,
            signature,
        }
    }

    /// Produce the successor of `record` with a new address.
    ///
    /// The sequence number is bumped so peers holding the old record replace it.
    pub fn update_record_addr(&self, record: &NodeRecord, addr: SocketAddr) -> NodeRecord {
        self.create_record(record.seq.saturating_add(1), Some(addr))
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("node_id", &self.node_id())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Node Identifier
// ============================================================================

/// Error returned when a node identifier has the wrong length or format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidNodeId {
    /// Input was not valid hex.
    NotHex,
    /// Input did not decode to exactly 32 bytes.
    WrongLength(usize),
}

impl std::fmt::Display for InvalidNodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvalidNodeId::NotHex => write!(f, "node id is not valid hex"),
            InvalidNodeId::WrongLength(len) => {
                write!(f, "node id must be {} bytes, got {}", NODE_ID_LENGTH, len)
            }
        }
    }
}

impl std::error::Error for InvalidNodeId {}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId([u8; 32]);

impl NodeId {
    #[inline]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, InvalidNodeId> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| InvalidNodeId::WrongLength(bytes.len()))?;
        Ok(Self(arr))
    }

    /// Derive the identifier owned by an Ed25519 public key.
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        let digest = Sha256::digest(public_key);
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Self(out)
    }

    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        if getrandom::getrandom(&mut bytes).is_err() {
            rand::Rng::fill(&mut rand::thread_rng(), &mut bytes);
        }
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    #[inline]
    pub fn xor_distance(&self, other: &NodeId) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Position of the highest set bit of `self XOR other`, counted from 1 at
    /// the least significant bit. Equal identifiers are at distance 0.
    #[inline]
    pub fn log2_distance(&self, other: &NodeId) -> u16 {
        let dist = self.xor_distance(other);
        for (byte_idx, byte) in dist.iter().enumerate() {
            if *byte != 0 {
                let leading = byte.leading_zeros() as usize;
                return (256 - byte_idx * 8 - leading) as u16;
            }
        }
        0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, InvalidNodeId> {
        let bytes = hex::decode(s).map_err(|_| InvalidNodeId::NotHex)?;
        Self::from_slice(&bytes)
    }

    /// First eight bytes in hex, for log fields.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

/// Compare two XOR distances.
///
/// # Example
/// ```ignore
/// let dist_a = target.xor_distance(&a);
/// let dist_b = target.xor_distance(&b);
/// if distance_cmp(&dist_a, &dist_b) == Ordering::Less {
///     // a is closer to target than b
/// }
/// ```
#[inline]
pub fn distance_cmp(a: &[u8; 32], b: &[u8; 32]) -> std::cmp::Ordering {
    a.cmp(b)
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", self.short())
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::str::FromStr for NodeId {
    type Err = InvalidNodeId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl From<[u8; 32]> for NodeId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

// ============================================================================
// Node Address
// ============================================================================

/// A node identifier together with the socket address it was reached at.
///
/// Sessions, challenges and in-flight requests are all keyed by this pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeAddress {
    pub node_id: NodeId,
    pub socket_addr: SocketAddr,
}

impl NodeAddress {
    pub fn new(node_id: NodeId, socket_addr: SocketAddr) -> Self {
        Self { node_id, socket_addr }
    }
}

impl std::fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.node_id.short(), self.socket_addr)
    }
}

// ============================================================================
// Signed Node Record
// ============================================================================

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub public_key: [u8; 32],
    pub seq: u64,
    pub addr: Option<SocketAddr>,
    pub signature: Vec<u8>,
}

impl NodeRecord {
    pub fn node_id(&self) -> NodeId {
        NodeId::from_public_key(&self.public_key)
    }

    pub fn verifying_key(&self) -> Result<VerifyingKey, SignatureError> {
        VerifyingKey::from_bytes(&self.public_key).map_err(|_| SignatureError::InvalidPublicKey)
    }

    pub fn node_address(&self) -> Option<NodeAddress> {
        self.addr.map(|addr| NodeAddress::new(self.node_id(), addr))
    }

    /// Verify that the record was signed by the key it carries.
    pub fn verify(&self) -> Result<(), SignatureError> {
        let payload = Self::build_signed_payload(&self.public_key, self.seq, self.addr);
        crate::crypto::verify_with_domain(
            &self.public_key,
            RECORD_SIGNATURE_DOMAIN,
            &payload,
            &self.signature,
        )
    }

    /// Verify an Ed25519 signature made by this record's key.
    pub fn verify_signature(&self, message: &[u8], signature: &[u8]) -> Result<(), SignatureError> {
        let key = self.verifying_key()?;
        let sig_bytes: [u8; 64] = signature
            .try_into()
            .map_err(|_| SignatureError::InvalidLength)?;
        key.verify(message, &Signature::from_bytes(&sig_bytes))
            .map_err(|_| SignatureError::VerificationFailed)
    }

    /// Canonical payload covered by the record signature.
    ///
    /// Format: public_key(32) || seq(8, BE) || addr_tag(1) || [ip || port(2, BE)]
    #[doc(hidden)]
    pub fn build_signed_payload(public_key: &[u8; 32], seq: u64, addr: Option<SocketAddr>) -> Vec<u8> {
        let mut data = Vec::with_capacity(32 + 8 + 1 + 18);
        data.extend_from_slice(public_key);
        data.extend_from_slice(&seq.to_be_bytes());
        match addr {
            None => data.push(0),
            Some(addr) => {
                match addr.ip() {
                    IpAddr::V4(v4) => {
                        data.push(4);
                        data.extend_from_slice(&v4.octets());
                    }
                    IpAddr::V6(v6) => {
                        data.push(6);
                        data.extend_from_slice(&v6.octets());
                    }
                }
                data.extend_from_slice(&addr.port().to_be_bytes());
            }
        }
        data
    }

    pub fn encode(&self) -> Vec<u8> {
        // Key, address and signature are bounded far below the limit.
        crate::messages::serialize_bounded(self).unwrap_or_default()
    }

    /// Decode and bound-check a record received from the wire.
    ///
    /// The signature is not checked here; callers that admit the record call
    /// [`NodeRecord::verify`].
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() > MAX_RECORD_SIZE {
            return None;
        }
        let record: NodeRecord = crate::messages::deserialize_bounded(bytes).ok()?;
        if record.signature.len() > 64 {
            return None;
        }
        Some(record)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.encode())
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        hex::decode(s).ok().and_then(|bytes| Self::decode(&bytes))
    }
}

impl std::fmt::Debug for NodeRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRecord")
            .field("node_id", &self.node_id())
            .field("seq", &self.seq)
            .field("addr", &self.addr)
            .finish()
    }
}
