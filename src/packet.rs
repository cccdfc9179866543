//! # Packet Codec
//!
//! Encoding and decoding of the three wire packet kinds.
//!
//! ```text
//! packet        = masking-iv(16) || masked(static-header || authdata) || message
//! static-header = protocol-id(6) || version(2) || flag(1) || nonce(12) || authdata-size(2)
//! ```
//!
//! | Flag | Kind | Authdata |
//! |------|------|----------|
//! | 0 | Message | `src-id(32)` |
//! | 1 | Challenge (WHOAREYOU) | `id-nonce(16) \|\| enr-seq(8)` |
//! | 2 | Handshake | `src-id(32) \|\| sig-size(1) \|\| eph-key-size(1) \|\| id-signature \|\| eph-pubkey \|\| [record]` |
//!
//! The masked part is encrypted with AES-128-CTR keyed by the first 16 bytes
//! of the *destination* node id, so decoding always needs the local node id.
//!
//! Both directions are pure: the masking IV is part of [`Packet`], so encoding
//! the same value twice yields identical bytes.

use rand::RngCore;
use rand::rngs::OsRng;

use crate::crypto::{apply_masking, masking_key, HeaderMask, NONCE_LENGTH};
use crate::identity::NodeId;

/// Protocol identifier at the start of every static header.
pub const PROTOCOL_ID: &[u8; 6] = b"discv5";

/// The only supported wire version.
pub const PROTOCOL_VERSION: u16 = 0x0001;

pub const MASKING_IV_SIZE: usize = 16;
pub const STATIC_HEADER_SIZE: usize = 23;
pub const ID_NONCE_SIZE: usize = 16;

pub const MESSAGE_AUTHDATA_SIZE: usize = 32;
pub const CHALLENGE_AUTHDATA_SIZE: usize = 24;
pub const MIN_HANDSHAKE_AUTHDATA_SIZE: usize = 34;

/// Smallest well-formed packet: a challenge with no message.
pub const MIN_PACKET_SIZE: usize = MASKING_IV_SIZE + STATIC_HEADER_SIZE + CHALLENGE_AUTHDATA_SIZE;

/// Largest packet accepted or produced, bounded by a conservative UDP MTU.
pub const MAX_PACKET_SIZE: usize = 1280;

/// Size of the random body sent to solicit a challenge from a peer.
const RANDOM_MESSAGE_SIZE: usize = 44;

/// Nonce carried in the static header.
pub type Nonce = [u8; NONCE_LENGTH];

// ============================================================================
// Errors
// ============================================================================

/// Reasons a datagram is rejected as malformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketError {
    TooSmall(usize),
    TooLarge(usize),
    InvalidProtocolId,
    UnsupportedVersion(u16),
    InvalidFlag(u8),
    /// The header's authdata-size does not fit the packet kind.
    AuthDataSize { flag: u8, size: usize },
    /// The header claims more authdata than the datagram carries.
    Truncated,
    /// Handshake signature and key sizes overrun the authdata.
    InvalidHandshakeAuthData,
}

impl std::fmt::Display for PacketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PacketError::TooSmall(len) => write!(f, "packet too small: {} bytes", len),
            PacketError::TooLarge(len) => write!(f, "packet too large: {} bytes", len),
            PacketError::InvalidProtocolId => write!(f, "invalid protocol id"),
            PacketError::UnsupportedVersion(v) => write!(f, "unsupported version {:#06x}", v),
            PacketError::InvalidFlag(flag) => write!(f, "invalid packet flag {}", flag),
            PacketError::AuthDataSize { flag, size } => {
                write!(f, "authdata size {} invalid for flag {}", size, flag)
            }
            PacketError::Truncated => write!(f, "authdata extends past end of packet"),
            PacketError::InvalidHandshakeAuthData => write!(f, "inconsistent handshake authdata"),
        }
    }
}

impl std::error::Error for PacketError {}

// ============================================================================
// Packet Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketKind {
    Message = 0,
    Challenge = 1,
    Handshake = 2,
}

impl TryFrom<u8> for PacketKind {
    type Error = PacketError;

    fn try_from(flag: u8) -> Result<Self, Self::Error> {
        match flag {
            0 => Ok(PacketKind::Message),
            1 => Ok(PacketKind::Challenge),
            2 => Ok(PacketKind::Handshake),
            other => Err(PacketError::InvalidFlag(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthData {
    Message {
        src_id: NodeId,
    },
    Challenge {
        id_nonce: [u8; ID_NONCE_SIZE],
        enr_seq: u64,
    },
    Handshake {
        src_id: NodeId,
        id_signature: Vec<u8>,
        ephemeral_public: Vec<u8>,
        /// Encoded record of the sender, present when the recipient's copy is stale.
        record: Option<Vec<u8>>,
    },
}

impl AuthData {
    pub fn kind(&self) -> PacketKind {
        match self {
            AuthData::Message { .. } => PacketKind::Message,
            AuthData::Challenge { .. } => PacketKind::Challenge,
            AuthData::Handshake { .. } => PacketKind::Handshake,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            AuthData::Message { src_id } => src_id.as_bytes().to_vec(),
            AuthData::Challenge { id_nonce, enr_seq } => {
                let mut out = Vec::with_capacity(CHALLENGE_AUTHDATA_SIZE);
                out.extend_from_slice(id_nonce);
                out.extend_from_slice(&enr_seq.to_be_bytes());
                out
            }
            AuthData::Handshake {
                src_id,
                id_signature,
                ephemeral_public,
                record,
            } => {
                let record_len = record.as_ref().map_or(0, Vec::len);
                let mut out = Vec::with_capacity(
                    MIN_HANDSHAKE_AUTHDATA_SIZE + id_signature.len() + ephemeral_public.len() + record_len,
                );
                out.extend_from_slice(src_id.as_bytes());
                // Lengths above u8::MAX are rejected by `Packet::encode`.
                out.push(u8::try_from(id_signature.len()).unwrap_or(u8::MAX));
                out.push(u8::try_from(ephemeral_public.len()).unwrap_or(u8::MAX));
                out.extend_from_slice(id_signature);
                out.extend_from_slice(ephemeral_public);
                if let Some(record) = record {
                    out.extend_from_slice(record);
                }
                out
            }
        }
    }

    fn decode(kind: PacketKind, data: &[u8]) -> Result<Self, PacketError> {
        let size_error = PacketError::AuthDataSize {
            flag: kind as u8,
            size: data.len(),
        };
        match kind {
            PacketKind::Message => {
                if data.len() != MESSAGE_AUTHDATA_SIZE {
                    return Err(size_error);
                }
                let src_id = NodeId::from_slice(data).map_err(|_| size_error)?;
                Ok(AuthData::Message { src_id })
            }
            PacketKind::Challenge => {
                if data.len() != CHALLENGE_AUTHDATA_SIZE {
                    return Err(size_error);
                }
                let mut id_nonce = [0u8; ID_NONCE_SIZE];
                id_nonce.copy_from_slice(&data[..ID_NONCE_SIZE]);
                let mut seq = [0u8; 8];
                seq.copy_from_slice(&data[ID_NONCE_SIZE..]);
                Ok(AuthData::Challenge {
                    id_nonce,
                    enr_seq: u64::from_be_bytes(seq),
                })
            }
            PacketKind::Handshake => {
                if data.len() < MIN_HANDSHAKE_AUTHDATA_SIZE {
                    return Err(size_error);
                }
                let src_id = NodeId::from_slice(&data[..32]).map_err(|_| size_error)?;
                let sig_size = data[32] as usize;
                let eph_size = data[33] as usize;
                let keys_end = MIN_HANDSHAKE_AUTHDATA_SIZE + sig_size + eph_size;
                if keys_end > data.len() {
                    return Err(PacketError::InvalidHandshakeAuthData);
                }
                let sig_end = MIN_HANDSHAKE_AUTHDATA_SIZE + sig_size;
                let record = &data[keys_end..];
                Ok(AuthData::Handshake {
                    src_id,
                    id_signature: data[MIN_HANDSHAKE_AUTHDATA_SIZE..sig_end].to_vec(),
                    ephemeral_public: data[sig_end..keys_end].to_vec(),
                    record: (!record.is_empty()).then(|| record.to_vec()),
                })
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub masking_iv: [u8; MASKING_IV_SIZE],
    pub nonce: Nonce,
    pub authdata: AuthData,
    /// Encrypted message, empty for challenges.
    pub message: Vec<u8>,
}

fn random_iv() -> [u8; MASKING_IV_SIZE] {
    let mut iv = [0u8; MASKING_IV_SIZE];
    OsRng.fill_bytes(&mut iv);
    iv
}

pub fn random_nonce() -> Nonce {
    let mut nonce = [0u8; NONCE_LENGTH];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

impl Packet {
    /// Message packet. `message` is filled in after encryption, since the
    /// packet header is the associated data.
    pub fn new_message(src_id: NodeId, nonce: Nonce) -> Self {
        Self {
            masking_iv: random_iv(),
            nonce,
            authdata: AuthData::Message { src_id },
            message: Vec::new(),
        }
    }

    /// Message packet with a random body, sent when no session exists so the
    /// recipient answers with a challenge.
    pub fn new_random(src_id: NodeId) -> Self {
        let mut message = vec![0u8; RANDOM_MESSAGE_SIZE];
        OsRng.fill_bytes(&mut message);
        Self {
            masking_iv: random_iv(),
            nonce: random_nonce(),
            authdata: AuthData::Message { src_id },
            message,
        }
    }

    /// Challenge echoing the nonce of the packet that could not be decrypted.
    pub fn new_challenge(request_nonce: Nonce, id_nonce: [u8; ID_NONCE_SIZE], enr_seq: u64) -> Self {
        Self {
            masking_iv: random_iv(),
            nonce: request_nonce,
            authdata: AuthData::Challenge { id_nonce, enr_seq },
            message: Vec::new(),
        }
    }

    pub fn new_handshake(
        src_id: NodeId,
        nonce: Nonce,
        id_signature: Vec<u8>,
        ephemeral_public: Vec<u8>,
        record: Option<Vec<u8>>,
    ) -> Self {
        Self {
            masking_iv: random_iv(),
            nonce,
            authdata: AuthData::Handshake {
                src_id,
                id_signature,
                ephemeral_public,
                record,
            },
            message: Vec::new(),
        }
    }

    pub fn kind(&self) -> PacketKind {
        self.authdata.kind()
    }

    /// Source node id for message and handshake packets.
    pub fn src_id(&self) -> Option<NodeId> {
        match &self.authdata {
            AuthData::Message { src_id } | AuthData::Handshake { src_id, .. } => Some(*src_id),
            AuthData::Challenge { .. } => None,
        }
    }

    fn static_header(&self, authdata_size: usize) -> [u8; STATIC_HEADER_SIZE] {
        let mut header = [0u8; STATIC_HEADER_SIZE];
        header[..6].copy_from_slice(PROTOCOL_ID);
        header[6..8].copy_from_slice(&PROTOCOL_VERSION.to_be_bytes());
        header[8] = self.kind() as u8;
        header[9..21].copy_from_slice(&self.nonce);
        header[21..23].copy_from_slice(&(authdata_size as u16).to_be_bytes());
        header
    }

    /// `masking-iv || static-header || authdata`, unmasked.
    ///
    /// Serves as associated data for message encryption and as the transcript
    /// signed during a handshake.
    pub fn challenge_data(&self) -> Vec<u8> {
        let authdata = self.authdata.encode();
        let mut out = Vec::with_capacity(MASKING_IV_SIZE + STATIC_HEADER_SIZE + authdata.len());
        out.extend_from_slice(&self.masking_iv);
        out.extend_from_slice(&self.static_header(authdata.len()));
        out.extend_from_slice(&authdata);
        out
    }

    /// Serialize and mask the packet for `dest_id`.
    ///
    /// Fails when a handshake field overflows its one-byte length or the
    /// packet exceeds [`MAX_PACKET_SIZE`].
    pub fn encode(&self, dest_id: &NodeId) -> Result<Vec<u8>, PacketError> {
        if let AuthData::Handshake {
            id_signature,
            ephemeral_public,
            ..
        } = &self.authdata
            && (id_signature.len() > u8::MAX as usize || ephemeral_public.len() > u8::MAX as usize)
        {
            return Err(PacketError::InvalidHandshakeAuthData);
        }
        let authdata = self.authdata.encode();
        let len = MASKING_IV_SIZE + STATIC_HEADER_SIZE + authdata.len() + self.message.len();
        if len > MAX_PACKET_SIZE {
            return Err(PacketError::TooLarge(len));
        }
        let mut masked = Vec::with_capacity(STATIC_HEADER_SIZE + authdata.len());
        masked.extend_from_slice(&self.static_header(authdata.len()));
        masked.extend_from_slice(&authdata);
        apply_masking(&masking_key(dest_id), &self.masking_iv, &mut masked);

        let mut out = Vec::with_capacity(MASKING_IV_SIZE + masked.len() + self.message.len());
        out.extend_from_slice(&self.masking_iv);
        out.extend_from_slice(&masked);
        out.extend_from_slice(&self.message);
        Ok(out)
    }

    /// Unmask and parse a datagram addressed to `local_id`.
    pub fn decode(local_id: &NodeId, data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < MIN_PACKET_SIZE {
            return Err(PacketError::TooSmall(data.len()));
        }
        if data.len() > MAX_PACKET_SIZE {
            return Err(PacketError::TooLarge(data.len()));
        }

        let mut masking_iv = [0u8; MASKING_IV_SIZE];
        masking_iv.copy_from_slice(&data[..MASKING_IV_SIZE]);
        let mut mask = HeaderMask::new(&masking_key(local_id), &masking_iv);

        let header_end = MASKING_IV_SIZE + STATIC_HEADER_SIZE;
        let mut header = [0u8; STATIC_HEADER_SIZE];
        header.copy_from_slice(&data[MASKING_IV_SIZE..header_end]);
        mask.apply(&mut header);

        if &header[..6] != PROTOCOL_ID {
            return Err(PacketError::InvalidProtocolId);
        }
        let version = u16::from_be_bytes([header[6], header[7]]);
        if version != PROTOCOL_VERSION {
            return Err(PacketError::UnsupportedVersion(version));
        }
        let kind = PacketKind::try_from(header[8])?;
        let mut nonce = [0u8; NONCE_LENGTH];
        nonce.copy_from_slice(&header[9..21]);
        let authdata_size = u16::from_be_bytes([header[21], header[22]]) as usize;

        let authdata_end = header_end + authdata_size;
        if authdata_end > data.len() {
            return Err(PacketError::Truncated);
        }
        let mut authdata = data[header_end..authdata_end].to_vec();
        mask.apply(&mut authdata);
        let authdata = AuthData::decode(kind, &authdata)?;

        Ok(Self {
            masking_iv,
            nonce,
            authdata,
            message: data[authdata_end..].to_vec(),
        })
    }
}
