//! # Crypto Service Trait (RFC 9001)
//!
//! The state machine never touches keying material. It asks a
//! [`CryptoService`] to seal, open and mask packets for a connection,
//! naming the connection by the cid its keys were derived from.
//!
//! Key schedule and AEAD choice are entirely the service's business;
//! the only property the core depends on is that a packet sealed at a
//! level opens at the same level once the peer has installed it.

#![forbid(unsafe_code)]

use crate::error::Result;
use crate::types::{ConnectionId, PacketNumber, PacketNumberSpace};
use bytes::Bytes;

/// Encryption Level (RFC 9001 Section 4)
///
/// Corresponds to TLS encryption levels and packet number spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EncryptionLevel {
    /// Initial packets (keys derived from the client's first DCID)
    Initial,

    /// 0-RTT packets (never installed by this endpoint)
    ZeroRtt,

    /// Handshake packets
    Handshake,

    /// 1-RTT packets
    OneRtt,
}

impl EncryptionLevel {
    /// Levels in the order their packets are coalesced into a datagram
    pub const SEND_ORDER: [EncryptionLevel; 3] = [
        EncryptionLevel::Initial,
        EncryptionLevel::Handshake,
        EncryptionLevel::OneRtt,
    ];

    /// Map encryption level to packet number space
    pub fn packet_number_space(&self) -> PacketNumberSpace {
        match self {
            EncryptionLevel::Initial => PacketNumberSpace::Initial,
            EncryptionLevel::Handshake => PacketNumberSpace::Handshake,
            EncryptionLevel::ZeroRtt | EncryptionLevel::OneRtt => {
                PacketNumberSpace::ApplicationData
            }
        }
    }

    /// Lowercase name used in logs and scripts
    pub fn name(&self) -> &'static str {
        match self {
            EncryptionLevel::Initial => "initial",
            EncryptionLevel::ZeroRtt => "zero_rtt",
            EncryptionLevel::Handshake => "handshake",
            EncryptionLevel::OneRtt => "one_rtt",
        }
    }
}

/// AEAD tag length of every QUIC v1 cipher suite
pub const AEAD_TAG_LEN: usize = 16;

/// Bytes of ciphertext sampled for header protection (RFC 9001 Section 5.4.2)
pub const HP_SAMPLE_LEN: usize = 16;

/// Initial salt for QUIC version 1 (RFC 9001 Section 5.2)
///
/// ```text
/// 38762cf7f55934b34d179ae6a4c80cadccbb7f0a
/// ```
pub const INITIAL_SALT_V1: &[u8] = &[
    0x38, 0x76, 0x2c, 0xf7, 0xf5, 0x59, 0x34, 0xb3, 0x4d, 0x17, 0x9a, 0xe6, 0xa4, 0xc8, 0x0c,
    0xad, 0xcc, 0xbb, 0x7f, 0x0a,
];

/// Packet protection provider.
///
/// `cid` is the connection's key handle: the Destination Connection ID
/// of the client's first Initial packet. Both endpoints of a connection
/// therefore address the same key set.
pub trait CryptoService {
    /// Derive Initial keys from `salt` and `ikm` (the client's first DCID).
    fn derive_initial_keys(&mut self, cid: &ConnectionId, salt: &[u8], ikm: &[u8]) -> Result<()>;

    /// Install keys for a level once the handshake has produced them.
    fn install_keys(&mut self, cid: &ConnectionId, level: EncryptionLevel) -> Result<()>;

    fn has_keys(&self, cid: &ConnectionId, level: EncryptionLevel) -> bool;

    /// Forget keys for a level, or for every level when the connection closes.
    fn discard_keys(&mut self, cid: &ConnectionId, level: Option<EncryptionLevel>);

    /// Seal a packet payload; output is `plaintext.len() + tag_len()` bytes.
    fn encrypt_aead(
        &self,
        cid: &ConnectionId,
        level: EncryptionLevel,
        plaintext: &[u8],
        packet_number: PacketNumber,
        associated_data: &[u8],
    ) -> Result<Bytes>;

    /// Open a packet payload. None when keys are missing or the tag fails.
    fn decrypt_aead(
        &self,
        cid: &ConnectionId,
        level: EncryptionLevel,
        ciphertext: &[u8],
        packet_number: PacketNumber,
        associated_data: &[u8],
    ) -> Option<Bytes>;

    /// Five-byte header protection mask for a 16-byte sample.
    fn header_protection_mask(
        &self,
        cid: &ConnectionId,
        level: EncryptionLevel,
        sample: &[u8],
    ) -> Option<[u8; 5]>;

    fn tag_len(&self) -> usize {
        AEAD_TAG_LEN
    }
}
