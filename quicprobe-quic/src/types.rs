//! # Core QUIC Types (RFC 8999, RFC 9000)
//!
//! Identifiers shared by the codec and the state machine: connection IDs,
//! stream IDs, endpoint sides and packet-number spaces.

#![forbid(unsafe_code)]

use bytes::Bytes;

/// Variable-Length Integer (RFC 9000 Section 16)
///
/// Maximum value: 2^62 - 1. Encoding lives in [`crate::buffer::VarIntCodec`].
pub type VarInt = u64;

/// Maximum value for VarInt (2^62 - 1)
pub const VARINT_MAX: u64 = (1u64 << 62) - 1;

/// QUIC version 1 (RFC 9000)
pub const QUIC_VERSION_1: u32 = 0x0000_0001;

/// Minimum size of a datagram carrying a client Initial (RFC 9000 Section 14.1)
pub const MIN_INITIAL_PACKET_SIZE: usize = 1200;

/// Stateless reset token (RFC 9000 Section 10.3)
pub type StatelessResetToken = [u8; 16];

// ============================================================================
// Connection ID (RFC 9000 Section 5.1, RFC 8999 Section 5.3)
// ============================================================================

/// Maximum length of a Connection ID (20 bytes per RFC 9000)
pub const MAX_CID_LENGTH: usize = 20;

/// Connection ID
///
/// Opaque byte string of 0..=20 bytes. Equality, ordering and hashing are
/// by value, so a cid can key any map.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ConnectionId {
    bytes: Bytes,
}

impl ConnectionId {
    /// Returns None if length exceeds MAX_CID_LENGTH
    pub fn new(bytes: Bytes) -> Option<Self> {
        if bytes.len() > MAX_CID_LENGTH {
            return None;
        }
        Some(Self { bytes })
    }

    /// Create from a borrowed slice (copies data)
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        Self::new(Bytes::copy_from_slice(slice))
    }

    /// Eight-byte big-endian cid for an integer identity.
    ///
    /// Scripts and tests name connections by small integers (`0x01`); this
    /// maps them onto a wire-legal cid.
    pub fn from_u64(value: u64) -> Self {
        Self {
            bytes: Bytes::copy_from_slice(&value.to_be_bytes()),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Create an empty (zero-length) connection ID
    pub fn empty() -> Self {
        Self {
            bytes: Bytes::new(),
        }
    }
}

impl core::fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "ConnectionId({})", self)
    }
}

impl core::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for byte in &self.bytes[..] {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

// ============================================================================
// Packet Number (RFC 9000 Section 12.3)
// ============================================================================

/// Packet Number - Monotonically increasing per packet number space
pub type PacketNumber = u64;

/// Packet Number Space (RFC 9000 Section 12.3)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PacketNumberSpace {
    /// Initial packet space (Initial packets)
    Initial = 0,
    /// Handshake packet space (Handshake packets)
    Handshake = 1,
    /// Application data packet space (0-RTT and 1-RTT packets)
    ApplicationData = 2,
}

impl PacketNumberSpace {
    pub const ALL: [PacketNumberSpace; 3] = [
        PacketNumberSpace::Initial,
        PacketNumberSpace::Handshake,
        PacketNumberSpace::ApplicationData,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

// ============================================================================
// Side (Client vs Server)
// ============================================================================

/// Connection endpoint side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    pub fn is_client(self) -> bool {
        matches!(self, Side::Client)
    }

    pub fn is_server(self) -> bool {
        matches!(self, Side::Server)
    }
}

// ============================================================================
// Stream ID (RFC 9000 Section 2.1)
// ============================================================================

/// Stream ID
///
/// The two least significant bits encode initiator and direction:
/// - Bit 0: Initiator (0=client, 1=server)
/// - Bit 1: Direction (0=bidirectional, 1=unidirectional)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

impl StreamId {
    /// Build the `index`-th stream of a given initiator and direction.
    pub fn from_parts(index: u64, initiator: Side, bidirectional: bool) -> Self {
        let mut id = index << 2;
        if initiator.is_server() {
            id |= 0x01;
        }
        if !bidirectional {
            id |= 0x02;
        }
        Self(id)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    /// Position of this stream among streams of the same type.
    pub fn index(&self) -> u64 {
        self.0 >> 2
    }

    pub fn initiator(&self) -> Side {
        if self.0 & 0x01 == 0 {
            Side::Client
        } else {
            Side::Server
        }
    }

    pub fn is_bidirectional(&self) -> bool {
        (self.0 & 0x02) == 0
    }

    pub fn is_unidirectional(&self) -> bool {
        (self.0 & 0x02) != 0
    }
}

impl core::fmt::Display for StreamId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}
