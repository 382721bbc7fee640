//! # QUIC Packet Header Parsing (RFC 9000 Section 17, RFC 8999)
//!
//! Headers are parsed in two steps. [`parse_header`] reads everything that
//! is not protected (form, version, connection IDs, token, length) and
//! records where the packet number starts; the packet number itself and
//! the low bits of the first byte are only readable after header
//! protection is removed (see [`super::protection`]).

#![forbid(unsafe_code)]

use crate::buffer::Reader;
use crate::crypto::EncryptionLevel;
use crate::error::{Error, Result};
use crate::types::{ConnectionId, MAX_CID_LENGTH};
use bytes::Bytes;

// ============================================================================
// Header Form Constants (RFC 9000 Section 17.2)
// ============================================================================

/// Header Form Bit (bit 7 of first byte): 1 = long header, 0 = short
pub const HEADER_FORM_BIT: u8 = 0x80;

/// Fixed Bit (bit 6 of first byte), MUST be 1 in version 1
pub const FIXED_BIT: u8 = 0x40;

/// Long Header Packet Type Mask (bits 4-5)
pub const LONG_PACKET_TYPE_MASK: u8 = 0x30;

pub const LONG_PACKET_TYPE_INITIAL: u8 = 0x00;
pub const LONG_PACKET_TYPE_0RTT: u8 = 0x10;
pub const LONG_PACKET_TYPE_HANDSHAKE: u8 = 0x20;
pub const LONG_PACKET_TYPE_RETRY: u8 = 0x30;

/// Packet Number Length Mask (bottom 2 bits), encodes length - 1
pub const PACKET_NUMBER_LENGTH_MASK: u8 = 0x03;

/// First-byte bits covered by header protection
pub const LONG_HEADER_PROTECTED_BITS: u8 = 0x0f;
pub const SHORT_HEADER_PROTECTED_BITS: u8 = 0x1f;

/// Packet Type (RFC 9000 Section 17)
///
/// Retry and Version Negotiation are not produced or accepted here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    /// Initial packet (Long Header, type 0x0)
    Initial,
    /// 0-RTT packet (Long Header, type 0x1)
    ZeroRtt,
    /// Handshake packet (Long Header, type 0x2)
    Handshake,
    /// 1-RTT packet (Short Header)
    OneRtt,
}

impl PacketType {
    pub fn is_long_header(&self) -> bool {
        !matches!(self, PacketType::OneRtt)
    }

    /// Encryption level protecting packets of this type
    pub fn level(&self) -> EncryptionLevel {
        match self {
            PacketType::Initial => EncryptionLevel::Initial,
            PacketType::ZeroRtt => EncryptionLevel::ZeroRtt,
            PacketType::Handshake => EncryptionLevel::Handshake,
            PacketType::OneRtt => EncryptionLevel::OneRtt,
        }
    }

    pub fn for_level(level: EncryptionLevel) -> Self {
        match level {
            EncryptionLevel::Initial => PacketType::Initial,
            EncryptionLevel::ZeroRtt => PacketType::ZeroRtt,
            EncryptionLevel::Handshake => PacketType::Handshake,
            EncryptionLevel::OneRtt => PacketType::OneRtt,
        }
    }

    /// Type bits of a long header first byte
    pub fn long_type_bits(&self) -> Option<u8> {
        match self {
            PacketType::Initial => Some(LONG_PACKET_TYPE_INITIAL),
            PacketType::ZeroRtt => Some(LONG_PACKET_TYPE_0RTT),
            PacketType::Handshake => Some(LONG_PACKET_TYPE_HANDSHAKE),
            PacketType::OneRtt => None,
        }
    }

    /// Bits of the first byte masked by header protection
    pub fn protected_bits(&self) -> u8 {
        if self.is_long_header() {
            LONG_HEADER_PROTECTED_BITS
        } else {
            SHORT_HEADER_PROTECTED_BITS
        }
    }
}

/// Unprotected part of a packet header.
///
/// Offsets are relative to the start of this packet inside its datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    pub packet_type: PacketType,

    /// Version (long header only; 0 for short headers)
    pub version: u32,

    pub dcid: ConnectionId,

    /// Source Connection ID (empty for short headers)
    pub scid: ConnectionId,

    /// Address validation token (Initial only)
    pub token: Bytes,

    /// Offset of the first packet-number byte
    pub pn_offset: usize,

    /// Total length of this packet; the next coalesced packet starts here
    pub packet_len: usize,
}

fn read_cid(r: &mut Reader<'_>) -> Result<ConnectionId> {
    let len = r.read_u8()? as usize;
    if len > MAX_CID_LENGTH {
        return Err(Error::MalformedEncoding("connection ID longer than 20 bytes"));
    }
    ConnectionId::new(r.read_bytes(len)?)
        .ok_or(Error::MalformedEncoding("connection ID longer than 20 bytes"))
}

/// Parse the unprotected header of the packet at the start of `packet`.
///
/// Short headers carry no cid length; `short_dcid_len` is the length of
/// the cids this endpoint issues.
pub fn parse_header(packet: &Bytes, short_dcid_len: usize) -> Result<PacketHeader> {
    let mut r = Reader::new(packet, 0);
    let first_byte = r.read_u8()?;

    // Validate Fixed Bit (RFC 9000 Section 17.2)
    if first_byte & FIXED_BIT == 0 {
        return Err(Error::MalformedEncoding("fixed bit not set"));
    }

    if first_byte & HEADER_FORM_BIT == 0 {
        let dcid = ConnectionId::new(r.read_bytes(short_dcid_len)?)
            .ok_or(Error::MalformedEncoding("connection ID longer than 20 bytes"))?;
        return Ok(PacketHeader {
            packet_type: PacketType::OneRtt,
            version: 0,
            dcid,
            scid: ConnectionId::empty(),
            token: Bytes::new(),
            pn_offset: r.position(),
            // A short header packet always runs to the end of the datagram
            packet_len: packet.len(),
        });
    }

    let version = r.read_u32()?;
    if version == 0 {
        return Err(Error::MalformedEncoding("version negotiation not supported"));
    }
    let dcid = read_cid(&mut r)?;
    let scid = read_cid(&mut r)?;

    let packet_type = match first_byte & LONG_PACKET_TYPE_MASK {
        LONG_PACKET_TYPE_INITIAL => PacketType::Initial,
        LONG_PACKET_TYPE_0RTT => PacketType::ZeroRtt,
        LONG_PACKET_TYPE_HANDSHAKE => PacketType::Handshake,
        _ => return Err(Error::MalformedEncoding("retry packets not supported")),
    };

    let token = if packet_type == PacketType::Initial {
        r.read_varint_prefixed()?
    } else {
        Bytes::new()
    };

    let length = r.read_varint()?;
    let pn_offset = r.position();
    let length = usize::try_from(length)
        .map_err(|_| Error::MalformedEncoding("packet length exceeds datagram"))?;
    if length > r.remaining() {
        return Err(Error::MalformedEncoding("packet length exceeds datagram"));
    }

    Ok(PacketHeader {
        packet_type,
        version,
        dcid,
        scid,
        token,
        pn_offset,
        packet_len: pn_offset + length,
    })
}

/// Destination cid of a packet without parsing the rest of the header.
pub fn extract_dcid(packet: &Bytes, short_dcid_len: usize) -> Result<ConnectionId> {
    let mut r = Reader::new(packet, 0);
    let first_byte = r.read_u8()?;
    if first_byte & HEADER_FORM_BIT != 0 {
        r.read_u32()?;
        read_cid(&mut r)
    } else {
        ConnectionId::new(r.read_bytes(short_dcid_len)?)
            .ok_or(Error::MalformedEncoding("connection ID longer than 20 bytes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn initial_bytes() -> Bytes {
        let mut wire = vec![
            0xc1, // long, fixed, Initial, pn_len 2
            0x00, 0x00, 0x00, 0x01, // version 1
            0x02, 0xaa, 0xbb, // dcid
            0x01, 0xcc, // scid
            0x01, 0x7f, // token
            0x04, // length
        ];
        wire.extend_from_slice(&[0, 1, 2, 3]);
        Bytes::from(wire)
    }

    #[test]
    fn test_parse_initial_header() {
        let packet = initial_bytes();
        let header = parse_header(&packet, 8).unwrap();
        assert_eq!(header.packet_type, PacketType::Initial);
        assert_eq!(header.version, 1);
        assert_eq!(header.dcid.as_bytes(), &[0xaa, 0xbb]);
        assert_eq!(header.scid.as_bytes(), &[0xcc]);
        assert_eq!(&header.token[..], &[0x7f]);
        assert_eq!(header.pn_offset, 13);
        assert_eq!(header.packet_len, 17);
    }

    #[test]
    fn test_length_past_datagram() {
        let mut wire = initial_bytes().to_vec();
        wire.truncate(15);
        assert!(parse_header(&Bytes::from(wire), 8).is_err());
    }

    #[test]
    fn test_parse_short_header() {
        let packet = Bytes::from_static(&[0x40, 1, 2, 3, 4, 0x00, 0xff, 0xff]);
        let header = parse_header(&packet, 4).unwrap();
        assert_eq!(header.packet_type, PacketType::OneRtt);
        assert_eq!(header.dcid.as_bytes(), &[1, 2, 3, 4]);
        assert_eq!(header.pn_offset, 5);
        assert_eq!(header.packet_len, 8);
    }

    #[test]
    fn test_reject_fixed_bit_and_retry() {
        assert!(parse_header(&Bytes::from_static(&[0x00, 1, 2]), 2).is_err());
        let retry = Bytes::from_static(&[0xf0, 0, 0, 0, 1, 0, 0]);
        assert!(matches!(
            parse_header(&retry, 0),
            Err(Error::MalformedEncoding(_))
        ));
    }

    #[test]
    fn test_reject_oversized_cid() {
        let mut wire = vec![0xe0, 0, 0, 0, 1, 21];
        wire.extend_from_slice(&[0u8; 21]);
        assert!(parse_header(&Bytes::from(wire), 0).is_err());
    }

    #[test]
    fn test_extract_dcid() {
        assert_eq!(
            extract_dcid(&initial_bytes(), 8).unwrap().as_bytes(),
            &[0xaa, 0xbb]
        );
        let short = Bytes::from_static(&[0x41, 9, 9, 0x00]);
        assert_eq!(extract_dcid(&short, 2).unwrap().as_bytes(), &[9, 9]);
    }
}
