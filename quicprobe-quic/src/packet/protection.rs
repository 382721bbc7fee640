//! # Packet and Header Protection (RFC 9001 Section 5)
//!
//! Sealing: AEAD over the payload with the clear header as associated
//! data, then a mask from the ciphertext sample over the first byte's low
//! bits and the packet-number bytes. Opening reverses the two steps and
//! recovers the full packet number from the receiver's largest seen.

#![forbid(unsafe_code)]

use super::header::{parse_header, PacketHeader, PACKET_NUMBER_LENGTH_MASK};
use super::number;
use super::types::{Packet, PlainPacket, SAMPLE_OFFSET};
use crate::crypto::{CryptoService, HP_SAMPLE_LEN};
use crate::error::{Error, Result};
use crate::frames::parse_frames;
use crate::types::{ConnectionId, PacketNumber};
use bytes::{BufMut, Bytes, BytesMut};

/// Payload of a packet whose protection has been removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedPacket {
    pub packet_number: PacketNumber,
    pub pn_len: usize,
    pub payload: Bytes,
}

/// Seal a plain packet with the keys of `key_cid` at the packet's level.
pub fn protect(crypto: &dyn CryptoService, key_cid: &ConnectionId, plain: &PlainPacket) -> Result<Bytes> {
    let level = plain.packet_type.level();
    let ciphertext = crypto.encrypt_aead(
        key_cid,
        level,
        &plain.payload,
        plain.packet_number,
        &plain.header,
    )?;

    let mut out = BytesMut::with_capacity(plain.header.len() + ciphertext.len());
    out.put_slice(&plain.header);
    out.put_slice(&ciphertext);

    let sample_start = plain.pn_offset + SAMPLE_OFFSET;
    let sample = out
        .get(sample_start..sample_start + HP_SAMPLE_LEN)
        .ok_or(Error::MalformedEncoding("packet too short for header protection sample"))?;
    let mask = crypto
        .header_protection_mask(key_cid, level, sample)
        .ok_or(Error::MalformedEncoding("no header protection key"))?;

    out[0] ^= mask[0] & plain.packet_type.protected_bits();
    for i in 0..plain.pn_len {
        out[plain.pn_offset + i] ^= mask[1 + i];
    }
    Ok(out.freeze())
}

/// Remove header and packet protection from the packet described by
/// `header` (the first `header.packet_len` bytes of `packet`).
///
/// `Ok(None)` means the packet cannot be decrypted with the keys we hold
/// and should be dropped as undecryptable. Structural problems are errors.
pub fn unprotect(
    crypto: &dyn CryptoService,
    key_cid: &ConnectionId,
    packet: &Bytes,
    header: &PacketHeader,
    largest_received: Option<PacketNumber>,
) -> Result<Option<OpenedPacket>> {
    let level = header.packet_type.level();
    let end = header.packet_len;
    let sample_start = header.pn_offset + SAMPLE_OFFSET;
    if sample_start + HP_SAMPLE_LEN > end || end > packet.len() {
        return Err(Error::MalformedEncoding("packet too short for header protection sample"));
    }

    let Some(mask) =
        crypto.header_protection_mask(key_cid, level, &packet[sample_start..sample_start + HP_SAMPLE_LEN])
    else {
        return Ok(None);
    };

    let first_byte = packet[0] ^ (mask[0] & header.packet_type.protected_bits());
    let pn_len = (first_byte & PACKET_NUMBER_LENGTH_MASK) as usize + 1;

    let mut clear_header = BytesMut::with_capacity(header.pn_offset + pn_len);
    clear_header.put_u8(first_byte);
    clear_header.put_slice(&packet[1..header.pn_offset]);
    let mut truncated = 0u64;
    for i in 0..pn_len {
        let byte = packet[header.pn_offset + i] ^ mask[1 + i];
        clear_header.put_u8(byte);
        truncated = (truncated << 8) | u64::from(byte);
    }
    let packet_number = number::correct(largest_received, truncated, pn_len)?;

    let ciphertext = &packet[header.pn_offset + pn_len..end];
    Ok(crypto
        .decrypt_aead(key_cid, level, ciphertext, packet_number, &clear_header)
        .map(|payload| OpenedPacket {
            packet_number,
            pn_len,
            payload,
        }))
}

/// Encode and seal a whole packet.
pub fn seal_packet(
    crypto: &dyn CryptoService,
    key_cid: &ConnectionId,
    packet: &Packet,
    largest_acked: Option<PacketNumber>,
    min_size: usize,
) -> Result<Bytes> {
    let plain = packet.encode(largest_acked, crypto.tag_len(), min_size)?;
    protect(crypto, key_cid, &plain)
}

/// Parse, open and decode the packet at the start of `datagram`.
///
/// Returns the packet and its length, or None when it is undecryptable.
pub fn open_packet(
    crypto: &dyn CryptoService,
    key_cid: &ConnectionId,
    datagram: &Bytes,
    short_dcid_len: usize,
    largest_received: Option<PacketNumber>,
) -> Result<Option<(Packet, usize)>> {
    let header = parse_header(datagram, short_dcid_len)?;
    let Some(opened) = unprotect(crypto, key_cid, datagram, &header, largest_received)? else {
        return Ok(None);
    };
    let frames = parse_frames(&opened.payload)?;
    Ok(Some((
        Packet {
            packet_type: header.packet_type,
            version: header.version,
            dcid: header.dcid,
            scid: header.scid,
            token: header.token,
            packet_number: opened.packet_number,
            frames,
        },
        header.packet_len,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{EncryptionLevel, PlaintextCrypto, INITIAL_SALT_V1};
    use crate::frames::{CryptoFrame, Frame};
    use crate::packet::PacketType;
    use crate::types::QUIC_VERSION_1;

    fn keyed(cid: &ConnectionId) -> PlaintextCrypto {
        let mut crypto = PlaintextCrypto::new();
        crypto
            .derive_initial_keys(cid, INITIAL_SALT_V1, cid.as_bytes())
            .unwrap();
        crypto.install_keys(cid, EncryptionLevel::OneRtt).unwrap();
        crypto
    }

    fn sample_initial(cid: &ConnectionId, pn: u64) -> Packet {
        Packet {
            packet_type: PacketType::Initial,
            version: QUIC_VERSION_1,
            dcid: cid.clone(),
            scid: ConnectionId::from_u64(0x51),
            token: Bytes::new(),
            packet_number: pn,
            frames: vec![
                Frame::Crypto(CryptoFrame {
                    offset: 0,
                    data: Bytes::from_static(b"hello"),
                }),
                Frame::Padding { length: 3 },
            ],
        }
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let cid = ConnectionId::from_u64(1);
        let crypto = keyed(&cid);
        let packet = sample_initial(&cid, 0);
        let wire = seal_packet(&crypto, &cid, &packet, None, 0).unwrap();

        let (opened, len) = open_packet(&crypto, &cid, &wire, 8, None).unwrap().unwrap();
        assert_eq!(len, wire.len());
        assert_eq!(opened.packet_number, 0);
        assert_eq!(opened.frames[0], packet.frames[0]);
        assert_eq!(opened.dcid, cid);
    }

    #[test]
    fn test_packet_number_recovered_from_truncation() {
        let cid = ConnectionId::from_u64(1);
        let crypto = keyed(&cid);
        let packet = Packet {
            packet_type: PacketType::OneRtt,
            version: 0,
            dcid: cid.clone(),
            scid: ConnectionId::empty(),
            token: Bytes::new(),
            packet_number: 1029,
            frames: vec![Frame::Ping],
        };
        let wire = seal_packet(&crypto, &cid, &packet, Some(1000), 0).unwrap();
        let (opened, _) = open_packet(&crypto, &cid, &wire, 8, Some(1000)).unwrap().unwrap();
        assert_eq!(opened.packet_number, 1029);
    }

    #[test]
    fn test_unknown_keys_are_undecryptable() {
        let cid = ConnectionId::from_u64(1);
        let crypto = keyed(&cid);
        let wire = seal_packet(&crypto, &cid, &sample_initial(&cid, 0), None, 0).unwrap();
        let stranger = PlaintextCrypto::new();
        assert_eq!(open_packet(&stranger, &cid, &wire, 8, None).unwrap(), None);
    }

    #[test]
    fn test_header_bits_are_masked() {
        let cid = ConnectionId::from_u64(1);
        let crypto = keyed(&cid);
        let packet = sample_initial(&cid, 7);
        let plain = packet.encode(None, crypto.tag_len(), 0).unwrap();
        let wire = protect(&crypto, &cid, &plain).unwrap();
        // form, fixed and type bits are never masked
        assert_eq!(wire[0] & 0xf0, plain.header[0] & 0xf0);
        assert_eq!(&wire[1..plain.pn_offset], &plain.header[1..plain.pn_offset]);
    }

    #[test]
    fn test_truncated_sample_is_error() {
        let cid = ConnectionId::from_u64(1);
        let crypto = keyed(&cid);
        let wire = seal_packet(&crypto, &cid, &sample_initial(&cid, 0), None, 0).unwrap();
        let header = parse_header(&wire, 8).unwrap();
        let mut short = header.clone();
        short.packet_len = header.pn_offset + 10;
        assert!(unprotect(&crypto, &cid, &wire, &short, None).is_err());
    }
}
