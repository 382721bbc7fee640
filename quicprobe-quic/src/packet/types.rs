//! # Packets Before Protection
//!
//! A [`Packet`] is a header plus an ordered frame list. Encoding produces a
//! [`PlainPacket`]: header bytes with the packet number in the clear and
//! the padded frame payload, ready for [`super::protection::protect`].

#![forbid(unsafe_code)]

use super::header::{PacketType, FIXED_BIT, HEADER_FORM_BIT};
use super::number;
use crate::buffer::{put_varint, VarIntCodec};
use crate::crypto::HP_SAMPLE_LEN;
use crate::error::{Error, Result};
use crate::frames::{encode_frames, Frame};
use crate::types::{ConnectionId, PacketNumber};
use bytes::{BufMut, Bytes, BytesMut};

/// Ciphertext starts this far past the packet-number offset for sampling
pub const SAMPLE_OFFSET: usize = 4;

/// Decoded or to-be-encoded QUIC packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: PacketType,
    pub version: u32,
    pub dcid: ConnectionId,
    pub scid: ConnectionId,
    pub token: Bytes,
    pub packet_number: PacketNumber,
    pub frames: Vec<Frame>,
}

/// Encoded header and payload of one packet, not yet protected.
#[derive(Debug, Clone)]
pub struct PlainPacket {
    pub packet_type: PacketType,

    /// Header through the last packet-number byte
    pub header: BytesMut,

    pub pn_offset: usize,
    pub pn_len: usize,
    pub packet_number: PacketNumber,

    /// Frames plus any padding
    pub payload: Bytes,
}

impl PlainPacket {
    /// Size on the wire once sealed with a `tag_len`-byte AEAD tag
    pub fn wire_len(&self, tag_len: usize) -> usize {
        self.header.len() + self.payload.len() + tag_len
    }
}

impl Packet {
    /// Encode header and frames.
    ///
    /// `largest_acked` sizes the packet-number field. The payload is padded
    /// so that a header-protection sample always exists and the sealed
    /// packet is at least `min_size` bytes.
    pub fn encode(
        &self,
        largest_acked: Option<PacketNumber>,
        tag_len: usize,
        min_size: usize,
    ) -> Result<PlainPacket> {
        if self.packet_number > number::MAX_PACKET_NUMBER {
            return Err(Error::MalformedEncoding("packet number exceeds 2^62-1"));
        }
        let pn_len = number::encode_length(self.packet_number, largest_acked);

        let mut payload = BytesMut::new();
        encode_frames(&self.frames, &mut payload)?;

        let fixed_len = self.header_len_without_length(pn_len);
        let length_field = |payload_len: usize| {
            if self.packet_type.is_long_header() {
                VarIntCodec::size((pn_len + payload_len + tag_len) as u64)
            } else {
                0
            }
        };

        // A sample needs 4 + 16 bytes after the packet-number offset.
        let sample_need =
            (SAMPLE_OFFSET + HP_SAMPLE_LEN).saturating_sub(pn_len + payload.len() + tag_len);
        let total_for =
            |pad: usize| fixed_len + length_field(payload.len() + pad) + payload.len() + pad + tag_len;
        let mut pad = sample_need;
        while total_for(pad) < min_size {
            pad += min_size - total_for(pad);
        }
        // Growing the length varint may overshoot the minimum
        while pad > sample_need && total_for(pad - 1) >= min_size {
            pad -= 1;
        }
        payload.put_bytes(0, pad);

        let mut header = BytesMut::with_capacity(fixed_len + 8);
        let pn_bits = (pn_len - 1) as u8;
        match self.packet_type.long_type_bits() {
            Some(type_bits) => {
                header.put_u8(HEADER_FORM_BIT | FIXED_BIT | type_bits | pn_bits);
                header.put_u32(self.version);
                put_cid(&mut header, &self.dcid);
                put_cid(&mut header, &self.scid);
                if self.packet_type == PacketType::Initial {
                    put_varint(&mut header, self.token.len() as u64)?;
                    header.put_slice(&self.token);
                }
                put_varint(&mut header, (pn_len + payload.len() + tag_len) as u64)?;
            }
            None => {
                header.put_u8(FIXED_BIT | pn_bits);
                header.put_slice(self.dcid.as_bytes());
            }
        }

        let pn_offset = header.len();
        header.put_slice(&number::truncate(self.packet_number, pn_len)[..pn_len]);

        Ok(PlainPacket {
            packet_type: self.packet_type,
            header,
            pn_offset,
            pn_len,
            packet_number: self.packet_number,
            payload: payload.freeze(),
        })
    }

    /// Header bytes before the length field and packet number
    fn header_len_without_length(&self, pn_len: usize) -> usize {
        if self.packet_type.is_long_header() {
            let token = if self.packet_type == PacketType::Initial {
                VarIntCodec::size(self.token.len() as u64) + self.token.len()
            } else {
                0
            };
            1 + 4 + 1 + self.dcid.len() + 1 + self.scid.len() + token + pn_len
        } else {
            1 + self.dcid.len() + pn_len
        }
    }
}

fn put_cid(buf: &mut BytesMut, cid: &ConnectionId) {
    buf.put_u8(cid.len() as u8);
    buf.put_slice(cid.as_bytes());
}
