//! # Byte-Buffer Primitives (RFC 9000 Section 16)
//!
//! Varint coding, fixed-width big-endian fields and byte-sequence splicing.
//! Every decoder in the crate reads through [`Reader`], which hands out
//! reference-counted [`Bytes`] sub-slices of the input instead of copies.

#![forbid(unsafe_code)]

use crate::error::{Error, Result};
use crate::types::{VarInt, VARINT_MAX};
use bytes::{BufMut, Bytes, BytesMut};

/// VarInt encoding and decoding utilities
pub struct VarIntCodec;

impl VarIntCodec {
    /// Decode a VarInt from a byte slice, returning (value, bytes_consumed)
    pub fn decode(buf: &[u8]) -> Result<(VarInt, usize)> {
        let first = *buf.first().ok_or(Error::TruncatedVarint {
            needed: 1,
            available: 0,
        })?;
        let len = 1usize << (first >> 6);
        if buf.len() < len {
            return Err(Error::TruncatedVarint {
                needed: len,
                available: buf.len(),
            });
        }

        let mut value = u64::from(first & 0x3f);
        for byte in &buf[1..len] {
            value = (value << 8) | u64::from(*byte);
        }
        Ok((value, len))
    }

    /// Encode a VarInt using the shortest length class that fits.
    ///
    /// Returns the number of bytes written.
    pub fn encode(value: VarInt, buf: &mut BytesMut) -> Result<usize> {
        match Self::size(value) {
            1 => buf.put_u8(value as u8),
            2 => buf.put_u16(0x4000 | value as u16),
            4 => buf.put_u32(0x8000_0000 | value as u32),
            8 if value <= VARINT_MAX => buf.put_u64(0xc000_0000_0000_0000 | value),
            _ => return Err(Error::MalformedEncoding("varint value exceeds 2^62-1")),
        }
        Ok(Self::size(value))
    }

    /// Calculate the encoded size for a given value
    pub fn size(value: VarInt) -> usize {
        if value < 0x40 {
            1
        } else if value < 0x4000 {
            2
        } else if value < 0x4000_0000 {
            4
        } else {
            8
        }
    }
}

/// Half-open sub-range `[lo, hi)` of `data`, sharing its storage.
pub fn segment(data: &Bytes, lo: usize, hi: usize) -> Result<Bytes> {
    if lo > hi || hi > data.len() {
        return Err(Error::OutOfRange {
            lo,
            hi,
            len: data.len(),
        });
    }
    Ok(data.slice(lo..hi))
}

/// Append a byte slice to an owned sequence.
pub fn extend(dst: &mut BytesMut, src: &[u8]) {
    dst.extend_from_slice(src);
}

/// Append one byte to an owned sequence.
pub fn append(dst: &mut BytesMut, byte: u8) {
    dst.put_u8(byte);
}

/// Write a 24-bit big-endian integer (TLS handshake lengths).
pub fn put_u24(buf: &mut BytesMut, value: u32) {
    buf.put_u8((value >> 16) as u8);
    buf.put_u16(value as u16);
}

/// Write a varint, failing for values above 2^62-1.
pub fn put_varint(buf: &mut BytesMut, value: u64) -> Result<()> {
    VarIntCodec::encode(value, buf).map(|_| ())
}

/// Bounds-checked cursor over a shared buffer.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    buf: &'a Bytes,
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a Bytes, pos: usize) -> Self {
        Self { buf, pos }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn peek_u8(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(Error::MalformedEncoding("field runs past end of buffer"));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u24(&mut self) -> Result<u32> {
        let b = self.take(3)?;
        Ok(u32::from_be_bytes([0, b[0], b[1], b[2]]))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_varint(&mut self) -> Result<u64> {
        let (value, len) = VarIntCodec::decode(&self.buf[self.pos.min(self.buf.len())..])?;
        self.pos += len;
        Ok(value)
    }

    /// Read `len` bytes as a shared slice of the input.
    pub fn read_bytes(&mut self, len: usize) -> Result<Bytes> {
        if len > self.remaining() {
            return Err(Error::MalformedEncoding("length field exceeds remaining bytes"));
        }
        let out = segment(self.buf, self.pos, self.pos + len)?;
        self.pos += len;
        Ok(out)
    }

    /// Read a varint length followed by that many bytes.
    pub fn read_varint_prefixed(&mut self) -> Result<Bytes> {
        let len = self.read_varint()?;
        let len = usize::try_from(len)
            .map_err(|_| Error::MalformedEncoding("length field exceeds remaining bytes"))?;
        self.read_bytes(len)
    }

    /// Everything from the cursor to the end.
    pub fn read_rest(&mut self) -> Bytes {
        let start = self.pos.min(self.buf.len());
        self.pos = self.buf.len();
        self.buf.slice(start..)
    }
}
