//! # CRYPTO Stream (RFC 9000 Section 19.6, RFC 9001 Section 4.1.3)
//!
//! One per encryption level. Incoming CRYPTO frames are reassembled in
//! order; the handshake parser consumes the contiguous bytes through a
//! handler cursor that only moves forward. Outgoing handshake bytes are
//! assigned increasing offsets.

#![forbid(unsafe_code)]

use super::messages::HandshakeMessage;
use super::parser::parse_handshake_messages;
use crate::error::{Error, Result, TransportError};
use crate::frames::CryptoFrame;
use crate::stream::ReassemblyBuffer;
use crate::types::VARINT_MAX;
use bytes::{Bytes, BytesMut};

/// Out-of-order CRYPTO bytes we are willing to hold per level
pub const DEFAULT_CRYPTO_BUFFER: u64 = 64 * 1024;

#[derive(Debug, Clone)]
pub struct CryptoStream {
    recv: ReassemblyBuffer,

    /// Contiguous bytes not yet consumed by the parser
    pending: Bytes,

    /// Stream offset of the first byte of `pending`
    handler_pos: u64,

    send_offset: u64,

    max_buffer: u64,
}

impl Default for CryptoStream {
    fn default() -> Self {
        Self::new(DEFAULT_CRYPTO_BUFFER)
    }
}

impl CryptoStream {
    pub fn new(max_buffer: u64) -> Self {
        Self {
            recv: ReassemblyBuffer::new(),
            pending: Bytes::new(),
            handler_pos: 0,
            send_offset: 0,
            max_buffer,
        }
    }

    /// Buffer the data of a received CRYPTO frame.
    pub fn on_frame(&mut self, frame: &CryptoFrame) -> Result<()> {
        let end = frame
            .offset
            .checked_add(frame.data.len() as u64)
            .filter(|end| *end <= VARINT_MAX)
            .ok_or_else(|| Error::frame_encoding("CRYPTO frame beyond 2^62-1"))?;
        if end > self.recv.read_offset() + self.max_buffer {
            return Err(Error::transport(
                TransportError::CryptoBufferExceeded,
                "CRYPTO data beyond buffer limit",
            ));
        }
        self.recv.insert(frame.offset, frame.data.clone());
        Ok(())
    }

    /// Complete handshake messages available so far.
    pub fn poll_messages(&mut self) -> Result<Vec<HandshakeMessage>> {
        let fresh = self.recv.read_all();
        if !fresh.is_empty() {
            self.pending = if self.pending.is_empty() {
                fresh
            } else {
                let mut joined = BytesMut::with_capacity(self.pending.len() + fresh.len());
                joined.extend_from_slice(&self.pending);
                joined.extend_from_slice(&fresh);
                joined.freeze()
            };
        }
        let parsed = parse_handshake_messages(&self.pending, 0)?;
        self.handler_pos += parsed.pos as u64;
        self.pending = self.pending.slice(parsed.pos..);
        Ok(parsed.messages)
    }

    /// Bytes of the stream handed to the handshake so far
    pub fn handler_pos(&self) -> u64 {
        self.handler_pos
    }

    /// Wrap outgoing handshake bytes in a CRYPTO frame at the next offset.
    pub fn next_frame(&mut self, data: Bytes) -> CryptoFrame {
        let frame = CryptoFrame {
            offset: self.send_offset,
            data,
        };
        self.send_offset += frame.data.len() as u64;
        frame
    }

    pub fn send_offset(&self) -> u64 {
        self.send_offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::messages::EncryptedExtensions;

    fn message_bytes() -> Bytes {
        HandshakeMessage::EncryptedExtensions(EncryptedExtensions::default())
            .to_bytes()
            .unwrap()
    }

    #[test]
    fn test_fragmented_delivery() {
        let data = message_bytes();
        let mut stream = CryptoStream::default();
        stream
            .on_frame(&CryptoFrame {
                offset: 3,
                data: data.slice(3..),
            })
            .unwrap();
        assert!(stream.poll_messages().unwrap().is_empty());
        stream
            .on_frame(&CryptoFrame {
                offset: 0,
                data: data.slice(..3),
            })
            .unwrap();
        assert_eq!(stream.poll_messages().unwrap().len(), 1);
        assert_eq!(stream.handler_pos(), data.len() as u64);
    }

    #[test]
    fn test_partial_message_waits_in_pending() {
        let data = message_bytes();
        let mut stream = CryptoStream::default();
        stream
            .on_frame(&CryptoFrame {
                offset: 0,
                data: data.slice(..5),
            })
            .unwrap();
        assert!(stream.poll_messages().unwrap().is_empty());
        assert_eq!(stream.handler_pos(), 0);
        stream
            .on_frame(&CryptoFrame {
                offset: 5,
                data: data.slice(5..),
            })
            .unwrap();
        assert_eq!(stream.poll_messages().unwrap().len(), 1);
    }

    #[test]
    fn test_buffer_exceeded() {
        let mut stream = CryptoStream::new(16);
        let err = stream
            .on_frame(&CryptoFrame {
                offset: 10,
                data: Bytes::from_static(&[0; 10]),
            })
            .unwrap_err();
        assert_eq!(err.transport_error(), Some(TransportError::CryptoBufferExceeded));
    }

    #[test]
    fn test_offset_overflow_is_frame_encoding_error() {
        let mut stream = CryptoStream::default();
        let err = stream
            .on_frame(&CryptoFrame {
                offset: VARINT_MAX,
                data: Bytes::from_static(&[0; 2]),
            })
            .unwrap_err();
        assert_eq!(err.transport_error(), Some(TransportError::FrameEncodingError));
    }

    #[test]
    fn test_send_offsets_advance() {
        let mut stream = CryptoStream::default();
        assert_eq!(stream.next_frame(Bytes::from_static(b"abc")).offset, 0);
        assert_eq!(stream.next_frame(Bytes::from_static(b"de")).offset, 3);
        assert_eq!(stream.send_offset(), 5);
    }
}
