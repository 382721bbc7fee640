//! Incremental handshake message parsing.
//!
//! CRYPTO data arrives in pieces. The parser decodes every complete
//! message from a cursor and stops, without error, at a message whose
//! header or body is not fully buffered yet.

#![forbid(unsafe_code)]

use super::messages::{HandshakeMessage, HANDSHAKE_HEADER_LEN};
use crate::buffer::Reader;
use crate::error::Result;
use bytes::Bytes;

/// Progress made by one parse call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeParse {
    /// Cursor after the last complete message
    pub pos: usize,
    pub messages: Vec<HandshakeMessage>,
}

/// Decode complete messages from `data[pos..]`.
pub fn parse_handshake_messages(data: &Bytes, pos: usize) -> Result<HandshakeParse> {
    let mut r = Reader::new(data, pos);
    let mut messages = Vec::new();
    loop {
        if r.remaining() < HANDSHAKE_HEADER_LEN {
            break;
        }
        let mut peek = r.clone();
        let msg_type = peek.read_u8()?;
        let len = peek.read_u24()? as usize;
        if peek.remaining() < len {
            break;
        }
        let body = peek.read_bytes(len)?;
        messages.push(HandshakeMessage::decode_body(msg_type, body)?);
        r = peek;
    }
    Ok(HandshakeParse {
        pos: r.position(),
        messages,
    })
}
