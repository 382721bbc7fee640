//! TLS 1.3 handshake message encoding and decoding.
//!
//! Handshake message format:
//!   HandshakeType (1 byte)
//!   Length (3 bytes, big-endian)
//!   Body (Length bytes)
//!
//! ClientHello, ServerHello and EncryptedExtensions are decoded into
//! structs; every other message type is kept as its raw body.

#![forbid(unsafe_code)]

use super::extensions::{decode_extensions, encode_extensions, find_transport_parameters, Extension};
use crate::buffer::{put_u24, Reader};
use crate::error::{Error, Result};
use crate::transport::TransportParameter;
use bytes::{BufMut, Bytes, BytesMut};

pub const HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 1;
pub const HANDSHAKE_TYPE_SERVER_HELLO: u8 = 2;
pub const HANDSHAKE_TYPE_ENCRYPTED_EXTENSIONS: u8 = 8;

/// Handshake header: type + 24-bit length
pub const HANDSHAKE_HEADER_LEN: usize = 4;

const MAX_HANDSHAKE_BODY: usize = (1 << 24) - 1;

/// legacy_version sent in hellos (TLS 1.2 for middlebox compatibility)
pub const LEGACY_VERSION: u16 = 0x0303;

pub const TLS_AES_128_GCM_SHA256: u16 = 0x1301;
pub const TLS_AES_256_GCM_SHA384: u16 = 0x1302;
pub const TLS_CHACHA20_POLY1305_SHA256: u16 = 0x1303;

/// Cipher suites this endpoint will select, in preference order
pub const SUPPORTED_CIPHER_SUITES: [u16; 3] = [
    TLS_AES_128_GCM_SHA256,
    TLS_AES_256_GCM_SHA384,
    TLS_CHACHA20_POLY1305_SHA256,
];

/// Hello random: 4-byte timestamp followed by 28 random bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Random {
    pub gmt_unix_time: u32,
    pub random_bytes: [u8; 28],
}

impl Random {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        let mut random_bytes = [0u8; 28];
        random_bytes.copy_from_slice(&bytes[4..]);
        Self {
            gmt_unix_time: u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            random_bytes,
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.gmt_unix_time);
        buf.put_slice(&self.random_bytes);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            gmt_unix_time: r.read_u32()?,
            random_bytes: r.read_array()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientHello {
    pub client_version: u16,
    pub random: Random,
    pub session_id: Bytes,
    pub cipher_suites: Vec<u16>,
    pub compression_methods: Bytes,
    pub extensions: Vec<Extension>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerHello {
    pub server_version: u16,
    pub random: Random,
    pub session_id: Bytes,
    pub cipher_suite: u16,
    pub compression_method: u8,
    pub extensions: Vec<Extension>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct EncryptedExtensions {
    pub extensions: Vec<Extension>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HandshakeMessage {
    ClientHello(ClientHello),
    ServerHello(ServerHello),
    EncryptedExtensions(EncryptedExtensions),
    Unknown { msg_type: u8, body: Bytes },
}

impl HandshakeMessage {
    pub fn msg_type(&self) -> u8 {
        match self {
            HandshakeMessage::ClientHello(_) => HANDSHAKE_TYPE_CLIENT_HELLO,
            HandshakeMessage::ServerHello(_) => HANDSHAKE_TYPE_SERVER_HELLO,
            HandshakeMessage::EncryptedExtensions(_) => HANDSHAKE_TYPE_ENCRYPTED_EXTENSIONS,
            HandshakeMessage::Unknown { msg_type, .. } => *msg_type,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            HandshakeMessage::ClientHello(_) => "ClientHello",
            HandshakeMessage::ServerHello(_) => "ServerHello",
            HandshakeMessage::EncryptedExtensions(_) => "EncryptedExtensions",
            HandshakeMessage::Unknown { .. } => "Unknown",
        }
    }

    pub fn extensions(&self) -> &[Extension] {
        match self {
            HandshakeMessage::ClientHello(m) => &m.extensions,
            HandshakeMessage::ServerHello(m) => &m.extensions,
            HandshakeMessage::EncryptedExtensions(m) => &m.extensions,
            HandshakeMessage::Unknown { .. } => &[],
        }
    }

    pub fn transport_parameters(&self) -> Option<&[TransportParameter]> {
        find_transport_parameters(self.extensions())
    }

    /// Encode header and body.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        let mut body = BytesMut::new();
        match self {
            HandshakeMessage::ClientHello(m) => {
                body.put_u16(m.client_version);
                m.random.encode(&mut body);
                put_u8_prefixed(&mut body, &m.session_id)?;
                let suites_len = u16::try_from(m.cipher_suites.len() * 2)
                    .map_err(|_| Error::MalformedEncoding("too many cipher suites"))?;
                body.put_u16(suites_len);
                for suite in &m.cipher_suites {
                    body.put_u16(*suite);
                }
                put_u8_prefixed(&mut body, &m.compression_methods)?;
                encode_extensions(&m.extensions, &mut body)?;
            }
            HandshakeMessage::ServerHello(m) => {
                body.put_u16(m.server_version);
                m.random.encode(&mut body);
                put_u8_prefixed(&mut body, &m.session_id)?;
                body.put_u16(m.cipher_suite);
                body.put_u8(m.compression_method);
                encode_extensions(&m.extensions, &mut body)?;
            }
            HandshakeMessage::EncryptedExtensions(m) => {
                encode_extensions(&m.extensions, &mut body)?;
            }
            HandshakeMessage::Unknown { body: raw, .. } => body.put_slice(raw),
        }
        if body.len() > MAX_HANDSHAKE_BODY {
            return Err(Error::MalformedEncoding("handshake message longer than 2^24-1"));
        }
        buf.put_u8(self.msg_type());
        put_u24(buf, body.len() as u32);
        buf.put_slice(&body);
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode one complete message. The body must be entirely consumed.
    pub fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let msg_type = r.read_u8()?;
        let len = r.read_u24()? as usize;
        let body = r.read_bytes(len)?;
        Self::decode_body(msg_type, body)
    }

    pub(crate) fn decode_body(msg_type: u8, body: Bytes) -> Result<Self> {
        let mut r = Reader::new(&body, 0);
        let message = match msg_type {
            HANDSHAKE_TYPE_CLIENT_HELLO => {
                let client_version = r.read_u16()?;
                let random = Random::decode(&mut r)?;
                let session_id = read_u8_prefixed(&mut r)?;
                let suites_len = r.read_u16()? as usize;
                if suites_len % 2 != 0 {
                    return Err(Error::MalformedEncoding("odd cipher suite list length"));
                }
                let suites = r.read_bytes(suites_len)?;
                let cipher_suites = suites
                    .chunks_exact(2)
                    .map(|c| u16::from_be_bytes([c[0], c[1]]))
                    .collect();
                let compression_methods = read_u8_prefixed(&mut r)?;
                let extensions = decode_extensions(&mut r)?;
                HandshakeMessage::ClientHello(ClientHello {
                    client_version,
                    random,
                    session_id,
                    cipher_suites,
                    compression_methods,
                    extensions,
                })
            }
            HANDSHAKE_TYPE_SERVER_HELLO => HandshakeMessage::ServerHello(ServerHello {
                server_version: r.read_u16()?,
                random: Random::decode(&mut r)?,
                session_id: read_u8_prefixed(&mut r)?,
                cipher_suite: r.read_u16()?,
                compression_method: r.read_u8()?,
                extensions: decode_extensions(&mut r)?,
            }),
            HANDSHAKE_TYPE_ENCRYPTED_EXTENSIONS => {
                HandshakeMessage::EncryptedExtensions(EncryptedExtensions {
                    extensions: decode_extensions(&mut r)?,
                })
            }
            _ => {
                return Ok(HandshakeMessage::Unknown {
                    msg_type,
                    body: body.clone(),
                })
            }
        };
        if !r.is_empty() {
            return Err(Error::MalformedEncoding("trailing bytes in handshake message"));
        }
        Ok(message)
    }
}

fn put_u8_prefixed(buf: &mut BytesMut, data: &[u8]) -> Result<()> {
    let len = u8::try_from(data.len())
        .map_err(|_| Error::MalformedEncoding("field longer than 255 bytes"))?;
    buf.put_u8(len);
    buf.put_slice(data);
    Ok(())
}

fn read_u8_prefixed(r: &mut Reader<'_>) -> Result<Bytes> {
    let len = r.read_u8()? as usize;
    r.read_bytes(len)
}

/// First suite offered by the client that we support.
pub fn select_cipher_suite(offered: &[u16]) -> Option<u16> {
    offered
        .iter()
        .copied()
        .find(|suite| SUPPORTED_CIPHER_SUITES.contains(suite))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_hello() -> HandshakeMessage {
        HandshakeMessage::ClientHello(ClientHello {
            client_version: LEGACY_VERSION,
            random: Random::from_bytes([7u8; 32]),
            session_id: Bytes::new(),
            cipher_suites: vec![TLS_AES_128_GCM_SHA256, TLS_CHACHA20_POLY1305_SHA256],
            compression_methods: Bytes::from_static(&[0]),
            extensions: vec![Extension::QuicTransportParameters(vec![
                TransportParameter::InitialMaxData(4096),
            ])],
        })
    }

    mod codec_tests {
        use super::*;

        #[test]
        fn test_client_hello_roundtrip() {
            let msg = client_hello();
            let bytes = msg.to_bytes().unwrap();
            assert_eq!(bytes[0], HANDSHAKE_TYPE_CLIENT_HELLO);
            let body_len = u32::from_be_bytes([0, bytes[1], bytes[2], bytes[3]]) as usize;
            assert_eq!(body_len + HANDSHAKE_HEADER_LEN, bytes.len());
            assert_eq!(HandshakeMessage::decode(&mut Reader::new(&bytes, 0)).unwrap(), msg);
        }

        #[test]
        fn test_server_hello_roundtrip() {
            let msg = HandshakeMessage::ServerHello(ServerHello {
                server_version: LEGACY_VERSION,
                random: Random::default(),
                session_id: Bytes::from_static(&[1, 2, 3]),
                cipher_suite: TLS_AES_128_GCM_SHA256,
                compression_method: 0,
                extensions: vec![],
            });
            let bytes = msg.to_bytes().unwrap();
            assert_eq!(HandshakeMessage::decode(&mut Reader::new(&bytes, 0)).unwrap(), msg);
        }

        #[test]
        fn test_encrypted_extensions_layout() {
            let msg = HandshakeMessage::EncryptedExtensions(EncryptedExtensions::default());
            assert_eq!(&msg.to_bytes().unwrap()[..], &[8, 0, 0, 2, 0, 0]);
        }

        #[test]
        fn test_unknown_message_kept_raw() {
            let bytes = Bytes::from_static(&[20, 0, 0, 3, 0xaa, 0xbb, 0xcc]);
            let msg = HandshakeMessage::decode(&mut Reader::new(&bytes, 0)).unwrap();
            assert_eq!(
                msg,
                HandshakeMessage::Unknown {
                    msg_type: 20,
                    body: Bytes::from_static(&[0xaa, 0xbb, 0xcc]),
                }
            );
            assert_eq!(msg.to_bytes().unwrap(), bytes);
        }

        #[test]
        fn test_trailing_body_bytes_rejected() {
            let bytes = Bytes::from_static(&[8, 0, 0, 3, 0, 0, 0xff]);
            assert!(HandshakeMessage::decode(&mut Reader::new(&bytes, 0)).is_err());
        }
    }

    #[test]
    fn test_select_cipher_suite() {
        assert_eq!(select_cipher_suite(&[0x00ff, 0x1303]), Some(0x1303));
        assert_eq!(select_cipher_suite(&[0x00ff]), None);
    }

    #[test]
    fn test_transport_parameters_lookup() {
        assert_eq!(
            client_hello().transport_parameters(),
            Some(&[TransportParameter::InitialMaxData(4096)][..])
        );
    }
}
