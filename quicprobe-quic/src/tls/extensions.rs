//! TLS extension encoding and decoding.
//!
//! Extension format: type (2 bytes) + length (2 bytes) + data. Only the
//! QUIC transport parameters extension is interpreted; every other type is
//! kept as raw bytes so it re-encodes unchanged.

#![forbid(unsafe_code)]

use crate::buffer::Reader;
use crate::error::{Error, Result};
use crate::transport::{decode_list, encode_list, TransportParameter};
use bytes::{BufMut, Bytes, BytesMut};

/// quic_transport_parameters (RFC 9001 Section 8.2)
pub const EXT_QUIC_TRANSPORT_PARAMETERS: u16 = 0x0039;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Extension {
    QuicTransportParameters(Vec<TransportParameter>),
    Unknown { ext_type: u16, content: Bytes },
}

impl Extension {
    pub fn ext_type(&self) -> u16 {
        match self {
            Extension::QuicTransportParameters(_) => EXT_QUIC_TRANSPORT_PARAMETERS,
            Extension::Unknown { ext_type, .. } => *ext_type,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        let content = match self {
            Extension::QuicTransportParameters(params) => {
                let mut content = BytesMut::new();
                encode_list(params, &mut content)?;
                content.freeze()
            }
            Extension::Unknown { content, .. } => content.clone(),
        };
        let len = u16::try_from(content.len())
            .map_err(|_| Error::MalformedEncoding("extension longer than 65535 bytes"))?;
        buf.put_u16(self.ext_type());
        buf.put_u16(len);
        buf.put_slice(&content);
        Ok(())
    }

    /// Decode one extension.
    ///
    /// A transport parameter list that does not parse is reported as a
    /// TRANSPORT_PARAMETER_ERROR rather than a framing error.
    pub fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let ext_type = r.read_u16()?;
        let len = r.read_u16()? as usize;
        let content = r.read_bytes(len)?;
        match ext_type {
            EXT_QUIC_TRANSPORT_PARAMETERS => decode_list(&content)
                .map(Extension::QuicTransportParameters)
                .map_err(|e| {
                    if e.is_codec() {
                        Error::transport_parameter("malformed transport parameter list")
                    } else {
                        e
                    }
                }),
            _ => Ok(Extension::Unknown { ext_type, content }),
        }
    }
}

/// Encode an extension block with its 2-byte length prefix.
pub fn encode_extensions(extensions: &[Extension], buf: &mut BytesMut) -> Result<()> {
    let mut block = BytesMut::new();
    for ext in extensions {
        ext.encode(&mut block)?;
    }
    let len = u16::try_from(block.len())
        .map_err(|_| Error::MalformedEncoding("extension block longer than 65535 bytes"))?;
    buf.put_u16(len);
    buf.put_slice(&block);
    Ok(())
}

/// Decode a length-prefixed extension block.
pub fn decode_extensions(r: &mut Reader<'_>) -> Result<Vec<Extension>> {
    let len = r.read_u16()? as usize;
    let block = r.read_bytes(len)?;
    let mut inner = Reader::new(&block, 0);
    let mut out = Vec::new();
    while !inner.is_empty() {
        out.push(Extension::decode(&mut inner)?);
    }
    Ok(out)
}

/// Transport parameters carried in an extension list, if any.
///
/// When the extension appears more than once the last one is used.
pub fn find_transport_parameters(extensions: &[Extension]) -> Option<&[TransportParameter]> {
    extensions.iter().rev().find_map(|ext| match ext {
        Extension::QuicTransportParameters(params) => Some(params.as_slice()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;

    #[test]
    fn test_extension_block_roundtrip() {
        let exts = vec![
            Extension::Unknown {
                ext_type: 0x002b,
                content: Bytes::from_static(&[0x02, 0x03, 0x04]),
            },
            Extension::QuicTransportParameters(vec![
                TransportParameter::InitialMaxData(1 << 20),
                TransportParameter::DisableActiveMigration,
            ]),
        ];
        let mut buf = BytesMut::new();
        encode_extensions(&exts, &mut buf).unwrap();
        let bytes = buf.freeze();
        let mut r = Reader::new(&bytes, 0);
        assert_eq!(decode_extensions(&mut r).unwrap(), exts);
        assert!(r.is_empty());
    }

    #[test]
    fn test_wire_layout() {
        let mut buf = BytesMut::new();
        Extension::Unknown {
            ext_type: 0x0010,
            content: Bytes::from_static(b"h3"),
        }
        .encode(&mut buf)
        .unwrap();
        assert_eq!(&buf[..], &[0x00, 0x10, 0x00, 0x02, b'h', b'3']);
    }

    #[test]
    fn test_malformed_parameters_are_transport_parameter_error() {
        // id 0x04 with declared length 4 but only one byte of value
        let bytes = Bytes::from_static(&[0x00, 0x39, 0x00, 0x03, 0x04, 0x04, 0x01]);
        let err = Extension::decode(&mut Reader::new(&bytes, 0)).unwrap_err();
        assert_eq!(err.transport_error(), Some(TransportError::TransportParameterError));
    }

    #[test]
    fn test_truncated_extension_is_malformed() {
        let bytes = Bytes::from_static(&[0x00, 0x10, 0x00, 0x05, b'h']);
        assert!(Extension::decode(&mut Reader::new(&bytes, 0))
            .unwrap_err()
            .is_codec());
    }

    #[test]
    fn test_find_transport_parameters_uses_last() {
        let exts = vec![
            Extension::QuicTransportParameters(vec![TransportParameter::MaxIdleTimeout(1)]),
            Extension::QuicTransportParameters(vec![TransportParameter::MaxIdleTimeout(2)]),
        ];
        assert_eq!(
            find_transport_parameters(&exts),
            Some(&[TransportParameter::MaxIdleTimeout(2)][..])
        );
        assert_eq!(find_transport_parameters(&[]), None);
    }
}
