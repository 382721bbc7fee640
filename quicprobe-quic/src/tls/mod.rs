//! # TLS Handshake Messages Carried in CRYPTO Frames (RFC 9001)
//!
//! Framing for ClientHello, ServerHello and EncryptedExtensions, the
//! extension list with the QUIC transport parameters extension, an
//! incremental parser, and per-level CRYPTO stream reassembly.
//!
//! No record layer and no key schedule: keys come from the crypto service.

pub mod extensions;
pub mod messages;
pub mod parser;
pub mod stream;

pub use extensions::{
    decode_extensions, encode_extensions, find_transport_parameters, Extension,
    EXT_QUIC_TRANSPORT_PARAMETERS,
};
pub use messages::{
    select_cipher_suite, ClientHello, EncryptedExtensions, HandshakeMessage, Random, ServerHello,
    LEGACY_VERSION, SUPPORTED_CIPHER_SUITES, TLS_AES_128_GCM_SHA256,
};
pub use parser::{parse_handshake_messages, HandshakeParse};
pub use stream::CryptoStream;
