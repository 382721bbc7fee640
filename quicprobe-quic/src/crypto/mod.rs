//! # Packet Protection Boundary (RFC 9001)
//!
//! [`CryptoService`] is the only interface between the state machine and
//! keying material. [`PlaintextCrypto`] is a deterministic implementation
//! for scripted peers and tests.

pub mod backend;
pub mod plaintext;

pub use backend::{
    CryptoService, EncryptionLevel, AEAD_TAG_LEN, HP_SAMPLE_LEN, INITIAL_SALT_V1,
};
pub use plaintext::PlaintextCrypto;
