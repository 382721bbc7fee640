//! Deterministic, non-secret packet protection.
//!
//! Payloads travel in the clear followed by a 16-byte keyed checksum, and
//! header protection XORs the sample with per-level key bytes. Two
//! instances that saw the same key installations agree on every packet,
//! which is all a scripted peer and the test suite need. Nothing here
//! resists an attacker.

#![forbid(unsafe_code)]

use super::backend::{CryptoService, EncryptionLevel, AEAD_TAG_LEN, HP_SAMPLE_LEN};
use crate::error::{Error, Result};
use crate::types::{ConnectionId, PacketNumber};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(seed: u64, parts: &[&[u8]]) -> u64 {
    let mut hash = seed;
    for part in parts {
        for byte in *part {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        // length separator so ("ab","c") and ("a","bc") differ
        hash ^= part.len() as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Keyed checksum AEAD with XOR header protection.
#[derive(Debug, Default, Clone)]
pub struct PlaintextCrypto {
    keys: HashMap<(ConnectionId, EncryptionLevel), u64>,
}

impl PlaintextCrypto {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(&self, cid: &ConnectionId, level: EncryptionLevel) -> Option<u64> {
        self.keys.get(&(cid.clone(), level)).copied()
    }

    fn tag(key: u64, packet_number: PacketNumber, ad: &[u8], payload: &[u8]) -> [u8; AEAD_TAG_LEN] {
        let pn = packet_number.to_be_bytes();
        let hi = fnv1a(key, &[&pn, ad, payload]);
        let lo = fnv1a(key ^ FNV_OFFSET, &[payload, ad, &pn]);
        let mut out = [0u8; AEAD_TAG_LEN];
        out[..8].copy_from_slice(&hi.to_be_bytes());
        out[8..].copy_from_slice(&lo.to_be_bytes());
        out
    }
}

impl CryptoService for PlaintextCrypto {
    fn derive_initial_keys(&mut self, cid: &ConnectionId, salt: &[u8], ikm: &[u8]) -> Result<()> {
        let key = fnv1a(FNV_OFFSET, &[salt, ikm]);
        self.keys.insert((cid.clone(), EncryptionLevel::Initial), key);
        Ok(())
    }

    fn install_keys(&mut self, cid: &ConnectionId, level: EncryptionLevel) -> Result<()> {
        let initial = self
            .key(cid, EncryptionLevel::Initial)
            .ok_or(Error::MalformedEncoding("install_keys before Initial keys"))?;
        let key = fnv1a(initial, &[level.name().as_bytes()]);
        self.keys.insert((cid.clone(), level), key);
        Ok(())
    }

    fn has_keys(&self, cid: &ConnectionId, level: EncryptionLevel) -> bool {
        self.keys.contains_key(&(cid.clone(), level))
    }

    fn discard_keys(&mut self, cid: &ConnectionId, level: Option<EncryptionLevel>) {
        match level {
            Some(level) => {
                self.keys.remove(&(cid.clone(), level));
            }
            None => self.keys.retain(|(c, _), _| c != cid),
        }
    }

    fn encrypt_aead(
        &self,
        cid: &ConnectionId,
        level: EncryptionLevel,
        plaintext: &[u8],
        packet_number: PacketNumber,
        associated_data: &[u8],
    ) -> Result<Bytes> {
        let key = self
            .key(cid, level)
            .ok_or(Error::MalformedEncoding("no keys for encryption level"))?;
        let mut out = BytesMut::with_capacity(plaintext.len() + AEAD_TAG_LEN);
        out.put_slice(plaintext);
        out.put_slice(&Self::tag(key, packet_number, associated_data, plaintext));
        Ok(out.freeze())
    }

    fn decrypt_aead(
        &self,
        cid: &ConnectionId,
        level: EncryptionLevel,
        ciphertext: &[u8],
        packet_number: PacketNumber,
        associated_data: &[u8],
    ) -> Option<Bytes> {
        let key = self.key(cid, level)?;
        let split = ciphertext.len().checked_sub(AEAD_TAG_LEN)?;
        let (payload, tag) = ciphertext.split_at(split);
        if Self::tag(key, packet_number, associated_data, payload) != tag {
            return None;
        }
        Some(Bytes::copy_from_slice(payload))
    }

    fn header_protection_mask(
        &self,
        cid: &ConnectionId,
        level: EncryptionLevel,
        sample: &[u8],
    ) -> Option<[u8; 5]> {
        if sample.len() < HP_SAMPLE_LEN {
            return None;
        }
        let key = self.key(cid, level)?.to_be_bytes();
        let mut mask = [0u8; 5];
        for (i, m) in mask.iter_mut().enumerate() {
            *m = sample[i] ^ key[i];
        }
        Some(mask)
    }
}
