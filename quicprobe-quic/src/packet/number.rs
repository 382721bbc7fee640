//! # Packet Number Encoding/Decoding (RFC 9000 Section 17.1)
//!
//! Packet numbers use **truncated encoding**: only the low bits needed to
//! disambiguate from recently received packets go on the wire.
//!
//! ## Decoding (RFC 9000 Appendix A.3)
//!
//! ```text
//! expected  = largest received in the space + 1   (0 if none)
//! candidate = expected with its low `bits` replaced by the truncated value
//! pick whichever of candidate, candidate ± 2^bits lies closest to expected;
//! an exact tie goes to the smaller value
//! ```

#![forbid(unsafe_code)]

use crate::error::{Error, Result};
use crate::types::PacketNumber;

/// Largest packet number a sender may use (RFC 9000 Section 12.3)
pub const MAX_PACKET_NUMBER: u64 = (1 << 62) - 1;

/// Bytes needed to send `full_pn` given what the peer has acknowledged
/// (RFC 9000 Appendix A.2).
///
/// The window must cover twice the unacknowledged range.
pub fn encode_length(full_pn: PacketNumber, largest_acked: Option<PacketNumber>) -> usize {
    let num_unacked = match largest_acked {
        Some(acked) => full_pn.saturating_sub(acked),
        None => full_pn + 1,
    };

    let num_bits = (64 - num_unacked.leading_zeros()) as usize + 1;
    match num_bits {
        0..=8 => 1,
        9..=16 => 2,
        17..=24 => 3,
        _ => 4,
    }
}

/// Low `len` bytes of a packet number, big-endian.
pub fn truncate(full_pn: PacketNumber, len: usize) -> [u8; 4] {
    let bytes = (full_pn as u32).to_be_bytes();
    let mut out = [0u8; 4];
    out[..len].copy_from_slice(&bytes[4 - len..]);
    out
}

/// Decode a truncated packet number against the next expected number.
///
/// # Errors
/// Returns an error if `pn_nbits` is not 8, 16, 24, or 32.
pub fn decode(truncated_pn: u64, pn_nbits: usize, expected_pn: PacketNumber) -> Result<PacketNumber> {
    if !matches!(pn_nbits, 8 | 16 | 24 | 32) {
        return Err(Error::MalformedEncoding("packet number length"));
    }

    let win = 1u64 << pn_nbits;
    let hwin = win / 2;
    let mask = win - 1;
    let candidate = (expected_pn & !mask) | (truncated_pn & mask);

    // `candidate + hwin < expected` sends exact ties (distance == hwin)
    // to the lower candidate, as does the `>=` on the upper side.
    let full = if candidate + hwin < expected_pn && candidate <= MAX_PACKET_NUMBER - win {
        candidate + win
    } else if candidate >= expected_pn + hwin && candidate >= win {
        candidate - win
    } else {
        candidate
    };
    Ok(full)
}

/// Recover the full packet number in a space whose largest received
/// number is `last` (None before the first packet).
pub fn correct(last: Option<PacketNumber>, truncated_pn: u64, pn_len: usize) -> Result<PacketNumber> {
    let expected = last.map_or(0, |pn| pn + 1);
    decode(truncated_pn, pn_len * 8, expected)
}
