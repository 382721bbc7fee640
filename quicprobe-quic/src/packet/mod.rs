//! # QUIC Packet Processing (RFC 9000 Section 17, RFC 9001 Section 5)
//!
//! Header parsing, packet-number truncation, packet encoding and
//! protection.

pub mod header;
pub mod number;
pub mod protection;
pub mod types;

pub use header::{extract_dcid, parse_header, PacketHeader, PacketType};
pub use protection::{open_packet, protect, seal_packet, unprotect, OpenedPacket};
pub use types::{Packet, PlainPacket};
