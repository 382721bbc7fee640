//! # QUIC Frame Parsing and Types (RFC 9000 Section 12.4, 19)
//!
//! The 23 frame variants this endpoint speaks, their decoder and encoder.

pub mod encode;
pub mod parse;
pub mod types;

pub use encode::encode_frames;
pub use parse::{parse_frames, DefaultFrameParser, FrameIterator, FrameParser};
pub use types::*;
