//! # Streams (RFC 9000 Sections 2, 3)
//!
//! Reassembly buffers, per-direction stream state machines and the
//! per-connection stream map.

pub mod buffer;
pub mod controller;
pub mod manager;

pub use buffer::{RangeSet, ReassemblyBuffer};
pub use controller::{RecvStream, RecvStreamState, SendStream, SendStreamState};
pub use manager::{StreamLimits, StreamMap};
