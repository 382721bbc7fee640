//! # Flow Control (RFC 9000 Section 4)
//!
//! Connection and stream-level credit tracking.

pub mod controller;

pub use controller::{ConnectionFlowControl, RecvWindow, SendCredit};
