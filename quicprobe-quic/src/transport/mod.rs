//! # Transport Parameters (RFC 9000 Section 18)

pub mod parameters;

pub use parameters::{
    decode_list, encode_list, PreferredAddress, TransportParameter, TransportParameterId,
    TransportParameters,
};
