//! quicprobe-quic: QUIC transport for protocol conformance testing
//!
//! A single-threaded QUIC v1 endpoint whose every decision is observable.
//! It parses and builds packets and frames, runs the connection, stream
//! and flow-control state machines, drives a minimal TLS handshake over
//! CRYPTO frames, and reports what it did as an ordered stream of
//! [`Event`]s.
//!
//! # Architecture
//!
//! - **No I/O**: datagrams go out through a [`services::NetworkService`];
//!   randomness comes from a [`services::RandomSource`]
//! - **Crypto boundary**: keys never leave the [`crypto::CryptoService`];
//!   connections refer to them by key cid
//! - **Run to completion**: each datagram, timer tick or application call
//!   is processed fully, then queued frames are flushed
//!
//! # RFC Coverage
//!
//! - **RFC 9000**: packets, frames, streams, flow control, connection IDs
//! - **RFC 9001**: packet and header protection, handshake framing
//! - **RFC 8446**: ClientHello, ServerHello, EncryptedExtensions encoding
//! - **draft-ietf-quic-ack-frequency**: ACK_FREQUENCY and min_ack_delay
//!
//! # Module Organization
//!
//! - `buffer`: varint codec and bounds-checked reading
//! - `frames`: frame types, parsing and encoding
//! - `packet`: headers, packet numbers, protection
//! - `transport`: transport parameters
//! - `tls`: handshake messages and CRYPTO stream reassembly
//! - `stream`, `flow_control`: stream states and credit
//! - `connection`: connection state, dispatch and the endpoint
//! - `peer`: a raw client for scripted runs

pub mod buffer;
pub mod connection;
pub mod crypto;
pub mod error;
pub mod flow_control;
pub mod frames;
pub mod packet;
pub mod peer;
pub mod services;
pub mod stream;
pub mod tls;
pub mod transport;
pub mod types;

pub use connection::{Connection, ConnectionState, Endpoint, EndpointConfig, Event, Timer};
pub use crypto::{CryptoService, EncryptionLevel, PlaintextCrypto};
pub use error::{Error, Result, TransportError};
pub use frames::Frame;
pub use packet::{Packet, PacketType};
pub use peer::{RawClient, ReceivedPacket};
pub use services::{Datagram, MemoryNetwork, NetworkService, RandomSource, SeededRandom};
pub use stream::{RecvStreamState, SendStreamState};
pub use transport::TransportParameters;
pub use types::{ConnectionId, Side, StreamId};
