//! # QUIC Connections (RFC 9000 Sections 5, 10)
//!
//! Connection state, frame dispatch, handshake driving and the endpoint
//! that routes datagrams to connections.

pub mod cid_manager;
pub mod endpoint;
pub mod events;
pub mod handlers;
pub mod handshake;
mod packetizer;
pub mod registry;
pub mod state;

#[cfg(test)]
mod tests;

pub use cid_manager::{IssuedConnectionId, LocalConnectionIds, RemoteConnectionIds};
pub use endpoint::{Endpoint, Timer};
pub use events::{Direction, Event};
pub use handlers::{handle_frame, HandlerContext, PacketInfo};
pub use registry::{CidRoutes, ConnectionRegistry};
pub use state::{
    default_transport_parameters, AckPolicy, Connection, ConnectionState, ConnectionStats,
    EndpointConfig, HandshakeProgress, PacketSpace, SentPacket,
};
