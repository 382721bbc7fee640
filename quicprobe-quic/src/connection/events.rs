//! # Observer Events
//!
//! The endpoint queues an [`Event`] for everything a conformance script
//! may want to assert on. Events are only ever appended; the driver
//! drains them after each external input.

#![forbid(unsafe_code)]

use super::state::ConnectionState;
use crate::crypto::EncryptionLevel;
use crate::frames::Frame;
use crate::stream::{RecvStreamState, SendStreamState};
use crate::transport::TransportParameters;
use crate::types::{ConnectionId, PacketNumber, StreamId};

/// Direction of a TLS handshake message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sent,
    Received,
}

impl Direction {
    pub fn name(self) -> &'static str {
        match self {
            Direction::Sent => "sent",
            Direction::Received => "received",
        }
    }
}

/// Observer event.
///
/// `cid` is the key cid of the connection (the client's first
/// Destination Connection ID), or the header cid for packets no
/// connection could be found for.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    PacketReceived {
        cid: ConnectionId,
        level: EncryptionLevel,
        packet_number: PacketNumber,
    },
    PacketSent {
        cid: ConnectionId,
        level: EncryptionLevel,
        packet_number: PacketNumber,
    },
    PacketUndecryptable {
        cid: ConnectionId,
        level: EncryptionLevel,
    },
    FrameHandled {
        cid: ConnectionId,
        level: EncryptionLevel,
        frame: Frame,
    },
    TlsClientInitialRequest {
        cid: ConnectionId,
    },
    TlsHandshake {
        cid: ConnectionId,
        direction: Direction,
        message: &'static str,
    },
    KeysEstablished {
        cid: ConnectionId,
        level: EncryptionLevel,
    },
    HandshakeDoneSent {
        cid: ConnectionId,
    },
    HandshakeDoneReceived {
        cid: ConnectionId,
    },
    TransportParametersReceived {
        cid: ConnectionId,
        params: Box<TransportParameters>,
    },
    StreamOpened {
        cid: ConnectionId,
        stream_id: StreamId,
    },
    SendStreamStateChanged {
        cid: ConnectionId,
        stream_id: StreamId,
        state: SendStreamState,
    },
    RecvStreamStateChanged {
        cid: ConnectionId,
        stream_id: StreamId,
        state: RecvStreamState,
    },
    PathValidated {
        cid: ConnectionId,
        data: [u8; 8],
    },
    ConnectionStateChanged {
        cid: ConnectionId,
        state: ConnectionState,
    },
    ConnectionError {
        cid: ConnectionId,
        code: u64,
        reason: String,
    },
}

impl Event {
    /// Snake-case name used by scripts
    pub fn name(&self) -> &'static str {
        match self {
            Event::PacketReceived { .. } => "packet_received",
            Event::PacketSent { .. } => "packet_sent",
            Event::PacketUndecryptable { .. } => "packet_undecryptable",
            Event::FrameHandled { .. } => "frame_handled",
            Event::TlsClientInitialRequest { .. } => "tls_client_initial_request",
            Event::TlsHandshake { .. } => "tls_handshake_event",
            Event::KeysEstablished { .. } => "keys_established",
            Event::HandshakeDoneSent { .. } => "handshake_done_sent",
            Event::HandshakeDoneReceived { .. } => "handshake_done_received",
            Event::TransportParametersReceived { .. } => "transport_parameters_received",
            Event::StreamOpened { .. } => "stream_opened",
            Event::SendStreamStateChanged { .. } => "send_stream_state",
            Event::RecvStreamStateChanged { .. } => "recv_stream_state",
            Event::PathValidated { .. } => "path_validated",
            Event::ConnectionStateChanged { .. } => "connection_state",
            Event::ConnectionError { .. } => "connection_error",
        }
    }

    pub fn cid(&self) -> &ConnectionId {
        match self {
            Event::PacketReceived { cid, .. }
            | Event::PacketSent { cid, .. }
            | Event::PacketUndecryptable { cid, .. }
            | Event::FrameHandled { cid, .. }
            | Event::TlsClientInitialRequest { cid }
            | Event::TlsHandshake { cid, .. }
            | Event::KeysEstablished { cid, .. }
            | Event::HandshakeDoneSent { cid }
            | Event::HandshakeDoneReceived { cid }
            | Event::TransportParametersReceived { cid, .. }
            | Event::StreamOpened { cid, .. }
            | Event::SendStreamStateChanged { cid, .. }
            | Event::RecvStreamStateChanged { cid, .. }
            | Event::PathValidated { cid, .. }
            | Event::ConnectionStateChanged { cid, .. }
            | Event::ConnectionError { cid, .. } => cid,
        }
    }

    /// The one attribute a script may match on besides the name: a level,
    /// message name, frame name, state or error code.
    pub fn detail(&self) -> Option<String> {
        match self {
            Event::PacketReceived { level, .. }
            | Event::PacketSent { level, .. }
            | Event::PacketUndecryptable { level, .. }
            | Event::KeysEstablished { level, .. } => Some(level.name().to_string()),
            Event::FrameHandled { frame, .. } => Some(frame.name().to_string()),
            Event::TlsHandshake { message, .. } => Some((*message).to_string()),
            Event::SendStreamStateChanged { state, .. } => Some(format!("{state:?}")),
            Event::RecvStreamStateChanged { state, .. } => Some(format!("{state:?}")),
            Event::ConnectionStateChanged { state, .. } => Some(format!("{state:?}")),
            Event::ConnectionError { code, .. } => Some(format!("{code:#x}")),
            _ => None,
        }
    }

    /// Stream the event concerns, if any
    pub fn stream_id(&self) -> Option<StreamId> {
        match self {
            Event::StreamOpened { stream_id, .. }
            | Event::SendStreamStateChanged { stream_id, .. }
            | Event::RecvStreamStateChanged { stream_id, .. } => Some(*stream_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_and_details() {
        let cid = ConnectionId::from_u64(1);
        let event = Event::KeysEstablished {
            cid: cid.clone(),
            level: EncryptionLevel::OneRtt,
        };
        assert_eq!(event.name(), "keys_established");
        assert_eq!(event.detail().as_deref(), Some("one_rtt"));
        assert_eq!(event.cid(), &cid);

        let event = Event::TlsHandshake {
            cid,
            direction: Direction::Sent,
            message: "ServerHello",
        };
        assert_eq!(event.detail().as_deref(), Some("ServerHello"));
        assert_eq!(event.stream_id(), None);
    }
}
