//! # Connection Module Tests (RFC 9000 Sections 5, 10, 12, 19; RFC 9001 Section 4)
//!
//! Endpoint-level tests. A server [`Endpoint`] is driven either by a
//! [`RawClient`] that writes frames directly, or by a client endpoint
//! over an in-memory network.
//!
//! ## Test Coverage
//!
//! 1. **Handshake** - event order, coalescing, acceptance rules
//! 2. **Streams** - delivery, final size, flow control, resets
//! 3. **Connection IDs** - issue, retire, never re-bind
//! 4. **Closing** - Closing, Draining, Closed and the single resend
//! 5. **Frame rules** - level legality and per-frame checks

#![cfg(test)]

use super::*;
use crate::crypto::{CryptoService, EncryptionLevel, PlaintextCrypto, INITIAL_SALT_V1};
use crate::error::{Error, TransportError};
use crate::frames::{
    AckFrame, AckFrequencyFrame, ConnectionCloseFrame, Frame, NewConnectionIdFrame, NewTokenFrame,
    PathChallengeFrame, PathResponseFrame, ResetStreamFrame, RetireConnectionIdFrame, StreamFrame,
};
use crate::packet::{seal_packet, Packet, PacketType};
use crate::peer::RawClient;
use crate::services::{MemoryNetwork, SeededRandom};
use crate::stream::{RecvStreamState, SendStreamState};
use crate::types::{ConnectionId, StreamId, QUIC_VERSION_1};
use bytes::Bytes;
use std::net::SocketAddr;

fn client_addr() -> SocketAddr {
    "192.0.2.1:50000".parse().unwrap()
}

fn server_addr() -> SocketAddr {
    "192.0.2.2:4433".parse().unwrap()
}

fn endpoint(config: EndpointConfig, seed: u64) -> (Endpoint, MemoryNetwork) {
    let net = MemoryNetwork::new();
    let endpoint = Endpoint::new(
        config,
        Box::new(PlaintextCrypto::new()),
        Box::new(net.clone()),
        Box::new(SeededRandom::new(seed)),
    );
    (endpoint, net)
}

fn names(events: &[Event]) -> Vec<&'static str> {
    events.iter().map(Event::name).collect()
}

/// Assert `expected` appears in `events` in order, not necessarily adjacent.
fn assert_subsequence(events: &[Event], expected: &[(&str, Option<&str>)]) {
    let mut remaining = expected.iter().peekable();
    for event in events {
        if let Some((name, detail)) = remaining.peek() {
            let detail_matches = detail.map_or(true, |d| event.detail().as_deref() == Some(d));
            if event.name() == *name && detail_matches {
                remaining.next();
            }
        }
    }
    assert!(
        remaining.peek().is_none(),
        "missing {:?} in {:?}",
        remaining.collect::<Vec<_>>(),
        names(events)
    );
}

/// Server endpoint plus a raw client addressing it.
struct Harness {
    server: Endpoint,
    net: MemoryNetwork,
    peer: RawClient,
    rng: SeededRandom,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(EndpointConfig::server())
    }

    fn with_config(config: EndpointConfig) -> Self {
        let (server, net) = endpoint(config, 11);
        let peer = RawClient::new(ConnectionId::from_slice(&[0x01]).unwrap(), ConnectionId::from_u64(0xc1)).unwrap();
        Self {
            server,
            net,
            peer,
            rng: SeededRandom::new(5),
        }
    }

    /// Handshake completed and events discarded
    fn established() -> Self {
        let mut h = Self::new();
        h.handshake();
        h.server.drain_events();
        h
    }

    fn key(&self) -> ConnectionId {
        self.peer.key().clone()
    }

    fn conn(&self) -> &Connection {
        self.server.connection(self.peer.key()).unwrap()
    }

    fn received(&mut self) -> Vec<Frame> {
        let datagrams = self.net.drain();
        self.peer
            .receive_all(datagrams.iter().map(|d| &d.payload))
            .unwrap()
    }

    fn deliver(&mut self, datagram: Bytes) -> Vec<Frame> {
        self.server.recv(client_addr(), datagram).unwrap();
        self.received()
    }

    fn handshake(&mut self) -> Vec<Frame> {
        let params = self.peer.transport_parameters();
        let datagram = self.peer.client_hello(&mut self.rng, &params).unwrap();
        self.deliver(datagram)
    }

    fn send(&mut self, level: EncryptionLevel, frames: Vec<Frame>) -> Vec<Frame> {
        let datagram = self.peer.packet(level, frames).unwrap();
        self.deliver(datagram)
    }

    fn send_1rtt(&mut self, frames: Vec<Frame>) -> Vec<Frame> {
        self.send(EncryptionLevel::OneRtt, frames)
    }

    fn error_codes(&self) -> Vec<u64> {
        self.conn().error_codes().iter().copied().collect()
    }
}

fn stream(id: u64, offset: u64, data: &'static [u8], fin: bool) -> Frame {
    Frame::Stream(StreamFrame {
        stream_id: StreamId(id),
        offset,
        fin,
        data: Bytes::from_static(data),
    })
}

fn close_code(frames: &[Frame]) -> Option<u64> {
    frames.iter().find_map(|f| match f {
        Frame::ConnectionClose(c) => Some(c.error_code),
        Frame::ApplicationClose(c) => Some(c.error_code),
        _ => None,
    })
}

/// Client and server endpoints wired back to back.
struct Pair {
    client: Endpoint,
    client_net: MemoryNetwork,
    server: Endpoint,
    server_net: MemoryNetwork,
    key: ConnectionId,
}

impl Pair {
    fn new() -> Self {
        Self::with_server_config(EndpointConfig::server())
    }

    fn with_server_config(config: EndpointConfig) -> Self {
        let (mut client, client_net) = endpoint(EndpointConfig::client(), 21);
        let (server, server_net) = endpoint(config, 22);
        let key = client.connect(server_addr()).unwrap();
        let mut pair = Self {
            client,
            client_net,
            server,
            server_net,
            key,
        };
        pair.pump();
        pair
    }

    fn pump(&mut self) {
        for _ in 0..32 {
            let to_server = self.client_net.drain();
            let to_client = self.server_net.drain();
            if to_server.is_empty() && to_client.is_empty() {
                return;
            }
            for datagram in to_server {
                self.server.recv(client_addr(), datagram.payload).unwrap();
            }
            for datagram in to_client {
                self.client.recv(server_addr(), datagram.payload).unwrap();
            }
        }
        panic!("endpoints did not go quiet");
    }

    fn client_conn(&self) -> &Connection {
        self.client.connection(&self.key).unwrap()
    }

    fn server_conn(&self) -> &Connection {
        self.server.connection(&self.key).unwrap()
    }
}

// ============================================================================
// Handshake (RFC 9001 Section 4)
// ============================================================================

mod handshake_tests {
    use super::*;

    /// RFC 9001 §4.1: server reacts to a ClientHello in the documented order
    #[test]
    fn test_server_handshake_event_order() {
        let mut h = Harness::new();
        h.handshake();
        let events = h.server.drain_events();
        assert_subsequence(
            &events,
            &[
                ("packet_received", Some("initial")),
                ("tls_client_initial_request", None),
                ("tls_handshake_event", Some("ServerHello")),
                ("keys_established", Some("handshake")),
                ("keys_established", Some("one_rtt")),
                ("handshake_done_sent", None),
            ],
        );
        assert!(events.iter().all(|e| e.cid() == &h.key()));
        assert_eq!(h.conn().state(), ConnectionState::Established);
    }

    /// RFC 9000 §12.2: Initial, Handshake and 1-RTT coalesced in one datagram
    #[test]
    fn test_server_flight_is_one_coalesced_datagram() {
        let mut h = Harness::new();
        let params = h.peer.transport_parameters();
        let datagram = h.peer.client_hello(&mut h.rng, &params).unwrap();
        h.server.recv(client_addr(), datagram).unwrap();

        let sent = h.net.drain();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].addr, client_addr());
        let packets = h.peer.receive(&sent[0].payload).unwrap();
        let levels: Vec<EncryptionLevel> = packets.iter().map(|p| p.level).collect();
        assert_eq!(
            levels,
            vec![EncryptionLevel::Initial, EncryptionLevel::Handshake, EncryptionLevel::OneRtt]
        );
        assert!(matches!(packets[0].frames[0], Frame::Ack(_)));
        assert!(packets[2].frames.contains(&Frame::HandshakeDone));
        assert!(packets[2]
            .frames
            .iter()
            .any(|f| matches!(f, Frame::NewConnectionId(n) if n.sequence_number == 1)));
    }

    /// RFC 9000 §7.3: server parameters echo the client's first DCID
    #[test]
    fn test_server_parameters_carry_connection_ids() {
        let h = Harness::established();
        let params = h.conn().local_params();
        assert_eq!(params.original_destination_connection_id.as_ref(), Some(&h.key()));
        assert_eq!(params.initial_source_connection_id.as_ref(), Some(h.conn().local_scid()));
        assert_eq!(h.peer.dcid(), h.conn().local_scid());
        let peer = h.conn().peer_params().unwrap();
        assert_eq!(peer.initial_source_connection_id.as_ref(), Some(h.peer.scid()));
    }

    /// RFC 9000 §14.1: Initial datagrams below 1200 bytes do not create state
    #[test]
    fn test_short_initial_datagram_is_dropped() {
        let key = ConnectionId::from_u64(0x77);
        let mut crypto = PlaintextCrypto::new();
        crypto
            .derive_initial_keys(&key, INITIAL_SALT_V1, key.as_bytes())
            .unwrap();
        let packet = Packet {
            packet_type: PacketType::Initial,
            version: QUIC_VERSION_1,
            dcid: key.clone(),
            scid: ConnectionId::from_u64(1),
            token: Bytes::new(),
            packet_number: 0,
            frames: vec![Frame::Ping],
        };
        let datagram = seal_packet(&crypto, &key, &packet, None, 0).unwrap();
        assert!(datagram.len() < 1200);

        let (mut server, net) = endpoint(EndpointConfig::server(), 1);
        server.recv(client_addr(), datagram).unwrap();
        assert!(server.registry().is_empty());
        assert!(net.is_empty());
        assert_eq!(names(&server.drain_events()), vec!["packet_undecryptable"]);
    }

    /// RFC 9001 §4.9: packets for a level without keys are undecryptable
    #[test]
    fn test_handshake_packet_before_keys_is_undecryptable() {
        let mut h = Harness::new();
        let frames = h.send(EncryptionLevel::Initial, vec![Frame::Ping]);
        assert!(frames.iter().any(|f| matches!(f, Frame::Ack(_))));
        assert_eq!(h.conn().state(), ConnectionState::Initial);

        h.send(EncryptionLevel::Handshake, vec![Frame::Ping]);
        assert_eq!(h.conn().stats().packets_undecryptable, 1);
        let events = h.server.drain_events();
        assert!(events.iter().any(|e| matches!(
            e,
            Event::PacketUndecryptable { level: EncryptionLevel::Handshake, .. }
        )));
    }

    /// RFC 9001 §8.2: a ClientHello without transport parameters fails the handshake
    #[test]
    fn test_client_hello_without_parameters_is_crypto_error() {
        use crate::tls::{ClientHello, HandshakeMessage, Random, LEGACY_VERSION, SUPPORTED_CIPHER_SUITES};

        let mut h = Harness::new();
        let hello = HandshakeMessage::ClientHello(ClientHello {
            client_version: LEGACY_VERSION,
            random: Random::from_bytes([7; 32]),
            session_id: Bytes::new(),
            cipher_suites: SUPPORTED_CIPHER_SUITES.to_vec(),
            compression_methods: Bytes::from_static(&[0]),
            extensions: Vec::new(),
        });
        let frame = h
            .peer
            .crypto_frame(EncryptionLevel::Initial, hello.to_bytes().unwrap());
        let frames = h.send(EncryptionLevel::Initial, vec![frame]);

        let code = crate::error::CRYPTO_ERROR_BASE + u64::from(crate::error::ALERT_MISSING_EXTENSION);
        assert_eq!(h.error_codes(), vec![code]);
        assert_eq!(close_code(&frames), Some(code));
        assert_eq!(h.conn().state(), ConnectionState::Closing);
    }

    /// RFC 9000 §7.3: initial_source_connection_id must match the header
    #[test]
    fn test_mismatched_initial_scid_is_transport_parameter_error() {
        let mut h = Harness::new();
        let mut params = h.peer.transport_parameters();
        params.initial_source_connection_id = Some(ConnectionId::from_u64(0xdead));
        let datagram = h.peer.client_hello(&mut h.rng, &params).unwrap();
        h.deliver(datagram);
        assert_eq!(
            h.error_codes(),
            vec![TransportError::TransportParameterError.code()]
        );
    }

    /// RFC 9000 §17.2: long headers must keep the negotiated version
    #[test]
    fn test_version_change_is_protocol_violation() {
        let mut h = Harness::established();
        h.peer.set_version(0xff00_001d);
        h.send(EncryptionLevel::Handshake, vec![Frame::Ping]);
        assert_eq!(h.error_codes(), vec![TransportError::ProtocolViolation.code()]);
    }

    /// RFC 9001 §4.1.2: a client endpoint completes against a server endpoint
    #[test]
    fn test_client_and_server_endpoints_establish() {
        let mut pair = Pair::new();
        assert_eq!(pair.client_conn().state(), ConnectionState::Established);
        assert_eq!(pair.server_conn().state(), ConnectionState::Established);
        assert_eq!(
            pair.client_conn().remote_cids().current(),
            pair.server_conn().local_scid().clone()
        );
        assert!(pair.client_conn().handshake().done_received);
        assert!(!pair.client.crypto().has_keys(&pair.key, EncryptionLevel::Initial));

        let events = pair.client.drain_events();
        assert_subsequence(
            &events,
            &[
                ("tls_handshake_event", Some("ClientHello")),
                ("tls_handshake_event", Some("ServerHello")),
                ("keys_established", Some("handshake")),
                ("tls_handshake_event", Some("EncryptedExtensions")),
                ("transport_parameters_received", None),
                ("keys_established", Some("one_rtt")),
                ("handshake_done_received", None),
                ("connection_state", Some("Established")),
            ],
        );
    }

    /// RFC 9000 §14.1: the client pads its Initial datagram
    #[test]
    fn test_client_initial_is_padded() {
        let (mut client, net) = endpoint(EndpointConfig::client(), 3);
        client.connect(server_addr()).unwrap();
        let sent = net.drain();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].payload.len() >= 1200);
        assert_eq!(sent[0].addr, server_addr());
    }

    #[test]
    fn test_connect_on_server_is_rejected() {
        let (mut server, _) = endpoint(EndpointConfig::server(), 3);
        assert!(server.connect(server_addr()).is_err());
    }
}

// ============================================================================
// Streams and Flow Control (RFC 9000 Sections 2, 3, 4)
// ============================================================================

mod stream_tests {
    use super::*;

    /// RFC 9000 §3.1: data sent with FIN is delivered and acknowledged
    #[test]
    fn test_stream_round_trip_between_endpoints() {
        let mut pair = Pair::new();
        pair.client.drain_events();
        let id = pair.client.open_stream(&pair.key, true).unwrap();
        assert_eq!(id, StreamId(0));
        pair.client
            .stream_send(&pair.key, id, Bytes::from_static(b"hello"), true)
            .unwrap();
        assert_eq!(
            pair.client_conn().send_stream_state(id),
            Some(SendStreamState::DataSent)
        );
        pair.pump();

        let (data, fin) = pair.server.stream_read(&pair.key, id).unwrap();
        assert_eq!(&data[..], b"hello");
        assert!(fin);
        assert_eq!(
            pair.client_conn().send_stream_state(id),
            Some(SendStreamState::DataRecvd)
        );
        let server_events = pair.server.drain_events();
        assert!(server_events
            .iter()
            .any(|e| matches!(e, Event::StreamOpened { stream_id, .. } if *stream_id == id)));
    }

    /// RFC 9000 §3.3: after DataRecvd no STREAM frame is queued
    #[test]
    fn test_no_stream_frames_after_data_recvd() {
        let mut pair = Pair::new();
        let id = pair.client.open_stream(&pair.key, false).unwrap();
        pair.client
            .stream_send(&pair.key, id, Bytes::from_static(b"x"), true)
            .unwrap();
        pair.pump();
        assert_eq!(
            pair.client_conn().send_stream_state(id),
            None,
            "a finished uni stream is collected"
        );
        let err = pair
            .client
            .stream_send(&pair.key, id, Bytes::from_static(b"y"), false)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidStreamOperation { .. }));
        assert!(pair.client_net.is_empty());
    }

    /// RFC 9000 §4.5: FIN fixes the final size; lower data is still accepted
    #[test]
    fn test_fin_then_lower_frame() {
        let mut h = Harness::established();
        h.send_1rtt(vec![stream(0, 5, b"world", true)]);
        assert_eq!(
            h.conn().recv_stream_state(StreamId(0)),
            Some(RecvStreamState::SizeKnown)
        );
        h.send_1rtt(vec![stream(0, 0, b"hello", false)]);
        assert_eq!(
            h.conn().recv_stream_state(StreamId(0)),
            Some(RecvStreamState::DataRecvd)
        );
        let (data, fin) = h.server.stream_read(&h.key(), StreamId(0)).unwrap();
        assert_eq!(&data[..], b"helloworld");
        assert!(fin);
        assert!(h.error_codes().is_empty());
    }

    /// RFC 9000 §4.5: data beyond the final size is FINAL_SIZE_ERROR
    #[test]
    fn test_data_beyond_final_size() {
        let mut h = Harness::established();
        h.send_1rtt(vec![stream(0, 0, b"abc", true)]);
        let frames = h.send_1rtt(vec![stream(0, 2, b"cd", false)]);
        assert_eq!(h.error_codes(), vec![TransportError::FinalSizeError.code()]);
        assert_eq!(close_code(&frames), Some(TransportError::FinalSizeError.code()));
    }

    /// RFC 9000 §4.1: offset+len above max_stream_data is FLOW_CONTROL_ERROR
    #[test]
    fn test_stream_data_beyond_credit() {
        let mut h = Harness::established();
        let limit = h
            .conn()
            .local_params()
            .initial_max_stream_data_bidi_remote
            .unwrap();
        h.send_1rtt(vec![stream(0, limit, b"z", false)]);
        assert_eq!(h.error_codes(), vec![TransportError::FlowControlError.code()]);
    }

    /// RFC 9000 §19.8: STREAM on our own unidirectional stream
    #[test]
    fn test_stream_on_local_uni_stream_is_protocol_violation() {
        let mut h = Harness::established();
        h.send_1rtt(vec![stream(3, 0, b"x", false)]);
        assert_eq!(h.error_codes(), vec![TransportError::ProtocolViolation.code()]);
    }

    /// RFC 9000 §4.6: opening beyond our advertised limit is STREAM_LIMIT_ERROR
    #[test]
    fn test_stream_beyond_stream_limit() {
        let mut h = Harness::established();
        let max = h.conn().local_params().initial_max_streams_bidi.unwrap();
        h.send_1rtt(vec![stream(max * 4, 0, b"x", false)]);
        assert_eq!(h.error_codes(), vec![TransportError::StreamLimitError.code()]);
    }

    /// RFC 9000 §3.2: a reset is reported to the reader once
    #[test]
    fn test_read_after_reset() {
        let mut h = Harness::established();
        h.send_1rtt(vec![Frame::ResetStream(ResetStreamFrame {
            stream_id: StreamId(2),
            error_code: 9,
            final_size: 0,
        })]);
        assert_eq!(
            h.conn().recv_stream_state(StreamId(2)),
            Some(RecvStreamState::ResetRecvd)
        );
        h.server.drain_events();

        let err = h.server.stream_read(&h.key(), StreamId(2)).unwrap_err();
        assert!(matches!(err, Error::InvalidStreamOperation { reason: "stream reset by peer", .. }));
        let events = h.server.drain_events();
        assert_subsequence(&events, &[("recv_stream_state", Some("ResetRead"))]);
        assert!(h.server.stream_read(&h.key(), StreamId(2)).is_err());
        assert!(h.error_codes().is_empty());
    }

    /// RFC 9000 §3.5: STOP_SENDING is answered with RESET_STREAM
    #[test]
    fn test_stop_sending_answered_with_reset() {
        let mut h = Harness::established();
        let key = h.key();
        let id = h.server.open_stream(&key, true).unwrap();
        h.server
            .stream_send(&key, id, Bytes::from_static(b"pending"), false)
            .unwrap();
        h.received();

        let frames = h.send_1rtt(vec![Frame::StopSending(crate::frames::StopSendingFrame {
            stream_id: id,
            error_code: 4,
        })]);
        assert!(frames.iter().any(|f| matches!(
            f,
            Frame::ResetStream(r) if r.stream_id == id && r.error_code == 4 && r.final_size == 7
        )));
        assert_eq!(h.conn().send_stream_state(id), Some(SendStreamState::ResetSent));
    }

    /// RFC 9000 §4.1: writes past peer credit fail and signal STREAM_DATA_BLOCKED
    #[test]
    fn test_write_beyond_credit_is_blocked() {
        let mut config = EndpointConfig::server();
        config.transport.initial_max_stream_data_bidi_remote = Some(4);
        let mut pair = Pair::with_server_config(config);
        let id = pair.client.open_stream(&pair.key, true).unwrap();

        let err = pair
            .client
            .stream_send(&pair.key, id, Bytes::from_static(b"too long"), false)
            .unwrap_err();
        assert!(matches!(err, Error::Blocked { .. }));
        assert_eq!(
            pair.client_conn().send_stream_state(id),
            Some(SendStreamState::Ready)
        );
        pair.pump();
        let events = pair.server.drain_events();
        assert!(events.iter().any(|e| matches!(
            e,
            Event::FrameHandled { frame: Frame::StreamDataBlocked(f), .. } if f.limit == 4
        )));
        assert_eq!(pair.client_conn().state(), ConnectionState::Established);
    }

    /// RFC 9000 §4.6: at the peer's stream limit STREAMS_BLOCKED is sent
    #[test]
    fn test_open_beyond_peer_stream_limit() {
        let mut config = EndpointConfig::server();
        config.transport.initial_max_streams_uni = Some(1);
        let mut pair = Pair::with_server_config(config);
        pair.client.open_stream(&pair.key, false).unwrap();
        let err = pair.client.open_stream(&pair.key, false).unwrap_err();
        assert!(matches!(err, Error::Blocked { .. }));
        pair.pump();
        let events = pair.server.drain_events();
        assert!(events.iter().any(|e| matches!(
            e,
            Event::FrameHandled { frame: Frame::StreamsBlocked(f), .. } if !f.bidirectional && f.limit == 1
        )));
    }

    #[test]
    fn test_stream_send_before_handshake() {
        let (mut client, _net) = endpoint(EndpointConfig::client(), 4);
        let key = client.connect(server_addr()).unwrap();
        let err = client
            .stream_send(&key, StreamId(0), Bytes::from_static(b"early"), false)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidStreamOperation { .. }));
    }

    #[test]
    fn test_unknown_connection() {
        let (mut server, _net) = endpoint(EndpointConfig::server(), 4);
        let key = ConnectionId::from_u64(42);
        assert!(matches!(
            server.open_stream(&key, true),
            Err(Error::UnknownConnection(_))
        ));
        assert!(matches!(server.tick(&key, Timer::Idle), Err(Error::UnknownConnection(_))));
    }
}

// ============================================================================
// Connection IDs (RFC 9000 Section 5.1)
// ============================================================================

mod cid_tests {
    use super::*;

    fn new_cid(sequence_number: u64, retire_prior_to: u64, cid: u64) -> Frame {
        Frame::NewConnectionId(NewConnectionIdFrame {
            sequence_number,
            retire_prior_to,
            connection_id: ConnectionId::from_u64(cid),
            stateless_reset_token: [sequence_number as u8; 16],
        })
    }

    /// RFC 9000 §5.1.2: retire_prior_to retires lower sequence numbers
    #[test]
    fn test_retire_prior_to_switches_destination() {
        let mut h = Harness::established();
        let frames = h.send_1rtt(vec![new_cid(1, 1, 0xa1)]);
        assert!(frames.contains(&Frame::RetireConnectionId(RetireConnectionIdFrame {
            sequence_number: 0
        })));
        assert_eq!(h.conn().remote_cids().current(), ConnectionId::from_u64(0xa1));
        assert!(h.error_codes().is_empty());
    }

    /// RFC 9000 §5.1.1: a retired cid is never bound again
    #[test]
    fn test_retired_cid_is_never_rebound() {
        let mut h = Harness::established();
        h.send_1rtt(vec![new_cid(1, 1, 0xa1)]);
        let original = h.peer.scid().clone();
        assert!(h.conn().remote_cids().is_retired(&original));

        h.send_1rtt(vec![Frame::NewConnectionId(NewConnectionIdFrame {
            sequence_number: 2,
            retire_prior_to: 1,
            connection_id: original.clone(),
            stateless_reset_token: [2; 16],
        })]);
        assert_eq!(h.error_codes(), vec![TransportError::ProtocolViolation.code()]);
        assert_ne!(h.conn().remote_cids().current(), original);
    }

    /// RFC 9000 §19.15: a late copy of a since-retired NEW_CONNECTION_ID
    #[test]
    fn test_repeated_new_connection_id_after_retirement() {
        let mut h = Harness::established();
        h.send_1rtt(vec![new_cid(1, 0, 0xa1)]);
        h.send_1rtt(vec![new_cid(2, 2, 0xa2)]);
        assert!(h.conn().remote_cids().is_retired(&ConnectionId::from_u64(0xa1)));

        h.send_1rtt(vec![new_cid(1, 0, 0xa1)]);
        assert!(h.error_codes().is_empty());
        assert_eq!(h.conn().state(), ConnectionState::Established);
        assert_eq!(h.conn().remote_cids().current(), ConnectionId::from_u64(0xa2));

        // same sequence number, different cid
        h.send_1rtt(vec![new_cid(1, 0, 0xa3)]);
        assert_eq!(h.error_codes(), vec![TransportError::ProtocolViolation.code()]);
    }

    /// RFC 9000 §5.1.1: more cids than active_connection_id_limit
    #[test]
    fn test_too_many_connection_ids() {
        let mut h = Harness::established();
        let limit = h.conn().local_params().active_connection_id_limit();
        let frames: Vec<Frame> = (1..=limit).map(|seq| new_cid(seq, 0, 0xb0 + seq)).collect();
        h.send_1rtt(frames);
        assert_eq!(
            h.error_codes(),
            vec![TransportError::ConnectionIdLimitError.code()]
        );
    }

    /// RFC 9000 §19.15: retire_prior_to above the sequence number
    #[test]
    fn test_retire_prior_to_above_sequence() {
        let mut h = Harness::established();
        h.send_1rtt(vec![new_cid(1, 2, 0xa1)]);
        assert_eq!(h.error_codes(), vec![TransportError::FrameEncodingError.code()]);
    }

    /// RFC 9000 §19.16: retiring a cid gets a replacement and unroutes it
    #[test]
    fn test_retire_issues_replacement() {
        let mut h = Harness::new();
        let flight = h.handshake();
        let issued = flight
            .iter()
            .find_map(|f| match f {
                Frame::NewConnectionId(n) => Some(n.connection_id.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(h.server.registry().route(&issued), Some(&h.key()));

        let frames = h.send_1rtt(vec![Frame::RetireConnectionId(RetireConnectionIdFrame {
            sequence_number: 1,
        })]);
        assert!(frames
            .iter()
            .any(|f| matches!(f, Frame::NewConnectionId(n) if n.sequence_number == 2)));
        assert!(h.server.registry().route(&issued).is_none());
        assert!(h.server.registry().routes().is_retired(&issued));
    }

    /// RFC 9000 §19.16: retiring the cid the packet was sent to
    #[test]
    fn test_retire_packet_destination_is_protocol_violation() {
        let mut h = Harness::established();
        h.send_1rtt(vec![Frame::RetireConnectionId(RetireConnectionIdFrame {
            sequence_number: 0,
        })]);
        assert_eq!(h.error_codes(), vec![TransportError::ProtocolViolation.code()]);
    }

    /// RFC 9000 §19.16: retiring a sequence number never issued
    #[test]
    fn test_retire_unissued_sequence() {
        let mut h = Harness::established();
        h.send_1rtt(vec![Frame::RetireConnectionId(RetireConnectionIdFrame {
            sequence_number: 9,
        })]);
        assert_eq!(h.error_codes(), vec![TransportError::ProtocolViolation.code()]);
    }

    #[test]
    fn test_application_issues_more_ids() {
        let mut h = Harness::established();
        let key = h.key();
        let issued = h.server.issue_connection_ids(&key, 2).unwrap();
        assert_eq!(issued.len(), 2);
        let frames = h.received();
        let sequences: Vec<u64> = frames
            .iter()
            .filter_map(|f| match f {
                Frame::NewConnectionId(n) => Some(n.sequence_number),
                _ => None,
            })
            .collect();
        assert_eq!(sequences, vec![2, 3]);
        // the peer allows four active cids
        assert!(h.server.issue_connection_ids(&key, 5).unwrap().is_empty());
    }
}

// ============================================================================
// Closing (RFC 9000 Section 10.2)
// ============================================================================

mod closing_tests {
    use super::*;

    /// RFC 9000 §10.2.1: the close is repeated once in response to a peer packet
    #[test]
    fn test_close_resent_once_while_closing() {
        let mut h = Harness::established();
        let key = h.key();
        h.server.close(&key, 0x42, "done").unwrap();
        let frames = h.received();
        assert_eq!(close_code(&frames), Some(0x42));
        assert_eq!(h.conn().state(), ConnectionState::Closing);

        let frames = h.send_1rtt(vec![Frame::Ping]);
        assert_eq!(close_code(&frames), Some(0x42));
        assert!(h.conn().close_resent());
        assert!(h.send_1rtt(vec![Frame::Ping]).is_empty());
    }

    /// RFC 9000 §10.2: Closing → Draining → Closed on ticks
    #[test]
    fn test_closing_timers() {
        let mut h = Harness::established();
        let key = h.key();
        h.server.close(&key, 0, "").unwrap();
        h.server.tick(&key, Timer::Closing).unwrap();
        assert_eq!(h.conn().state(), ConnectionState::Draining);
        h.server.tick(&key, Timer::Draining).unwrap();
        assert_eq!(h.conn().state(), ConnectionState::Closed);
        assert!(h.server.registry().route(h.peer.dcid()).is_none());
        assert!(!h.server.crypto().has_keys(&key, EncryptionLevel::OneRtt));

        h.send_1rtt(vec![Frame::Ping]);
        assert!(h.net.is_empty());
        assert_subsequence(&h.server.drain_events(), &[("packet_undecryptable", None)]);
    }

    /// RFC 9000 §10.2.2: a peer close while closing moves to Draining
    #[test]
    fn test_peer_close_while_closing_drains() {
        let mut h = Harness::established();
        let key = h.key();
        h.server.close(&key, 1, "bye").unwrap();
        h.received();
        let frames = h.send_1rtt(vec![Frame::ConnectionClose(ConnectionCloseFrame {
            error_code: 0,
            frame_type: 0,
            reason: Bytes::new(),
        })]);
        assert!(frames.is_empty());
        assert_eq!(h.conn().state(), ConnectionState::Draining);
    }

    /// RFC 9000 §10.2.2: a peer close answered with NO_ERROR
    #[test]
    fn test_peer_close_is_answered() {
        let mut h = Harness::established();
        let frames = h.send_1rtt(vec![Frame::ConnectionClose(ConnectionCloseFrame {
            error_code: TransportError::ProtocolViolation.code(),
            frame_type: 0,
            reason: Bytes::from_static(b"peer gave up"),
        })]);
        assert_eq!(close_code(&frames), Some(TransportError::NoError.code()));
        assert_eq!(h.conn().state(), ConnectionState::Closing);
        assert!(h.error_codes().is_empty());
    }

    #[test]
    fn test_idle_tick_closes_from_any_state() {
        let mut h = Harness::established();
        let key = h.key();
        h.server.tick(&key, Timer::Idle).unwrap();
        assert_eq!(h.conn().state(), ConnectionState::Closed);
        assert!(h.net.is_empty());
    }

    /// RFC 9000 §10.2: no new application data once closing
    #[test]
    fn test_no_application_data_while_closing() {
        let mut h = Harness::established();
        let key = h.key();
        let id = h.server.open_stream(&key, true).unwrap();
        h.server.close(&key, 0, "").unwrap();
        h.received();
        let err = h
            .server
            .stream_send(&key, id, Bytes::from_static(b"late"), false)
            .unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
        assert!(h.net.is_empty());
    }

    /// RFC 9000 §10.2.3: APPLICATION_CLOSE becomes CONNECTION_CLOSE below 1-RTT
    #[test]
    fn test_application_close_before_handshake() {
        let (mut client, net) = endpoint(EndpointConfig::client(), 8);
        let key = client.connect(server_addr()).unwrap();
        net.drain();
        client.close(&key, 0x99, "abort").unwrap();
        let conn = client.connection(&key).unwrap();
        assert!(matches!(
            conn.close_frame(),
            Some(Frame::ConnectionClose(c)) if c.error_code == TransportError::ApplicationError.code()
        ));
        assert_eq!(net.len(), 1);
    }
}

// ============================================================================
// Frame Rules (RFC 9000 Sections 12.4, 19)
// ============================================================================

mod frame_rule_tests {
    use super::*;

    /// RFC 9000 §12.4: STREAM is not allowed in Initial packets
    #[test]
    fn test_stream_in_initial_packet() {
        let mut h = Harness::established();
        h.send(EncryptionLevel::Initial, vec![stream(0, 0, b"x", false)]);
        assert_eq!(h.error_codes(), vec![TransportError::ProtocolViolation.code()]);
    }

    /// RFC 9000 §19.7: NEW_TOKEN is only sent by servers
    #[test]
    fn test_new_token_to_server() {
        let mut h = Harness::established();
        let frames = h.send_1rtt(vec![Frame::NewToken(NewTokenFrame {
            token: Bytes::from_static(b"tok"),
        })]);
        assert!(frames.iter().any(|f| matches!(
            f,
            Frame::ConnectionClose(c) if c.error_code == 0x0a && c.frame_type == 0x07
        )));
    }

    /// RFC 9000 §19.20: HANDSHAKE_DONE is only sent by servers
    #[test]
    fn test_handshake_done_to_server() {
        let mut h = Harness::established();
        h.send_1rtt(vec![Frame::HandshakeDone]);
        assert_eq!(h.error_codes(), vec![TransportError::ProtocolViolation.code()]);
    }

    /// RFC 9000 §13.1: acknowledging a packet never sent
    #[test]
    fn test_ack_of_unsent_packet() {
        let mut h = Harness::established();
        let ack = AckFrame::from_ranges(&[0..=500], 0).unwrap();
        h.send_1rtt(vec![Frame::Ack(ack)]);
        assert_eq!(h.error_codes(), vec![TransportError::ProtocolViolation.code()]);
    }

    /// RFC 9000 §8.2.2: PATH_CHALLENGE is echoed
    #[test]
    fn test_path_challenge_answered() {
        let mut h = Harness::established();
        let data = [1, 2, 3, 4, 5, 6, 7, 8];
        let frames = h.send_1rtt(vec![Frame::PathChallenge(PathChallengeFrame { data })]);
        assert!(frames.contains(&Frame::PathResponse(PathResponseFrame { data })));
    }

    /// RFC 9000 §8.2.3: a matching PATH_RESPONSE validates the path
    #[test]
    fn test_path_validation() {
        let mut h = Harness::established();
        let key = h.key();
        let data = h.server.send_path_challenge(&key).unwrap();
        let frames = h.received();
        assert!(frames.contains(&Frame::PathChallenge(PathChallengeFrame { data })));
        assert_eq!(h.conn().pending_path_challenges(), &[data]);

        h.send_1rtt(vec![Frame::PathResponse(PathResponseFrame { data })]);
        assert!(h.conn().pending_path_challenges().is_empty());
        assert!(h
            .server
            .drain_events()
            .iter()
            .any(|e| matches!(e, Event::PathValidated { data: d, .. } if *d == data)));
    }

    /// RFC 9000 §19.18: PATH_RESPONSE without a challenge
    #[test]
    fn test_unsolicited_path_response() {
        let mut h = Harness::established();
        h.send_1rtt(vec![Frame::PathResponse(PathResponseFrame { data: [9; 8] })]);
        assert_eq!(h.error_codes(), vec![TransportError::ProtocolViolation.code()]);
    }

    /// ACK_FREQUENCY adjusts the tolerance; stale sequence numbers are ignored
    #[test]
    fn test_ack_frequency() {
        let mut h = Harness::established();
        let frequency = |sequence_number, packet_tolerance, update_max_ack_delay| {
            Frame::AckFrequency(AckFrequencyFrame {
                sequence_number,
                packet_tolerance,
                update_max_ack_delay,
                ignore_order: false,
            })
        };
        h.send_1rtt(vec![frequency(1, 3, 2_000)]);
        assert_eq!(h.conn().ack_policy().packet_tolerance, 3);
        assert_eq!(h.conn().ack_policy().max_ack_delay_us, 2_000);

        h.send_1rtt(vec![frequency(1, 9, 5_000)]);
        assert_eq!(h.conn().ack_policy().packet_tolerance, 3);

        h.send_1rtt(vec![frequency(2, 2, 10)]);
        assert_eq!(h.error_codes(), vec![TransportError::ProtocolViolation.code()]);
    }

    /// With a tolerance of two, one ack-eliciting packet is not acknowledged
    #[test]
    fn test_ack_tolerance_delays_ack() {
        let mut h = Harness::established();
        let frames = h.send_1rtt(vec![Frame::AckFrequency(AckFrequencyFrame {
            sequence_number: 0,
            packet_tolerance: 2,
            update_max_ack_delay: 25_000,
            ignore_order: false,
        })]);
        assert!(frames.is_empty());
        let frames = h.send_1rtt(vec![Frame::Ping]);
        assert!(frames.iter().any(|f| matches!(f, Frame::Ack(_))));

        assert!(h.send_1rtt(vec![Frame::Ping]).is_empty());
        let key = h.key();
        h.server.tick(&key, Timer::Ack).unwrap();
        assert!(h.received().iter().any(|f| matches!(f, Frame::Ack(_))));
    }

    /// RFC 9000 §12.3: a replayed packet number is dropped
    #[test]
    fn test_duplicate_packet_dropped() {
        let mut h = Harness::established();
        let datagram = h.peer.packet(EncryptionLevel::OneRtt, vec![Frame::Ping]).unwrap();
        h.deliver(datagram.clone());
        let before = h.conn().stats().packets_received;
        h.deliver(datagram);
        assert_eq!(h.conn().stats().packets_received, before);
    }

    #[test]
    fn test_unknown_frame_type() {
        let mut h = Harness::established();
        h.send_1rtt(vec![Frame::Unknown(crate::frames::UnknownFrame {
            frame_type: 0x21,
            payload: Bytes::new(),
        })]);
        assert_eq!(h.error_codes(), vec![TransportError::FrameEncodingError.code()]);
    }
}
