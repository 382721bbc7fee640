//! # QUIC Connection State (RFC 9000 Sections 5, 10, 13)
//!
//! Everything one connection remembers between external inputs: its
//! lifecycle state, packet-number spaces, CRYPTO streams, queued frames,
//! connection IDs, streams, flow control and the error codes it closed
//! with.
//!
//! ## Lifecycle
//!
//! ```text
//! Initial → Handshaking → Established → Closing → Draining → Closed
//! ```
//!
//! Any fatal error moves the connection to Closing. Draining and Closed
//! are reached through timer ticks or a peer close.

#![forbid(unsafe_code)]

use super::cid_manager::{LocalConnectionIds, RemoteConnectionIds};
use super::events::Event;
use crate::crypto::{CryptoService, EncryptionLevel};
use crate::error::{Error, Result, TransportError};
use crate::flow_control::ConnectionFlowControl;
use crate::frames::{AckFrame, ApplicationCloseFrame, ConnectionCloseFrame, Frame};
use crate::stream::{RangeSet, RecvStreamState, SendStreamState, StreamLimits, StreamMap};
use crate::tls::stream::DEFAULT_CRYPTO_BUFFER;
use crate::tls::CryptoStream;
use crate::transport::TransportParameters;
use crate::types::{ConnectionId, PacketNumber, Side, StreamId, QUIC_VERSION_1};
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::net::SocketAddr;
use std::ops::RangeInclusive;
use tracing::{debug, warn};

/// Most ranges carried in one ACK frame
const MAX_ACK_RANGES: usize = 32;

/// Connection State (RFC 9000 Section 10)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Created, no handshake message processed yet
    Initial,

    /// Hello exchanged, handshake not yet confirmed
    Handshaking,

    /// 1-RTT keys installed and HANDSHAKE_DONE sent or received
    Established,

    /// CONNECTION_CLOSE sent; only close frames go out
    Closing,

    /// Peer close seen while closing; nothing is sent
    Draining,

    Closed,
}

impl ConnectionState {
    /// No new application data once closing has started
    pub fn is_closing(self) -> bool {
        matches!(
            self,
            ConnectionState::Closing | ConnectionState::Draining | ConnectionState::Closed
        )
    }
}

/// Endpoint Configuration
///
/// Shared by every connection of one endpoint.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub side: Side,
    pub version: u32,

    /// Length of the cids this endpoint issues
    pub local_cid_len: usize,

    /// Largest datagram the endpoint builds
    pub max_datagram_size: usize,

    /// Transport parameters advertised to every peer. The connection IDs
    /// are filled in per connection.
    pub transport: TransportParameters,

    /// Out-of-order CRYPTO data buffered per level
    pub crypto_buffer_size: u64,

    /// NEW_CONNECTION_ID frames sent once the handshake completes
    pub extra_connection_ids: u64,
}

impl EndpointConfig {
    pub fn server() -> Self {
        Self::default()
    }

    pub fn client() -> Self {
        Self {
            side: Side::Client,
            ..Self::default()
        }
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            side: Side::Server,
            version: QUIC_VERSION_1,
            local_cid_len: 8,
            max_datagram_size: 1200,
            transport: default_transport_parameters(),
            crypto_buffer_size: DEFAULT_CRYPTO_BUFFER,
            extra_connection_ids: 1,
        }
    }
}

/// Transport parameters an endpoint advertises unless configured otherwise.
pub fn default_transport_parameters() -> TransportParameters {
    TransportParameters {
        max_idle_timeout: Some(30_000),
        initial_max_data: Some(1 << 20),
        initial_max_stream_data_bidi_local: Some(256 * 1024),
        initial_max_stream_data_bidi_remote: Some(256 * 1024),
        initial_max_stream_data_uni: Some(256 * 1024),
        initial_max_streams_bidi: Some(100),
        initial_max_streams_uni: Some(100),
        active_connection_id_limit: Some(4),
        min_ack_delay: Some(1_000),
        ..TransportParameters::default()
    }
}

/// Connection Statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_undecryptable: u64,
    pub frames_handled: u64,
}

/// Record of a packet we sent, kept until it is acknowledged.
#[derive(Debug, Clone)]
pub struct SentPacket {
    pub packet_number: PacketNumber,
    pub ack_eliciting: bool,

    /// Frames whose acknowledgement changes stream state
    pub frames: Vec<Frame>,
}

/// Per packet-number-space bookkeeping (RFC 9000 Section 12.3).
#[derive(Debug, Clone)]
pub struct PacketSpace {
    next_packet_number: PacketNumber,
    largest_received: Option<PacketNumber>,
    received: RangeSet,

    /// Ack-eliciting packets received since our last ACK
    unacked_eliciting: u64,

    /// Any packet received since our last ACK
    unacked_any: bool,

    ack_immediately: bool,

    /// Largest packet number the peer acknowledged (monotonic)
    max_acked: Option<PacketNumber>,

    sent: BTreeMap<PacketNumber, SentPacket>,

    pub(crate) crypto: CryptoStream,

    /// Frames waiting for the next flush
    pub(crate) pending: VecDeque<Frame>,
}

impl PacketSpace {
    pub fn new(crypto_buffer_size: u64) -> Self {
        Self {
            next_packet_number: 0,
            largest_received: None,
            received: RangeSet::new(),
            unacked_eliciting: 0,
            unacked_any: false,
            ack_immediately: false,
            max_acked: None,
            sent: BTreeMap::new(),
            crypto: CryptoStream::new(crypto_buffer_size),
            pending: VecDeque::new(),
        }
    }

    pub fn next_packet_number(&self) -> PacketNumber {
        self.next_packet_number
    }

    pub fn largest_received(&self) -> Option<PacketNumber> {
        self.largest_received
    }

    pub fn max_acked(&self) -> Option<PacketNumber> {
        self.max_acked
    }

    pub fn is_duplicate(&self, packet_number: PacketNumber) -> bool {
        self.received.contains(packet_number)
    }

    pub fn pending_frames(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn take_packet_number(&mut self) -> PacketNumber {
        let pn = self.next_packet_number;
        self.next_packet_number += 1;
        pn
    }

    /// Record a received packet. Reordering of ack-eliciting packets asks
    /// for an immediate ACK unless the peer told us to ignore order.
    pub(crate) fn on_packet_received(
        &mut self,
        packet_number: PacketNumber,
        ack_eliciting: bool,
        ignore_order: bool,
    ) {
        let reordered = self
            .largest_received
            .map_or(false, |largest| packet_number < largest);
        self.received.insert_one(packet_number);
        self.largest_received = Some(
            self.largest_received
                .map_or(packet_number, |largest| largest.max(packet_number)),
        );
        self.unacked_any = true;
        if ack_eliciting {
            self.unacked_eliciting += 1;
            if reordered && !ignore_order {
                self.ack_immediately = true;
            }
        }
    }

    pub(crate) fn force_ack(&mut self) {
        if self.unacked_eliciting > 0 {
            self.ack_immediately = true;
        }
    }

    /// Whether an ACK goes into the next packet at this level.
    ///
    /// `piggyback` is true when other frames are being sent anyway.
    pub(crate) fn wants_ack(&self, level: EncryptionLevel, tolerance: u64, piggyback: bool) -> bool {
        if !self.unacked_any {
            return false;
        }
        if piggyback {
            return true;
        }
        if self.unacked_eliciting == 0 {
            return false;
        }
        level != EncryptionLevel::OneRtt
            || self.ack_immediately
            || self.unacked_eliciting >= tolerance
    }

    /// Build an ACK for everything received, resetting the ACK triggers.
    pub(crate) fn build_ack(&mut self) -> Option<Frame> {
        let ranges: Vec<RangeInclusive<u64>> = self
            .received
            .iter()
            .rev()
            .take(MAX_ACK_RANGES)
            .map(|r| r.start..=r.end - 1)
            .collect();
        let ack = AckFrame::from_ranges(&ranges, 0)?;
        self.unacked_any = false;
        self.unacked_eliciting = 0;
        self.ack_immediately = false;
        Some(Frame::Ack(ack))
    }

    pub(crate) fn on_packet_sent(&mut self, packet: SentPacket) {
        if packet.ack_eliciting {
            self.sent.insert(packet.packet_number, packet);
        }
    }

    /// Process the ranges of a received ACK frame, highest first.
    ///
    /// Returns the sent packets that are newly acknowledged.
    pub(crate) fn on_ack(&mut self, ranges: &[RangeInclusive<u64>]) -> Result<Vec<SentPacket>> {
        let Some(largest) = ranges.first().map(|r| *r.end()) else {
            return Ok(Vec::new());
        };
        if largest >= self.next_packet_number {
            return Err(Error::protocol_violation("ACK of a packet number never sent"));
        }
        self.max_acked = Some(self.max_acked.map_or(largest, |m| m.max(largest)));

        let mut acked = Vec::new();
        for range in ranges {
            let numbers: Vec<PacketNumber> = self.sent.range(range.clone()).map(|(pn, _)| *pn).collect();
            for pn in numbers {
                if let Some(packet) = self.sent.remove(&pn) {
                    acked.push(packet);
                }
            }
        }
        Ok(acked)
    }
}

/// How often we acknowledge, as adjusted by ACK_FREQUENCY.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckPolicy {
    /// Ack-eliciting packets that may arrive before an ACK is due
    pub packet_tolerance: u64,
    pub ignore_order: bool,

    /// Requested max_ack_delay in microseconds
    pub max_ack_delay_us: u64,

    pub(crate) last_sequence: Option<u64>,
}

impl Default for AckPolicy {
    fn default() -> Self {
        Self {
            packet_tolerance: 1,
            ignore_order: false,
            max_ack_delay_us: 25_000,
            last_sequence: None,
        }
    }
}

/// Handshake progress flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandshakeProgress {
    /// ClientHello (server) or ServerHello (client) processed
    pub hello: bool,
    pub peer_params: bool,
    pub done_sent: bool,
    pub done_received: bool,
}

#[derive(Debug, Clone)]
struct CloseState {
    level: EncryptionLevel,
    frame: Frame,
    resent: bool,
}

/// One QUIC connection.
#[derive(Debug)]
pub struct Connection {
    side: Side,
    state: ConnectionState,
    version: u32,

    /// Key handle: Destination Connection ID of the client's first Initial
    key_cid: ConnectionId,

    /// Same as `key_cid`; kept separately for transport parameter checks
    original_dcid: ConnectionId,

    peer_addr: SocketAddr,

    /// Source Connection ID of our long headers
    local_scid: ConnectionId,

    pub(crate) local_cids: LocalConnectionIds,
    pub(crate) remote_cids: RemoteConnectionIds,

    /// Set once a client has switched to the server's chosen cid
    pub(crate) remote_cid_confirmed: bool,

    pub(crate) spaces: [PacketSpace; 3],
    pub(crate) streams: StreamMap,
    pub(crate) flow: ConnectionFlowControl,

    local_params: TransportParameters,
    peer_params: Option<TransportParameters>,

    pub(crate) handshake: HandshakeProgress,
    pub(crate) ack_policy: AckPolicy,

    /// Cipher suites we offered as a client
    pub(crate) offered_suites: Vec<u16>,

    close: Option<CloseState>,
    error_codes: BTreeSet<u64>,

    pub(crate) path_challenges: Vec<[u8; 8]>,
    pub(crate) tokens: Vec<Bytes>,
    pub(crate) stats: ConnectionStats,
}

impl Connection {
    pub fn new(
        config: &EndpointConfig,
        key_cid: ConnectionId,
        local_cid: ConnectionId,
        remote_cid: ConnectionId,
        peer_addr: SocketAddr,
    ) -> Self {
        let side = config.side;
        let mut local_params = config.transport.clone();
        local_params.initial_source_connection_id = Some(local_cid.clone());
        if side.is_server() {
            local_params.original_destination_connection_id = Some(key_cid.clone());
        } else {
            local_params.original_destination_connection_id = None;
            local_params.stateless_reset_token = None;
            local_params.preferred_address = None;
            local_params.retry_source_connection_id = None;
        }

        let streams = StreamMap::new(side, StreamLimits::from_params(&local_params));
        let flow = ConnectionFlowControl::new(0, local_params.initial_max_data());

        Self {
            side,
            state: ConnectionState::Initial,
            version: config.version,
            original_dcid: key_cid.clone(),
            key_cid,
            peer_addr,
            local_scid: local_cid.clone(),
            local_cids: LocalConnectionIds::new(local_cid),
            remote_cids: RemoteConnectionIds::new(remote_cid),
            remote_cid_confirmed: side.is_server(),
            spaces: std::array::from_fn(|_| PacketSpace::new(config.crypto_buffer_size)),
            streams,
            flow,
            local_params,
            peer_params: None,
            handshake: HandshakeProgress::default(),
            ack_policy: AckPolicy::default(),
            offered_suites: Vec::new(),
            close: None,
            error_codes: BTreeSet::new(),
            path_challenges: Vec::new(),
            tokens: Vec::new(),
            stats: ConnectionStats::default(),
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn key_cid(&self) -> &ConnectionId {
        &self.key_cid
    }

    pub fn original_dcid(&self) -> &ConnectionId {
        &self.original_dcid
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_scid(&self) -> &ConnectionId {
        &self.local_scid
    }

    pub fn local_params(&self) -> &TransportParameters {
        &self.local_params
    }

    pub fn peer_params(&self) -> Option<&TransportParameters> {
        self.peer_params.as_ref()
    }

    /// Transport error codes this connection has closed with
    pub fn error_codes(&self) -> &BTreeSet<u64> {
        &self.error_codes
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    pub fn handshake(&self) -> &HandshakeProgress {
        &self.handshake
    }

    pub fn ack_policy(&self) -> &AckPolicy {
        &self.ack_policy
    }

    pub fn streams(&self) -> &StreamMap {
        &self.streams
    }

    pub fn flow(&self) -> &ConnectionFlowControl {
        &self.flow
    }

    pub fn local_cids(&self) -> &LocalConnectionIds {
        &self.local_cids
    }

    pub fn remote_cids(&self) -> &RemoteConnectionIds {
        &self.remote_cids
    }

    /// NEW_TOKEN values received from the server
    pub fn tokens(&self) -> &[Bytes] {
        &self.tokens
    }

    pub fn pending_path_challenges(&self) -> &[[u8; 8]] {
        &self.path_challenges
    }

    pub fn space(&self, level: EncryptionLevel) -> &PacketSpace {
        &self.spaces[level.packet_number_space().index()]
    }

    pub(crate) fn space_mut(&mut self, level: EncryptionLevel) -> &mut PacketSpace {
        &mut self.spaces[level.packet_number_space().index()]
    }

    pub fn send_stream_state(&self, id: StreamId) -> Option<SendStreamState> {
        self.streams.send_stream(id).map(|s| s.state())
    }

    pub fn recv_stream_state(&self, id: StreamId) -> Option<RecvStreamState> {
        self.streams.recv_stream(id).map(|r| r.state())
    }

    pub(crate) fn queue(&mut self, level: EncryptionLevel, frame: Frame) {
        self.space_mut(level).pending.push_back(frame);
    }

    /// Drop queued STREAM frames of a stream that was reset.
    pub(crate) fn drop_stream_frames(&mut self, stream_id: StreamId) {
        self.space_mut(EncryptionLevel::OneRtt)
            .pending
            .retain(|frame| !matches!(frame, Frame::Stream(f) if f.stream_id == stream_id));
    }

    pub(crate) fn set_state(&mut self, state: ConnectionState, events: &mut VecDeque<Event>) {
        if self.state == state {
            return;
        }
        debug!(cid = %self.key_cid, from = ?self.state, to = ?state, "connection state change");
        self.state = state;
        events.push_back(Event::ConnectionStateChanged {
            cid: self.key_cid.clone(),
            state,
        });
    }

    /// Record the peer's transport parameters and apply its limits.
    pub(crate) fn apply_peer_params(&mut self, params: TransportParameters, events: &mut VecDeque<Event>) {
        self.streams.set_peer_limits(StreamLimits::from_params(&params));
        self.flow.send.raise(params.initial_max_data());
        self.handshake.peer_params = true;
        events.push_back(Event::TransportParametersReceived {
            cid: self.key_cid.clone(),
            params: Box::new(params.clone()),
        });
        self.peer_params = Some(params);
    }

    /// Highest level we hold keys for; close frames go there.
    fn close_level(&self, crypto: &dyn CryptoService) -> EncryptionLevel {
        EncryptionLevel::SEND_ORDER
            .iter()
            .rev()
            .copied()
            .find(|level| crypto.has_keys(&self.key_cid, *level))
            .unwrap_or(EncryptionLevel::Initial)
    }

    fn begin_close(&mut self, frame: Frame, crypto: &dyn CryptoService, events: &mut VecDeque<Event>) {
        let level = self.close_level(crypto);
        // APPLICATION_CLOSE is only allowed in 1-RTT packets
        let frame = match frame {
            Frame::ApplicationClose(_) if level != EncryptionLevel::OneRtt => {
                Frame::ConnectionClose(ConnectionCloseFrame {
                    error_code: TransportError::ApplicationError.code(),
                    frame_type: 0,
                    reason: Bytes::new(),
                })
            }
            other => other,
        };
        for space in &mut self.spaces {
            space.pending.clear();
        }
        self.queue(level, frame.clone());
        self.close = Some(CloseState {
            level,
            frame,
            resent: false,
        });
        self.set_state(ConnectionState::Closing, events);
    }

    /// Close the connection because of a fatal error.
    ///
    /// `frame_type` names the frame being processed (0 when none).
    pub(crate) fn fail(
        &mut self,
        err: &Error,
        frame_type: u64,
        crypto: &dyn CryptoService,
        events: &mut VecDeque<Event>,
    ) {
        if self.state.is_closing() {
            return;
        }
        let code = err.transport_code();
        warn!(cid = %self.key_cid, error = %err, code = format_args!("{code:#x}"), "closing connection");
        self.error_codes.insert(code);
        let reason = err.to_string();
        events.push_back(Event::ConnectionError {
            cid: self.key_cid.clone(),
            code,
            reason: reason.clone(),
        });
        let frame = Frame::ConnectionClose(ConnectionCloseFrame {
            error_code: code,
            frame_type,
            reason: Bytes::from(reason),
        });
        self.begin_close(frame, crypto, events);
    }

    /// Application-initiated close.
    pub(crate) fn close_by_application(
        &mut self,
        error_code: u64,
        reason: Bytes,
        crypto: &dyn CryptoService,
        events: &mut VecDeque<Event>,
    ) {
        if self.state.is_closing() {
            return;
        }
        let frame = Frame::ApplicationClose(ApplicationCloseFrame { error_code, reason });
        self.begin_close(frame, crypto, events);
    }

    /// CONNECTION_CLOSE or APPLICATION_CLOSE received from the peer.
    pub(crate) fn on_peer_close(&mut self, crypto: &dyn CryptoService, events: &mut VecDeque<Event>) {
        match self.state {
            ConnectionState::Closing => self.set_state(ConnectionState::Draining, events),
            ConnectionState::Draining | ConnectionState::Closed => {}
            _ => {
                let frame = Frame::ConnectionClose(ConnectionCloseFrame {
                    error_code: TransportError::NoError.code(),
                    frame_type: 0,
                    reason: Bytes::new(),
                });
                self.begin_close(frame, crypto, events);
            }
        }
    }

    /// A packet arrived while Closing: repeat the close once.
    pub(crate) fn on_packet_while_closing(&mut self) {
        let Some(close) = self.close.as_mut() else {
            return;
        };
        if close.resent {
            return;
        }
        close.resent = true;
        let (level, frame) = (close.level, close.frame.clone());
        self.queue(level, frame);
    }

    /// Whether a CLOSE frame was retransmitted in response to a peer packet
    pub fn close_resent(&self) -> bool {
        self.close.as_ref().map_or(false, |c| c.resent)
    }

    /// The close frame this connection sent, if any
    pub fn close_frame(&self) -> Option<&Frame> {
        self.close.as_ref().map(|c| &c.frame)
    }

    pub(crate) fn enter_closed(&mut self, crypto: &mut dyn CryptoService, events: &mut VecDeque<Event>) {
        for space in &mut self.spaces {
            space.pending.clear();
        }
        crypto.discard_keys(&self.key_cid, None);
        self.set_state(ConnectionState::Closed, events);
    }
}
