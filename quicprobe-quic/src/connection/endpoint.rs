//! # Endpoint (RFC 9000 Sections 5.2, 7, 10)
//!
//! Owns the connection registry and the injected collaborators, and is the
//! single entry point for external events:
//!
//! - [`Endpoint::recv`]: a datagram from the network
//! - [`Endpoint::tick`]: a timer expiry
//! - application calls (`connect`, streams, `close`, ...)
//!
//! Every entry point runs to completion and ends with a flush that hands
//! the resulting datagrams to the [`NetworkService`].
//!
//! ## Routing
//!
//! Packets are routed by Destination Connection ID. A server creates a
//! connection for an unknown cid only when the packet is a long-header
//! Initial of the configured version inside a datagram of at least 1200
//! bytes.

#![forbid(unsafe_code)]

use super::cid_manager::random_cid;
use super::events::Event;
use super::handlers::{
    self, handle_frame, queue_max_streams, recv_state_event, send_state_event, HandlerContext,
    PacketInfo,
};
use super::handshake::{build_client_hello, send_message};
use super::packetizer::packetize;
use super::registry::{CidRoutes, ConnectionRegistry};
use super::state::{Connection, ConnectionState, EndpointConfig};
use crate::crypto::{CryptoService, EncryptionLevel, INITIAL_SALT_V1};
use crate::error::{Error, Result, TransportError};
use crate::frames::{
    parse_frames, DataBlockedFrame, Frame, MaxDataFrame, MaxStreamDataFrame, PathChallengeFrame,
    ResetStreamFrame, StopSendingFrame, StreamDataBlockedFrame, StreamFrame, StreamsBlockedFrame,
};
use crate::packet::{parse_header, unprotect, PacketHeader, PacketType};
use crate::services::{NetworkService, RandomSource};
use crate::tls::SUPPORTED_CIPHER_SUITES;
use crate::types::{ConnectionId, StreamId, MIN_INITIAL_PACKET_SIZE};
use bytes::Bytes;
use std::collections::VecDeque;
use std::net::SocketAddr;
use tracing::{debug, info, trace};

/// Length of the Destination Connection ID a client picks for its first Initial
const CLIENT_INITIAL_DCID_LEN: usize = 8;

/// Attempts at drawing an unused cid
const CID_ATTEMPTS: usize = 16;

/// Room left in a datagram for headers, tag and STREAM frame fields
const STREAM_FRAME_OVERHEAD: usize = 80;

/// Externally delivered timer expiries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timer {
    /// ACK delay elapsed: acknowledge everything outstanding
    Ack,

    /// Closing period over
    Closing,

    /// Draining period over
    Draining,

    /// Idle timeout: discard the connection whatever its state
    Idle,
}

impl Timer {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ack" => Some(Timer::Ack),
            "closing" => Some(Timer::Closing),
            "draining" => Some(Timer::Draining),
            "idle" => Some(Timer::Idle),
            _ => None,
        }
    }
}

/// A QUIC endpoint acting as server or client for any number of
/// connections.
pub struct Endpoint {
    config: EndpointConfig,
    registry: ConnectionRegistry,
    crypto: Box<dyn CryptoService>,
    network: Box<dyn NetworkService>,
    rng: Box<dyn RandomSource>,
    events: VecDeque<Event>,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("side", &self.config.side)
            .field("connections", &self.registry.len())
            .field("pending_events", &self.events.len())
            .finish()
    }
}

fn unknown(key: &ConnectionId) -> Error {
    Error::UnknownConnection(key.clone())
}

/// Draw a cid of `len` bytes and bind it to `key`.
fn bind_fresh_cid(
    routes: &mut CidRoutes,
    rng: &mut dyn RandomSource,
    len: usize,
    key: &ConnectionId,
) -> Result<ConnectionId> {
    if len == 0 {
        return Ok(ConnectionId::empty());
    }
    (0..CID_ATTEMPTS)
        .map(|_| random_cid(rng, len))
        .find(|cid| routes.bind(cid.clone(), key.clone()))
        .ok_or(Error::transport(
            TransportError::InternalError,
            "no unused connection ID available",
        ))
}

impl Endpoint {
    pub fn new(
        config: EndpointConfig,
        crypto: Box<dyn CryptoService>,
        network: Box<dyn NetworkService>,
        rng: Box<dyn RandomSource>,
    ) -> Self {
        Self {
            config,
            registry: ConnectionRegistry::new(),
            crypto,
            network,
            rng,
            events: VecDeque::new(),
        }
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    pub fn connection(&self, key: &ConnectionId) -> Option<&Connection> {
        self.registry.get(key)
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.registry.iter()
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn crypto(&self) -> &dyn CryptoService {
        &*self.crypto
    }

    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    pub fn drain_events(&mut self) -> Vec<Event> {
        self.events.drain(..).collect()
    }

    fn connection_mut(&mut self, key: &ConnectionId) -> Result<&mut Connection> {
        self.registry.get_mut(key).ok_or_else(|| unknown(key))
    }

    /// Start a client connection to `server`; returns its key cid.
    pub fn connect(&mut self, server: SocketAddr) -> Result<ConnectionId> {
        if self.config.side.is_server() {
            return Err(Error::transport(
                TransportError::InternalError,
                "connect called on a server endpoint",
            ));
        }
        let Self {
            config,
            registry,
            crypto,
            rng,
            events,
            ..
        } = self;

        let key = (0..CID_ATTEMPTS)
            .map(|_| random_cid(rng.as_mut(), CLIENT_INITIAL_DCID_LEN))
            .find(|cid| registry.get(cid).is_none() && !registry.routes().is_known(cid))
            .ok_or(Error::transport(
                TransportError::InternalError,
                "no unused connection ID available",
            ))?;
        let local = bind_fresh_cid(registry.routes_mut(), rng.as_mut(), config.local_cid_len, &key)?;
        crypto.derive_initial_keys(&key, INITIAL_SALT_V1, key.as_bytes())?;

        let mut conn = Connection::new(config, key.clone(), local, key.clone(), server);
        conn.offered_suites = SUPPORTED_CIPHER_SUITES.to_vec();
        let hello = build_client_hello(rng.as_mut(), conn.local_params());
        send_message(&mut conn, EncryptionLevel::Initial, &hello, events)?;
        registry.insert(conn);

        info!(cid = %key, %server, "client connection started");
        self.flush()?;
        Ok(key)
    }

    /// Process one datagram; coalesced packets are handled in order.
    pub fn recv(&mut self, from: SocketAddr, datagram: Bytes) -> Result<()> {
        let mut offset = 0;
        while offset < datagram.len() {
            let packet = datagram.slice(offset..);
            let header = match parse_header(&packet, self.config.local_cid_len) {
                Ok(header) => header,
                Err(err) => {
                    debug!(%from, offset, error = %err, "dropping rest of datagram");
                    break;
                }
            };
            let len = header.packet_len;
            self.recv_packet(from, datagram.len(), &packet, header)?;
            offset += len;
        }
        self.flush()
    }

    /// Find the connection a packet belongs to, creating one for an
    /// acceptable client Initial.
    fn route(
        &mut self,
        from: SocketAddr,
        datagram_len: usize,
        header: &PacketHeader,
    ) -> Result<Option<ConnectionId>> {
        if let Some(key) = self.registry.route(&header.dcid) {
            return Ok(Some(key.clone()));
        }
        let acceptable = self.config.side.is_server()
            && header.packet_type == PacketType::Initial
            && datagram_len >= MIN_INITIAL_PACKET_SIZE
            && header.version == self.config.version
            && !header.dcid.is_empty()
            && !self.registry.routes().is_known(&header.dcid);
        if !acceptable {
            return Ok(None);
        }

        let key = header.dcid.clone();
        let routes = self.registry.routes_mut();
        routes.bind(key.clone(), key.clone());
        let local = bind_fresh_cid(routes, self.rng.as_mut(), self.config.local_cid_len, &key)?;
        self.crypto
            .derive_initial_keys(&key, INITIAL_SALT_V1, key.as_bytes())?;
        let conn = Connection::new(&self.config, key.clone(), local, header.scid.clone(), from);
        self.registry.insert(conn);
        info!(cid = %key, %from, "accepted new connection");
        Ok(Some(key))
    }

    fn recv_packet(
        &mut self,
        from: SocketAddr,
        datagram_len: usize,
        packet: &Bytes,
        header: PacketHeader,
    ) -> Result<()> {
        let Some(key) = self.route(from, datagram_len, &header)? else {
            debug!(dcid = %header.dcid, packet_type = ?header.packet_type, "no connection for packet");
            self.events.push_back(Event::PacketUndecryptable {
                cid: header.dcid.clone(),
                level: header.packet_type.level(),
            });
            return Ok(());
        };
        let Self {
            config,
            registry,
            crypto,
            rng,
            events,
            ..
        } = self;
        let Some((conn, routes)) = registry.split_mut(&key) else {
            return Ok(());
        };
        let mut cx = HandlerContext {
            config,
            crypto: crypto.as_mut(),
            rng: rng.as_mut(),
            routes,
            events,
        };
        process_packet(conn, &mut cx, packet, &header);
        Ok(())
    }

    /// Deliver a timer expiry to connection `key`.
    pub fn tick(&mut self, key: &ConnectionId, timer: Timer) -> Result<()> {
        let Self {
            registry,
            crypto,
            events,
            ..
        } = self;
        let (conn, routes) = registry.split_mut(key).ok_or_else(|| unknown(key))?;
        debug!(cid = %key, ?timer, state = ?conn.state(), "timer fired");
        match timer {
            Timer::Ack => {
                for level in EncryptionLevel::SEND_ORDER {
                    conn.space_mut(level).force_ack();
                }
            }
            Timer::Closing => {
                if conn.state() == ConnectionState::Closing {
                    conn.set_state(ConnectionState::Draining, events);
                }
            }
            Timer::Draining => {
                if conn.state() == ConnectionState::Draining {
                    conn.enter_closed(crypto.as_mut(), events);
                    routes.remove_connection(key);
                }
            }
            Timer::Idle => {
                if conn.state() != ConnectionState::Closed {
                    conn.enter_closed(crypto.as_mut(), events);
                    routes.remove_connection(key);
                }
            }
        }
        self.flush()
    }

    /// Open a locally-initiated stream.
    ///
    /// At the peer's stream limit STREAMS_BLOCKED is queued and
    /// [`Error::Blocked`] returned.
    pub fn open_stream(&mut self, key: &ConnectionId, bidirectional: bool) -> Result<StreamId> {
        let conn = self.registry.get_mut(key).ok_or_else(|| unknown(key))?;
        if conn.state().is_closing() {
            return Err(Error::ConnectionClosed);
        }
        let result = conn.streams.open_local(bidirectional);
        match &result {
            Ok(stream_id) => {
                debug!(cid = %key, stream = %stream_id, "stream opened");
                self.events.push_back(Event::StreamOpened {
                    cid: key.clone(),
                    stream_id: *stream_id,
                });
            }
            Err(Error::Blocked { .. }) => {
                let limit = conn.streams.peer_max_streams(bidirectional);
                conn.queue(
                    EncryptionLevel::OneRtt,
                    Frame::StreamsBlocked(StreamsBlockedFrame {
                        bidirectional,
                        limit,
                    }),
                );
            }
            Err(_) => {}
        }
        self.flush()?;
        result
    }

    /// Queue `data` on a send stream, split into STREAM frames.
    pub fn stream_send(&mut self, key: &ConnectionId, stream_id: StreamId, data: Bytes, fin: bool) -> Result<()> {
        let chunk = self
            .config
            .max_datagram_size
            .saturating_sub(STREAM_FRAME_OVERHEAD)
            .max(1);
        let has_keys = self.crypto.has_keys(key, EncryptionLevel::OneRtt);
        let conn = self.registry.get_mut(key).ok_or_else(|| unknown(key))?;
        if conn.state().is_closing() {
            return Err(Error::ConnectionClosed);
        }
        if !has_keys {
            return Err(Error::InvalidStreamOperation {
                stream_id,
                reason: "handshake not complete",
            });
        }

        if data.is_empty() && !fin {
            return Ok(());
        }

        let len = data.len() as u64;
        let stream = conn
            .streams
            .send_stream_mut(stream_id)
            .ok_or(Error::InvalidStreamOperation {
                stream_id,
                reason: "no such send stream",
            })?;
        if let Err(err) = stream.check_write(len) {
            if let Error::Blocked { .. } = err {
                if let Some(limit) = stream.credit_mut().take_blocked() {
                    conn.queue(
                        EncryptionLevel::OneRtt,
                        Frame::StreamDataBlocked(StreamDataBlockedFrame { stream_id, limit }),
                    );
                }
                self.flush()?;
            }
            return Err(err);
        }
        if len > conn.flow.send.available() {
            if let Some(limit) = conn.flow.send.take_blocked() {
                conn.queue(
                    EncryptionLevel::OneRtt,
                    Frame::DataBlocked(DataBlockedFrame { limit }),
                );
            }
            self.flush()?;
            return Err(Error::Blocked { stream_id });
        }

        let Some(stream) = conn.streams.send_stream_mut(stream_id) else {
            return Err(Error::InvalidStreamOperation {
                stream_id,
                reason: "no such send stream",
            });
        };
        let before = stream.state();
        let start = stream.write(len, fin)?;
        let after = stream.state();
        conn.flow
            .send
            .consume(len)
            .map_err(|_| Error::Blocked { stream_id })?;

        let mut offset = 0;
        loop {
            let end = (offset + chunk).min(data.len());
            let last = end == data.len();
            conn.queue(
                EncryptionLevel::OneRtt,
                Frame::Stream(StreamFrame {
                    stream_id,
                    offset: start + offset as u64,
                    fin: fin && last,
                    data: data.slice(offset..end),
                }),
            );
            if last {
                break;
            }
            offset = end;
        }
        trace!(cid = %key, stream = %stream_id, len, fin, "stream data queued");
        if before != after {
            send_state_event(conn, stream_id, &mut self.events);
        }
        self.flush()
    }

    /// Read everything contiguous on a receive stream; the flag is true
    /// once the FIN has been delivered.
    pub fn stream_read(&mut self, key: &ConnectionId, stream_id: StreamId) -> Result<(Bytes, bool)> {
        let conn = self.registry.get_mut(key).ok_or_else(|| unknown(key))?;
        let stream = conn
            .streams
            .recv_stream_mut(stream_id)
            .ok_or(Error::InvalidStreamOperation {
                stream_id,
                reason: "no such receive stream",
            })?;
        let before = stream.state();
        let result = stream.read();
        let max_stream_data = stream.next_max_stream_data();
        let after = stream.state();

        if let Ok((data, _)) = &result {
            conn.flow.recv.on_consumed(data.len() as u64);
        }
        if let Some(maximum_stream_data) = max_stream_data {
            conn.queue(
                EncryptionLevel::OneRtt,
                Frame::MaxStreamData(MaxStreamDataFrame {
                    stream_id,
                    maximum_stream_data,
                }),
            );
        }
        if let Some(maximum_data) = conn.flow.recv.next_max_data() {
            conn.queue(
                EncryptionLevel::OneRtt,
                Frame::MaxData(MaxDataFrame { maximum_data }),
            );
        }
        if before != after {
            recv_state_event(conn, stream_id, &mut self.events);
        }
        conn.streams.collect_closed();
        queue_max_streams(conn);
        self.flush()?;
        result
    }

    /// Abandon sending on a stream with RESET_STREAM.
    pub fn reset_stream(&mut self, key: &ConnectionId, stream_id: StreamId, error_code: u64) -> Result<()> {
        let conn = self.registry.get_mut(key).ok_or_else(|| unknown(key))?;
        if conn.state().is_closing() {
            return Err(Error::ConnectionClosed);
        }
        let stream = conn
            .streams
            .send_stream_mut(stream_id)
            .ok_or(Error::InvalidStreamOperation {
                stream_id,
                reason: "no such send stream",
            })?;
        let final_size = stream.reset(error_code)?;
        conn.drop_stream_frames(stream_id);
        conn.queue(
            EncryptionLevel::OneRtt,
            Frame::ResetStream(ResetStreamFrame {
                stream_id,
                error_code,
                final_size,
            }),
        );
        send_state_event(conn, stream_id, &mut self.events);
        self.flush()
    }

    /// Ask the peer to stop sending on a stream.
    pub fn stop_sending(&mut self, key: &ConnectionId, stream_id: StreamId, error_code: u64) -> Result<()> {
        let conn = self.registry.get_mut(key).ok_or_else(|| unknown(key))?;
        if conn.state().is_closing() {
            return Err(Error::ConnectionClosed);
        }
        if conn.streams.recv_stream(stream_id).is_none() {
            return Err(Error::InvalidStreamOperation {
                stream_id,
                reason: "no such receive stream",
            });
        }
        conn.queue(
            EncryptionLevel::OneRtt,
            Frame::StopSending(StopSendingFrame {
                stream_id,
                error_code,
            }),
        );
        self.flush()
    }

    /// Close with an application error code.
    pub fn close(&mut self, key: &ConnectionId, error_code: u64, reason: &str) -> Result<()> {
        let Self {
            registry,
            crypto,
            events,
            ..
        } = self;
        let conn = registry.get_mut(key).ok_or_else(|| unknown(key))?;
        info!(cid = %key, error_code, reason, "application close");
        conn.close_by_application(
            error_code,
            Bytes::copy_from_slice(reason.as_bytes()),
            &**crypto,
            events,
        );
        self.flush()
    }

    /// Send a PATH_CHALLENGE with fresh random data.
    pub fn send_path_challenge(&mut self, key: &ConnectionId) -> Result<[u8; 8]> {
        let mut data = [0u8; 8];
        self.rng.fill(&mut data);
        let conn = self.connection_mut(key)?;
        if conn.state().is_closing() {
            return Err(Error::ConnectionClosed);
        }
        conn.path_challenges.push(data);
        conn.queue(
            EncryptionLevel::OneRtt,
            Frame::PathChallenge(PathChallengeFrame { data }),
        );
        self.flush()?;
        Ok(data)
    }

    /// Issue up to `count` more connection IDs to the peer.
    pub fn issue_connection_ids(&mut self, key: &ConnectionId, count: u64) -> Result<Vec<ConnectionId>> {
        let Self {
            config,
            registry,
            crypto,
            rng,
            events,
            ..
        } = self;
        let (conn, routes) = registry.split_mut(key).ok_or_else(|| unknown(key))?;
        if conn.state().is_closing() {
            return Err(Error::ConnectionClosed);
        }
        let mut cx = HandlerContext {
            config,
            crypto: crypto.as_mut(),
            rng: rng.as_mut(),
            routes,
            events,
        };
        let issued = handlers::issue_connection_ids(conn, &mut cx, count)?;
        self.flush()?;
        Ok(issued)
    }

    /// Elicit an acknowledgement with a PING at the highest available level.
    pub fn send_ping(&mut self, key: &ConnectionId) -> Result<()> {
        let level = EncryptionLevel::SEND_ORDER
            .iter()
            .rev()
            .copied()
            .find(|level| self.crypto.has_keys(key, *level))
            .unwrap_or(EncryptionLevel::Initial);
        let conn = self.connection_mut(key)?;
        if conn.state().is_closing() {
            return Err(Error::ConnectionClosed);
        }
        conn.queue(level, Frame::Ping);
        self.flush()
    }

    /// Packetize everything queued on every connection and send it.
    pub fn flush(&mut self) -> Result<()> {
        let Self {
            config,
            registry,
            crypto,
            network,
            events,
            ..
        } = self;
        for key in registry.keys() {
            let Some(conn) = registry.get_mut(&key) else {
                continue;
            };
            let peer = conn.peer_addr();
            for datagram in packetize(conn, &**crypto, config, events)? {
                trace!(cid = %key, %peer, len = datagram.len(), "sending datagram");
                network.send(peer, datagram);
            }
        }
        Ok(())
    }
}

fn undecryptable(conn: &mut Connection, level: EncryptionLevel, events: &mut VecDeque<Event>) {
    conn.stats.packets_undecryptable += 1;
    events.push_back(Event::PacketUndecryptable {
        cid: conn.key_cid().clone(),
        level,
    });
}

/// Open one routed packet and dispatch its frames.
fn process_packet(conn: &mut Connection, cx: &mut HandlerContext<'_>, packet: &Bytes, header: &PacketHeader) {
    let key = conn.key_cid().clone();
    let level = header.packet_type.level();
    if matches!(conn.state(), ConnectionState::Draining | ConnectionState::Closed) {
        trace!(cid = %key, state = ?conn.state(), "dropping packet");
        return;
    }
    if header.packet_type.is_long_header() && header.version != conn.version() {
        let err = Error::protocol_violation("long header with a different version");
        conn.fail(&err, 0, &*cx.crypto, cx.events);
        return;
    }
    if conn.side().is_client() && header.packet_type == PacketType::Initial && !header.token.is_empty() {
        let err = Error::protocol_violation("server Initial carried a token");
        conn.fail(&err, 0, &*cx.crypto, cx.events);
        return;
    }
    if !cx.crypto.has_keys(&key, level) {
        trace!(cid = %key, level = level.name(), "no keys for packet");
        undecryptable(conn, level, cx.events);
        return;
    }

    let largest = conn.space(level).largest_received();
    let opened = match unprotect(&*cx.crypto, &key, packet, header, largest) {
        Ok(Some(opened)) => opened,
        Ok(None) => {
            undecryptable(conn, level, cx.events);
            return;
        }
        Err(err) => {
            debug!(cid = %key, error = %err, "dropping malformed packet");
            return;
        }
    };
    let packet_number = opened.packet_number;
    if conn.space(level).is_duplicate(packet_number) {
        trace!(cid = %key, pn = packet_number, "duplicate packet");
        return;
    }

    conn.stats.packets_received += 1;
    conn.stats.bytes_received += header.packet_len as u64;
    cx.events.push_back(Event::PacketReceived {
        cid: key.clone(),
        level,
        packet_number,
    });

    // the server's first long header chooses the cid we address it by
    if header.packet_type.is_long_header() && !conn.remote_cid_confirmed {
        conn.remote_cids.replace_initial(header.scid.clone());
        conn.remote_cid_confirmed = true;
    }

    let frames = match parse_frames(&opened.payload) {
        Ok(frames) if frames.is_empty() => {
            let err = Error::protocol_violation("packet without frames");
            conn.fail(&err, 0, &*cx.crypto, cx.events);
            return;
        }
        Ok(frames) => frames,
        Err(err) => {
            conn.fail(&err, 0, &*cx.crypto, cx.events);
            return;
        }
    };

    let ack_eliciting = frames.iter().any(Frame::is_ack_eliciting);
    let ignore_order = conn.ack_policy.ignore_order;
    conn.space_mut(level)
        .on_packet_received(packet_number, ack_eliciting, ignore_order);

    if conn.state() == ConnectionState::Closing {
        let peer_closed = frames
            .iter()
            .any(|f| matches!(f, Frame::ConnectionClose(_) | Frame::ApplicationClose(_)));
        if peer_closed {
            conn.on_peer_close(&*cx.crypto, cx.events);
        } else {
            conn.on_packet_while_closing();
        }
        return;
    }

    let info = PacketInfo {
        level,
        packet_number,
        src_cid: &header.scid,
        dst_cid: &header.dcid,
    };
    for frame in &frames {
        if let Err(err) = handle_frame(conn, cx, frame, &info) {
            conn.fail(&err, frame.frame_type(), &*cx.crypto, cx.events);
            break;
        }
        conn.stats.frames_handled += 1;
        cx.events.push_back(Event::FrameHandled {
            cid: key.clone(),
            level,
            frame: frame.clone(),
        });
        if conn.state().is_closing() {
            break;
        }
    }
}
