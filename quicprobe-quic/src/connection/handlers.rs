//! # Frame Dispatch (RFC 9000 Sections 12.4, 19)
//!
//! [`handle_frame`] validates one decoded frame against the connection's
//! state and applies it. Every rule violation is returned as an error;
//! the endpoint turns connection-fatal errors into a close.
//!
//! Handlers queue their responses on the connection and never recurse
//! into the dispatcher.

#![forbid(unsafe_code)]

use super::cid_manager::{random_cid, random_reset_token};
use super::events::Event;
use super::handshake;
use super::registry::CidRoutes;
use super::state::{Connection, ConnectionState, EndpointConfig};
use crate::crypto::{CryptoService, EncryptionLevel};
use crate::error::{Error, Result, TransportError};
use crate::frames::{
    AckFrame, AckFrequencyFrame, Frame, NewConnectionIdFrame, NewTokenFrame, PathResponseFrame,
    ResetStreamFrame, RetireConnectionIdFrame, StopSendingFrame, StreamFrame, MAX_STREAMS_LIMIT,
};
use crate::services::RandomSource;
use crate::transport::parameters::DEFAULT_ACTIVE_CONNECTION_ID_LIMIT;
use crate::types::{ConnectionId, PacketNumber, StreamId};
use std::collections::VecDeque;
use tracing::{debug, trace};

/// Attempts at drawing a cid that was never bound before giving up
const CID_ATTEMPTS: usize = 16;

/// Endpoint-wide collaborators a handler may use.
pub struct HandlerContext<'a> {
    pub config: &'a EndpointConfig,
    pub crypto: &'a mut dyn CryptoService,
    pub rng: &'a mut dyn RandomSource,
    pub routes: &'a mut CidRoutes,
    pub events: &'a mut VecDeque<Event>,
}

/// The packet a frame arrived in.
#[derive(Debug, Clone, Copy)]
pub struct PacketInfo<'a> {
    pub level: EncryptionLevel,
    pub packet_number: PacketNumber,

    /// Source Connection ID (empty for short headers)
    pub src_cid: &'a ConnectionId,
    pub dst_cid: &'a ConnectionId,
}

/// Validate and apply one frame.
pub fn handle_frame(
    conn: &mut Connection,
    cx: &mut HandlerContext<'_>,
    frame: &Frame,
    packet: &PacketInfo<'_>,
) -> Result<()> {
    if !frame.allowed_at(packet.level) {
        return Err(Error::protocol_violation("frame not allowed at this encryption level"));
    }
    trace!(
        cid = %conn.key_cid(),
        frame = frame.name(),
        level = packet.level.name(),
        pn = packet.packet_number,
        "handling frame"
    );

    match frame {
        Frame::Padding { .. } | Frame::Ping => Ok(()),
        Frame::Ack(ack) => on_ack(conn, cx, ack, packet.level),
        Frame::ResetStream(f) => on_reset_stream(conn, cx, f),
        Frame::StopSending(f) => on_stop_sending(conn, cx, f),
        Frame::Crypto(f) => handshake::on_crypto_frame(conn, cx, f, packet),
        Frame::NewToken(f) => on_new_token(conn, f),
        Frame::Stream(f) => on_stream(conn, cx, f),
        Frame::MaxData(f) => {
            conn.flow.send.raise(f.maximum_data);
            Ok(())
        }
        Frame::MaxStreamData(f) => {
            if let Some(stream) = conn.streams.send_for_frame(f.stream_id)? {
                stream.credit_mut().raise(f.maximum_stream_data);
            }
            announce_opened(conn, cx.events);
            Ok(())
        }
        Frame::MaxStreams(f) => {
            if f.maximum_streams > MAX_STREAMS_LIMIT {
                return Err(Error::frame_encoding("MAX_STREAMS above 2^60"));
            }
            conn.streams
                .raise_peer_max_streams(f.bidirectional, f.maximum_streams);
            Ok(())
        }
        Frame::DataBlocked(f) => {
            debug!(cid = %conn.key_cid(), limit = f.limit, "peer blocked on connection credit");
            Ok(())
        }
        Frame::StreamDataBlocked(f) => {
            conn.streams.recv_for_frame(f.stream_id)?;
            announce_opened(conn, cx.events);
            Ok(())
        }
        Frame::StreamsBlocked(f) => {
            if f.limit > MAX_STREAMS_LIMIT {
                return Err(Error::frame_encoding("STREAMS_BLOCKED above 2^60"));
            }
            Ok(())
        }
        Frame::NewConnectionId(f) => on_new_connection_id(conn, f),
        Frame::RetireConnectionId(f) => on_retire_connection_id(conn, cx, f, packet.dst_cid),
        Frame::PathChallenge(f) => {
            conn.queue(
                EncryptionLevel::OneRtt,
                Frame::PathResponse(PathResponseFrame { data: f.data }),
            );
            Ok(())
        }
        Frame::PathResponse(f) => on_path_response(conn, cx, f),
        Frame::ConnectionClose(_) | Frame::ApplicationClose(_) => {
            debug!(cid = %conn.key_cid(), "peer closed the connection");
            conn.on_peer_close(cx.crypto, cx.events);
            Ok(())
        }
        Frame::HandshakeDone => on_handshake_done(conn, cx),
        Frame::AckFrequency(f) => on_ack_frequency(conn, f),
        Frame::Unknown(_) => Err(Error::frame_encoding("unknown frame type")),
    }
}

pub(crate) fn announce_opened(conn: &mut Connection, events: &mut VecDeque<Event>) {
    for stream_id in conn.streams.take_opened() {
        events.push_back(Event::StreamOpened {
            cid: conn.key_cid().clone(),
            stream_id,
        });
    }
}

pub(crate) fn send_state_event(conn: &Connection, stream_id: StreamId, events: &mut VecDeque<Event>) {
    if let Some(state) = conn.send_stream_state(stream_id) {
        events.push_back(Event::SendStreamStateChanged {
            cid: conn.key_cid().clone(),
            stream_id,
            state,
        });
    }
}

pub(crate) fn recv_state_event(conn: &Connection, stream_id: StreamId, events: &mut VecDeque<Event>) {
    if let Some(state) = conn.recv_stream_state(stream_id) {
        events.push_back(Event::RecvStreamStateChanged {
            cid: conn.key_cid().clone(),
            stream_id,
            state,
        });
    }
}

/// Queue MAX_STREAMS for every direction where peer streams have closed.
pub(crate) fn queue_max_streams(conn: &mut Connection) {
    for bidirectional in [true, false] {
        if let Some(maximum_streams) = conn.streams.next_max_streams(bidirectional) {
            conn.queue(
                EncryptionLevel::OneRtt,
                Frame::MaxStreams(crate::frames::MaxStreamsFrame {
                    bidirectional,
                    maximum_streams,
                }),
            );
        }
    }
}

fn on_ack(
    conn: &mut Connection,
    cx: &mut HandlerContext<'_>,
    ack: &AckFrame,
    level: EncryptionLevel,
) -> Result<()> {
    let ranges = ack.ranges()?;
    let acked = conn.space_mut(level).on_ack(&ranges)?;

    for packet in acked {
        for frame in &packet.frames {
            match frame {
                Frame::Stream(f) => {
                    let done = conn
                        .streams
                        .send_stream_mut(f.stream_id)
                        .map_or(false, |s| s.on_acked(f.offset, f.data.len() as u64, f.fin));
                    if done {
                        send_state_event(conn, f.stream_id, cx.events);
                    }
                }
                Frame::ResetStream(f) => {
                    let done = conn
                        .streams
                        .send_stream_mut(f.stream_id)
                        .map_or(false, |s| s.on_reset_acked());
                    if done {
                        send_state_event(conn, f.stream_id, cx.events);
                    }
                }
                _ => {}
            }
        }
    }
    conn.streams.collect_closed();
    queue_max_streams(conn);
    Ok(())
}

fn on_stream(conn: &mut Connection, cx: &mut HandlerContext<'_>, frame: &StreamFrame) -> Result<()> {
    let id = frame.stream_id;
    if id.initiator() == conn.side() && id.is_unidirectional() {
        return Err(Error::protocol_violation(
            "STREAM frame on a locally-initiated unidirectional stream",
        ));
    }
    let Some(stream) = conn.streams.recv_for_frame(id)? else {
        trace!(cid = %conn.key_cid(), stream = %id, "STREAM frame for a closed stream");
        return Ok(());
    };
    let before = stream.state();
    let increase = stream.on_stream_frame(frame)?;
    let after = stream.state();
    conn.flow.on_stream_received(increase)?;

    announce_opened(conn, cx.events);
    if before != after {
        recv_state_event(conn, id, cx.events);
    }
    Ok(())
}

fn on_reset_stream(
    conn: &mut Connection,
    cx: &mut HandlerContext<'_>,
    frame: &ResetStreamFrame,
) -> Result<()> {
    let Some(stream) = conn.streams.recv_for_frame(frame.stream_id)? else {
        return Ok(());
    };
    let before = stream.state();
    let increase = stream.on_reset(frame)?;
    let after = stream.state();
    conn.flow.on_stream_received(increase)?;

    announce_opened(conn, cx.events);
    if before != after {
        recv_state_event(conn, frame.stream_id, cx.events);
    }
    Ok(())
}

fn on_stop_sending(
    conn: &mut Connection,
    cx: &mut HandlerContext<'_>,
    frame: &StopSendingFrame,
) -> Result<()> {
    let reset = match conn.streams.send_for_frame(frame.stream_id)? {
        Some(stream) => stream.reset(frame.error_code).ok(),
        None => None,
    };
    announce_opened(conn, cx.events);
    if let Some(final_size) = reset {
        conn.drop_stream_frames(frame.stream_id);
        conn.queue(
            EncryptionLevel::OneRtt,
            Frame::ResetStream(ResetStreamFrame {
                stream_id: frame.stream_id,
                error_code: frame.error_code,
                final_size,
            }),
        );
        send_state_event(conn, frame.stream_id, cx.events);
    }
    Ok(())
}

fn on_new_token(conn: &mut Connection, frame: &NewTokenFrame) -> Result<()> {
    if conn.side().is_server() {
        return Err(Error::protocol_violation("NEW_TOKEN received by a server"));
    }
    if frame.token.is_empty() {
        return Err(Error::frame_encoding("empty NEW_TOKEN"));
    }
    conn.tokens.push(frame.token.clone());
    Ok(())
}

fn on_new_connection_id(conn: &mut Connection, frame: &NewConnectionIdFrame) -> Result<()> {
    let limit = conn.local_params().active_connection_id_limit();
    let retired = conn.remote_cids.on_new_connection_id(frame, limit)?;
    for sequence_number in retired {
        conn.queue(
            EncryptionLevel::OneRtt,
            Frame::RetireConnectionId(RetireConnectionIdFrame { sequence_number }),
        );
    }
    Ok(())
}

fn on_retire_connection_id(
    conn: &mut Connection,
    cx: &mut HandlerContext<'_>,
    frame: &RetireConnectionIdFrame,
    packet_dcid: &ConnectionId,
) -> Result<()> {
    if let Some(cid) = conn.local_cids.retire(frame.sequence_number, packet_dcid)? {
        debug!(cid = %conn.key_cid(), retired = %cid, seq = frame.sequence_number, "connection ID retired");
        cx.routes.retire(&cid);
        issue_connection_ids(conn, cx, 1)?;
    }
    Ok(())
}

/// Issue up to `count` new cids, bounded by the peer's
/// active_connection_id_limit, and queue NEW_CONNECTION_ID for each.
pub(crate) fn issue_connection_ids(
    conn: &mut Connection,
    cx: &mut HandlerContext<'_>,
    count: u64,
) -> Result<Vec<ConnectionId>> {
    let mut issued = Vec::new();
    if cx.config.local_cid_len == 0 {
        return Ok(issued);
    }
    let peer_limit = conn
        .peer_params()
        .map_or(DEFAULT_ACTIVE_CONNECTION_ID_LIMIT, |p| p.active_connection_id_limit());
    let key = conn.key_cid().clone();

    for _ in 0..count {
        if conn.local_cids.active_count() as u64 >= peer_limit {
            break;
        }
        let cid = (0..CID_ATTEMPTS)
            .map(|_| random_cid(cx.rng, cx.config.local_cid_len))
            .find(|cid| cx.routes.bind(cid.clone(), key.clone()))
            .ok_or(Error::transport(
                TransportError::InternalError,
                "no unused connection ID available",
            ))?;
        let token = random_reset_token(cx.rng);
        let frame = conn.local_cids.issue(cid.clone(), token);
        conn.queue(EncryptionLevel::OneRtt, Frame::NewConnectionId(frame));
        issued.push(cid);
    }
    Ok(issued)
}

fn on_path_response(
    conn: &mut Connection,
    cx: &mut HandlerContext<'_>,
    frame: &PathResponseFrame,
) -> Result<()> {
    let Some(index) = conn.path_challenges.iter().position(|d| *d == frame.data) else {
        return Err(Error::protocol_violation("PATH_RESPONSE without matching challenge"));
    };
    conn.path_challenges.remove(index);
    cx.events.push_back(Event::PathValidated {
        cid: conn.key_cid().clone(),
        data: frame.data,
    });
    Ok(())
}

fn on_handshake_done(conn: &mut Connection, cx: &mut HandlerContext<'_>) -> Result<()> {
    if conn.side().is_server() {
        return Err(Error::protocol_violation("HANDSHAKE_DONE received by a server"));
    }
    if conn.handshake.done_received {
        return Ok(());
    }
    conn.handshake.done_received = true;
    cx.events.push_back(Event::HandshakeDoneReceived {
        cid: conn.key_cid().clone(),
    });
    conn.set_state(ConnectionState::Established, cx.events);
    // Initial and Handshake keys are no longer needed once confirmed
    cx.crypto
        .discard_keys(conn.key_cid(), Some(EncryptionLevel::Initial));
    cx.crypto
        .discard_keys(conn.key_cid(), Some(EncryptionLevel::Handshake));
    Ok(())
}

fn on_ack_frequency(conn: &mut Connection, frame: &AckFrequencyFrame) -> Result<()> {
    let Some(min_ack_delay) = conn.local_params().min_ack_delay else {
        return Err(Error::protocol_violation(
            "ACK_FREQUENCY without advertised min_ack_delay",
        ));
    };
    let policy = &mut conn.ack_policy;
    if policy
        .last_sequence
        .map_or(false, |last| frame.sequence_number <= last)
    {
        trace!(seq = frame.sequence_number, "stale ACK_FREQUENCY ignored");
        return Ok(());
    }
    if frame.update_max_ack_delay < min_ack_delay {
        return Err(Error::protocol_violation(
            "requested max ack delay below min_ack_delay",
        ));
    }
    policy.last_sequence = Some(frame.sequence_number);
    policy.packet_tolerance = frame.packet_tolerance.max(1);
    policy.ignore_order = frame.ignore_order;
    policy.max_ack_delay_us = frame.update_max_ack_delay;
    Ok(())
}
