//! # Packetization (RFC 9000 Sections 12.2, 14)
//!
//! Turns the frames queued on a connection into sealed packets, one
//! encryption level at a time in [`EncryptionLevel::SEND_ORDER`], and
//! coalesces them into datagrams no larger than the configured size.
//!
//! A client pads every datagram carrying an Initial packet to 1200 bytes.

#![forbid(unsafe_code)]

use super::events::Event;
use super::state::{Connection, ConnectionState, EndpointConfig, SentPacket};
use crate::buffer::VarIntCodec;
use crate::crypto::{CryptoService, EncryptionLevel};
use crate::error::Result;
use crate::frames::Frame;
use crate::packet::{seal_packet, Packet, PacketType};
use crate::types::MIN_INITIAL_PACKET_SIZE;
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use tracing::{trace, warn};

/// Packet-number bytes reserved when sizing a packet
const MAX_PN_LEN: usize = 4;

/// Below this much room a new datagram is started
const MIN_PACKET_ROOM: usize = 48;

/// Bytes a packet at `level` spends outside its frames.
fn packet_overhead(conn: &Connection, level: EncryptionLevel, tag_len: usize) -> usize {
    let dcid = conn.remote_cids().current().len();
    let header = match level {
        EncryptionLevel::OneRtt => 1 + dcid + MAX_PN_LEN,
        _ => {
            // first byte, version, two cid lengths, 2-byte length field
            let mut len = 1 + 4 + 1 + dcid + 1 + conn.local_scid().len() + 2 + MAX_PN_LEN;
            if level == EncryptionLevel::Initial {
                len += VarIntCodec::size(0);
            }
            len
        }
    };
    header + tag_len
}

/// Frames whose acknowledgement the sender must act on
fn tracked(frame: &Frame) -> bool {
    matches!(frame, Frame::Stream(_) | Frame::ResetStream(_))
}

/// Build every packet the connection has queued.
pub(crate) fn packetize(
    conn: &mut Connection,
    crypto: &dyn CryptoService,
    config: &EndpointConfig,
    events: &mut VecDeque<Event>,
) -> Result<Vec<Bytes>> {
    let mut datagrams = Vec::new();
    if matches!(conn.state(), ConnectionState::Draining | ConnectionState::Closed) {
        return Ok(datagrams);
    }
    let closing = conn.state() == ConnectionState::Closing;
    let key = conn.key_cid().clone();
    let max = config.max_datagram_size;
    let mut current = BytesMut::new();

    for level in EncryptionLevel::SEND_ORDER {
        if !crypto.has_keys(&key, level) {
            continue;
        }
        loop {
            let tolerance = conn.ack_policy().packet_tolerance;
            let has_pending = conn.space(level).pending_frames() > 0;
            let ack = if !closing && conn.space(level).wants_ack(level, tolerance, has_pending) {
                conn.space_mut(level).build_ack()
            } else {
                None
            };
            if ack.is_none() && !has_pending {
                break;
            }

            let overhead = packet_overhead(conn, level, crypto.tag_len());
            let first = ack.as_ref().map_or(0, Frame::encoded_len)
                + conn.space(level).pending.front().map_or(0, Frame::encoded_len);
            if !current.is_empty() && current.len() + overhead + first.max(MIN_PACKET_ROOM) > max {
                datagrams.push(current.split().freeze());
            }
            let room = max.saturating_sub(current.len() + overhead);

            let mut frames = Vec::new();
            let mut used = 0;
            if let Some(ack) = ack {
                used += ack.encoded_len();
                frames.push(ack);
            }
            let space = conn.space_mut(level);
            while let Some(len) = space.pending.front().map(Frame::encoded_len) {
                if !frames.is_empty() && used + len > room {
                    break;
                }
                used += len;
                if let Some(frame) = space.pending.pop_front() {
                    frames.push(frame);
                }
            }
            if used > room {
                warn!(cid = %key, level = level.name(), size = used, "frame larger than a datagram");
            }

            let min_size = if conn.side().is_client() && level == EncryptionLevel::Initial {
                MIN_INITIAL_PACKET_SIZE.saturating_sub(current.len())
            } else {
                0
            };
            let packet_number = conn.space_mut(level).take_packet_number();
            let packet = Packet {
                packet_type: PacketType::for_level(level),
                version: conn.version(),
                dcid: conn.remote_cids().current(),
                scid: conn.local_scid().clone(),
                token: Bytes::new(),
                packet_number,
                frames,
            };
            let sealed = seal_packet(crypto, &key, &packet, conn.space(level).max_acked(), min_size)?;

            if !current.is_empty() && current.len() + sealed.len() > max {
                datagrams.push(current.split().freeze());
            }
            current.extend_from_slice(&sealed);

            trace!(cid = %key, level = level.name(), pn = packet_number, len = sealed.len(), "packet sent");
            conn.stats.packets_sent += 1;
            conn.stats.bytes_sent += sealed.len() as u64;
            events.push_back(Event::PacketSent {
                cid: key.clone(),
                level,
                packet_number,
            });

            let frames = packet.frames;
            let done = frames.iter().any(|f| matches!(f, Frame::HandshakeDone));
            conn.space_mut(level).on_packet_sent(SentPacket {
                packet_number,
                ack_eliciting: frames.iter().any(Frame::is_ack_eliciting),
                frames: frames.into_iter().filter(tracked).collect(),
            });

            if done && conn.side().is_server() && !conn.handshake.done_sent {
                conn.handshake.done_sent = true;
                events.push_back(Event::HandshakeDoneSent { cid: key.clone() });
                conn.set_state(ConnectionState::Established, events);
            }
        }
    }

    if !current.is_empty() {
        datagrams.push(current.freeze());
    }
    Ok(datagrams)
}
