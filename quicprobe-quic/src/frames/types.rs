//! # QUIC Frame Types (RFC 9000 Section 19)
//!
//! QUIC packets contain one or more frames carrying control or application data.
//!
//! ## Frame Classification:
//! - **ACK-eliciting**: everything except ACK, PADDING and CONNECTION_CLOSE
//! - **Non-ACK-eliciting**: ACK, CONNECTION_CLOSE, PADDING
//!
//! Frames own their payloads as [`Bytes`] slices of the packet they were
//! decoded from. Cloning a frame shares the payload; frames are immutable,
//! so a clone is observably an independent value.

#![forbid(unsafe_code)]

use crate::crypto::EncryptionLevel;
use crate::error::{Error, Result};
use crate::types::{ConnectionId, PacketNumber, StatelessResetToken, StreamId, VarInt};
use bytes::Bytes;
use core::ops::RangeInclusive;

/// Frame Type Constants (RFC 9000 Section 19)
pub const FRAME_TYPE_PADDING: u64 = 0x00;
pub const FRAME_TYPE_PING: u64 = 0x01;
pub const FRAME_TYPE_ACK: u64 = 0x02;
pub const FRAME_TYPE_ACK_ECN: u64 = 0x03;
pub const FRAME_TYPE_RESET_STREAM: u64 = 0x04;
pub const FRAME_TYPE_STOP_SENDING: u64 = 0x05;
pub const FRAME_TYPE_CRYPTO: u64 = 0x06;
pub const FRAME_TYPE_NEW_TOKEN: u64 = 0x07;
pub const FRAME_TYPE_STREAM_BASE: u64 = 0x08; // 0x08-0x0f
pub const FRAME_TYPE_MAX_DATA: u64 = 0x10;
pub const FRAME_TYPE_MAX_STREAM_DATA: u64 = 0x11;
pub const FRAME_TYPE_MAX_STREAMS_BIDI: u64 = 0x12;
pub const FRAME_TYPE_MAX_STREAMS_UNI: u64 = 0x13;
pub const FRAME_TYPE_DATA_BLOCKED: u64 = 0x14;
pub const FRAME_TYPE_STREAM_DATA_BLOCKED: u64 = 0x15;
pub const FRAME_TYPE_STREAMS_BLOCKED_BIDI: u64 = 0x16;
pub const FRAME_TYPE_STREAMS_BLOCKED_UNI: u64 = 0x17;
pub const FRAME_TYPE_NEW_CONNECTION_ID: u64 = 0x18;
pub const FRAME_TYPE_RETIRE_CONNECTION_ID: u64 = 0x19;
pub const FRAME_TYPE_PATH_CHALLENGE: u64 = 0x1a;
pub const FRAME_TYPE_PATH_RESPONSE: u64 = 0x1b;
pub const FRAME_TYPE_CONNECTION_CLOSE_QUIC: u64 = 0x1c;
pub const FRAME_TYPE_CONNECTION_CLOSE_APP: u64 = 0x1d;
pub const FRAME_TYPE_HANDSHAKE_DONE: u64 = 0x1e;

/// ACK_FREQUENCY (draft-ietf-quic-ack-frequency)
pub const FRAME_TYPE_ACK_FREQUENCY: u64 = 0xaf;

/// STREAM Frame Flag Bits (RFC 9000 Section 19.8)
///
/// - Bit 0 (FIN): Last frame in stream
/// - Bit 1 (LEN): Length field present
/// - Bit 2 (OFF): Offset field present
pub const STREAM_FRAME_BIT_FIN: u64 = 0x01;
pub const STREAM_FRAME_BIT_LEN: u64 = 0x02;
pub const STREAM_FRAME_BIT_OFF: u64 = 0x04;

/// Largest stream count MAX_STREAMS / STREAMS_BLOCKED may carry (2^60).
pub const MAX_STREAMS_LIMIT: u64 = 1 << 60;

/// ACK Frame (RFC 9000 Section 19.3)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AckFrame {
    /// Largest packet number being acknowledged
    pub largest_acked: PacketNumber,

    /// Encoded delay, scaled by the sender's ack_delay_exponent
    pub ack_delay: VarInt,

    /// Number of packets preceding largest_acked that are also acknowledged
    pub first_ack_range: VarInt,

    /// Additional (gap, length) ranges, descending
    pub ack_ranges: tinyvec::TinyVec<[AckRange; 8]>,

    /// ECN counts (only present in ACK_ECN frames)
    pub ecn_counts: Option<EcnCounts>,
}

/// ACK Range (RFC 9000 Section 19.3.1)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct AckRange {
    /// Unacknowledged packets before this range, minus one
    pub gap: VarInt,

    /// Acknowledged packets in this range, minus one
    pub length: VarInt,
}

/// ECN Counts (RFC 9000 Section 19.3.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EcnCounts {
    pub ect0_count: VarInt,
    pub ect1_count: VarInt,
    pub ce_count: VarInt,
}

impl AckFrame {
    /// Build an ACK frame from inclusive ranges sorted highest first.
    ///
    /// Returns None for an empty range list.
    pub fn from_ranges(ranges: &[RangeInclusive<u64>], ack_delay: VarInt) -> Option<Self> {
        let (first, rest) = ranges.split_first()?;
        let mut ack_ranges = tinyvec::TinyVec::new();
        let mut smallest = *first.start();
        for range in rest {
            ack_ranges.push(AckRange {
                gap: smallest - range.end() - 2,
                length: range.end() - range.start(),
            });
            smallest = *range.start();
        }
        Some(Self {
            largest_acked: *first.end(),
            ack_delay,
            first_ack_range: first.end() - first.start(),
            ack_ranges,
            ecn_counts: None,
        })
    }

    /// Expand the gap encoding into inclusive packet-number ranges,
    /// highest first.
    ///
    /// Fails with FRAME_ENCODING_ERROR when a range would go below zero.
    pub fn ranges(&self) -> Result<Vec<RangeInclusive<u64>>> {
        let underflow = || Error::frame_encoding("ACK range below packet number zero");

        let mut out = Vec::with_capacity(1 + self.ack_ranges.len());
        let mut smallest = self
            .largest_acked
            .checked_sub(self.first_ack_range)
            .ok_or_else(underflow)?;
        out.push(smallest..=self.largest_acked);

        for range in &self.ack_ranges {
            let largest = smallest
                .checked_sub(range.gap)
                .and_then(|v| v.checked_sub(2))
                .ok_or_else(underflow)?;
            smallest = largest.checked_sub(range.length).ok_or_else(underflow)?;
            out.push(smallest..=largest);
        }
        Ok(out)
    }
}

/// RESET_STREAM Frame (RFC 9000 Section 19.4)
///
/// Abruptly terminates sending on a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResetStreamFrame {
    pub stream_id: StreamId,
    pub error_code: VarInt,
    pub final_size: VarInt,
}

/// STOP_SENDING Frame (RFC 9000 Section 19.5)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StopSendingFrame {
    pub stream_id: StreamId,
    pub error_code: VarInt,
}

/// CRYPTO Frame (RFC 9000 Section 19.6)
///
/// Carries cryptographic handshake messages.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CryptoFrame {
    pub offset: VarInt,
    pub data: Bytes,
}

/// NEW_TOKEN Frame (RFC 9000 Section 19.7)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NewTokenFrame {
    pub token: Bytes,
}

/// STREAM Frame (RFC 9000 Section 19.8)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamFrame {
    pub stream_id: StreamId,

    /// Byte offset in stream (0 if OFF bit not set)
    pub offset: VarInt,

    /// FIN bit: this frame carries the end of the stream
    pub fin: bool,

    pub data: Bytes,
}

impl StreamFrame {
    /// Offset one past the last byte carried
    pub fn end(&self) -> u64 {
        self.offset + self.data.len() as u64
    }
}

/// MAX_DATA Frame (RFC 9000 Section 19.9)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MaxDataFrame {
    pub maximum_data: VarInt,
}

/// MAX_STREAM_DATA Frame (RFC 9000 Section 19.10)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MaxStreamDataFrame {
    pub stream_id: StreamId,
    pub maximum_stream_data: VarInt,
}

/// MAX_STREAMS Frame (RFC 9000 Section 19.11)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MaxStreamsFrame {
    pub bidirectional: bool,
    pub maximum_streams: VarInt,
}

/// DATA_BLOCKED Frame (RFC 9000 Section 19.12)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DataBlockedFrame {
    pub limit: VarInt,
}

/// STREAM_DATA_BLOCKED Frame (RFC 9000 Section 19.13)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamDataBlockedFrame {
    pub stream_id: StreamId,
    pub limit: VarInt,
}

/// STREAMS_BLOCKED Frame (RFC 9000 Section 19.14)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamsBlockedFrame {
    pub bidirectional: bool,
    pub limit: VarInt,
}

/// NEW_CONNECTION_ID Frame (RFC 9000 Section 19.15)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NewConnectionIdFrame {
    pub sequence_number: VarInt,
    pub retire_prior_to: VarInt,
    pub connection_id: ConnectionId,
    pub stateless_reset_token: StatelessResetToken,
}

/// RETIRE_CONNECTION_ID Frame (RFC 9000 Section 19.16)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RetireConnectionIdFrame {
    pub sequence_number: VarInt,
}

/// PATH_CHALLENGE Frame (RFC 9000 Section 19.17)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PathChallengeFrame {
    pub data: [u8; 8],
}

/// PATH_RESPONSE Frame (RFC 9000 Section 19.18)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PathResponseFrame {
    pub data: [u8; 8],
}

/// CONNECTION_CLOSE Frame, transport variant (RFC 9000 Section 19.19)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionCloseFrame {
    pub error_code: VarInt,

    /// Type of the frame that triggered the error (0 if unknown)
    pub frame_type: VarInt,

    pub reason: Bytes,
}

/// CONNECTION_CLOSE Frame, application variant (type 0x1d)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ApplicationCloseFrame {
    pub error_code: VarInt,
    pub reason: Bytes,
}

/// ACK_FREQUENCY Frame (draft-ietf-quic-ack-frequency)
///
/// Asks the peer to change how often it acknowledges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AckFrequencyFrame {
    pub sequence_number: VarInt,

    /// Ack-eliciting packets the peer may receive before sending an ACK
    pub packet_tolerance: VarInt,

    /// Requested max_ack_delay in microseconds
    pub update_max_ack_delay: VarInt,

    pub ignore_order: bool,
}

/// Frame of a type this endpoint does not understand.
///
/// Frame boundaries cannot be found without knowing the type, so the
/// payload is everything that followed the type in the packet.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UnknownFrame {
    pub frame_type: VarInt,
    pub payload: Bytes,
}

/// QUIC Frame
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Frame {
    /// Run of PADDING bytes; never empty on the wire
    Padding { length: usize },
    Ping,
    Ack(AckFrame),
    ResetStream(ResetStreamFrame),
    StopSending(StopSendingFrame),
    Crypto(CryptoFrame),
    NewToken(NewTokenFrame),
    Stream(StreamFrame),
    MaxData(MaxDataFrame),
    MaxStreamData(MaxStreamDataFrame),
    MaxStreams(MaxStreamsFrame),
    DataBlocked(DataBlockedFrame),
    StreamDataBlocked(StreamDataBlockedFrame),
    StreamsBlocked(StreamsBlockedFrame),
    NewConnectionId(NewConnectionIdFrame),
    RetireConnectionId(RetireConnectionIdFrame),
    PathChallenge(PathChallengeFrame),
    PathResponse(PathResponseFrame),
    ConnectionClose(ConnectionCloseFrame),
    ApplicationClose(ApplicationCloseFrame),
    HandshakeDone,
    AckFrequency(AckFrequencyFrame),
    Unknown(UnknownFrame),
}

impl Frame {
    /// Wire type of the frame (for STREAM, including flag bits)
    pub fn frame_type(&self) -> u64 {
        match self {
            Frame::Padding { .. } => FRAME_TYPE_PADDING,
            Frame::Ping => FRAME_TYPE_PING,
            Frame::Ack(ack) if ack.ecn_counts.is_some() => FRAME_TYPE_ACK_ECN,
            Frame::Ack(_) => FRAME_TYPE_ACK,
            Frame::ResetStream(_) => FRAME_TYPE_RESET_STREAM,
            Frame::StopSending(_) => FRAME_TYPE_STOP_SENDING,
            Frame::Crypto(_) => FRAME_TYPE_CRYPTO,
            Frame::NewToken(_) => FRAME_TYPE_NEW_TOKEN,
            Frame::Stream(s) => {
                let mut t = FRAME_TYPE_STREAM_BASE | STREAM_FRAME_BIT_LEN;
                if s.offset != 0 {
                    t |= STREAM_FRAME_BIT_OFF;
                }
                if s.fin {
                    t |= STREAM_FRAME_BIT_FIN;
                }
                t
            }
            Frame::MaxData(_) => FRAME_TYPE_MAX_DATA,
            Frame::MaxStreamData(_) => FRAME_TYPE_MAX_STREAM_DATA,
            Frame::MaxStreams(f) if f.bidirectional => FRAME_TYPE_MAX_STREAMS_BIDI,
            Frame::MaxStreams(_) => FRAME_TYPE_MAX_STREAMS_UNI,
            Frame::DataBlocked(_) => FRAME_TYPE_DATA_BLOCKED,
            Frame::StreamDataBlocked(_) => FRAME_TYPE_STREAM_DATA_BLOCKED,
            Frame::StreamsBlocked(f) if f.bidirectional => FRAME_TYPE_STREAMS_BLOCKED_BIDI,
            Frame::StreamsBlocked(_) => FRAME_TYPE_STREAMS_BLOCKED_UNI,
            Frame::NewConnectionId(_) => FRAME_TYPE_NEW_CONNECTION_ID,
            Frame::RetireConnectionId(_) => FRAME_TYPE_RETIRE_CONNECTION_ID,
            Frame::PathChallenge(_) => FRAME_TYPE_PATH_CHALLENGE,
            Frame::PathResponse(_) => FRAME_TYPE_PATH_RESPONSE,
            Frame::ConnectionClose(_) => FRAME_TYPE_CONNECTION_CLOSE_QUIC,
            Frame::ApplicationClose(_) => FRAME_TYPE_CONNECTION_CLOSE_APP,
            Frame::HandshakeDone => FRAME_TYPE_HANDSHAKE_DONE,
            Frame::AckFrequency(_) => FRAME_TYPE_ACK_FREQUENCY,
            Frame::Unknown(f) => f.frame_type,
        }
    }

    /// Short lowercase name used in logs and script expectations
    pub fn name(&self) -> &'static str {
        match self {
            Frame::Padding { .. } => "padding",
            Frame::Ping => "ping",
            Frame::Ack(_) => "ack",
            Frame::ResetStream(_) => "reset_stream",
            Frame::StopSending(_) => "stop_sending",
            Frame::Crypto(_) => "crypto",
            Frame::NewToken(_) => "new_token",
            Frame::Stream(_) => "stream",
            Frame::MaxData(_) => "max_data",
            Frame::MaxStreamData(_) => "max_stream_data",
            Frame::MaxStreams(_) => "max_streams",
            Frame::DataBlocked(_) => "data_blocked",
            Frame::StreamDataBlocked(_) => "stream_data_blocked",
            Frame::StreamsBlocked(_) => "streams_blocked",
            Frame::NewConnectionId(_) => "new_connection_id",
            Frame::RetireConnectionId(_) => "retire_connection_id",
            Frame::PathChallenge(_) => "path_challenge",
            Frame::PathResponse(_) => "path_response",
            Frame::ConnectionClose(_) => "connection_close",
            Frame::ApplicationClose(_) => "application_close",
            Frame::HandshakeDone => "handshake_done",
            Frame::AckFrequency(_) => "ack_frequency",
            Frame::Unknown(_) => "unknown",
        }
    }

    /// Check if frame is ACK-eliciting (RFC 9000 Section 13.2)
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(
            self,
            Frame::Padding { .. }
                | Frame::Ack(_)
                | Frame::ConnectionClose(_)
                | Frame::ApplicationClose(_)
        )
    }

    /// Whether the frame may appear in a packet of this level
    /// (RFC 9000 Section 12.4, Table 3).
    pub fn allowed_at(&self, level: EncryptionLevel) -> bool {
        match level {
            EncryptionLevel::Initial | EncryptionLevel::Handshake => matches!(
                self,
                Frame::Padding { .. }
                    | Frame::Ping
                    | Frame::Ack(_)
                    | Frame::Crypto(_)
                    | Frame::ConnectionClose(_)
            ),
            EncryptionLevel::ZeroRtt => !matches!(
                self,
                Frame::Ack(_)
                    | Frame::Crypto(_)
                    | Frame::NewToken(_)
                    | Frame::PathResponse(_)
                    | Frame::RetireConnectionId(_)
                    | Frame::HandshakeDone
            ),
            EncryptionLevel::OneRtt => true,
        }
    }
}
