//! # Frame Parsing (RFC 9000 Section 12.4)
//!
//! Frame decoding with an iterator-based API. Payload fields are
//! [`Bytes`] slices that share the packet buffer.

#![forbid(unsafe_code)]

use super::types::*;
use crate::buffer::Reader;
use crate::error::{Error, Result};
use crate::types::{ConnectionId, StreamId, MAX_CID_LENGTH};
use bytes::Bytes;

/// Frame Parser Trait
///
/// Parses frames from a packet payload.
pub trait FrameParser {
    /// Parse a single frame starting at `offset`.
    ///
    /// Returns the frame and the offset just past it.
    fn parse_frame(&self, buf: &Bytes, offset: usize) -> Result<(Frame, usize)>;

    /// Create an iterator over frames in a payload
    fn iter_frames<'a>(&'a self, payload: &'a Bytes) -> FrameIterator<'a, Self>
    where
        Self: Sized,
    {
        FrameIterator {
            parser: self,
            buf: payload,
            offset: 0,
        }
    }
}

/// Frame Iterator
///
/// Yields frames until the payload is exhausted or a frame fails to decode.
pub struct FrameIterator<'a, P: FrameParser + ?Sized> {
    parser: &'a P,
    buf: &'a Bytes,
    offset: usize,
}

impl<'a, P: FrameParser + ?Sized> Iterator for FrameIterator<'a, P> {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.buf.len() {
            return None;
        }

        match self.parser.parse_frame(self.buf, self.offset) {
            Ok((frame, next)) => {
                self.offset = next;
                Some(Ok(frame))
            }
            Err(e) => {
                // On error, stop iteration
                self.offset = self.buf.len();
                Some(Err(e))
            }
        }
    }
}

/// Decode every frame in a packet payload.
pub fn parse_frames(payload: &Bytes) -> Result<Vec<Frame>> {
    DefaultFrameParser.iter_frames(payload).collect()
}

/// Default frame parser implementation
pub struct DefaultFrameParser;

impl FrameParser for DefaultFrameParser {
    fn parse_frame(&self, buf: &Bytes, offset: usize) -> Result<(Frame, usize)> {
        let mut r = Reader::new(buf, offset);
        let frame_type = r.read_varint()?;

        let frame = match frame_type {
            // PADDING frame special case - consecutive zero bytes form one value
            FRAME_TYPE_PADDING => {
                let mut length = 1;
                while r.peek_u8() == Some(0x00) {
                    r.read_u8()?;
                    length += 1;
                }
                Frame::Padding { length }
            }

            FRAME_TYPE_PING => Frame::Ping,

            FRAME_TYPE_ACK | FRAME_TYPE_ACK_ECN => {
                Frame::Ack(parse_ack(&mut r, frame_type == FRAME_TYPE_ACK_ECN)?)
            }

            FRAME_TYPE_RESET_STREAM => Frame::ResetStream(ResetStreamFrame {
                stream_id: StreamId(r.read_varint()?),
                error_code: r.read_varint()?,
                final_size: r.read_varint()?,
            }),

            FRAME_TYPE_STOP_SENDING => Frame::StopSending(StopSendingFrame {
                stream_id: StreamId(r.read_varint()?),
                error_code: r.read_varint()?,
            }),

            FRAME_TYPE_CRYPTO => Frame::Crypto(CryptoFrame {
                offset: r.read_varint()?,
                data: r.read_varint_prefixed()?,
            }),

            FRAME_TYPE_NEW_TOKEN => Frame::NewToken(NewTokenFrame {
                token: r.read_varint_prefixed()?,
            }),

            // STREAM frames: 0x08-0x0f
            t if (FRAME_TYPE_STREAM_BASE..=FRAME_TYPE_STREAM_BASE | 0x07).contains(&t) => {
                Frame::Stream(parse_stream(&mut r, t)?)
            }

            FRAME_TYPE_MAX_DATA => Frame::MaxData(MaxDataFrame {
                maximum_data: r.read_varint()?,
            }),

            FRAME_TYPE_MAX_STREAM_DATA => Frame::MaxStreamData(MaxStreamDataFrame {
                stream_id: StreamId(r.read_varint()?),
                maximum_stream_data: r.read_varint()?,
            }),

            FRAME_TYPE_MAX_STREAMS_BIDI | FRAME_TYPE_MAX_STREAMS_UNI => {
                Frame::MaxStreams(MaxStreamsFrame {
                    bidirectional: frame_type == FRAME_TYPE_MAX_STREAMS_BIDI,
                    maximum_streams: read_stream_count(&mut r)?,
                })
            }

            FRAME_TYPE_DATA_BLOCKED => Frame::DataBlocked(DataBlockedFrame {
                limit: r.read_varint()?,
            }),

            FRAME_TYPE_STREAM_DATA_BLOCKED => Frame::StreamDataBlocked(StreamDataBlockedFrame {
                stream_id: StreamId(r.read_varint()?),
                limit: r.read_varint()?,
            }),

            FRAME_TYPE_STREAMS_BLOCKED_BIDI | FRAME_TYPE_STREAMS_BLOCKED_UNI => {
                Frame::StreamsBlocked(StreamsBlockedFrame {
                    bidirectional: frame_type == FRAME_TYPE_STREAMS_BLOCKED_BIDI,
                    limit: read_stream_count(&mut r)?,
                })
            }

            FRAME_TYPE_NEW_CONNECTION_ID => Frame::NewConnectionId(parse_new_cid(&mut r)?),

            FRAME_TYPE_RETIRE_CONNECTION_ID => {
                Frame::RetireConnectionId(RetireConnectionIdFrame {
                    sequence_number: r.read_varint()?,
                })
            }

            FRAME_TYPE_PATH_CHALLENGE => Frame::PathChallenge(PathChallengeFrame {
                data: r.read_array()?,
            }),

            FRAME_TYPE_PATH_RESPONSE => Frame::PathResponse(PathResponseFrame {
                data: r.read_array()?,
            }),

            FRAME_TYPE_CONNECTION_CLOSE_QUIC => Frame::ConnectionClose(ConnectionCloseFrame {
                error_code: r.read_varint()?,
                frame_type: r.read_varint()?,
                reason: r.read_varint_prefixed()?,
            }),

            FRAME_TYPE_CONNECTION_CLOSE_APP => Frame::ApplicationClose(ApplicationCloseFrame {
                error_code: r.read_varint()?,
                reason: r.read_varint_prefixed()?,
            }),

            FRAME_TYPE_HANDSHAKE_DONE => Frame::HandshakeDone,

            FRAME_TYPE_ACK_FREQUENCY => Frame::AckFrequency(AckFrequencyFrame {
                sequence_number: r.read_varint()?,
                packet_tolerance: r.read_varint()?,
                update_max_ack_delay: r.read_varint()?,
                ignore_order: match r.read_u8()? {
                    0 => false,
                    1 => true,
                    _ => return Err(Error::MalformedEncoding("ACK_FREQUENCY ignore_order")),
                },
            }),

            // Boundaries of an unknown frame cannot be found
            _ => Frame::Unknown(UnknownFrame {
                frame_type,
                payload: r.read_rest(),
            }),
        };

        Ok((frame, r.position()))
    }
}

/// Parse ACK frame (RFC 9000 Section 19.3)
fn parse_ack(r: &mut Reader<'_>, has_ecn: bool) -> Result<AckFrame> {
    let largest_acked = r.read_varint()?;
    let ack_delay = r.read_varint()?;
    let ack_range_count = r.read_varint()?;
    let first_ack_range = r.read_varint()?;

    // Each range takes at least two bytes, which bounds the count before
    // anything is allocated.
    if ack_range_count > (r.remaining() / 2) as u64 {
        return Err(Error::MalformedEncoding("ACK range count exceeds payload"));
    }

    let mut ack_ranges = tinyvec::TinyVec::new();
    for _ in 0..ack_range_count {
        ack_ranges.push(AckRange {
            gap: r.read_varint()?,
            length: r.read_varint()?,
        });
    }

    let ecn_counts = if has_ecn {
        Some(EcnCounts {
            ect0_count: r.read_varint()?,
            ect1_count: r.read_varint()?,
            ce_count: r.read_varint()?,
        })
    } else {
        None
    };

    Ok(AckFrame {
        largest_acked,
        ack_delay,
        first_ack_range,
        ack_ranges,
        ecn_counts,
    })
}

/// Parse STREAM frame (RFC 9000 Section 19.8)
fn parse_stream(r: &mut Reader<'_>, frame_type: u64) -> Result<StreamFrame> {
    let stream_id = StreamId(r.read_varint()?);
    let offset = if frame_type & STREAM_FRAME_BIT_OFF != 0 {
        r.read_varint()?
    } else {
        0
    };
    let data = if frame_type & STREAM_FRAME_BIT_LEN != 0 {
        r.read_varint_prefixed()?
    } else {
        // No length field - data runs to the end of the packet
        r.read_rest()
    };

    Ok(StreamFrame {
        stream_id,
        offset,
        fin: frame_type & STREAM_FRAME_BIT_FIN != 0,
        data,
    })
}

/// Parse NEW_CONNECTION_ID frame (RFC 9000 Section 19.15)
fn parse_new_cid(r: &mut Reader<'_>) -> Result<NewConnectionIdFrame> {
    let sequence_number = r.read_varint()?;
    let retire_prior_to = r.read_varint()?;

    let len = r.read_u8()? as usize;
    if len == 0 || len > MAX_CID_LENGTH {
        return Err(Error::MalformedEncoding("NEW_CONNECTION_ID length outside 1..=20"));
    }
    let connection_id = ConnectionId::new(r.read_bytes(len)?)
        .ok_or(Error::MalformedEncoding("NEW_CONNECTION_ID length outside 1..=20"))?;

    Ok(NewConnectionIdFrame {
        sequence_number,
        retire_prior_to,
        connection_id,
        stateless_reset_token: r.read_array()?,
    })
}

/// MAX_STREAMS and STREAMS_BLOCKED counts are capped at 2^60.
fn read_stream_count(r: &mut Reader<'_>) -> Result<u64> {
    let count = r.read_varint()?;
    if count > MAX_STREAMS_LIMIT {
        return Err(Error::frame_encoding("stream count exceeds 2^60"));
    }
    Ok(count)
}
