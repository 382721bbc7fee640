//! Frames as written in scripts.

use bytes::Bytes;
use quicprobe_quic::frames::{
    AckFrame, AckFrequencyFrame, ApplicationCloseFrame, ConnectionCloseFrame, CryptoFrame,
    DataBlockedFrame, MaxDataFrame, MaxStreamDataFrame, MaxStreamsFrame, NewConnectionIdFrame,
    NewTokenFrame, PathChallengeFrame, PathResponseFrame, ResetStreamFrame,
    RetireConnectionIdFrame, StopSendingFrame, StreamDataBlockedFrame, StreamFrame,
    StreamsBlockedFrame, UnknownFrame,
};
use quicprobe_quic::peer::cid_from_hex;
use quicprobe_quic::{EncryptionLevel, Frame, RawClient, StreamId};
use serde::Deserialize;

fn one() -> usize {
    1
}

/// A frame in a `send` step, tagged by `type`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FrameSpec {
    Padding {
        #[serde(default = "one")]
        length: usize,
    },
    Ping,
    /// Inclusive `[low, high]` packet number ranges
    Ack {
        ranges: Vec<[u64; 2]>,
        #[serde(default)]
        delay: u64,
    },
    ResetStream {
        stream_id: u64,
        error_code: u64,
        final_size: u64,
    },
    StopSending {
        stream_id: u64,
        error_code: u64,
    },
    /// Without an offset the data follows what the peer sent before
    Crypto {
        #[serde(default)]
        offset: Option<u64>,
        data: String,
    },
    NewToken {
        token: String,
    },
    Stream {
        stream_id: u64,
        #[serde(default)]
        offset: u64,
        data: String,
        #[serde(default)]
        fin: bool,
    },
    MaxData {
        maximum: u64,
    },
    MaxStreamData {
        stream_id: u64,
        maximum: u64,
    },
    MaxStreams {
        bidirectional: bool,
        maximum: u64,
    },
    DataBlocked {
        limit: u64,
    },
    StreamDataBlocked {
        stream_id: u64,
        limit: u64,
    },
    StreamsBlocked {
        bidirectional: bool,
        limit: u64,
    },
    NewConnectionId {
        sequence_number: u64,
        #[serde(default)]
        retire_prior_to: u64,
        connection_id: String,
        #[serde(default)]
        reset_token: Option<String>,
    },
    RetireConnectionId {
        sequence_number: u64,
    },
    PathChallenge {
        data: String,
    },
    PathResponse {
        data: String,
    },
    ConnectionClose {
        error_code: u64,
        #[serde(default)]
        frame_type: u64,
        #[serde(default)]
        reason: String,
    },
    ApplicationClose {
        error_code: u64,
        #[serde(default)]
        reason: String,
    },
    HandshakeDone,
    AckFrequency {
        sequence_number: u64,
        packet_tolerance: u64,
        update_max_ack_delay: u64,
        #[serde(default)]
        ignore_order: bool,
    },
    Unknown {
        frame_type: u64,
        #[serde(default)]
        payload: String,
    },
}

/// Decode a hex string, with or without a `0x` prefix.
pub fn decode_hex(hex: &str) -> Result<Bytes, String> {
    let hex = hex.trim_start_matches("0x");
    if hex.len() % 2 != 0 {
        return Err(format!("odd-length hex string {hex:?}"));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16))
        .collect::<Result<Vec<u8>, _>>()
        .map(Bytes::from)
        .map_err(|_| format!("invalid hex string {hex:?}"))
}

fn fixed_hex<const N: usize>(hex: &str) -> Result<[u8; N], String> {
    let bytes = decode_hex(hex)?;
    <[u8; N]>::try_from(&bytes[..]).map_err(|_| format!("expected {N} bytes, got {}", bytes.len()))
}

impl FrameSpec {
    /// Build the frame. CRYPTO frames without an offset take the next
    /// offset of `level` from the peer.
    pub fn into_frame(self, peer: &mut RawClient, level: EncryptionLevel) -> Result<Frame, String> {
        let frame = match self {
            FrameSpec::Padding { length } => Frame::Padding { length },
            FrameSpec::Ping => Frame::Ping,
            FrameSpec::Ack { mut ranges, delay } => {
                if ranges.iter().any(|[lo, hi]| lo > hi) {
                    return Err("ACK range with low above high".to_string());
                }
                ranges.sort_by(|a, b| b[0].cmp(&a[0]));
                let ranges: Vec<_> = ranges.iter().map(|[lo, hi]| *lo..=*hi).collect();
                Frame::Ack(AckFrame::from_ranges(&ranges, delay).ok_or("ACK without ranges")?)
            }
            FrameSpec::ResetStream {
                stream_id,
                error_code,
                final_size,
            } => Frame::ResetStream(ResetStreamFrame {
                stream_id: StreamId(stream_id),
                error_code,
                final_size,
            }),
            FrameSpec::StopSending {
                stream_id,
                error_code,
            } => Frame::StopSending(StopSendingFrame {
                stream_id: StreamId(stream_id),
                error_code,
            }),
            FrameSpec::Crypto { offset, data } => {
                let data = decode_hex(&data)?;
                match offset {
                    Some(offset) => Frame::Crypto(CryptoFrame { offset, data }),
                    None => peer.crypto_frame(level, data),
                }
            }
            FrameSpec::NewToken { token } => Frame::NewToken(NewTokenFrame {
                token: decode_hex(&token)?,
            }),
            FrameSpec::Stream {
                stream_id,
                offset,
                data,
                fin,
            } => Frame::Stream(StreamFrame {
                stream_id: StreamId(stream_id),
                offset,
                fin,
                data: Bytes::from(data),
            }),
            FrameSpec::MaxData { maximum } => Frame::MaxData(MaxDataFrame {
                maximum_data: maximum,
            }),
            FrameSpec::MaxStreamData { stream_id, maximum } => {
                Frame::MaxStreamData(MaxStreamDataFrame {
                    stream_id: StreamId(stream_id),
                    maximum_stream_data: maximum,
                })
            }
            FrameSpec::MaxStreams {
                bidirectional,
                maximum,
            } => Frame::MaxStreams(MaxStreamsFrame {
                bidirectional,
                maximum_streams: maximum,
            }),
            FrameSpec::DataBlocked { limit } => Frame::DataBlocked(DataBlockedFrame { limit }),
            FrameSpec::StreamDataBlocked { stream_id, limit } => {
                Frame::StreamDataBlocked(StreamDataBlockedFrame {
                    stream_id: StreamId(stream_id),
                    limit,
                })
            }
            FrameSpec::StreamsBlocked {
                bidirectional,
                limit,
            } => Frame::StreamsBlocked(StreamsBlockedFrame {
                bidirectional,
                limit,
            }),
            FrameSpec::NewConnectionId {
                sequence_number,
                retire_prior_to,
                connection_id,
                reset_token,
            } => Frame::NewConnectionId(NewConnectionIdFrame {
                sequence_number,
                retire_prior_to,
                connection_id: cid_from_hex(&connection_id).map_err(|e| e.to_string())?,
                stateless_reset_token: match reset_token {
                    Some(token) => fixed_hex::<16>(&token)?,
                    None => [sequence_number as u8; 16],
                },
            }),
            FrameSpec::RetireConnectionId { sequence_number } => {
                Frame::RetireConnectionId(RetireConnectionIdFrame { sequence_number })
            }
            FrameSpec::PathChallenge { data } => Frame::PathChallenge(PathChallengeFrame {
                data: fixed_hex::<8>(&data)?,
            }),
            FrameSpec::PathResponse { data } => Frame::PathResponse(PathResponseFrame {
                data: fixed_hex::<8>(&data)?,
            }),
            FrameSpec::ConnectionClose {
                error_code,
                frame_type,
                reason,
            } => Frame::ConnectionClose(ConnectionCloseFrame {
                error_code,
                frame_type,
                reason: Bytes::from(reason),
            }),
            FrameSpec::ApplicationClose { error_code, reason } => {
                Frame::ApplicationClose(ApplicationCloseFrame {
                    error_code,
                    reason: Bytes::from(reason),
                })
            }
            FrameSpec::HandshakeDone => Frame::HandshakeDone,
            FrameSpec::AckFrequency {
                sequence_number,
                packet_tolerance,
                update_max_ack_delay,
                ignore_order,
            } => Frame::AckFrequency(AckFrequencyFrame {
                sequence_number,
                packet_tolerance,
                update_max_ack_delay,
                ignore_order,
            }),
            FrameSpec::Unknown {
                frame_type,
                payload,
            } => Frame::Unknown(UnknownFrame {
                frame_type,
                payload: decode_hex(&payload)?,
            }),
        };
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quicprobe_quic::ConnectionId;

    fn peer() -> RawClient {
        RawClient::new(ConnectionId::from_u64(1), ConnectionId::from_u64(2)).unwrap()
    }

    #[test]
    fn test_decode_hex() {
        assert_eq!(&decode_hex("0x0a0B").unwrap()[..], &[0x0a, 0x0b]);
        assert!(decode_hex("").unwrap().is_empty());
        assert!(decode_hex("abc").is_err());
        assert!(decode_hex("gg").is_err());
    }

    #[test]
    fn test_ack_ranges_sorted_highest_first() {
        let spec = FrameSpec::Ack {
            ranges: vec![[0, 1], [5, 7]],
            delay: 0,
        };
        match spec.into_frame(&mut peer(), EncryptionLevel::OneRtt).unwrap() {
            Frame::Ack(ack) => {
                assert_eq!(ack.largest_acked, 7);
                assert_eq!(ack.first_ack_range, 2);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_crypto_without_offset_continues_stream() {
        let mut peer = peer();
        let first = FrameSpec::Crypto {
            offset: None,
            data: "010203".to_string(),
        };
        let second = FrameSpec::Crypto {
            offset: None,
            data: "04".to_string(),
        };
        first.into_frame(&mut peer, EncryptionLevel::Handshake).unwrap();
        match second.into_frame(&mut peer, EncryptionLevel::Handshake).unwrap() {
            Frame::Crypto(c) => assert_eq!(c.offset, 3),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_path_challenge_needs_eight_bytes() {
        let spec = FrameSpec::PathChallenge {
            data: "0102".to_string(),
        };
        let err = spec.into_frame(&mut peer(), EncryptionLevel::OneRtt).unwrap_err();
        assert!(err.contains("expected 8 bytes"));
    }
}
