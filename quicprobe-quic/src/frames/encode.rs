//! # Frame Encoding (RFC 9000 Section 19)
//!
//! Inverse of [`super::parse`]. STREAM frames always carry the LEN bit and
//! carry OFF only for non-zero offsets.

#![forbid(unsafe_code)]

use super::types::*;
use crate::buffer::{put_varint, VarIntCodec};
use crate::error::{Error, Result};
use bytes::{BufMut, BytesMut};

impl Frame {
    /// Append the wire form of this frame to `buf`.
    ///
    /// Fails only for integers above 2^62-1 or an ill-formed value
    /// (e.g. an empty NEW_CONNECTION_ID cid or zero-length PADDING).
    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        if matches!(self, Frame::Padding { length: 0 }) {
            return Err(Error::MalformedEncoding("PADDING frame of zero length"));
        }
        put_varint(buf, self.frame_type())?;

        match self {
            Frame::Padding { length } => {
                // type byte already written
                buf.put_bytes(0, length.saturating_sub(1));
            }
            Frame::Ping | Frame::HandshakeDone => {}
            Frame::Ack(ack) => {
                put_varint(buf, ack.largest_acked)?;
                put_varint(buf, ack.ack_delay)?;
                put_varint(buf, ack.ack_ranges.len() as u64)?;
                put_varint(buf, ack.first_ack_range)?;
                for range in &ack.ack_ranges {
                    put_varint(buf, range.gap)?;
                    put_varint(buf, range.length)?;
                }
                if let Some(ecn) = &ack.ecn_counts {
                    put_varint(buf, ecn.ect0_count)?;
                    put_varint(buf, ecn.ect1_count)?;
                    put_varint(buf, ecn.ce_count)?;
                }
            }
            Frame::ResetStream(f) => {
                put_varint(buf, f.stream_id.value())?;
                put_varint(buf, f.error_code)?;
                put_varint(buf, f.final_size)?;
            }
            Frame::StopSending(f) => {
                put_varint(buf, f.stream_id.value())?;
                put_varint(buf, f.error_code)?;
            }
            Frame::Crypto(f) => {
                put_varint(buf, f.offset)?;
                put_prefixed(buf, &f.data)?;
            }
            Frame::NewToken(f) => put_prefixed(buf, &f.token)?,
            Frame::Stream(f) => {
                put_varint(buf, f.stream_id.value())?;
                if f.offset != 0 {
                    put_varint(buf, f.offset)?;
                }
                put_prefixed(buf, &f.data)?;
            }
            Frame::MaxData(f) => put_varint(buf, f.maximum_data)?,
            Frame::MaxStreamData(f) => {
                put_varint(buf, f.stream_id.value())?;
                put_varint(buf, f.maximum_stream_data)?;
            }
            Frame::MaxStreams(f) => put_varint(buf, f.maximum_streams)?,
            Frame::DataBlocked(f) => put_varint(buf, f.limit)?,
            Frame::StreamDataBlocked(f) => {
                put_varint(buf, f.stream_id.value())?;
                put_varint(buf, f.limit)?;
            }
            Frame::StreamsBlocked(f) => put_varint(buf, f.limit)?,
            Frame::NewConnectionId(f) => {
                if f.connection_id.is_empty() {
                    return Err(Error::MalformedEncoding("NEW_CONNECTION_ID with empty cid"));
                }
                put_varint(buf, f.sequence_number)?;
                put_varint(buf, f.retire_prior_to)?;
                buf.put_u8(f.connection_id.len() as u8);
                buf.put_slice(f.connection_id.as_bytes());
                buf.put_slice(&f.stateless_reset_token);
            }
            Frame::RetireConnectionId(f) => put_varint(buf, f.sequence_number)?,
            Frame::PathChallenge(f) => buf.put_slice(&f.data),
            Frame::PathResponse(f) => buf.put_slice(&f.data),
            Frame::ConnectionClose(f) => {
                put_varint(buf, f.error_code)?;
                put_varint(buf, f.frame_type)?;
                put_prefixed(buf, &f.reason)?;
            }
            Frame::ApplicationClose(f) => {
                put_varint(buf, f.error_code)?;
                put_prefixed(buf, &f.reason)?;
            }
            Frame::AckFrequency(f) => {
                put_varint(buf, f.sequence_number)?;
                put_varint(buf, f.packet_tolerance)?;
                put_varint(buf, f.update_max_ack_delay)?;
                buf.put_u8(u8::from(f.ignore_order));
            }
            Frame::Unknown(f) => buf.put_slice(&f.payload),
        }
        Ok(())
    }

    /// Number of bytes [`Frame::encode`] writes.
    pub fn encoded_len(&self) -> usize {
        let v = VarIntCodec::size;
        let prefixed = |len: usize| v(len as u64) + len;

        let body = match self {
            Frame::Padding { length } => return *length,
            Frame::Ping | Frame::HandshakeDone => 0,
            Frame::Ack(ack) => {
                let mut n = v(ack.largest_acked)
                    + v(ack.ack_delay)
                    + v(ack.ack_ranges.len() as u64)
                    + v(ack.first_ack_range);
                for range in &ack.ack_ranges {
                    n += v(range.gap) + v(range.length);
                }
                if let Some(ecn) = &ack.ecn_counts {
                    n += v(ecn.ect0_count) + v(ecn.ect1_count) + v(ecn.ce_count);
                }
                n
            }
            Frame::ResetStream(f) => v(f.stream_id.value()) + v(f.error_code) + v(f.final_size),
            Frame::StopSending(f) => v(f.stream_id.value()) + v(f.error_code),
            Frame::Crypto(f) => v(f.offset) + prefixed(f.data.len()),
            Frame::NewToken(f) => prefixed(f.token.len()),
            Frame::Stream(f) => {
                let off = if f.offset != 0 { v(f.offset) } else { 0 };
                v(f.stream_id.value()) + off + prefixed(f.data.len())
            }
            Frame::MaxData(f) => v(f.maximum_data),
            Frame::MaxStreamData(f) => v(f.stream_id.value()) + v(f.maximum_stream_data),
            Frame::MaxStreams(f) => v(f.maximum_streams),
            Frame::DataBlocked(f) => v(f.limit),
            Frame::StreamDataBlocked(f) => v(f.stream_id.value()) + v(f.limit),
            Frame::StreamsBlocked(f) => v(f.limit),
            Frame::NewConnectionId(f) => {
                v(f.sequence_number) + v(f.retire_prior_to) + 1 + f.connection_id.len() + 16
            }
            Frame::RetireConnectionId(f) => v(f.sequence_number),
            Frame::PathChallenge(_) | Frame::PathResponse(_) => 8,
            Frame::ConnectionClose(f) => v(f.error_code) + v(f.frame_type) + prefixed(f.reason.len()),
            Frame::ApplicationClose(f) => v(f.error_code) + prefixed(f.reason.len()),
            Frame::AckFrequency(f) => {
                v(f.sequence_number) + v(f.packet_tolerance) + v(f.update_max_ack_delay) + 1
            }
            Frame::Unknown(f) => f.payload.len(),
        };
        v(self.frame_type()) + body
    }
}

/// Encode a frame list back to back.
pub fn encode_frames(frames: &[Frame], buf: &mut BytesMut) -> Result<()> {
    for frame in frames {
        frame.encode(buf)?;
    }
    Ok(())
}

fn put_prefixed(buf: &mut BytesMut, data: &[u8]) -> Result<()> {
    put_varint(buf, data.len() as u64)?;
    buf.put_slice(data);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::parse::{DefaultFrameParser, FrameParser};
    use crate::types::{ConnectionId, StreamId};
    use bytes::Bytes;

    fn roundtrip(frame: Frame) {
        let mut buf = BytesMut::new();
        frame.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), frame.encoded_len(), "encoded_len for {:?}", frame);
        let wire = buf.freeze();
        let (decoded, next) = DefaultFrameParser.parse_frame(&wire, 0).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(next, wire.len());
    }

    #[test]
    fn test_roundtrip_representative_frames() {
        roundtrip(Frame::Padding { length: 7 });
        roundtrip(Frame::Ping);
        roundtrip(Frame::Ack(AckFrame::from_ranges(&[40..=41, 30..=35], 12).unwrap()));
        roundtrip(Frame::ResetStream(ResetStreamFrame {
            stream_id: StreamId(3),
            error_code: 0x77,
            final_size: 1_000_000,
        }));
        roundtrip(Frame::Crypto(CryptoFrame {
            offset: 20_000,
            data: Bytes::from_static(b"client hello"),
        }));
        roundtrip(Frame::Stream(StreamFrame {
            stream_id: StreamId(8),
            offset: 0,
            fin: true,
            data: Bytes::from_static(b"payload"),
        }));
        roundtrip(Frame::NewConnectionId(NewConnectionIdFrame {
            sequence_number: 2,
            retire_prior_to: 1,
            connection_id: ConnectionId::from_u64(0xab),
            stateless_reset_token: [7; 16],
        }));
        roundtrip(Frame::ConnectionClose(ConnectionCloseFrame {
            error_code: 0x0a,
            frame_type: 0x08,
            reason: Bytes::from_static(b"bad stream"),
        }));
        roundtrip(Frame::ApplicationClose(ApplicationCloseFrame {
            error_code: 0,
            reason: Bytes::new(),
        }));
        roundtrip(Frame::AckFrequency(AckFrequencyFrame {
            sequence_number: 4,
            packet_tolerance: 10,
            update_max_ack_delay: 25_000,
            ignore_order: false,
        }));
        roundtrip(Frame::Unknown(UnknownFrame {
            frame_type: 0x4242,
            payload: Bytes::from_static(&[1, 2, 3]),
        }));
    }

    mod frame_law_tests {
        use super::*;
        use crate::types::VARINT_MAX;
        use proptest::collection::vec;
        use proptest::prelude::*;

        fn varint() -> impl Strategy<Value = u64> {
            0..=VARINT_MAX
        }

        fn bytes(max: usize) -> impl Strategy<Value = Bytes> {
            vec(any::<u8>(), 0..max).prop_map(Bytes::from)
        }

        fn stream_id() -> impl Strategy<Value = StreamId> {
            varint().prop_map(StreamId)
        }

        fn ack() -> impl Strategy<Value = AckFrame> {
            (
                1_000u64..1 << 40,
                varint(),
                0u64..10,
                vec((0u64..10, 0u64..10), 0..6),
                proptest::option::of((varint(), varint(), varint())),
            )
                .prop_map(|(largest_acked, ack_delay, first_ack_range, ranges, ecn)| AckFrame {
                    largest_acked,
                    ack_delay,
                    first_ack_range,
                    ack_ranges: ranges
                        .into_iter()
                        .map(|(gap, length)| AckRange { gap, length })
                        .collect(),
                    ecn_counts: ecn.map(|(ect0_count, ect1_count, ce_count)| EcnCounts {
                        ect0_count,
                        ect1_count,
                        ce_count,
                    }),
                })
        }

        fn control_frame() -> impl Strategy<Value = Frame> {
            prop_oneof![
                (1usize..64).prop_map(|length| Frame::Padding { length }),
                Just(Frame::Ping),
                Just(Frame::HandshakeDone),
                ack().prop_map(Frame::Ack),
                (stream_id(), varint(), varint()).prop_map(|(stream_id, error_code, final_size)| {
                    Frame::ResetStream(ResetStreamFrame {
                        stream_id,
                        error_code,
                        final_size,
                    })
                }),
                (stream_id(), varint()).prop_map(|(stream_id, error_code)| {
                    Frame::StopSending(StopSendingFrame {
                        stream_id,
                        error_code,
                    })
                }),
                bytes(32).prop_map(|token| Frame::NewToken(NewTokenFrame { token })),
                any::<[u8; 8]>().prop_map(|data| Frame::PathChallenge(PathChallengeFrame { data })),
                any::<[u8; 8]>().prop_map(|data| Frame::PathResponse(PathResponseFrame { data })),
            ]
        }

        fn data_frame() -> impl Strategy<Value = Frame> {
            prop_oneof![
                (0u64..1 << 40, bytes(64))
                    .prop_map(|(offset, data)| Frame::Crypto(CryptoFrame { offset, data })),
                (stream_id(), 0u64..1 << 40, any::<bool>(), bytes(64)).prop_map(
                    |(stream_id, offset, fin, data)| {
                        Frame::Stream(StreamFrame {
                            stream_id,
                            offset,
                            fin,
                            data,
                        })
                    }
                ),
                varint().prop_map(|maximum_data| Frame::MaxData(MaxDataFrame { maximum_data })),
                (stream_id(), varint()).prop_map(|(stream_id, maximum_stream_data)| {
                    Frame::MaxStreamData(MaxStreamDataFrame {
                        stream_id,
                        maximum_stream_data,
                    })
                }),
                (any::<bool>(), 0..=MAX_STREAMS_LIMIT).prop_map(|(bidirectional, maximum_streams)| {
                    Frame::MaxStreams(MaxStreamsFrame {
                        bidirectional,
                        maximum_streams,
                    })
                }),
                varint().prop_map(|limit| Frame::DataBlocked(DataBlockedFrame { limit })),
                (stream_id(), varint()).prop_map(|(stream_id, limit)| {
                    Frame::StreamDataBlocked(StreamDataBlockedFrame { stream_id, limit })
                }),
                (any::<bool>(), 0..=MAX_STREAMS_LIMIT).prop_map(|(bidirectional, limit)| {
                    Frame::StreamsBlocked(StreamsBlockedFrame {
                        bidirectional,
                        limit,
                    })
                }),
            ]
        }

        fn connection_frame() -> impl Strategy<Value = Frame> {
            prop_oneof![
                (varint(), varint(), vec(any::<u8>(), 1..=20), any::<[u8; 16]>()).prop_map(
                    |(sequence_number, retire_prior_to, cid, stateless_reset_token)| {
                        Frame::NewConnectionId(NewConnectionIdFrame {
                            sequence_number,
                            retire_prior_to,
                            connection_id: ConnectionId::from_slice(&cid).unwrap(),
                            stateless_reset_token,
                        })
                    }
                ),
                varint().prop_map(|sequence_number| {
                    Frame::RetireConnectionId(RetireConnectionIdFrame { sequence_number })
                }),
                (varint(), varint(), bytes(32)).prop_map(|(error_code, frame_type, reason)| {
                    Frame::ConnectionClose(ConnectionCloseFrame {
                        error_code,
                        frame_type,
                        reason,
                    })
                }),
                (varint(), bytes(32)).prop_map(|(error_code, reason)| {
                    Frame::ApplicationClose(ApplicationCloseFrame { error_code, reason })
                }),
                (varint(), varint(), varint(), any::<bool>()).prop_map(
                    |(sequence_number, packet_tolerance, update_max_ack_delay, ignore_order)| {
                        Frame::AckFrequency(AckFrequencyFrame {
                            sequence_number,
                            packet_tolerance,
                            update_max_ack_delay,
                            ignore_order,
                        })
                    }
                ),
                (prop_oneof![0x1fu64..0xaf, 0xb0..=VARINT_MAX], bytes(32)).prop_map(
                    |(frame_type, payload)| Frame::Unknown(UnknownFrame { frame_type, payload })
                ),
            ]
        }

        #[test]
        fn test_every_variant_roundtrips() {
            proptest!(|(frame in prop_oneof![control_frame(), data_frame(), connection_frame()])| {
                roundtrip(frame);
            });
        }

        #[test]
        fn test_ack_with_ecn_uses_ecn_type() {
            let mut ack = AckFrame::from_ranges(&[10..=12], 3).unwrap();
            ack.ecn_counts = Some(EcnCounts {
                ect0_count: 5,
                ect1_count: 0,
                ce_count: 1,
            });
            let frame = Frame::Ack(ack);
            let mut buf = BytesMut::new();
            frame.encode(&mut buf).unwrap();
            assert_eq!(buf[0], 0x03);
            roundtrip(frame);
        }

        #[test]
        fn test_empty_stream_frame_at_offset() {
            roundtrip(Frame::Stream(StreamFrame {
                stream_id: StreamId(4),
                offset: 900,
                fin: true,
                data: Bytes::new(),
            }));
        }
    }

    #[test]
    fn test_zero_length_padding_is_rejected() {
        let mut buf = BytesMut::new();
        let err = Frame::Padding { length: 0 }.encode(&mut buf).unwrap_err();
        assert!(matches!(err, Error::MalformedEncoding(_)));
        assert!(buf.is_empty());
        assert_eq!(Frame::Padding { length: 0 }.encoded_len(), 0);
    }

    #[test]
    fn test_stream_zero_offset_omits_off_bit() {
        let frame = Frame::Stream(StreamFrame {
            stream_id: StreamId(0),
            offset: 0,
            fin: false,
            data: Bytes::from_static(b"a"),
        });
        let mut buf = BytesMut::new();
        frame.encode(&mut buf).unwrap();
        assert_eq!(&buf[..], &[0x0a, 0x00, 0x01, b'a']);
    }

    #[test]
    fn test_encode_rejects_oversized_varint() {
        let frame = Frame::MaxData(MaxDataFrame {
            maximum_data: u64::MAX,
        });
        assert!(frame.encode(&mut BytesMut::new()).is_err());
    }

    #[test]
    fn test_encode_frames_back_to_back() {
        let mut buf = BytesMut::new();
        encode_frames(&[Frame::Ping, Frame::HandshakeDone], &mut buf).unwrap();
        assert_eq!(&buf[..], &[0x01, 0x1e]);
    }
}
