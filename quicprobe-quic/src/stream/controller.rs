//! # Stream State Machines (RFC 9000 Section 3)
//!
//! Each stream has independent send and receive halves:
//! - **Send States**: Ready → Send → DataSent → DataRecvd, or ResetSent →
//!   ResetRecvd from any of the first three
//! - **Receive States**: Recv → SizeKnown → DataRecvd → DataRead, or
//!   ResetRecvd → ResetRead from Recv or SizeKnown
//!
//! Unidirectional streams only have the half that applies to us.

#![forbid(unsafe_code)]

use super::buffer::{RangeSet, ReassemblyBuffer};
use crate::error::{Error, Result};
use crate::flow_control::{RecvWindow, SendCredit};
use crate::frames::{ResetStreamFrame, StreamFrame};
use crate::types::{StreamId, VARINT_MAX};
use bytes::Bytes;

/// Stream Send State (RFC 9000 Section 3.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SendStreamState {
    /// Ready - Stream created but no data sent
    Ready,

    /// Send - Sending data
    Send,

    /// Data Sent - FIN sent, waiting for acknowledgment
    DataSent,

    /// Data Recvd - All data acknowledged
    DataRecvd,

    /// Reset Sent - RESET_STREAM sent
    ResetSent,

    /// Reset Recvd - RESET_STREAM acknowledged
    ResetRecvd,
}

impl SendStreamState {
    /// No further STREAM frames may be queued in this state
    pub fn is_closed_for_writes(self) -> bool {
        !matches!(self, SendStreamState::Ready | SendStreamState::Send)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SendStreamState::DataRecvd | SendStreamState::ResetRecvd)
    }
}

/// Stream Receive State (RFC 9000 Section 3.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecvStreamState {
    /// Recv - Receiving data
    Recv,

    /// Size Known - Final size known (FIN received)
    SizeKnown,

    /// Data Recvd - All data received
    DataRecvd,

    /// Data Read - All data delivered to application
    DataRead,

    /// Reset Recvd - RESET_STREAM received
    ResetRecvd,

    /// Reset Read - Application saw the reset
    ResetRead,
}

impl RecvStreamState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RecvStreamState::DataRead | RecvStreamState::ResetRead)
    }
}

/// Sending half of a stream.
#[derive(Debug, Clone)]
pub struct SendStream {
    id: StreamId,
    state: SendStreamState,

    /// Offset of the next byte the application writes
    offset: u64,

    credit: SendCredit,
    final_size: Option<u64>,

    /// Ranges the peer has acknowledged
    acked: RangeSet,
    fin_acked: bool,

    reset_code: Option<u64>,
}

impl SendStream {
    pub fn new(id: StreamId, peer_max_stream_data: u64) -> Self {
        Self {
            id,
            state: SendStreamState::Ready,
            offset: 0,
            credit: SendCredit::new(peer_max_stream_data),
            final_size: None,
            acked: RangeSet::new(),
            fin_acked: false,
            reset_code: None,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn state(&self) -> SendStreamState {
        self.state
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn final_size(&self) -> Option<u64> {
        self.final_size
    }

    pub fn credit(&self) -> &SendCredit {
        &self.credit
    }

    pub fn credit_mut(&mut self) -> &mut SendCredit {
        &mut self.credit
    }

    /// Check that `len` more bytes may be written now.
    pub fn check_write(&self, len: u64) -> Result<()> {
        if self.state.is_closed_for_writes() {
            return Err(Error::InvalidStreamOperation {
                stream_id: self.id,
                reason: "stream no longer accepts data",
            });
        }
        if len > self.credit.available() {
            return Err(Error::Blocked { stream_id: self.id });
        }
        Ok(())
    }

    /// Commit a write and return the offset its data starts at.
    pub fn write(&mut self, len: u64, fin: bool) -> Result<u64> {
        self.check_write(len)?;
        self.credit
            .consume(len)
            .map_err(|_| Error::Blocked { stream_id: self.id })?;
        let start = self.offset;
        self.offset += len;
        self.state = SendStreamState::Send;
        if fin {
            self.final_size = Some(self.offset);
            self.state = SendStreamState::DataSent;
        }
        Ok(start)
    }

    /// Record acknowledgment of a STREAM frame. True once every byte and
    /// the FIN are acknowledged.
    pub fn on_acked(&mut self, offset: u64, len: u64, fin: bool) -> bool {
        if !matches!(self.state, SendStreamState::Send | SendStreamState::DataSent) {
            return false;
        }
        self.acked.insert(offset..offset + len);
        self.fin_acked |= fin;
        if self.state != SendStreamState::DataSent {
            return false;
        }
        let Some(final_size) = self.final_size else {
            return false;
        };
        if self.fin_acked && (final_size == 0 || self.acked.contiguous_end(0) >= final_size) {
            self.state = SendStreamState::DataRecvd;
            return true;
        }
        false
    }

    /// Abandon the stream. Returns the final size for RESET_STREAM.
    pub fn reset(&mut self, error_code: u64) -> Result<u64> {
        match self.state {
            SendStreamState::Ready | SendStreamState::Send | SendStreamState::DataSent => {
                self.state = SendStreamState::ResetSent;
                self.reset_code = Some(error_code);
                self.final_size = Some(self.offset);
                Ok(self.offset)
            }
            _ => Err(Error::InvalidStreamOperation {
                stream_id: self.id,
                reason: "stream already finished or reset",
            }),
        }
    }

    pub fn on_reset_acked(&mut self) -> bool {
        if self.state == SendStreamState::ResetSent {
            self.state = SendStreamState::ResetRecvd;
            true
        } else {
            false
        }
    }

    pub fn reset_code(&self) -> Option<u64> {
        self.reset_code
    }
}

/// Receiving half of a stream.
#[derive(Debug, Clone)]
pub struct RecvStream {
    id: StreamId,
    state: RecvStreamState,
    buffer: ReassemblyBuffer,
    final_size: Option<u64>,
    window: RecvWindow,
    reset_code: Option<u64>,
}

impl RecvStream {
    pub fn new(id: StreamId, local_max_stream_data: u64) -> Self {
        Self {
            id,
            state: RecvStreamState::Recv,
            buffer: ReassemblyBuffer::new(),
            final_size: None,
            window: RecvWindow::new(local_max_stream_data),
            reset_code: None,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn state(&self) -> RecvStreamState {
        self.state
    }

    pub fn final_size(&self) -> Option<u64> {
        self.final_size
    }

    pub fn max_stream_data(&self) -> u64 {
        self.window.max_data()
    }

    pub fn reset_code(&self) -> Option<u64> {
        self.reset_code
    }

    fn check_final_size(&self, end: u64, fin: bool) -> Result<()> {
        match self.final_size {
            Some(size) if end > size => Err(Error::final_size("data beyond final size")),
            Some(size) if fin && end != size => Err(Error::final_size("final size changed")),
            None if fin && end < self.buffer.max_received() => {
                Err(Error::final_size("final size below received data"))
            }
            _ => Ok(()),
        }
    }

    /// Apply a STREAM frame. Returns how far the highest received offset
    /// moved, for connection-level accounting.
    pub fn on_stream_frame(&mut self, frame: &StreamFrame) -> Result<u64> {
        let end = frame.end();
        if end > VARINT_MAX {
            return Err(Error::frame_encoding("STREAM frame beyond 2^62-1"));
        }
        self.check_final_size(end, frame.fin)?;

        let before = self.window.received();
        self.window.on_received(end)?;
        let increase = self.window.received() - before;

        if !matches!(self.state, RecvStreamState::Recv | RecvStreamState::SizeKnown) {
            return Ok(increase);
        }
        self.buffer.insert(frame.offset, frame.data.clone());
        if frame.fin {
            self.final_size = Some(end);
            self.state = RecvStreamState::SizeKnown;
        }
        if let Some(size) = self.final_size {
            if self.buffer.is_complete(size) {
                self.state = RecvStreamState::DataRecvd;
            }
        }
        Ok(increase)
    }

    /// Apply RESET_STREAM. Returns the increase of the highest offset.
    pub fn on_reset(&mut self, frame: &ResetStreamFrame) -> Result<u64> {
        if self.final_size.map_or(false, |size| size != frame.final_size) {
            return Err(Error::final_size("RESET_STREAM changes final size"));
        }
        if frame.final_size < self.buffer.max_received() {
            return Err(Error::final_size("RESET_STREAM final size below received data"));
        }
        let before = self.window.received();
        self.window.on_received(frame.final_size)?;
        let increase = self.window.received() - before;

        if matches!(self.state, RecvStreamState::Recv | RecvStreamState::SizeKnown) {
            self.state = RecvStreamState::ResetRecvd;
            self.final_size = Some(frame.final_size);
            self.reset_code = Some(frame.error_code);
            self.buffer.reset();
        }
        Ok(increase)
    }

    /// Deliver in-order data. The flag is set once the final byte is read.
    ///
    /// Reading a reset stream reports the reset once and moves to ResetRead.
    pub fn read(&mut self) -> Result<(Bytes, bool)> {
        match self.state {
            RecvStreamState::ResetRecvd => {
                self.state = RecvStreamState::ResetRead;
                return Err(Error::InvalidStreamOperation {
                    stream_id: self.id,
                    reason: "stream reset by peer",
                });
            }
            RecvStreamState::ResetRead => {
                return Err(Error::InvalidStreamOperation {
                    stream_id: self.id,
                    reason: "stream reset by peer",
                })
            }
            RecvStreamState::DataRead => return Ok((Bytes::new(), true)),
            _ => {}
        }
        let data = self.buffer.read_all();
        self.window.on_consumed(data.len() as u64);
        let done = self.state == RecvStreamState::DataRecvd
            && self.final_size == Some(self.buffer.read_offset());
        if done {
            self.state = RecvStreamState::DataRead;
        }
        Ok((data, done))
    }

    /// Bytes ready for the application
    pub fn readable(&self) -> u64 {
        self.buffer.readable()
    }

    /// New MAX_STREAM_DATA to advertise, while more data is expected.
    pub fn next_max_stream_data(&mut self) -> Option<u64> {
        if self.state != RecvStreamState::Recv {
            return None;
        }
        self.window.next_max_data()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;

    fn stream_frame(offset: u64, data: &'static [u8], fin: bool) -> StreamFrame {
        StreamFrame {
            stream_id: StreamId(0),
            offset,
            fin,
            data: Bytes::from_static(data),
        }
    }

    mod send_tests {
        use super::*;

        #[test]
        fn test_write_then_fin_then_acked() {
            let mut s = SendStream::new(StreamId(0), 100);
            assert_eq!(s.write(5, false).unwrap(), 0);
            assert_eq!(s.state(), SendStreamState::Send);
            assert_eq!(s.write(3, true).unwrap(), 5);
            assert_eq!(s.state(), SendStreamState::DataSent);
            assert!(!s.on_acked(5, 3, true));
            assert!(s.on_acked(0, 5, false));
            assert_eq!(s.state(), SendStreamState::DataRecvd);
        }

        #[test]
        fn test_no_writes_after_fin() {
            let mut s = SendStream::new(StreamId(0), 100);
            s.write(0, true).unwrap();
            assert!(matches!(
                s.write(1, false),
                Err(Error::InvalidStreamOperation { .. })
            ));
        }

        #[test]
        fn test_write_beyond_credit_is_blocked() {
            let mut s = SendStream::new(StreamId(4), 4);
            assert_eq!(s.write(5, false), Err(Error::Blocked { stream_id: StreamId(4) }));
            assert_eq!(s.offset(), 0);
            assert_eq!(s.state(), SendStreamState::Ready);
        }

        #[test]
        fn test_reset_paths() {
            let mut s = SendStream::new(StreamId(0), 100);
            s.write(7, false).unwrap();
            assert_eq!(s.reset(3).unwrap(), 7);
            assert_eq!(s.state(), SendStreamState::ResetSent);
            assert!(s.reset(3).is_err());
            assert!(s.on_reset_acked());
            assert_eq!(s.state(), SendStreamState::ResetRecvd);
        }
    }

    mod recv_tests {
        use super::*;

        #[test]
        fn test_fin_then_lower_frame() {
            let mut r = RecvStream::new(StreamId(0), 100);
            r.on_stream_frame(&stream_frame(5, b"world", true)).unwrap();
            assert_eq!(r.state(), RecvStreamState::SizeKnown);
            r.on_stream_frame(&stream_frame(0, b"hello", false)).unwrap();
            assert_eq!(r.state(), RecvStreamState::DataRecvd);
            let (data, fin) = r.read().unwrap();
            assert_eq!(data, Bytes::from_static(b"helloworld"));
            assert!(fin);
            assert_eq!(r.state(), RecvStreamState::DataRead);
        }

        #[test]
        fn test_data_past_final_size() {
            let mut r = RecvStream::new(StreamId(0), 100);
            r.on_stream_frame(&stream_frame(5, b"world", true)).unwrap();
            let err = r.on_stream_frame(&stream_frame(8, b"xyz", false)).unwrap_err();
            assert_eq!(err.transport_error(), Some(TransportError::FinalSizeError));
        }

        #[test]
        fn test_fin_below_received() {
            let mut r = RecvStream::new(StreamId(0), 100);
            r.on_stream_frame(&stream_frame(0, b"hello", false)).unwrap();
            let err = r.on_stream_frame(&stream_frame(0, b"he", true)).unwrap_err();
            assert_eq!(err.transport_error(), Some(TransportError::FinalSizeError));
        }

        #[test]
        fn test_flow_control_limit() {
            let mut r = RecvStream::new(StreamId(0), 4);
            let err = r.on_stream_frame(&stream_frame(0, b"hello", false)).unwrap_err();
            assert_eq!(err.transport_error(), Some(TransportError::FlowControlError));
            assert_eq!(r.state(), RecvStreamState::Recv);
        }

        #[test]
        fn test_increase_counts_highest_offset_only() {
            let mut r = RecvStream::new(StreamId(0), 100);
            assert_eq!(r.on_stream_frame(&stream_frame(5, b"abc", false)).unwrap(), 8);
            assert_eq!(r.on_stream_frame(&stream_frame(0, b"abc", false)).unwrap(), 0);
        }

        #[test]
        fn test_reset_then_read() {
            let mut r = RecvStream::new(StreamId(0), 100);
            r.on_stream_frame(&stream_frame(0, b"abc", false)).unwrap();
            let reset = ResetStreamFrame {
                stream_id: StreamId(0),
                error_code: 9,
                final_size: 10,
            };
            assert_eq!(r.on_reset(&reset).unwrap(), 7);
            assert_eq!(r.state(), RecvStreamState::ResetRecvd);
            assert!(r.read().is_err());
            assert_eq!(r.state(), RecvStreamState::ResetRead);
        }

        #[test]
        fn test_reset_with_conflicting_final_size() {
            let mut r = RecvStream::new(StreamId(0), 100);
            r.on_stream_frame(&stream_frame(0, b"abc", true)).unwrap();
            let reset = ResetStreamFrame {
                stream_id: StreamId(0),
                error_code: 0,
                final_size: 4,
            };
            let err = r.on_reset(&reset).unwrap_err();
            assert_eq!(err.transport_error(), Some(TransportError::FinalSizeError));
        }
    }
}
