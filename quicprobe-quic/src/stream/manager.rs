//! # Stream Map (RFC 9000 Sections 2.1, 4.6)
//!
//! Owns every stream half of one connection and enforces stream-id parity
//! and the stream-count limits in both directions. Peer-initiated streams
//! open implicitly, including every lower-numbered stream of the same type.
//! Those lower streams only get state once something addresses them.

#![forbid(unsafe_code)]

use super::controller::{RecvStream, SendStream};
use crate::error::{Error, Result};
use crate::frames::MAX_STREAMS_LIMIT;
use crate::transport::TransportParameters;
use crate::types::{Side, StreamId};
use std::collections::{BTreeMap, BTreeSet};

/// Stream Limits Configuration
///
/// The stream-related transport parameters of one endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamLimits {
    pub max_streams_bidi: u64,
    pub max_streams_uni: u64,

    /// Per-stream windows, from the advertising endpoint's point of view
    pub max_stream_data_bidi_local: u64,
    pub max_stream_data_bidi_remote: u64,
    pub max_stream_data_uni: u64,
}

impl StreamLimits {
    pub fn from_params(params: &TransportParameters) -> Self {
        Self {
            max_streams_bidi: params.initial_max_streams_bidi(),
            max_streams_uni: params.initial_max_streams_uni(),
            max_stream_data_bidi_local: params.initial_max_stream_data(true, true),
            max_stream_data_bidi_remote: params.initial_max_stream_data(false, true),
            max_stream_data_uni: params.initial_max_stream_data(false, false),
        }
    }

    fn max_streams(&self, bidirectional: bool) -> u64 {
        if bidirectional {
            self.max_streams_bidi
        } else {
            self.max_streams_uni
        }
    }
}

/// Index into per-direction arrays
fn dir(bidirectional: bool) -> usize {
    if bidirectional {
        0
    } else {
        1
    }
}

#[derive(Debug, Clone)]
pub struct StreamMap {
    side: Side,
    local: StreamLimits,
    peer: StreamLimits,

    send: BTreeMap<StreamId, SendStream>,
    recv: BTreeMap<StreamId, RecvStream>,

    /// Next local stream index, [bidi, uni]
    next_local: [u64; 2],

    /// Count of peer streams opened so far, explicitly or implicitly
    peer_opened: [u64; 2],

    /// Peer streams that were given state, including collected ones
    peer_seen: BTreeSet<StreamId>,

    /// Count of peer streams fully closed
    peer_closed: [u64; 2],

    /// Stream count we currently allow the peer
    local_max_streams: [u64; 2],

    /// Stream count the peer currently allows us
    peer_max_streams: [u64; 2],

    /// Peer streams opened since the last drain
    newly_opened: Vec<StreamId>,
}

impl StreamMap {
    pub fn new(side: Side, local: StreamLimits) -> Self {
        Self {
            side,
            local,
            peer: StreamLimits::default(),
            send: BTreeMap::new(),
            recv: BTreeMap::new(),
            next_local: [0; 2],
            peer_opened: [0; 2],
            peer_seen: BTreeSet::new(),
            peer_closed: [0; 2],
            local_max_streams: [local.max_streams_bidi, local.max_streams_uni],
            peer_max_streams: [0; 2],
            newly_opened: Vec::new(),
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    fn is_local(&self, id: StreamId) -> bool {
        id.initiator() == self.side
    }

    /// Apply the peer's transport parameters.
    pub fn set_peer_limits(&mut self, peer: StreamLimits) {
        self.peer = peer;
        self.raise_peer_max_streams(true, peer.max_streams_bidi);
        self.raise_peer_max_streams(false, peer.max_streams_uni);
        let side = self.side;
        for (id, stream) in self.send.iter_mut() {
            let limit = Self::peer_window(&peer, id.initiator() == side, id.is_bidirectional());
            stream.credit_mut().raise(limit);
        }
    }

    /// Credit the peer gives us on a stream
    fn peer_window(peer: &StreamLimits, local: bool, bidirectional: bool) -> u64 {
        match (bidirectional, local) {
            // a stream we opened is "remote" from the peer's point of view
            (true, true) => peer.max_stream_data_bidi_remote,
            (true, false) => peer.max_stream_data_bidi_local,
            (false, _) => peer.max_stream_data_uni,
        }
    }

    /// Window we give the peer on a stream
    fn local_window(&self, local: bool, bidirectional: bool) -> u64 {
        match (bidirectional, local) {
            (true, true) => self.local.max_stream_data_bidi_local,
            (true, false) => self.local.max_stream_data_bidi_remote,
            (false, _) => self.local.max_stream_data_uni,
        }
    }

    /// MAX_STREAMS from the peer. Limits never decrease.
    pub fn raise_peer_max_streams(&mut self, bidirectional: bool, max: u64) -> bool {
        let slot = &mut self.peer_max_streams[dir(bidirectional)];
        if max > *slot {
            *slot = max;
            true
        } else {
            false
        }
    }

    pub fn peer_max_streams(&self, bidirectional: bool) -> u64 {
        self.peer_max_streams[dir(bidirectional)]
    }

    pub fn local_max_streams(&self, bidirectional: bool) -> u64 {
        self.local_max_streams[dir(bidirectional)]
    }

    /// Open the next local stream.
    ///
    /// Fails with [`Error::Blocked`] when the peer's stream limit is
    /// reached; the caller signals STREAMS_BLOCKED.
    pub fn open_local(&mut self, bidirectional: bool) -> Result<StreamId> {
        let d = dir(bidirectional);
        let index = self.next_local[d];
        let id = StreamId::from_parts(index, self.side, bidirectional);
        if index >= self.peer_max_streams[d] {
            return Err(Error::Blocked { stream_id: id });
        }
        self.next_local[d] += 1;
        self.send
            .insert(id, SendStream::new(id, Self::peer_window(&self.peer, true, bidirectional)));
        if bidirectional {
            self.recv
                .insert(id, RecvStream::new(id, self.local_window(true, true)));
        }
        Ok(id)
    }

    /// Open peer streams up to and including `id`. Only `id` gets state.
    fn open_remote(&mut self, id: StreamId) -> Result<()> {
        let d = dir(id.is_bidirectional());
        if id.index() >= self.peer_opened[d] {
            if id.index() >= self.local_max_streams[d] {
                return Err(Error::stream_limit("peer opened stream beyond limit"));
            }
            self.peer_opened[d] = id.index() + 1;
        }
        self.materialize(id);
        Ok(())
    }

    /// Give state to an implicitly opened peer stream on first use.
    fn materialize(&mut self, id: StreamId) {
        let bidirectional = id.is_bidirectional();
        if self.is_local(id)
            || id.index() >= self.peer_opened[dir(bidirectional)]
            || !self.peer_seen.insert(id)
        {
            return;
        }
        self.recv
            .insert(id, RecvStream::new(id, self.local_window(false, bidirectional)));
        if bidirectional {
            let credit = Self::peer_window(&self.peer, false, true);
            self.send.insert(id, SendStream::new(id, credit));
        }
        self.newly_opened.push(id);
    }

    /// Receiving half addressed by a frame from the peer.
    ///
    /// `Ok(None)` means the stream existed and is already closed.
    pub fn recv_for_frame(&mut self, id: StreamId) -> Result<Option<&mut RecvStream>> {
        if self.is_local(id) {
            if id.is_unidirectional() {
                return Err(Error::stream_state("receive frame on local send-only stream"));
            }
            if id.index() >= self.next_local[0] {
                return Err(Error::stream_state("frame for unopened local stream"));
            }
        } else {
            self.open_remote(id)?;
        }
        Ok(self.recv.get_mut(&id))
    }

    /// Sending half addressed by a frame from the peer.
    pub fn send_for_frame(&mut self, id: StreamId) -> Result<Option<&mut SendStream>> {
        if self.is_local(id) {
            let d = dir(id.is_bidirectional());
            if id.index() >= self.next_local[d] {
                return Err(Error::stream_state("frame for unopened local stream"));
            }
        } else {
            if id.is_unidirectional() {
                return Err(Error::stream_state("send frame on peer receive-only stream"));
            }
            self.open_remote(id)?;
        }
        Ok(self.send.get_mut(&id))
    }

    pub fn send_stream(&self, id: StreamId) -> Option<&SendStream> {
        self.send.get(&id)
    }

    pub fn send_stream_mut(&mut self, id: StreamId) -> Option<&mut SendStream> {
        self.materialize(id);
        self.send.get_mut(&id)
    }

    pub fn recv_stream(&self, id: StreamId) -> Option<&RecvStream> {
        self.recv.get(&id)
    }

    pub fn recv_stream_mut(&mut self, id: StreamId) -> Option<&mut RecvStream> {
        self.materialize(id);
        self.recv.get_mut(&id)
    }

    pub fn take_opened(&mut self) -> Vec<StreamId> {
        std::mem::take(&mut self.newly_opened)
    }

    /// Drop streams whose halves are all terminal. Closing peer streams
    /// frees stream credit for the peer.
    pub fn collect_closed(&mut self) {
        let done: Vec<StreamId> = self
            .send
            .keys()
            .chain(self.recv.keys())
            .copied()
            .filter(|id| {
                self.send.get(id).map_or(true, |s| s.state().is_terminal())
                    && self.recv.get(id).map_or(true, |r| r.state().is_terminal())
            })
            .collect();
        for id in done {
            let had_any = self.send.remove(&id).is_some() | self.recv.remove(&id).is_some();
            if had_any && !self.is_local(id) {
                self.peer_closed[dir(id.is_bidirectional())] += 1;
            }
        }
    }

    /// New MAX_STREAMS value once half the initial allowance is closed.
    pub fn next_max_streams(&mut self, bidirectional: bool) -> Option<u64> {
        let d = dir(bidirectional);
        let initial = self.local.max_streams(bidirectional);
        let target = (self.peer_closed[d] + initial).min(MAX_STREAMS_LIMIT);
        if target > self.local_max_streams[d] && target - self.local_max_streams[d] >= initial / 2 {
            self.local_max_streams[d] = target;
            Some(target)
        } else {
            None
        }
    }
}
