//! # Connection ID Management (RFC 9000 Section 5.1)
//!
//! Each side of a connection tracks two sets of connection IDs:
//!
//! - [`LocalConnectionIds`]: cids we issued for the peer to address us
//!   with. The peer retires them with RETIRE_CONNECTION_ID.
//! - [`RemoteConnectionIds`]: cids the peer issued with NEW_CONNECTION_ID.
//!   One of them is the Destination Connection ID of our packets.
//!
//! A retired cid is remembered forever, so it is never bound again.

#![forbid(unsafe_code)]

use crate::error::{Error, Result};
use crate::frames::NewConnectionIdFrame;
use crate::services::RandomSource;
use crate::types::{ConnectionId, StatelessResetToken};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Active Connection ID Entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedConnectionId {
    pub sequence_number: u64,
    pub connection_id: ConnectionId,

    /// Stateless reset token (absent for the handshake cid)
    pub reset_token: Option<StatelessResetToken>,
}

/// Draw a fresh cid of `len` bytes.
pub fn random_cid(rng: &mut dyn RandomSource, len: usize) -> ConnectionId {
    let mut bytes = vec![0u8; len];
    rng.fill(&mut bytes);
    ConnectionId::from_slice(&bytes).unwrap_or_default()
}

pub fn random_reset_token(rng: &mut dyn RandomSource) -> StatelessResetToken {
    let mut token = [0u8; 16];
    rng.fill(&mut token);
    token
}

/// Connection IDs issued by this endpoint.
#[derive(Debug, Clone)]
pub struct LocalConnectionIds {
    active: BTreeMap<u64, IssuedConnectionId>,
    retired: BTreeSet<u64>,
    next_sequence_number: u64,
}

impl LocalConnectionIds {
    /// `initial` is the Source Connection ID of our first long header
    /// (sequence number 0).
    pub fn new(initial: ConnectionId) -> Self {
        let mut active = BTreeMap::new();
        active.insert(
            0,
            IssuedConnectionId {
                sequence_number: 0,
                connection_id: initial,
                reset_token: None,
            },
        );
        Self {
            active,
            retired: BTreeSet::new(),
            next_sequence_number: 1,
        }
    }

    /// Record a newly issued cid and return its NEW_CONNECTION_ID frame.
    pub fn issue(&mut self, cid: ConnectionId, token: StatelessResetToken) -> NewConnectionIdFrame {
        let sequence_number = self.next_sequence_number;
        self.next_sequence_number += 1;
        self.active.insert(
            sequence_number,
            IssuedConnectionId {
                sequence_number,
                connection_id: cid.clone(),
                reset_token: Some(token),
            },
        );
        NewConnectionIdFrame {
            sequence_number,
            retire_prior_to: 0,
            connection_id: cid,
            stateless_reset_token: token,
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn next_sequence_number(&self) -> u64 {
        self.next_sequence_number
    }

    pub fn is_retired(&self, sequence_number: u64) -> bool {
        self.retired.contains(&sequence_number)
    }

    pub fn iter(&self) -> impl Iterator<Item = &IssuedConnectionId> {
        self.active.values()
    }

    /// Handle RETIRE_CONNECTION_ID (RFC 9000 Section 19.16).
    ///
    /// Returns the cid that stopped being valid, or None when the
    /// sequence number was already retired.
    pub fn retire(
        &mut self,
        sequence_number: u64,
        packet_dcid: &ConnectionId,
    ) -> Result<Option<ConnectionId>> {
        if sequence_number >= self.next_sequence_number {
            return Err(Error::protocol_violation("retiring a sequence number never issued"));
        }
        let Some(entry) = self.active.get(&sequence_number) else {
            return Ok(None);
        };
        if &entry.connection_id == packet_dcid {
            return Err(Error::protocol_violation(
                "retiring the connection ID the packet was sent to",
            ));
        }
        let cid = entry.connection_id.clone();
        self.active.remove(&sequence_number);
        self.retired.insert(sequence_number);
        Ok(Some(cid))
    }
}

/// Connection IDs issued by the peer.
#[derive(Debug, Clone)]
pub struct RemoteConnectionIds {
    active: BTreeMap<u64, IssuedConnectionId>,
    /// Retired sequence numbers and the cid each was bound to
    retired: BTreeMap<u64, ConnectionId>,
    retired_cids: HashSet<ConnectionId>,
    retire_prior_to: u64,

    /// Sequence number used as our Destination Connection ID
    current: u64,
}

impl RemoteConnectionIds {
    pub fn new(initial: ConnectionId) -> Self {
        let mut active = BTreeMap::new();
        active.insert(
            0,
            IssuedConnectionId {
                sequence_number: 0,
                connection_id: initial,
                reset_token: None,
            },
        );
        Self {
            active,
            retired: BTreeMap::new(),
            retired_cids: HashSet::new(),
            retire_prior_to: 0,
            current: 0,
        }
    }

    /// Destination Connection ID for outgoing packets
    pub fn current(&self) -> ConnectionId {
        self.active
            .get(&self.current)
            .map(|entry| entry.connection_id.clone())
            .unwrap_or_default()
    }

    /// A client replaces its random first DCID with the server's chosen
    /// Source Connection ID (RFC 9000 Section 7.2).
    pub fn replace_initial(&mut self, cid: ConnectionId) {
        if let Some(entry) = self.active.get_mut(&0) {
            entry.connection_id = cid;
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn contains(&self, cid: &ConnectionId) -> bool {
        self.active.values().any(|entry| &entry.connection_id == cid)
    }

    pub fn is_retired(&self, cid: &ConnectionId) -> bool {
        self.retired_cids.contains(cid)
    }

    pub fn retire_prior_to(&self) -> u64 {
        self.retire_prior_to
    }

    /// Handle NEW_CONNECTION_ID (RFC 9000 Section 19.15).
    ///
    /// `limit` is the active_connection_id_limit we advertised. Returns the
    /// sequence numbers that must be retired with RETIRE_CONNECTION_ID.
    pub fn on_new_connection_id(&mut self, frame: &NewConnectionIdFrame, limit: u64) -> Result<Vec<u64>> {
        if self.current().is_empty() {
            return Err(Error::protocol_violation(
                "NEW_CONNECTION_ID while using zero-length connection IDs",
            ));
        }
        if frame.retire_prior_to > frame.sequence_number {
            return Err(Error::frame_encoding("retire_prior_to above sequence number"));
        }
        if let Some(retired) = self.retired.get(&frame.sequence_number) {
            if retired != &frame.connection_id {
                return Err(Error::protocol_violation(
                    "retired sequence number re-bound to a different connection ID",
                ));
            }
            // retransmission of a frame we already retired
            return Ok(Vec::new());
        }
        if let Some(existing) = self.active.get(&frame.sequence_number) {
            if existing.connection_id != frame.connection_id {
                return Err(Error::protocol_violation(
                    "sequence number re-bound to a different connection ID",
                ));
            }
            return Ok(Vec::new());
        }
        if self.retired_cids.contains(&frame.connection_id) {
            return Err(Error::protocol_violation("reuse of a retired connection ID"));
        }
        if self
            .active
            .values()
            .any(|entry| entry.connection_id == frame.connection_id)
        {
            return Err(Error::protocol_violation(
                "connection ID issued under two sequence numbers",
            ));
        }

        let mut to_retire = Vec::new();
        if frame.sequence_number < self.retire_prior_to {
            // already below the watermark: retire it straight away
            self.retired
                .insert(frame.sequence_number, frame.connection_id.clone());
            self.retired_cids.insert(frame.connection_id.clone());
            to_retire.push(frame.sequence_number);
            return Ok(to_retire);
        }

        self.active.insert(
            frame.sequence_number,
            IssuedConnectionId {
                sequence_number: frame.sequence_number,
                connection_id: frame.connection_id.clone(),
                reset_token: Some(frame.stateless_reset_token),
            },
        );

        if frame.retire_prior_to > self.retire_prior_to {
            self.retire_prior_to = frame.retire_prior_to;
            let stale: Vec<u64> = self
                .active
                .range(..self.retire_prior_to)
                .map(|(seq, _)| *seq)
                .collect();
            for seq in stale {
                self.retire(seq);
                to_retire.push(seq);
            }
        }

        if self.active.len() as u64 > limit {
            return Err(Error::connection_id_limit("peer exceeded active_connection_id_limit"));
        }

        if !self.active.contains_key(&self.current) {
            self.activate_next();
        }
        Ok(to_retire)
    }

    fn retire(&mut self, sequence_number: u64) {
        if let Some(entry) = self.active.remove(&sequence_number) {
            self.retired_cids.insert(entry.connection_id.clone());
            self.retired.insert(sequence_number, entry.connection_id);
        }
    }

    /// Switch to the lowest active cid that has never been retired.
    pub fn activate_next(&mut self) -> Option<ConnectionId> {
        let next = self
            .active
            .values()
            .find(|entry| !self.retired_cids.contains(&entry.connection_id))?;
        self.current = next.sequence_number;
        Some(next.connection_id.clone())
    }
}
