//! # Flow Control (RFC 9000 Section 4)
//!
//! QUIC uses credit-based flow control at two levels:
//! - **Connection-level**: Total bytes across all streams
//! - **Stream-level**: Bytes per individual stream
//!
//! Both levels use the same two halves: [`SendCredit`] for the limit the
//! peer granted us, and [`RecvWindow`] for the limit we advertised.

#![forbid(unsafe_code)]

use crate::error::{Error, Result};

/// Credit granted by the peer (MAX_DATA / MAX_STREAM_DATA).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendCredit {
    limit: u64,

    /// Bytes (or highest offset) already committed
    used: u64,

    /// Limit at which DATA_BLOCKED was last signalled
    blocked_at: Option<u64>,
}

impl SendCredit {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            used: 0,
            blocked_at: None,
        }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn available(&self) -> u64 {
        self.limit.saturating_sub(self.used)
    }

    /// Commit `bytes` of credit. Fails without committing anything when the
    /// peer's limit would be exceeded.
    pub fn consume(&mut self, bytes: u64) -> core::result::Result<(), u64> {
        if bytes > self.available() {
            return Err(self.limit);
        }
        self.used += bytes;
        Ok(())
    }

    /// Apply a new limit from the peer. Limits never decrease.
    pub fn raise(&mut self, limit: u64) -> bool {
        if limit > self.limit {
            self.limit = limit;
            true
        } else {
            false
        }
    }

    /// The limit to report in a BLOCKED frame, once per limit value.
    pub fn take_blocked(&mut self) -> Option<u64> {
        if self.blocked_at == Some(self.limit) {
            return None;
        }
        self.blocked_at = Some(self.limit);
        Some(self.limit)
    }
}

/// Receive limit we advertised to the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecvWindow {
    /// Limit currently advertised
    max_data: u64,

    /// Bytes (or highest offset) the peer has used
    received: u64,

    /// Bytes delivered to the application
    consumed: u64,

    /// Size of the window re-advertised as data is consumed
    window: u64,
}

impl RecvWindow {
    pub fn new(window: u64) -> Self {
        Self {
            max_data: window,
            received: 0,
            consumed: 0,
            window,
        }
    }

    pub fn max_data(&self) -> u64 {
        self.max_data
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    /// Account for peer usage growing to `total`.
    ///
    /// Exceeding the advertised limit is a FLOW_CONTROL_ERROR.
    pub fn on_received(&mut self, total: u64) -> Result<()> {
        if total > self.max_data {
            return Err(Error::flow_control("peer exceeded advertised limit"));
        }
        self.received = self.received.max(total);
        Ok(())
    }

    pub fn on_consumed(&mut self, bytes: u64) {
        self.consumed += bytes;
    }

    /// New limit to advertise once half the window has been consumed.
    pub fn next_max_data(&mut self) -> Option<u64> {
        let target = self.consumed + self.window;
        if target > self.max_data && target - self.max_data >= self.window / 2 {
            self.max_data = target;
            Some(target)
        } else {
            None
        }
    }
}

/// Connection-Level Flow Control
///
/// `recv.received` counts the sum of the highest offsets seen on every
/// stream; `send.used` the sum of bytes written by the application.
#[derive(Debug, Clone)]
pub struct ConnectionFlowControl {
    pub send: SendCredit,
    pub recv: RecvWindow,
}

impl ConnectionFlowControl {
    pub fn new(peer_max_data: u64, local_max_data: u64) -> Self {
        Self {
            send: SendCredit::new(peer_max_data),
            recv: RecvWindow::new(local_max_data),
        }
    }

    /// Account for `increase` new bytes arriving on some stream.
    pub fn on_stream_received(&mut self, increase: u64) -> Result<()> {
        let total = self.recv.received() + increase;
        self.recv.on_received(total)
    }
}
