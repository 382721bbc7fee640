//! # Stream Data Reassembly Buffer (RFC 9000 Section 2.2)
//!
//! STREAM and CRYPTO frames can arrive out of order, overlap, or repeat.
//! Data must be delivered to the reader **in order**.
//!
//! The buffer tracks:
//! 1. **Received ranges**: a [`RangeSet`] of every offset seen so far
//! 2. **Chunks**: non-overlapping [`Bytes`] slices keyed by offset, so
//!    bytes already held are never stored twice
//!
//! [`RangeSet`] doubles as the received packet-number set behind ACK
//! generation.

#![forbid(unsafe_code)]

use bytes::{Bytes, BytesMut};
use core::ops::Range;
use std::collections::BTreeMap;

// ============================================================================
// Range Set
// ============================================================================

/// Sorted, merged set of half-open `u64` ranges.
///
/// Inserting `[0..5, 5..10, 15..20, 18..25]` leaves `[0..10, 15..25]`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeSet {
    ranges: Vec<Range<u64>>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a range, merging with any it overlaps or touches.
    pub fn insert(&mut self, range: Range<u64>) {
        if range.start >= range.end {
            return;
        }
        let mut start = range.start;
        let mut end = range.end;

        // first range that ends at or after our start
        let first = self.ranges.partition_point(|r| r.end < start);
        let mut last = first;
        while last < self.ranges.len() && self.ranges[last].start <= end {
            start = start.min(self.ranges[last].start);
            end = end.max(self.ranges[last].end);
            last += 1;
        }
        self.ranges.splice(first..last, core::iter::once(start..end));
    }

    pub fn insert_one(&mut self, value: u64) {
        self.insert(value..value + 1);
    }

    pub fn contains(&self, value: u64) -> bool {
        let idx = self.ranges.partition_point(|r| r.end <= value);
        self.ranges.get(idx).map_or(false, |r| r.start <= value)
    }

    /// Sub-ranges of `range` not covered by the set, ascending.
    pub fn gaps(&self, range: Range<u64>) -> Vec<Range<u64>> {
        let mut out = Vec::new();
        let mut cursor = range.start;
        for r in &self.ranges {
            if r.end <= cursor {
                continue;
            }
            if r.start >= range.end {
                break;
            }
            if r.start > cursor {
                out.push(cursor..r.start);
            }
            cursor = cursor.max(r.end);
            if cursor >= range.end {
                break;
            }
        }
        if cursor < range.end {
            out.push(cursor..range.end);
        }
        out
    }

    /// End of the run of covered values starting at `from` (== `from` if
    /// `from` itself is missing).
    pub fn contiguous_end(&self, from: u64) -> u64 {
        let idx = self.ranges.partition_point(|r| r.end <= from);
        match self.ranges.get(idx) {
            Some(r) if r.start <= from => r.end,
            _ => from,
        }
    }

    /// Largest value in the set
    pub fn max(&self) -> Option<u64> {
        self.ranges.last().map(|r| r.end - 1)
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Number of disjoint ranges
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Ranges in ascending order
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Range<u64>> {
        self.ranges.iter()
    }
}

// ============================================================================
// Reassembly Buffer
// ============================================================================

/// Out-of-order receive buffer for one stream (or one CRYPTO level).
#[derive(Debug, Default, Clone)]
pub struct ReassemblyBuffer {
    /// Next byte the reader will get
    read_offset: u64,

    received: RangeSet,

    chunks: BTreeMap<u64, Bytes>,
}

impl ReassemblyBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `data` at `offset`. Bytes already received or already read
    /// are dropped; the rest is kept without copying.
    pub fn insert(&mut self, offset: u64, data: Bytes) {
        let end = offset + data.len() as u64;
        let start = offset.max(self.read_offset);
        if start >= end {
            return;
        }
        for gap in self.received.gaps(start..end) {
            let lo = (gap.start - offset) as usize;
            let hi = (gap.end - offset) as usize;
            self.chunks.insert(gap.start, data.slice(lo..hi));
        }
        self.received.insert(start..end);
    }

    /// Next in-order bytes, at most `max_len` of them.
    pub fn read(&mut self, max_len: usize) -> Option<Bytes> {
        let (&offset, _) = self.chunks.first_key_value()?;
        if offset != self.read_offset || max_len == 0 {
            return None;
        }
        let mut chunk = self.chunks.remove(&offset)?;
        if chunk.len() > max_len {
            let rest = chunk.split_off(max_len);
            self.chunks.insert(offset + max_len as u64, rest);
        }
        self.read_offset += chunk.len() as u64;
        Some(chunk)
    }

    /// Everything readable right now, concatenated.
    pub fn read_all(&mut self) -> Bytes {
        let mut out = BytesMut::new();
        while let Some(chunk) = self.read(usize::MAX) {
            out.extend_from_slice(&chunk);
        }
        out.freeze()
    }

    pub fn read_offset(&self) -> u64 {
        self.read_offset
    }

    /// End of the contiguous data available from offset 0
    pub fn contiguous_end(&self) -> u64 {
        self.received.contiguous_end(self.read_offset).max(self.read_offset)
    }

    /// Highest offset received so far (exclusive end)
    pub fn max_received(&self) -> u64 {
        self.received.max().map_or(0, |m| m + 1)
    }

    /// Bytes stored beyond the contiguous prefix
    pub fn buffered_out_of_order(&self) -> u64 {
        let contiguous = self.contiguous_end();
        self.chunks
            .range(contiguous..)
            .map(|(_, c)| c.len() as u64)
            .sum()
    }

    /// Bytes available to read now
    pub fn readable(&self) -> u64 {
        self.contiguous_end() - self.read_offset
    }

    /// Whether every byte below `size` has been received
    pub fn is_complete(&self, size: u64) -> bool {
        size == 0 || self.received.contiguous_end(0) >= size
    }

    /// Discard all data, e.g. when the stream is reset
    pub fn reset(&mut self) {
        self.chunks.clear();
    }
}
