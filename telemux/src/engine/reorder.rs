//! Bounded reorder buffer for packets that arrived ahead of sequence.
//!
//! Packets are indexed by sequence number and released lowest-first. The
//! buffer is bounded both by entry count and by total buffered bytes; the
//! caller is expected to check [`ReorderBuffer::is_full`] and force a drain
//! before inserting more.
//!
//! # Example
//!
//! ```
//! use telemux::engine::reorder::{InsertResult, ReorderBuffer};
//!
//! let mut buf = ReorderBuffer::new(16, 1 << 20);
//! assert_eq!(buf.insert(5, 0, vec![5]), InsertResult::Accepted);
//! assert_eq!(buf.insert(4, 0, vec![4]), InsertResult::Accepted);
//! assert_eq!(buf.pop_oldest().map(|(seq, _)| seq), Some(4));
//! ```

use std::collections::BTreeMap;

use crate::types::Micros;

/// Maximum buffered packets per sensor.
pub const MAX_ENTRIES: usize = 10_000;
/// Maximum buffered bytes per sensor.
pub const MAX_BYTES: usize = 2 * 1024 * 1024;

/// Result of inserting a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertResult {
    /// The packet is now buffered.
    Accepted,
    /// The sequence is already buffered; the new copy was discarded.
    Duplicate,
}

/// A packet waiting for its predecessors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buffered {
    /// Arrival time of the packet, kept for alignment on release.
    pub realtime: Micros,
    /// The raw frame.
    pub data: Vec<u8>,
}

/// Ordered, bounded packet buffer.
///
/// # Invariants
///
/// - `bytes` equals the summed length of all buffered payloads
/// - entries are released in ascending sequence order
#[derive(Debug)]
pub struct ReorderBuffer {
    entries: BTreeMap<u64, Buffered>,
    bytes: usize,
    max_entries: usize,
    max_bytes: usize,
}

impl ReorderBuffer {
    /// Creates a buffer bounded by `max_entries` packets and `max_bytes`
    /// payload bytes.
    #[must_use]
    pub fn new(max_entries: usize, max_bytes: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            bytes: 0,
            max_entries,
            max_bytes,
        }
    }

    /// Parks a packet. The bounds are not checked here; see
    /// [`is_full`](Self::is_full).
    pub fn insert(&mut self, seq: u64, realtime: Micros, data: Vec<u8>) -> InsertResult {
        if self.entries.contains_key(&seq) {
            return InsertResult::Duplicate;
        }
        self.bytes += data.len();
        self.entries.insert(seq, Buffered { realtime, data });
        InsertResult::Accepted
    }

    /// Lowest buffered sequence.
    #[must_use]
    pub fn first_seq(&self) -> Option<u64> {
        self.entries.first_key_value().map(|(&seq, _)| seq)
    }

    /// Removes the lowest-sequence entry.
    pub fn pop_oldest(&mut self) -> Option<(u64, Buffered)> {
        let (seq, entry) = self.entries.pop_first()?;
        self.bytes -= entry.data.len();
        Some((seq, entry))
    }

    /// Removes the lowest entry if its sequence is at most `max_seq`.
    pub fn pop_through(&mut self, max_seq: u64) -> Option<(u64, Buffered)> {
        match self.first_seq() {
            Some(seq) if seq <= max_seq => self.pop_oldest(),
            _ => None,
        }
    }

    /// Removes every entry, lowest sequence first.
    pub fn drain_all(&mut self, mut f: impl FnMut(u64, Buffered)) {
        while let Some((seq, entry)) = self.pop_oldest() {
            f(seq, entry);
        }
    }

    /// At or beyond the count or byte bound.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.max_entries || self.bytes >= self.max_bytes
    }

    /// Number of buffered packets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total buffered payload bytes.
    #[must_use]
    pub const fn bytes(&self) -> usize {
        self.bytes
    }
}

impl Default for ReorderBuffer {
    fn default() -> Self {
        Self::new(MAX_ENTRIES, MAX_BYTES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_invariants(buf: &ReorderBuffer) {
        let sum: usize = buf.entries.values().map(|e| e.data.len()).sum();
        assert_eq!(buf.bytes, sum, "byte accounting drifted");
        assert_eq!(buf.is_empty(), buf.first_seq().is_none());
    }

    #[test]
    fn new_buffer_is_empty() {
        let buf = ReorderBuffer::default();
        assert!(buf.is_empty());
        assert_eq!(buf.len(), 0);
        assert_eq!(buf.bytes(), 0);
        assert!(!buf.is_full());
        assert_invariants(&buf);
    }

    #[test]
    fn pops_in_sequence_order() {
        let mut buf = ReorderBuffer::default();
        for seq in [9, 4, 7, 5] {
            assert_eq!(buf.insert(seq, 0, vec![seq as u8]), InsertResult::Accepted);
            assert_invariants(&buf);
        }
        let order: Vec<u64> = std::iter::from_fn(|| buf.pop_oldest().map(|(s, _)| s)).collect();
        assert_eq!(order, vec![4, 5, 7, 9]);
        assert_invariants(&buf);
    }

    #[test]
    fn duplicate_keeps_first_copy() {
        let mut buf = ReorderBuffer::default();
        assert_eq!(buf.insert(3, 10, vec![1, 2]), InsertResult::Accepted);
        assert_eq!(buf.insert(3, 20, vec![9, 9, 9]), InsertResult::Duplicate);
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.bytes(), 2);
        let (_, entry) = buf.pop_oldest().unwrap();
        assert_eq!(entry, Buffered { realtime: 10, data: vec![1, 2] });
    }

    #[test]
    fn pop_through_stops_at_bound() {
        let mut buf = ReorderBuffer::default();
        buf.insert(5, 0, vec![]);
        buf.insert(6, 0, vec![]);
        assert!(buf.pop_through(4).is_none());
        assert_eq!(buf.pop_through(5).map(|(s, _)| s), Some(5));
        assert!(buf.pop_through(5).is_none());
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn full_by_count() {
        let mut buf = ReorderBuffer::new(3, usize::MAX);
        buf.insert(1, 0, vec![0]);
        buf.insert(2, 0, vec![0]);
        assert!(!buf.is_full());
        buf.insert(3, 0, vec![0]);
        assert!(buf.is_full());
        buf.pop_oldest();
        assert!(!buf.is_full());
    }

    #[test]
    fn full_by_bytes() {
        let mut buf = ReorderBuffer::new(usize::MAX, 100);
        buf.insert(1, 0, vec![0; 60]);
        assert!(!buf.is_full());
        buf.insert(2, 0, vec![0; 40]);
        assert!(buf.is_full());
        assert_invariants(&buf);
    }

    #[test]
    fn drain_all_is_ordered_and_empties() {
        let mut buf = ReorderBuffer::default();
        for seq in [30, 10, 20] {
            buf.insert(seq, seq as i64, vec![0; 8]);
        }
        let mut seen = Vec::new();
        buf.drain_all(|seq, entry| seen.push((seq, entry.realtime)));
        assert_eq!(seen, vec![(10, 10), (20, 20), (30, 30)]);
        assert!(buf.is_empty());
        assert_invariants(&buf);
    }
}
