//! Runtime table of reclaimed byte ranges.
//!
//! When a mutation relocates a record, the record's old range is released
//! here and later records are placed into it. The table lives in memory only;
//! a reopened tree starts with an empty table, and a rebuild discards the
//! fragmentation the table was tracking.
//!
//! # Invariants
//!
//! - Ranges never overlap and are never adjacent (adjacent ranges are merged)
//! - `total` equals the sum of all range lengths

use std::collections::BTreeMap;

/// Free ranges keyed by start offset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FreeSpaceTable {
    ranges: BTreeMap<u64, u64>,
    total: u64,
}

impl FreeSpaceTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total free bytes tracked.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.total
    }

    /// Number of separate free ranges.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Free ranges as `(offset, length)`, in offset order.
    pub fn ranges(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.ranges.iter().map(|(o, l)| (*o, *l))
    }

    /// Returns a range to the table, merging it with adjacent ranges.
    pub fn release(&mut self, offset: u64, length: u64) {
        if length == 0 {
            return;
        }
        let mut start = offset;
        let mut end = offset + length;
        self.total += length;

        if let Some((&prev_start, &prev_len)) = self.ranges.range(..start).next_back()
            && prev_start + prev_len >= start
        {
            self.ranges.remove(&prev_start);
            // An overlapping release is counted once.
            self.total -= (prev_start + prev_len).min(end) - start;
            end = end.max(prev_start + prev_len);
            start = prev_start;
        }
        while let Some((&next_start, &next_len)) = self.ranges.range(start..=end).next() {
            self.ranges.remove(&next_start);
            self.total -= (next_start + next_len).min(end) - next_start;
            end = end.max(next_start + next_len);
        }
        self.ranges.insert(start, end - start);
    }

    /// Takes `length` bytes from the smallest range that fits.
    pub fn allocate(&mut self, length: u64) -> Option<u64> {
        if length == 0 {
            return None;
        }
        let (&start, &available) = self
            .ranges
            .iter()
            .filter(|(_, l)| **l >= length)
            .min_by_key(|(o, l)| (**l, **o))?;
        self.ranges.remove(&start);
        if available > length {
            self.ranges.insert(start + length, available - length);
        }
        self.total -= length;
        Some(start)
    }

    /// Fraction of `byte_length` that is tracked as free.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn fraction_of(&self, byte_length: u64) -> f64 {
        if byte_length == 0 {
            0.0
        } else {
            self.total as f64 / byte_length as f64
        }
    }
}
