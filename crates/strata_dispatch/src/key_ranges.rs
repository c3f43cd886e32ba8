//! Byte key ranges used to describe the data a read request covers.
//!
//! A `KeyRange` is a half-open `[start_key, end_key)` interval over opaque
//! byte keys; an empty `end_key` means the range is unbounded on the right.
//! `KeyRanges` is an ordered sequence of disjoint ranges as produced by the
//! SQL layer and re-split at region boundaries by the planner.

/// Half-open `[start_key, end_key)` interval over opaque byte keys.
///
/// An empty `end_key` represents an unbounded upper end.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyRange {
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
}

impl KeyRange {
    pub fn new(start_key: impl Into<Vec<u8>>, end_key: impl Into<Vec<u8>>) -> Self {
        Self {
            start_key: start_key.into(),
            end_key: end_key.into(),
        }
    }

    /// Whether `key` falls inside this range. Empty bounds are open.
    pub fn contains(&self, key: &[u8]) -> bool {
        let in_start = self.start_key.is_empty() || key >= self.start_key.as_slice();
        let in_end = self.end_key.is_empty() || key < self.end_key.as_slice();
        in_start && in_end
    }

    /// A range is empty when its bounds are ordered the wrong way round.
    pub fn is_empty(&self) -> bool {
        !self.end_key.is_empty() && self.start_key >= self.end_key
    }
}

/// Ordered sequence of disjoint `KeyRange`s.
///
/// Callers construct these sorted by `start_key`; the planner re-splits them
/// at region boundaries and workers merge them back when a failed batch task
/// has to be re-planned from scratch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyRanges {
    ranges: Vec<KeyRange>,
}

impl KeyRanges {
    pub fn new(ranges: Vec<KeyRange>) -> Self {
        Self { ranges }
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &KeyRange> {
        self.ranges.iter()
    }

    /// Visit every range in order without surrendering ownership.
    pub fn for_each(&self, mut f: impl FnMut(&KeyRange)) {
        for range in &self.ranges {
            f(range);
        }
    }

    /// First start key across the sequence, if any.
    pub fn first_start_key(&self) -> Option<&[u8]> {
        self.ranges.first().map(|r| r.start_key.as_slice())
    }

    pub fn into_vec(self) -> Vec<KeyRange> {
        self.ranges
    }
}

impl From<Vec<KeyRange>> for KeyRanges {
    fn from(ranges: Vec<KeyRange>) -> Self {
        Self::new(ranges)
    }
}
