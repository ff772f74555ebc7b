//! Block range arithmetic
//!
//! A [`BlockRange`] is a half-open run of blocks `[start, start + size)`.
//! Migration needs intersections and remainders of ranges, including the
//! case where a partial overlap splits a range into two disjoint pieces.

use serde::Serialize;
use std::fmt;

/// A half-open run of blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct BlockRange {
    pub start: usize,
    pub size: usize,
}

impl BlockRange {
    /// Create a new range
    pub fn new(start: usize, size: usize) -> Self {
        Self { start, size }
    }

    /// One past the last block
    pub fn end(&self) -> usize {
        self.start + self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Same coordinates as `(start, size)`
    pub fn matches(&self, start: usize, size: usize) -> bool {
        self.start == start && self.size == size
    }

    /// `other` lies entirely inside this range
    pub fn contains(&self, other: &BlockRange) -> bool {
        other.start >= self.start && other.end() <= self.end()
    }

    /// The ranges share at least one block
    pub fn overlaps(&self, other: &BlockRange) -> bool {
        !self.is_empty() && !other.is_empty() && self.start < other.end() && other.start < self.end()
    }

    /// Blocks shared by both ranges
    pub fn overlap(&self, other: &BlockRange) -> Option<BlockRange> {
        if !self.overlaps(other) {
            return None;
        }
        let start = self.start.max(other.start);
        let end = self.end().min(other.end());
        Some(BlockRange::new(start, end - start))
    }

    /// The parts of this range not covered by `other`
    ///
    /// Returns the remainder before `other` and the remainder after it.
    /// Both are `None` when `other` covers this range completely; both are
    /// `Some` when `other` sits strictly inside it.
    pub fn non_overlap(&self, other: &BlockRange) -> (Option<BlockRange>, Option<BlockRange>) {
        if !self.overlaps(other) {
            return if self.is_empty() {
                (None, None)
            } else if self.start < other.start {
                (Some(*self), None)
            } else {
                (None, Some(*self))
            };
        }

        let before = (self.start < other.start)
            .then(|| BlockRange::new(self.start, other.start - self.start));
        let after =
            (self.end() > other.end()).then(|| BlockRange::new(other.end(), self.end() - other.end()));
        (before, after)
    }

    /// Move the range by a signed block offset
    pub fn offset_by(&self, delta: isize) -> BlockRange {
        let start = self
            .start
            .checked_add_signed(delta)
            .unwrap_or_else(|| panic!("range {} shifted by {} leaves the table", self, delta));
        BlockRange::new(start, self.size)
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}..{})", self.start, self.end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_overlap_and_containment() {
        let a = BlockRange::new(10, 10);
        let b = BlockRange::new(15, 10);
        let c = BlockRange::new(12, 3);

        assert!(a.overlaps(&b));
        assert_eq!(a.overlap(&b), Some(BlockRange::new(15, 5)));
        assert!(a.contains(&c));
        assert!(!a.contains(&b));
        assert!(a.matches(10, 10));
    }

    #[test]
    fn test_adjacent_ranges_do_not_overlap() {
        let a = BlockRange::new(0, 4);
        let b = BlockRange::new(4, 4);
        assert!(!a.overlaps(&b));
        assert_eq!(a.overlap(&b), None);
        assert_eq!(a.non_overlap(&b), (Some(a), None));
    }

    #[test]
    fn test_non_overlap_split_in_two() {
        let outer = BlockRange::new(0, 10);
        let inner = BlockRange::new(3, 4);
        assert_eq!(
            outer.non_overlap(&inner),
            (Some(BlockRange::new(0, 3)), Some(BlockRange::new(7, 3)))
        );
        assert_eq!(inner.non_overlap(&outer), (None, None));
    }

    #[test]
    fn test_non_overlap_prefix_and_suffix() {
        let r = BlockRange::new(10, 10);
        assert_eq!(
            r.non_overlap(&BlockRange::new(5, 10)),
            (None, Some(BlockRange::new(15, 5)))
        );
        assert_eq!(
            r.non_overlap(&BlockRange::new(15, 10)),
            (Some(BlockRange::new(10, 5)), None)
        );
    }

    #[test]
    fn test_offset_by() {
        let r = BlockRange::new(10, 4);
        assert_eq!(r.offset_by(-10), BlockRange::new(0, 4));
        assert_eq!(r.offset_by(5), BlockRange::new(15, 4));
    }

    proptest! {
        #[test]
        fn prop_overlap_plus_remainders_cover_range(
            s1 in 0usize..64, n1 in 1usize..32,
            s2 in 0usize..64, n2 in 1usize..32,
        ) {
            let a = BlockRange::new(s1, n1);
            let b = BlockRange::new(s2, n2);
            let (before, after) = a.non_overlap(&b);
            let covered = a.overlap(&b).map_or(0, |r| r.size)
                + before.map_or(0, |r| r.size)
                + after.map_or(0, |r| r.size);
            prop_assert_eq!(covered, a.size);
            if let Some(r) = before {
                prop_assert!(!r.overlaps(&b));
                prop_assert!(a.contains(&r));
            }
            if let Some(r) = after {
                prop_assert!(!r.overlaps(&b));
                prop_assert!(a.contains(&r));
            }
        }
    }
}
