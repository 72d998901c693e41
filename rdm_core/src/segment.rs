//! Inclusive byte interval over a download's content range.

use serde::{Deserialize, Serialize};

/// A closed byte interval `[start, end]`, `start <= end`.
///
/// Length is `end - start + 1`. Segments never carry the "unknown length"
/// sentinel the single-stream fallback in the HTTP worker uses internally —
/// by the time a `Segment` enters the tree, `FileInfoProbe` has already
/// resolved a concrete content length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Segment {
    pub start: u64,
    pub end: u64,
}

impl Segment {
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end, "segment start must not exceed end");
        Self { start, end }
    }

    pub fn length(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn overlaps(&self, other: &Segment) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn contains(&self, byte: u64) -> bool {
        self.start <= byte && byte <= self.end
    }

    /// Splits this segment per the tree's split rule: the left half inherits
    /// the lower bytes, the right half gets the remainder. Does not enforce
    /// the minimum-length rule — callers check that separately so they can
    /// report a typed refusal instead of a silent no-op.
    pub fn split_in_half(&self) -> (Segment, Segment) {
        let mid = self.start + (self.end - self.start) / 2;
        (Segment::new(self.start, mid), Segment::new(mid + 1, self.end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_is_inclusive() {
        assert_eq!(Segment::new(0, 0).length(), 1);
        assert_eq!(Segment::new(0, 99).length(), 100);
    }

    #[test]
    fn overlap_detects_touching_and_disjoint_ranges() {
        let a = Segment::new(0, 10);
        assert!(a.overlaps(&Segment::new(10, 20)));
        assert!(a.overlaps(&Segment::new(5, 6)));
        assert!(!a.overlaps(&Segment::new(11, 20)));
    }

    #[test]
    fn split_in_half_follows_split_rule() {
        // [s, e] -> left [s, s+floor((e-s)/2)], right [left.end+1, e]
        let (left, right) = Segment::new(0, 9).split_in_half();
        assert_eq!(left, Segment::new(0, 4));
        assert_eq!(right, Segment::new(5, 9));

        let (left, right) = Segment::new(0, 10).split_in_half();
        assert_eq!(left, Segment::new(0, 5));
        assert_eq!(right, Segment::new(6, 10));
    }

    #[test]
    fn single_byte_segment_contains_only_that_byte() {
        let s = Segment::new(42, 42);
        assert_eq!(s.length(), 1);
        assert!(s.contains(42));
        assert!(!s.contains(41));
    }
}
