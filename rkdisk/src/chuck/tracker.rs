//! Known-chunk bookkeeping: which byte ranges of the disk hold real data.
//!
//! Ranges are inclusive on both ends. The underlying [`RangeSet`] keeps them
//! disjoint and non-adjacent; touching ranges are always coalesced.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{DiskError, Result};

/// Inclusive byte range `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Range covering `len` bytes from `offset`; `None` when `len` is zero.
    pub fn from_offset_len(offset: u64, len: u64) -> Option<Self> {
        if len == 0 {
            return None;
        }
        Some(Self {
            start: offset,
            end: offset + (len - 1),
        })
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start) + 1
    }

    /// Inclusive ranges always hold at least one byte.
    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Ordered set of disjoint, non-adjacent inclusive ranges keyed by start.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeSet {
    map: BTreeMap<u64, u64>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `[start, end]`, swallowing every range it overlaps or touches.
    pub fn insert(&mut self, start: u64, end: u64) {
        debug_assert!(start <= end);
        let mut merged_start = start;
        let mut merged_end = end;
        let mut absorbed = Vec::new();
        for (&s, &e) in self.map.range(..=end.saturating_add(1)).rev() {
            if e.saturating_add(1) < start {
                break;
            }
            merged_start = merged_start.min(s);
            merged_end = merged_end.max(e);
            absorbed.push(s);
        }
        for s in absorbed {
            self.map.remove(&s);
        }
        self.map.insert(merged_start, merged_end);
    }

    /// Remove `[start, end]`, splitting ranges that straddle either edge.
    pub fn remove(&mut self, start: u64, end: u64) {
        debug_assert!(start <= end);
        let hit: Vec<(u64, u64)> = self
            .map
            .range(..=end)
            .rev()
            .take_while(|&(_, &e)| e >= start)
            .map(|(&s, &e)| (s, e))
            .collect();
        for (s, e) in hit {
            self.map.remove(&s);
            if s < start {
                self.map.insert(s, start - 1);
            }
            if e > end {
                self.map.insert(end + 1, e);
            }
        }
    }

    /// Pieces of the set that fall inside `[start, end]`, clipped, ascending.
    pub fn intersect(&self, start: u64, end: u64) -> Vec<ByteRange> {
        let mut out: Vec<ByteRange> = self
            .map
            .range(..=end)
            .rev()
            .take_while(|&(_, &e)| e >= start)
            .map(|(&s, &e)| ByteRange::new(s.max(start), e.min(end)))
            .collect();
        out.reverse();
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = ByteRange> + '_ {
        self.map.iter().map(|(&s, &e)| ByteRange::new(s, e))
    }

    pub fn total_len(&self) -> u64 {
        self.map.iter().map(|(&s, &e)| e - s + 1).sum()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }
}

/// Tracks the known (read, written or zero-discarded) bytes of one disk.
///
/// `zeroed` is always a subset of `known`: bytes that were discarded as zero
/// and not written since.
#[derive(Debug, Clone)]
pub struct ChunkTracker {
    capacity: u64,
    known: RangeSet,
    zeroed: RangeSet,
}

impl ChunkTracker {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            known: RangeSet::new(),
            zeroed: RangeSet::new(),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Reversed ranges and ranges reaching past the capacity are malformed.
    /// Byte-level bounds are checked by the disk before anything gets here.
    fn check(&self, range: ByteRange) -> Result<()> {
        if range.start > range.end || range.end >= self.capacity {
            return Err(DiskError::InvalidRange {
                start: range.start,
                end: range.end,
            });
        }
        Ok(())
    }

    pub fn mark_known(&mut self, range: ByteRange) -> Result<()> {
        self.check(range)?;
        self.known.insert(range.start, range.end);
        Ok(())
    }

    /// Known, and reads as zero until overwritten.
    pub fn mark_zeroed(&mut self, range: ByteRange) -> Result<()> {
        self.check(range)?;
        self.known.insert(range.start, range.end);
        self.zeroed.insert(range.start, range.end);
        Ok(())
    }

    /// Known, holding written data.
    pub fn mark_written(&mut self, range: ByteRange) -> Result<()> {
        self.check(range)?;
        self.known.insert(range.start, range.end);
        self.zeroed.remove(range.start, range.end);
        Ok(())
    }

    /// Zeroed pieces overlapping `range`, clipped to it.
    pub fn zeroed_in(&self, range: ByteRange) -> Vec<ByteRange> {
        self.zeroed.intersect(range.start, range.end)
    }

    pub fn total_known_bytes(&self) -> u64 {
        self.known.total_len()
    }

    pub fn iter(&self) -> impl Iterator<Item = ByteRange> + '_ {
        self.known.iter()
    }

    pub fn zeroed_iter(&self) -> impl Iterator<Item = ByteRange> + '_ {
        self.zeroed.iter()
    }

    /// Number of disjoint known ranges.
    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }

    pub fn reset(&mut self) {
        self.known.clear();
        self.zeroed.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::{QuickCheck, TestResult};

    fn ranges(t: &ChunkTracker) -> Vec<(u64, u64)> {
        t.iter().map(|r| (r.start, r.end)).collect()
    }

    #[test]
    fn test_adjacent_ranges_merge() {
        let mut t = ChunkTracker::new(1000);
        t.mark_known(ByteRange::new(0, 99)).unwrap();
        t.mark_known(ByteRange::new(100, 199)).unwrap();
        assert_eq!(ranges(&t), vec![(0, 199)]);
        assert_eq!(t.total_known_bytes(), 200);
    }

    #[test]
    fn test_gap_is_preserved() {
        let mut t = ChunkTracker::new(1000);
        t.mark_known(ByteRange::new(0, 99)).unwrap();
        t.mark_known(ByteRange::new(150, 199)).unwrap();
        assert_eq!(ranges(&t), vec![(0, 99), (150, 199)]);
        assert_eq!(t.total_known_bytes(), 150);
    }

    #[test]
    fn test_bridge_merges_three_into_one() {
        let mut t = ChunkTracker::new(1000);
        t.mark_known(ByteRange::new(10, 19)).unwrap();
        t.mark_known(ByteRange::new(40, 49)).unwrap();
        t.mark_known(ByteRange::new(80, 89)).unwrap();
        t.mark_known(ByteRange::new(20, 39)).unwrap();
        assert_eq!(ranges(&t), vec![(10, 49), (80, 89)]);

        t.mark_known(ByteRange::new(5, 85)).unwrap();
        assert_eq!(ranges(&t), vec![(5, 89)]);
    }

    #[test]
    fn test_insert_inside_existing_is_noop() {
        let mut t = ChunkTracker::new(1000);
        t.mark_known(ByteRange::new(0, 500)).unwrap();
        t.mark_known(ByteRange::new(10, 20)).unwrap();
        assert_eq!(ranges(&t), vec![(0, 500)]);
    }

    #[test]
    fn test_rejects_bad_ranges_without_mutation() {
        let mut t = ChunkTracker::new(100);
        t.mark_known(ByteRange::new(0, 9)).unwrap();

        let err = t.mark_known(ByteRange::new(20, 10)).unwrap_err();
        assert!(matches!(err, DiskError::InvalidRange { start: 20, end: 10 }));

        let err = t.mark_known(ByteRange::new(90, 100)).unwrap_err();
        assert!(matches!(err, DiskError::InvalidRange { start: 90, end: 100 }));

        let err = t.mark_zeroed(ByteRange::new(100, 100)).unwrap_err();
        assert!(matches!(err, DiskError::InvalidRange { .. }));
        assert_eq!(t.zeroed_iter().count(), 0);

        assert_eq!(ranges(&t), vec![(0, 9)]);
    }

    #[test]
    fn test_write_punches_zeroed_set() {
        let mut t = ChunkTracker::new(1000);
        t.mark_zeroed(ByteRange::new(100, 199)).unwrap();
        t.mark_written(ByteRange::new(120, 129)).unwrap();

        let zeroed: Vec<_> = t.zeroed_iter().collect();
        assert_eq!(
            zeroed,
            vec![ByteRange::new(100, 119), ByteRange::new(130, 199)]
        );
        assert_eq!(ranges(&t), vec![(100, 199)]);
        assert_eq!(
            t.zeroed_in(ByteRange::new(110, 135)),
            vec![ByteRange::new(110, 119), ByteRange::new(130, 135)]
        );
    }

    #[test]
    fn test_reset_and_restartable_iter() {
        let mut t = ChunkTracker::new(1000);
        t.mark_known(ByteRange::new(1, 2)).unwrap();
        t.mark_known(ByteRange::new(9, 9)).unwrap();
        assert_eq!(t.iter().count(), 2);
        assert_eq!(t.iter().count(), 2);
        t.reset();
        assert!(t.is_empty());
        assert_eq!(t.total_known_bytes(), 0);
    }

    const CAP: u64 = 2048;

    fn normalize(a: u16, b: u16) -> (u64, u64) {
        let (a, b) = (a as u64 % CAP, b as u64 % CAP);
        (a.min(b), a.max(b))
    }

    fn invariants_hold(set: &RangeSet) -> bool {
        let v: Vec<ByteRange> = set.iter().collect();
        v.iter().all(|r| r.start <= r.end) && v.windows(2).all(|w| w[0].end + 1 < w[1].start)
    }

    #[test]
    fn prop_insert_keeps_disjoint_non_adjacent() {
        fn prop(ops: Vec<(u16, u16)>) -> TestResult {
            let mut set = RangeSet::new();
            let mut model = vec![false; CAP as usize];
            for &(a, b) in &ops {
                let (s, e) = normalize(a, b);
                set.insert(s, e);
                model[s as usize..=e as usize].iter_mut().for_each(|m| *m = true);
            }
            let covered = model.iter().filter(|m| **m).count() as u64;
            let every_byte = set.iter().all(|r| {
                model[r.start as usize..=r.end as usize].iter().all(|m| *m)
            });
            TestResult::from_bool(invariants_hold(&set) && set.total_len() == covered && every_byte)
        }
        QuickCheck::new()
            .tests(300)
            .quickcheck(prop as fn(Vec<(u16, u16)>) -> TestResult);
    }

    #[test]
    fn prop_remove_matches_model() {
        fn prop(ops: Vec<(bool, u16, u16)>) -> TestResult {
            let mut set = RangeSet::new();
            let mut model = vec![false; CAP as usize];
            for &(add, a, b) in &ops {
                let (s, e) = normalize(a, b);
                if add {
                    set.insert(s, e);
                } else {
                    set.remove(s, e);
                }
                model[s as usize..=e as usize].iter_mut().for_each(|m| *m = add);
            }
            let covered = model.iter().filter(|m| **m).count() as u64;
            TestResult::from_bool(invariants_hold(&set) && set.total_len() == covered)
        }
        QuickCheck::new()
            .tests(300)
            .quickcheck(prop as fn(Vec<(bool, u16, u16)>) -> TestResult);
    }
}
