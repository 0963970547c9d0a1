//! Segment identity, partitioning and split/merge mask arithmetic
//! (spec.md §3 "Segment").

/// A partition of the event stream's hash space, identified by `(id, mask)`.
///
/// Invariant: the set of live segments' `(id, mask)` pairs forms a
/// partition of the full hash space — every routing key matches exactly one
/// live segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Segment {
    pub id: u64,
    pub mask: u64,
}

impl Segment {
    pub fn new(id: u64, mask: u64) -> Self {
        Segment { id, mask }
    }

    /// The single segment covering the entire hash space.
    pub fn whole() -> Self {
        Segment { id: 0, mask: 0 }
    }

    /// `true` iff `routing_key` falls within this segment's subtree.
    pub fn matches(&self, routing_key: u64) -> bool {
        (routing_key & self.mask) == (self.id & self.mask)
    }

    /// Split this segment by extending its mask by one bit, producing two
    /// sibling segments. `self.id` is retained by the first sibling.
    pub fn split(&self) -> (Segment, Segment) {
        let new_mask = (self.mask << 1) | 1;
        let sibling_id = self.id | (self.mask + 1);
        (
            Segment::new(self.id, new_mask),
            Segment::new(sibling_id, new_mask),
        )
    }

    /// Merge `self` with `sibling` by removing one mask bit. The resulting
    /// segment keeps the lower of the two ids, per spec.md §3.
    ///
    /// Returns `None` if the two segments are not actually siblings (same
    /// mask, ids differing only in the top bit).
    pub fn merge_with(&self, sibling: &Segment) -> Option<Segment> {
        if self.mask != sibling.mask || self.mask == 0 {
            return None;
        }
        let new_mask = self.mask >> 1;
        if self.id & new_mask != sibling.id & new_mask {
            return None;
        }
        let lower_id = self.id.min(sibling.id);
        Some(Segment::new(lower_id, new_mask))
    }

    /// The id of this segment's sibling under its current mask: the other
    /// half produced if this segment's parent were split.
    pub fn sibling_id(&self) -> u64 {
        self.id ^ (self.mask + 1)
    }
}

/// Build the initial partition of `count` segments covering the whole hash
/// space.
///
/// For `count` not a power of two there is no single mask width that works
/// for every id, so ids are split into three contiguous ranges around
/// `h = 2^(k-1)` (the largest power of two below `count`, for `k` the
/// smallest integer with `2^k >= count`): ids `< count - h` and ids `>= h`
/// take the `k`-bit mask, and the ids in between take the `k-1`-bit mask.
/// This is the unique way to cover the hash space exactly once per id for
/// arbitrary `count` using only masks of the `2^j - 1` form `matches`
/// relies on; see `compute_segment_mask` for the derivation.
pub fn initial_partition(count: u32) -> Vec<Segment> {
    assert!(count > 0, "initial segment count must be > 0");
    (0..count as u64)
        .map(|id| Segment::new(id, compute_segment_mask(id, count as u64)))
        .collect()
}

fn compute_segment_mask(segment_id: u64, number_of_segments: u64) -> u64 {
    if number_of_segments <= 1 {
        return 0;
    }
    let mut k = 0u32;
    while (1u64 << k) < number_of_segments {
        k += 1;
    }
    let half = 1u64 << (k - 1);
    let full_mask = (1u64 << k) - 1;
    let half_mask = half - 1;
    if segment_id < number_of_segments - half || segment_id >= half {
        full_mask
    } else {
        half_mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn assert_partition(segments: &[Segment], universe: u64) {
        let mut owners: Vec<Option<u64>> = vec![None; universe as usize];
        for key in 0..universe {
            let matching: Vec<&Segment> = segments.iter().filter(|s| s.matches(key)).collect();
            assert_eq!(
                matching.len(),
                1,
                "routing key {key} must match exactly one segment, matched {:?}",
                matching
            );
            owners[key as usize] = Some(matching[0].id);
        }
        assert!(owners.iter().all(|o| o.is_some()));
    }

    #[test]
    fn whole_space_matches_everything() {
        let whole = Segment::whole();
        for key in 0..64 {
            assert!(whole.matches(key));
        }
    }

    #[test]
    fn split_produces_disjoint_covering_siblings() {
        let whole = Segment::whole();
        let (a, b) = whole.split();
        assert_partition(&[a, b], 4096);
    }

    #[test]
    fn split_twice_produces_four_way_partition() {
        let whole = Segment::whole();
        let (a, b) = whole.split();
        let (a0, a1) = a.split();
        assert_partition(&[a0, a1, b], 4096);
    }

    #[test]
    fn merge_is_inverse_of_split() {
        let whole = Segment::whole();
        let (a, b) = whole.split();
        let merged = a.merge_with(&b).expect("siblings should merge");
        assert_eq!(merged, whole);
    }

    #[test]
    fn merge_rejects_non_siblings() {
        let whole = Segment::whole();
        let (a, b) = whole.split();
        let (a0, a1) = a.split();
        // a1 and b are not siblings (different masks).
        assert!(a1.merge_with(&b).is_none());
        let merged = a0.merge_with(&a1).unwrap();
        assert_eq!(merged, a);
    }

    #[test]
    fn initial_partition_covers_power_of_two_counts() {
        for count in [1u32, 2, 4, 8, 16] {
            let segments = initial_partition(count);
            assert_eq!(segments.len(), count as usize);
            let ids: HashSet<u64> = segments.iter().map(|s| s.id).collect();
            assert_eq!(ids.len(), count as usize);
            assert_partition(&segments, 4096);
        }
    }

    #[test]
    fn initial_partition_covers_non_power_of_two_counts() {
        for count in [3u32, 5, 7, 11] {
            let segments = initial_partition(count);
            assert_eq!(segments.len(), count as usize);
            assert_partition(&segments, 4096);
        }
    }
}
