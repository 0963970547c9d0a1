//! Random interleavings of split/merge must always leave the live segment
//! set as an exact partition of the hash space: every routing key matches
//! exactly one live segment, and no two live segments overlap.

use proptest::prelude::*;
use psep::Segment;

#[derive(Clone, Copy, Debug)]
enum Op {
    Split(usize),
    Merge(usize),
}

fn ops() -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(
        (prop::bool::ANY, any::<usize>()).prop_map(|(split, idx)| {
            if split {
                Op::Split(idx)
            } else {
                Op::Merge(idx)
            }
        }),
        0..64,
    )
}

const UNIVERSE: u64 = 8192;

fn assert_is_partition(segments: &[Segment]) {
    for key in 0..UNIVERSE {
        let matches: Vec<&Segment> = segments.iter().filter(|s| s.matches(key)).collect();
        assert_eq!(
            matches.len(),
            1,
            "routing key {key} matched {} segments: {:?}",
            matches.len(),
            matches
        );
    }
}

proptest! {
    #[test]
    fn live_segments_always_partition_the_hash_space(ops in ops()) {
        let mut live = vec![Segment::whole()];

        for op in ops {
            match op {
                Op::Split(idx) => {
                    if live.is_empty() {
                        continue;
                    }
                    let i = idx % live.len();
                    let target = live.remove(i);
                    let (a, b) = target.split();
                    live.push(a);
                    live.push(b);
                }
                Op::Merge(idx) => {
                    if live.len() < 2 {
                        continue;
                    }
                    let i = idx % live.len();
                    let candidate = live[i];
                    let sibling_id = candidate.sibling_id();
                    if let Some(j) = live.iter().position(|s| s.id == sibling_id && s.mask == candidate.mask) {
                        let (lo, hi) = if i < j { (i, j) } else { (j, i) };
                        let b = live.remove(hi);
                        let a = live.remove(lo);
                        if let Some(merged) = a.merge_with(&b) {
                            live.push(merged);
                        } else {
                            live.push(a);
                            live.push(b);
                        }
                    }
                }
            }
            assert_is_partition(&live);
        }
    }

    #[test]
    fn initial_partition_is_always_a_partition(count in 1u32..64) {
        let segments = psep::segment::initial_partition(count);
        prop_assert_eq!(segments.len(), count as usize);
        assert_is_partition(&segments);
    }
}
