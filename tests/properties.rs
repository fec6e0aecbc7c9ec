//! Property-based tests for rank sets and the timemap cache

use std::collections::BTreeSet;

use proptest::prelude::*;
use waitcause::defs::CallpathId;
use waitcause::timemap::TimemapCache;
use waitcause::trace::EventId;
use waitcause::{RankSet, SynchpointDetector, SynchpointInfo};

#[derive(Debug, Clone)]
enum Op {
    Insert(usize),
    Erase(usize),
    Fill,
    Clear,
}

fn op(size: usize) -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => (0..size).prop_map(Op::Insert),
        3 => (0..size).prop_map(Op::Erase),
        1 => Just(Op::Fill),
        1 => Just(Op::Clear),
    ]
}

fn sized_ops() -> impl Strategy<Value = (usize, Vec<Op>)> {
    (1usize..300).prop_flat_map(|size| (Just(size), prop::collection::vec(op(size), 0..80)))
}

proptest! {
    #[test]
    fn prop_rankset_matches_btreeset((size, ops) in sized_ops()) {
        let mut set = RankSet::new(size);
        let mut model = BTreeSet::new();
        for op in ops {
            match op {
                Op::Insert(r) => prop_assert_eq!(set.insert(r), model.insert(r)),
                Op::Erase(r) => prop_assert_eq!(set.erase(r), model.remove(&r)),
                Op::Fill => {
                    set.fill();
                    model = (0..size).collect();
                }
                Op::Clear => {
                    set.clear();
                    model.clear();
                }
            }
            prop_assert_eq!(set.len(), model.len());
            prop_assert_eq!(set.is_empty(), model.is_empty());
            prop_assert_eq!(set.is_full(), model.len() == size);
        }
        prop_assert_eq!(set.iter().collect::<Vec<_>>(), model.into_iter().collect::<Vec<_>>());
    }

    #[test]
    fn prop_intersection_is_subset(
        size in 1usize..200,
        a in prop::collection::vec(0usize..200, 0..60),
        b in prop::collection::vec(0usize..200, 0..60),
    ) {
        let a = RankSet::from_ranks(size, a.into_iter().filter(|&r| r < size));
        let b = RankSet::from_ranks(size, b.into_iter().filter(|&r| r < size));
        let both = a.intersection(&b);
        prop_assert!(a.is_superset(&both));
        prop_assert!(b.is_superset(&both));

        let mut union = a.clone();
        union.union_with(&b);
        prop_assert!(union.is_superset(&a));
        prop_assert!(union.is_superset(&b));
        prop_assert_eq!(union.len() + both.len(), a.len() + b.len());
    }

    #[test]
    fn prop_fill_then_erase_leaves_the_rest(size in 1usize..300, k in 0usize..300) {
        let k = k % size;
        let mut set = RankSet::new(size);
        set.fill();
        set.erase(k);
        prop_assert!(!set.contains(k));
        for j in (0..size).filter(|&j| j != k) {
            prop_assert!(set.contains(j));
        }
    }

    #[test]
    fn prop_superset_is_reflexive(size in 1usize..200, ranks in prop::collection::vec(0usize..200, 0..60)) {
        let set = RankSet::from_ranks(size, ranks.into_iter().filter(|&r| r < size));
        prop_assert!(set.is_superset(&set));
        prop_assert!(set.is_superset(&RankSet::new(size)));
        prop_assert!(RankSet::full(size).is_superset(&set));
    }

    /// Records between two synchpoints split at any synchpoint in between
    #[test]
    fn prop_synchpoints_between_partition(
        events in prop::collection::btree_set(0usize..200, 3..30),
        picks in prop::collection::vec(any::<prop::sample::Index>(), 3),
    ) {
        let mut detector = SynchpointDetector::new(0, 4);
        for &e in &events {
            detector
                .record(EventId(e), SynchpointInfo::new(e as f64 * 0.5, 0.0, e as f64), RankSet::full(4))
                .unwrap();
        }
        let ids: Vec<EventId> = events.iter().map(|&e| EventId(e)).collect();
        let mut cut: Vec<usize> = picks.iter().map(|p| p.index(ids.len())).collect();
        cut.sort_unstable();
        let (a, b, c) = (ids[cut[0]], ids[cut[1]], ids[cut[2]]);

        let whole = detector.between(Some(a), Some(c)).unwrap();
        let mut parts = detector.between(Some(a), Some(b)).unwrap();
        parts.extend(detector.between(Some(b), Some(c)).unwrap());
        prop_assert_eq!(whole, parts);
    }

    #[test]
    fn prop_words_roundtrip_preserves_members(
        size in 1usize..500,
        ranks in prop::collection::vec(0usize..500, 0..100),
    ) {
        let set = RankSet::from_ranks(size, ranks.into_iter().filter(|&r| r < size));
        let back = RankSet::from_words(size, set.to_words());
        prop_assert_eq!(back.iter().collect::<Vec<_>>(), set.iter().collect::<Vec<_>>());
    }

    /// Splitting the log at any flushed synchpoint preserves per-node totals
    #[test]
    fn prop_timemap_split_is_additive(
        steps in prop::collection::vec((0.0f64..5.0, 0u32..4, any::<bool>()), 1..40),
        split in any::<prop::sample::Index>(),
    ) {
        let mut cache = TimemapCache::new();
        let mut time = 0.0;
        let mut flushed = Vec::new();
        cache.on_enter(time, None);
        for (i, (dt, cnode, flush)) in steps.iter().enumerate() {
            let cnode = CallpathId(*cnode);
            cache.on_enter(time, Some(CallpathId(99)));
            time += dt;
            cache.on_leave(time, cnode);
            if *flush {
                let event = EventId(i);
                cache.flush(event);
                flushed.push(event);
            }
        }
        cache.finish();

        let whole = cache.runtimes(None, None).unwrap();
        if !flushed.is_empty() {
            let at = flushed[split.index(flushed.len())];
            let head = cache.runtimes(None, Some(at)).unwrap();
            let tail = cache.runtimes(Some(at), None).unwrap();
            for (cnode, total) in &whole {
                let parts = head.get(cnode).copied().unwrap_or(0.0) + tail.get(cnode).copied().unwrap_or(0.0);
                prop_assert!((parts - total).abs() < 1e-9);
            }
        }
        let sum: f64 = whole.values().sum();
        prop_assert!((sum - time).abs() < 1e-9);
    }
}
