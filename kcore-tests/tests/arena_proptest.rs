//! Property-based check of `RangeArena`'s core invariant (§8 testable
//! property #1): after any sequence of allocations and frees, free units
//! plus allocated units always equals the span total, and no two live
//! allocations overlap. `scenarios.rs` exercises a handful of hand-picked
//! sequences; this sweeps many random ones instead.

use proptest::prelude::*;

use kcore::mm::arena::RangeArena;

use kcore_tests::support;

#[derive(Debug, Clone, Copy)]
enum Op {
    Alloc(u64),
    FreeOldest,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1u64..=256).prop_map(Op::Alloc),
        Just(Op::FreeOldest),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn arena_stays_consistent_under_random_alloc_free(ops in prop::collection::vec(op_strategy(), 1..200)) {
        let _guard = support::serialize();
        support::install();

        let arena = RangeArena::new(1, 0);
        arena.add(0, 1 << 20).unwrap();

        let mut live: Vec<(u64, u64)> = Vec::new();
        for op in ops {
            match op {
                Op::Alloc(count) => {
                    if let Ok(base) = arena.alloc(count, false) {
                        for &(b, c) in &live {
                            let a_end = base + count;
                            let b_end = b + c;
                            prop_assert!(base >= b_end || a_end <= b, "overlap: [{}, {}) vs [{}, {})", base, a_end, b, b_end);
                        }
                        live.push((base, count));
                    }
                }
                Op::FreeOldest => {
                    if !live.is_empty() {
                        let (base, count) = live.remove(0);
                        arena.free(base, count);
                    }
                }
            }

            let stats = arena.stats();
            prop_assert_eq!(stats.free_units + stats.allocated_units, stats.total_units);
        }

        for (base, count) in live {
            arena.free(base, count);
        }
        let stats = arena.stats();
        prop_assert_eq!(stats.allocated_units, 0);
        prop_assert_eq!(stats.free_units, stats.total_units);
    }
}
