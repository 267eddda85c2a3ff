//! LRU table recency property.
//!
//! After filling a tag, a later lookup misses exactly when at least `ways`
//! distinct other tags mapped to the same set in between.

use proptest::prelude::*;

use tracesim_core::common::lru_table::LruTable;

proptest! {
    #[test]
    fn recency_governs_eviction(ways in 1_usize..8, intervening in 0_usize..16) {
        let mut table = LruTable::new(1, ways);
        table.fill(0xBEEF, 0_u32);

        // Distinct tags, all landing in the single set.
        for i in 0..intervening {
            table.fill(0x1000 + i as u64, 1_u32);
        }

        let hit = table.check_hit(0xBEEF).is_some();
        prop_assert_eq!(hit, intervening < ways, "ways={} intervening={}", ways, intervening);
    }

    #[test]
    fn hits_refresh_recency(ways in 2_usize..8) {
        let mut table = LruTable::new(1, ways);
        table.fill(0xA, 0_u32);

        // Keep touching A while filling ways-1 other tags repeatedly; A must
        // survive arbitrarily many fills as long as it stays most recent.
        for round in 0..4 {
            for i in 0..(ways - 1) {
                table.fill(0x100 + (round * 8 + i) as u64, 0_u32);
                prop_assert!(table.check_hit(0xA).is_some(), "round {} fill {}", round, i);
            }
        }
    }
}

#[test]
fn duplicate_fills_do_not_duplicate_entries() {
    let mut table = LruTable::new(1, 2);
    table.fill(0x1, 10_u32);
    table.fill(0x1, 11_u32);
    table.fill(0x2, 20_u32);
    // If 0x1 occupied both ways, 0x2 would have evicted one of them and
    // both of these would still hit; a third tag must evict the older one.
    assert_eq!(table.check_hit(0x1), Some(11));
    assert_eq!(table.check_hit(0x2), Some(20));
    table.fill(0x3, 30_u32);
    assert!(table.check_hit(0x1).is_none());
}
