//! Cache scenarios: miss/fill/hit timing, MSHR merging, and the
//! single-copy fill invariant.

use pretty_assertions::assert_eq;

use tracesim_core::cache::prefetch::{NextLine, Prefetcher};
use tracesim_core::channel::AccessType;
use tracesim_core::common::addr::Address;

use crate::common::CacheHarness;

/// A load misses, the lower level answers after a delay, and an identical
/// later load hits at the hit latency.
#[test]
fn load_hits_after_fill() {
    let mut h = CacheHarness::new(1, 1, 4, 1);

    assert!(h.upper.borrow_mut().add_rq(h.load(0x4000, 1)));

    // The miss reaches the lower level only after the tag check.
    let mut ticks_to_lower = 0;
    while h.lower.borrow().rq_occupancy() == 0 {
        h.tick();
        ticks_to_lower += 1;
        assert!(ticks_to_lower < 100, "miss never forwarded");
    }
    assert!(ticks_to_lower >= 4, "tag check must wait out the hit latency");
    let forwarded = h.drain_lower_reads();
    assert_eq!(forwarded.len(), 1);
    assert_eq!(forwarded[0].address.value(), 0x4000);

    // Lower level takes 10 ticks to answer.
    h.respond_later(0x4000, 10);
    let waited = h.ticks_until_response(100).expect("fill response");
    assert!(waited >= 10, "total miss latency must cover the lower level");
    let resp = h.upper.borrow_mut().returned.pop_front().unwrap();
    assert_eq!(resp.address.value(), 0x4000);

    // 100 ticks later, the same load hits without touching the lower level.
    for _ in 0..100 {
        h.tick();
    }
    assert!(h.upper.borrow_mut().add_rq(h.load(0x4000, 2)));
    let waited = h.ticks_until_response(100).expect("hit response");
    assert_eq!(waited, 5, "hit latency plus the accept tick");
    assert_eq!(h.lower.borrow().rq_occupancy(), 0);

    let (hits, misses) = h.cache.sim_stats.total_for(AccessType::Load);
    assert_eq!((hits, misses), (1, 1));
}

/// Two loads to one block, a tick apart, issue one lower-level read and
/// complete together.
#[test]
fn mshr_merges_same_block_misses() {
    let mut h = CacheHarness::new(4, 2, 1, 1);

    assert!(h.upper.borrow_mut().add_rq(h.load(0x4000, 1)));
    h.tick();
    h.tick(); // first miss reaches the MSHR
    assert!(h.upper.borrow_mut().add_rq(h.load(0x4020, 2))); // same block

    for _ in 0..6 {
        h.tick();
    }

    let forwarded = h.drain_lower_reads();
    assert_eq!(forwarded.len(), 1, "exactly one lower-level read");
    assert_eq!(h.cache.sim_stats.mshr_merge, 1);

    h.respond_later(0x4000, 2);
    let _ = h.ticks_until_response(50).expect("merged response");

    // One response serves both loads: the dependency list carries both ids.
    let resp = h.upper.borrow_mut().returned.pop_front().unwrap();
    assert_eq!(resp.instr_depend_on_me, vec![1, 2]);
    assert!(h.upper.borrow().returned.is_empty());
}

/// At any time a block address occupies at most one way of its set.
#[test]
fn fill_invariant_single_copy() {
    let mut h = CacheHarness::new(1, 4, 1, 1);

    // Fill the same block twice with re-requests racing the fill.
    for round in 0..3 {
        assert!(h.upper.borrow_mut().add_rq(h.load(0x7000, round)));
        for _ in 0..4 {
            h.tick();
        }
        for req in h.drain_lower_reads() {
            h.respond_later(req.address.value(), 1);
        }
        for _ in 0..4 {
            h.tick();
        }
        let _ = h.upper.borrow_mut().returned.drain(..).count();
    }

    // Populate the rest of the set, then re-check.
    for (i, addr) in [0x8000_u64, 0x9000, 0xA000].iter().enumerate() {
        assert!(h.upper.borrow_mut().add_rq(h.load(*addr, 10 + i as u64)));
        for _ in 0..4 {
            h.tick();
        }
        for req in h.drain_lower_reads() {
            h.respond_later(req.address.value(), 1);
        }
        for _ in 0..4 {
            h.tick();
        }
    }

    assert!(h.cache.probe_block(Address::from(0x7000)).is_some());
    // probe_block finding one copy plus all other addresses present means no
    // way was double-filled in a 4-way set holding 4 distinct blocks.
    for addr in [0x8000_u64, 0x9000, 0xA000] {
        assert!(h.cache.probe_block(Address::from(addr)).is_some(), "{addr:#x} evicted");
    }
}

/// A prefetched block counts useful on its first demand hit.
#[test]
fn prefetch_useful_accounting() {
    let mut h = CacheHarness::with_params(
        1,
        2,
        1,
        1,
        16,
        Prefetcher::NextLine(NextLine::new(1)),
    );

    // Demand load of 0x1000 prefetches 0x1040 into the other way.
    assert!(h.upper.borrow_mut().add_rq(h.load(0x1000, 1)));
    for _ in 0..4 {
        h.tick();
    }
    for req in h.drain_lower_reads() {
        h.respond_later(req.address.value(), 1);
    }
    for _ in 0..6 {
        h.tick();
    }
    assert_eq!(h.cache.sim_stats.pf_issued, 1);
    assert!(h.cache.probe_block(Address::from(0x1040)).is_some());

    // Demanding the prefetched block marks it useful.
    assert!(h.upper.borrow_mut().add_rq(h.load(0x1040, 2)));
    for _ in 0..4 {
        h.tick();
    }
    assert_eq!(h.cache.sim_stats.pf_useful, 1);
}
