//! Page-table walker scenarios: full walks and PSCL-accelerated walks.

use std::cell::RefCell;
use std::rc::Rc;

use tracesim_core::channel::{Channel, ChannelRef, Request, Response};
use tracesim_core::common::addr::Address;
use tracesim_core::common::chrono::{Picos, TimePoint};
use tracesim_core::common::constants::LOG2_PAGE_SIZE;
use tracesim_core::ptw::vmem::VirtualMemory;
use tracesim_core::ptw::{PageTableWalker, PtwParams};

const PERIOD: Picos = Picos(250);

struct PtwHarness {
    ptw: PageTableWalker,
    upper: ChannelRef,
    lower: ChannelRef,
    now: TimePoint,
    lower_reads: u64,
}

impl PtwHarness {
    fn new(pt_levels: usize, pscl_dims: Vec<(usize, usize)>) -> Self {
        let upper = Channel::new_ref(16, 16, 16, LOG2_PAGE_SIZE, false);
        let lower = Channel::new_ref(16, 16, 16, 6, false);
        let vmem = Rc::new(RefCell::new(VirtualMemory::new(pt_levels, 0)));
        let ptw = PageTableWalker::new(
            PtwParams {
                name: "test_PTW".to_string(),
                cpu: 0,
                pscl_dims,
                mshr_size: 8,
                max_read: 2,
                max_fill: 2,
                hit_latency: 1,
                period: PERIOD,
            },
            vec![upper.clone()],
            lower.clone(),
            vmem,
        );
        Self {
            ptw,
            upper,
            lower,
            now: TimePoint::ZERO,
            lower_reads: 0,
        }
    }

    fn translate(&self, vaddr: u64) -> Request {
        Request {
            address: Address::from(vaddr),
            v_address: Address::from(vaddr),
            response_requested: true,
            ..Request::default()
        }
    }

    /// One tick: service every pending PTE read, then operate the walker.
    fn tick(&mut self) {
        let reads: Vec<Request> = {
            let mut ch = self.lower.borrow_mut();
            let mut out = Vec::new();
            while let Some(req) = ch.pop_rq() {
                out.push(req);
            }
            out
        };
        for req in reads {
            self.lower_reads += 1;
            self.lower.borrow_mut().returned.push_back(Response {
                address: req.address,
                v_address: req.v_address,
                ..Response::default()
            });
        }

        self.ptw
            .operate(self.now)
            .unwrap_or_else(|e| panic!("ptw error: {e}"));
        self.now += PERIOD;
    }

    /// Runs a translation to completion, returning (PTE reads, ticks).
    fn run_walk(&mut self, vaddr: u64) -> (u64, u64) {
        let reads_before = self.lower_reads;
        assert!(self.upper.borrow_mut().add_rq(self.translate(vaddr)));
        for tick in 0..200 {
            if !self.upper.borrow().returned.is_empty() {
                let _ = self.upper.borrow_mut().returned.pop_front();
                return (self.lower_reads - reads_before, tick);
            }
            self.tick();
        }
        panic!("walk did not complete");
    }
}

/// A cold walk reads one PTE per level.
#[test]
fn cold_walk_touches_every_level() {
    let mut h = PtwHarness::new(3, vec![(1, 2), (1, 2)]);
    let (reads, _) = h.run_walk(0xAAAA_0000);
    assert_eq!(reads, 3);
}

/// A second translation under the same directory entries resumes from the
/// deepest PSCL and performs only the leaf read.
#[test]
fn pscl_skips_shared_levels() {
    let mut h = PtwHarness::new(3, vec![(1, 2), (1, 2)]);

    let (first_reads, first_ticks) = h.run_walk(0xAAAA_0000);
    assert_eq!(first_reads, 3);

    // Same page directories, different page (bit 12).
    let (second_reads, second_ticks) = h.run_walk(0xAAAA_1000);
    assert_eq!(second_reads, 1, "only the final-level lookup remains");
    assert!(
        second_ticks < first_ticks,
        "skipped levels must shorten the walk"
    );
}

/// An unrelated address shares no PSCL entries and walks in full.
#[test]
fn unrelated_address_walks_in_full() {
    let mut h = PtwHarness::new(3, vec![(1, 2), (1, 2)]);
    let _ = h.run_walk(0xAAAA_0000);
    // Different bits at every level above the leaf.
    let (reads, _) = h.run_walk(0x5555_5555_0000);
    assert_eq!(reads, 3);
}

/// Responses for distinct in-flight walks resolve by block address.
#[test]
fn concurrent_walks_do_not_cross() {
    let mut h = PtwHarness::new(3, vec![(1, 2), (1, 2)]);

    assert!(h.upper.borrow_mut().add_rq(h.translate(0x1111_0000)));
    assert!(h.upper.borrow_mut().add_rq(h.translate(0x2222_0000)));

    let mut responses = 0;
    for _ in 0..300 {
        responses += h.upper.borrow_mut().returned.drain(..).count();
        if responses == 2 {
            break;
        }
        h.tick();
    }
    assert_eq!(responses, 2);
}
