//! DRAM scenarios: row-buffer reuse, write-mode batching, and the
//! mode-exclusivity invariant.

use tracesim_core::channel::{AccessType, Channel, ChannelRef, Request};
use tracesim_core::common::addr::Address;
use tracesim_core::common::chrono::{Picos, TimePoint};
use tracesim_core::common::constants::LOG2_BLOCK_SIZE;
use tracesim_core::dram::{DramParams, MemoryController};

const PERIOD: Picos = Picos(1000);
const T_RP: Picos = Picos(2000);
const T_RCD: Picos = Picos(2000);
const T_CAS: Picos = Picos(2000);

struct DramHarness {
    dram: MemoryController,
    upper: ChannelRef,
    now: TimePoint,
}

impl DramHarness {
    fn new(wq_size: usize) -> Self {
        let upper = Channel::new_ref(64, 64, 64, LOG2_BLOCK_SIZE, false);
        let dram = MemoryController::new(
            &DramParams {
                channels: 1,
                ranks: 1,
                banks: 1,
                rows: 4,
                columns: 4,
                channel_width: 8,
                rq_size: 16,
                wq_size,
                t_rp: T_RP,
                t_rcd: T_RCD,
                t_cas: T_CAS,
                // Effectively never refresh during these tests.
                refresh_period: Picos(1_000_000_000_000),
                rows_per_refresh: 1,
                turnaround: Picos(2000),
                period: PERIOD,
            },
            vec![upper.clone()],
        );
        Self {
            dram,
            upper,
            now: TimePoint::ZERO,
        }
    }

    fn read(&self, addr: u64) -> Request {
        Request {
            address: Address::from(addr),
            v_address: Address::from(addr),
            ty: AccessType::Load,
            is_translated: true,
            response_requested: true,
            ..Request::default()
        }
    }

    fn write(&self, addr: u64) -> Request {
        Request {
            ty: AccessType::Write,
            response_requested: false,
            ..self.read(addr)
        }
    }

    fn tick(&mut self) {
        self.dram
            .operate(self.now)
            .unwrap_or_else(|e| panic!("dram error: {e}"));
        self.now += PERIOD;
    }

    /// Ticks until the upper channel holds a response; returns the count.
    fn ticks_until_response(&mut self, limit: u64) -> u64 {
        for i in 0..limit {
            if !self.upper.borrow().returned.is_empty() {
                return i;
            }
            self.tick();
        }
        panic!("no response within {limit} ticks");
    }
}

/// Back-to-back reads to one row: the second skips the row activation.
#[test]
fn row_buffer_hit_skips_activation() {
    let mut h = DramHarness::new(16);

    assert!(h.upper.borrow_mut().add_rq(h.read(0x000)));
    let first = h.ticks_until_response(200);
    let _ = h.upper.borrow_mut().returned.pop_front();

    // Same row (bits 8..10), different column (bits 6..8).
    assert!(h.upper.borrow_mut().add_rq(h.read(0x040)));
    let second = h.ticks_until_response(200);

    let rcd_ticks = T_RCD.as_picos() / PERIOD.as_picos();
    assert_eq!(
        first - second,
        rcd_ticks,
        "open row should save exactly the activation delay"
    );

    let stats = &h.dram.channels()[0].sim_stats;
    assert_eq!(stats.rq_row_buffer_miss, 1);
    assert_eq!(stats.rq_row_buffer_hit, 1);
}

/// A row closed by an intervening access pays precharge plus activation.
#[test]
fn row_conflict_pays_precharge() {
    let mut h = DramHarness::new(16);

    assert!(h.upper.borrow_mut().add_rq(h.read(0x000)));
    let _ = h.ticks_until_response(200);
    let _ = h.upper.borrow_mut().returned.pop_front();

    // Different row in the same bank: row 1 at bit 8.
    assert!(h.upper.borrow_mut().add_rq(h.read(0x100)));
    let _ = h.ticks_until_response(200);

    let stats = &h.dram.channels()[0].sim_stats;
    assert_eq!(stats.rq_row_buffer_hit, 0);
    assert_eq!(stats.rq_row_buffer_miss, 2);
}

/// Filling the write queue past the high watermark enters write mode, and
/// no read is serviced until the drain finishes.
#[test]
fn write_watermark_switches_mode() {
    let mut h = DramHarness::new(8);

    // One read sits in the queue the whole time.
    assert!(h.upper.borrow_mut().add_rq(h.read(0x000)));

    // 7/8 occupancy reaches the high watermark.
    for i in 0..7 {
        assert!(h.upper.borrow_mut().add_wq(h.write(0x1000 + i * 0x40)));
    }

    h.tick(); // requests reach the channel queues
    h.tick(); // occupancy check flips the mode
    assert!(h.dram.channels()[0].is_write_mode());

    // While in write mode no read goes on the bus.
    for _ in 0..10 {
        h.tick();
        let stats = &h.dram.channels()[0].sim_stats;
        if h.dram.channels()[0].is_write_mode() {
            assert_eq!(stats.rq_row_buffer_hit + stats.rq_row_buffer_miss, 0);
            assert!(h.upper.borrow().returned.is_empty());
        }
    }

    // The writes drain below the low watermark, the mode flips back, and
    // the read completes.
    for _ in 0..300 {
        if !h.upper.borrow().returned.is_empty() {
            break;
        }
        h.tick();
    }
    assert_eq!(h.upper.borrow().returned.len(), 1);
    let stats = &h.dram.channels()[0].sim_stats;
    assert!(stats.wq_row_buffer_hit + stats.wq_row_buffer_miss >= 1);
    assert_eq!(stats.rq_row_buffer_hit + stats.rq_row_buffer_miss, 1);
}

/// Writes beyond the queue capacity are rejected and counted.
#[test]
fn wq_full_is_counted() {
    let mut h = DramHarness::new(2);

    for i in 0..4 {
        assert!(h.upper.borrow_mut().add_wq(h.write(0x2000 + i * 0x40)));
    }
    // Only two fit in the channel write queue; the rest wait upstream and
    // each refused attempt counts.
    h.tick();
    assert!(h.dram.channels()[0].sim_stats.wq_full >= 1);
    assert_eq!(h.upper.borrow().wq_occupancy(), 2);
}
