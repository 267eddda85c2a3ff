//! Shared test fixtures.
//!
//! The harnesses here stand in for the rest of the hierarchy: a cache under
//! test gets real channels on both sides, with the test driving the upper
//! side and scripting the lower side's responses.

use tracesim_core::cache::prefetch::Prefetcher;
use tracesim_core::cache::replacement::Replacement;
use tracesim_core::cache::{Cache, CacheParams};
use tracesim_core::channel::{AccessType, Channel, ChannelRef, Request, Response};
use tracesim_core::common::addr::Address;
use tracesim_core::common::chrono::{Picos, TimePoint};
use tracesim_core::common::constants::LOG2_BLOCK_SIZE;

/// One core-clock period used by the fixtures.
pub const PERIOD: Picos = Picos(250);

/// Installs a subscriber once so `RUST_LOG=trace` surfaces component events
/// from failing tests.
pub fn init_tracing() {
    use std::sync::Once;
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A cache wired to a test-driven upper channel and a scripted lower level.
pub struct CacheHarness {
    /// The cache under test.
    pub cache: Cache,
    /// The channel the test pushes requests into.
    pub upper: ChannelRef,
    /// The channel whose read/prefetch queues the test services.
    pub lower: ChannelRef,
    /// Current virtual time.
    pub now: TimePoint,
    /// Responses scheduled to arrive at a future tick.
    pending: Vec<(TimePoint, Response)>,
}

impl CacheHarness {
    /// Builds a harness around a cache with the given geometry and latency.
    pub fn new(sets: usize, ways: usize, hit_latency: u64, fill_latency: u64) -> Self {
        Self::with_params(sets, ways, hit_latency, fill_latency, 32, Prefetcher::None)
    }

    /// Builds a harness with an explicit MSHR size and prefetcher.
    pub fn with_params(
        sets: usize,
        ways: usize,
        hit_latency: u64,
        fill_latency: u64,
        mshr_size: usize,
        prefetcher: Prefetcher,
    ) -> Self {
        let upper = Channel::new_ref(32, 32, 32, LOG2_BLOCK_SIZE, false);
        let lower = Channel::new_ref(32, 32, 32, LOG2_BLOCK_SIZE, false);
        let cache = Cache::new(
            CacheParams {
                name: "test_cache".to_string(),
                sets,
                ways,
                mshr_size,
                hit_latency,
                fill_latency,
                max_tag: 8,
                max_fill: 8,
                offset_bits: LOG2_BLOCK_SIZE,
                prefetch_as_load: false,
                match_offset_bits: false,
                virtual_prefetch: false,
                pref_activate: vec![AccessType::Load, AccessType::Rfo],
                period: PERIOD,
                num_cpus: 1,
            },
            vec![upper.clone()],
            lower.clone(),
            None,
            Replacement::lru(sets, ways),
            prefetcher,
        );
        Self {
            cache,
            upper,
            lower,
            now: TimePoint::ZERO,
            pending: Vec::new(),
        }
    }

    /// A translated demand load.
    pub fn load(&self, addr: u64, instr_id: u64) -> Request {
        Request {
            address: Address::from(addr),
            v_address: Address::from(addr),
            instr_id,
            ty: AccessType::Load,
            is_translated: true,
            response_requested: true,
            instr_depend_on_me: vec![instr_id],
            ..Request::default()
        }
    }

    /// A translated write.
    pub fn write(&self, addr: u64, instr_id: u64) -> Request {
        Request {
            ty: AccessType::Write,
            response_requested: false,
            ..self.load(addr, instr_id)
        }
    }

    /// Schedules a response to arrive `delay_ticks` from now.
    pub fn respond_later(&mut self, addr: u64, delay_ticks: u64) {
        let at = self.now + PERIOD * delay_ticks;
        self.pending.push((
            at,
            Response {
                address: Address::from(addr),
                v_address: Address::from(addr),
                ..Response::default()
            },
        ));
    }

    /// Advances one tick, delivering any due scripted responses first.
    pub fn tick(&mut self) {
        let now = self.now;
        let mut due = Vec::new();
        self.pending.retain(|(at, resp)| {
            if *at <= now {
                due.push(resp.clone());
                false
            } else {
                true
            }
        });
        for resp in due {
            self.lower.borrow_mut().returned.push_back(resp);
        }

        self.cache
            .operate(self.now)
            .unwrap_or_else(|e| panic!("cache error: {e}"));
        self.now += PERIOD;
    }

    /// Ticks until the upper channel holds a response, up to `limit` ticks.
    /// Returns the tick count, or `None` on timeout.
    pub fn ticks_until_response(&mut self, limit: u64) -> Option<u64> {
        for i in 0..limit {
            if !self.upper.borrow().returned.is_empty() {
                return Some(i);
            }
            self.tick();
        }
        None
    }

    /// Pops everything from the lower read queue.
    pub fn drain_lower_reads(&mut self) -> Vec<Request> {
        let mut out = Vec::new();
        let mut ch = self.lower.borrow_mut();
        while let Some(req) = ch.pop_rq() {
            out.push(req);
        }
        while let Some(req) = ch.pop_pq() {
            out.push(req);
        }
        out
    }
}
