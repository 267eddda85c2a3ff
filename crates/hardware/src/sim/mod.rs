//! The simulation loop and phase control.
//!
//! A single virtual clock advances in picoseconds. Every component declares
//! a period and is operated once each time its period elapses, in a fixed
//! topological order: cores first, then the first-level caches and TLBs,
//! then the lower levels, then the shared LLC, and DRAM last. There is no
//! parallelism; correctness rests entirely on this deterministic ordering.
//!
//! A run consists of a warmup phase (latencies elided, predictors and
//! caches training) followed by the region of interest, each ending when
//! every core has retired its instruction budget.

/// Trace reading.
pub mod trace;

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{error, info};

use crate::cache::prefetch::{NextLine, Prefetcher};
use crate::cache::replacement::Replacement;
use crate::cache::{Cache, CacheParams, CacheRef};
use crate::channel::{Channel, ChannelRef};
use crate::common::chrono::{Clock, Picos, TimePoint};
use crate::common::constants::{LOG2_BLOCK_SIZE, LOG2_PAGE_SIZE};
use crate::common::error::SimError;
use crate::config::{PrefetcherKind, SimConfig};
use crate::core::bru::{BranchPredictor, Btb, BtbParams};
use crate::core::{CoreParams, O3Core};
use crate::dram::{DramParams, MemoryController};
use crate::ptw::vmem::VirtualMemory;
use crate::ptw::{PageTableWalker, PtwParams, VmemRef};
use crate::sim::trace::{InstrIdSource, InstrIdSourceRef, TraceReader};

/// The uniform per-tick contract every component obeys.
///
/// `operate` is invoked once per the component's period and returns a
/// progress indicator used for diagnosis; a component that cannot make
/// progress returns leaving its inputs untouched, and back-pressure
/// propagates by the producer re-attempting next tick.
pub trait Operable {
    /// Advances the component by one tick.
    ///
    /// # Errors
    ///
    /// Returns [`SimError`] for deadlocks and bandwidth overdraws.
    fn operate(&mut self, now: TimePoint) -> Result<u64, SimError>;
}

impl Operable for O3Core {
    fn operate(&mut self, now: TimePoint) -> Result<u64, SimError> {
        Self::operate(self, now)
    }
}

impl Operable for Cache {
    fn operate(&mut self, now: TimePoint) -> Result<u64, SimError> {
        Self::operate(self, now)
    }
}

impl Operable for PageTableWalker {
    fn operate(&mut self, now: TimePoint) -> Result<u64, SimError> {
        Self::operate(self, now)
    }
}

impl Operable for MemoryController {
    fn operate(&mut self, now: TimePoint) -> Result<u64, SimError> {
        Self::operate(self, now)
    }
}

/// Everything belonging to one CPU.
struct CpuComplex {
    core: O3Core,
    reader: TraceReader,
    itlb: CacheRef,
    dtlb: CacheRef,
    stlb: CacheRef,
    l1i: CacheRef,
    l1d: CacheRef,
    l2c: CacheRef,
    ptw: PageTableWalker,
}

/// Results of one finished phase.
pub struct PhaseResult {
    /// Instructions retired per core during the phase.
    pub instructions: Vec<u64>,
    /// Core cycles elapsed during the phase.
    pub cycles: Vec<u64>,
}

/// The complete simulated system.
pub struct Simulator {
    clock: Clock,
    cpus: Vec<CpuComplex>,
    llc: CacheRef,
    dram: MemoryController,
    vmem: VmemRef,
    core_period: Picos,
    dram_period: Picos,
    next_core_tick: TimePoint,
    next_dram_tick: TimePoint,
    config: SimConfig,
}

impl Simulator {
    /// Builds the system: one core complex per trace, a shared LLC, and
    /// the DRAM controller.
    ///
    /// # Errors
    ///
    /// Fails when a trace cannot be opened.
    pub fn new(config: SimConfig, trace_paths: &[String]) -> std::io::Result<Self> {
        let num_cpus = trace_paths.len().max(1);
        let core_period = Picos(config.core_period());
        let dram_period = Picos(config.dram_period());

        let ids: InstrIdSourceRef = Rc::new(RefCell::new(InstrIdSource::default()));
        let vmem: VmemRef = Rc::new(RefCell::new(VirtualMemory::new(
            config.vmem.pt_levels,
            config.vmem.minor_fault_penalty,
        )));

        let mk_channel = |cfg: &crate::config::CacheLevelConfig, offset_bits: u32| {
            Channel::new_ref(
                cfg.rq_size,
                cfg.pq_size,
                cfg.wq_size,
                offset_bits,
                cfg.match_offset_bits,
            )
        };

        let mk_cache = |name: String,
                        cfg: &crate::config::CacheLevelConfig,
                        offset_bits: u32,
                        uppers: Vec<ChannelRef>,
                        lower: ChannelRef,
                        lower_translate: Option<ChannelRef>|
         -> CacheRef {
            let (sets, ways) = cfg.resolve_geometry(crate::config::CACHE_ENTRY_BYTES);
            let (hit_latency, fill_latency) = cfg.resolve_latency(sets, ways);
            let mshr_size = cfg.resolve_mshr(sets, fill_latency);
            let prefetcher = match cfg.prefetcher {
                PrefetcherKind::None => Prefetcher::None,
                PrefetcherKind::NextLine => {
                    Prefetcher::NextLine(NextLine::new(cfg.prefetch_degree))
                }
            };
            let params = CacheParams {
                name,
                sets,
                ways,
                mshr_size,
                hit_latency,
                fill_latency,
                max_tag: cfg.max_tag,
                max_fill: cfg.max_fill,
                offset_bits,
                prefetch_as_load: cfg.prefetch_as_load,
                match_offset_bits: cfg.match_offset_bits,
                virtual_prefetch: cfg.virtual_prefetch,
                pref_activate: vec![
                    crate::channel::AccessType::Load,
                    crate::channel::AccessType::Rfo,
                    crate::channel::AccessType::Prefetch,
                ],
                period: core_period,
                num_cpus,
            };
            Rc::new(RefCell::new(Cache::new(
                params,
                uppers,
                lower,
                lower_translate,
                Replacement::lru(sets, ways),
                prefetcher,
            )))
        };

        // Shared levels first: each CPU's L2 gets its own channel into the
        // LLC, and the LLC talks to DRAM over one channel.
        let llc_dram = mk_channel(&config.caches.llc, LOG2_BLOCK_SIZE);
        let l2_llc_channels: Vec<ChannelRef> = (0..num_cpus)
            .map(|_| mk_channel(&config.caches.llc, LOG2_BLOCK_SIZE))
            .collect();
        let llc = mk_cache(
            "LLC".to_string(),
            &config.caches.llc,
            LOG2_BLOCK_SIZE,
            l2_llc_channels.clone(),
            llc_dram.clone(),
            None,
        );
        let dram = MemoryController::new(
            &DramParams {
                channels: config.dram.channels,
                ranks: config.dram.ranks,
                banks: config.dram.banks,
                rows: config.dram.rows,
                columns: config.dram.columns,
                channel_width: config.dram.channel_width,
                rq_size: config.dram.rq_size,
                wq_size: config.dram.wq_size,
                t_rp: Picos(config.dram.t_rp_ps),
                t_rcd: Picos(config.dram.t_rcd_ps),
                t_cas: Picos(config.dram.t_cas_ps),
                refresh_period: Picos(config.dram.refresh_period_ps),
                rows_per_refresh: config.dram.rows_per_refresh,
                turnaround: Picos(config.dram.turnaround_ps),
                period: dram_period,
            },
            vec![llc_dram],
        );

        let mut cpus = Vec::with_capacity(num_cpus);
        for (cpu, l2_llc) in l2_llc_channels.into_iter().enumerate() {
            let caches = &config.caches;

            let core_itlb = mk_channel(&caches.itlb, LOG2_PAGE_SIZE);
            let l1i_itlb = mk_channel(&caches.itlb, LOG2_PAGE_SIZE);
            let core_dtlb = mk_channel(&caches.dtlb, LOG2_PAGE_SIZE);
            let core_l1i = mk_channel(&caches.l1i, LOG2_BLOCK_SIZE);
            let core_l1d = mk_channel(&caches.l1d, LOG2_BLOCK_SIZE);
            let itlb_stlb = mk_channel(&caches.stlb, LOG2_PAGE_SIZE);
            let dtlb_stlb = mk_channel(&caches.stlb, LOG2_PAGE_SIZE);
            let stlb_ptw = mk_channel(&caches.stlb, LOG2_PAGE_SIZE);
            let ptw_l1d = mk_channel(&caches.l1d, LOG2_BLOCK_SIZE);
            let l1i_l2 = mk_channel(&caches.l2c, LOG2_BLOCK_SIZE);
            let l1d_l2 = mk_channel(&caches.l2c, LOG2_BLOCK_SIZE);

            let itlb = mk_cache(
                format!("cpu{cpu}_ITLB"),
                &caches.itlb,
                LOG2_PAGE_SIZE,
                vec![core_itlb.clone(), l1i_itlb.clone()],
                itlb_stlb.clone(),
                None,
            );
            let dtlb = mk_cache(
                format!("cpu{cpu}_DTLB"),
                &caches.dtlb,
                LOG2_PAGE_SIZE,
                vec![core_dtlb.clone()],
                dtlb_stlb.clone(),
                None,
            );
            let stlb = mk_cache(
                format!("cpu{cpu}_STLB"),
                &caches.stlb,
                LOG2_PAGE_SIZE,
                vec![itlb_stlb, dtlb_stlb],
                stlb_ptw.clone(),
                None,
            );
            let l1i = mk_cache(
                format!("cpu{cpu}_L1I"),
                &caches.l1i,
                LOG2_BLOCK_SIZE,
                vec![core_l1i.clone()],
                l1i_l2.clone(),
                Some(l1i_itlb),
            );
            let l1d = mk_cache(
                format!("cpu{cpu}_L1D"),
                &caches.l1d,
                LOG2_BLOCK_SIZE,
                vec![core_l1d.clone(), ptw_l1d.clone()],
                l1d_l2.clone(),
                None,
            );
            let l2c = mk_cache(
                format!("cpu{cpu}_L2C"),
                &caches.l2c,
                LOG2_BLOCK_SIZE,
                vec![l1i_l2, l1d_l2],
                l2_llc,
                None,
            );
            let ptw = PageTableWalker::new(
                PtwParams {
                    name: format!("cpu{cpu}_PTW"),
                    cpu,
                    pscl_dims: config.ptw.pscl_dims.clone(),
                    mshr_size: config.ptw.mshr_size,
                    max_read: config.ptw.max_read,
                    max_fill: config.ptw.max_fill,
                    hit_latency: config.ptw.hit_latency,
                    period: core_period,
                },
                vec![stlb_ptw],
                ptw_l1d,
                vmem.clone(),
            );

            let core = O3Core::new(
                CoreParams {
                    cpu,
                    ifetch_buffer_size: config.core.ifetch_buffer_size,
                    decode_buffer_size: config.core.decode_buffer_size,
                    dispatch_buffer_size: config.core.dispatch_buffer_size,
                    rob_size: config.core.rob_size,
                    lq_size: config.core.lq_size,
                    sq_size: config.core.sq_size,
                    fetch_width: config.core.fetch_width,
                    decode_width: config.core.decode_width,
                    dispatch_width: config.core.dispatch_width,
                    exec_width: config.core.exec_width,
                    lq_width: config.core.lq_width,
                    sq_width: config.core.sq_width,
                    retire_width: config.core.retire_width,
                    scheduler_size: config.core.scheduler_size,
                    decode_latency: config.core.decode_latency,
                    dispatch_latency: config.core.dispatch_latency,
                    schedule_latency: config.core.schedule_latency,
                    exec_latency: config.core.exec_latency,
                    mispredict_penalty: config.core.mispredict_penalty,
                    dib_sets: config.core.dib_sets,
                    dib_ways: config.core.dib_ways,
                    dib_window: config.core.dib_window,
                    deadlock_threshold: config.core.deadlock_threshold,
                    period: core_period,
                },
                core_itlb,
                core_l1i,
                core_dtlb,
                core_l1d,
                Some(l1i.clone()),
                Btb::basic(&BtbParams::default()),
                BranchPredictor::bimodal(config.core.bimodal_table_size),
            );

            let trace_path = trace_paths.get(cpu).map_or("", String::as_str);
            let reader = TraceReader::new(trace_path, cpu, ids.clone())?;

            cpus.push(CpuComplex {
                core,
                reader,
                itlb,
                dtlb,
                stlb,
                l1i,
                l1d,
                l2c,
                ptw,
            });
        }

        for cpu in &cpus {
            for cache in [&cpu.itlb, &cpu.dtlb, &cpu.stlb, &cpu.l1i, &cpu.l1d, &cpu.l2c] {
                cache.borrow_mut().initialize();
            }
        }
        llc.borrow_mut().initialize();

        Ok(Self {
            clock: Clock::default(),
            cpus,
            llc,
            dram,
            vmem,
            core_period,
            dram_period,
            next_core_tick: TimePoint::ZERO,
            next_dram_tick: TimePoint::ZERO,
            config,
        })
    }

    /// The virtual memory map (test and diagnostic access).
    pub fn vmem(&self) -> &VmemRef {
        &self.vmem
    }

    /// The configuration this system was built from.
    pub const fn config(&self) -> &SimConfig {
        &self.config
    }

    fn set_warmup(&mut self, warmup: bool) {
        for cpu in &mut self.cpus {
            cpu.core.set_warmup(warmup);
            for cache in [&cpu.itlb, &cpu.dtlb, &cpu.stlb, &cpu.l1i, &cpu.l1d, &cpu.l2c] {
                cache.borrow_mut().set_warmup(warmup);
            }
            cpu.ptw.set_warmup(warmup);
        }
        self.llc.borrow_mut().set_warmup(warmup);
        self.dram.set_warmup(warmup);
    }

    fn begin_phase(&mut self) {
        for cpu in &mut self.cpus {
            cpu.core.begin_phase();
            for cache in [&cpu.itlb, &cpu.dtlb, &cpu.stlb, &cpu.l1i, &cpu.l1d, &cpu.l2c] {
                cache.borrow_mut().begin_phase();
            }
        }
        self.llc.borrow_mut().begin_phase();
        self.dram.begin_phase();
    }

    fn end_phase(&mut self) {
        for cpu in &mut self.cpus {
            cpu.core.end_phase();
            for cache in [&cpu.itlb, &cpu.dtlb, &cpu.stlb, &cpu.l1i, &cpu.l1d, &cpu.l2c] {
                cache.borrow_mut().end_phase();
            }
        }
        self.llc.borrow_mut().end_phase();
        self.dram.end_phase();
    }

    /// Feeds each core's input queue from its trace.
    fn feed_cores(&mut self) -> std::io::Result<()> {
        for cpu in &mut self.cpus {
            let wanted = (self.config.core.fetch_width as usize)
                .saturating_sub(cpu.core.input_queue.len())
                .min(cpu.core.input_room());
            for _ in 0..wanted {
                let instr = cpu.reader.next_instr()?;
                cpu.core.input_queue.push_back(instr);
            }
        }
        Ok(())
    }

    /// Advances the system by one step of the leap-frog clock.
    ///
    /// # Errors
    ///
    /// Propagates deadlocks after dumping every component's state.
    pub fn step(&mut self) -> Result<(), SimError> {
        let target = self.next_core_tick.min(self.next_dram_tick);
        self.clock.advance_to(target);
        let now = self.clock.now();

        let result = self.step_components(now);
        if let Err(err) = &result {
            error!(%err, "fatal simulation error");
            self.print_deadlock();
        }
        result
    }

    fn step_components(&mut self, now: TimePoint) -> Result<(), SimError> {
        if self.next_core_tick <= now {
            self.next_core_tick = now + self.core_period;

            for cpu in &mut self.cpus {
                let _ = cpu.core.operate(now)?;
            }
            for cpu in &mut self.cpus {
                let _ = cpu.itlb.borrow_mut().operate(now)?;
                let _ = cpu.dtlb.borrow_mut().operate(now)?;
                let _ = cpu.l1i.borrow_mut().operate(now)?;
                let _ = cpu.l1d.borrow_mut().operate(now)?;
                let _ = cpu.stlb.borrow_mut().operate(now)?;
                let _ = cpu.ptw.operate(now)?;
                let _ = cpu.l2c.borrow_mut().operate(now)?;
            }
            let _ = self.llc.borrow_mut().operate(now)?;
        }

        if self.next_dram_tick <= now {
            self.next_dram_tick = now + self.dram_period;
            let _ = self.dram.operate(now)?;
        }

        Ok(())
    }

    /// Runs one phase until every core has retired `instructions` more
    /// instructions.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::Deadlock`] if any core stalls. A trace I/O error
    /// ends the phase early instead of failing the run.
    pub fn run_phase(&mut self, warmup: bool, instructions: u64) -> Result<PhaseResult, SimError> {
        self.set_warmup(warmup);
        self.begin_phase();

        let start: Vec<u64> = self.cpus.iter().map(|c| c.core.num_retired).collect();
        let goal: Vec<u64> = start.iter().map(|s| s + instructions).collect();

        info!(warmup, instructions, "phase start");

        loop {
            let done = self
                .cpus
                .iter()
                .zip(&goal)
                .all(|(c, &g)| c.core.num_retired >= g);
            if done {
                break;
            }
            if self.feed_cores().is_err() {
                error!("trace exhausted and not repeatable; ending phase");
                break;
            }
            self.step()?;
        }

        self.end_phase();

        let instructions: Vec<u64> = self
            .cpus
            .iter()
            .zip(&start)
            .map(|(c, &s)| c.core.num_retired - s)
            .collect();
        let cycles: Vec<u64> = self.cpus.iter().map(|c| c.core.roi_stats.cycles).collect();
        info!(?instructions, ?cycles, "phase end");

        Ok(PhaseResult {
            instructions,
            cycles,
        })
    }

    /// Lets outstanding requests drain after the region of interest.
    ///
    /// Bounded; a hierarchy that cannot drain (e.g. a wedged channel) stops
    /// after the limit rather than hanging.
    pub fn drain(&mut self, max_steps: u64) -> Result<(), SimError> {
        for _ in 0..max_steps {
            let busy = self.cpus.iter().any(|c| {
                c.core.rob_occupancy() > 0
                    || [&c.itlb, &c.dtlb, &c.stlb, &c.l1i, &c.l1d, &c.l2c]
                        .iter()
                        .any(|cache| cache.borrow().mshr_occupancy() > 0)
            }) || self.llc.borrow().mshr_occupancy() > 0;
            if !busy {
                break;
            }
            self.step()?;
        }
        Ok(())
    }

    /// Prints the per-phase statistics report.
    pub fn print_stats(&self) {
        let core_ps = self.core_period.as_picos();
        let dram_ps = self.dram_period.as_picos();
        for cpu in &self.cpus {
            cpu.core.roi_stats.print();
        }
        for cpu in &self.cpus {
            for cache in [&cpu.itlb, &cpu.dtlb, &cpu.stlb, &cpu.l1i, &cpu.l1d, &cpu.l2c] {
                cache.borrow().roi_stats.print(core_ps);
            }
        }
        self.llc.borrow().roi_stats.print(core_ps);
        for chan in self.dram.channels() {
            chan.roi_stats.print(dram_ps);
        }
    }

    /// Emits final policy statistics.
    pub fn final_stats(&self) {
        for cpu in &self.cpus {
            for cache in [&cpu.itlb, &cpu.dtlb, &cpu.stlb, &cpu.l1i, &cpu.l1d, &cpu.l2c] {
                cache.borrow().final_stats();
            }
        }
        self.llc.borrow().final_stats();
    }

    /// Dumps every component's queues for deadlock diagnosis.
    pub fn print_deadlock(&self) {
        for cpu in &self.cpus {
            cpu.core.print_deadlock();
            for cache in [&cpu.itlb, &cpu.dtlb, &cpu.stlb, &cpu.l1i, &cpu.l1d, &cpu.l2c] {
                cache.borrow().print_deadlock();
            }
            cpu.ptw.print_deadlock();
        }
        self.llc.borrow().print_deadlock();
        self.dram.print_deadlock();
    }
}
