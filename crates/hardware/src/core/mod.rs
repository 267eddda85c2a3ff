//! The out-of-order core model.
//!
//! Instructions flow through fetch, decode, dispatch, the reorder buffer,
//! and the load/store queues, with each stage bounded by a per-tick width.
//! Within one tick the stages run back-to-front so that every stage drains
//! into space its successor freed the same cycle:
//! retire → complete → execute → schedule → memory return → LSQ →
//! memory schedule → dispatch → decode → promote → fetch → translate → DIB.
//!
//! The core performs no functional execution; the trace supplies operands
//! and branch outcomes, and the model tracks only dependencies and timing.

/// Branch predictor and BTB hooks.
pub mod bru;
/// The in-flight instruction record and LQ/SQ entries.
pub mod instruction;

use std::collections::VecDeque;

use tracing::debug;

use crate::cache::CacheRef;
use crate::channel::{AccessType, ChannelRef, Request, Response};
use crate::common::addr::Address;
use crate::common::bits::{lg2, splice_bits};
use crate::common::chrono::{Picos, TimePoint};
use crate::common::constants::{LOG2_PAGE_SIZE, NUM_INSTR_DESTINATIONS, NUM_INSTR_SOURCES};
use crate::common::error::SimError;
use crate::common::lru_table::LruTable;
use crate::stats::{BranchType, CoreStats};

use self::bru::{BranchPredictor, Btb};
use self::instruction::{LsqEntry, OooInstr, Status};

/// Static parameters of one core.
pub struct CoreParams {
    /// CPU index.
    pub cpu: usize,
    /// Fetch buffer capacity.
    pub ifetch_buffer_size: usize,
    /// Decode buffer capacity.
    pub decode_buffer_size: usize,
    /// Dispatch buffer capacity.
    pub dispatch_buffer_size: usize,
    /// Reorder buffer capacity.
    pub rob_size: usize,
    /// Load queue capacity.
    pub lq_size: usize,
    /// Store queue capacity.
    pub sq_size: usize,
    /// Instructions fetched per cycle.
    pub fetch_width: u64,
    /// Instructions decoded per cycle.
    pub decode_width: u64,
    /// Instructions dispatched per cycle.
    pub dispatch_width: u64,
    /// Instructions executed (and completed) per cycle.
    pub exec_width: u64,
    /// Loads issued per cycle.
    pub lq_width: u64,
    /// Stores issued per cycle.
    pub sq_width: u64,
    /// Instructions retired per cycle.
    pub retire_width: u64,
    /// ROB positions scanned by the scheduler per cycle.
    pub scheduler_size: u64,
    /// Cycles from decode to dispatch readiness.
    pub decode_latency: u64,
    /// Cycles from dispatch to ROB readiness.
    pub dispatch_latency: u64,
    /// Cycles from scheduling to execution readiness.
    pub schedule_latency: u64,
    /// Execution latency of non-memory instructions.
    pub exec_latency: u64,
    /// Cycles fetch stays stalled after a misprediction.
    pub mispredict_penalty: u64,
    /// Decoded-instruction buffer sets.
    pub dib_sets: usize,
    /// Decoded-instruction buffer ways.
    pub dib_ways: usize,
    /// Bytes covered by one DIB entry.
    pub dib_window: u64,
    /// Cycles a buffer head may stall before the run is declared dead.
    pub deadlock_threshold: u64,
    /// Clock period of the core.
    pub period: Picos,
}

impl Default for CoreParams {
    fn default() -> Self {
        Self {
            cpu: 0,
            ifetch_buffer_size: 64,
            decode_buffer_size: 32,
            dispatch_buffer_size: 32,
            rob_size: 352,
            lq_size: 128,
            sq_size: 72,
            fetch_width: 6,
            decode_width: 6,
            dispatch_width: 6,
            exec_width: 4,
            lq_width: 2,
            sq_width: 2,
            retire_width: 5,
            scheduler_size: 128,
            decode_latency: 1,
            dispatch_latency: 1,
            schedule_latency: 0,
            exec_latency: 0,
            mispredict_penalty: 1,
            dib_sets: 32,
            dib_ways: 8,
            dib_window: 16,
            deadlock_threshold: 1_000_000,
            period: Picos(250),
        }
    }
}

/// One out-of-order CPU core.
pub struct O3Core {
    cpu: usize,
    params: CoreParams,
    period: Picos,
    warmup: bool,

    /// Instructions waiting to enter the fetch buffer, fed by the trace.
    pub input_queue: VecDeque<OooInstr>,
    ifetch_buffer: VecDeque<OooInstr>,
    decode_buffer: VecDeque<OooInstr>,
    dispatch_buffer: VecDeque<OooInstr>,
    rob: VecDeque<OooInstr>,

    lq: Vec<Option<LsqEntry>>,
    sq: Vec<Option<LsqEntry>>,
    /// Store ids awaiting SQ allocation, in program order.
    sta: VecDeque<u64>,
    /// LQ slots awaiting translation issue.
    rtl0: VecDeque<usize>,
    /// LQ slots awaiting the data access.
    rtl1: VecDeque<usize>,
    /// SQ slots awaiting translation issue.
    rts0: VecDeque<usize>,
    /// SQ slots whose store may complete.
    rts1: VecDeque<usize>,
    ready_to_execute: VecDeque<u64>,

    dib: LruTable<()>,
    dib_window_lg2: u32,
    btb: Btb,
    predictor: BranchPredictor,

    itlb: ChannelRef,
    l1i: ChannelRef,
    dtlb: ChannelRef,
    l1d: ChannelRef,
    l1i_cache: Option<CacheRef>,

    fetch_stall: bool,
    fetch_resume_time: Option<TimePoint>,
    instrs_to_read_this_cycle: u64,

    inflight_reg_executions: i64,
    inflight_mem_executions: i64,

    /// Total instructions retired since construction.
    pub num_retired: u64,

    /// Counters for the current phase.
    pub sim_stats: CoreStats,
    /// Counters frozen at the end of the region of interest.
    pub roi_stats: CoreStats,
}

impl O3Core {
    /// Builds a core wired to its four first-level channels.
    ///
    /// `l1i_cache` lets the core forward branch outcomes to the instruction
    /// prefetcher hook.
    pub fn new(
        params: CoreParams,
        itlb: ChannelRef,
        l1i: ChannelRef,
        dtlb: ChannelRef,
        l1d: ChannelRef,
        l1i_cache: Option<CacheRef>,
        btb: Btb,
        predictor: BranchPredictor,
    ) -> Self {
        let name = format!("cpu{}", params.cpu);
        let mut sim_stats = CoreStats::default();
        sim_stats.name.clone_from(&name);
        let roi_stats = sim_stats.clone();
        Self {
            cpu: params.cpu,
            period: params.period,
            warmup: false,
            input_queue: VecDeque::new(),
            ifetch_buffer: VecDeque::new(),
            decode_buffer: VecDeque::new(),
            dispatch_buffer: VecDeque::new(),
            rob: VecDeque::new(),
            lq: vec![None; params.lq_size],
            sq: vec![None; params.sq_size],
            sta: VecDeque::new(),
            rtl0: VecDeque::new(),
            rtl1: VecDeque::new(),
            rts0: VecDeque::new(),
            rts1: VecDeque::new(),
            ready_to_execute: VecDeque::new(),
            dib: LruTable::new(params.dib_sets, params.dib_ways),
            dib_window_lg2: lg2(params.dib_window),
            btb,
            predictor,
            itlb,
            l1i,
            dtlb,
            l1d,
            l1i_cache,
            fetch_stall: false,
            fetch_resume_time: None,
            instrs_to_read_this_cycle: 0,
            inflight_reg_executions: 0,
            inflight_mem_executions: 0,
            num_retired: 0,
            sim_stats,
            roi_stats,
            params,
        }
    }

    /// CPU index of this core.
    pub const fn cpu(&self) -> usize {
        self.cpu
    }

    /// Sets the warmup flag (latencies elided, register deps cleared).
    pub fn set_warmup(&mut self, warmup: bool) {
        self.warmup = warmup;
    }

    /// Current ROB occupancy.
    pub fn rob_occupancy(&self) -> usize {
        self.rob.len()
    }

    /// Free space in the input queue this tick.
    pub fn input_room(&self) -> usize {
        self.params.ifetch_buffer_size.saturating_sub(self.ifetch_buffer.len() + self.input_queue.len())
    }

    fn rob_index_of(&self, instr_id: u64) -> Option<usize> {
        self.rob.binary_search_by_key(&instr_id, |x| x.instr_id).ok()
    }

    /// Advances the core by one tick.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::Deadlock`] when any buffer head has been stuck
    /// past the deadlock threshold.
    pub fn operate(&mut self, now: TimePoint) -> Result<u64, SimError> {
        self.sim_stats.cycles += 1;
        self.instrs_to_read_this_cycle = if self.fetch_stall {
            0
        } else {
            (self.params.fetch_width)
                .min((self.params.ifetch_buffer_size - self.ifetch_buffer.len()) as u64)
        };

        let mut progress = 0_u64;
        progress += self.retire_rob();
        progress += self.complete_inflight_instruction(now);
        progress += self.execute_instruction(now);
        self.schedule_instruction(now);
        self.handle_memory_return(now);
        self.operate_lsq(now);
        self.schedule_memory_instruction(now);
        progress += self.dispatch_instruction(now);
        progress += self.decode_instruction(now);
        progress += self.promote_to_decode(now);
        self.fetch_instruction(now);
        self.translate_fetch(now);
        self.check_dib(now);
        progress += self.init_instructions(now);

        self.check_deadlock(now)?;
        Ok(progress)
    }

    // ------------------------------------------------------------------
    // Retire
    // ------------------------------------------------------------------

    fn retire_rob(&mut self) -> u64 {
        let mut bw = self.params.retire_width;
        let mut retired = 0;

        'retire: while bw > 0 && self.rob.front().is_some_and(|x| x.executed == Status::Completed)
        {
            // Stores drain to the L1D write queue before the entry frees.
            for k in 0..NUM_INSTR_DESTINATIONS {
                let (mem, sq_slot) = {
                    let head = &self.rob[0];
                    (head.destination_memory[k], head.sq_index[k])
                };
                if mem.value() == 0 {
                    continue;
                }
                let Some(slot) = sq_slot else { continue };
                let Some(sq_entry) = self.sq[slot].clone() else {
                    continue;
                };
                let packet = Request {
                    address: sq_entry.physical_address,
                    v_address: sq_entry.virtual_address,
                    ip: sq_entry.ip,
                    instr_id: sq_entry.instr_id,
                    cpu: self.cpu,
                    asid: sq_entry.asid,
                    ty: AccessType::Write,
                    is_translated: true,
                    response_requested: false,
                    ..Request::default()
                };
                if self.l1d.borrow_mut().add_wq(packet) {
                    self.rob[0].destination_memory[k] = Address::default();
                    self.sq[slot] = None;
                } else {
                    break 'retire;
                }
            }

            let head = self.rob.pop_front();
            debug_assert!(head.is_some());
            self.num_retired += 1;
            self.sim_stats.instrs += 1;
            retired += 1;
            bw -= 1;
        }

        retired
    }

    // ------------------------------------------------------------------
    // Complete / execute / schedule
    // ------------------------------------------------------------------

    fn do_complete_execution(&mut self, idx: usize, now: TimePoint) -> Vec<u64> {
        self.rob[idx].executed = Status::Completed;
        if self.rob[idx].is_memory {
            self.inflight_mem_executions -= 1;
        } else {
            self.inflight_reg_executions -= 1;
        }

        let dependents = self.rob[idx].registers_instrs_depend_on_me.clone();
        let mut now_ready = Vec::new();
        for dep_id in dependents {
            let Some(dep_idx) = self.rob_index_of(dep_id) else {
                continue;
            };
            self.rob[dep_idx].num_reg_dependent -= 1;
            debug_assert!(self.rob[dep_idx].num_reg_dependent >= 0);
            if self.rob[dep_idx].num_reg_dependent == 0 {
                if self.rob[dep_idx].is_memory {
                    self.rob[dep_idx].scheduled = Status::InFlight;
                } else {
                    self.rob[dep_idx].scheduled = Status::Completed;
                    now_ready.push(dep_id);
                }
            }
        }

        if self.rob[idx].branch_mispredicted {
            self.fetch_resume_time =
                Some(now + self.period * self.params.mispredict_penalty);
        }

        now_ready
    }

    fn complete_inflight_instruction(&mut self, now: TimePoint) -> u64 {
        if self.inflight_reg_executions == 0 && self.inflight_mem_executions == 0 {
            return 0;
        }
        let mut bw = self.params.exec_width;
        let mut completed = 0;
        let mut idx = 0;
        while idx < self.rob.len() && bw > 0 {
            let ready = {
                let x = &self.rob[idx];
                x.executed == Status::InFlight && x.event_cycle <= now && x.num_mem_ops == 0
            };
            if ready {
                let ready_deps = self.do_complete_execution(idx, now);
                for dep in ready_deps {
                    debug_assert!(self.ready_to_execute.len() < self.rob.len());
                    self.ready_to_execute.push_back(dep);
                }
                bw -= 1;
                completed += 1;
            }
            idx += 1;
        }
        completed
    }

    fn execute_instruction(&mut self, now: TimePoint) -> u64 {
        let mut issued = 0;
        while issued < self.params.exec_width {
            let Some(id) = self.ready_to_execute.pop_front() else {
                break;
            };
            if let Some(idx) = self.rob_index_of(id) {
                self.rob[idx].executed = Status::InFlight;
                self.rob[idx].event_cycle = now
                    + if self.warmup {
                        Picos::ZERO
                    } else {
                        self.period * self.params.exec_latency
                    };
                self.inflight_reg_executions += 1;
            }
            issued += 1;
        }
        issued
    }

    fn do_scheduling(&mut self, idx: usize, now: TimePoint) {
        let my_id = self.rob[idx].instr_id;
        let srcs = self.rob[idx].source_registers;

        for reg in srcs.into_iter().filter(|&r| r != 0) {
            let prior = (0..idx).rev().find(|&j| {
                self.rob[j].executed != Status::Completed
                    && self.rob[j].destination_registers.contains(&reg)
            });
            if let Some(j) = prior {
                if self.rob[j].registers_instrs_depend_on_me.last() != Some(&my_id) {
                    self.rob[j].registers_instrs_depend_on_me.push(my_id);
                    self.rob[idx].num_reg_dependent += 1;
                }
            }
        }

        if self.rob[idx].is_memory {
            self.rob[idx].scheduled = Status::InFlight;
        } else {
            self.rob[idx].scheduled = Status::Completed;
            self.rob[idx].event_cycle = now
                + if self.warmup {
                    Picos::ZERO
                } else {
                    self.period * self.params.schedule_latency
                };
        }
    }

    fn schedule_instruction(&mut self, now: TimePoint) {
        let mut search_bw = self.params.scheduler_size;
        let mut idx = 0;
        while idx < self.rob.len() && search_bw > 0 {
            if self.rob[idx].scheduled == Status::Pending {
                self.do_scheduling(idx, now);
                if self.rob[idx].scheduled == Status::Completed
                    && self.rob[idx].num_reg_dependent == 0
                {
                    debug_assert!(self.ready_to_execute.len() < self.rob.len());
                    self.ready_to_execute.push_back(self.rob[idx].instr_id);
                }
            }
            if self.rob[idx].executed == Status::Pending {
                search_bw -= 1;
            }
            idx += 1;
        }
    }

    // ------------------------------------------------------------------
    // Memory scheduling and the LSQ
    // ------------------------------------------------------------------

    fn schedule_memory_instruction(&mut self, now: TimePoint) {
        let mut search_bw = self.params.scheduler_size;
        let mut idx = 0;
        while idx < self.rob.len() && search_bw > 0 {
            let wants = {
                let x = &self.rob[idx];
                x.is_memory && x.num_reg_dependent == 0 && x.scheduled == Status::InFlight
            };
            if wants {
                self.do_memory_scheduling(idx, now);
            }
            if self.rob[idx].executed == Status::Pending {
                search_bw -= 1;
            }
            idx += 1;
        }
    }

    fn do_memory_scheduling(&mut self, idx: usize, now: TimePoint) {
        let mut num_mem_ops = 0;
        let mut num_added = 0;

        for k in 0..NUM_INSTR_SOURCES {
            if self.rob[idx].source_memory[k].value() == 0 {
                continue;
            }
            num_mem_ops += 1;
            if self.rob[idx].source_added[k] {
                num_added += 1;
            } else if self.lq.iter().any(Option::is_none) {
                self.add_load_queue(idx, k, now);
                num_added += 1;
            }
        }

        for k in 0..NUM_INSTR_DESTINATIONS {
            if self.rob[idx].destination_memory[k].value() == 0 {
                continue;
            }
            num_mem_ops += 1;
            if self.rob[idx].destination_added[k] {
                num_added += 1;
            } else if self.sq.iter().any(Option::is_none)
                && self.sta.front() == Some(&self.rob[idx].instr_id)
            {
                self.add_store_queue(idx, k, now);
                num_added += 1;
            }
        }

        debug_assert!(num_added <= num_mem_ops);

        if num_mem_ops == num_added {
            self.rob[idx].scheduled = Status::Completed;
            // Store-to-load forwarding may have completed it already.
            if self.rob[idx].executed == Status::Pending {
                self.rob[idx].executed = Status::InFlight;
            }
        }
    }

    fn add_load_queue(&mut self, idx: usize, k: usize, now: TimePoint) {
        let slot = self.lq.iter().position(Option::is_none);
        let Some(slot) = slot else { return };

        let vaddr = self.rob[idx].source_memory[k];
        let entry = LsqEntry {
            instr_id: self.rob[idx].instr_id,
            virtual_address: vaddr,
            physical_address: Address::default(),
            ip: self.rob[idx].ip,
            producer_id: None,
            translated: Status::Pending,
            fetched: Status::Pending,
            event_cycle: now + self.period * self.params.schedule_latency,
            asid: self.rob[idx].asid,
        };
        self.lq[slot] = Some(entry);
        self.rob[idx].lq_index[k] = Some(slot);
        self.rob[idx].source_added[k] = true;

        // RAW against an older store to the same address; the producer may
        // not be in the SQ yet.
        let my_id = self.rob[idx].instr_id;
        let prior = (0..idx)
            .rev()
            .find(|&j| self.rob[j].destination_memory.contains(&vaddr));
        if let Some(j) = prior {
            let producer_id = self.rob[j].instr_id;
            self.rob[j].memory_instrs_depend_on_me.push(my_id);
            if let Some(lq_entry) = &mut self.lq[slot] {
                lq_entry.producer_id = Some(producer_id);
                lq_entry.translated = Status::InFlight;
            }

            let sq_slot = self.sq.iter().position(|s| {
                s.as_ref().is_some_and(|sq| {
                    sq.fetched == Status::Completed
                        && sq.instr_id == producer_id
                        && sq.virtual_address == vaddr
                })
            });
            if let Some(sq_slot) = sq_slot {
                self.do_sq_forward_to_lq(sq_slot, slot, now);
            }
        } else {
            self.rtl0.push_back(slot);
        }
    }

    fn add_store_queue(&mut self, idx: usize, k: usize, now: TimePoint) {
        let slot = self.sq.iter().position(Option::is_none);
        let Some(slot) = slot else { return };

        let entry = LsqEntry {
            instr_id: self.rob[idx].instr_id,
            virtual_address: self.rob[idx].destination_memory[k],
            physical_address: Address::default(),
            ip: self.rob[idx].ip,
            producer_id: None,
            translated: Status::Pending,
            fetched: Status::Pending,
            event_cycle: now + self.period * self.params.schedule_latency,
            asid: self.rob[idx].asid,
        };
        self.sq[slot] = Some(entry);
        self.rob[idx].sq_index[k] = Some(slot);
        self.rob[idx].destination_added[k] = true;
        let _ = self.sta.pop_front();

        self.rts0.push_back(slot);
    }

    fn do_sq_forward_to_lq(&mut self, sq_slot: usize, lq_slot: usize, now: TimePoint) {
        let Some(sq_entry) = self.sq[sq_slot].clone() else {
            return;
        };
        let Some(lq_entry) = self.lq[lq_slot].clone() else {
            return;
        };

        let owner = self.rob_index_of(lq_entry.instr_id);
        if let Some(owner) = owner {
            self.rob[owner].num_mem_ops -= 1;
            self.rob[owner].event_cycle = now;
            debug_assert!(self.rob[owner].num_mem_ops >= 0);
            if self.rob[owner].num_mem_ops == 0 {
                self.inflight_mem_executions += 1;
            }
        }

        let forwarded_pa = Address::from(splice_bits(
            sq_entry.physical_address.value(),
            lq_entry.virtual_address.value(),
            crate::common::constants::LOG2_BLOCK_SIZE,
        ));
        debug!(cpu = self.cpu, load = lq_entry.instr_id, store = sq_entry.instr_id,
               pa = %format_args!("{forwarded_pa:#x}"), "store-to-load forward");

        // The load needs no bus access at all.
        self.lq[lq_slot] = None;
    }

    fn operate_lsq(&mut self, now: TimePoint) {
        let mut store_issued = 0;
        while store_issued < self.params.sq_width {
            let Some(&slot) = self.rts0.front() else { break };
            if self.sq[slot].is_none() {
                let _ = self.rts0.pop_front();
                continue;
            }
            if !self.do_translate_store(slot) {
                break;
            }
            let _ = self.rts0.pop_front();
            store_issued += 1;
        }
        while store_issued < self.params.sq_width {
            let Some(&slot) = self.rts1.front() else { break };
            let _ = self.rts1.pop_front();
            if self.sq[slot].is_some() {
                self.execute_store(slot, now);
                store_issued += 1;
            }
        }

        let mut load_issued = 0;
        while load_issued < self.params.lq_width {
            let Some(&slot) = self.rtl0.front() else { break };
            if self.lq[slot].is_none() {
                let _ = self.rtl0.pop_front();
                continue;
            }
            if !self.do_translate_load(slot) {
                break;
            }
            let _ = self.rtl0.pop_front();
            load_issued += 1;
        }
        while load_issued < self.params.lq_width {
            let Some(&slot) = self.rtl1.front() else { break };
            if self.lq[slot].is_none() {
                let _ = self.rtl1.pop_front();
                continue;
            }
            if !self.execute_load(slot) {
                break;
            }
            let _ = self.rtl1.pop_front();
            load_issued += 1;
        }
    }

    fn do_translate_store(&mut self, slot: usize) -> bool {
        let Some(entry) = &self.sq[slot] else {
            return true;
        };
        let packet = Request {
            address: entry.virtual_address,
            v_address: entry.virtual_address,
            ip: entry.ip,
            instr_id: entry.instr_id,
            cpu: self.cpu,
            asid: entry.asid,
            ty: AccessType::Rfo,
            is_translated: false,
            response_requested: true,
            instr_depend_on_me: vec![entry.instr_id],
            ..Request::default()
        };
        let ok = self.dtlb.borrow_mut().add_rq(packet);
        if ok {
            if let Some(entry) = &mut self.sq[slot] {
                entry.translated = Status::InFlight;
            }
        }
        ok
    }

    fn execute_store(&mut self, slot: usize, now: TimePoint) {
        let Some(sq_entry) = self.sq[slot].clone() else {
            return;
        };
        if let Some(entry) = &mut self.sq[slot] {
            entry.fetched = Status::Completed;
            entry.event_cycle = now;
        }

        let Some(owner) = self.rob_index_of(sq_entry.instr_id) else {
            return;
        };
        self.rob[owner].num_mem_ops -= 1;
        self.rob[owner].event_cycle = now;
        debug_assert!(self.rob[owner].num_mem_ops >= 0);
        if self.rob[owner].num_mem_ops == 0 {
            self.inflight_mem_executions += 1;
        }

        // Resolve RAW: forward to every dependent load already in the LQ.
        let dependents = self.rob[owner].memory_instrs_depend_on_me.clone();
        for dep_id in dependents {
            let Some(dep_idx) = self.rob_index_of(dep_id) else {
                continue;
            };
            for k in 0..NUM_INSTR_SOURCES {
                let matches = self.rob[dep_idx].source_memory[k] == sq_entry.virtual_address
                    && self.rob[dep_idx].source_added[k];
                if !matches {
                    continue;
                }
                let Some(lq_slot) = self.rob[dep_idx].lq_index[k] else {
                    continue;
                };
                let forwardable = self.lq[lq_slot]
                    .as_ref()
                    .is_some_and(|l| l.producer_id == Some(sq_entry.instr_id));
                if forwardable {
                    self.do_sq_forward_to_lq(slot, lq_slot, now);
                }
            }
        }
    }

    fn do_translate_load(&mut self, slot: usize) -> bool {
        let Some(entry) = &self.lq[slot] else {
            return true;
        };
        let packet = Request {
            address: entry.virtual_address,
            v_address: entry.virtual_address,
            ip: entry.ip,
            instr_id: entry.instr_id,
            cpu: self.cpu,
            asid: entry.asid,
            ty: AccessType::Load,
            is_translated: false,
            response_requested: true,
            instr_depend_on_me: vec![entry.instr_id],
            ..Request::default()
        };
        let ok = self.dtlb.borrow_mut().add_rq(packet);
        if ok {
            if let Some(entry) = &mut self.lq[slot] {
                entry.translated = Status::InFlight;
            }
        }
        ok
    }

    fn execute_load(&mut self, slot: usize) -> bool {
        let Some(entry) = &self.lq[slot] else {
            return true;
        };
        let packet = Request {
            address: entry.physical_address,
            v_address: entry.virtual_address,
            ip: entry.ip,
            instr_id: entry.instr_id,
            cpu: self.cpu,
            asid: entry.asid,
            ty: AccessType::Load,
            is_translated: true,
            response_requested: true,
            instr_depend_on_me: vec![entry.instr_id],
            ..Request::default()
        };
        let ok = self.l1d.borrow_mut().add_rq(packet);
        if ok {
            if let Some(entry) = &mut self.lq[slot] {
                entry.fetched = Status::InFlight;
            }
        }
        ok
    }

    // ------------------------------------------------------------------
    // Memory returns
    // ------------------------------------------------------------------

    fn handle_memory_return(&mut self, now: TimePoint) {
        // Instruction-side translation
        let itlb_responses: Vec<Response> = self.itlb.borrow_mut().returned.drain(..).collect();
        let mut fetch_bw = self.params.fetch_width;
        for resp in itlb_responses {
            let page = resp.v_address.page_number().value();
            for instr in &mut self.ifetch_buffer {
                if fetch_bw == 0 {
                    break;
                }
                if instr.translated == Status::InFlight && instr.ip.page_number().value() == page
                {
                    instr.translated = Status::Completed;
                    instr.instruction_pa = Address::from(splice_bits(
                        resp.data.value(),
                        instr.ip.value(),
                        LOG2_PAGE_SIZE,
                    ));
                    fetch_bw -= 1;
                }
            }
        }

        // Instruction fetch
        let l1i_responses: Vec<Response> = self.l1i.borrow_mut().returned.drain(..).collect();
        let mut fetch_bw = self.params.fetch_width;
        for resp in l1i_responses {
            let block = resp.address.block_number().value();
            for instr in &mut self.ifetch_buffer {
                if fetch_bw == 0 {
                    break;
                }
                if instr.fetched == Status::InFlight
                    && instr.translated == Status::Completed
                    && instr.instruction_pa.block_number().value() == block
                {
                    instr.fetched = Status::Completed;
                    fetch_bw -= 1;
                }
            }
        }

        // Data-side translation
        let dtlb_responses: Vec<Response> = self.dtlb.borrow_mut().returned.drain(..).collect();
        for resp in dtlb_responses {
            let page = resp.v_address.page_number().value();
            for slot in 0..self.sq.len() {
                let hit = self.sq[slot].as_ref().is_some_and(|e| {
                    e.translated == Status::InFlight
                        && e.virtual_address.page_number().value() == page
                });
                if hit {
                    if let Some(entry) = &mut self.sq[slot] {
                        entry.physical_address = Address::from(splice_bits(
                            resp.data.value(),
                            entry.virtual_address.value(),
                            LOG2_PAGE_SIZE,
                        ));
                        entry.translated = Status::Completed;
                        entry.event_cycle = now;
                    }
                    self.rts1.push_back(slot);
                }
            }
            for slot in 0..self.lq.len() {
                let hit = self.lq[slot].as_ref().is_some_and(|e| {
                    e.translated == Status::InFlight
                        && e.virtual_address.page_number().value() == page
                });
                if hit {
                    if let Some(entry) = &mut self.lq[slot] {
                        entry.physical_address = Address::from(splice_bits(
                            resp.data.value(),
                            entry.virtual_address.value(),
                            LOG2_PAGE_SIZE,
                        ));
                        entry.translated = Status::Completed;
                        entry.event_cycle = now;
                    }
                    self.rtl1.push_back(slot);
                }
            }
        }

        // Data returns
        let l1d_responses: Vec<Response> = self.l1d.borrow_mut().returned.drain(..).collect();
        for resp in l1d_responses {
            let block = resp.address.block_number().value();
            for slot in 0..self.lq.len() {
                let hit = self.lq[slot].as_ref().is_some_and(|e| {
                    e.fetched == Status::InFlight
                        && e.physical_address.block_number().value() == block
                });
                if !hit {
                    continue;
                }
                let Some(entry) = self.lq[slot].take() else {
                    continue;
                };
                if let Some(owner) = self.rob_index_of(entry.instr_id) {
                    self.rob[owner].num_mem_ops -= 1;
                    self.rob[owner].event_cycle = now;
                    if self.rob[owner].num_mem_ops == 0 {
                        self.inflight_mem_executions += 1;
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Front end
    // ------------------------------------------------------------------

    fn dispatch_instruction(&mut self, now: TimePoint) -> u64 {
        let mut bw = self.params.dispatch_width;
        let mut moved = 0;
        while bw > 0
            && self
                .dispatch_buffer
                .front()
                .is_some_and(|x| x.event_cycle <= now)
            && self.rob.len() < self.params.rob_size
        {
            if let Some(instr) = self.dispatch_buffer.pop_front() {
                self.rob.push_back(instr);
            }
            bw -= 1;
            moved += 1;
        }
        moved
    }

    fn decode_instruction(&mut self, now: TimePoint) -> u64 {
        let mut bw = self.params.decode_width;
        let mut moved = 0;
        while bw > 0
            && self
                .decode_buffer
                .front()
                .is_some_and(|x| x.event_cycle <= now)
            && self.dispatch_buffer.len() < self.params.dispatch_buffer_size
        {
            let Some(mut instr) = self.decode_buffer.pop_front() else {
                break;
            };
            self.dib.fill(instr.ip.value() >> self.dib_window_lg2, ());

            // Direct jumps and calls resolve their target here; conditional
            // and indirect branches wait for execute.
            if instr.branch_mispredicted
                && matches!(
                    instr.branch_type,
                    BranchType::DirectJump | BranchType::DirectCall
                )
            {
                instr.branch_mispredicted = false;
                self.fetch_resume_time =
                    Some(now + self.period * self.params.mispredict_penalty);
            }

            instr.event_cycle = if self.warmup {
                now
            } else {
                now + self.period * self.params.dispatch_latency
            };
            self.dispatch_buffer.push_back(instr);
            bw -= 1;
            moved += 1;
        }
        moved
    }

    fn promote_to_decode(&mut self, now: TimePoint) -> u64 {
        let mut bw = self.params.fetch_width;
        let mut moved = 0;
        while bw > 0
            && self.ifetch_buffer.front().is_some_and(|x| {
                x.translated == Status::Completed && x.fetched == Status::Completed
            })
            && self.decode_buffer.len() < self.params.decode_buffer_size
        {
            let Some(mut instr) = self.ifetch_buffer.pop_front() else {
                break;
            };
            instr.event_cycle = if self.warmup || instr.decoded == Status::Completed {
                now
            } else {
                now + self.period * self.params.decode_latency
            };
            self.decode_buffer.push_back(instr);
            bw -= 1;
            moved += 1;
        }
        moved
    }

    fn fetch_instruction(&mut self, now: TimePoint) {
        // Resume fetching once the misprediction penalty has elapsed.
        if self.fetch_stall {
            if let Some(resume) = self.fetch_resume_time {
                if now >= resume {
                    self.fetch_stall = false;
                    self.fetch_resume_time = None;
                }
            }
        }

        if self.ifetch_buffer.is_empty() {
            return;
        }

        // Find a fully-translated group sharing one cache block.
        let begin = self
            .ifetch_buffer
            .iter()
            .position(|x| x.translated == Status::Completed && x.fetched == Status::Pending);
        let Some(begin) = begin else { return };
        let block = self.ifetch_buffer[begin].instruction_pa.block_number().value();
        let end = (begin..self.ifetch_buffer.len())
            .find(|&i| self.ifetch_buffer[i].instruction_pa.block_number().value() != block)
            .unwrap_or(self.ifetch_buffer.len());

        // Only issue groups that are closed or start at the buffer head;
        // anything else may still grow next cycle.
        if end == self.ifetch_buffer.len() && begin != 0 {
            return;
        }

        let deps: Vec<u64> = self.ifetch_buffer.range(begin..end).map(|x| x.instr_id).collect();
        let head = &self.ifetch_buffer[begin];
        let packet = Request {
            address: head.instruction_pa,
            v_address: head.ip,
            ip: head.ip,
            instr_id: head.instr_id,
            cpu: self.cpu,
            asid: head.asid,
            ty: AccessType::Load,
            is_translated: true,
            response_requested: true,
            instr_depend_on_me: deps,
            ..Request::default()
        };

        if self.l1i.borrow_mut().add_rq(packet) {
            for instr in self.ifetch_buffer.range_mut(begin..end) {
                instr.fetched = Status::InFlight;
            }
        }
    }

    fn translate_fetch(&mut self, _now: TimePoint) {
        if self.ifetch_buffer.is_empty() {
            return;
        }

        let begin = self
            .ifetch_buffer
            .iter()
            .position(|x| x.translated == Status::Pending);
        let Some(begin) = begin else { return };
        let page = self.ifetch_buffer[begin].ip.page_number().value();
        let end = (begin..self.ifetch_buffer.len())
            .find(|&i| self.ifetch_buffer[i].ip.page_number().value() != page)
            .unwrap_or(self.ifetch_buffer.len());

        if end == self.ifetch_buffer.len() && begin != 0 {
            return;
        }

        let deps: Vec<u64> = self.ifetch_buffer.range(begin..end).map(|x| x.instr_id).collect();
        let head = &self.ifetch_buffer[begin];
        let packet = Request {
            address: head.ip,
            v_address: head.ip,
            ip: head.ip,
            instr_id: head.instr_id,
            cpu: self.cpu,
            asid: head.asid,
            ty: AccessType::Load,
            is_translated: false,
            response_requested: true,
            instr_depend_on_me: deps,
            ..Request::default()
        };

        if self.itlb.borrow_mut().add_rq(packet) {
            for instr in self.ifetch_buffer.range_mut(begin..end) {
                instr.translated = Status::InFlight;
            }
        }
    }

    fn check_dib(&mut self, now: TimePoint) {
        let window = self.dib_window_lg2;
        let limit = (self.params.fetch_width as usize).min(self.ifetch_buffer.len());
        for instr in self.ifetch_buffer.iter_mut().take(limit) {
            if self.dib.check_hit(instr.ip.value() >> window).is_some() {
                // Recently decoded: skip fetch and decode entirely.
                instr.translated = Status::Completed;
                instr.fetched = Status::Completed;
                instr.decoded = Status::Completed;
                instr.event_cycle = now;
            }
        }
    }

    // ------------------------------------------------------------------
    // Instruction intake
    // ------------------------------------------------------------------

    fn init_instructions(&mut self, now: TimePoint) -> u64 {
        let mut initiated = 0;
        while self.instrs_to_read_this_cycle > 0 {
            let Some(instr) = self.input_queue.pop_front() else {
                break;
            };
            self.init_instruction(instr, now);
            initiated += 1;
        }
        initiated
    }

    fn init_instruction(&mut self, mut instr: OooInstr, now: TimePoint) {
        self.instrs_to_read_this_cycle -= 1;

        instr.decorate();

        // Stores must allocate SQ entries in program order.
        for mem in instr.destination_memory {
            if mem.value() != 0 {
                self.sta.push_back(instr.instr_id);
            }
        }

        self.sim_stats.total_branch_types[instr.branch_type.index()] += 1;

        if instr.is_branch {
            self.sim_stats.num_branch += 1;

            let (mut predicted_target, always_taken) =
                self.btb.prediction(instr.ip, instr.branch_type);
            let prediction = self.predictor.predict(
                instr.ip,
                predicted_target,
                always_taken,
                instr.branch_type,
            );
            if !prediction && !always_taken {
                predicted_target = Address::default();
            }

            if let Some(l1i) = &self.l1i_cache {
                l1i.borrow_mut().prefetcher_branch_operate(
                    instr.ip,
                    instr.branch_type.index() as u8,
                    predicted_target,
                );
            }

            if predicted_target != instr.branch_target {
                self.sim_stats.branch_mispredictions += 1;
                self.sim_stats.total_rob_occupancy_at_mispredict += self.rob.len() as u64;
                self.sim_stats.branch_type_misses[instr.branch_type.index()] += 1;
                if !self.warmup {
                    self.fetch_stall = true;
                    self.instrs_to_read_this_cycle = 0;
                    instr.branch_mispredicted = true;
                }
            } else if instr.branch_taken {
                // A correctly-predicted taken branch still ends the fetch
                // group this cycle.
                self.instrs_to_read_this_cycle = 0;
            }

            self.btb
                .update(instr.ip, instr.branch_target, instr.branch_taken, instr.branch_type);
            self.predictor.last_branch_result(
                instr.ip,
                instr.branch_target,
                instr.branch_taken,
                instr.branch_type,
            );
        }

        instr.event_cycle = now;

        // Fast warmup: drop register dependencies so the pipeline does not
        // stall while predictors and caches train.
        if self.warmup {
            instr.source_registers = [0; NUM_INSTR_SOURCES];
            instr.destination_registers = [0; NUM_INSTR_DESTINATIONS];
            instr.num_reg_ops = 0;
        }

        self.ifetch_buffer.push_back(instr);
    }

    // ------------------------------------------------------------------
    // Deadlock
    // ------------------------------------------------------------------

    fn check_deadlock(&self, now: TimePoint) -> Result<(), SimError> {
        let threshold = self.period * self.params.deadlock_threshold;
        let stuck = |head: Option<&OooInstr>| {
            head.is_some_and(|x| x.event_cycle + threshold <= now)
        };
        if stuck(self.ifetch_buffer.front())
            || stuck(self.decode_buffer.front())
            || stuck(self.dispatch_buffer.front())
            || stuck(self.rob.front())
        {
            return Err(SimError::Deadlock { cpu: self.cpu, now });
        }
        Ok(())
    }

    /// Dumps pipeline state for deadlock diagnosis.
    pub fn print_deadlock(&self) {
        let dump_head = |name: &str, head: Option<&OooInstr>| match head {
            Some(x) => debug!(
                cpu = self.cpu, buffer = name, instr_id = x.instr_id,
                translated = ?x.translated, fetched = ?x.fetched,
                scheduled = ?x.scheduled, executed = ?x.executed,
                num_reg_dependent = x.num_reg_dependent, num_mem_ops = x.num_mem_ops,
                event = ?x.event_cycle, "buffer head"
            ),
            None => debug!(cpu = self.cpu, buffer = name, "empty"),
        };
        dump_head("IFETCH_BUFFER", self.ifetch_buffer.front());
        dump_head("DECODE_BUFFER", self.decode_buffer.front());
        dump_head("DISPATCH_BUFFER", self.dispatch_buffer.front());
        dump_head("ROB", self.rob.front());

        for (i, entry) in self.lq.iter().enumerate() {
            if let Some(e) = entry {
                debug!(cpu = self.cpu, slot = i, instr_id = e.instr_id,
                       address = %format_args!("{:#x}", e.virtual_address.value()),
                       translated = ?e.translated, fetched = ?e.fetched, "LQ entry");
            }
        }
        for (i, entry) in self.sq.iter().enumerate() {
            if let Some(e) = entry {
                debug!(cpu = self.cpu, slot = i, instr_id = e.instr_id,
                       address = %format_args!("{:#x}", e.virtual_address.value()),
                       translated = ?e.translated, fetched = ?e.fetched, "SQ entry");
            }
        }
    }

    /// Starts a new statistics phase.
    pub fn begin_phase(&mut self) {
        let name = self.sim_stats.name.clone();
        self.sim_stats = CoreStats {
            name: name.clone(),
            ..CoreStats::default()
        };
        self.roi_stats = CoreStats {
            name,
            ..CoreStats::default()
        };
    }

    /// Freezes the current counters as the region-of-interest results.
    pub fn end_phase(&mut self) {
        self.roi_stats = self.sim_stats.clone();
    }
}
