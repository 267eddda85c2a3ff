//! Iterative page-table walker with page-size caches.
//!
//! A translation request walks the multi-level page table one memory read
//! per level, descending through the data hierarchy for each PTE. Partial
//! walks are accelerated by the PSCLs: one LRU table per level above the
//! leaf, caching the page-table page reached after that level's read. A
//! fresh walk probes every PSCL and resumes from the deepest hit.
//!
//! Level numbering counts remaining reads: the root read of an `N`-level
//! table happens at level `N - 1` and the leaf read at level 0. The leaf
//! response materializes the final physical address through [`vmem`].

/// Lazy virtual-to-physical mapping.
pub mod vmem;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use tracing::{debug, trace};

use crate::channel::{AccessType, ChannelRef, Request, Response};
use crate::common::addr::Address;
use crate::common::bandwidth::Bandwidth;
use crate::common::bits::splice_bits;
use crate::common::chrono::{Picos, TimePoint};
use crate::common::constants::LOG2_PAGE_SIZE;
use crate::common::error::SimError;
use crate::common::lru_table::LruTable;

use self::vmem::VirtualMemory;

/// Shared handle to the virtual memory map.
pub type VmemRef = Rc<RefCell<VirtualMemory>>;

/// One page-size cache: skips every level at or above its own.
struct Pscl {
    /// The walk level whose completion this cache records.
    level: usize,
    shamt: u32,
    table: LruTable<Address>,
}

/// An in-flight walk step.
#[derive(Clone)]
struct WalkEntry {
    /// Address of the PTE currently being read.
    address: Address,
    /// The virtual address being translated.
    v_address: Address,
    instr_depend_on_me: Vec<u64>,
    pf_metadata: u32,
    cpu: usize,
    asid: [u8; 2],
    /// Remaining reads after the current one.
    translation_level: usize,
    to_return: Vec<ChannelRef>,
    data: Address,
    event: Option<TimePoint>,
}

impl WalkEntry {
    fn is_ready(&self, now: TimePoint) -> bool {
        self.event.is_some_and(|at| at <= now)
    }
}

/// Static parameters of the walker.
pub struct PtwParams {
    /// Display name, e.g. `"cpu0_PTW"`.
    pub name: String,
    /// CPU this walker serves.
    pub cpu: usize,
    /// PSCL geometry: `(sets, ways)` for levels `N-1` down to `1`.
    pub pscl_dims: Vec<(usize, usize)>,
    /// MSHR capacity.
    pub mshr_size: usize,
    /// New walk initiations per tick.
    pub max_read: u64,
    /// Walk-step completions per tick.
    pub max_fill: u64,
    /// Cycles added to each completed step.
    pub hit_latency: u64,
    /// Clock period of the walker.
    pub period: Picos,
}

/// The page-table walker.
pub struct PageTableWalker {
    name: String,
    cpu: usize,
    cr3: Address,
    pscl: Vec<Pscl>,
    mshr_size: usize,
    max_read: u64,
    max_fill: u64,
    hit_latency: Picos,
    period: Picos,
    warmup: bool,

    mshr: Vec<WalkEntry>,
    finished: VecDeque<WalkEntry>,
    completed: VecDeque<WalkEntry>,

    upper_levels: Vec<ChannelRef>,
    lower: ChannelRef,
    vmem: VmemRef,
}

impl PageTableWalker {
    /// Builds a walker between its upper channels and the lower data path.
    pub fn new(
        params: PtwParams,
        upper_levels: Vec<ChannelRef>,
        lower: ChannelRef,
        vmem: VmemRef,
    ) -> Self {
        // The walk depth follows the PSCL count: one read per PSCL level
        // plus the leaf read.
        let depth = params.pscl_dims.len();
        let cr3 = vmem
            .borrow_mut()
            .get_pte_pa(params.cpu, Address::default(), depth)
            .0;

        let mut pscl = Vec::new();
        for (i, &(sets, ways)) in params.pscl_dims.iter().enumerate() {
            let level = depth - i;
            let shamt = vmem.borrow().shamt(level);
            pscl.push(Pscl {
                level,
                shamt,
                table: LruTable::new(sets, ways),
            });
        }

        Self {
            name: params.name,
            cpu: params.cpu,
            cr3,
            pscl,
            mshr_size: params.mshr_size,
            max_read: params.max_read,
            max_fill: params.max_fill,
            hit_latency: params.period * params.hit_latency,
            period: params.period,
            warmup: false,
            mshr: Vec::new(),
            finished: VecDeque::new(),
            completed: VecDeque::new(),
            upper_levels,
            lower,
            vmem,
        }
    }

    /// The walker's display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sets the warmup flag (zero step latencies).
    pub fn set_warmup(&mut self, warmup: bool) {
        self.warmup = warmup;
    }

    /// Starts a walk for one translation request.
    ///
    /// Probes every PSCL and resumes from the deepest hit; the root and CR3
    /// are the fallback. Returns the entry on success, `None` when the
    /// lower level refused the first read.
    fn handle_read(&mut self, req: &Request, origin: &ChannelRef) -> Option<WalkEntry> {
        let mut level = self.pscl.len();
        let mut base = self.cr3;

        for pscl in &mut self.pscl {
            let key = req.address.value() >> pscl.shamt;
            if let Some(cached) = pscl.table.check_hit(key) {
                level = pscl.level - 1;
                base = cached;
            }
        }

        let walk_offset = self.vmem.borrow().get_offset(req.address, level)
            * crate::common::constants::PTE_BYTES;
        let entry = WalkEntry {
            address: Address::from(splice_bits(base.value(), walk_offset, LOG2_PAGE_SIZE)),
            v_address: req.address,
            instr_depend_on_me: req.instr_depend_on_me.clone(),
            pf_metadata: req.pf_metadata,
            cpu: req.cpu,
            asid: req.asid,
            translation_level: level,
            to_return: if req.response_requested {
                vec![origin.clone()]
            } else {
                Vec::new()
            },
            data: Address::default(),
            event: None,
        };

        trace!(ptw = %self.name, v_address = %format_args!("{:#x}", req.address.value()),
               level, pte = %format_args!("{:#x}", entry.address.value()), "walk start");

        self.step_translation(entry)
    }

    /// Records a finished step in its PSCL and issues the next read.
    fn handle_fill(&mut self, fill: &WalkEntry) -> Option<WalkEntry> {
        let pscl_idx = self.pscl.len() - fill.translation_level;
        let pscl = &mut self.pscl[pscl_idx];
        let key = fill.v_address.value() >> pscl.shamt;
        pscl.table.fill(key, fill.data);

        let mut fwd = fill.clone();
        fwd.address = fill.data;
        fwd.translation_level = fill.translation_level - 1;
        fwd.event = None;

        trace!(ptw = %self.name, v_address = %format_args!("{:#x}", fill.v_address.value()),
               level = fwd.translation_level,
               pte = %format_args!("{:#x}", fwd.address.value()), "walk step");

        self.step_translation(fwd)
    }

    /// Issues the entry's PTE read down the lower channel.
    fn step_translation(&mut self, entry: WalkEntry) -> Option<WalkEntry> {
        let packet = Request {
            address: entry.address,
            v_address: entry.v_address,
            pf_metadata: entry.pf_metadata,
            cpu: entry.cpu,
            asid: entry.asid,
            ty: AccessType::Translation,
            is_translated: true,
            response_requested: true,
            ..Request::default()
        };

        if self.lower.borrow_mut().add_rq(packet) {
            Some(entry)
        } else {
            None
        }
    }

    /// Applies one lower-level response to every walk waiting on its block.
    fn finish_packet(&mut self, resp: &Response, now: TimePoint) {
        let resp_block = resp.address.block_number().value();
        let mut still_waiting = Vec::with_capacity(self.mshr.len());
        for entry in self.mshr.drain(..) {
            if entry.address.block_number().value() == resp_block {
                self.finished.push_back(entry);
            } else {
                still_waiting.push(entry);
            }
        }
        self.mshr = still_waiting;

        let hit_latency = self.hit_latency;
        let warmup = self.warmup;
        let period = self.period;
        let mut leaf_done = Vec::new();

        for idx in 0..self.finished.len() {
            let entry = &mut self.finished[idx];
            if entry.event.is_some() {
                continue;
            }
            if entry.translation_level > 0 {
                let (data, penalty) = self.vmem.borrow_mut().get_pte_pa(
                    entry.cpu,
                    entry.v_address,
                    entry.translation_level - 1,
                );
                entry.data = data;
                entry.event = Some(if warmup {
                    now
                } else {
                    now + hit_latency + period * penalty
                });
            } else {
                let (data, penalty) =
                    self.vmem.borrow_mut().va_to_pa(entry.cpu, entry.v_address);
                entry.data = data;
                entry.event = Some(if warmup {
                    now
                } else {
                    now + hit_latency + period * penalty
                });
                leaf_done.push(idx);
            }
        }

        // Leaf responses skip the fill path entirely.
        for &idx in leaf_done.iter().rev() {
            if let Some(entry) = self.finished.remove(idx) {
                self.completed.push_back(entry);
            }
        }
    }

    /// Advances the walker by one tick.
    ///
    /// # Errors
    ///
    /// Propagates bandwidth overdraw.
    pub fn operate(&mut self, now: TimePoint) -> Result<u64, SimError> {
        let mut progress = 0_u64;

        let responses: Vec<Response> = self.lower.borrow_mut().returned.drain(..).collect();
        for resp in &responses {
            self.finish_packet(resp, now);
            progress += 1;
        }

        let mut fill_bw = Bandwidth::new(self.max_fill);

        // Completed walks answer their requesters.
        while fill_bw.has_remaining() {
            let ready = self.completed.front().is_some_and(|e| e.is_ready(now));
            if !ready {
                break;
            }
            let Some(entry) = self.completed.pop_front() else {
                break;
            };
            let response = Response {
                address: entry.v_address,
                v_address: entry.v_address,
                data: entry.data,
                pf_metadata: entry.pf_metadata,
                instr_depend_on_me: entry.instr_depend_on_me.clone(),
            };
            for ret in &entry.to_return {
                ret.borrow_mut().returned.push_back(response.clone());
            }
            fill_bw.consume()?;
            progress += 1;

            debug!(ptw = %self.name, v_address = %format_args!("{:#x}", entry.v_address.value()),
                   pa = %format_args!("{:#x}", entry.data.value()), "walk complete");
        }

        // Intermediate steps continue their descent.
        while fill_bw.has_remaining() {
            let ready = self.finished.front().is_some_and(|e| e.is_ready(now));
            if !ready {
                break;
            }
            let Some(entry) = self.finished.pop_front() else {
                break;
            };
            if let Some(next) = self.handle_fill(&entry) {
                self.mshr.push(next);
                fill_bw.consume()?;
                progress += 1;
            } else {
                self.finished.push_front(entry);
                break;
            }
        }

        // New walks, bounded by read bandwidth and MSHR capacity.
        let mut tag_bw = Bandwidth::new(self.max_read);
        let uppers: Vec<ChannelRef> = self.upper_levels.clone();
        for ul in &uppers {
            ul.borrow_mut().check_collision();
            while tag_bw.has_remaining() {
                if self.mshr.len() >= self.mshr_size {
                    break;
                }
                let front = ul.borrow().rq_front().cloned();
                let Some(req) = front else { break };
                if let Some(entry) = self.handle_read(&req, ul) {
                    let _ = ul.borrow_mut().pop_rq();
                    self.mshr.push(entry);
                    tag_bw.consume()?;
                    progress += 1;
                } else {
                    // Lower level refused; the request stays queued.
                    break;
                }
            }
        }

        Ok(progress)
    }

    /// Dumps walker state for deadlock diagnosis.
    pub fn print_deadlock(&self) {
        if self.mshr.is_empty() {
            debug!(ptw = %self.name, cpu = self.cpu, "MSHR empty");
        }
        for (i, entry) in self.mshr.iter().enumerate() {
            debug!(ptw = %self.name, entry = i,
                   address = %format_args!("{:#x}", entry.address.value()),
                   v_address = %format_args!("{:#x}", entry.v_address.value()),
                   level = entry.translation_level, "MSHR entry");
        }
    }
}
