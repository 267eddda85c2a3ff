//! Set-associative cache with MSHR-based miss handling.
//!
//! The cache drains requests from its upper-level channels, checks tags
//! under a per-tick bandwidth, and either answers from its array or
//! allocates an MSHR and forwards the miss down its lower channel. Fills
//! come back through the lower channel's response queue, wait out the fill
//! latency in the MSHR, and are written into the array under the fill
//! bandwidth, evicting a victim chosen by the replacement policy hook.
//!
//! One cache type covers every level of the hierarchy: the TLBs are caches
//! whose fills carry translated addresses, the write-through/write-back
//! distinction is the `match_offset_bits` flag, and the prefetch entry point
//! works in virtual or physical space per `virtual_prefetch`.

/// Prefetcher hook dispatch.
pub mod prefetch;
/// Replacement policy hook dispatch.
pub mod replacement;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use tracing::{debug, trace};

use crate::channel::{AccessType, Channel, ChannelRef, Request, Response};
use crate::common::addr::Address;
use crate::common::bandwidth::Bandwidth;
use crate::common::bits::{bitmask, splice_bits};
use crate::common::chrono::{Picos, TimePoint};
use crate::common::constants::LOG2_PAGE_SIZE;
use crate::common::error::SimError;
use crate::stats::CacheStats;

use self::prefetch::{PrefetchDecision, Prefetcher};
use self::replacement::{Replacement, UpdateContext, VictimContext};

/// Shared handle to a cache, used where another component must reach a
/// cache's hooks directly (e.g. the core driving the L1I branch hook).
pub type CacheRef = Rc<RefCell<Cache>>;

/// One way of one set.
#[derive(Clone, Debug, Default)]
pub struct CacheBlock {
    /// Whether the way holds a block.
    pub valid: bool,
    /// True if the block was brought in by a prefetch and not yet demanded.
    pub prefetch: bool,
    /// Whether the block has been written since the fill.
    pub dirty: bool,
    /// Full physical address of the block.
    pub address: Address,
    /// Full virtual address, kept for replacement policies.
    pub v_address: Address,
    /// Payload carried by the fill (the physical address, for TLB levels).
    pub data: Address,
    /// Opaque prefetcher metadata.
    pub pf_metadata: u32,
}

/// An outstanding miss and the requesters waiting on it.
#[derive(Clone)]
struct MshrEntry {
    req: Request,
    to_return: Vec<ChannelRef>,
    data: Address,
    /// Time at which the fill may be written; `None` until the response
    /// arrives.
    event: Option<TimePoint>,
    cycle_enqueued: TimePoint,
}

impl MshrEntry {
    fn new(req: Request, to_return: Vec<ChannelRef>, now: TimePoint) -> Self {
        Self {
            req,
            to_return,
            data: Address::default(),
            event: None,
            cycle_enqueued: now,
        }
    }

    fn is_ready(&self, now: TimePoint) -> bool {
        self.event.is_some_and(|at| at <= now)
    }
}

/// A request that has been accepted and is waiting out the hit latency.
struct TagCheckEntry {
    req: Request,
    origin: Option<ChannelRef>,
    ready: TimePoint,
}

/// Static parameters of one cache instance.
pub struct CacheParams {
    /// Display name, e.g. `"cpu0_L1D"`.
    pub name: String,
    /// Number of sets. Must be a power of two.
    pub sets: usize,
    /// Associativity.
    pub ways: usize,
    /// MSHR capacity.
    pub mshr_size: usize,
    /// Cycles from acceptance to tag check.
    pub hit_latency: u64,
    /// Cycles from response arrival to array write.
    pub fill_latency: u64,
    /// Tag checks per tick.
    pub max_tag: u64,
    /// Fills per tick.
    pub max_fill: u64,
    /// Block-offset width; `LOG2_BLOCK_SIZE` for data caches,
    /// `LOG2_PAGE_SIZE` for TLBs.
    pub offset_bits: u32,
    /// Issue prefetch misses through the lower read queue.
    pub prefetch_as_load: bool,
    /// Compare writes on the full address (coherence testing) instead of
    /// treating them as writeback fills.
    pub match_offset_bits: bool,
    /// Prefetch entry point takes virtual addresses.
    pub virtual_prefetch: bool,
    /// Access types that activate the prefetcher hook.
    pub pref_activate: Vec<AccessType>,
    /// Clock period of this cache.
    pub period: Picos,
    /// Number of CPUs sharing this cache (statistics dimension).
    pub num_cpus: usize,
}

/// A set-associative cache level.
pub struct Cache {
    name: String,
    sets: usize,
    ways: usize,
    mshr_size: usize,
    hit_latency: Picos,
    fill_latency: Picos,
    max_tag: u64,
    max_fill: u64,
    offset_bits: u32,
    prefetch_as_load: bool,
    match_offset_bits: bool,
    virtual_prefetch: bool,
    pref_activate_mask: u8,
    period: Picos,
    warmup: bool,
    cpu: usize,

    blocks: Vec<CacheBlock>,
    mshr: VecDeque<MshrEntry>,
    inflight_writes: VecDeque<MshrEntry>,
    inflight_tag_check: VecDeque<TagCheckEntry>,
    translation_stash: Vec<TagCheckEntry>,
    internal_pq: Channel,

    upper_levels: Vec<ChannelRef>,
    lower: ChannelRef,
    lower_translate: Option<ChannelRef>,

    replacement: Replacement,
    prefetcher: Prefetcher,

    /// Counters for the current phase.
    pub sim_stats: CacheStats,
    /// Counters frozen at the end of the region of interest.
    pub roi_stats: CacheStats,
}

impl Cache {
    /// Builds a cache between its upper channels and a lower channel.
    ///
    /// `lower_translate` carries translation requests for virtual
    /// prefetches and is only meaningful when `virtual_prefetch` is set.
    pub fn new(
        params: CacheParams,
        upper_levels: Vec<ChannelRef>,
        lower: ChannelRef,
        lower_translate: Option<ChannelRef>,
        replacement: Replacement,
        prefetcher: Prefetcher,
    ) -> Self {
        let pref_activate_mask = params
            .pref_activate
            .iter()
            .fold(0_u8, |mask, ty| mask | (1 << ty.index()));
        Self {
            name: params.name.clone(),
            sets: params.sets,
            ways: params.ways,
            mshr_size: params.mshr_size,
            hit_latency: params.period * params.hit_latency,
            fill_latency: params.period * params.fill_latency,
            max_tag: params.max_tag,
            max_fill: params.max_fill,
            offset_bits: params.offset_bits,
            prefetch_as_load: params.prefetch_as_load,
            match_offset_bits: params.match_offset_bits,
            virtual_prefetch: params.virtual_prefetch,
            pref_activate_mask,
            period: params.period,
            warmup: false,
            cpu: 0,
            blocks: vec![CacheBlock::default(); params.sets * params.ways],
            mshr: VecDeque::new(),
            inflight_writes: VecDeque::new(),
            inflight_tag_check: VecDeque::new(),
            translation_stash: Vec::new(),
            internal_pq: Channel::new(0, 32, 0, params.offset_bits, params.match_offset_bits),
            upper_levels,
            lower,
            lower_translate,
            replacement,
            prefetcher,
            sim_stats: CacheStats::new(&params.name, params.num_cpus),
            roi_stats: CacheStats::new(&params.name, params.num_cpus),
        }
    }

    /// The cache's display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of sets.
    pub const fn num_sets(&self) -> usize {
        self.sets
    }

    /// Associativity.
    pub const fn num_ways(&self) -> usize {
        self.ways
    }

    /// Current MSHR occupancy.
    pub fn mshr_occupancy(&self) -> usize {
        self.mshr.len()
    }

    /// Invoked once before the first tick.
    pub fn initialize(&mut self) {
        self.replacement.initialize();
        self.prefetcher.initialize();
    }

    /// Sets the warmup flag (zero latencies, same-tick readiness).
    pub fn set_warmup(&mut self, warmup: bool) {
        self.warmup = warmup;
    }

    fn set_index(&self, address: Address) -> usize {
        ((address.value() >> self.offset_bits) & bitmask(crate::common::bits::lg2(self.sets as u64)))
            as usize
    }

    fn block_range(&self, address: Address) -> std::ops::Range<usize> {
        let begin = self.set_index(address) * self.ways;
        begin..begin + self.ways
    }

    fn matches(&self, block: &CacheBlock, address: Address) -> bool {
        block.valid && block.address.value() >> self.offset_bits == address.value() >> self.offset_bits
    }

    /// Advances the cache by one tick.
    ///
    /// # Errors
    ///
    /// Propagates bandwidth overdraw; the cache itself never deadlocks.
    pub fn operate(&mut self, now: TimePoint) -> Result<u64, SimError> {
        let mut progress = 0_u64;

        self.drain_lower_responses(now);
        self.drain_translation_responses(now);

        let mut fill_bw = Bandwidth::new(self.max_fill);
        progress += self.operate_fills(now, &mut fill_bw)?;

        for ul in &self.upper_levels {
            ul.borrow_mut().check_collision();
        }
        self.internal_pq.check_collision();

        let mut tag_bw = Bandwidth::new(self.max_tag);
        progress += self.operate_tag_checks(now, &mut tag_bw)?;
        self.intake_requests(now);
        self.issue_stashed_translations();

        let decisions = self.prefetcher.cycle_operate();
        for d in decisions {
            self.prefetch_line(d.address, d.fill_this_level, d.metadata);
        }

        Ok(progress)
    }

    /// Moves responses from the lower channel into their MSHRs.
    fn drain_lower_responses(&mut self, now: TimePoint) {
        let responses: Vec<Response> = self.lower.borrow_mut().returned.drain(..).collect();
        for resp in responses {
            self.finish_packet(&resp, now);
        }
    }

    fn finish_packet(&mut self, resp: &Response, now: TimePoint) {
        let shamt = self.offset_bits;
        let found = self
            .mshr
            .iter()
            .position(|e| e.req.address.value() >> shamt == resp.address.value() >> shamt);
        let Some(idx) = found else {
            debug!(cache = %self.name, address = %format_args!("{:#x}", resp.address.value()),
                   "response without a matching MSHR entry");
            return;
        };

        let fill_delay = if self.warmup { Picos::ZERO } else { self.fill_latency };
        {
            let entry = &mut self.mshr[idx];
            entry.data = resp.data;
            entry.req.pf_metadata = resp.pf_metadata;
            entry.event = Some(now + fill_delay);
        }

        // Keep returned entries ahead of entries still waiting on the lower
        // level, preserving arrival order among the returned.
        let first_unreturned = self
            .mshr
            .iter()
            .position(|e| e.event.is_none())
            .unwrap_or(self.mshr.len());
        if idx > first_unreturned {
            self.mshr.swap(idx, first_unreturned);
        }
    }

    /// Writes ready fills into the array, bounded by the fill bandwidth.
    fn operate_fills(&mut self, now: TimePoint, fill_bw: &mut Bandwidth) -> Result<u64, SimError> {
        let mut progress = 0_u64;

        while fill_bw.has_remaining() {
            let ready = self.mshr.front().is_some_and(|e| e.is_ready(now));
            if !ready {
                break;
            }
            let Some(entry) = self.mshr.pop_front() else {
                break;
            };
            if self.handle_fill(&entry, now) {
                fill_bw.consume()?;
                progress += 1;
            } else {
                self.mshr.push_front(entry);
                break;
            }
        }

        while fill_bw.has_remaining() {
            let ready = self.inflight_writes.front().is_some_and(|e| e.is_ready(now));
            if !ready {
                break;
            }
            let Some(entry) = self.inflight_writes.pop_front() else {
                break;
            };
            if self.handle_fill(&entry, now) {
                fill_bw.consume()?;
                progress += 1;
            } else {
                self.inflight_writes.push_front(entry);
                break;
            }
        }

        Ok(progress)
    }

    /// Installs one fill. Returns false when a dirty victim's writeback was
    /// rejected, stalling this fill for the tick.
    fn handle_fill(&mut self, fill: &MshrEntry, now: TimePoint) -> bool {
        let range = self.block_range(fill.req.address);
        let set = self.set_index(fill.req.address);

        let way = self.blocks[range.clone()]
            .iter()
            .position(|b| !b.valid)
            .map_or_else(
                || {
                    self.replacement.find_victim(&VictimContext {
                        cpu: fill.req.cpu,
                        instr_id: fill.req.instr_id,
                        set,
                        ip: fill.req.ip,
                        full_addr: fill.req.address,
                        ty: fill.req.ty,
                    })
                },
                |way| way,
            );

        trace!(cache = %self.name, instr_id = fill.req.instr_id,
               address = %format_args!("{:#x}", fill.req.address.value()),
               set, way, ty = fill.req.ty.name(), "fill");

        let mut metadata = fill.req.pf_metadata;
        let offset_mask = if self.match_offset_bits { 0 } else { self.offset_bits };
        let pkt_address = Address::from(
            (if self.virtual_prefetch {
                fill.req.v_address.value()
            } else {
                fill.req.address.value()
            }) & !bitmask(offset_mask),
        );

        if way < self.ways {
            let idx = range.start + way;
            if self.blocks[idx].valid && self.blocks[idx].dirty {
                let victim = &self.blocks[idx];
                let writeback = Request {
                    address: victim.address,
                    v_address: victim.v_address,
                    data: victim.data,
                    instr_id: fill.req.instr_id,
                    cpu: fill.req.cpu,
                    ty: AccessType::Write,
                    pf_metadata: victim.pf_metadata,
                    is_translated: true,
                    response_requested: false,
                    ..Request::default()
                };
                if !self.lower.borrow_mut().add_wq(writeback) {
                    return false;
                }
            }

            let evicted_address = if self.blocks[idx].valid {
                Address::from(self.blocks[idx].address.value() & !bitmask(offset_mask))
            } else {
                Address::default()
            };

            if self.blocks[idx].valid && self.blocks[idx].prefetch {
                self.sim_stats.pf_useless += 1;
            }
            if fill.req.ty == AccessType::Prefetch {
                self.sim_stats.pf_fill += 1;
            }

            self.blocks[idx] = CacheBlock {
                valid: true,
                prefetch: fill.req.prefetch_from_this,
                dirty: fill.req.ty == AccessType::Write,
                address: fill.req.address,
                v_address: fill.req.v_address,
                data: fill.data,
                pf_metadata: 0,
            };

            metadata = self.prefetcher.cache_fill(
                pkt_address,
                set,
                way,
                fill.req.ty == AccessType::Prefetch,
                evicted_address,
                metadata,
            );
            self.replacement.update(&UpdateContext {
                cpu: fill.req.cpu,
                set,
                way,
                full_addr: fill.req.address,
                ip: fill.req.ip,
                victim_addr: evicted_address,
                ty: fill.req.ty,
                hit: false,
            });
            self.blocks[idx].pf_metadata = metadata;
        } else {
            // The policy elected to bypass this fill.
            debug_assert!(fill.req.ty != AccessType::Write);
            metadata = self.prefetcher.cache_fill(
                pkt_address,
                set,
                way,
                fill.req.ty == AccessType::Prefetch,
                Address::default(),
                metadata,
            );
            self.replacement.update(&UpdateContext {
                cpu: fill.req.cpu,
                set,
                way,
                full_addr: fill.req.address,
                ip: fill.req.ip,
                victim_addr: Address::default(),
                ty: fill.req.ty,
                hit: false,
            });
        }

        self.sim_stats.total_miss_latency_ps +=
            now.since(fill.cycle_enqueued + self.period).as_picos();

        let response = Response {
            address: fill.req.address,
            v_address: fill.req.v_address,
            data: fill.data,
            pf_metadata: metadata,
            instr_depend_on_me: fill.req.instr_depend_on_me.clone(),
        };
        for ret in &fill.to_return {
            ret.borrow_mut().returned.push_back(response.clone());
        }

        true
    }

    fn should_activate_prefetcher(&self, req: &Request) -> bool {
        (self.pref_activate_mask & (1 << req.ty.index())) != 0 && !req.prefetch_from_this
    }

    /// Checks one request against the array. Returns true on a hit.
    fn try_hit(&mut self, entry: &TagCheckEntry) -> bool {
        let req = &entry.req;
        let range = self.block_range(req.address);
        let set = self.set_index(req.address);
        let way = self.blocks[range.clone()]
            .iter()
            .position(|b| self.matches(b, req.address));
        let hit = way.is_some();

        trace!(cache = %self.name, instr_id = req.instr_id,
               address = %format_args!("{:#x}", req.address.value()),
               set, hit, ty = req.ty.name(), "tag check");

        let mut metadata = req.pf_metadata;
        if self.should_activate_prefetcher(req) {
            let offset_mask = if self.match_offset_bits { 0 } else { self.offset_bits };
            let pf_base = Address::from(
                (if self.virtual_prefetch {
                    req.v_address.value()
                } else {
                    req.address.value()
                }) & !bitmask(offset_mask),
            );
            let useful = way.is_some_and(|w| self.blocks[range.start + w].prefetch);
            let (new_metadata, decisions) =
                self.prefetcher
                    .cache_operate(pf_base, req.ip, hit, useful, req.ty, metadata);
            metadata = new_metadata;
            for d in decisions {
                self.prefetch_line(d.address, d.fill_this_level, d.metadata);
            }
        }

        let Some(way) = way else {
            self.sim_stats.misses[req.ty.index()][req.cpu] += 1;
            return false;
        };
        let idx = range.start + way;

        self.sim_stats.hits[req.ty.index()][req.cpu] += 1;
        self.replacement.update(&UpdateContext {
            cpu: req.cpu,
            set,
            way,
            full_addr: self.blocks[idx].address,
            ip: req.ip,
            victim_addr: Address::default(),
            ty: req.ty,
            hit: true,
        });

        if req.response_requested {
            let response = Response {
                address: req.address,
                v_address: req.v_address,
                data: self.blocks[idx].data,
                pf_metadata: metadata,
                instr_depend_on_me: req.instr_depend_on_me.clone(),
            };
            if let Some(origin) = &entry.origin {
                origin.borrow_mut().returned.push_back(response);
            }
        }

        if req.ty == AccessType::Write {
            self.blocks[idx].dirty = true;
        }

        if self.blocks[idx].prefetch && !req.prefetch_from_this {
            self.sim_stats.pf_useful += 1;
            self.blocks[idx].prefetch = false;
        }

        true
    }

    /// Registers a miss: merges into an existing MSHR or allocates one and
    /// forwards the request down. Returns false to retry next tick.
    fn handle_miss(&mut self, entry: &TagCheckEntry, now: TimePoint) -> bool {
        let req = &entry.req;
        let shamt = self.offset_bits;
        let mshr_idx = self
            .mshr
            .iter()
            .position(|e| e.req.address.value() >> shamt == req.address.value() >> shamt);

        if let Some(idx) = mshr_idx {
            // Miss already in flight: merge dependents and requesters.
            self.sim_stats.mshr_merge += 1;
            let origin = entry
                .origin
                .iter()
                .filter(|_| req.response_requested)
                .cloned()
                .collect::<Vec<_>>();
            let mshr_entry = &mut self.mshr[idx];
            let mut deps = std::mem::take(&mut mshr_entry.req.instr_depend_on_me);
            deps.extend(req.instr_depend_on_me.iter().copied());
            deps.sort_unstable();
            deps.dedup();
            mshr_entry.req.instr_depend_on_me = deps;
            for ret in origin {
                if !mshr_entry.to_return.iter().any(|r| std::rc::Rc::ptr_eq(r, &ret)) {
                    mshr_entry.to_return.push(ret);
                }
            }

            if mshr_entry.req.ty == AccessType::Prefetch && req.ty != AccessType::Prefetch {
                // Promote the in-flight prefetch to a demand miss.
                if mshr_entry.req.prefetch_from_this {
                    self.sim_stats.pf_useful += 1;
                }
                let deps = std::mem::take(&mut mshr_entry.req.instr_depend_on_me);
                let prior_event = mshr_entry.event;
                let to_return = std::mem::take(&mut mshr_entry.to_return);
                mshr_entry.req = req.clone();
                mshr_entry.req.instr_depend_on_me = deps;
                mshr_entry.event = prior_event;
                mshr_entry.cycle_enqueued = now;
                mshr_entry.to_return = to_return;
            }
            return true;
        }

        if self.mshr.len() == self.mshr_size {
            return false;
        }

        let mut fwd = req.clone();
        if fwd.ty == AccessType::Write {
            fwd.ty = AccessType::Rfo;
        }
        fwd.response_requested = req.fill_this_level;
        fwd.fill_this_level = true;
        fwd.prefetch_from_this = false;
        fwd.forward_checked = false;

        let success = if self.prefetch_as_load || req.ty != AccessType::Prefetch {
            self.lower.borrow_mut().add_rq(fwd)
        } else {
            self.lower.borrow_mut().add_pq(fwd)
        };
        if !success {
            return false;
        }

        if req.fill_this_level {
            let to_return = entry
                .origin
                .iter()
                .filter(|_| req.response_requested)
                .cloned()
                .collect();
            self.mshr.push_back(MshrEntry::new(req.clone(), to_return, now));
        }

        true
    }

    /// Accepts a write that bypasses the tag check (writeback buffer path).
    fn handle_write(&mut self, entry: &TagCheckEntry, now: TimePoint) {
        let delay = if self.warmup { Picos::ZERO } else { self.fill_latency };
        let origin = entry
            .origin
            .iter()
            .filter(|_| entry.req.response_requested)
            .cloned()
            .collect();
        let mut mshr_entry = MshrEntry::new(entry.req.clone(), origin, now);
        mshr_entry.event = Some(now + delay);
        self.inflight_writes.push_back(mshr_entry);
    }

    /// Runs tag checks over ready accepted requests.
    fn operate_tag_checks(
        &mut self,
        now: TimePoint,
        tag_bw: &mut Bandwidth,
    ) -> Result<u64, SimError> {
        let mut progress = 0_u64;

        while tag_bw.has_remaining() {
            let ready = self
                .inflight_tag_check
                .front()
                .is_some_and(|e| e.ready <= now);
            if !ready {
                break;
            }
            let Some(entry) = self.inflight_tag_check.pop_front() else {
                break;
            };

            let writelike = entry.req.ty == AccessType::Write && !self.match_offset_bits;
            let done = if self.try_hit(&entry) {
                true
            } else if writelike {
                self.handle_write(&entry, now);
                true
            } else {
                self.handle_miss(&entry, now)
            };

            tag_bw.consume()?;
            if done {
                progress += 1;
            } else {
                // Back-pressured (MSHR or lower queue full): retry next tick.
                self.inflight_tag_check.push_front(entry);
                break;
            }
        }

        Ok(progress)
    }

    /// Moves requests from the upper channels into the tag-check pipeline.
    fn intake_requests(&mut self, now: TimePoint) {
        let ready_at = if self.warmup { now } else { now + self.hit_latency };
        let mut room = self.max_tag as usize;

        let uppers: Vec<ChannelRef> = self.upper_levels.clone();
        for ul in &uppers {
            // Writes first, then demand reads, then prefetches.
            while room > 0 {
                let popped = ul.borrow_mut().pop_wq();
                let Some(req) = popped else { break };
                self.accept(req, Some(ul.clone()), ready_at);
                room -= 1;
            }
            while room > 0 {
                let popped = ul.borrow_mut().pop_rq();
                let Some(req) = popped else { break };
                self.accept(req, Some(ul.clone()), ready_at);
                room -= 1;
            }
            while room > 0 {
                let popped = ul.borrow_mut().pop_pq();
                let Some(req) = popped else { break };
                self.accept(req, Some(ul.clone()), ready_at);
                room -= 1;
            }
        }

        while room > 0 {
            let Some(req) = self.internal_pq.pop_pq() else { break };
            self.accept(req, None, ready_at);
            room -= 1;
        }
    }

    fn accept(&mut self, req: Request, origin: Option<ChannelRef>, ready_at: TimePoint) {
        self.cpu = req.cpu;
        let entry = TagCheckEntry {
            req,
            origin,
            ready: ready_at,
        };
        if !entry.req.is_translated && self.lower_translate.is_some() {
            self.translation_stash.push(entry);
        } else {
            self.inflight_tag_check.push_back(entry);
        }
    }

    /// Issues translation requests for stashed virtual-address entries.
    fn issue_stashed_translations(&mut self) {
        let Some(translator) = self.lower_translate.clone() else {
            return;
        };
        for entry in &mut self.translation_stash {
            if entry.req.address.value() != 0 {
                let fwd = Request {
                    address: entry.req.v_address,
                    v_address: entry.req.v_address,
                    ip: entry.req.ip,
                    instr_id: entry.req.instr_id,
                    cpu: entry.req.cpu,
                    asid: entry.req.asid,
                    ty: AccessType::Load,
                    is_translated: false,
                    response_requested: true,
                    ..Request::default()
                };
                if translator.borrow_mut().add_rq(fwd) {
                    // Mark issued by clearing the stale untranslated address.
                    entry.req.address = Address::default();
                }
            }
        }
    }

    /// Applies TLB responses to stashed entries sharing the page.
    fn drain_translation_responses(&mut self, now: TimePoint) {
        let Some(translator) = self.lower_translate.clone() else {
            return;
        };
        let responses: Vec<Response> = translator.borrow_mut().returned.drain(..).collect();
        if responses.is_empty() {
            return;
        }
        let ready_at = if self.warmup { now } else { now + self.hit_latency };
        for resp in responses {
            let mut i = 0;
            while i < self.translation_stash.len() {
                let matches_page = self.translation_stash[i].req.v_address.page_number().value()
                    == resp.v_address.page_number().value();
                if matches_page {
                    let mut entry = self.translation_stash.remove(i);
                    entry.req.address = Address::from(splice_bits(
                        resp.data.value(),
                        entry.req.v_address.value(),
                        LOG2_PAGE_SIZE,
                    ));
                    entry.req.is_translated = true;
                    entry.ready = ready_at;
                    self.inflight_tag_check.push_back(entry);
                } else {
                    i += 1;
                }
            }
        }
    }

    /// Submits a prefetch generated at this level.
    ///
    /// Counts a request always and an issue only when the internal prefetch
    /// queue accepts it. Returns true when accepted.
    pub fn prefetch_line(&mut self, address: Address, fill_this_level: bool, metadata: u32) -> bool {
        self.sim_stats.pf_requested += 1;
        let req = Request {
            address,
            v_address: if self.virtual_prefetch { address } else { Address::default() },
            ty: AccessType::Prefetch,
            cpu: self.cpu,
            pf_metadata: metadata,
            is_translated: !self.virtual_prefetch,
            response_requested: false,
            fill_this_level,
            prefetch_from_this: true,
            ..Request::default()
        };
        let ok = self.internal_pq.add_pq(req);
        if ok {
            self.sim_stats.pf_issued += 1;
        }
        ok
    }

    /// Forwards a branch outcome to the prefetcher hook (instruction
    /// caches).
    pub fn prefetcher_branch_operate(&mut self, ip: Address, branch_type: u8, target: Address) {
        self.prefetcher.branch_operate(ip, branch_type, target);
    }

    /// Invalidates the block holding `address`, if present. Returns the way.
    pub fn invalidate_entry(&mut self, address: Address) -> Option<usize> {
        let range = self.block_range(address);
        let way = self.blocks[range.clone()]
            .iter()
            .position(|b| self.matches(b, address));
        if let Some(way) = way {
            self.blocks[range.start + way].valid = false;
        }
        way
    }

    /// Direct array probe, bypassing timing. Used by tests and diagnostics.
    pub fn probe_block(&self, address: Address) -> Option<&CacheBlock> {
        let range = self.block_range(address);
        self.blocks[range].iter().find(|b| self.matches(b, address))
    }

    /// Starts a new statistics phase.
    pub fn begin_phase(&mut self) {
        let num_cpus = self.sim_stats.hits[0].len();
        self.sim_stats = CacheStats::new(&self.name, num_cpus);
        self.roi_stats = CacheStats::new(&self.name, num_cpus);
    }

    /// Freezes the current counters as the region-of-interest results.
    pub fn end_phase(&mut self) {
        self.roi_stats = self.sim_stats.clone();
    }

    /// Emits policy statistics at the end of the run.
    pub fn final_stats(&self) {
        self.replacement.final_stats();
        self.prefetcher.final_stats();
    }

    /// Dumps MSHR and pipeline state for deadlock diagnosis.
    pub fn print_deadlock(&self) {
        if self.mshr.is_empty() {
            debug!(cache = %self.name, "MSHR empty");
        }
        for (i, entry) in self.mshr.iter().enumerate() {
            debug!(cache = %self.name, entry = i, instr_id = entry.req.instr_id,
                   address = %format_args!("{:#x}", entry.req.address.value()),
                   ty = entry.req.ty.name(), ready = ?entry.event, "MSHR entry");
        }
        for entry in &self.inflight_tag_check {
            debug!(cache = %self.name, instr_id = entry.req.instr_id,
                   address = %format_args!("{:#x}", entry.req.address.value()),
                   ty = entry.req.ty.name(), ready = ?entry.ready, "tag-check entry");
        }
    }
}
