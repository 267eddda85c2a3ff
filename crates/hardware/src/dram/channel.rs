//! One DRAM channel: per-bank state, open rows, refresh, and the data bus.
//!
//! The channel services one request on the data bus at a time. Banks are
//! charged tCAS for a column access, plus tRCD to activate a row and tRP to
//! precharge first when a different row is open. Refresh rounds fire every
//! tREF, walking a row cursor; a refreshing bank accepts no requests. Reads
//! and writes share the bus, so the channel batches writes behind occupancy
//! watermarks and pays a turnaround penalty on each direction switch.

use tracing::debug;

use crate::channel::{ChannelRef, Request, Response};
use crate::common::addr::Address;
use crate::common::bits::{bitmask, lg2};
use crate::common::chrono::{Picos, TimePoint};
use crate::stats::DramChannelStats;

/// Maps an address to its {bank, column, rank, row} coordinates.
///
/// The field layout, low bits first, is
/// `| offset | channel | bank | column | rank | row |`.
#[derive(Clone, Copy, Debug)]
pub struct DramSlicer {
    bank_shift: u32,
    bank_bits: u32,
    column_bits: u32,
    rank_bits: u32,
    row_bits: u32,
}

impl DramSlicer {
    /// Builds a slicer; `start_bits` covers the block offset and channel
    /// index below the bank field.
    pub const fn new(
        start_bits: u32,
        banks: usize,
        columns: usize,
        ranks: usize,
        rows: usize,
    ) -> Self {
        Self {
            bank_shift: start_bits,
            bank_bits: lg2(banks as u64),
            column_bits: lg2(columns as u64),
            rank_bits: lg2(ranks as u64),
            row_bits: lg2(rows as u64),
        }
    }

    /// Bank index of `address`.
    pub const fn bank(&self, address: Address) -> u64 {
        (address.value() >> self.bank_shift) & bitmask(self.bank_bits)
    }

    /// Column index of `address`.
    pub const fn column(&self, address: Address) -> u64 {
        (address.value() >> (self.bank_shift + self.bank_bits)) & bitmask(self.column_bits)
    }

    /// Rank index of `address`.
    pub const fn rank(&self, address: Address) -> u64 {
        (address.value() >> (self.bank_shift + self.bank_bits + self.column_bits))
            & bitmask(self.rank_bits)
    }

    /// Row index of `address`.
    pub const fn row(&self, address: Address) -> u64 {
        (address.value()
            >> (self.bank_shift + self.bank_bits + self.column_bits + self.rank_bits))
            & bitmask(self.row_bits)
    }
}

/// A queued DRAM request.
#[derive(Clone)]
pub(crate) struct DramRequest {
    pub address: Address,
    pub v_address: Address,
    pub data: Address,
    pub pf_metadata: u32,
    pub instr_depend_on_me: Vec<u64>,
    pub to_return: Vec<ChannelRef>,
    pub scheduled: bool,
    pub forward_checked: bool,
    pub ready_time: TimePoint,
}

impl DramRequest {
    pub(crate) fn new(req: &Request, origin: Option<&ChannelRef>, now: TimePoint) -> Self {
        Self {
            address: req.address,
            v_address: req.v_address,
            data: req.data,
            pf_metadata: req.pf_metadata,
            instr_depend_on_me: req.instr_depend_on_me.clone(),
            to_return: origin
                .filter(|_| req.response_requested)
                .cloned()
                .into_iter()
                .collect(),
            scheduled: false,
            forward_checked: false,
            ready_time: now,
        }
    }

    fn respond(&self, data: Address) {
        let response = Response {
            address: self.address,
            v_address: self.v_address,
            data,
            pf_metadata: self.pf_metadata,
            instr_depend_on_me: self.instr_depend_on_me.clone(),
        };
        for ret in &self.to_return {
            ret.borrow_mut().returned.push_back(response.clone());
        }
    }
}

/// Per-bank request state.
#[derive(Clone, Default)]
struct BankRequest {
    valid: bool,
    row_buffer_hit: bool,
    need_refresh: bool,
    under_refresh: bool,
    open_row: Option<u64>,
    ready_time: TimePoint,
    /// `(from write queue, queue index)` of the request being serviced.
    pkt: Option<(bool, usize)>,
}

/// Static parameters of one DRAM channel.
pub struct DramChannelParams {
    /// Display name, e.g. `"Channel 0"`.
    pub name: String,
    /// Rows per bank.
    pub rows: usize,
    /// Columns per row.
    pub columns: usize,
    /// Ranks on the channel.
    pub ranks: usize,
    /// Banks per rank.
    pub banks: usize,
    /// Read queue capacity.
    pub rq_size: usize,
    /// Write queue capacity.
    pub wq_size: usize,
    /// Row precharge time.
    pub t_rp: Picos,
    /// Row-to-column delay.
    pub t_rcd: Picos,
    /// Column access strobe time.
    pub t_cas: Picos,
    /// Full-array refresh period.
    pub refresh_period: Picos,
    /// Rows refreshed per refresh round.
    pub rows_per_refresh: usize,
    /// Bus turnaround penalty on a read/write direction switch.
    pub turnaround: Picos,
    /// Time to stream one block over the bus.
    pub dbus_return_time: Picos,
    /// Address slicer for this channel.
    pub slicer: DramSlicer,
}

/// One DRAM channel.
pub struct DramChannel {
    name: String,
    rq: Vec<Option<DramRequest>>,
    wq: Vec<Option<DramRequest>>,
    bank_request: Vec<BankRequest>,
    active_request: Option<usize>,
    dbus_cycle_available: TimePoint,
    write_mode: bool,
    last_refresh: TimePoint,
    refresh_row: u64,

    rows: usize,
    rows_per_refresh: usize,
    banks_per_rank: usize,
    t_rp: Picos,
    t_rcd: Picos,
    t_cas: Picos,
    t_ref: Picos,
    turnaround: Picos,
    dbus_return_time: Picos,
    slicer: DramSlicer,
    warmup: bool,

    /// Counters for the current phase.
    pub sim_stats: DramChannelStats,
    /// Counters frozen at the end of the region of interest.
    pub roi_stats: DramChannelStats,
}

impl DramChannel {
    /// Builds a channel from its parameters.
    pub fn new(params: DramChannelParams) -> Self {
        let refresh_rounds = (params.rows / params.rows_per_refresh).max(1) as u64;
        let mut stats = DramChannelStats::default();
        stats.name.clone_from(&params.name);
        Self {
            name: params.name,
            rq: vec![None; params.rq_size],
            wq: vec![None; params.wq_size],
            bank_request: vec![BankRequest::default(); params.ranks * params.banks],
            active_request: None,
            dbus_cycle_available: TimePoint::ZERO,
            write_mode: false,
            last_refresh: TimePoint::ZERO,
            refresh_row: 0,
            rows: params.rows,
            rows_per_refresh: params.rows_per_refresh,
            banks_per_rank: params.banks,
            t_rp: params.t_rp,
            t_rcd: params.t_rcd,
            t_cas: params.t_cas,
            t_ref: Picos(params.refresh_period.as_picos() / refresh_rounds),
            turnaround: params.turnaround,
            dbus_return_time: params.dbus_return_time,
            slicer: params.slicer,
            warmup: false,
            roi_stats: stats.clone(),
            sim_stats: stats,
        }
    }

    /// The channel's display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sets the warmup flag (requests complete in the same tick).
    pub fn set_warmup(&mut self, warmup: bool) {
        self.warmup = warmup;
    }

    /// True while the channel is draining writes.
    pub const fn is_write_mode(&self) -> bool {
        self.write_mode
    }

    /// Read queue occupancy.
    pub fn rq_occupancy(&self) -> usize {
        self.rq.iter().flatten().count()
    }

    /// Write queue occupancy.
    pub fn wq_occupancy(&self) -> usize {
        self.wq.iter().flatten().count()
    }

    fn bank_index(&self, address: Address) -> usize {
        (self.slicer.rank(address) * self.banks_per_rank as u64 + self.slicer.bank(address))
            as usize
    }

    /// Accepts a read request into a free RQ slot.
    pub(crate) fn add_rq(&mut self, request: DramRequest) -> bool {
        if let Some(slot) = self.rq.iter_mut().find(|s| s.is_none()) {
            *slot = Some(request);
            true
        } else {
            false
        }
    }

    /// Accepts a write request into a free WQ slot. Counts `WQ_FULL` on
    /// rejection.
    pub(crate) fn add_wq(&mut self, request: DramRequest) -> bool {
        if let Some(slot) = self.wq.iter_mut().find(|s| s.is_none()) {
            *slot = Some(request);
            true
        } else {
            self.sim_stats.wq_full += 1;
            false
        }
    }

    /// Advances the channel by one tick. Returns a progress count.
    pub fn operate(&mut self, now: TimePoint) -> u64 {
        let mut progress = 0_u64;

        if self.warmup {
            for slot in &mut self.rq {
                if let Some(entry) = slot.take() {
                    entry.respond(entry.data);
                    progress += 1;
                }
            }
            for slot in &mut self.wq {
                if slot.take().is_some() {
                    progress += 1;
                }
            }
        }

        self.check_write_collision();
        self.check_read_collision();
        progress += self.finish_dbus_request(now);
        self.swap_write_mode(now);
        progress += self.schedule_refresh(now);
        progress += self.populate_dbus(now);
        let candidate = self.schedule_packet();
        progress += self.service_packet(candidate, now);

        progress
    }

    /// Duplicate writes to a block are dropped; the queued write stands for
    /// both.
    fn check_write_collision(&mut self) {
        for i in 0..self.wq.len() {
            let Some(entry) = &self.wq[i] else { continue };
            if entry.forward_checked {
                continue;
            }
            let block = entry.address.block_number().value();
            let dup = self
                .wq
                .iter()
                .enumerate()
                .any(|(j, other)| {
                    j != i
                        && other
                            .as_ref()
                            .is_some_and(|o| o.address.block_number().value() == block)
                });
            if dup {
                self.wq[i] = None;
            } else if let Some(entry) = &mut self.wq[i] {
                entry.forward_checked = true;
            }
        }
    }

    /// Reads are served from a queued write to the same block, or merged
    /// into another read of that block.
    fn check_read_collision(&mut self) {
        for i in 0..self.rq.len() {
            let Some(entry) = &self.rq[i] else { continue };
            if entry.forward_checked {
                continue;
            }
            let block = entry.address.block_number().value();

            let wq_hit = self
                .wq
                .iter()
                .flatten()
                .find(|w| w.address.block_number().value() == block)
                .map(|w| w.data);
            if let Some(data) = wq_hit {
                if let Some(entry) = self.rq[i].take() {
                    entry.respond(data);
                }
                continue;
            }

            let other = (0..self.rq.len()).find(|&j| {
                j != i
                    && self.rq[j]
                        .as_ref()
                        .is_some_and(|o| o.address.block_number().value() == block)
            });
            if let Some(j) = other {
                let Some(removed) = self.rq[i].take() else { continue };
                if let Some(kept) = &mut self.rq[j] {
                    kept.instr_depend_on_me.extend(removed.instr_depend_on_me);
                    kept.instr_depend_on_me.sort_unstable();
                    kept.instr_depend_on_me.dedup();
                    for ret in removed.to_return {
                        if !kept.to_return.iter().any(|r| std::rc::Rc::ptr_eq(r, &ret)) {
                            kept.to_return.push(ret);
                        }
                    }
                }
            } else if let Some(entry) = &mut self.rq[i] {
                entry.forward_checked = true;
            }
        }
    }

    /// Publishes the response of a request whose bus transfer finished.
    fn finish_dbus_request(&mut self, now: TimePoint) -> u64 {
        let Some(bank_idx) = self.active_request else {
            return 0;
        };
        if self.bank_request[bank_idx].ready_time > now {
            return 0;
        }

        if let Some((is_write, qidx)) = self.bank_request[bank_idx].pkt {
            let queue = if is_write { &mut self.wq } else { &mut self.rq };
            if let Some(entry) = queue[qidx].take() {
                entry.respond(entry.data);
            }
        }
        self.bank_request[bank_idx].valid = false;
        self.bank_request[bank_idx].pkt = None;
        self.active_request = None;
        1
    }

    /// Switches between read and write mode at the occupancy watermarks.
    fn swap_write_mode(&mut self, now: TimePoint) {
        let high_wm = (self.wq.len() * 7) >> 3;
        let low_wm = (self.wq.len() * 6) >> 3;

        let wq_occu = self.wq_occupancy();
        let rq_occu = self.rq_occupancy();

        let enter_write = !self.write_mode && (wq_occu >= high_wm || (rq_occu == 0 && wq_occu > 0));
        let leave_write = self.write_mode && (wq_occu == 0 || (rq_occu > 0 && wq_occu < low_wm));
        if !(enter_write || leave_write) {
            return;
        }

        debug!(channel = %self.name, to_write_mode = enter_write, "bus direction switch");

        // Unschedule everything not already on the bus.
        for idx in 0..self.bank_request.len() {
            if Some(idx) == self.active_request || !self.bank_request[idx].valid {
                continue;
            }
            // A row activated but not yet strobed has not really opened.
            if self.bank_request[idx].ready_time < now + self.t_cas {
                self.bank_request[idx].open_row = None;
            }
            self.bank_request[idx].valid = false;
            if let Some((is_write, qidx)) = self.bank_request[idx].pkt.take() {
                let queue = if is_write { &mut self.wq } else { &mut self.rq };
                if let Some(entry) = &mut queue[qidx] {
                    entry.scheduled = false;
                    entry.ready_time = now;
                }
            }
        }

        self.dbus_cycle_available = self.active_request.map_or(now, |idx| {
            self.bank_request[idx].ready_time
        }) + self.turnaround;

        self.write_mode = !self.write_mode;
    }

    /// Issues refresh rounds and completes per-bank refreshes.
    fn schedule_refresh(&mut self, now: TimePoint) -> u64 {
        let mut progress = 0_u64;

        let refresh_due = now >= self.last_refresh + self.t_ref;
        if refresh_due {
            self.last_refresh = now;
            self.refresh_row += self.rows_per_refresh as u64;
            self.sim_stats.refresh_cycles += 1;
            if self.refresh_row >= self.rows as u64 {
                self.refresh_row = 0;
            }
        }

        for bank in &mut self.bank_request {
            if refresh_due {
                bank.need_refresh = true;
            }
            if bank.need_refresh && !bank.valid {
                bank.ready_time = now + self.t_cas + self.t_rcd;
                bank.need_refresh = false;
                bank.under_refresh = true;
            } else if bank.under_refresh && bank.ready_time <= now {
                bank.under_refresh = false;
                bank.open_row = None;
                progress += 1;
            }
        }

        progress
    }

    /// Moves the earliest-ready scheduled request onto the data bus.
    fn populate_dbus(&mut self, now: TimePoint) -> u64 {
        let candidate = self
            .bank_request
            .iter()
            .enumerate()
            .filter(|(_, b)| b.valid && !b.under_refresh)
            .min_by_key(|(_, b)| b.ready_time)
            .map(|(idx, _)| idx);
        let Some(idx) = candidate else { return 0 };
        if self.bank_request[idx].ready_time > now {
            return 0;
        }

        if self.active_request.is_none() && self.dbus_cycle_available <= now {
            self.bank_request[idx].ready_time = now + self.dbus_return_time;
            self.active_request = Some(idx);

            if self.bank_request[idx].row_buffer_hit {
                if self.write_mode {
                    self.sim_stats.wq_row_buffer_hit += 1;
                } else {
                    self.sim_stats.rq_row_buffer_hit += 1;
                }
            } else if self.write_mode {
                self.sim_stats.wq_row_buffer_miss += 1;
            } else {
                self.sim_stats.rq_row_buffer_miss += 1;
            }
            1
        } else {
            let busy_until = self
                .active_request
                .map_or(self.dbus_cycle_available, |a| self.bank_request[a].ready_time);
            self.sim_stats.dbus_cycle_congested_ps += busy_until.since(now).as_picos();
            self.sim_stats.dbus_count_congested += 1;
            0
        }
    }

    /// Picks the next unscheduled queue entry for the active mode.
    ///
    /// Entries whose bank is free beat entries whose bank is busy; within
    /// each class the earlier ready time wins, and the older entry stands
    /// on ties.
    fn schedule_packet(&mut self) -> Option<usize> {
        let queue = if self.write_mode { &self.wq } else { &self.rq };

        let mut best: Option<usize> = None;
        for (idx, slot) in queue.iter().enumerate() {
            let Some(entry) = slot else { continue };
            if entry.scheduled {
                continue;
            }
            match best {
                None => best = Some(idx),
                Some(prev) => {
                    let Some(prev_entry) = &queue[prev] else {
                        best = Some(idx);
                        continue;
                    };
                    let prev_free = !self.bank_request[self.bank_index(prev_entry.address)].valid;
                    let this_free = !self.bank_request[self.bank_index(entry.address)].valid;
                    let better = if prev_free == this_free {
                        entry.ready_time < prev_entry.ready_time
                    } else {
                        this_free
                    };
                    if better {
                        best = Some(idx);
                    }
                }
            }
        }
        best
    }

    /// Schedules the chosen entry onto its bank if the bank is idle.
    fn service_packet(&mut self, candidate: Option<usize>, now: TimePoint) -> u64 {
        let Some(qidx) = candidate else { return 0 };
        let is_write = self.write_mode;

        let (address, ready) = {
            let queue = if is_write { &self.wq } else { &self.rq };
            let Some(entry) = &queue[qidx] else { return 0 };
            (entry.address, entry.ready_time)
        };
        if ready > now {
            return 0;
        }

        let op_row = self.slicer.row(address);
        let op_idx = self.bank_index(address);
        let bank = &mut self.bank_request[op_idx];
        if bank.valid || bank.under_refresh {
            return 0;
        }

        let row_buffer_hit = bank.open_row == Some(op_row);
        let row_charge_delay = if bank.open_row.is_some() {
            self.t_rp + self.t_rcd
        } else {
            self.t_rcd
        };
        let delay = if row_buffer_hit {
            Picos::ZERO
        } else {
            row_charge_delay
        };

        *bank = BankRequest {
            valid: true,
            row_buffer_hit,
            need_refresh: bank.need_refresh,
            under_refresh: false,
            open_row: Some(op_row),
            ready_time: now + self.t_cas + delay,
            pkt: Some((is_write, qidx)),
        };

        let queue = if is_write { &mut self.wq } else { &mut self.rq };
        if let Some(entry) = &mut queue[qidx] {
            entry.scheduled = true;
            entry.ready_time = TimePoint::MAX;
        }
        1
    }

    /// Starts a new statistics phase.
    pub fn begin_phase(&mut self) {
        let name = self.sim_stats.name.clone();
        self.sim_stats = DramChannelStats {
            name: name.clone(),
            ..DramChannelStats::default()
        };
        self.roi_stats = DramChannelStats {
            name,
            ..DramChannelStats::default()
        };
    }

    /// Freezes the current counters as the region-of-interest results.
    pub fn end_phase(&mut self) {
        self.roi_stats = self.sim_stats.clone();
    }

    /// Dumps queue state for deadlock diagnosis.
    pub fn print_deadlock(&self) {
        for entry in self.rq.iter().flatten() {
            debug!(channel = %self.name,
                   address = %format_args!("{:#x}", entry.address.value()),
                   scheduled = entry.scheduled, "RQ entry");
        }
        for entry in self.wq.iter().flatten() {
            debug!(channel = %self.name,
                   address = %format_args!("{:#x}", entry.address.value()),
                   scheduled = entry.scheduled, "WQ entry");
        }
    }
}
