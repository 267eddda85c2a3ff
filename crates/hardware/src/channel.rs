//! Point-to-point request/response channels between memory components.
//!
//! A channel sits between exactly two components: the upper level appends to
//! the read, write, and prefetch queues, and the lower level drains them and
//! appends responses to `returned`. Both endpoints hold the channel through a
//! shared handle ([`ChannelRef`]); the simulation is single-threaded and
//! cooperative, so runtime borrows never overlap.
//!
//! Before the lower level checks tags each tick it runs the channel's
//! collision pass: duplicate writes are dropped by block, reads and
//! prefetches are served directly from a matching write or merged into an
//! older request to the same block.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::common::addr::Address;
use crate::common::bits::bitmask;

/// What a request is asking the hierarchy to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum AccessType {
    /// Demand read.
    #[default]
    Load,
    /// Read with intent to modify (store miss path).
    Rfo,
    /// Speculative read issued by a prefetcher.
    Prefetch,
    /// Writeback of a dirty block.
    Write,
    /// Page-table walk read.
    Translation,
}

impl AccessType {
    /// Number of access types.
    pub const COUNT: usize = 5;

    /// All access types, in stats-reporting order.
    pub const ALL: [Self; Self::COUNT] = [
        Self::Load,
        Self::Rfo,
        Self::Prefetch,
        Self::Write,
        Self::Translation,
    ];

    /// Stable index for per-type statistics arrays.
    pub const fn index(self) -> usize {
        match self {
            Self::Load => 0,
            Self::Rfo => 1,
            Self::Prefetch => 2,
            Self::Write => 3,
            Self::Translation => 4,
        }
    }

    /// Display name used by the statistics printers.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Load => "LOAD",
            Self::Rfo => "RFO",
            Self::Prefetch => "PREFETCH",
            Self::Write => "WRITE",
            Self::Translation => "TRANSLATION",
        }
    }
}

/// A request traveling down the hierarchy.
#[derive(Clone, Debug)]
pub struct Request {
    /// Physical address when `is_translated`, else the virtual address.
    pub address: Address,
    /// The originating virtual address.
    pub v_address: Address,
    /// Program counter of the instruction that caused the access.
    pub ip: Address,
    /// Payload; for translation responses this is the physical address.
    pub data: Address,
    /// Id of the instruction that caused the access.
    pub instr_id: u64,
    /// Originating CPU.
    pub cpu: usize,
    /// Address space identifiers.
    pub asid: [u8; 2],
    /// Access type.
    pub ty: AccessType,
    /// Opaque prefetcher metadata, carried end-to-end.
    pub pf_metadata: u32,
    /// True once `address` holds a physical address.
    pub is_translated: bool,
    /// True when the requester wants the response routed back.
    pub response_requested: bool,
    /// True when the receiving cache should fill its own array.
    pub fill_this_level: bool,
    /// True when this cache itself issued the prefetch.
    pub prefetch_from_this: bool,
    /// Ids of instructions waiting on this request.
    pub instr_depend_on_me: Vec<u64>,
    /// Set once the collision pass has inspected this entry.
    pub forward_checked: bool,
}

impl Default for Request {
    fn default() -> Self {
        Self {
            address: Address::default(),
            v_address: Address::default(),
            ip: Address::default(),
            data: Address::default(),
            instr_id: 0,
            cpu: 0,
            asid: [u8::MAX, u8::MAX],
            ty: AccessType::Load,
            pf_metadata: 0,
            is_translated: false,
            response_requested: true,
            fill_this_level: true,
            prefetch_from_this: false,
            instr_depend_on_me: Vec::new(),
            forward_checked: false,
        }
    }
}

/// A response traveling back up the hierarchy.
#[derive(Clone, Debug, Default)]
pub struct Response {
    /// The serviced address, as it appeared in the request.
    pub address: Address,
    /// The originating virtual address.
    pub v_address: Address,
    /// Payload; for translations, the physical address.
    pub data: Address,
    /// Prefetcher metadata, possibly updated by the servicing level.
    pub pf_metadata: u32,
    /// Ids of instructions waiting on this response.
    pub instr_depend_on_me: Vec<u64>,
}

/// Counters for one queue of a channel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Requests presented to the queue.
    pub access: u64,
    /// Requests merged into an existing entry.
    pub merged: u64,
    /// Requests rejected because the queue was full.
    pub full: u64,
    /// Requests accepted.
    pub to_cache: u64,
}

/// Per-channel statistics for one phase.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChannelStats {
    /// Read queue counters.
    pub rq: QueueStats,
    /// Write queue counters.
    pub wq: QueueStats,
    /// Prefetch queue counters.
    pub pq: QueueStats,
    /// Reads and prefetches served directly from a queued write.
    pub wq_forward: u64,
}

/// The request/response medium between two memory components.
pub struct Channel {
    rq: VecDeque<Request>,
    wq: VecDeque<Request>,
    pq: VecDeque<Request>,
    /// Responses appended by the lower level, drained by the upper level.
    pub returned: VecDeque<Response>,
    rq_size: usize,
    wq_size: usize,
    pq_size: usize,
    offset_bits: u32,
    match_offset_bits: bool,
    /// Counters for the current phase.
    pub sim_stats: ChannelStats,
    /// Counters frozen at the end of the region of interest.
    pub roi_stats: ChannelStats,
}

/// Shared handle to a channel, held by both endpoints.
pub type ChannelRef = Rc<RefCell<Channel>>;

impl Channel {
    /// Creates a channel with the given queue bounds.
    ///
    /// `offset_bits` is the block-offset width used for address matching;
    /// when `match_offset_bits` is set, writes match on the full address
    /// instead of the block number.
    pub fn new(
        rq_size: usize,
        pq_size: usize,
        wq_size: usize,
        offset_bits: u32,
        match_offset_bits: bool,
    ) -> Self {
        Self {
            rq: VecDeque::new(),
            wq: VecDeque::new(),
            pq: VecDeque::new(),
            returned: VecDeque::new(),
            rq_size,
            wq_size,
            pq_size,
            offset_bits,
            match_offset_bits,
            sim_stats: ChannelStats::default(),
            roi_stats: ChannelStats::default(),
        }
    }

    /// Creates a shared handle to a new channel.
    pub fn new_ref(
        rq_size: usize,
        pq_size: usize,
        wq_size: usize,
        offset_bits: u32,
        match_offset_bits: bool,
    ) -> ChannelRef {
        Rc::new(RefCell::new(Self::new(
            rq_size,
            pq_size,
            wq_size,
            offset_bits,
            match_offset_bits,
        )))
    }

    /// Appends to the read queue. Returns false when full.
    pub fn add_rq(&mut self, packet: Request) -> bool {
        self.sim_stats.rq.access += 1;
        let ok = Self::do_add(&mut self.rq, self.rq_size, packet);
        if ok {
            self.sim_stats.rq.to_cache += 1;
        } else {
            self.sim_stats.rq.full += 1;
        }
        ok
    }

    /// Appends to the write queue. Returns false when full.
    pub fn add_wq(&mut self, packet: Request) -> bool {
        self.sim_stats.wq.access += 1;
        let ok = Self::do_add(&mut self.wq, self.wq_size, packet);
        if ok {
            self.sim_stats.wq.to_cache += 1;
        } else {
            self.sim_stats.wq.full += 1;
        }
        ok
    }

    /// Appends to the prefetch queue. Returns false when full.
    pub fn add_pq(&mut self, packet: Request) -> bool {
        self.sim_stats.pq.access += 1;
        let ok = Self::do_add(&mut self.pq, self.pq_size, packet);
        if ok {
            self.sim_stats.pq.to_cache += 1;
        } else {
            self.sim_stats.pq.full += 1;
        }
        ok
    }

    fn do_add(queue: &mut VecDeque<Request>, size: usize, mut packet: Request) -> bool {
        if queue.len() >= size {
            return false;
        }
        packet.forward_checked = false;
        queue.push_back(packet);
        true
    }

    /// Oldest read request, if any.
    pub fn rq_front(&self) -> Option<&Request> {
        self.rq.front()
    }

    /// Oldest write request, if any.
    pub fn wq_front(&self) -> Option<&Request> {
        self.wq.front()
    }

    /// Oldest prefetch request, if any.
    pub fn pq_front(&self) -> Option<&Request> {
        self.pq.front()
    }

    /// Removes and returns the oldest read request.
    pub fn pop_rq(&mut self) -> Option<Request> {
        self.rq.pop_front()
    }

    /// Removes and returns the oldest write request.
    pub fn pop_wq(&mut self) -> Option<Request> {
        self.wq.pop_front()
    }

    /// Removes and returns the oldest prefetch request.
    pub fn pop_pq(&mut self) -> Option<Request> {
        self.pq.pop_front()
    }

    /// Read queue occupancy.
    pub fn rq_occupancy(&self) -> usize {
        self.rq.len()
    }

    /// Write queue occupancy.
    pub fn wq_occupancy(&self) -> usize {
        self.wq.len()
    }

    /// Prefetch queue occupancy.
    pub fn pq_occupancy(&self) -> usize {
        self.pq.len()
    }

    /// Read queue capacity.
    pub const fn rq_size(&self) -> usize {
        self.rq_size
    }

    /// Write queue capacity.
    pub const fn wq_size(&self) -> usize {
        self.wq_size
    }

    /// Prefetch queue capacity.
    pub const fn pq_size(&self) -> usize {
        self.pq_size
    }

    fn match_shamt(&self, write_side: bool) -> u32 {
        if write_side && self.match_offset_bits {
            0
        } else {
            self.offset_bits
        }
    }

    /// Two requests collide when they name the same block in the same
    /// address space.
    fn collides(a: &Request, b: &Request, shamt: u32) -> bool {
        a.is_translated == b.is_translated
            && (a.address.value() >> shamt) & bitmask(64 - shamt)
                == (b.address.value() >> shamt) & bitmask(64 - shamt)
    }

    fn merge_into(dest: &mut Request, src: Request) {
        dest.fill_this_level |= src.fill_this_level;
        dest.response_requested |= src.response_requested;
        let mut deps = std::mem::take(&mut dest.instr_depend_on_me);
        deps.extend(src.instr_depend_on_me);
        deps.sort_unstable();
        deps.dedup();
        dest.instr_depend_on_me = deps;
    }

    /// Runs the collision pass over all three queues.
    ///
    /// The lower level invokes this once per tick before tag checks.
    pub fn check_collision(&mut self) {
        let write_shamt = self.match_shamt(true);
        let read_shamt = self.match_shamt(false);

        // Duplicate writes are dropped by block number.
        let mut i = 0;
        while i < self.wq.len() {
            if self.wq[i].forward_checked {
                i += 1;
                continue;
            }
            let dup = (0..i).find(|&j| Self::collides(&self.wq[j], &self.wq[i], write_shamt));
            if let Some(j) = dup {
                let removed = self.wq.remove(i).unwrap_or_default();
                Self::merge_into(&mut self.wq[j], removed);
                self.sim_stats.wq.merged += 1;
            } else {
                self.wq[i].forward_checked = true;
                i += 1;
            }
        }

        Self::check_readlike_collisions(
            &mut self.rq,
            &self.wq,
            &mut self.returned,
            &mut self.sim_stats.rq,
            &mut self.sim_stats.wq_forward,
            read_shamt,
            write_shamt,
        );
        Self::check_readlike_collisions(
            &mut self.pq,
            &self.wq,
            &mut self.returned,
            &mut self.sim_stats.pq,
            &mut self.sim_stats.wq_forward,
            read_shamt,
            write_shamt,
        );
    }

    fn check_readlike_collisions(
        queue: &mut VecDeque<Request>,
        wq: &VecDeque<Request>,
        returned: &mut VecDeque<Response>,
        stats: &mut QueueStats,
        wq_forward: &mut u64,
        read_shamt: u32,
        write_shamt: u32,
    ) {
        let mut i = 0;
        while i < queue.len() {
            if queue[i].forward_checked {
                i += 1;
                continue;
            }

            // Forward from a matching write: the data already lives here.
            if let Some(wq_entry) = wq
                .iter()
                .find(|w| Self::collides(w, &queue[i], write_shamt))
            {
                let entry = queue.remove(i).unwrap_or_default();
                if entry.response_requested {
                    returned.push_back(Response {
                        address: entry.address,
                        v_address: entry.v_address,
                        data: wq_entry.data,
                        pf_metadata: entry.pf_metadata,
                        instr_depend_on_me: entry.instr_depend_on_me,
                    });
                }
                *wq_forward += 1;
                continue;
            }

            // Merge with an older in-flight request to the same block.
            let dup = (0..i).find(|&j| Self::collides(&queue[j], &queue[i], read_shamt));
            if let Some(j) = dup {
                let removed = queue.remove(i).unwrap_or_default();
                Self::merge_into(&mut queue[j], removed);
                stats.merged += 1;
            } else {
                queue[i].forward_checked = true;
                i += 1;
            }
        }
    }

    /// Starts a new statistics phase.
    pub fn begin_phase(&mut self) {
        self.sim_stats = ChannelStats::default();
        self.roi_stats = ChannelStats::default();
    }

    /// Freezes the current counters as the region-of-interest results.
    pub fn end_phase(&mut self) {
        self.roi_stats = self.sim_stats;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_to(addr: u64) -> Request {
        Request {
            address: Address::from(addr),
            v_address: Address::from(addr),
            is_translated: true,
            ..Request::default()
        }
    }

    fn write_to(addr: u64, data: u64) -> Request {
        Request {
            ty: AccessType::Write,
            data: Address::from(data),
            ..read_to(addr)
        }
    }

    #[test]
    fn bounded_queues_reject_when_full() {
        let mut ch = Channel::new(1, 1, 1, 6, false);
        assert!(ch.add_rq(read_to(0x1000)));
        assert!(!ch.add_rq(read_to(0x2000)));
        assert_eq!(ch.sim_stats.rq.full, 1);
        assert_eq!(ch.sim_stats.rq.to_cache, 1);
    }

    #[test]
    fn duplicate_reads_merge_by_block() {
        let mut ch = Channel::new(8, 8, 8, 6, false);
        let mut first = read_to(0x1000);
        first.instr_depend_on_me = vec![1];
        let mut second = read_to(0x1008); // same block, different offset
        second.instr_depend_on_me = vec![2];
        assert!(ch.add_rq(first));
        assert!(ch.add_rq(second));

        ch.check_collision();

        assert_eq!(ch.rq_occupancy(), 1);
        assert_eq!(ch.sim_stats.rq.merged, 1);
        let merged = ch.pop_rq().unwrap();
        assert_eq!(merged.instr_depend_on_me, vec![1, 2]);
    }

    #[test]
    fn read_forwards_from_matching_write() {
        let mut ch = Channel::new(8, 8, 8, 6, false);
        assert!(ch.add_wq(write_to(0x1000, 0xDA7A)));
        assert!(ch.add_rq(read_to(0x1000)));

        ch.check_collision();

        assert_eq!(ch.rq_occupancy(), 0);
        assert_eq!(ch.wq_occupancy(), 1);
        assert_eq!(ch.sim_stats.wq_forward, 1);
        let resp = ch.returned.pop_front().unwrap();
        assert_eq!(resp.data.value(), 0xDA7A);
    }

    #[test]
    fn duplicate_writes_drop_younger() {
        let mut ch = Channel::new(8, 8, 8, 6, false);
        assert!(ch.add_wq(write_to(0x1000, 1)));
        assert!(ch.add_wq(write_to(0x1010, 2))); // same block

        ch.check_collision();

        assert_eq!(ch.wq_occupancy(), 1);
        assert_eq!(ch.sim_stats.wq.merged, 1);
    }

    #[test]
    fn untranslated_entries_do_not_merge_with_translated() {
        let mut ch = Channel::new(8, 8, 8, 6, false);
        let translated = read_to(0x1000);
        let mut virt = read_to(0x1000);
        virt.is_translated = false;
        assert!(ch.add_rq(translated));
        assert!(ch.add_rq(virt));

        ch.check_collision();

        assert_eq!(ch.rq_occupancy(), 2);
        assert_eq!(ch.sim_stats.rq.merged, 0);
    }
}
