//! Branch target buffer with return-address stack and indirect predictor.
//!
//! Three structures cooperate:
//! - a set-associative LRU table of direct branch targets,
//! - a return-address stack whose entries are corrected by a learned
//!   per-call-site instruction size,
//! - an indirect-target table indexed by the branch address hashed with the
//!   global conditional history.

use crate::common::addr::Address;
use crate::common::lru_table::LruTable;
use crate::stats::BranchType;

/// One direct-target entry.
#[derive(Clone, Copy, Debug)]
struct BtbEntry {
    target: Address,
    always_taken: bool,
}

/// Static parameters of the BTB complex.
pub struct BtbParams {
    /// Direct-target table sets.
    pub sets: usize,
    /// Direct-target table ways.
    pub ways: usize,
    /// Indirect-target table size (rounded up to a power of two).
    pub indirect_size: usize,
    /// Return-address stack depth.
    pub ras_size: usize,
    /// Call-site size trackers (rounded up to a power of two).
    pub call_size_trackers: usize,
}

impl Default for BtbParams {
    fn default() -> Self {
        Self {
            sets: 1024,
            ways: 8,
            indirect_size: 4096,
            ras_size: 64,
            call_size_trackers: 1024,
        }
    }
}

/// The branch target buffer complex.
pub struct BasicBtb {
    direct: LruTable<BtbEntry>,
    indirect: Vec<Address>,
    indirect_mask: usize,
    conditional_history: u64,
    ras: Vec<Address>,
    ras_size: usize,
    /// Learned instruction size per call site, for return targets.
    call_size: Vec<u64>,
    call_size_mask: usize,
}

impl BasicBtb {
    /// Creates the BTB complex.
    pub fn new(params: &BtbParams) -> Self {
        let indirect_size = params.indirect_size.next_power_of_two().max(1);
        let trackers = params.call_size_trackers.next_power_of_two().max(1);
        Self {
            direct: LruTable::new(params.sets, params.ways),
            indirect: vec![Address::default(); indirect_size],
            indirect_mask: indirect_size - 1,
            conditional_history: 0,
            ras: Vec::new(),
            ras_size: params.ras_size,
            call_size: vec![4; trackers],
            call_size_mask: trackers - 1,
        }
    }

    fn indirect_index(&self, ip: Address) -> usize {
        ((ip.value() ^ self.conditional_history) as usize) & self.indirect_mask
    }

    /// Predicts the target of the branch at `ip`.
    ///
    /// Returns the target (zero when unknown) and an always-taken hint.
    pub fn prediction(&mut self, ip: Address, branch_type: BranchType) -> (Address, bool) {
        if branch_type == BranchType::Return {
            let Some(&call_ip) = self.ras.last() else {
                return (Address::default(), true);
            };
            let size = self.call_size[(call_ip.value() as usize) & self.call_size_mask];
            return (call_ip.offset_by(size as i64), true);
        }

        if matches!(branch_type, BranchType::Indirect | BranchType::IndirectCall) {
            let target = self.indirect[self.indirect_index(ip)];
            return (target, branch_type == BranchType::IndirectCall);
        }

        match self.direct.check_hit(ip.value()) {
            Some(entry) => (entry.target, entry.always_taken),
            None => (Address::default(), false),
        }
    }

    /// Trains on the resolved branch.
    pub fn update(&mut self, ip: Address, target: Address, taken: bool, branch_type: BranchType) {
        // Learn the call-site size from the return that observes it.
        if branch_type == BranchType::Return && !self.ras.is_empty() {
            if let Some(call_ip) = self.ras.pop() {
                if target.value() > call_ip.value() {
                    let size = target.value() - call_ip.value();
                    if size <= 16 {
                        self.call_size[(call_ip.value() as usize) & self.call_size_mask] = size;
                    }
                }
            }
        }

        if matches!(branch_type, BranchType::DirectCall | BranchType::IndirectCall) {
            self.ras.push(ip);
            if self.ras.len() > self.ras_size {
                let _ = self.ras.remove(0);
            }
        }

        if branch_type == BranchType::Conditional {
            self.conditional_history = (self.conditional_history << 1) | u64::from(taken);
        }

        if target.value() == 0 {
            return;
        }

        if matches!(branch_type, BranchType::Indirect | BranchType::IndirectCall) {
            let idx = self.indirect_index(ip);
            self.indirect[idx] = target;
            return;
        }

        if branch_type != BranchType::Return {
            let always_taken = taken && branch_type != BranchType::Conditional;
            let _ = self.direct.check_hit(ip.value());
            self.direct.fill(
                ip.value(),
                BtbEntry {
                    target,
                    always_taken,
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn btb() -> BasicBtb {
        BasicBtb::new(&BtbParams::default())
    }

    #[test]
    fn unknown_branch_has_no_target() {
        let mut btb = btb();
        let (target, always) = btb.prediction(Address::from(0x400000), BranchType::DirectJump);
        assert_eq!(target.value(), 0);
        assert!(!always);
    }

    #[test]
    fn direct_target_learned() {
        let mut btb = btb();
        let ip = Address::from(0x400000);
        let target = Address::from(0x400800);
        btb.update(ip, target, true, BranchType::DirectJump);
        let (predicted, always) = btb.prediction(ip, BranchType::DirectJump);
        assert_eq!(predicted, target);
        assert!(always);
    }

    #[test]
    fn return_address_stack_round_trip() {
        let mut btb = btb();
        let call_ip = Address::from(0x400000);
        let return_target = Address::from(0x400005);

        // Call pushes; the first return teaches the call size.
        btb.update(call_ip, Address::from(0x500000), true, BranchType::DirectCall);
        btb.update(Address::from(0x500010), return_target, true, BranchType::Return);

        // Second visit predicts the learned return target.
        btb.update(call_ip, Address::from(0x500000), true, BranchType::DirectCall);
        let (predicted, _) = btb.prediction(Address::from(0x500010), BranchType::Return);
        assert_eq!(predicted, return_target);
    }

    #[test]
    fn indirect_target_tracks_history() {
        let mut btb = btb();
        let ip = Address::from(0x400000);
        let target = Address::from(0x777000);
        btb.update(ip, target, true, BranchType::Indirect);
        let (predicted, _) = btb.prediction(ip, BranchType::Indirect);
        assert_eq!(predicted, target);
    }
}
