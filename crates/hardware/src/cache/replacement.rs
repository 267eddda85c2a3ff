//! Cache replacement policies.
//!
//! A policy is a value implementing the subset of the replacement hooks it
//! cares about; variants are distinguished by tag, and hooks a variant does
//! not implement are no-ops. The cache invokes:
//! - `find_victim` when a fill finds no invalid way in the target set,
//! - `update` after every fill and hit,
//! - `final_stats` once at the end of the run.

use crate::channel::AccessType;
use crate::common::addr::Address;

/// Context handed to the victim-selection hook.
#[derive(Clone, Copy, Debug)]
pub struct VictimContext {
    /// CPU that triggered the fill.
    pub cpu: usize,
    /// Id of the instruction that triggered the fill.
    pub instr_id: u64,
    /// Target set index.
    pub set: usize,
    /// Program counter of the triggering instruction.
    pub ip: Address,
    /// Full address being filled.
    pub full_addr: Address,
    /// Access type of the fill.
    pub ty: AccessType,
}

/// Context handed to the state-update hook.
#[derive(Clone, Copy, Debug)]
pub struct UpdateContext {
    /// CPU that triggered the access.
    pub cpu: usize,
    /// Set index.
    pub set: usize,
    /// Way index that was touched.
    pub way: usize,
    /// Full address of the access.
    pub full_addr: Address,
    /// Program counter of the access.
    pub ip: Address,
    /// Address of the evicted block, zero on hits.
    pub victim_addr: Address,
    /// Access type.
    pub ty: AccessType,
    /// True when the access hit.
    pub hit: bool,
}

/// Tagged set of replacement policies.
pub enum Replacement {
    /// Evict the least recently used way.
    Lru(Lru),
}

impl Replacement {
    /// Creates the default policy (LRU) for the given geometry.
    pub fn lru(sets: usize, ways: usize) -> Self {
        Self::Lru(Lru::new(sets, ways))
    }

    /// Invoked once before the first access.
    pub fn initialize(&mut self) {
        match self {
            Self::Lru(_) => {}
        }
    }

    /// Chooses a victim way within the set.
    pub fn find_victim(&mut self, ctx: &VictimContext) -> usize {
        match self {
            Self::Lru(lru) => lru.find_victim(ctx.set),
        }
    }

    /// Observes a fill or hit.
    pub fn update(&mut self, ctx: &UpdateContext) {
        match self {
            Self::Lru(lru) => lru.update(ctx),
        }
    }

    /// Emits any policy-specific statistics.
    pub fn final_stats(&self) {
        match self {
            Self::Lru(_) => {}
        }
    }
}

/// True-LRU state: one recency stamp per way.
pub struct Lru {
    ways: usize,
    cycle: u64,
    last_used: Vec<u64>,
}

impl Lru {
    /// Creates LRU state for the given geometry.
    pub fn new(sets: usize, ways: usize) -> Self {
        Self {
            ways,
            cycle: 0,
            last_used: vec![0; sets * ways],
        }
    }

    fn find_victim(&self, set: usize) -> usize {
        let begin = set * self.ways;
        let set_stamps = &self.last_used[begin..begin + self.ways];
        set_stamps
            .iter()
            .enumerate()
            .min_by_key(|&(_, stamp)| stamp)
            .map_or(0, |(way, _)| way)
    }

    fn update(&mut self, ctx: &UpdateContext) {
        // Writebacks that hit do not promote the block.
        if ctx.hit && ctx.ty == AccessType::Write {
            return;
        }
        self.cycle += 1;
        self.last_used[ctx.set * self.ways + ctx.way] = self.cycle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update_ctx(set: usize, way: usize, hit: bool, ty: AccessType) -> UpdateContext {
        UpdateContext {
            cpu: 0,
            set,
            way,
            full_addr: Address::default(),
            ip: Address::default(),
            victim_addr: Address::default(),
            ty,
            hit,
        }
    }

    #[test]
    fn least_recent_way_is_victim() {
        let mut policy = Replacement::lru(1, 4);
        for way in 0..4 {
            policy.update(&update_ctx(0, way, false, AccessType::Load));
        }
        // Touch way 0 again: way 1 is now the oldest
        policy.update(&update_ctx(0, 0, true, AccessType::Load));
        let victim = policy.find_victim(&VictimContext {
            cpu: 0,
            instr_id: 0,
            set: 0,
            ip: Address::default(),
            full_addr: Address::default(),
            ty: AccessType::Load,
        });
        assert_eq!(victim, 1);
    }

    #[test]
    fn write_hits_do_not_promote() {
        let mut policy = Replacement::lru(1, 2);
        policy.update(&update_ctx(0, 0, false, AccessType::Load));
        policy.update(&update_ctx(0, 1, false, AccessType::Load));
        // A write hit on way 0 leaves it the LRU way
        policy.update(&update_ctx(0, 0, true, AccessType::Write));
        let victim = policy.find_victim(&VictimContext {
            cpu: 0,
            instr_id: 0,
            set: 0,
            ip: Address::default(),
            full_addr: Address::default(),
            ty: AccessType::Load,
        });
        assert_eq!(victim, 0);
    }
}
