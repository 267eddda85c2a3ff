//! Hardware prefetcher hooks.
//!
//! Like replacement policies, prefetchers are tagged values implementing the
//! subset of hooks they care about. Hooks never touch the cache directly;
//! `cache_operate` and `cycle_operate` return the prefetches they want
//! issued, and the cache submits them through its own prefetch queue. The
//! metadata word is opaque to the cache and flows through fills unchanged
//! unless a hook rewrites it.

use crate::channel::AccessType;
use crate::common::addr::Address;
use crate::common::constants::BLOCK_SIZE;

/// One prefetch a hook wants issued.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PrefetchDecision {
    /// Target address (virtual or physical per the cache's prefetch mode).
    pub address: Address,
    /// False to prefetch into a lower level only.
    pub fill_this_level: bool,
    /// Metadata attached to the prefetch.
    pub metadata: u32,
}

/// Tagged set of prefetcher implementations.
pub enum Prefetcher {
    /// No prefetching.
    None,
    /// Fetch the next sequential block after each demand access.
    NextLine(NextLine),
}

impl Prefetcher {
    /// Invoked once before the first access.
    pub fn initialize(&mut self) {
        match self {
            Self::None | Self::NextLine(_) => {}
        }
    }

    /// Observes a demand access or an upper-level prefetch.
    ///
    /// Returns the (possibly updated) metadata and any prefetches to issue.
    pub fn cache_operate(
        &mut self,
        addr: Address,
        ip: Address,
        hit: bool,
        useful_prefetch: bool,
        ty: AccessType,
        metadata: u32,
    ) -> (u32, Vec<PrefetchDecision>) {
        match self {
            Self::None => (metadata, Vec::new()),
            Self::NextLine(p) => p.cache_operate(addr, ip, hit, useful_prefetch, ty, metadata),
        }
    }

    /// Observes a fill into this cache.
    #[allow(clippy::too_many_arguments)]
    pub fn cache_fill(
        &mut self,
        _addr: Address,
        _set: usize,
        _way: usize,
        _prefetch: bool,
        _evicted_addr: Address,
        metadata: u32,
    ) -> u32 {
        match self {
            Self::None | Self::NextLine(_) => metadata,
        }
    }

    /// Invoked once per cache tick.
    pub fn cycle_operate(&mut self) -> Vec<PrefetchDecision> {
        match self {
            Self::None | Self::NextLine(_) => Vec::new(),
        }
    }

    /// Observes a branch at the core (instruction prefetchers only).
    pub fn branch_operate(&mut self, _ip: Address, _branch_type: u8, _target: Address) {
        match self {
            Self::None | Self::NextLine(_) => {}
        }
    }

    /// Emits any prefetcher-specific statistics.
    pub fn final_stats(&self) {
        match self {
            Self::None | Self::NextLine(_) => {}
        }
    }
}

/// Next-line prefetcher: every demand access requests the following block.
pub struct NextLine {
    degree: u64,
}

impl NextLine {
    /// Creates a next-line prefetcher issuing `degree` blocks per trigger.
    pub const fn new(degree: u64) -> Self {
        Self { degree }
    }

    fn cache_operate(
        &self,
        addr: Address,
        _ip: Address,
        _hit: bool,
        _useful_prefetch: bool,
        ty: AccessType,
        metadata: u32,
    ) -> (u32, Vec<PrefetchDecision>) {
        if ty == AccessType::Write {
            return (metadata, Vec::new());
        }
        let decisions = (1..=self.degree)
            .map(|i| PrefetchDecision {
                address: addr.offset_by((i * BLOCK_SIZE) as i64),
                fill_this_level: true,
                metadata,
            })
            .collect();
        (metadata, decisions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_line_requests_following_block() {
        let mut pf = Prefetcher::NextLine(NextLine::new(1));
        let (meta, decisions) = pf.cache_operate(
            Address::from(0x1000),
            Address::from(0x400),
            false,
            false,
            AccessType::Load,
            0xAB,
        );
        assert_eq!(meta, 0xAB);
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].address.value(), 0x1040);
        assert!(decisions[0].fill_this_level);
    }

    #[test]
    fn writes_do_not_trigger() {
        let mut pf = Prefetcher::NextLine(NextLine::new(2));
        let (_, decisions) = pf.cache_operate(
            Address::from(0x1000),
            Address::default(),
            true,
            false,
            AccessType::Write,
            0,
        );
        assert!(decisions.is_empty());
    }

    #[test]
    fn none_is_inert() {
        let mut pf = Prefetcher::None;
        let (meta, decisions) =
            pf.cache_operate(Address::from(0x1000), Address::default(), false, false, AccessType::Load, 3);
        assert_eq!(meta, 3);
        assert!(decisions.is_empty());
    }
}
