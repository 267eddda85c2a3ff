//! Lazy virtual-to-physical memory mapping.
//!
//! The simulator never executes functionally, but the walker still needs a
//! consistent page table to traverse. Physical pages are assigned on first
//! touch: data pages when a leaf translation completes, page-table pages
//! when a level is first synthesized. First-touch assignments charge a
//! minor-fault penalty on top of the walker's latency.

use std::collections::HashMap;

use crate::common::addr::Address;
use crate::common::bits::bitmask;
use crate::common::constants::{LOG2_PAGE_SIZE, PAGE_SIZE, PTE_BYTES};

/// Bits of virtual address consumed per page-table level.
const BITS_PER_LEVEL: u32 = 9;

/// First physical page handed out; keeps low memory free of simulated pages.
const FIRST_PPAGE: u64 = 0x1_0000;

/// The lazily-populated virtual memory map, shared by all walkers.
pub struct VirtualMemory {
    pt_levels: usize,
    minor_fault_penalty: u64,
    next_ppage: u64,
    vpage_to_ppage: HashMap<(usize, u64), u64>,
    page_table: HashMap<(usize, usize, u64), u64>,
}

impl VirtualMemory {
    /// Creates a fresh map with `pt_levels` page-table levels.
    ///
    /// `minor_fault_penalty` is charged (in walker cycles) whenever an
    /// address is materialized for the first time.
    pub fn new(pt_levels: usize, minor_fault_penalty: u64) -> Self {
        Self {
            pt_levels,
            minor_fault_penalty,
            next_ppage: FIRST_PPAGE,
            vpage_to_ppage: HashMap::new(),
            page_table: HashMap::new(),
        }
    }

    /// Number of page-table levels.
    pub const fn pt_levels(&self) -> usize {
        self.pt_levels
    }

    /// Shift amount selecting the index bits consumed by a read at `level`.
    ///
    /// Level 0 is the leaf; the root read of an `N`-level table sits at
    /// level `N - 1`.
    pub const fn shamt(&self, level: usize) -> u32 {
        LOG2_PAGE_SIZE + BITS_PER_LEVEL * level as u32
    }

    /// Index of `vaddr` within the page-table page read at `level`.
    pub fn get_offset(&self, vaddr: Address, level: usize) -> u64 {
        (vaddr.value() >> self.shamt(level)) & bitmask(BITS_PER_LEVEL)
    }

    fn alloc_ppage(&mut self) -> u64 {
        let page = self.next_ppage;
        self.next_ppage += 1;
        page
    }

    /// Physical address of the PTE that a walk reads at `level`, and the
    /// penalty if the backing page-table page was newly assigned.
    pub fn get_pte_pa(&mut self, cpu: usize, vaddr: Address, level: usize) -> (Address, u64) {
        let above = self.shamt(level + 1);
        let selector = if above >= 64 { 0 } else { vaddr.value() >> above };
        let key = (cpu, level, selector);
        let mut penalty = 0;
        let page = if let Some(&page) = self.page_table.get(&key) {
            page
        } else {
            let page = self.alloc_ppage();
            let _ = self.page_table.insert(key, page);
            penalty = self.minor_fault_penalty;
            page
        };
        let addr = (page << LOG2_PAGE_SIZE) | (self.get_offset(vaddr, level) * PTE_BYTES);
        (Address::from(addr), penalty)
    }

    /// Final translation of `vaddr`, and the penalty if its physical page
    /// was newly assigned.
    pub fn va_to_pa(&mut self, cpu: usize, vaddr: Address) -> (Address, u64) {
        let key = (cpu, vaddr.page_number().value());
        let mut penalty = 0;
        let ppage = if let Some(&page) = self.vpage_to_ppage.get(&key) {
            page
        } else {
            let page = self.alloc_ppage();
            let _ = self.vpage_to_ppage.insert(key, page);
            penalty = self.minor_fault_penalty;
            page
        };
        let pa = (ppage << LOG2_PAGE_SIZE) | (vaddr.value() & (PAGE_SIZE - 1));
        (Address::from(pa), penalty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translation_is_stable() {
        let mut vmem = VirtualMemory::new(5, 200);
        let vaddr = Address::from(0xAAAA_1234);
        let (first, penalty) = vmem.va_to_pa(0, vaddr);
        assert_eq!(penalty, 200);
        let (second, penalty) = vmem.va_to_pa(0, vaddr);
        assert_eq!(penalty, 0);
        assert_eq!(first, second);
        assert_eq!(first.page_offset().value(), 0x234);
    }

    #[test]
    fn distinct_pages_get_distinct_frames() {
        let mut vmem = VirtualMemory::new(5, 0);
        let (a, _) = vmem.va_to_pa(0, Address::from(0x1000));
        let (b, _) = vmem.va_to_pa(0, Address::from(0x2000));
        assert_ne!(a.page_number().value(), b.page_number().value());
    }

    #[test]
    fn asids_do_not_share_mappings() {
        let mut vmem = VirtualMemory::new(5, 0);
        let (a, _) = vmem.va_to_pa(0, Address::from(0x5000));
        let (b, _) = vmem.va_to_pa(1, Address::from(0x5000));
        assert_ne!(a.page_number().value(), b.page_number().value());
    }

    #[test]
    fn pte_addresses_share_directory_pages() {
        let mut vmem = VirtualMemory::new(5, 100);
        // Same level-1 page-table page: identical bits above shamt(2)
        let (a, pen_a) = vmem.get_pte_pa(0, Address::from(0xAAAA_0000), 1);
        let (b, pen_b) = vmem.get_pte_pa(0, Address::from(0xAAAA_1000), 1);
        assert_eq!(pen_a, 100);
        assert_eq!(pen_b, 0);
        assert_eq!(a.page_number().value(), b.page_number().value());
    }

    #[test]
    fn root_level_is_one_page() {
        let mut vmem = VirtualMemory::new(5, 0);
        let root = vmem.pt_levels() - 1;
        let (a, _) = vmem.get_pte_pa(0, Address::from(0), root);
        let (b, _) = vmem.get_pte_pa(0, Address::from(0x7FFF_FFFF_F000), root);
        assert_eq!(a.page_number().value(), b.page_number().value());
    }
}
