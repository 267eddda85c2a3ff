//! Fixed architectural constants.
//!
//! Cache blocks and pages have fixed sizes throughout the hierarchy; these
//! anchor the typed address slices in [`crate::common::addr`].

/// Cache block (line) size in bytes.
pub const BLOCK_SIZE: u64 = 64;

/// Base-2 logarithm of the block size.
pub const LOG2_BLOCK_SIZE: u32 = 6;

/// Virtual memory page size in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// Base-2 logarithm of the page size.
pub const LOG2_PAGE_SIZE: u32 = 12;

/// Size of one page table entry in bytes.
pub const PTE_BYTES: u64 = 8;

/// Number of source operands a trace record may carry.
pub const NUM_INSTR_SOURCES: usize = 4;

/// Number of destination operands a trace record may carry.
pub const NUM_INSTR_DESTINATIONS: usize = 2;
