//! Configuration system for the simulator.
//!
//! This module defines all configuration structures used to parameterize a
//! simulation. It provides:
//! 1. **Defaults:** Baseline hardware constants (core widths, cache
//!    geometry, DRAM timing, walker dimensions).
//! 2. **Structures:** Hierarchical config for the core, every cache level,
//!    the walker, virtual memory, and DRAM.
//! 3. **Derivation:** A cache is specified by any two of {size, sets,
//!    ways}; the third, the MSHR count, and the latencies derive when
//!    absent.
//!
//! Configuration is supplied as JSON (`serde_json`) or via
//! `SimConfig::default()`.

use serde::Deserialize;

use crate::common::constants::{BLOCK_SIZE, LOG2_BLOCK_SIZE, LOG2_PAGE_SIZE};

/// Default configuration constants for the simulator.
mod defaults {
    /// Core clock period in picoseconds (4 GHz).
    pub const CORE_PERIOD_PS: u64 = 250;

    /// DRAM clock period in picoseconds (3200 MT/s).
    pub const DRAM_PERIOD_PS: u64 = 312;

    /// Tag-check bandwidth per cache tick.
    pub const CACHE_MAX_TAG: u64 = 2;

    /// Fill bandwidth per cache tick.
    pub const CACHE_MAX_FILL: u64 = 2;

    /// Read queue capacity of a cache's upper channel.
    pub const CACHE_RQ_SIZE: usize = 64;

    /// Write queue capacity of a cache's upper channel.
    pub const CACHE_WQ_SIZE: usize = 64;

    /// Prefetch queue capacity of a cache's upper channel.
    pub const CACHE_PQ_SIZE: usize = 32;

    /// Walker MSHR capacity.
    pub const PTW_MSHR_SIZE: usize = 5;

    /// Walk initiations per walker tick.
    pub const PTW_MAX_READ: u64 = 2;

    /// Walk-step completions per walker tick.
    pub const PTW_MAX_FILL: u64 = 2;

    /// Walker hit latency in cycles.
    pub const PTW_HIT_LATENCY: u64 = 1;

    /// Page-table levels.
    pub const PT_LEVELS: usize = 5;

    /// Cycles charged when a page is materialized for the first time.
    pub const MINOR_FAULT_PENALTY: u64 = 200;

    /// DRAM channels.
    pub const DRAM_CHANNELS: usize = 1;

    /// DRAM ranks per channel.
    pub const DRAM_RANKS: usize = 1;

    /// DRAM banks per rank.
    pub const DRAM_BANKS: usize = 8;

    /// DRAM rows per bank.
    pub const DRAM_ROWS: usize = 65536;

    /// DRAM columns per row.
    pub const DRAM_COLUMNS: usize = 128;

    /// DRAM data bus width in bytes.
    pub const DRAM_CHANNEL_WIDTH: u64 = 8;

    /// DRAM read queue capacity.
    pub const DRAM_RQ_SIZE: usize = 64;

    /// DRAM write queue capacity.
    pub const DRAM_WQ_SIZE: usize = 64;

    /// Row precharge time in picoseconds.
    pub const DRAM_T_RP_PS: u64 = 12_500;

    /// Row-to-column delay in picoseconds.
    pub const DRAM_T_RCD_PS: u64 = 12_500;

    /// Column access strobe time in picoseconds.
    pub const DRAM_T_CAS_PS: u64 = 12_500;

    /// Full-array refresh period in picoseconds (64 ms).
    pub const DRAM_REFRESH_PERIOD_PS: u64 = 64_000_000_000;

    /// Rows per refresh round.
    pub const DRAM_ROWS_PER_REFRESH: usize = 8;

    /// Bus turnaround penalty in picoseconds.
    pub const DRAM_TURNAROUND_PS: u64 = 7_500;

    /// Bimodal predictor table size.
    pub const BIMODAL_TABLE_SIZE: usize = 16384;
}

/// Replacement policy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplacementKind {
    /// True LRU.
    #[default]
    Lru,
}

/// Prefetcher selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrefetcherKind {
    /// No prefetching.
    #[default]
    None,
    /// Next-line prefetcher.
    NextLine,
}

/// Branch predictor selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchPredictorKind {
    /// Two-bit bimodal counters.
    #[default]
    Bimodal,
}

/// One cache level's configuration.
///
/// Any two of `size_bytes`, `sets`, and `ways` determine the geometry; the
/// MSHR count and latencies derive from it when not given.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheLevelConfig {
    /// Total capacity in bytes.
    #[serde(default)]
    pub size_bytes: Option<usize>,

    /// Number of sets.
    #[serde(default)]
    pub sets: Option<usize>,

    /// Associativity.
    #[serde(default)]
    pub ways: Option<usize>,

    /// MSHR capacity.
    #[serde(default)]
    pub mshr_size: Option<usize>,

    /// Total hit+fill latency in cycles.
    #[serde(default)]
    pub latency: Option<u64>,

    /// Cycles from acceptance to tag check.
    #[serde(default)]
    pub hit_latency: Option<u64>,

    /// Cycles from response to array write.
    #[serde(default)]
    pub fill_latency: Option<u64>,

    /// Tag checks per tick.
    #[serde(default = "CacheLevelConfig::default_max_tag")]
    pub max_tag: u64,

    /// Fills per tick.
    #[serde(default = "CacheLevelConfig::default_max_fill")]
    pub max_fill: u64,

    /// Issue prefetch misses through the lower read queue.
    #[serde(default)]
    pub prefetch_as_load: bool,

    /// Compare writes on the full address instead of treating them as
    /// writeback fills.
    #[serde(default)]
    pub match_offset_bits: bool,

    /// Prefetch entry point takes virtual addresses.
    #[serde(default)]
    pub virtual_prefetch: bool,

    /// Replacement policy.
    #[serde(default)]
    pub replacement: ReplacementKind,

    /// Prefetcher.
    #[serde(default)]
    pub prefetcher: PrefetcherKind,

    /// Prefetch degree (blocks per trigger).
    #[serde(default = "CacheLevelConfig::default_prefetch_degree")]
    pub prefetch_degree: u64,

    /// Read queue capacity of the upper channel.
    #[serde(default = "CacheLevelConfig::default_rq_size")]
    pub rq_size: usize,

    /// Write queue capacity of the upper channel.
    #[serde(default = "CacheLevelConfig::default_wq_size")]
    pub wq_size: usize,

    /// Prefetch queue capacity of the upper channel.
    #[serde(default = "CacheLevelConfig::default_pq_size")]
    pub pq_size: usize,
}

impl CacheLevelConfig {
    fn default_max_tag() -> u64 {
        defaults::CACHE_MAX_TAG
    }

    fn default_max_fill() -> u64 {
        defaults::CACHE_MAX_FILL
    }

    fn default_prefetch_degree() -> u64 {
        1
    }

    fn default_rq_size() -> usize {
        defaults::CACHE_RQ_SIZE
    }

    fn default_wq_size() -> usize {
        defaults::CACHE_WQ_SIZE
    }

    fn default_pq_size() -> usize {
        defaults::CACHE_PQ_SIZE
    }

    /// A config with explicit geometry, used by the built-in hierarchy.
    pub fn with_geometry(sets: usize, ways: usize) -> Self {
        Self {
            sets: Some(sets),
            ways: Some(ways),
            ..Self::minimal()
        }
    }

    fn minimal() -> Self {
        Self {
            size_bytes: None,
            sets: None,
            ways: None,
            mshr_size: None,
            latency: None,
            hit_latency: None,
            fill_latency: None,
            max_tag: defaults::CACHE_MAX_TAG,
            max_fill: defaults::CACHE_MAX_FILL,
            prefetch_as_load: false,
            match_offset_bits: false,
            virtual_prefetch: false,
            replacement: ReplacementKind::default(),
            prefetcher: PrefetcherKind::default(),
            prefetch_degree: 1,
            rq_size: defaults::CACHE_RQ_SIZE,
            wq_size: defaults::CACHE_WQ_SIZE,
            pq_size: defaults::CACHE_PQ_SIZE,
        }
    }

    /// Resolves the geometry: any two of {size, sets, ways} fix the third.
    ///
    /// `entry_bytes` is the block size for data caches and irrelevant for
    /// TLB levels configured by sets and ways directly.
    pub fn resolve_geometry(&self, entry_bytes: usize) -> (usize, usize) {
        match (self.size_bytes, self.sets, self.ways) {
            (_, Some(sets), Some(ways)) => (sets, ways),
            (Some(size), Some(sets), None) => (sets, (size / entry_bytes / sets).max(1)),
            (Some(size), None, Some(ways)) => ((size / entry_bytes / ways).max(1), ways),
            (Some(size), None, None) => ((size / entry_bytes / 8).max(1), 8),
            _ => (64, 8),
        }
    }

    /// Resolves `(hit, fill)` latency.
    ///
    /// When absent, the total defaults to `0.416 * (sets * ways)^0.343`
    /// cycles, split evenly between the two halves.
    pub fn resolve_latency(&self, sets: usize, ways: usize) -> (u64, u64) {
        if let (Some(hit), Some(fill)) = (self.hit_latency, self.fill_latency) {
            return (hit, fill);
        }
        let total = self.latency.unwrap_or_else(|| {
            let capacity = (sets * ways) as f64;
            (0.416 * capacity.powf(0.343)).ceil() as u64
        });
        let fill = self.fill_latency.unwrap_or((total / 2).max(1));
        let hit = self.hit_latency.unwrap_or_else(|| total.saturating_sub(fill).max(1));
        (hit, fill)
    }

    /// Resolves the MSHR count; defaults to
    /// `sets * fill_latency * max_fill / 16`.
    pub fn resolve_mshr(&self, sets: usize, fill_latency: u64) -> usize {
        self.mshr_size.unwrap_or_else(|| {
            ((sets as u64 * fill_latency * self.max_fill) / 16).max(1) as usize
        })
    }
}

/// The cache and TLB hierarchy.
#[derive(Debug, Clone, Deserialize)]
pub struct HierarchyConfig {
    /// First-level instruction TLB.
    #[serde(default = "HierarchyConfig::default_itlb")]
    pub itlb: CacheLevelConfig,
    /// First-level data TLB.
    #[serde(default = "HierarchyConfig::default_dtlb")]
    pub dtlb: CacheLevelConfig,
    /// Second-level unified TLB.
    #[serde(default = "HierarchyConfig::default_stlb")]
    pub stlb: CacheLevelConfig,
    /// First-level instruction cache.
    #[serde(default = "HierarchyConfig::default_l1i")]
    pub l1i: CacheLevelConfig,
    /// First-level data cache.
    #[serde(default = "HierarchyConfig::default_l1d")]
    pub l1d: CacheLevelConfig,
    /// Private second-level cache.
    #[serde(default = "HierarchyConfig::default_l2c")]
    pub l2c: CacheLevelConfig,
    /// Shared last-level cache.
    #[serde(default = "HierarchyConfig::default_llc")]
    pub llc: CacheLevelConfig,
}

impl HierarchyConfig {
    fn default_itlb() -> CacheLevelConfig {
        CacheLevelConfig {
            latency: Some(2),
            mshr_size: Some(8),
            ..CacheLevelConfig::with_geometry(16, 4)
        }
    }

    fn default_dtlb() -> CacheLevelConfig {
        CacheLevelConfig {
            latency: Some(2),
            mshr_size: Some(8),
            ..CacheLevelConfig::with_geometry(16, 4)
        }
    }

    fn default_stlb() -> CacheLevelConfig {
        CacheLevelConfig {
            latency: Some(8),
            mshr_size: Some(16),
            ..CacheLevelConfig::with_geometry(128, 12)
        }
    }

    fn default_l1i() -> CacheLevelConfig {
        CacheLevelConfig {
            latency: Some(4),
            mshr_size: Some(8),
            virtual_prefetch: true,
            prefetcher: PrefetcherKind::NextLine,
            ..CacheLevelConfig::with_geometry(64, 8)
        }
    }

    fn default_l1d() -> CacheLevelConfig {
        CacheLevelConfig {
            latency: Some(5),
            mshr_size: Some(16),
            ..CacheLevelConfig::with_geometry(64, 12)
        }
    }

    fn default_l2c() -> CacheLevelConfig {
        CacheLevelConfig {
            latency: Some(10),
            mshr_size: Some(32),
            ..CacheLevelConfig::with_geometry(1024, 8)
        }
    }

    fn default_llc() -> CacheLevelConfig {
        CacheLevelConfig {
            latency: Some(20),
            mshr_size: Some(64),
            ..CacheLevelConfig::with_geometry(2048, 16)
        }
    }
}

impl Default for HierarchyConfig {
    fn default() -> Self {
        Self {
            itlb: Self::default_itlb(),
            dtlb: Self::default_dtlb(),
            stlb: Self::default_stlb(),
            l1i: Self::default_l1i(),
            l1d: Self::default_l1d(),
            l2c: Self::default_l2c(),
            llc: Self::default_llc(),
        }
    }
}

/// Core configuration: widths, buffer sizes, latencies.
#[derive(Debug, Clone, Deserialize)]
pub struct CoreConfig {
    /// Fetch buffer capacity.
    #[serde(default = "CoreConfig::d64")]
    pub ifetch_buffer_size: usize,
    /// Decode buffer capacity.
    #[serde(default = "CoreConfig::d32")]
    pub decode_buffer_size: usize,
    /// Dispatch buffer capacity.
    #[serde(default = "CoreConfig::d32")]
    pub dispatch_buffer_size: usize,
    /// Reorder buffer capacity.
    #[serde(default = "CoreConfig::default_rob")]
    pub rob_size: usize,
    /// Load queue capacity.
    #[serde(default = "CoreConfig::default_lq")]
    pub lq_size: usize,
    /// Store queue capacity.
    #[serde(default = "CoreConfig::default_sq")]
    pub sq_size: usize,
    /// Instructions fetched per cycle.
    #[serde(default = "CoreConfig::d6")]
    pub fetch_width: u64,
    /// Instructions decoded per cycle.
    #[serde(default = "CoreConfig::d6")]
    pub decode_width: u64,
    /// Instructions dispatched per cycle.
    #[serde(default = "CoreConfig::d6")]
    pub dispatch_width: u64,
    /// Instructions executed per cycle.
    #[serde(default = "CoreConfig::d4")]
    pub exec_width: u64,
    /// Loads issued per cycle.
    #[serde(default = "CoreConfig::d2")]
    pub lq_width: u64,
    /// Stores issued per cycle.
    #[serde(default = "CoreConfig::d2")]
    pub sq_width: u64,
    /// Instructions retired per cycle.
    #[serde(default = "CoreConfig::d5")]
    pub retire_width: u64,
    /// ROB positions scanned per cycle.
    #[serde(default = "CoreConfig::default_scheduler")]
    pub scheduler_size: u64,
    /// Cycles from decode to dispatch readiness.
    #[serde(default = "CoreConfig::d1")]
    pub decode_latency: u64,
    /// Cycles from dispatch to ROB readiness.
    #[serde(default = "CoreConfig::d1")]
    pub dispatch_latency: u64,
    /// Cycles from scheduling to execution readiness.
    #[serde(default)]
    pub schedule_latency: u64,
    /// Execution latency of non-memory instructions.
    #[serde(default)]
    pub exec_latency: u64,
    /// Cycles fetch stalls after a misprediction.
    #[serde(default = "CoreConfig::d1")]
    pub mispredict_penalty: u64,
    /// Decoded-instruction buffer sets.
    #[serde(default = "CoreConfig::d32")]
    pub dib_sets: usize,
    /// Decoded-instruction buffer ways.
    #[serde(default = "CoreConfig::d8")]
    pub dib_ways: usize,
    /// Bytes covered by one DIB entry.
    #[serde(default = "CoreConfig::d16")]
    pub dib_window: u64,
    /// Cycles a buffer head may stall before the run is declared dead.
    #[serde(default = "CoreConfig::default_deadlock")]
    pub deadlock_threshold: u64,
    /// Branch predictor.
    #[serde(default)]
    pub branch_predictor: BranchPredictorKind,
    /// Bimodal predictor table size.
    #[serde(default = "CoreConfig::default_bimodal")]
    pub bimodal_table_size: usize,
}

impl CoreConfig {
    fn d1() -> u64 {
        1
    }
    fn d2() -> u64 {
        2
    }
    fn d4() -> u64 {
        4
    }
    fn d5() -> u64 {
        5
    }
    fn d6() -> u64 {
        6
    }
    fn d8() -> usize {
        8
    }
    fn d16() -> u64 {
        16
    }
    fn d32() -> usize {
        32
    }
    fn d64() -> usize {
        64
    }

    fn default_rob() -> usize {
        352
    }

    fn default_lq() -> usize {
        128
    }

    fn default_sq() -> usize {
        72
    }

    fn default_scheduler() -> u64 {
        128
    }

    fn default_deadlock() -> u64 {
        1_000_000
    }

    fn default_bimodal() -> usize {
        defaults::BIMODAL_TABLE_SIZE
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            ifetch_buffer_size: 64,
            decode_buffer_size: 32,
            dispatch_buffer_size: 32,
            rob_size: Self::default_rob(),
            lq_size: Self::default_lq(),
            sq_size: Self::default_sq(),
            fetch_width: 6,
            decode_width: 6,
            dispatch_width: 6,
            exec_width: 4,
            lq_width: 2,
            sq_width: 2,
            retire_width: 5,
            scheduler_size: Self::default_scheduler(),
            decode_latency: 1,
            dispatch_latency: 1,
            schedule_latency: 0,
            exec_latency: 0,
            mispredict_penalty: 1,
            dib_sets: 32,
            dib_ways: 8,
            dib_window: 16,
            deadlock_threshold: Self::default_deadlock(),
            branch_predictor: BranchPredictorKind::default(),
            bimodal_table_size: Self::default_bimodal(),
        }
    }
}

/// Page-table walker configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PtwConfig {
    /// PSCL geometry `(sets, ways)` for levels `N-1` down to `1`.
    #[serde(default = "PtwConfig::default_pscl")]
    pub pscl_dims: Vec<(usize, usize)>,
    /// MSHR capacity.
    #[serde(default = "PtwConfig::default_mshr")]
    pub mshr_size: usize,
    /// Walk initiations per tick.
    #[serde(default = "PtwConfig::default_max_read")]
    pub max_read: u64,
    /// Walk-step completions per tick.
    #[serde(default = "PtwConfig::default_max_fill")]
    pub max_fill: u64,
    /// Hit latency in cycles.
    #[serde(default = "PtwConfig::default_hit_latency")]
    pub hit_latency: u64,
}

impl PtwConfig {
    fn default_pscl() -> Vec<(usize, usize)> {
        vec![(1, 2), (1, 4), (2, 4), (4, 8)]
    }

    fn default_mshr() -> usize {
        defaults::PTW_MSHR_SIZE
    }

    fn default_max_read() -> u64 {
        defaults::PTW_MAX_READ
    }

    fn default_max_fill() -> u64 {
        defaults::PTW_MAX_FILL
    }

    fn default_hit_latency() -> u64 {
        defaults::PTW_HIT_LATENCY
    }
}

impl Default for PtwConfig {
    fn default() -> Self {
        Self {
            pscl_dims: Self::default_pscl(),
            mshr_size: Self::default_mshr(),
            max_read: Self::default_max_read(),
            max_fill: Self::default_max_fill(),
            hit_latency: Self::default_hit_latency(),
        }
    }
}

/// Virtual memory configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct VmemConfig {
    /// Page-table levels.
    #[serde(default = "VmemConfig::default_levels")]
    pub pt_levels: usize,
    /// Cycles charged on first-touch page materialization.
    #[serde(default = "VmemConfig::default_penalty")]
    pub minor_fault_penalty: u64,
}

impl VmemConfig {
    fn default_levels() -> usize {
        defaults::PT_LEVELS
    }

    fn default_penalty() -> u64 {
        defaults::MINOR_FAULT_PENALTY
    }
}

impl Default for VmemConfig {
    fn default() -> Self {
        Self {
            pt_levels: Self::default_levels(),
            minor_fault_penalty: Self::default_penalty(),
        }
    }
}

/// DRAM configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DramConfig {
    /// Number of channels.
    #[serde(default = "DramConfig::default_channels")]
    pub channels: usize,
    /// Ranks per channel.
    #[serde(default = "DramConfig::default_ranks")]
    pub ranks: usize,
    /// Banks per rank.
    #[serde(default = "DramConfig::default_banks")]
    pub banks: usize,
    /// Rows per bank.
    #[serde(default = "DramConfig::default_rows")]
    pub rows: usize,
    /// Columns per row.
    #[serde(default = "DramConfig::default_columns")]
    pub columns: usize,
    /// Data bus width in bytes.
    #[serde(default = "DramConfig::default_width")]
    pub channel_width: u64,
    /// Read queue capacity.
    #[serde(default = "DramConfig::default_rq")]
    pub rq_size: usize,
    /// Write queue capacity.
    #[serde(default = "DramConfig::default_wq")]
    pub wq_size: usize,
    /// Row precharge time in picoseconds.
    #[serde(default = "DramConfig::default_t_rp")]
    pub t_rp_ps: u64,
    /// Row-to-column delay in picoseconds.
    #[serde(default = "DramConfig::default_t_rcd")]
    pub t_rcd_ps: u64,
    /// Column access strobe time in picoseconds.
    #[serde(default = "DramConfig::default_t_cas")]
    pub t_cas_ps: u64,
    /// Full-array refresh period in picoseconds.
    #[serde(default = "DramConfig::default_refresh")]
    pub refresh_period_ps: u64,
    /// Rows per refresh round.
    #[serde(default = "DramConfig::default_rows_per_refresh")]
    pub rows_per_refresh: usize,
    /// Bus turnaround penalty in picoseconds.
    #[serde(default = "DramConfig::default_turnaround")]
    pub turnaround_ps: u64,
}

impl DramConfig {
    fn default_channels() -> usize {
        defaults::DRAM_CHANNELS
    }

    fn default_ranks() -> usize {
        defaults::DRAM_RANKS
    }

    fn default_banks() -> usize {
        defaults::DRAM_BANKS
    }

    fn default_rows() -> usize {
        defaults::DRAM_ROWS
    }

    fn default_columns() -> usize {
        defaults::DRAM_COLUMNS
    }

    fn default_width() -> u64 {
        defaults::DRAM_CHANNEL_WIDTH
    }

    fn default_rq() -> usize {
        defaults::DRAM_RQ_SIZE
    }

    fn default_wq() -> usize {
        defaults::DRAM_WQ_SIZE
    }

    fn default_t_rp() -> u64 {
        defaults::DRAM_T_RP_PS
    }

    fn default_t_rcd() -> u64 {
        defaults::DRAM_T_RCD_PS
    }

    fn default_t_cas() -> u64 {
        defaults::DRAM_T_CAS_PS
    }

    fn default_refresh() -> u64 {
        defaults::DRAM_REFRESH_PERIOD_PS
    }

    fn default_rows_per_refresh() -> usize {
        defaults::DRAM_ROWS_PER_REFRESH
    }

    fn default_turnaround() -> u64 {
        defaults::DRAM_TURNAROUND_PS
    }
}

impl Default for DramConfig {
    fn default() -> Self {
        Self {
            channels: Self::default_channels(),
            ranks: Self::default_ranks(),
            banks: Self::default_banks(),
            rows: Self::default_rows(),
            columns: Self::default_columns(),
            channel_width: Self::default_width(),
            rq_size: Self::default_rq(),
            wq_size: Self::default_wq(),
            t_rp_ps: Self::default_t_rp(),
            t_rcd_ps: Self::default_t_rcd(),
            t_cas_ps: Self::default_t_cas(),
            refresh_period_ps: Self::default_refresh(),
            rows_per_refresh: Self::default_rows_per_refresh(),
            turnaround_ps: Self::default_turnaround(),
        }
    }
}

/// Root configuration for a simulation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Core configuration, applied to every CPU.
    pub core: CoreConfig,
    /// Cache and TLB hierarchy configuration.
    pub caches: HierarchyConfig,
    /// Page-table walker configuration.
    pub ptw: PtwConfig,
    /// Virtual memory configuration.
    pub vmem: VmemConfig,
    /// DRAM configuration.
    pub dram: DramConfig,
    /// Core clock period in picoseconds.
    pub core_period_ps: u64,
    /// DRAM clock period in picoseconds.
    pub dram_period_ps: u64,
}

impl SimConfig {
    /// Core clock period, substituting the default for zero.
    pub const fn core_period(&self) -> u64 {
        if self.core_period_ps == 0 {
            defaults::CORE_PERIOD_PS
        } else {
            self.core_period_ps
        }
    }

    /// DRAM clock period, substituting the default for zero.
    pub const fn dram_period(&self) -> u64 {
        if self.dram_period_ps == 0 {
            defaults::DRAM_PERIOD_PS
        } else {
            self.dram_period_ps
        }
    }
}

/// Block size in bytes for data-cache geometry derivation.
pub const CACHE_ENTRY_BYTES: usize = BLOCK_SIZE as usize;

/// Offset width of data caches.
pub const DATA_OFFSET_BITS: u32 = LOG2_BLOCK_SIZE;

/// Offset width of TLB levels.
pub const TLB_OFFSET_BITS: u32 = LOG2_PAGE_SIZE;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_derives_missing_dimension() {
        let cfg = CacheLevelConfig {
            size_bytes: Some(32768),
            ways: Some(8),
            sets: None,
            ..CacheLevelConfig::with_geometry(0, 0)
        };
        assert_eq!(cfg.resolve_geometry(64), (64, 8));

        let cfg = CacheLevelConfig {
            size_bytes: Some(32768),
            sets: Some(64),
            ways: None,
            ..CacheLevelConfig::with_geometry(0, 0)
        };
        assert_eq!(cfg.resolve_geometry(64), (64, 8));
    }

    #[test]
    fn latency_splits_evenly() {
        let cfg = CacheLevelConfig {
            latency: Some(4),
            ..CacheLevelConfig::with_geometry(64, 8)
        };
        let (hit, fill) = cfg.resolve_latency(64, 8);
        assert_eq!(hit + fill, 4);
        assert_eq!(hit, fill);
    }

    #[test]
    fn latency_derives_from_capacity() {
        let cfg = CacheLevelConfig::with_geometry(2048, 16);
        let (hit, fill) = cfg.resolve_latency(2048, 16);
        // 0.416 * 32768^0.343 ≈ 14.7, rounded up
        assert_eq!(hit + fill, 15);
    }

    #[test]
    fn mshr_derivation() {
        let cfg = CacheLevelConfig::with_geometry(64, 8);
        assert_eq!(cfg.resolve_mshr(64, 2), (64 * 2 * 2 / 16) as usize);
    }

    #[test]
    fn json_round_trip() {
        let json = r#"{
            "core": { "rob_size": 64, "fetch_width": 4 },
            "caches": { "l1d": { "sets": 1, "ways": 1, "latency": 4 } },
            "dram": { "channels": 2, "banks": 4 }
        }"#;
        let cfg: SimConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.core.rob_size, 64);
        assert_eq!(cfg.core.fetch_width, 4);
        assert_eq!(cfg.caches.l1d.sets, Some(1));
        assert_eq!(cfg.dram.channels, 2);
        // untouched sections keep their defaults
        assert_eq!(cfg.caches.llc.sets, Some(2048));
        assert_eq!(cfg.core.retire_width, 5);
    }
}
