//! Simulation statistics collection and reporting.
//!
//! Each component keeps two copies of its counters: `sim_stats` accumulates
//! during the current phase and `roi_stats` is frozen when the region of
//! interest ends. This module provides:
//! 1. **Core:** instructions, cycles, branch outcomes by type, and ROB
//!    occupancy at mispredicts.
//! 2. **Cache:** per-access-type and per-CPU hits and misses, MSHR merges,
//!    prefetch effectiveness, and aggregate miss latency.
//! 3. **DRAM:** row-buffer hits and misses per direction, bus congestion,
//!    refresh activity, and full-write-queue rejections.
//! 4. **Printers:** the plain-text per-phase report.

use crate::channel::AccessType;

/// Branch classification, also used as a statistics dimension.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum BranchType {
    /// Not a branch.
    #[default]
    NotBranch,
    /// Unconditional branch with an immediate target.
    DirectJump,
    /// Unconditional branch through a register.
    Indirect,
    /// Conditional branch.
    Conditional,
    /// Call with an immediate target.
    DirectCall,
    /// Call through a register.
    IndirectCall,
    /// Return.
    Return,
    /// Writes the instruction pointer some other way.
    Other,
}

impl BranchType {
    /// Number of branch classes.
    pub const COUNT: usize = 8;

    /// All branch classes, in reporting order.
    pub const ALL: [Self; Self::COUNT] = [
        Self::NotBranch,
        Self::DirectJump,
        Self::Indirect,
        Self::Conditional,
        Self::DirectCall,
        Self::IndirectCall,
        Self::Return,
        Self::Other,
    ];

    /// Stable index for statistics arrays.
    pub const fn index(self) -> usize {
        match self {
            Self::NotBranch => 0,
            Self::DirectJump => 1,
            Self::Indirect => 2,
            Self::Conditional => 3,
            Self::DirectCall => 4,
            Self::IndirectCall => 5,
            Self::Return => 6,
            Self::Other => 7,
        }
    }

    /// Display name used by the MPKI breakdown.
    pub const fn name(self) -> &'static str {
        match self {
            Self::NotBranch => "NOT_BRANCH",
            Self::DirectJump => "BRANCH_DIRECT_JUMP",
            Self::Indirect => "BRANCH_INDIRECT",
            Self::Conditional => "BRANCH_CONDITIONAL",
            Self::DirectCall => "BRANCH_DIRECT_CALL",
            Self::IndirectCall => "BRANCH_INDIRECT_CALL",
            Self::Return => "BRANCH_RETURN",
            Self::Other => "BRANCH_OTHER",
        }
    }
}

/// Per-core counters for one phase.
#[derive(Clone, Debug, Default)]
pub struct CoreStats {
    /// Display name, e.g. `"cpu0"`.
    pub name: String,
    /// Instructions retired.
    pub instrs: u64,
    /// Core cycles elapsed.
    pub cycles: u64,
    /// Branches encountered, by type.
    pub total_branch_types: [u64; BranchType::COUNT],
    /// Mispredicted branches, by type.
    pub branch_type_misses: [u64; BranchType::COUNT],
    /// Total branches seen.
    pub num_branch: u64,
    /// Total branches mispredicted.
    pub branch_mispredictions: u64,
    /// Sum of ROB occupancy observed at each misprediction.
    pub total_rob_occupancy_at_mispredict: u64,
}

impl CoreStats {
    /// IPC over the phase.
    pub fn ipc(&self) -> f64 {
        if self.cycles == 0 {
            0.0
        } else {
            self.instrs as f64 / self.cycles as f64
        }
    }

    /// Branch prediction accuracy in percent.
    pub fn branch_accuracy(&self) -> f64 {
        if self.num_branch == 0 {
            100.0
        } else {
            100.0 * (self.num_branch - self.branch_mispredictions) as f64 / self.num_branch as f64
        }
    }

    /// Mispredictions per thousand instructions.
    pub fn mpki(&self) -> f64 {
        if self.instrs == 0 {
            0.0
        } else {
            1000.0 * self.branch_mispredictions as f64 / self.instrs as f64
        }
    }

    /// Prints the per-core report.
    pub fn print(&self) {
        println!(
            "{} cumulative IPC: {:.4} instructions: {} cycles: {}",
            self.name,
            self.ipc(),
            self.instrs,
            self.cycles
        );
        println!(
            "{} Branch Prediction Accuracy: {:.4}% MPKI: {:.4} Average ROB Occupancy at Mispredict: {:.4}",
            self.name,
            self.branch_accuracy(),
            self.mpki(),
            if self.branch_mispredictions == 0 {
                0.0
            } else {
                self.total_rob_occupancy_at_mispredict as f64 / self.branch_mispredictions as f64
            }
        );
        println!("Branch type MPKI");
        for ty in &BranchType::ALL[1..] {
            let misses = self.branch_type_misses[ty.index()];
            println!(
                "{}: {:.4}",
                ty.name(),
                if self.instrs == 0 {
                    0.0
                } else {
                    1000.0 * misses as f64 / self.instrs as f64
                }
            );
        }
    }
}

/// Per-cache counters for one phase.
#[derive(Clone, Debug, Default)]
pub struct CacheStats {
    /// Display name, e.g. `"cpu0_L1D"`.
    pub name: String,
    /// Hits, indexed `[access type][cpu]`.
    pub hits: [Vec<u64>; AccessType::COUNT],
    /// Misses, indexed `[access type][cpu]`.
    pub misses: [Vec<u64>; AccessType::COUNT],
    /// Misses merged into an in-flight MSHR.
    pub mshr_merge: u64,
    /// Prefetches requested by the prefetcher hook.
    pub pf_requested: u64,
    /// Prefetches accepted into the prefetch queue.
    pub pf_issued: u64,
    /// Prefetched blocks later referenced by a demand access.
    pub pf_useful: u64,
    /// Prefetched blocks evicted without a demand reference.
    pub pf_useless: u64,
    /// Prefetches that completed a fill at this level.
    pub pf_fill: u64,
    /// Sum of miss service times, in picoseconds.
    pub total_miss_latency_ps: u64,
}

impl CacheStats {
    /// Creates zeroed counters sized for `num_cpus`.
    pub fn new(name: &str, num_cpus: usize) -> Self {
        Self {
            name: name.to_string(),
            hits: std::array::from_fn(|_| vec![0; num_cpus]),
            misses: std::array::from_fn(|_| vec![0; num_cpus]),
            ..Self::default()
        }
    }

    /// Hit and miss totals of one type across CPUs.
    pub fn total_for(&self, ty: AccessType) -> (u64, u64) {
        let hits: u64 = self.hits[ty.index()].iter().sum();
        let misses: u64 = self.misses[ty.index()].iter().sum();
        (hits, misses)
    }

    /// Total misses across all types and CPUs.
    pub fn total_misses(&self) -> u64 {
        self.misses.iter().map(|v| v.iter().sum::<u64>()).sum()
    }

    /// Prints the per-cache report.
    ///
    /// `period_ps` converts the aggregate miss latency into cycles.
    pub fn print(&self, period_ps: u64) {
        for ty in AccessType::ALL {
            let (hits, misses) = self.total_for(ty);
            println!(
                "{} {} ACCESS: {:>10} HIT: {:>10} MISS: {:>10}",
                self.name,
                ty.name(),
                hits + misses,
                hits,
                misses,
            );
        }
        println!(
            "{} MSHR MERGES: {} PREFETCH REQUESTED: {} ISSUED: {} USEFUL: {} USELESS: {}",
            self.name, self.mshr_merge, self.pf_requested, self.pf_issued, self.pf_useful,
            self.pf_useless
        );
        let misses = self.total_misses();
        println!(
            "{} AVERAGE MISS LATENCY: {:.4} cycles",
            self.name,
            if misses == 0 || period_ps == 0 {
                0.0
            } else {
                self.total_miss_latency_ps as f64 / period_ps as f64 / misses as f64
            }
        );
    }
}

/// Per-DRAM-channel counters for one phase.
#[derive(Clone, Debug, Default)]
pub struct DramChannelStats {
    /// Display name, e.g. `"Channel 0"`.
    pub name: String,
    /// Reads serviced from an open row.
    pub rq_row_buffer_hit: u64,
    /// Reads that had to open their row.
    pub rq_row_buffer_miss: u64,
    /// Writes serviced from an open row.
    pub wq_row_buffer_hit: u64,
    /// Writes that had to open their row.
    pub wq_row_buffer_miss: u64,
    /// Writes rejected because the write queue was full.
    pub wq_full: u64,
    /// Picoseconds a ready request waited for the data bus.
    pub dbus_cycle_congested_ps: u64,
    /// Number of requests that found the bus busy.
    pub dbus_count_congested: u64,
    /// Refresh rounds issued.
    pub refresh_cycles: u64,
}

impl DramChannelStats {
    /// Prints the per-channel report.
    ///
    /// `period_ps` converts congested bus time into cycles.
    pub fn print(&self, period_ps: u64) {
        println!(
            "{} RQ ROW_BUFFER_HIT: {:>10} ROW_BUFFER_MISS: {:>10}",
            self.name, self.rq_row_buffer_hit, self.rq_row_buffer_miss
        );
        let congested_cycles = if period_ps == 0 {
            0
        } else {
            self.dbus_cycle_congested_ps / period_ps
        };
        if self.dbus_count_congested == 0 {
            println!("{} AVG DBUS CONGESTED CYCLE: -", self.name);
        } else {
            println!(
                "{} AVG DBUS CONGESTED CYCLE: {:.4}",
                self.name,
                congested_cycles as f64 / self.dbus_count_congested as f64
            );
        }
        println!(
            "{} WQ ROW_BUFFER_HIT: {:>10} ROW_BUFFER_MISS: {:>10} FULL: {:>10}",
            self.name, self.wq_row_buffer_hit, self.wq_row_buffer_miss, self.wq_full
        );
        println!("{} REFRESH CYCLES: {}", self.name, self.refresh_cycles);
    }
}
