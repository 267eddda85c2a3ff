//! The in-flight instruction record.
//!
//! Instructions are opaque dependency descriptors: the trace supplies the
//! program counter, register indices, and memory operand addresses, and the
//! pipeline tracks lifecycle state on top. Branch classification is inferred
//! from how the record touches the stack pointer, flags, and instruction
//! pointer, since the trace format does not name branch kinds directly.

use crate::common::addr::Address;
use crate::common::chrono::TimePoint;
use crate::common::constants::{NUM_INSTR_DESTINATIONS, NUM_INSTR_SOURCES};
use crate::stats::BranchType;

/// Register id the trace uses for the stack pointer.
pub const REG_STACK_POINTER: u8 = 6;
/// Register id the trace uses for the flags register.
pub const REG_FLAGS: u8 = 25;
/// Register id the trace uses for the instruction pointer.
pub const REG_INSTRUCTION_POINTER: u8 = 26;

/// Lifecycle state of one pipeline step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Status {
    /// Not yet started.
    #[default]
    Pending,
    /// Issued, awaiting completion.
    InFlight,
    /// Done.
    Completed,
}

/// A load or store tracked by the LQ/SQ.
#[derive(Clone, Debug, Default)]
pub struct LsqEntry {
    /// Owning instruction.
    pub instr_id: u64,
    /// Operand virtual address.
    pub virtual_address: Address,
    /// Translated physical address, once known.
    pub physical_address: Address,
    /// Program counter of the owning instruction.
    pub ip: Address,
    /// Store instruction this load must wait for, if any.
    pub producer_id: Option<u64>,
    /// Translation progress.
    pub translated: Status,
    /// Bus access progress (for stores: data availability).
    pub fetched: Status,
    /// Time the entry last advanced.
    pub event_cycle: TimePoint,
    /// Address space identifiers.
    pub asid: [u8; 2],
}

/// One instruction in flight, from fetch to retirement.
#[derive(Clone, Debug, Default)]
pub struct OooInstr {
    /// Monotonically increasing id, assigned by the trace reader fleet.
    pub instr_id: u64,
    /// Program counter.
    pub ip: Address,
    /// Physical address of the instruction, once the ITLB answers.
    pub instruction_pa: Address,

    /// True for any control-flow instruction.
    pub is_branch: bool,
    /// True when the instruction has at least one memory operand.
    pub is_memory: bool,
    /// Trace-supplied taken/not-taken outcome.
    pub branch_taken: bool,
    /// Set when the front end mispredicted this branch.
    pub branch_mispredicted: bool,
    /// Inferred branch class.
    pub branch_type: BranchType,
    /// Target, back-filled from the next fetched instruction when taken.
    pub branch_target: Address,

    /// Address space identifiers.
    pub asid: [u8; 2],

    /// Translation progress of the instruction's own fetch.
    pub translated: Status,
    /// Fetch progress.
    pub fetched: Status,
    /// Decode progress.
    pub decoded: Status,
    /// Scheduling progress.
    pub scheduled: Status,
    /// Execution progress.
    pub executed: Status,

    /// Register operand count (sources and destinations).
    pub num_reg_ops: i32,
    /// Memory operand count still outstanding.
    pub num_mem_ops: i32,
    /// Producers this instruction still waits on.
    pub num_reg_dependent: i32,

    /// Destination register indices; zero means unused.
    pub destination_registers: [u8; NUM_INSTR_DESTINATIONS],
    /// Source register indices; zero means unused.
    pub source_registers: [u8; NUM_INSTR_SOURCES],
    /// Destination memory operands; zero means unused.
    pub destination_memory: [Address; NUM_INSTR_DESTINATIONS],
    /// Source memory operands; zero means unused.
    pub source_memory: [Address; NUM_INSTR_SOURCES],

    /// Ids of instructions whose register sources this one produces.
    pub registers_instrs_depend_on_me: Vec<u64>,
    /// Ids of loads that must wait for this store.
    pub memory_instrs_depend_on_me: Vec<u64>,

    /// Whether each source memory operand has an LQ entry.
    pub source_added: [bool; NUM_INSTR_SOURCES],
    /// Whether each destination memory operand has an SQ entry.
    pub destination_added: [bool; NUM_INSTR_DESTINATIONS],
    /// LQ slot per source memory operand.
    pub lq_index: [Option<usize>; NUM_INSTR_SOURCES],
    /// SQ slot per destination memory operand.
    pub sq_index: [Option<usize>; NUM_INSTR_DESTINATIONS],

    /// Time the instruction last advanced; drives buffer readiness and the
    /// deadlock check.
    pub event_cycle: TimePoint,
}

impl OooInstr {
    /// Builds an instruction from trace fields.
    pub fn new(
        cpu: usize,
        ip: u64,
        is_branch: bool,
        branch_taken: bool,
        destination_registers: [u8; NUM_INSTR_DESTINATIONS],
        source_registers: [u8; NUM_INSTR_SOURCES],
        destination_memory: [u64; NUM_INSTR_DESTINATIONS],
        source_memory: [u64; NUM_INSTR_SOURCES],
    ) -> Self {
        Self {
            ip: Address::from(ip),
            is_branch,
            branch_taken,
            destination_registers,
            source_registers,
            destination_memory: destination_memory.map(Address::from),
            source_memory: source_memory.map(Address::from),
            asid: [cpu as u8, cpu as u8],
            ..Self::default()
        }
    }

    /// Counts operands, classifies the branch, and folds the stack pointer.
    ///
    /// Invoked once when the instruction enters the fetch buffer.
    pub fn decorate(&mut self) {
        let mut reads_sp = false;
        let mut writes_sp = false;
        let mut reads_flags = false;
        let mut reads_ip = false;
        let mut writes_ip = false;
        let mut reads_other = false;

        for reg in self.destination_registers {
            match reg {
                0 => {}
                REG_STACK_POINTER => writes_sp = true,
                REG_INSTRUCTION_POINTER => writes_ip = true,
                _ => {}
            }
            if reg != 0 {
                self.num_reg_ops += 1;
            }
        }
        for mem in self.destination_memory {
            if mem.value() != 0 {
                self.num_mem_ops += 1;
            }
        }

        for reg in self.source_registers {
            match reg {
                0 => {}
                REG_STACK_POINTER => reads_sp = true,
                REG_FLAGS => reads_flags = true,
                REG_INSTRUCTION_POINTER => reads_ip = true,
                _ => reads_other = true,
            }
            if reg != 0 {
                self.num_reg_ops += 1;
            }
        }
        for mem in self.source_memory {
            if mem.value() != 0 {
                self.num_mem_ops += 1;
            }
        }

        if self.num_mem_ops > 0 {
            self.is_memory = true;
        }

        self.branch_type = if !reads_sp && !reads_flags && writes_ip && !reads_other {
            self.is_branch = true;
            self.branch_taken = true;
            BranchType::DirectJump
        } else if !reads_sp && !reads_flags && writes_ip && reads_other {
            self.is_branch = true;
            self.branch_taken = true;
            BranchType::Indirect
        } else if !reads_sp && reads_ip && !writes_sp && writes_ip && reads_flags && !reads_other {
            self.is_branch = true;
            BranchType::Conditional
        } else if reads_sp && reads_ip && writes_sp && writes_ip && !reads_flags && !reads_other {
            self.is_branch = true;
            self.branch_taken = true;
            BranchType::DirectCall
        } else if reads_sp && reads_ip && writes_sp && writes_ip && !reads_flags && reads_other {
            self.is_branch = true;
            self.branch_taken = true;
            BranchType::IndirectCall
        } else if reads_sp && !reads_ip && writes_sp && writes_ip {
            self.is_branch = true;
            self.branch_taken = true;
            BranchType::Return
        } else if writes_ip {
            self.is_branch = true;
            BranchType::Other
        } else {
            BranchType::NotBranch
        };

        if !self.is_branch || !self.branch_taken {
            self.branch_target = Address::default();
        }

        // Stack pointer folding. The true SP value is almost always known at
        // decode for calls, returns, pushes, and pops, so those need not wait
        // on the SP dependency chain. Variable-sized SP updates (reads_other)
        // still do.
        if writes_sp && (self.is_branch || self.num_mem_ops > 0 || !reads_other) {
            for reg in &mut self.destination_registers {
                if *reg == REG_STACK_POINTER {
                    *reg = 0;
                    self.num_reg_ops -= 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare(ip: u64) -> OooInstr {
        OooInstr::new(0, ip, false, false, [0; 2], [0; 4], [0; 2], [0; 4])
    }

    #[test]
    fn plain_alu_is_not_a_branch() {
        let mut instr = bare(0x400000);
        instr.source_registers = [1, 2, 0, 0];
        instr.destination_registers = [3, 0];
        instr.decorate();
        assert!(!instr.is_branch);
        assert!(!instr.is_memory);
        assert_eq!(instr.num_reg_ops, 3);
    }

    #[test]
    fn conditional_branch_classification() {
        let mut instr = bare(0x400000);
        instr.branch_taken = true;
        instr.source_registers = [REG_INSTRUCTION_POINTER, REG_FLAGS, 0, 0];
        instr.destination_registers = [REG_INSTRUCTION_POINTER, 0];
        instr.decorate();
        assert_eq!(instr.branch_type, BranchType::Conditional);
        assert!(instr.branch_taken);
    }

    #[test]
    fn return_classification_and_sp_folding() {
        let mut instr = bare(0x400000);
        instr.source_registers = [REG_STACK_POINTER, 0, 0, 0];
        instr.destination_registers = [REG_STACK_POINTER, REG_INSTRUCTION_POINTER];
        instr.decorate();
        assert_eq!(instr.branch_type, BranchType::Return);
        // SP dropped from the destinations by folding
        assert!(!instr.destination_registers.contains(&REG_STACK_POINTER));
    }

    #[test]
    fn direct_call_classification() {
        let mut instr = bare(0x400000);
        instr.source_registers = [REG_STACK_POINTER, REG_INSTRUCTION_POINTER, 0, 0];
        instr.destination_registers = [REG_STACK_POINTER, REG_INSTRUCTION_POINTER];
        instr.destination_memory[0] = Address::from(0x7FFF_0000);
        instr.decorate();
        assert_eq!(instr.branch_type, BranchType::DirectCall);
        assert!(instr.is_memory);
    }

    #[test]
    fn not_taken_branch_clears_target() {
        let mut instr = bare(0x400000);
        instr.branch_taken = false;
        instr.branch_target = Address::from(0x400100);
        instr.source_registers = [REG_INSTRUCTION_POINTER, REG_FLAGS, 0, 0];
        instr.destination_registers = [REG_INSTRUCTION_POINTER, 0];
        instr.decorate();
        assert_eq!(instr.branch_target.value(), 0);
    }
}
