//! Simulation error definitions.
//!
//! This module defines the crate-wide error type. It distinguishes:
//! 1. **Invariant violations:** Slice domain and extent errors, arithmetic
//!    overflow, and bandwidth overdraw. These indicate programming errors and
//!    propagate out to abort the run.
//! 2. **Deadlock:** A pipeline buffer whose head has not advanced within the
//!    deadlock threshold. Reported with the offending CPU so the simulator
//!    can dump queue state before exiting.
//!
//! Queue-full and trace-EOF conditions are ordinary control flow (`bool`
//! returns and reader repetition) and never appear here.

use thiserror::Error;

use super::chrono::TimePoint;

/// Errors that abort a simulation run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SimError {
    /// A buffer head has been stuck past the deadlock threshold.
    ///
    /// Carries the CPU index whose pipeline stopped making progress and the
    /// time at which the deadlock was detected.
    #[error("deadlock detected on CPU {cpu} at {now:?}")]
    Deadlock {
        /// Index of the CPU whose buffer stopped draining.
        cpu: usize,
        /// Virtual time at which the deadlock check fired.
        now: TimePoint,
    },

    /// An address-slice operation would produce a value outside its extent.
    #[error("value {value:#x} does not fit in extent [{upper}:{lower})")]
    SliceDomain {
        /// The out-of-domain value.
        value: u64,
        /// Upper (exclusive) bit position of the extent.
        upper: u32,
        /// Lower (inclusive) bit position of the extent.
        lower: u32,
    },

    /// Two dynamically-bound slices of different extents were combined.
    #[error("extent mismatch: [{lhs_upper}:{lhs_lower}) vs [{rhs_upper}:{rhs_lower})")]
    ExtentMismatch {
        /// Upper bit of the left-hand extent.
        lhs_upper: u32,
        /// Lower bit of the left-hand extent.
        lhs_lower: u32,
        /// Upper bit of the right-hand extent.
        rhs_upper: u32,
        /// Lower bit of the right-hand extent.
        rhs_lower: u32,
    },

    /// A signed offset between two slices exceeds the signed range.
    #[error("offset between {base:#x} and {other:#x} overflows the signed range")]
    OffsetOverflow {
        /// Value of the base slice.
        base: u64,
        /// Value of the other slice.
        other: u64,
    },

    /// An unsigned offset was requested with the arguments out of order.
    #[error("unsigned offset requires base {base:#x} <= other {other:#x}")]
    OffsetUnderflow {
        /// Value of the base slice.
        base: u64,
        /// Value of the other slice.
        other: u64,
    },

    /// A checked narrowing cast lost significant bits.
    #[error("narrowing cast of {value:#x} exceeds the {width}-bit target")]
    NarrowingOverflow {
        /// The value that does not fit.
        value: u64,
        /// Width of the narrowing target in bits.
        width: u32,
    },

    /// A pipeline stage consumed more than its per-tick allowance.
    #[error("exceeded bandwidth of {maximum}")]
    BandwidthExceeded {
        /// The per-tick allowance that was overdrawn.
        maximum: u64,
    },
}
