//! Branch resolution units: direction predictor and target buffer hooks.
//!
//! The core consults these through a fixed hook contract: a target lookup
//! and an always-taken hint from the BTB, a direction prediction from the
//! predictor, and training calls for both once the trace reveals the
//! outcome. Implementations are tagged values; hooks they do not need are
//! no-ops.

/// Bimodal direction predictor.
pub mod bimodal;
/// Branch target buffer with RAS and indirect predictor.
pub mod btb;

use crate::common::addr::Address;
use crate::stats::BranchType;

pub use self::bimodal::Bimodal;
pub use self::btb::{BasicBtb, BtbParams};

/// Tagged set of direction predictors.
pub enum BranchPredictor {
    /// Two-bit saturating counters indexed by branch address.
    Bimodal(Bimodal),
}

impl BranchPredictor {
    /// Creates the default predictor.
    pub fn bimodal(table_size: usize) -> Self {
        Self::Bimodal(Bimodal::new(table_size))
    }

    /// Predicts the direction of the branch at `ip`.
    pub fn predict(
        &mut self,
        ip: Address,
        _predicted_target: Address,
        _always_taken: bool,
        _branch_type: BranchType,
    ) -> bool {
        match self {
            Self::Bimodal(bp) => bp.predict(ip),
        }
    }

    /// Trains on the resolved outcome.
    pub fn last_branch_result(
        &mut self,
        ip: Address,
        _target: Address,
        taken: bool,
        _branch_type: BranchType,
    ) {
        match self {
            Self::Bimodal(bp) => bp.update(ip, taken),
        }
    }
}

/// Tagged set of target buffers.
pub enum Btb {
    /// Direct-target LRU table + RAS + indirect table.
    Basic(BasicBtb),
}

impl Btb {
    /// Creates the default BTB.
    pub fn basic(params: &BtbParams) -> Self {
        Self::Basic(BasicBtb::new(params))
    }

    /// Predicts the target of the branch at `ip`.
    pub fn prediction(&mut self, ip: Address, branch_type: BranchType) -> (Address, bool) {
        match self {
            Self::Basic(btb) => btb.prediction(ip, branch_type),
        }
    }

    /// Trains on the resolved branch.
    pub fn update(&mut self, ip: Address, target: Address, taken: bool, branch_type: BranchType) {
        match self {
            Self::Basic(btb) => btb.update(ip, target, taken, branch_type),
        }
    }
}
