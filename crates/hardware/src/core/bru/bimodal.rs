//! Bimodal branch direction predictor.
//!
//! A table of saturating two-bit counters indexed by the branch address.
//! Predicts taken when the counter is in the upper half; training moves the
//! counter toward the observed outcome.

use crate::common::addr::Address;

const COUNTER_MAX: u8 = 3;
const TAKEN_THRESHOLD: u8 = 2;

/// Bimodal predictor state.
pub struct Bimodal {
    table: Vec<u8>,
    mask: usize,
}

impl Bimodal {
    /// Creates a predictor with `table_size` counters (rounded up to a
    /// power of two).
    pub fn new(table_size: usize) -> Self {
        let size = table_size.next_power_of_two().max(1);
        Self {
            table: vec![0; size],
            mask: size - 1,
        }
    }

    fn index(&self, ip: Address) -> usize {
        (ip.value() as usize) & self.mask
    }

    /// Predicts the direction of the branch at `ip`.
    pub fn predict(&self, ip: Address) -> bool {
        self.table[self.index(ip)] >= TAKEN_THRESHOLD
    }

    /// Trains on the resolved outcome.
    pub fn update(&mut self, ip: Address, taken: bool) {
        let idx = self.index(ip);
        let counter = &mut self.table[idx];
        if taken {
            *counter = (*counter + 1).min(COUNTER_MAX);
        } else {
            *counter = counter.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_not_taken() {
        let bp = Bimodal::new(1024);
        assert!(!bp.predict(Address::from(0x400000)));
    }

    #[test]
    fn repeated_taken_trains_taken() {
        let mut bp = Bimodal::new(1024);
        let ip = Address::from(0x400000);
        bp.update(ip, true);
        bp.update(ip, true);
        assert!(bp.predict(ip));
    }

    #[test]
    fn hysteresis_survives_one_not_taken() {
        let mut bp = Bimodal::new(1024);
        let ip = Address::from(0x400000);
        for _ in 0..3 {
            bp.update(ip, true);
        }
        bp.update(ip, false);
        assert!(bp.predict(ip), "one contrary outcome should not flip");
    }
}
