//! Common types and helpers shared across the hierarchy.

/// Strongly-typed addresses and address slices.
pub mod addr;
/// Per-tick bandwidth allowances.
pub mod bandwidth;
/// Low-level bit manipulation helpers.
pub mod bits;
/// Virtual-time durations, instants, and the clock.
pub mod chrono;
/// Fixed architectural constants.
pub mod constants;
/// Simulation error definitions.
pub mod error;
/// Generic set-associative LRU table.
pub mod lru_table;
/// Values paired with a ready time.
pub mod waitable;

pub use addr::{Address, AddressSlice, BlockNumber, DynamicExtent, Extent, PageNumber, StaticExtent};
pub use bandwidth::Bandwidth;
pub use chrono::{Clock, Picos, TimePoint};
pub use error::SimError;
pub use lru_table::LruTable;
pub use waitable::Waitable;
