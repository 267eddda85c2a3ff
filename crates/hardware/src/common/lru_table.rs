//! Generic set-associative table with true-LRU replacement.
//!
//! The decoded-instruction buffer, the walker's page-size caches, and the
//! BTB are all small LRU tables keyed by some projection of an address. The
//! caller supplies the key (already shifted/masked for its use); the table
//! handles set selection, tag matching, and recency.

use super::bits::{bitmask, lg2};

#[derive(Clone)]
struct Block<T> {
    last_used: u64,
    tag: u64,
    data: T,
}

/// A set-associative LRU table mapping `u64` tags to values.
#[derive(Clone)]
pub struct LruTable<T> {
    sets: usize,
    ways: usize,
    access_count: u64,
    blocks: Vec<Option<Block<T>>>,
}

impl<T: Clone> LruTable<T> {
    /// Creates a table with `sets` sets of `ways` ways.
    ///
    /// # Panics
    ///
    /// Panics if `sets` is not a power of two or either dimension is zero.
    pub fn new(sets: usize, ways: usize) -> Self {
        assert!(sets > 0 && ways > 0, "table must have capacity");
        assert!(sets.is_power_of_two(), "set count must be a power of two");
        Self {
            sets,
            ways,
            access_count: 0,
            blocks: vec![None; sets * ways],
        }
    }

    /// Number of sets.
    pub const fn sets(&self) -> usize {
        self.sets
    }

    /// Associativity.
    pub const fn ways(&self) -> usize {
        self.ways
    }

    fn set_range(&self, tag: u64) -> std::ops::Range<usize> {
        let set = (tag & bitmask(lg2(self.sets as u64))) as usize;
        let begin = set * self.ways;
        begin..begin + self.ways
    }

    /// Looks up `tag`, updating recency on a hit.
    pub fn check_hit(&mut self, tag: u64) -> Option<T> {
        let range = self.set_range(tag);
        self.access_count += 1;
        let count = self.access_count;
        self.blocks[range]
            .iter_mut()
            .flatten()
            .find(|block| block.tag == tag)
            .map(|block| {
                block.last_used = count;
                block.data.clone()
            })
    }

    /// Installs `data` under `tag`, replacing a matching entry if present,
    /// otherwise the least recently used way of the set.
    pub fn fill(&mut self, tag: u64, data: T) {
        let range = self.set_range(tag);
        self.access_count += 1;
        let count = self.access_count;

        let slot = {
            let set = &mut self.blocks[range];
            if let Some(pos) = set
                .iter()
                .position(|b| b.as_ref().is_some_and(|b| b.tag == tag))
            {
                pos
            } else if let Some(pos) = set.iter().position(Option::is_none) {
                pos
            } else {
                set.iter()
                    .enumerate()
                    .min_by_key(|(_, b)| b.as_ref().map_or(0, |b| b.last_used))
                    .map_or(0, |(pos, _)| pos)
            }
        };

        let begin = self.set_range(tag).start;
        self.blocks[begin + slot] = Some(Block {
            last_used: count,
            tag,
            data,
        });
    }

    /// Removes `tag` from the table, returning its value if present.
    pub fn invalidate(&mut self, tag: u64) -> Option<T> {
        let range = self.set_range(tag);
        self.blocks[range]
            .iter_mut()
            .find(|b| b.as_ref().is_some_and(|b| b.tag == tag))
            .and_then(Option::take)
            .map(|b| b.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn miss_on_empty() {
        let mut table: LruTable<u64> = LruTable::new(4, 2);
        assert_eq!(table.check_hit(0x10), None);
    }

    #[test]
    fn fill_then_hit() {
        let mut table = LruTable::new(4, 2);
        table.fill(0x10, 7_u64);
        assert_eq!(table.check_hit(0x10), Some(7));
    }

    #[test]
    fn fill_replaces_matching_tag() {
        let mut table = LruTable::new(1, 2);
        table.fill(0x10, 1_u64);
        table.fill(0x10, 2_u64);
        assert_eq!(table.check_hit(0x10), Some(2));
        // The other way is still free: a second tag fits
        table.fill(0x20, 3_u64);
        assert_eq!(table.check_hit(0x10), Some(2));
    }

    #[test]
    fn lru_way_is_evicted() {
        let mut table = LruTable::new(1, 2);
        table.fill(0xA, 1_u64);
        table.fill(0xB, 2_u64);
        // Touch A so B becomes LRU
        assert!(table.check_hit(0xA).is_some());
        table.fill(0xC, 3_u64);
        assert_eq!(table.check_hit(0xB), None);
        assert_eq!(table.check_hit(0xA), Some(1));
        assert_eq!(table.check_hit(0xC), Some(3));
    }

    #[test]
    fn invalidate_removes_entry() {
        let mut table = LruTable::new(2, 2);
        table.fill(0x5, 9_u64);
        assert_eq!(table.invalidate(0x5), Some(9));
        assert_eq!(table.check_hit(0x5), None);
        assert_eq!(table.invalidate(0x5), None);
    }

    #[test]
    fn distinct_sets_do_not_interfere() {
        let mut table = LruTable::new(2, 1);
        table.fill(0x2, 1_u64); // set 0
        table.fill(0x3, 2_u64); // set 1
        assert_eq!(table.check_hit(0x2), Some(1));
        assert_eq!(table.check_hit(0x3), Some(2));
    }
}
