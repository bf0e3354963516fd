//! Data block allocator
//!
//! Hierarchical bitmap over the data device's block array. Leaf words carry
//! one bit per block (1 = free); each upper level summarizes 64 words below
//! it, so allocate and free both walk one root-to-leaf path and stay
//! O(log block_count).

/// Bitmap allocator of fixed-size data blocks
pub struct Allocator {
    /// levels[0] are the leaf words; the last level is a single root word
    levels: Vec<Vec<u64>>,
    total: u64,
    free: u64,
}

impl Allocator {
    /// Create an allocator with all `count` blocks free
    #[must_use]
    pub fn new(count: u64) -> Self {
        let mut levels = Vec::new();
        let mut bits = count;
        loop {
            let words = (bits.div_ceil(64)).max(1) as usize;
            let mut level = vec![u64::MAX; words];
            // bits past the end are permanently "used"
            let tail = (bits % 64) as u32;
            if tail != 0 {
                level[words - 1] = (1u64 << tail) - 1;
            }
            if bits == 0 {
                level[0] = 0;
            }
            levels.push(level);
            if words == 1 {
                break;
            }
            bits = words as u64;
        }
        Self {
            levels,
            total: count,
            free: count,
        }
    }

    /// Number of blocks managed
    #[must_use]
    pub fn total_count(&self) -> u64 {
        self.total
    }

    /// Number of free blocks
    #[must_use]
    pub fn get_free_count(&self) -> u64 {
        self.free
    }

    /// Check whether a block is currently allocated
    #[must_use]
    pub fn is_allocated(&self, idx: u64) -> bool {
        idx >= self.total || self.levels[0][(idx / 64) as usize] & (1 << (idx % 64)) == 0
    }

    /// Allocate one block, or `None` when the device is full
    pub fn allocate(&mut self) -> Option<u64> {
        if self.free == 0 {
            return None;
        }
        // descend the summary tree picking the first free subtree
        let mut word = 0usize;
        for depth in (0..self.levels.len()).rev() {
            let w = self.levels[depth][word];
            debug_assert_ne!(w, 0, "BUG: summary bit set over empty subtree");
            word = word * 64 + w.trailing_zeros() as usize;
        }
        let idx = word as u64;
        self.set_bit(idx, false);
        self.free -= 1;
        Some(idx)
    }

    /// Return a block to the free pool
    pub fn free(&mut self, idx: u64) {
        assert!(idx < self.total, "block index out of range");
        if !self.is_allocated(idx) {
            return;
        }
        self.set_bit(idx, true);
        self.free += 1;
    }

    /// Mark a block allocated during recovery
    pub fn mark_used(&mut self, idx: u64) {
        assert!(idx < self.total, "block index out of range");
        if self.is_allocated(idx) {
            return;
        }
        self.set_bit(idx, false);
        self.free -= 1;
    }

    fn set_bit(&mut self, idx: u64, free: bool) {
        let mut bit = idx;
        for depth in 0..self.levels.len() {
            let word = (bit / 64) as usize;
            let mask = 1u64 << (bit % 64);
            let was = self.levels[depth][word];
            let now = if free { was | mask } else { was & !mask };
            self.levels[depth][word] = now;
            // propagate only while the word's emptiness changed
            if depth + 1 == self.levels.len() || (was != 0) == (now != 0) {
                break;
            }
            bit = word as u64;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_all_then_full() {
        let mut a = Allocator::new(5);
        for expect in 0..5 {
            assert_eq!(a.allocate(), Some(expect));
        }
        assert_eq!(a.allocate(), None);
        assert_eq!(a.get_free_count(), 0);
    }

    #[test]
    fn test_free_and_reallocate() {
        let mut a = Allocator::new(100);
        let blocks: Vec<u64> = (0..10).map(|_| a.allocate().unwrap()).collect();
        assert_eq!(a.get_free_count(), 90);

        a.free(blocks[3]);
        a.free(blocks[7]);
        assert_eq!(a.get_free_count(), 92);

        // the lowest freed block comes back first
        assert_eq!(a.allocate(), Some(blocks[3]));
        assert_eq!(a.allocate(), Some(blocks[7]));
    }

    #[test]
    fn test_mark_used_idempotent() {
        let mut a = Allocator::new(64);
        a.mark_used(10);
        a.mark_used(10);
        assert_eq!(a.get_free_count(), 63);
        assert!(a.is_allocated(10));
        assert!(!a.is_allocated(11));
    }

    #[test]
    fn test_large_multi_level() {
        // 1_000_000 bits -> 15625 words -> 245 -> 4 -> 1 root
        let mut a = Allocator::new(1_000_000);
        assert_eq!(a.get_free_count(), 1_000_000);
        a.mark_used(999_999);
        assert!(a.is_allocated(999_999));

        let first = a.allocate().unwrap();
        assert_eq!(first, 0);
        a.free(first);
        assert_eq!(a.get_free_count(), 999_999);
    }

    #[test]
    fn test_double_free_is_noop() {
        let mut a = Allocator::new(8);
        let b = a.allocate().unwrap();
        a.free(b);
        a.free(b);
        assert_eq!(a.get_free_count(), 8);
    }
}
