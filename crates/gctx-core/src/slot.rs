//! Bitmap slot allocator
//!
//! One bit per slot, set when allocated. Free runs are found by scanning
//! inverted 64-bit blocks with `trailing_zeros`, starting at a caller hint
//! and wrapping once. Runs never wrap around the end of the bitmap since
//! slots map onto contiguous memory.

use crate::traits::SlotAllocator;

const BITS_PER_BLOCK: usize = 64;

pub struct SlotBitmap {
    blocks: Box<[u64]>,
    slots: usize,
    used: usize,
}

impl SlotBitmap {
    pub fn new(slots: usize) -> Self {
        let num_blocks = slots.div_ceil(BITS_PER_BLOCK);
        Self {
            blocks: vec![0u64; num_blocks].into_boxed_slice(),
            slots,
            used: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots
    }

    #[inline]
    pub fn used(&self) -> usize {
        self.used
    }

    #[inline]
    pub fn is_set(&self, pos: usize) -> bool {
        debug_assert!(pos < self.slots);
        self.blocks[pos / BITS_PER_BLOCK] & (1u64 << (pos % BITS_PER_BLOCK)) != 0
    }

    fn set_range(&mut self, pos: usize, n: usize, value: bool) {
        for i in pos..pos + n {
            let mask = 1u64 << (i % BITS_PER_BLOCK);
            let block = &mut self.blocks[i / BITS_PER_BLOCK];
            debug_assert_eq!(*block & mask != 0, !value, "slot {} already {}", i,
                             if value { "allocated" } else { "free" });
            if value {
                *block |= mask;
            } else {
                *block &= !mask;
            }
        }
    }

    /// First free slot in `[from, end)`
    fn next_free(&self, from: usize, end: usize) -> Option<usize> {
        let mut i = from;
        while i < end {
            let block = i / BITS_PER_BLOCK;
            let free = !self.blocks[block] & (!0u64 << (i % BITS_PER_BLOCK));
            if free != 0 {
                let idx = block * BITS_PER_BLOCK + free.trailing_zeros() as usize;
                return (idx < end).then_some(idx);
            }
            i = (block + 1) * BITS_PER_BLOCK;
        }
        None
    }

    fn run_len(&self, from: usize, max: usize) -> usize {
        let mut len = 0;
        while len < max && from + len < self.slots && !self.is_set(from + len) {
            len += 1;
        }
        len
    }

    fn find_run(&self, n: usize, hint: usize) -> Option<usize> {
        if n == 0 || n > self.slots - self.used {
            return None;
        }
        let hint = hint % self.slots;
        for (start, end) in [(hint, self.slots), (0, hint)] {
            let mut pos = start;
            while let Some(free) = self.next_free(pos, end) {
                let len = self.run_len(free, n);
                if len == n {
                    return Some(free);
                }
                pos = free + len + 1;
            }
        }
        None
    }
}

impl SlotAllocator for SlotBitmap {
    fn available(&self, n: usize) -> bool {
        self.find_run(n, 0).is_some()
    }

    fn allocate(&mut self, n: usize, hint: usize) -> Option<usize> {
        let pos = self.find_run(n, hint)?;
        self.set_range(pos, n, true);
        self.used += n;
        Some(pos)
    }

    fn deallocate(&mut self, pos: usize, n: usize) {
        assert!(pos + n <= self.slots, "slot range {}+{} out of bounds", pos, n);
        self.set_range(pos, n, false);
        self.used -= n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_slots_fill_and_drain() {
        let mut bm = SlotBitmap::new(130);
        let mut got = Vec::new();
        while let Some(pos) = bm.allocate(1, 0) {
            got.push(pos);
        }
        assert_eq!(got.len(), 130);
        assert_eq!(bm.used(), 130);
        assert!(!bm.available(1));

        bm.deallocate(64, 1);
        assert!(bm.available(1));
        assert_eq!(bm.allocate(1, 0), Some(64));
    }

    #[test]
    fn test_contiguous_runs() {
        let mut bm = SlotBitmap::new(16);
        assert_eq!(bm.allocate(3, 0), Some(0));
        assert_eq!(bm.allocate(1, 0), Some(3));
        bm.deallocate(0, 3);
        // hole of 3 at the front cannot satisfy 4
        assert_eq!(bm.allocate(4, 0), Some(4));
        assert_eq!(bm.allocate(3, 0), Some(0));
        assert!(bm.is_set(2));
        assert!(!bm.is_set(8));
    }

    #[test]
    fn test_hint_wraps() {
        let mut bm = SlotBitmap::new(8);
        assert_eq!(bm.allocate(2, 6), Some(6));
        assert_eq!(bm.allocate(2, 6), Some(0));
        assert_eq!(bm.allocate(1, 100), Some(4));
    }

    #[test]
    fn test_run_spanning_blocks() {
        let mut bm = SlotBitmap::new(200);
        assert_eq!(bm.allocate(60, 0), Some(0));
        assert_eq!(bm.allocate(10, 0), Some(60));
        assert!(bm.is_set(69));
        assert!(!bm.available(200));
        assert!(bm.available(130));
    }

    #[test]
    #[should_panic]
    fn test_deallocate_out_of_range() {
        let mut bm = SlotBitmap::new(4);
        bm.deallocate(3, 2);
    }
}
