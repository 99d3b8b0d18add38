//! First-fit allocator over a fixed address range. Bookkeeping lives
//! outside the managed memory, so the range itself may be read-only or
//! executable.

use std::collections::{BTreeMap, HashMap};

use crate::os::align_up;

pub const MIN_ALIGNMENT: usize = 8;

pub struct MSpace {
    base: usize,
    max_size: usize,
    footprint_limit: usize,
    /// Free blocks by offset from `base`.
    free: BTreeMap<usize, usize>,
    /// Allocated blocks by offset from `base`.
    allocated: HashMap<usize, usize>,
    allocated_bytes: usize,
}

impl MSpace {
    pub fn new(base: usize, footprint_limit: usize, max_size: usize) -> MSpace {
        assert!(footprint_limit <= max_size);
        let mut free = BTreeMap::new();
        if footprint_limit > 0 {
            free.insert(0, footprint_limit);
        }

        MSpace {
            base,
            max_size,
            footprint_limit,
            free,
            allocated: HashMap::new(),
            allocated_bytes: 0,
        }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn footprint_limit(&self) -> usize {
        self.footprint_limit
    }

    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes
    }

    pub fn contains(&self, address: usize) -> bool {
        self.base <= address && address < self.base + self.max_size
    }

    /// Returns the address of a block of at least `size` bytes.
    pub fn alloc(&mut self, size: usize, align: usize) -> Option<usize> {
        let align = align.max(MIN_ALIGNMENT);
        let size = align_up(size.max(1), MIN_ALIGNMENT);

        let (offset, block_size, start) = self.free.iter().find_map(|(&offset, &block_size)| {
            let start = align_up(self.base + offset, align) - self.base;
            let padding = start - offset;
            if padding + size <= block_size {
                Some((offset, block_size, start))
            } else {
                None
            }
        })?;

        self.free.remove(&offset);
        if start > offset {
            self.free.insert(offset, start - offset);
        }
        let end = start + size;
        if end < offset + block_size {
            self.free.insert(end, offset + block_size - end);
        }

        self.allocated.insert(start, size);
        self.allocated_bytes += size;
        Some(self.base + start)
    }

    /// Returns the size of the freed block.
    pub fn free(&mut self, address: usize) -> usize {
        let offset = address - self.base;
        let size = self
            .allocated
            .remove(&offset)
            .unwrap_or_else(|| panic!("freeing unallocated block {:#x}", address));
        self.allocated_bytes -= size;
        self.insert_free(offset, size);
        size
    }

    pub fn usable_size(&self, address: usize) -> Option<usize> {
        self.allocated.get(&(address - self.base)).copied()
    }

    /// Only grows; blocks freed beyond a smaller limit would be lost.
    pub fn set_footprint_limit(&mut self, limit: usize) {
        assert!(limit <= self.max_size);
        if limit <= self.footprint_limit {
            return;
        }
        let old = self.footprint_limit;
        self.footprint_limit = limit;
        self.insert_free(old, limit - old);
    }

    fn insert_free(&mut self, mut offset: usize, mut size: usize) {
        if let Some((&prev, &prev_size)) = self.free.range(..offset).next_back() {
            debug_assert!(prev + prev_size <= offset, "double free");
            if prev + prev_size == offset {
                self.free.remove(&prev);
                offset = prev;
                size += prev_size;
            }
        }
        if let Some(next_size) = self.free.get(&(offset + size)).copied() {
            self.free.remove(&(offset + size));
            size += next_size;
        }
        self.free.insert(offset, size);
    }

    pub fn free_bytes(&self) -> usize {
        self.free.values().sum()
    }

    pub fn largest_free_block(&self) -> usize {
        self.free.values().copied().max().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_coalesce() {
        let mut space = MSpace::new(0x1000, 256, 1024);
        let a = space.alloc(24, 8).unwrap();
        let b = space.alloc(40, 8).unwrap();
        let c = space.alloc(8, 8).unwrap();
        assert_eq!(a, 0x1000);
        assert_eq!(b, 0x1018);
        assert_eq!(c, 0x1040);
        assert_eq!(space.allocated_bytes(), 72);

        space.free(b);
        space.free(a);
        assert_eq!(space.free_bytes(), 256 - 8);
        // a and b merged into one 64 byte block in front of c
        let merged = space.alloc(64, 8).unwrap();
        assert_eq!(merged, 0x1000);
        space.free(merged);
        space.free(c);
        assert_eq!(space.largest_free_block(), 256);
        assert_eq!(space.allocated_bytes(), 0);
    }

    #[test]
    fn test_alignment_keeps_padding_free() {
        let mut space = MSpace::new(0x1000, 256, 256);
        space.alloc(8, 8).unwrap();
        let aligned = space.alloc(16, 64).unwrap();
        assert_eq!(aligned % 64, 0);
        assert_eq!(space.free_bytes(), 256 - 8 - 16);
        assert_eq!(space.alloc(48, 8), Some(0x1008));
    }

    #[test]
    fn test_footprint_limit() {
        let mut space = MSpace::new(0, 64, 128);
        assert!(space.alloc(64, 8).is_some());
        assert!(space.alloc(8, 8).is_none());

        space.set_footprint_limit(128);
        assert_eq!(space.alloc(64, 8), Some(64));
        assert!(space.alloc(8, 8).is_none());
    }

    #[test]
    #[should_panic]
    fn test_double_free() {
        let mut space = MSpace::new(0, 64, 64);
        let a = space.alloc(8, 8).unwrap();
        space.free(a);
        space.free(a);
    }
}
