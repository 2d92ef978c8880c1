//! # Device Range Allocation
//!
//! First-fit allocator over a contiguous device address range. Backs both
//! the device VA space and every `DevHeap` carve-out.
//!
//! Allocations never move: an address handed out stays valid until the
//! range is freed.

use ember_core::{ByteSize, DevAddr, Error, PAGE_SIZE, Resource, Result};

// =============================================================================
// VIRTUAL ADDRESS RANGE
// =============================================================================

/// A range in device address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VaRange {
    /// Start address
    pub start: DevAddr,
    /// End address (exclusive)
    pub end: DevAddr,
}

impl VaRange {
    /// Create a new range
    pub const fn new(start: DevAddr, size: ByteSize) -> Self {
        Self {
            start,
            end: DevAddr::new(start.raw() + size.as_bytes()),
        }
    }

    /// Get range size
    pub fn size(&self) -> ByteSize {
        ByteSize::from_bytes(self.end.raw() - self.start.raw())
    }

    /// Check if address is in range
    pub fn contains(&self, addr: DevAddr) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Check if ranges overlap
    pub fn overlaps(&self, other: &VaRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

// =============================================================================
// BLOCK
// =============================================================================

#[derive(Debug, Clone)]
struct Block {
    range: VaRange,
    free: bool,
}

// =============================================================================
// RANGE ALLOCATOR
// =============================================================================

/// First-fit allocator with neighbour coalescing
#[derive(Debug)]
pub struct RangeAllocator {
    /// Managed range
    range: VaRange,
    /// Blocks in address order, covering `range` exactly
    blocks: Vec<Block>,
    /// Bytes currently handed out
    allocated: u64,
}

impl RangeAllocator {
    /// Create an allocator managing `range`
    pub fn new(range: VaRange) -> Self {
        Self {
            range,
            blocks: vec![Block { range, free: true }],
            allocated: 0,
        }
    }

    /// Allocate `size` bytes aligned to `alignment` (at least one page)
    pub fn allocate(&mut self, size: ByteSize, alignment: u64) -> Result<VaRange> {
        if size.as_bytes() == 0 {
            return Err(Error::InvalidArgument("zero-sized range"));
        }
        let size = size.as_bytes();
        let alignment = alignment.max(PAGE_SIZE);
        if !alignment.is_power_of_two() {
            return Err(Error::InvalidArgument("alignment is not a power of two"));
        }

        for i in 0..self.blocks.len() {
            if !self.blocks[i].free {
                continue;
            }

            let block_start = self.blocks[i].range.start.raw();
            let block_end = self.blocks[i].range.end.raw();

            let Some(aligned_start) = block_start
                .checked_add(alignment - 1)
                .map(|v| v & !(alignment - 1))
            else {
                continue;
            };
            let Some(aligned_end) = aligned_start.checked_add(size) else {
                continue;
            };

            if aligned_end <= block_end {
                let alloc_range = VaRange {
                    start: DevAddr::new(aligned_start),
                    end: DevAddr::new(aligned_end),
                };
                self.split_block(i, alloc_range);
                self.allocated += size;
                return Ok(alloc_range);
            }
        }

        Err(Resource::Memory.into())
    }

    /// Split a free block around an allocation
    fn split_block(&mut self, index: usize, alloc: VaRange) {
        let block = self.blocks.remove(index);
        let mut at = index;

        if alloc.start > block.range.start {
            self.blocks.insert(at, Block {
                range: VaRange {
                    start: block.range.start,
                    end: alloc.start,
                },
                free: true,
            });
            at += 1;
        }

        self.blocks.insert(at, Block {
            range: alloc,
            free: false,
        });

        if alloc.end < block.range.end {
            self.blocks.insert(at + 1, Block {
                range: VaRange {
                    start: alloc.end,
                    end: block.range.end,
                },
                free: true,
            });
        }
    }

    /// Return a range previously handed out by [`allocate`](Self::allocate)
    pub fn free(&mut self, range: VaRange) -> Result<()> {
        let index = self
            .blocks
            .iter()
            .position(|b| b.range == range && !b.free)
            .ok_or(Error::InvalidArgument("range was not allocated here"))?;

        self.blocks[index].free = true;
        self.allocated -= range.size().as_bytes();
        self.merge_free_blocks();

        Ok(())
    }

    fn merge_free_blocks(&mut self) {
        let mut i = 0;
        while i + 1 < self.blocks.len() {
            if self.blocks[i].free && self.blocks[i + 1].free {
                self.blocks[i].range.end = self.blocks[i + 1].range.end;
                self.blocks.remove(i + 1);
            } else {
                i += 1;
            }
        }
    }

    /// Bytes handed out
    pub fn allocated(&self) -> ByteSize {
        ByteSize::from_bytes(self.allocated)
    }

    /// Bytes still free
    pub fn free_space(&self) -> ByteSize {
        ByteSize::from_bytes(self.range.size().as_bytes() - self.allocated)
    }

    /// Largest contiguous free region
    pub fn largest_free(&self) -> ByteSize {
        ByteSize::from_bytes(
            self.blocks
                .iter()
                .filter(|b| b.free)
                .map(|b| b.range.size().as_bytes())
                .max()
                .unwrap_or(0),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(pages: u64) -> RangeAllocator {
        RangeAllocator::new(VaRange::new(
            DevAddr::new(0x10_0000),
            ByteSize::from_bytes(pages * PAGE_SIZE),
        ))
    }

    #[test]
    fn test_first_fit_is_stable() {
        let mut a = allocator(4);
        let r1 = a.allocate(ByteSize::PAGE, PAGE_SIZE).unwrap();
        let r2 = a.allocate(ByteSize::PAGE, PAGE_SIZE).unwrap();
        assert_eq!(r1.start, DevAddr::new(0x10_0000));
        assert_eq!(r2.start, DevAddr::new(0x10_0000 + PAGE_SIZE));
        assert!(!r1.overlaps(&r2));

        a.free(r1).unwrap();
        let r3 = a.allocate(ByteSize::PAGE, PAGE_SIZE).unwrap();
        assert_eq!(r3, r1);
        assert_eq!(a.allocated(), ByteSize::from_bytes(2 * PAGE_SIZE));
    }

    #[test]
    fn test_exhaustion_and_coalescing() {
        let mut a = allocator(2);
        let r1 = a.allocate(ByteSize::PAGE, 0).unwrap();
        let r2 = a.allocate(ByteSize::PAGE, 0).unwrap();
        assert_eq!(
            a.allocate(ByteSize::PAGE, 0),
            Err(Error::ResourceExhausted(Resource::Memory))
        );

        a.free(r1).unwrap();
        a.free(r2).unwrap();
        assert_eq!(a.largest_free(), ByteSize::from_bytes(2 * PAGE_SIZE));
        assert!(a.allocate(ByteSize::from_bytes(2 * PAGE_SIZE), 0).is_ok());
    }

    #[test]
    fn test_double_free_rejected() {
        let mut a = allocator(2);
        let r = a.allocate(ByteSize::PAGE, 0).unwrap();
        a.free(r).unwrap();
        assert!(a.free(r).is_err());
    }

    #[test]
    fn test_zero_size_rejected() {
        let mut a = allocator(1);
        assert!(matches!(
            a.allocate(ByteSize::ZERO, 0),
            Err(Error::InvalidArgument(_))
        ));
    }
}
