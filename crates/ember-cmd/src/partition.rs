//! # Column Partitions
//!
//! Hands out contiguous AIE column ranges to hardware contexts.
//!
//! ```text
//!   col   0   1   2   3   4   5   6   7
//!        ┌───────┬───────────────┬───────┐
//!        │ ctx A │     ctx B     │ free  │     min width = 2
//!        └───────┴───────────────┴───────┘
//! ```
//!
//! Ranges start at a multiple of the minimum width and widths are rounded
//! up to it. Two contexts only share columns when time sharing is enabled
//! and no free range of the requested width exists.

use core::fmt;

use ember_core::{Error, Resource, Result};

// =============================================================================
// PARTITION
// =============================================================================

/// A contiguous range of AIE columns
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Partition {
    /// First column
    pub start_col: u32,
    /// Number of columns
    pub num_col: u32,
}

impl Partition {
    /// Create a partition
    pub const fn new(start_col: u32, num_col: u32) -> Self {
        Self { start_col, num_col }
    }

    /// One past the last column
    pub const fn end_col(&self) -> u32 {
        self.start_col + self.num_col
    }

    /// Check whether two partitions share a column
    pub const fn overlaps(&self, other: &Partition) -> bool {
        self.start_col < other.end_col() && other.start_col < self.end_col()
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cols {}..{}", self.start_col, self.end_col())
    }
}

// =============================================================================
// ALLOCATOR
// =============================================================================

#[derive(Debug)]
struct Slot {
    partition: Partition,
    users: u32,
}

/// Column allocator
#[derive(Debug)]
pub struct PartitionAllocator {
    columns: u32,
    min_width: u32,
    time_share: bool,
    slots: Vec<Slot>,
}

impl PartitionAllocator {
    /// Create an allocator over `columns` columns
    pub fn new(columns: u32, min_width: u32, time_share: bool) -> Self {
        Self {
            columns,
            min_width: min_width.max(1),
            time_share,
            slots: Vec::new(),
        }
    }

    /// Total columns
    pub fn columns(&self) -> u32 {
        self.columns
    }

    /// Allocate `width` columns (0 picks the minimum width)
    pub fn allocate(&mut self, width: u32) -> Result<Partition> {
        let width = self.normalize(width)?;

        if let Some(partition) = self.first_fit(width) {
            self.slots.push(Slot { partition, users: 1 });
            self.slots.sort_by_key(|s| s.partition.start_col);
            log::debug!("partition: allocated {partition}");
            return Ok(partition);
        }

        if self.time_share {
            if let Some(slot) = self
                .slots
                .iter_mut()
                .filter(|s| s.partition.num_col == width)
                .min_by_key(|s| s.users)
            {
                slot.users += 1;
                log::debug!(
                    "partition: sharing {} ({} users)",
                    slot.partition,
                    slot.users
                );
                return Ok(slot.partition);
            }
        }

        log::debug!("partition: no free range of {width} columns");
        Err(Resource::Columns.into())
    }

    fn normalize(&self, width: u32) -> Result<u32> {
        let width = if width == 0 { self.min_width } else { width };
        let width = width
            .checked_next_multiple_of(self.min_width)
            .ok_or(Error::InvalidArgument("partition width overflow"))?;
        if width > self.columns {
            return Err(Error::InvalidArgument("partition wider than the array"));
        }
        Ok(width)
    }

    fn first_fit(&self, width: u32) -> Option<Partition> {
        (0..=self.columns - width)
            .step_by(self.min_width as usize)
            .map(|start| Partition::new(start, width))
            .find(|candidate| !self.slots.iter().any(|s| s.partition.overlaps(candidate)))
    }

    /// Return one use of a partition
    pub fn release(&mut self, partition: Partition) -> Result<()> {
        let index = self
            .slots
            .iter()
            .position(|s| s.partition == partition)
            .ok_or(Error::InvalidArgument("partition not allocated"))?;

        let slot = &mut self.slots[index];
        slot.users -= 1;
        if slot.users == 0 {
            self.slots.remove(index);
            log::debug!("partition: released {partition}");
        }
        Ok(())
    }

    /// Contexts sharing a partition, zero if it is not allocated
    pub fn users(&self, partition: Partition) -> u32 {
        self.slots
            .iter()
            .find(|s| s.partition == partition)
            .map(|s| s.users)
            .unwrap_or(0)
    }

    /// Columns not covered by any partition
    pub fn free_columns(&self) -> u32 {
        self.columns - self.slots.iter().map(|s| s.partition.num_col).sum::<u32>()
    }

    /// Allocated partitions in column order
    pub fn partitions(&self) -> impl Iterator<Item = Partition> + '_ {
        self.slots.iter().map(|s| s.partition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_fit_at_width_multiples() {
        let mut alloc = PartitionAllocator::new(8, 2, false);
        let a = alloc.allocate(2).unwrap();
        let b = alloc.allocate(4).unwrap();
        let c = alloc.allocate(0).unwrap();
        assert_eq!(a, Partition::new(0, 2));
        assert_eq!(b, Partition::new(2, 4));
        assert_eq!(c, Partition::new(6, 2));
        assert_eq!(alloc.free_columns(), 0);
    }

    #[test]
    fn test_width_rounds_up() {
        let mut alloc = PartitionAllocator::new(8, 4, false);
        assert_eq!(alloc.allocate(1).unwrap(), Partition::new(0, 4));
    }

    #[test]
    fn test_exhaustion_is_retryable() {
        let mut alloc = PartitionAllocator::new(4, 1, false);
        let a = alloc.allocate(4).unwrap();
        let err = alloc.allocate(1).unwrap_err();
        assert_eq!(err, Error::ResourceExhausted(Resource::Columns));
        assert!(err.is_retryable());

        alloc.release(a).unwrap();
        assert!(alloc.allocate(1).is_ok());
    }

    #[test]
    fn test_too_wide_rejected() {
        let mut alloc = PartitionAllocator::new(4, 1, false);
        assert!(matches!(alloc.allocate(5), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_reuse_after_fragmentation() {
        let mut alloc = PartitionAllocator::new(6, 1, false);
        let a = alloc.allocate(2).unwrap();
        let _b = alloc.allocate(2).unwrap();
        alloc.release(a).unwrap();
        assert!(alloc.allocate(3).is_err());
        assert_eq!(alloc.allocate(2).unwrap(), Partition::new(0, 2));
        assert_eq!(alloc.allocate(2).unwrap(), Partition::new(4, 2));
    }

    #[test]
    fn test_live_partitions_never_overlap() {
        let mut alloc = PartitionAllocator::new(8, 1, false);
        let mut live = Vec::new();
        for width in [1, 3, 2, 1, 1] {
            live.push(alloc.allocate(width).unwrap());
        }
        alloc.release(live.remove(1)).unwrap();
        live.push(alloc.allocate(2).unwrap());

        for (i, a) in live.iter().enumerate() {
            for b in &live[i + 1..] {
                assert!(!a.overlaps(b), "{a} overlaps {b}");
            }
        }
    }

    #[test]
    fn test_time_share_joins_least_loaded() {
        let mut alloc = PartitionAllocator::new(4, 2, true);
        let a = alloc.allocate(2).unwrap();
        let b = alloc.allocate(2).unwrap();
        let c = alloc.allocate(2).unwrap();
        let d = alloc.allocate(2).unwrap();
        assert_eq!(c, a);
        assert_eq!(d, b);
        assert_eq!(alloc.users(a), 2);

        alloc.release(c).unwrap();
        assert_eq!(alloc.users(a), 1);
        assert!(matches!(alloc.allocate(4), Err(Error::ResourceExhausted(_))));
    }
}
