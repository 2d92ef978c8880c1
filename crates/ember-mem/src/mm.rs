//! # Memory Manager Collaborator
//!
//! Pinning of user memory and cache maintenance are owned by the host
//! kernel, not by the registry. The registry only records mappings and asks
//! a [`MemoryManager`] to do the actual work.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use ember_core::{DevAddr, Error, Result};
#[cfg(feature = "strict-pinning")]
use ember_core::PAGE_SIZE;

use crate::bo::{SyncDirection, VaEntry};

// =============================================================================
// SYNC REGION
// =============================================================================

/// Sub-range of a buffer object passed to [`MemoryManager::sync`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncRegion {
    /// Device address of the first byte
    pub dev_addr: DevAddr,
    /// Host address of the first byte, when the object has one
    pub vaddr: Option<u64>,
    /// Length in bytes
    pub len: u64,
}

// =============================================================================
// MEMORY MANAGER TRAIT
// =============================================================================

/// Host memory-management collaborator
///
/// Implementations must be callable from any thread and must not call back
/// into the registry.
pub trait MemoryManager: Send + Sync + fmt::Debug {
    /// Pin every page of a user VA table
    fn pin(&self, entries: &[VaEntry]) -> Result<()>;

    /// Release pages pinned by [`pin`](Self::pin)
    fn unpin(&self, entries: &[VaEntry]);

    /// Make a sub-range coherent in the given direction
    fn sync(&self, region: SyncRegion, direction: SyncDirection) -> Result<()>;
}

#[cfg(feature = "strict-pinning")]
fn check_alignment(entry: &VaEntry) -> Result<()> {
    if entry.vaddr % PAGE_SIZE != 0 {
        return Err(Error::InvalidArgument("VA table entry not page aligned"));
    }
    Ok(())
}

#[cfg(not(feature = "strict-pinning"))]
fn check_alignment(_entry: &VaEntry) -> Result<()> {
    Ok(())
}

// =============================================================================
// HOST MEMORY
// =============================================================================

/// In-process memory manager
///
/// Validates requests and keeps counters; there is no real page table
/// behind it.
#[derive(Debug, Default)]
pub struct HostMemory {
    pinned_bytes: AtomicU64,
    pin_calls: AtomicU64,
    syncs_to_device: AtomicU64,
    syncs_from_device: AtomicU64,
}

impl HostMemory {
    /// Create a new host memory manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes currently pinned
    pub fn pinned_bytes(&self) -> u64 {
        self.pinned_bytes.load(Ordering::Acquire)
    }

    /// Number of successful pin calls
    pub fn pin_calls(&self) -> u64 {
        self.pin_calls.load(Ordering::Relaxed)
    }

    /// Number of sync operations performed per direction
    pub fn sync_count(&self, direction: SyncDirection) -> u64 {
        match direction {
            SyncDirection::ToDevice => self.syncs_to_device.load(Ordering::Relaxed),
            SyncDirection::FromDevice => self.syncs_from_device.load(Ordering::Relaxed),
        }
    }
}

impl MemoryManager for HostMemory {
    fn pin(&self, entries: &[VaEntry]) -> Result<()> {
        let mut total = 0u64;
        for entry in entries {
            if entry.vaddr == 0 || entry.len == 0 {
                return Err(Error::InvalidArgument("empty VA table entry"));
            }
            check_alignment(entry)?;
            total = total
                .checked_add(entry.len)
                .ok_or(Error::InvalidArgument("VA table length overflow"))?;
        }

        self.pinned_bytes.fetch_add(total, Ordering::AcqRel);
        self.pin_calls.fetch_add(1, Ordering::Relaxed);
        log::trace!("pinned {} entries ({} bytes)", entries.len(), total);
        Ok(())
    }

    fn unpin(&self, entries: &[VaEntry]) {
        let total: u64 = entries.iter().map(|e| e.len).sum();
        self.pinned_bytes.fetch_sub(total, Ordering::AcqRel);
    }

    fn sync(&self, region: SyncRegion, direction: SyncDirection) -> Result<()> {
        if region.len == 0 {
            return Err(Error::InvalidArgument("empty sync region"));
        }
        let counter = match direction {
            SyncDirection::ToDevice => &self.syncs_to_device,
            SyncDirection::FromDevice => &self.syncs_from_device,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        log::trace!("sync {:?} {} +{}", direction, region.dev_addr, region.len);
        Ok(())
    }
}
