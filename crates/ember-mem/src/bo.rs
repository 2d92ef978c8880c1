//! # Buffer Objects
//!
//! Typed device buffers and their address mappings.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use ember_core::{BoHandle, ByteSize, DevAddr, Error, INVALID_ADDR, Result};

use crate::mm::MemoryManager;
use crate::range::{RangeAllocator, VaRange};

// =============================================================================
// BUFFER OBJECT TYPE
// =============================================================================

/// Buffer object type, numbered as on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum BoType {
    /// Regular buffer shared between user and device
    Share   = 1,
    /// Host memory shared to the device as a heap for `Dev` objects
    DevHeap = 2,
    /// Carved out of a `DevHeap`
    Dev     = 3,
    /// Command payload, user and driver accessible
    Cmd     = 4,
    /// Kernel DMA-only buffer
    Dma     = 5,
}

impl BoType {
    /// Decode a wire value
    pub const fn from_raw(raw: u32) -> Result<Self> {
        match raw {
            1 => Ok(Self::Share),
            2 => Ok(Self::DevHeap),
            3 => Ok(Self::Dev),
            4 => Ok(Self::Cmd),
            5 => Ok(Self::Dma),
            _ => Err(Error::InvalidArgument("unknown buffer object type")),
        }
    }

    /// Whether user space maps the object through its own mmap offset
    pub const fn has_map_offset(self) -> bool {
        matches!(self, Self::Share | Self::DevHeap | Self::Cmd)
    }

    /// Whether an external VA table may back objects of this type
    pub const fn accepts_va_table(self) -> bool {
        matches!(self, Self::Share | Self::DevHeap)
    }
}

// =============================================================================
// SYNC DIRECTION
// =============================================================================

/// Cache-coherence direction for [`BoRegistry::sync`](crate::BoRegistry::sync)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum SyncDirection {
    /// Host writes become visible to the device
    ToDevice   = 0,
    /// Device writes become visible to the host
    FromDevice = 1,
}

impl SyncDirection {
    /// Decode a wire value
    pub const fn from_raw(raw: u32) -> Result<Self> {
        match raw {
            0 => Ok(Self::ToDevice),
            1 => Ok(Self::FromDevice),
            _ => Err(Error::InvalidArgument("unknown sync direction")),
        }
    }
}

// =============================================================================
// DESCRIPTORS
// =============================================================================

/// One entry of an externally pinned virtual-address table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VaEntry {
    /// Host virtual address
    pub vaddr: u64,
    /// Length in bytes
    pub len: u64,
}

/// Buffer object creation request
#[derive(Debug, Clone, Copy)]
pub struct BoDesc<'a> {
    /// Object type
    pub kind: BoType,
    /// Requested size in bytes (rounded up to a page)
    pub size: u64,
    /// Scatter list of pinned user memory (`Share`/`DevHeap` only)
    pub va_table: Option<&'a [VaEntry]>,
    /// Owning heap (`Dev` only)
    pub heap: BoHandle,
}

impl<'a> BoDesc<'a> {
    /// Anonymous object of `kind`
    pub const fn new(kind: BoType, size: u64) -> Self {
        Self {
            kind,
            size,
            va_table: None,
            heap: BoHandle::INVALID,
        }
    }

    /// `Dev` object carved from `heap`
    pub const fn dev(heap: BoHandle, size: u64) -> Self {
        Self {
            kind: BoType::Dev,
            size,
            va_table: None,
            heap,
        }
    }

    /// Back the object with pinned user memory
    pub const fn with_va_table(mut self, table: &'a [VaEntry]) -> Self {
        self.va_table = Some(table);
        self
    }
}

/// Mapping information returned by `info`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoInfo {
    /// Offset to pass to mmap, [`INVALID_ADDR`] when not mappable
    pub map_offset: u64,
    /// Host virtual address, [`INVALID_ADDR`] when unknown
    pub vaddr: u64,
    /// Device virtual address
    pub device_addr: DevAddr,
}

// =============================================================================
// PLACEMENT
// =============================================================================

/// Where an object's device range came from
pub(crate) enum Placement {
    /// Device VA space shared by the registry
    Space {
        space: Arc<spin::Mutex<RangeAllocator>>,
        range: VaRange,
    },
    /// Carved out of a heap object, which stays alive with us
    Heap {
        parent: Arc<BufferObject>,
        range: VaRange,
    },
}

/// Pinned user pages released when the object dies
pub(crate) struct Pinned {
    pub(crate) mm: Arc<dyn MemoryManager>,
    pub(crate) entries: Vec<VaEntry>,
}

// =============================================================================
// BUFFER OBJECT
// =============================================================================

/// A registered buffer object
pub struct BufferObject {
    kind: BoType,
    size: ByteSize,
    vaddr: Option<u64>,
    map_offset: u64,
    placement: Placement,
    pinned: Option<Pinned>,
    /// Carve-out for `Dev` children (heaps only)
    carve: Option<spin::Mutex<RangeAllocator>>,
    /// Context bindings and in-flight commands using the object
    users: AtomicU32,
}

impl BufferObject {
    pub(crate) fn new(
        kind: BoType,
        size: ByteSize,
        vaddr: Option<u64>,
        map_offset: u64,
        placement: Placement,
        pinned: Option<Pinned>,
    ) -> Self {
        let carve = match (kind, &placement) {
            (BoType::DevHeap, Placement::Space { range, .. }) => {
                Some(spin::Mutex::new(RangeAllocator::new(*range)))
            },
            _ => None,
        };

        Self {
            kind,
            size,
            vaddr,
            map_offset,
            placement,
            pinned,
            carve,
            users: AtomicU32::new(0),
        }
    }

    /// Object type
    pub fn kind(&self) -> BoType {
        self.kind
    }

    /// Size (page aligned)
    pub fn size(&self) -> ByteSize {
        self.size
    }

    /// Device virtual address
    pub fn dev_addr(&self) -> DevAddr {
        match &self.placement {
            Placement::Space { range, .. } | Placement::Heap { range, .. } => range.start,
        }
    }

    /// Host virtual address, when known
    pub fn vaddr(&self) -> Option<u64> {
        self.vaddr
    }

    /// Mapping information
    pub fn info(&self) -> BoInfo {
        BoInfo {
            map_offset: self.map_offset,
            vaddr: self.vaddr.unwrap_or(INVALID_ADDR),
            device_addr: self.dev_addr(),
        }
    }

    /// Owning heap of a `Dev` object
    pub fn parent(&self) -> Option<&Arc<BufferObject>> {
        match &self.placement {
            Placement::Heap { parent, .. } => Some(parent),
            Placement::Space { .. } => None,
        }
    }

    /// Bytes carved out of this heap, zero for non-heaps
    pub fn heap_usage(&self) -> ByteSize {
        self.carve
            .as_ref()
            .map(|carve| carve.lock().allocated())
            .unwrap_or(ByteSize::ZERO)
    }

    /// Current use count
    pub fn users(&self) -> u32 {
        self.users.load(Ordering::Acquire)
    }

    /// Bytes of pinned user memory backing the object
    pub fn pinned_bytes(&self) -> u64 {
        self.pinned
            .as_ref()
            .map(|p| p.entries.iter().map(|e| e.len).sum())
            .unwrap_or(0)
    }

    /// Carve a child range out of this heap
    pub(crate) fn carve(&self, size: ByteSize) -> Result<VaRange> {
        let carve = self
            .carve
            .as_ref()
            .ok_or(Error::InvalidArgument("buffer object is not a DevHeap"))?;
        carve.lock().allocate(size, 0)
    }

    /// Take a use; heaps see the uses of their children
    pub(crate) fn acquire(&self) {
        self.users.fetch_add(1, Ordering::AcqRel);
        if let Some(parent) = self.parent() {
            parent.acquire();
        }
    }

    /// Drop a use taken by [`acquire`](Self::acquire)
    pub(crate) fn release(&self) {
        let prev = self.users.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "buffer object use count underflow");
        if let Some(parent) = self.parent() {
            parent.release();
        }
    }
}

impl Drop for BufferObject {
    fn drop(&mut self) {
        let result = match &self.placement {
            Placement::Space { space, range } => space.lock().free(*range),
            Placement::Heap { parent, range } => match &parent.carve {
                Some(carve) => carve.lock().free(*range),
                None => Ok(()),
            },
        };
        if let Err(err) = result {
            log::error!("buffer object range release failed: {err}");
        }

        if let Some(pinned) = self.pinned.take() {
            pinned.mm.unpin(&pinned.entries);
        }
    }
}

impl fmt::Debug for BufferObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferObject")
            .field("kind", &self.kind)
            .field("size", &self.size)
            .field("dev_addr", &self.dev_addr())
            .field("vaddr", &self.vaddr)
            .field("map_offset", &self.map_offset)
            .field("users", &self.users())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_from_raw() {
        assert_eq!(BoType::from_raw(3), Ok(BoType::Dev));
        assert!(BoType::from_raw(0).is_err());
        assert!(BoType::from_raw(6).is_err());
    }

    #[test]
    fn test_map_offsets_only_for_user_mapped_types() {
        assert!(BoType::Share.has_map_offset());
        assert!(BoType::Cmd.has_map_offset());
        assert!(!BoType::Dev.has_map_offset());
        assert!(!BoType::Dma.has_map_offset());
    }

    #[test]
    fn test_sync_direction() {
        assert_eq!(SyncDirection::from_raw(1), Ok(SyncDirection::FromDevice));
        assert!(SyncDirection::from_raw(2).is_err());
    }
}
