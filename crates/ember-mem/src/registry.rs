//! # Buffer Object Registry
//!
//! Owns every buffer object of a device and hands out generation-checked
//! handles to them.
//!
//! ```text
//!   create ──► pin (VA table) ──► place ──► arena.insert ──► BoHandle
//!                                   │
//!                 ┌─────────────────┴──────────────────┐
//!                 ▼                                    ▼
//!        device VA space                       parent DevHeap
//!   (Share, DevHeap, Cmd, Dma)                      (Dev)
//! ```
//!
//! Destruction removes the handle only. The object itself, and with it the
//! address range and the pinned pages, goes away when the last `Arc` drops:
//! a `Dev` child keeps its heap alive, and a [`BoRef`] keeps its target alive.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ember_core::{
    BoHandle, BufferMarker, ByteSize, DevAddr, Error, HandleArena, INVALID_ADDR, PAGE_SIZE,
    Result,
};

use crate::bo::{BoDesc, BoInfo, BoType, BufferObject, Pinned, Placement, SyncDirection};
use crate::mm::{MemoryManager, SyncRegion};
use crate::range::{RangeAllocator, VaRange};

/// First mmap offset handed out; offsets below it are never valid
const MAP_OFFSET_BASE: u64 = 0x1_0000_0000;

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Registry configuration
#[derive(Debug, Clone, Copy)]
pub struct RegistryConfig {
    /// Base of the device virtual address space
    pub va_base: u64,
    /// Size of the device virtual address space
    pub va_size: u64,
    /// Maximum live buffer objects
    pub max_objects: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            va_base: 0x1_0000_0000,
            va_size: 0x1_0000_0000,
            max_objects: 4096,
        }
    }
}

// =============================================================================
// STATISTICS
// =============================================================================

/// Registry statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Live objects
    pub live: u64,
    /// Live bytes, indexed by `BoType as usize - 1`
    pub bytes: [u64; 5],
    /// Objects ever created
    pub created: u64,
    /// Objects ever destroyed
    pub destroyed: u64,
}

impl RegistryStats {
    /// Live bytes of one type
    pub fn bytes_of(&self, kind: BoType) -> u64 {
        self.bytes[kind as usize - 1]
    }
}

// =============================================================================
// BUFFER OBJECT REFERENCE
// =============================================================================

/// A counted use of a buffer object
///
/// Held by contexts (heap, log and CU bindings) and by in-flight commands.
/// While any `BoRef` exists the object, and the heap of a `Dev` object,
/// refuses destruction.
pub struct BoRef {
    handle: BoHandle,
    object: Arc<BufferObject>,
}

impl BoRef {
    fn new(handle: BoHandle, object: Arc<BufferObject>) -> Self {
        object.acquire();
        Self { handle, object }
    }

    /// Handle the reference was taken through
    pub fn handle(&self) -> BoHandle {
        self.handle
    }

    /// Referenced object
    pub fn object(&self) -> &Arc<BufferObject> {
        &self.object
    }

    /// Object type
    pub fn kind(&self) -> BoType {
        self.object.kind()
    }

    /// Device address of the object
    pub fn dev_addr(&self) -> DevAddr {
        self.object.dev_addr()
    }
}

impl Clone for BoRef {
    fn clone(&self) -> Self {
        Self::new(self.handle, self.object.clone())
    }
}

impl Drop for BoRef {
    fn drop(&mut self) {
        self.object.release();
    }
}

impl fmt::Debug for BoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoRef")
            .field("handle", &self.handle)
            .field("kind", &self.object.kind())
            .finish()
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

/// Buffer object registry
pub struct BoRegistry {
    objects: spin::RwLock<HandleArena<BufferMarker, Arc<BufferObject>>>,
    space: Arc<spin::Mutex<RangeAllocator>>,
    mm: Arc<dyn MemoryManager>,
    next_map_offset: AtomicU64,
    stats: spin::Mutex<RegistryStats>,
}

impl BoRegistry {
    /// Create a registry over the configured device VA space
    pub fn new(config: &RegistryConfig, mm: Arc<dyn MemoryManager>) -> Self {
        let range = VaRange::new(
            DevAddr::new(config.va_base),
            ByteSize::from_bytes(config.va_size),
        );
        Self {
            objects: spin::RwLock::new(HandleArena::with_limit(config.max_objects)),
            space: Arc::new(spin::Mutex::new(RangeAllocator::new(range))),
            mm,
            next_map_offset: AtomicU64::new(MAP_OFFSET_BASE),
            stats: spin::Mutex::new(RegistryStats::default()),
        }
    }

    /// Create a buffer object
    pub fn create(&self, desc: &BoDesc<'_>) -> Result<BoHandle> {
        if desc.size == 0 {
            return Err(Error::InvalidArgument("zero-sized buffer object"));
        }
        let size = ByteSize::from_bytes(desc.size)
            .page_aligned()
            .ok_or(Error::InvalidArgument("buffer object size overflow"))?;

        let pinned = match desc.va_table {
            Some(table) => Some(self.pin_table(desc, table)?),
            None => None,
        };
        let vaddr = pinned
            .as_ref()
            .and_then(|p| p.entries.first())
            .map(|e| e.vaddr);

        // Not yet owned by an object, so unpin by hand on failure
        let placement = match self.place(desc, size) {
            Ok(placement) => placement,
            Err(err) => {
                if let Some(pinned) = pinned {
                    pinned.mm.unpin(&pinned.entries);
                }
                return Err(err);
            },
        };

        let map_offset = if desc.kind.has_map_offset() {
            self.next_map_offset.fetch_add(size.as_bytes(), Ordering::Relaxed)
        } else {
            INVALID_ADDR
        };

        let object = Arc::new(BufferObject::new(
            desc.kind, size, vaddr, map_offset, placement, pinned,
        ));
        let dev_addr = object.dev_addr();

        let handle = self.objects.write().insert(object)?;

        let mut stats = self.stats.lock();
        stats.live += 1;
        stats.created += 1;
        stats.bytes[desc.kind as usize - 1] += size.as_bytes();
        drop(stats);

        log::debug!(
            "bo {} created: {:?} {} at {}",
            handle,
            desc.kind,
            size,
            dev_addr
        );
        Ok(handle)
    }

    fn pin_table(&self, desc: &BoDesc<'_>, table: &[crate::bo::VaEntry]) -> Result<Pinned> {
        if !desc.kind.accepts_va_table() {
            return Err(Error::InvalidArgument("VA table not accepted for this type"));
        }
        if table.is_empty() {
            return Err(Error::InvalidArgument("empty VA table"));
        }
        let total = table
            .iter()
            .try_fold(0u64, |acc, e| acc.checked_add(e.len))
            .ok_or(Error::InvalidArgument("VA table length overflow"))?;
        if total != desc.size {
            return Err(Error::InvalidArgument("VA table length differs from size"));
        }

        self.mm.pin(table)?;
        Ok(Pinned {
            mm: self.mm.clone(),
            entries: table.to_vec(),
        })
    }

    fn place(&self, desc: &BoDesc<'_>, size: ByteSize) -> Result<Placement> {
        if desc.kind != BoType::Dev {
            let range = self.space.lock().allocate(size, PAGE_SIZE)?;
            return Ok(Placement::Space {
                space: self.space.clone(),
                range,
            });
        }

        let parent = self
            .objects
            .read()
            .get(desc.heap)
            .cloned()
            .ok_or(Error::InvalidArgument("heap handle is not live"))?;
        if parent.kind() != BoType::DevHeap {
            return Err(Error::InvalidArgument("heap handle is not a DevHeap"));
        }
        let range = parent.carve(size)?;
        Ok(Placement::Heap { parent, range })
    }

    /// Resolve a handle
    pub fn get(&self, handle: BoHandle) -> Result<Arc<BufferObject>> {
        self.objects
            .read()
            .get(handle)
            .cloned()
            .ok_or(Error::InvalidHandle)
    }

    /// Mapping information of an object
    pub fn info(&self, handle: BoHandle) -> Result<BoInfo> {
        self.objects
            .read()
            .get(handle)
            .map(|object| object.info())
            .ok_or(Error::InvalidHandle)
    }

    /// Cache-coherence boundary for `[offset, offset + size)`
    ///
    /// A `size` of zero extends the region to the end of the object.
    pub fn sync(
        &self,
        handle: BoHandle,
        direction: SyncDirection,
        offset: u64,
        size: u64,
    ) -> Result<()> {
        let object = self.get(handle)?;
        let object_size = object.size().as_bytes();

        if offset >= object_size {
            return Err(Error::InvalidArgument("sync offset beyond object"));
        }
        let end = if size == 0 {
            object_size
        } else {
            offset
                .checked_add(size)
                .ok_or(Error::InvalidArgument("sync range overflow"))?
        };
        if end > object_size {
            return Err(Error::InvalidArgument("sync range beyond object"));
        }

        let region = SyncRegion {
            dev_addr: object.dev_addr().offset(offset),
            vaddr: object.vaddr().map(|v| v + offset),
            len: end - offset,
        };
        self.mm.sync(region, direction)
    }

    /// Take a counted use of an object, optionally restricted to some types
    pub fn acquire(&self, handle: BoHandle, allowed: Option<&[BoType]>) -> Result<BoRef> {
        // The read lock excludes `destroy`, so a use is never taken on an
        // object whose handle is being removed.
        let objects = self.objects.read();
        let object = objects.get(handle).ok_or(Error::InvalidHandle)?;
        if let Some(allowed) = allowed {
            if !allowed.contains(&object.kind()) {
                return Err(Error::InvalidArgument("unexpected buffer object type"));
            }
        }
        Ok(BoRef::new(handle, object.clone()))
    }

    /// Destroy an object's handle
    ///
    /// Fails with `InvalidState` while the object (or, for a heap, any of its
    /// `Dev` children) is in use.
    pub fn destroy(&self, handle: BoHandle) -> Result<()> {
        let object = {
            let mut objects = self.objects.write();
            let object = objects.get(handle).ok_or(Error::InvalidHandle)?;
            if object.users() > 0 {
                return Err(Error::InvalidState("buffer object is in use"));
            }
            objects.remove(handle).ok_or(Error::InvalidHandle)?
        };

        let mut stats = self.stats.lock();
        stats.live -= 1;
        stats.destroyed += 1;
        stats.bytes[object.kind() as usize - 1] -= object.size().as_bytes();
        drop(stats);

        log::debug!("bo {} destroyed", handle);
        Ok(())
    }

    /// Snapshot of the statistics
    pub fn stats(&self) -> RegistryStats {
        *self.stats.lock()
    }

    /// Number of live handles
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    /// Check if no handles are live
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Free bytes left in the device VA space
    pub fn free_space(&self) -> ByteSize {
        self.space.lock().free_space()
    }
}

impl fmt::Debug for BoRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoRegistry")
            .field("objects", &self.len())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bo::VaEntry;
    use crate::mm::HostMemory;

    fn registry() -> (BoRegistry, Arc<HostMemory>) {
        let mm = Arc::new(HostMemory::new());
        let config = RegistryConfig {
            va_base: 0x10_0000,
            va_size: 64 * PAGE_SIZE,
            max_objects: 16,
        };
        (BoRegistry::new(&config, mm.clone()), mm)
    }

    #[test]
    fn test_sizes_round_up_to_pages() {
        let (reg, _) = registry();
        let h = reg.create(&BoDesc::new(BoType::Cmd, 100)).unwrap();
        assert_eq!(reg.get(h).unwrap().size(), ByteSize::PAGE);
        assert_eq!(reg.stats().bytes_of(BoType::Cmd), PAGE_SIZE);
    }

    #[test]
    fn test_zero_size_rejected() {
        let (reg, _) = registry();
        assert!(matches!(
            reg.create(&BoDesc::new(BoType::Share, 0)),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_map_offset_invalid_for_dev_and_dma() {
        let (reg, _) = registry();
        let heap = reg.create(&BoDesc::new(BoType::DevHeap, 4 * PAGE_SIZE)).unwrap();
        let dev = reg.create(&BoDesc::dev(heap, PAGE_SIZE)).unwrap();
        let dma = reg.create(&BoDesc::new(BoType::Dma, PAGE_SIZE)).unwrap();
        let share = reg.create(&BoDesc::new(BoType::Share, PAGE_SIZE)).unwrap();

        assert_eq!(reg.info(dev).unwrap().map_offset, INVALID_ADDR);
        assert_eq!(reg.info(dma).unwrap().map_offset, INVALID_ADDR);
        assert_ne!(reg.info(share).unwrap().map_offset, INVALID_ADDR);
        assert_eq!(reg.info(share).unwrap().vaddr, INVALID_ADDR);
    }

    #[test]
    fn test_dev_carved_inside_heap() {
        let (reg, _) = registry();
        let heap = reg.create(&BoDesc::new(BoType::DevHeap, 4 * PAGE_SIZE)).unwrap();
        let a = reg.create(&BoDesc::dev(heap, PAGE_SIZE)).unwrap();
        let b = reg.create(&BoDesc::dev(heap, PAGE_SIZE)).unwrap();

        let heap_obj = reg.get(heap).unwrap();
        let heap_range = VaRange::new(heap_obj.dev_addr(), heap_obj.size());
        let a_addr = reg.info(a).unwrap().device_addr;
        let b_addr = reg.info(b).unwrap().device_addr;
        assert!(heap_range.contains(a_addr));
        assert!(heap_range.contains(b_addr));
        assert_ne!(a_addr, b_addr);
        assert_eq!(heap_obj.heap_usage(), ByteSize::from_bytes(2 * PAGE_SIZE));
    }

    #[test]
    fn test_dev_requires_live_heap() {
        let (reg, _) = registry();
        let share = reg.create(&BoDesc::new(BoType::Share, PAGE_SIZE)).unwrap();
        assert!(matches!(
            reg.create(&BoDesc::dev(share, PAGE_SIZE)),
            Err(Error::InvalidArgument(_))
        ));

        let heap = reg.create(&BoDesc::new(BoType::DevHeap, PAGE_SIZE)).unwrap();
        reg.destroy(heap).unwrap();
        assert!(matches!(
            reg.create(&BoDesc::dev(heap, PAGE_SIZE)),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_heap_exhaustion() {
        let (reg, _) = registry();
        let heap = reg.create(&BoDesc::new(BoType::DevHeap, PAGE_SIZE)).unwrap();
        reg.create(&BoDesc::dev(heap, PAGE_SIZE)).unwrap();
        assert_eq!(
            reg.create(&BoDesc::dev(heap, PAGE_SIZE)),
            Err(Error::ResourceExhausted(ember_core::Resource::Memory))
        );
    }

    #[test]
    fn test_destroy_in_use_fails() {
        let (reg, _) = registry();
        let h = reg.create(&BoDesc::new(BoType::Cmd, PAGE_SIZE)).unwrap();
        let use_ref = reg.acquire(h, Some(&[BoType::Cmd])).unwrap();
        assert!(matches!(reg.destroy(h), Err(Error::InvalidState(_))));
        drop(use_ref);
        reg.destroy(h).unwrap();
        assert_eq!(reg.info(h), Err(Error::InvalidHandle));
    }

    #[test]
    fn test_heap_with_bound_child_cannot_be_destroyed() {
        let (reg, _) = registry();
        let heap = reg.create(&BoDesc::new(BoType::DevHeap, 2 * PAGE_SIZE)).unwrap();
        let dev = reg.create(&BoDesc::dev(heap, PAGE_SIZE)).unwrap();
        let bound = reg.acquire(dev, None).unwrap();
        assert_eq!(reg.get(heap).unwrap().users(), 1);
        assert!(matches!(reg.destroy(heap), Err(Error::InvalidState(_))));
        drop(bound);
        reg.destroy(heap).unwrap();
    }

    #[test]
    fn test_heap_range_released_by_last_child() {
        let (reg, _) = registry();
        let before = reg.free_space();
        let heap = reg.create(&BoDesc::new(BoType::DevHeap, 4 * PAGE_SIZE)).unwrap();
        let dev = reg.create(&BoDesc::dev(heap, PAGE_SIZE)).unwrap();

        reg.destroy(heap).unwrap();
        assert_eq!(reg.free_space().as_bytes(), before.as_bytes() - 4 * PAGE_SIZE);
        assert!(reg.info(dev).is_ok());

        reg.destroy(dev).unwrap();
        assert_eq!(reg.free_space(), before);
    }

    #[test]
    fn test_acquire_type_filter() {
        let (reg, _) = registry();
        let h = reg.create(&BoDesc::new(BoType::Share, PAGE_SIZE)).unwrap();
        assert!(matches!(
            reg.acquire(h, Some(&[BoType::Cmd])),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(reg.get(h).unwrap().users(), 0);
        assert!(matches!(
            reg.acquire(BoHandle::INVALID, None),
            Err(Error::InvalidHandle)
        ));
    }

    #[test]
    fn test_va_table_rules() {
        let (reg, mm) = registry();
        let table = [
            VaEntry { vaddr: 0x7f00_0000, len: PAGE_SIZE },
            VaEntry { vaddr: 0x7f10_0000, len: PAGE_SIZE },
        ];

        let bad_len = BoDesc::new(BoType::Share, 3 * PAGE_SIZE).with_va_table(&table);
        assert!(matches!(reg.create(&bad_len), Err(Error::InvalidArgument(_))));

        let bad_kind = BoDesc::new(BoType::Cmd, 2 * PAGE_SIZE).with_va_table(&table);
        assert!(matches!(reg.create(&bad_kind), Err(Error::InvalidArgument(_))));
        assert_eq!(mm.pinned_bytes(), 0);

        let good = BoDesc::new(BoType::Share, 2 * PAGE_SIZE).with_va_table(&table);
        let h = reg.create(&good).unwrap();
        assert_eq!(reg.info(h).unwrap().vaddr, 0x7f00_0000);
        assert_eq!(mm.pinned_bytes(), 2 * PAGE_SIZE);

        reg.destroy(h).unwrap();
        assert_eq!(mm.pinned_bytes(), 0);
    }

    #[test]
    fn test_sync_bounds() {
        let (reg, mm) = registry();
        let h = reg.create(&BoDesc::new(BoType::Share, 2 * PAGE_SIZE)).unwrap();

        reg.sync(h, SyncDirection::ToDevice, 0, 0).unwrap();
        reg.sync(h, SyncDirection::ToDevice, PAGE_SIZE, PAGE_SIZE).unwrap();
        assert_eq!(mm.sync_count(SyncDirection::ToDevice), 2);

        assert!(reg.sync(h, SyncDirection::FromDevice, PAGE_SIZE, 2 * PAGE_SIZE).is_err());
        assert!(reg.sync(h, SyncDirection::FromDevice, 2 * PAGE_SIZE, 0).is_err());
        assert!(reg.sync(h, SyncDirection::FromDevice, 1, u64::MAX).is_err());
        assert_eq!(
            reg.sync(BoHandle::from_raw(99), SyncDirection::ToDevice, 0, 0),
            Err(Error::InvalidHandle)
        );
    }

    #[test]
    fn test_stats_track_lifecycle() {
        let (reg, _) = registry();
        let a = reg.create(&BoDesc::new(BoType::Share, PAGE_SIZE)).unwrap();
        reg.create(&BoDesc::new(BoType::Dma, PAGE_SIZE)).unwrap();
        reg.destroy(a).unwrap();

        let stats = reg.stats();
        assert_eq!(stats.live, 1);
        assert_eq!(stats.created, 2);
        assert_eq!(stats.destroyed, 1);
        assert_eq!(stats.bytes_of(BoType::Share), 0);
        assert_eq!(stats.bytes_of(BoType::Dma), PAGE_SIZE);
    }
}
