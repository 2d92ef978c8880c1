//! # EMBER Core Types
//!
//! Fundamental type definitions used across the entire scheduler stack.
//!
//! These types provide:
//! - Strong typing for device addresses and byte sizes
//! - Type-safe 32-bit handles that cannot be mixed between resource kinds

use core::fmt;
use core::marker::PhantomData;
use core::ops::Add;

// =============================================================================
// CONSTANTS
// =============================================================================

/// Host page size; buffer sizes and parameter payloads are measured in pages
pub const PAGE_SIZE: u64 = 4096;

/// Address/offset value meaning "not mapped"
pub const INVALID_ADDR: u64 = u64::MAX;

// =============================================================================
// DEVICE ADDRESS
// =============================================================================

/// NPU device virtual address
///
/// This is an address in the accelerator's address space. It is NOT a CPU
/// pointer and cannot be dereferenced.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct DevAddr(u64);

impl DevAddr {
    /// Create a new device address
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Get the raw u64 value
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Offset by bytes
    #[inline]
    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0.wrapping_add(bytes))
    }
}

impl Add<u64> for DevAddr {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0.wrapping_add(rhs))
    }
}

impl fmt::Debug for DevAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DevAddr(0x{:016x})", self.0)
    }
}

impl fmt::Display for DevAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

// =============================================================================
// SIZE TYPES
// =============================================================================

/// Size in bytes
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct ByteSize(u64);

impl ByteSize {
    /// Zero size
    pub const ZERO: Self = Self(0);
    /// One page
    pub const PAGE: Self = Self(PAGE_SIZE);

    /// Create from bytes
    #[inline]
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    /// Get as bytes
    #[inline]
    pub const fn as_bytes(self) -> u64 {
        self.0
    }

    /// Align up; `None` on overflow
    #[inline]
    pub const fn checked_align_up(self, alignment: u64) -> Option<Self> {
        let mask = alignment - 1;
        match self.0.checked_add(mask) {
            Some(v) => Some(Self(v & !mask)),
            None => None,
        }
    }

    /// Round up to whole pages; `None` on overflow
    #[inline]
    pub const fn page_aligned(self) -> Option<Self> {
        self.checked_align_up(PAGE_SIZE)
    }
}

impl fmt::Debug for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 1024 * 1024 {
            write!(f, "{} MiB", self.0 / (1024 * 1024))
        } else if self.0 >= 1024 {
            write!(f, "{} KiB", self.0 / 1024)
        } else {
            write!(f, "{} B", self.0)
        }
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// =============================================================================
// HANDLE TYPES
// =============================================================================

/// Opaque 32-bit handle to a scheduler resource
///
/// Handles are type-safe wrappers that prevent mixing resource kinds. Zero is
/// the invalid handle for every kind; live handles are minted by
/// [`HandleArena`](crate::arena::HandleArena) and are never zero.
#[repr(transparent)]
pub struct Handle<T> {
    raw: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    /// The invalid/unset handle
    pub const INVALID: Self = Self::from_raw(0);

    /// Rebuild a handle from its ABI value
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    /// ABI value
    #[inline]
    pub const fn raw(self) -> u32 {
        self.raw
    }

    /// Check if this is the invalid handle
    #[inline]
    pub const fn is_invalid(self) -> bool {
        self.raw == 0
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<T> Eq for Handle<T> {}

impl<T> PartialOrd for Handle<T> {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Handle<T> {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.raw.cmp(&other.raw)
    }
}

impl<T> core::hash::Hash for Handle<T> {
    fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl<T> Default for Handle<T> {
    fn default() -> Self {
        Self::INVALID
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = core::any::type_name::<T>();
        let short = name.rsplit("::").next().unwrap_or(name);
        write!(f, "Handle<{}>(0x{:08x})", short, self.raw)
    }
}

impl<T> fmt::Display for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

// Marker types for handles
/// Marker for hardware context handles
#[derive(Debug)]
pub enum ContextMarker {}
/// Marker for buffer object handles
#[derive(Debug)]
pub enum BufferMarker {}
/// Marker for completion timeline handles
#[derive(Debug)]
pub enum TimelineMarker {}

/// Handle to a hardware context
pub type ContextHandle = Handle<ContextMarker>;
/// Handle to a buffer object
pub type BoHandle = Handle<BufferMarker>;
/// Handle to a completion timeline (fence)
pub type TimelineHandle = Handle<TimelineMarker>;

// =============================================================================
// STATIC ASSERTIONS
// =============================================================================

static_assertions::assert_impl_all!(DevAddr: Send, Sync, Copy);
static_assertions::assert_impl_all!(ByteSize: Send, Sync, Copy);
static_assertions::assert_impl_all!(ContextHandle: Send, Sync, Copy);
static_assertions::const_assert_eq!(core::mem::size_of::<BoHandle>(), 4);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_alignment() {
        assert_eq!(ByteSize::from_bytes(1).page_aligned(), Some(ByteSize::PAGE));
        assert_eq!(ByteSize::PAGE.page_aligned(), Some(ByteSize::PAGE));
        assert_eq!(ByteSize::from_bytes(u64::MAX).page_aligned(), None);
    }

    #[test]
    fn test_handle_invalid() {
        assert!(ContextHandle::INVALID.is_invalid());
        assert!(ContextHandle::default().is_invalid());
        assert!(!BoHandle::from_raw(7).is_invalid());
        assert_eq!(BoHandle::from_raw(7).raw(), 7);
    }
}
