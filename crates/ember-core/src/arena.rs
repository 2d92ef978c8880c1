//! # Handle Arena
//!
//! Slot table that mints generation-checked 32-bit handles.
//!
//! ```text
//!   31          20 19                    0
//!  ┌──────────────┬───────────────────────┐
//!  │  generation  │      slot index       │
//!  │  (1..=4095)  │                       │
//!  └──────────────┴───────────────────────┘
//! ```
//!
//! A slot's generation is bumped every time it is vacated, so a handle that
//! outlived its object no longer matches and resolves to nothing. The
//! generation never takes the value zero, which keeps every live handle
//! non-zero.

use alloc::vec::Vec;
use core::fmt;

use crate::error::{Resource, Result};
use crate::types::Handle;

// =============================================================================
// ENCODING
// =============================================================================

const INDEX_BITS: u32 = 20;
const INDEX_MASK: u32 = (1 << INDEX_BITS) - 1;
const GENERATION_MASK: u32 = (1 << (32 - INDEX_BITS)) - 1;

/// Hard upper bound on slots per arena
pub const MAX_SLOTS: usize = INDEX_MASK as usize + 1;

#[inline]
const fn encode(index: u32, generation: u32) -> u32 {
    (generation << INDEX_BITS) | index
}

#[inline]
const fn decode(raw: u32) -> (usize, u32) {
    ((raw & INDEX_MASK) as usize, raw >> INDEX_BITS)
}

#[inline]
const fn next_generation(generation: u32) -> u32 {
    let next = (generation + 1) & GENERATION_MASK;
    if next == 0 { 1 } else { next }
}

// =============================================================================
// SLOT
// =============================================================================

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

// =============================================================================
// HANDLE ARENA
// =============================================================================

/// Generation-checked handle table
pub struct HandleArena<M, T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
    limit: usize,
    _marker: core::marker::PhantomData<fn() -> M>,
}

impl<M, T> HandleArena<M, T> {
    /// Create an arena bounded only by [`MAX_SLOTS`]
    pub const fn new() -> Self {
        Self::with_limit(MAX_SLOTS)
    }

    /// Create an arena holding at most `limit` live entries
    pub const fn with_limit(limit: usize) -> Self {
        let limit = if limit > MAX_SLOTS { MAX_SLOTS } else { limit };
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
            limit,
            _marker: core::marker::PhantomData,
        }
    }

    /// Store a value and mint its handle
    pub fn insert(&mut self, value: T) -> Result<Handle<M>> {
        if self.len >= self.limit {
            return Err(Resource::Handles.into());
        }

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 1,
                    value: None,
                });
                (self.slots.len() - 1) as u32
            },
        };

        let slot = &mut self.slots[index as usize];
        slot.value = Some(value);
        self.len += 1;

        Ok(Handle::from_raw(encode(index, slot.generation)))
    }

    fn slot(&self, handle: Handle<M>) -> Option<&Slot<T>> {
        if handle.is_invalid() {
            return None;
        }
        let (index, generation) = decode(handle.raw());
        self.slots
            .get(index)
            .filter(|slot| slot.generation == generation)
    }

    /// Resolve a handle
    pub fn get(&self, handle: Handle<M>) -> Option<&T> {
        self.slot(handle).and_then(|slot| slot.value.as_ref())
    }

    /// Resolve a handle mutably
    pub fn get_mut(&mut self, handle: Handle<M>) -> Option<&mut T> {
        if handle.is_invalid() {
            return None;
        }
        let (index, generation) = decode(handle.raw());
        self.slots
            .get_mut(index)
            .filter(|slot| slot.generation == generation)
            .and_then(|slot| slot.value.as_mut())
    }

    /// Check whether a handle is live
    pub fn contains(&self, handle: Handle<M>) -> bool {
        self.get(handle).is_some()
    }

    /// Remove a value; its handle (and every copy of it) goes stale
    pub fn remove(&mut self, handle: Handle<M>) -> Option<T> {
        if handle.is_invalid() {
            return None;
        }
        let (index, generation) = decode(handle.raw());
        let slot = self.slots.get_mut(index)?;
        if slot.generation != generation {
            return None;
        }

        let value = slot.value.take()?;
        slot.generation = next_generation(slot.generation);
        self.free.push(index as u32);
        self.len -= 1;

        Some(value)
    }

    /// Slot index of a handle, stable for the handle's lifetime
    pub fn slot_index(handle: Handle<M>) -> usize {
        decode(handle.raw()).0
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterate live entries in slot order
    pub fn iter(&self) -> impl Iterator<Item = (Handle<M>, &T)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value
                .as_ref()
                .map(|value| (Handle::from_raw(encode(index as u32, slot.generation)), value))
        })
    }
}

impl<M, T> Default for HandleArena<M, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M, T> fmt::Debug for HandleArena<M, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleArena")
            .field("len", &self.len)
            .field("slots", &self.slots.len())
            .field("limit", &self.limit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ContextMarker;
    use crate::Error;

    type Arena = HandleArena<ContextMarker, &'static str>;

    #[test]
    fn test_handles_are_nonzero() {
        let mut arena = Arena::new();
        let h = arena.insert("a").unwrap();
        assert!(!h.is_invalid());
        assert_eq!(arena.get(h), Some(&"a"));
    }

    #[test]
    fn test_stale_handle_rejected_after_reuse() {
        let mut arena = Arena::new();
        let old = arena.insert("old").unwrap();
        assert_eq!(arena.remove(old), Some("old"));

        let new = arena.insert("new").unwrap();
        assert_eq!(Arena::slot_index(old), Arena::slot_index(new));
        assert_ne!(old, new);
        assert_eq!(arena.get(old), None);
        assert_eq!(arena.remove(old), None);
        assert_eq!(arena.get(new), Some(&"new"));
    }

    #[test]
    fn test_invalid_handle_never_resolves() {
        let mut arena = Arena::new();
        arena.insert("a").unwrap();
        assert_eq!(arena.get(Handle::INVALID), None);
        assert_eq!(arena.remove(Handle::INVALID), None);
    }

    #[test]
    fn test_limit() {
        let mut arena = Arena::with_limit(2);
        arena.insert("a").unwrap();
        let b = arena.insert("b").unwrap();
        assert_eq!(
            arena.insert("c"),
            Err(Error::ResourceExhausted(Resource::Handles))
        );
        arena.remove(b);
        assert!(arena.insert("c").is_ok());
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn test_generation_skips_zero() {
        assert_eq!(next_generation(GENERATION_MASK), 1);
        assert_eq!(next_generation(1), 2);
    }

    #[test]
    fn test_iter_yields_live_entries() {
        let mut arena = Arena::new();
        let a = arena.insert("a").unwrap();
        let b = arena.insert("b").unwrap();
        arena.remove(a);
        let live: alloc::vec::Vec<_> = arena.iter().collect();
        assert_eq!(live, alloc::vec![(b, &"b")]);
    }
}
