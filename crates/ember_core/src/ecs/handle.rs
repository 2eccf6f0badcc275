//! # Handles and Handle Tables
//!
//! Handles are lightweight identifiers consisting of:
//! - An index into a slot array
//! - A generation counter for safe reuse
//! - A type tag (owning world id for objects, component type id for components)
//!
//! A handle is never dereferenced directly. It is always resolved through the
//! [`HandleTable`] that minted it, which rejects stale handles in O(1).

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// Typed, generation-checked reference into a [`HandleTable`].
///
/// The `T` parameter only exists at compile time; all handles share the same
/// 8-byte layout:
/// - `index`: slot in the owning table
/// - `generation`: bumped every time the slot is freed
/// - `tag`: world id (objects) or component type id (components)
pub struct Handle<T: ?Sized> {
    index: u32,
    generation: u16,
    tag: u16,
    _marker: PhantomData<fn() -> *const T>,
}

impl<T: ?Sized> Handle<T> {
    /// Null/invalid handle. Never resolves.
    pub const NULL: Self = Self::new(u32::MAX, 0, 0);

    /// Creates a handle from its parts.
    ///
    /// # Arguments
    ///
    /// * `index` - Slot index in the owning table
    /// * `generation` - Generation of the slot when the handle was minted
    /// * `tag` - World id or component type id
    #[inline]
    #[must_use]
    pub const fn new(index: u32, generation: u16, tag: u16) -> Self {
        Self {
            index,
            generation,
            tag,
            _marker: PhantomData,
        }
    }

    /// Returns the slot index.
    #[inline]
    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Returns the generation.
    #[inline]
    #[must_use]
    pub const fn generation(self) -> u16 {
        self.generation
    }

    /// Returns the type tag.
    #[inline]
    #[must_use]
    pub const fn tag(self) -> u16 {
        self.tag
    }

    /// Checks if this handle is null.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.index == u32::MAX
    }

    /// Packs the handle into a single `u64`.
    #[inline]
    #[must_use]
    pub const fn to_bits(self) -> u64 {
        ((self.tag as u64) << 48) | ((self.generation as u64) << 32) | (self.index as u64)
    }

    /// Unpacks a handle produced by [`Handle::to_bits`].
    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self::new(bits as u32, (bits >> 32) as u16, (bits >> 48) as u16)
    }

    /// Reinterprets the handle for another pointee type.
    #[inline]
    pub(crate) const fn cast<U: ?Sized>(self) -> Handle<U> {
        Handle::new(self.index, self.generation, self.tag)
    }
}

impl<T: ?Sized> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: ?Sized> Copy for Handle<T> {}

impl<T: ?Sized> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation && self.tag == other.tag
    }
}

impl<T: ?Sized> Eq for Handle<T> {}

impl<T: ?Sized> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.to_bits().hash(state);
    }
}

impl<T: ?Sized> Default for Handle<T> {
    fn default() -> Self {
        Self::NULL
    }
}

impl<T: ?Sized> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            return f.write_str("Handle(null)");
        }
        write!(f, "Handle({}v{}#{})", self.index, self.generation, self.tag)
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u16,
    value: Option<T>,
}

/// Generation-counted slot allocator.
///
/// Freed slots go onto a LIFO free list and are reused before the backing
/// array grows. Freeing a slot bumps its generation (wrapping), so every
/// handle minted for the previous occupant stops resolving.
#[derive(Debug)]
pub struct HandleTable<T> {
    slots: Vec<Slot<T>>,
    free_list: Vec<u32>,
    len: usize,
    tag: u16,
}

impl<T> HandleTable<T> {
    /// Creates an empty table whose handles carry `tag`.
    #[must_use]
    pub fn new(tag: u16) -> Self {
        Self::with_capacity(tag, 0)
    }

    /// Creates an empty table with room for `capacity` slots.
    #[must_use]
    pub fn with_capacity(tag: u16, capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free_list: Vec::new(),
            len: 0,
            tag,
        }
    }

    /// Returns the tag stamped on every handle of this table.
    #[inline]
    #[must_use]
    pub const fn tag(&self) -> u16 {
        self.tag
    }

    /// Returns the number of live entries.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the table holds no live entries.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the number of slots ever created (live + free).
    #[inline]
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Reserves room for `additional` more slots.
    pub fn reserve(&mut self, additional: usize) {
        self.slots.reserve(additional);
    }

    /// Stores `value` and returns a fresh handle to it.
    ///
    /// This is **O(1)**: the most recently freed slot is reused first.
    pub fn allocate(&mut self, value: T) -> Handle<T> {
        while let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            if slot.value.is_some() {
                debug_assert!(false, "free list holds occupied slot {index}");
                tracing::error!(index, "free list corruption: skipping occupied slot");
                continue;
            }
            slot.value = Some(value);
            self.len += 1;
            return Handle::new(index, slot.generation, self.tag);
        }

        let Ok(index) = u32::try_from(self.slots.len()) else {
            // u32::MAX is the null index; the table never gets there in practice
            panic!("handle table exhausted");
        };
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        self.len += 1;
        Handle::new(index, 0, self.tag)
    }

    /// Frees the slot behind `handle` and returns its value.
    ///
    /// Stale, null or foreign handles are a no-op.
    pub fn deallocate(&mut self, handle: Handle<T>) -> Option<T> {
        if !self.contains(handle) {
            tracing::debug!(?handle, "deallocate with stale handle ignored");
            return None;
        }
        let slot = &mut self.slots[handle.index as usize];
        let value = slot.value.take();
        slot.generation = slot.generation.wrapping_add(1);
        self.free_list.push(handle.index);
        self.len -= 1;
        value
    }

    /// Checks if `handle` currently resolves.
    #[inline]
    #[must_use]
    pub fn contains(&self, handle: Handle<T>) -> bool {
        self.resolve(handle).is_some()
    }

    /// Resolves a handle to a shared reference.
    #[inline]
    #[must_use]
    pub fn resolve(&self, handle: Handle<T>) -> Option<&T> {
        if handle.tag != self.tag {
            return None;
        }
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.as_ref()
    }

    /// Resolves a handle to a mutable reference.
    #[inline]
    #[must_use]
    pub fn resolve_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        if handle.tag != self.tag {
            return None;
        }
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.as_mut()
    }

    /// Returns the handle of the live entry at `index`, if any.
    #[must_use]
    pub fn handle_at(&self, index: u32) -> Option<Handle<T>> {
        let slot = self.slots.get(index as usize)?;
        slot.value
            .as_ref()
            .map(|_| Handle::new(index, slot.generation, self.tag))
    }

    /// Iterates live entries in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> + '_ {
        let tag = self.tag;
        self.slots.iter().enumerate().filter_map(move |(i, slot)| {
            slot.value
                .as_ref()
                .map(|v| (Handle::new(i as u32, slot.generation, tag), v))
        })
    }

    /// Iterates live entries mutably in slot order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Handle<T>, &mut T)> + '_ {
        let tag = self.tag;
        self.slots.iter_mut().enumerate().filter_map(move |(i, slot)| {
            let generation = slot.generation;
            slot.value
                .as_mut()
                .map(|v| (Handle::new(i as u32, generation, tag), v))
        })
    }

    /// Frees every live entry, invalidating all outstanding handles.
    pub fn clear(&mut self) {
        for (index, slot) in self.slots.iter_mut().enumerate().rev() {
            if slot.value.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free_list.push(index as u32);
            }
        }
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_bits_roundtrip() {
        let h: Handle<u32> = Handle::new(12345, 678, 9);
        let back: Handle<u32> = Handle::from_bits(h.to_bits());
        assert_eq!(h, back);
        assert_eq!(back.index(), 12345);
        assert_eq!(back.generation(), 678);
        assert_eq!(back.tag(), 9);
    }

    #[test]
    fn test_null_never_resolves() {
        let mut table = HandleTable::new(0);
        table.allocate(1u32);
        assert!(table.resolve(Handle::NULL).is_none());
        assert!(Handle::<u32>::default().is_null());
    }

    #[test]
    fn test_stale_handle_after_reuse() {
        let mut table = HandleTable::new(3);
        let a = table.allocate("a");
        assert_eq!(table.deallocate(a), Some("a"));

        let b = table.allocate("b");
        assert_eq!(a.index(), b.index());
        assert_ne!(a.generation(), b.generation());
        assert!(table.resolve(a).is_none());
        assert_eq!(table.resolve(b), Some(&"b"));

        // Double free is a no-op
        assert!(table.deallocate(a).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_free_list_is_lifo() {
        let mut table = HandleTable::new(0);
        let handles: Vec<_> = (0..4).map(|i| table.allocate(i)).collect();
        table.deallocate(handles[1]);
        table.deallocate(handles[3]);

        assert_eq!(table.allocate(10).index(), 3);
        assert_eq!(table.allocate(11).index(), 1);
        assert_eq!(table.allocate(12).index(), 4);
    }

    #[test]
    fn test_foreign_tag_rejected() {
        let mut table = HandleTable::new(1);
        let h = table.allocate(5u8);
        let foreign: Handle<u8> = Handle::new(h.index(), h.generation(), 2);
        assert!(table.resolve(foreign).is_none());
        assert!(table.deallocate(foreign).is_none());
    }

    #[test]
    fn test_generation_wraps() {
        let mut table = HandleTable::new(0);
        let mut h = table.allocate(0u8);
        for _ in 0..=u16::MAX {
            table.deallocate(h);
            h = table.allocate(0);
        }
        assert_eq!(h.index(), 0);
        assert_eq!(h.generation(), 0);
    }

    #[test]
    fn test_clear_invalidates_everything() {
        let mut table = HandleTable::new(0);
        let a = table.allocate(1);
        let b = table.allocate(2);
        table.clear();
        assert!(table.is_empty());
        assert!(!table.contains(a));
        assert!(!table.contains(b));
        assert_eq!(table.iter().count(), 0);
    }

    #[test]
    fn test_iter_in_slot_order() {
        let mut table = HandleTable::new(0);
        let a = table.allocate('a');
        let b = table.allocate('b');
        let c = table.allocate('c');
        table.deallocate(b);
        let seen: Vec<_> = table.iter().map(|(h, v)| (h, *v)).collect();
        assert_eq!(seen, vec![(a, 'a'), (c, 'c')]);
        assert_eq!(table.handle_at(2), Some(c));
        assert_eq!(table.handle_at(1), None);
    }
}
