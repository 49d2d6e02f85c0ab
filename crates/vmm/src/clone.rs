//! Clone descriptors for frames shared copy-on-write.
//!
//! When an address space is duplicated, each private page becomes shared through a clone
//! descriptor. The descriptor counts the translation entries mapping its frame and holds the
//! frame's backing chain. It is destroyed when the last sharer unmaps or copies the page.

use alloc::collections::BTreeMap;
use core::fmt;

use crate::{Backing, FrameNumber};

/// Identifies a clone descriptor.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CloneId(u64);

impl CloneId {
    /// Creates a clone identifier from its raw value.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Debug for CloneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CloneId({})", self.0)
    }
}

/// A frame shared copy-on-write across mappings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloneDescriptor {
    /// Live translation entries mapping the shared frame.
    pub ref_count: usize,
    /// The shared frame.
    pub frame: FrameNumber,
    /// Backing of the shared contents, taken over from the frame when it became shared.
    pub backing: Backing,
}

/// Registry of live clone descriptors.
#[derive(Default)]
pub struct CloneRegistry {
    clones: BTreeMap<CloneId, CloneDescriptor>,
    next: u64,
}

impl CloneRegistry {
    /// Creates an empty registry.
    pub const fn new() -> Self {
        Self {
            clones: BTreeMap::new(),
            next: 1,
        }
    }

    /// Creates a clone descriptor for `frame` with `ref_count` sharers.
    pub fn create(&mut self, frame: FrameNumber, backing: Backing, ref_count: usize) -> CloneId {
        assert!(ref_count > 0, "clone descriptor needs at least one sharer");
        let id = CloneId(self.next);
        self.next += 1;
        self.clones.insert(
            id,
            CloneDescriptor {
                ref_count,
                frame,
                backing,
            },
        );
        log::trace!("created {id:?} for frame {frame} with {ref_count} sharers");
        id
    }

    /// Returns the descriptor for `id`.
    pub fn get(&self, id: CloneId) -> Option<&CloneDescriptor> {
        self.clones.get(&id)
    }

    /// Returns the reference count of `id`, or zero if it no longer exists.
    pub fn ref_count(&self, id: CloneId) -> usize {
        self.clones.get(&id).map_or(0, |c| c.ref_count)
    }

    /// Adds a sharer to `id`.
    pub fn add_reference(&mut self, id: CloneId) -> Option<usize> {
        let clone = self.clones.get_mut(&id)?;
        clone.ref_count += 1;
        Some(clone.ref_count)
    }

    /// Drops a sharer from `id`. Returns the removed descriptor when the count reaches zero.
    ///
    /// # Panics
    ///
    /// Panics if `id` does not exist.
    pub fn dereference(&mut self, id: CloneId) -> Option<CloneDescriptor> {
        let clone = self
            .clones
            .get_mut(&id)
            .unwrap_or_else(|| panic!("dereference of unknown {id:?}"));
        clone.ref_count -= 1;
        if clone.ref_count > 0 {
            return None;
        }
        self.clones.remove(&id)
    }

    /// Returns the number of live clone descriptors.
    pub fn len(&self) -> usize {
        self.clones.len()
    }

    /// Returns true if no clone descriptors are live.
    pub fn is_empty(&self) -> bool {
        self.clones.is_empty()
    }

    /// Iterates over the live clone descriptors.
    pub fn iter(&self) -> impl Iterator<Item = (CloneId, &CloneDescriptor)> {
        self.clones.iter().map(|(id, clone)| (*id, clone))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn released_exactly_at_zero() {
        let mut registry = CloneRegistry::new();
        let id = registry.create(FrameNumber::new(9), Backing::Demand, 2);
        assert_eq!(registry.add_reference(id), Some(3));
        assert!(registry.dereference(id).is_none());
        assert!(registry.dereference(id).is_none());
        let released = registry.dereference(id).unwrap();
        assert_eq!(released.frame, FrameNumber::new(9));
        assert_eq!(registry.ref_count(id), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn ids_are_unique() {
        let mut registry = CloneRegistry::new();
        let a = registry.create(FrameNumber::new(1), Backing::Demand, 1);
        let b = registry.create(FrameNumber::new(2), Backing::Image, 1);
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(b).map(|c| c.backing), Some(Backing::Image));
    }

    #[test]
    #[should_panic(expected = "dereference of unknown")]
    fn dereference_unknown_panics() {
        CloneRegistry::new().dereference(CloneId::new(42));
    }
}
