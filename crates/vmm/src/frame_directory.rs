//! Frame directory: the authoritative per-frame metadata store.
//!
//! The directory covers the managed frames densely. Frames beyond the managed range, such as
//! device memory mapped with [`Vmm::map_io_frame`](crate::Vmm::map_io_frame), never have a
//! descriptor. All access goes through the global frame lock.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::{FrameDescriptor, FrameNumber};

/// Outcome of dropping one share of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareRelease {
    /// Other references remain.
    Shared(usize),
    /// The last reference is gone; the descriptor has been removed and the frame may be freed.
    Free(FrameDescriptor),
    /// The last reference is gone but a write-back is in flight; the frame is freed when the
    /// write completes.
    Deferred,
}

/// Dense directory of frame descriptors.
pub struct FrameDirectory {
    descriptors: Box<[Option<FrameDescriptor>]>,
    in_use: usize,
}

impl FrameDirectory {
    /// Creates an empty directory covering `managed_frames` frames.
    pub fn new(managed_frames: usize) -> Self {
        let descriptors: Vec<Option<FrameDescriptor>> = (0..managed_frames).map(|_| None).collect();
        Self {
            descriptors: descriptors.into_boxed_slice(),
            in_use: 0,
        }
    }

    /// Returns true if `frame` is in the managed range.
    pub fn is_managed(&self, frame: FrameNumber) -> bool {
        frame.as_usize() < self.descriptors.len()
    }

    /// Returns the number of frames with a descriptor.
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Installs the descriptor of a frame just removed from the free pool.
    ///
    /// # Panics
    ///
    /// Panics if the frame is unmanaged or already has a descriptor.
    pub fn insert(&mut self, frame: FrameNumber, descriptor: FrameDescriptor) {
        let slot = self
            .descriptors
            .get_mut(frame.as_usize())
            .unwrap_or_else(|| panic!("frame {frame} is not managed"));
        assert!(slot.is_none(), "frame {frame} already has a descriptor");
        *slot = Some(descriptor);
        self.in_use += 1;
    }

    /// Returns the descriptor of `frame`, if it has one.
    pub fn get(&self, frame: FrameNumber) -> Option<&FrameDescriptor> {
        self.descriptors.get(frame.as_usize())?.as_ref()
    }

    /// Returns the descriptor of `frame` mutably, if it has one.
    pub fn get_mut(&mut self, frame: FrameNumber) -> Option<&mut FrameDescriptor> {
        self.descriptors.get_mut(frame.as_usize())?.as_mut()
    }

    /// Iterates over every frame that has a descriptor.
    pub fn iter(&self) -> impl Iterator<Item = (FrameNumber, &FrameDescriptor)> {
        self.descriptors
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|d| (FrameNumber::new(index), d)))
    }

    /// Adds one share to `frame`, returning the new count.
    pub fn increment_share(&mut self, frame: FrameNumber) -> Option<usize> {
        let descriptor = self.get_mut(frame)?;
        descriptor.share_count += 1;
        Some(descriptor.share_count)
    }

    /// Drops one share of `frame`.
    ///
    /// Returns `None` if the frame has no descriptor.
    ///
    /// # Panics
    ///
    /// Panics if the share count is already zero.
    pub fn decrement_share(&mut self, frame: FrameNumber) -> Option<ShareRelease> {
        let descriptor = self.get_mut(frame)?;
        assert!(descriptor.share_count > 0, "share count underflow on frame {frame}");
        descriptor.share_count -= 1;
        if descriptor.share_count > 0 {
            return Some(ShareRelease::Shared(descriptor.share_count));
        }
        if descriptor.write_in_progress {
            descriptor.pending_free = true;
            return Some(ShareRelease::Deferred);
        }
        self.remove(frame).map(ShareRelease::Free)
    }

    /// Removes the descriptor of `frame`.
    pub fn remove(&mut self, frame: FrameNumber) -> Option<FrameDescriptor> {
        let removed = self.descriptors.get_mut(frame.as_usize())?.take();
        if removed.is_some() {
            self.in_use -= 1;
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Backing, Owner, SpaceId};

    fn descriptor(frame: FrameNumber) -> FrameDescriptor {
        FrameDescriptor::table(frame, SpaceId::new(1))
    }

    #[test]
    fn unmanaged_frames_have_no_descriptor() {
        let directory = FrameDirectory::new(4);
        assert!(directory.is_managed(FrameNumber::new(3)));
        assert!(!directory.is_managed(FrameNumber::new(4)));
        assert!(directory.get(FrameNumber::new(4)).is_none());
        assert!(directory.get(FrameNumber::new(1)).is_none());
    }

    #[test]
    fn share_counting() {
        let mut directory = FrameDirectory::new(4);
        let frame = FrameNumber::new(2);
        directory.insert(frame, descriptor(frame));
        assert_eq!(directory.increment_share(frame), Some(2));
        assert_eq!(directory.decrement_share(frame), Some(ShareRelease::Shared(1)));
        assert!(matches!(
            directory.decrement_share(frame),
            Some(ShareRelease::Free(_))
        ));
        assert!(directory.get(frame).is_none());
        assert_eq!(directory.in_use(), 0);
    }

    #[test]
    fn write_in_progress_defers_free() {
        let mut directory = FrameDirectory::new(4);
        let frame = FrameNumber::new(1);
        let mut desc = FrameDescriptor::new(
            frame,
            Owner::Mapping {
                space: SpaceId::new(1),
                page: crate::PageNumber::new(0),
            },
            Backing::Demand,
        );
        desc.write_in_progress = true;
        directory.insert(frame, desc);
        assert_eq!(directory.decrement_share(frame), Some(ShareRelease::Deferred));
        let desc = directory.get(frame).unwrap();
        assert!(desc.pending_free);
        assert_eq!(desc.share_count, 0);
    }

    #[test]
    #[should_panic(expected = "already has a descriptor")]
    fn double_insert_panics() {
        let mut directory = FrameDirectory::new(2);
        let frame = FrameNumber::new(0);
        directory.insert(frame, descriptor(frame));
        directory.insert(frame, descriptor(frame));
    }

    #[test]
    fn iter_skips_free_frames() {
        let mut directory = FrameDirectory::new(8);
        for n in [1, 5] {
            directory.insert(FrameNumber::new(n), descriptor(FrameNumber::new(n)));
        }
        let frames: Vec<_> = directory.iter().map(|(f, _)| f.as_usize()).collect();
        assert_eq!(frames, [1, 5]);
    }
}
