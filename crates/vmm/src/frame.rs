//! Per-frame metadata.

use crate::{
    CloneId, FrameNumber, PageFileSlot, PageNumber, SpaceId, WsIndex, config::CACHE_COLORS,
};

/// What a frame is currently used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    /// A translation table or working-set page belonging to an address space.
    Table(SpaceId),
    /// A private page mapped at `page` in `space`.
    Mapping { space: SpaceId, page: PageNumber },
    /// A page shared copy-on-write through a clone descriptor.
    Clone(CloneId),
}

/// Where the authoritative copy of a frame's contents lives, besides the frame itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    /// Only in memory. Demand-zero pages and private copies.
    Demand,
    /// A copy is reserved in the paging file.
    PageFile(PageFileSlot),
    /// Read from an executable image.
    Image,
    /// Shared through a clone descriptor, which holds the backing chain.
    Clone(CloneId),
}

/// Holds metadata for a managed physical frame.
///
/// A descriptor exists from the moment a frame is removed from the free pool until its share
/// count drops to zero with no write-back in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameDescriptor {
    /// Current owner of the frame.
    pub owner: Owner,
    /// Live translation entries referencing the frame, plus one per clone descriptor holding it.
    pub share_count: usize,
    /// The frame holds data newer than its backing.
    pub modified: bool,
    /// A write-back to the paging file is in flight.
    pub write_in_progress: bool,
    /// The share count reached zero during a write-back; free the frame on completion.
    pub pending_free: bool,
    /// Cache color, used to avoid aliasing when choosing a copy target.
    pub color: usize,
    /// Backing store of the frame's contents.
    pub backing: Backing,
    /// Working-set tracking index of the mapped page, if any.
    pub ws_index: Option<WsIndex>,
}

impl FrameDescriptor {
    /// Creates a descriptor for a freshly allocated frame with a share count of one.
    pub fn new(frame: FrameNumber, owner: Owner, backing: Backing) -> Self {
        Self {
            owner,
            share_count: 1,
            modified: false,
            write_in_progress: false,
            pending_free: false,
            color: color_of(frame),
            backing,
            ws_index: None,
        }
    }

    /// Creates a descriptor for a translation table or working-set page of `space`.
    pub fn table(frame: FrameNumber, space: SpaceId) -> Self {
        Self::new(frame, Owner::Table(space), Backing::Demand)
    }

    /// Returns true if the frame holds a page of data rather than a table.
    pub fn is_page(&self) -> bool {
        !matches!(self.owner, Owner::Table(_))
    }
}

/// Returns the cache color of `frame`.
#[inline]
pub const fn color_of(frame: FrameNumber) -> usize {
    frame.as_usize() % CACHE_COLORS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_descriptor_has_one_share() {
        let desc = FrameDescriptor::new(
            FrameNumber::new(6),
            Owner::Mapping {
                space: SpaceId::new(1),
                page: PageNumber::new(2),
            },
            Backing::Demand,
        );
        assert_eq!(desc.share_count, 1);
        assert_eq!(desc.color, 6 % CACHE_COLORS);
        assert!(desc.is_page());
        assert!(!desc.modified);
    }

    #[test]
    fn table_descriptor_is_not_a_page() {
        let desc = FrameDescriptor::table(FrameNumber::new(1), SpaceId::new(3));
        assert!(!desc.is_page());
        assert_eq!(desc.owner, Owner::Table(SpaceId::new(3)));
    }
}
