//! Address spaces.
//!
//! An address space owns four structural frames: its top-level table, the transient window
//! table, the working-set bitmap and the working-set list. Its mutable state is split across
//! locks: the working-set lock guards the translation entries, the hyperspace lock guards the
//! per-process transient window entry, and a handful of atomics carry the duplication flag
//! and the last synchronized system-mapping generation.

use alloc::vec::Vec;
use core::fmt;
use core::ops::Range;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use spin::{Mutex, MutexGuard};

use crate::{FrameNumber, PageNumber, PhysicalMemory, TranslationMap};

/// Identifies an address space.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpaceId(usize);

impl SpaceId {
    /// The reference address space holding the authoritative system mappings.
    pub const SYSTEM: Self = Self(0);

    /// Creates an identifier from its raw value.
    pub const fn new(id: usize) -> Self {
        Self(id)
    }

    /// Returns the raw identifier.
    pub const fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Debug for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SpaceId({})", self.0)
    }
}

/// The hardware-visible roots of an address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectoryBase {
    pub top_level: FrameNumber,
    pub transient_window: FrameNumber,
}

/// The frames allocated for a new address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StructuralFrames {
    pub top_level: FrameNumber,
    pub window_table: FrameNumber,
    pub working_set_bitmap: FrameNumber,
    pub working_set_list: FrameNumber,
}

impl StructuralFrames {
    /// Returns the frames in allocation order.
    pub fn to_array(self) -> [FrameNumber; 4] {
        [
            self.top_level,
            self.window_table,
            self.working_set_bitmap,
            self.working_set_list,
        ]
    }
}

/// State guarded by the working-set lock.
#[derive(Debug, Default)]
pub struct WorkingSet {
    resident: usize,
    leaf_tables: usize,
}

impl WorkingSet {
    /// Returns the number of resident pages.
    pub fn resident(&self) -> usize {
        self.resident
    }

    /// Returns the number of user leaf tables.
    pub fn leaf_tables(&self) -> usize {
        self.leaf_tables
    }

    pub(crate) fn add_resident(&mut self) {
        self.resident += 1;
    }

    pub(crate) fn remove_resident(&mut self) {
        self.resident -= 1;
    }

    pub(crate) fn add_leaf_table(&mut self) {
        self.leaf_tables += 1;
    }

    pub(crate) fn clear(&mut self) {
        self.resident = 0;
        self.leaf_tables = 0;
    }
}

/// Guard of an address space's working-set lock.
pub type WorkingSetGuard<'a> = MutexGuard<'a, WorkingSet>;

/// An address space.
pub struct AddressSpace {
    id: SpaceId,
    frames: StructuralFrames,
    minimum_working_set: usize,
    working_set: Mutex<WorkingSet>,
    hyperspace: Mutex<()>,
    duplicating: AtomicBool,
    images: Mutex<Vec<Range<PageNumber>>>,
    synced_generation: AtomicU64,
}

impl AddressSpace {
    pub(crate) fn new(
        id: SpaceId,
        frames: StructuralFrames,
        minimum_working_set: usize,
        synced_generation: u64,
    ) -> Self {
        Self {
            id,
            frames,
            minimum_working_set,
            working_set: Mutex::new(WorkingSet::default()),
            hyperspace: Mutex::new(()),
            duplicating: AtomicBool::new(false),
            images: Mutex::new(Vec::new()),
            synced_generation: AtomicU64::new(synced_generation),
        }
    }

    pub fn id(&self) -> SpaceId {
        self.id
    }

    /// Returns the hardware-visible roots of this address space.
    pub fn directory_base(&self) -> DirectoryBase {
        DirectoryBase {
            top_level: self.frames.top_level,
            transient_window: self.frames.window_table,
        }
    }

    pub fn structural_frames(&self) -> StructuralFrames {
        self.frames
    }

    pub fn top_level(&self) -> FrameNumber {
        self.frames.top_level
    }

    pub fn window_table(&self) -> FrameNumber {
        self.frames.window_table
    }

    pub fn minimum_working_set(&self) -> usize {
        self.minimum_working_set
    }

    /// Returns a translation map over this address space's tables.
    pub fn translation<'a>(&self, memory: &'a PhysicalMemory) -> TranslationMap<'a> {
        TranslationMap::new(memory, self.frames.top_level)
    }

    /// Acquires the working-set lock. It ranks above the frame lock.
    pub fn lock_working_set(&self) -> WorkingSetGuard<'_> {
        self.working_set.lock()
    }

    pub(crate) fn lock_hyperspace(&self) -> MutexGuard<'_, ()> {
        self.hyperspace.lock()
    }

    /// Marks a structural duplication as in flight until the guard is dropped.
    ///
    /// # Panics
    ///
    /// Panics if a duplication is already in flight.
    pub fn begin_duplication(&self) -> DuplicationGuard<'_> {
        let was = self.duplicating.swap(true, Ordering::AcqRel);
        assert!(!was, "duplication already in progress for {:?}", self.id);
        DuplicationGuard { space: self }
    }

    /// Returns true while a structural duplication is in flight.
    pub fn is_duplicating(&self) -> bool {
        self.duplicating.load(Ordering::Acquire)
    }

    /// Waits until no structural duplication is in flight. Call with no locks held.
    pub fn wait_for_duplication(&self) {
        while self.is_duplicating() {
            core::hint::spin_loop();
        }
    }

    /// Marks `pages` as being loaded from an image.
    pub fn begin_image_load(&self, pages: Range<PageNumber>) {
        log::debug!("{:?}: image load of pages {}..{}", self.id, pages.start, pages.end);
        self.images.lock().push(pages);
    }

    /// Ends the image load of `pages`. Returns false if no such load was in progress.
    pub fn finish_image_load(&self, pages: Range<PageNumber>) -> bool {
        let mut images = self.images.lock();
        match images.iter().position(|load| *load == pages) {
            Some(index) => {
                images.swap_remove(index);
                true
            }
            None => false,
        }
    }

    /// Returns true if `page` lies in a region still being loaded from an image.
    pub fn image_loading_at(&self, page: PageNumber) -> bool {
        self.images.lock().iter().any(|load| load.contains(&page))
    }

    /// Returns the system-mapping generation this address space last synchronized to.
    pub fn synced_generation(&self) -> u64 {
        self.synced_generation.load(Ordering::Acquire)
    }

    pub(crate) fn set_synced_generation(&self, generation: u64) {
        self.synced_generation.store(generation, Ordering::Release);
    }
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace")
            .field("id", &self.id)
            .field("top_level", &self.frames.top_level)
            .field("window_table", &self.frames.window_table)
            .finish_non_exhaustive()
    }
}

/// Clears the duplication flag of an address space when dropped.
pub struct DuplicationGuard<'a> {
    space: &'a AddressSpace,
}

impl Drop for DuplicationGuard<'_> {
    fn drop(&mut self) {
        self.space.duplicating.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space() -> AddressSpace {
        let frames = StructuralFrames {
            top_level: FrameNumber::new(0),
            window_table: FrameNumber::new(1),
            working_set_bitmap: FrameNumber::new(2),
            working_set_list: FrameNumber::new(3),
        };
        AddressSpace::new(SpaceId::new(1), frames, 4, 0)
    }

    #[test]
    fn duplication_flag_follows_guard() {
        let space = space();
        {
            let _guard = space.begin_duplication();
            assert!(space.is_duplicating());
        }
        assert!(!space.is_duplicating());
        space.wait_for_duplication();
    }

    #[test]
    #[should_panic(expected = "duplication already in progress")]
    fn nested_duplication_panics() {
        let space = space();
        let _first = space.begin_duplication();
        let _second = space.begin_duplication();
    }

    #[test]
    fn image_load_regions() {
        let space = space();
        let pages = PageNumber::new(4)..PageNumber::new(8);
        space.begin_image_load(pages.clone());
        assert!(space.image_loading_at(PageNumber::new(5)));
        assert!(!space.image_loading_at(PageNumber::new(8)));
        assert!(space.finish_image_load(pages.clone()));
        assert!(!space.finish_image_load(pages));
        assert!(!space.image_loading_at(PageNumber::new(5)));
    }

    #[test]
    fn directory_base_reports_roots() {
        let space = space();
        let base = space.directory_base();
        assert_eq!(base.top_level, FrameNumber::new(0));
        assert_eq!(base.transient_window, FrameNumber::new(1));
    }
}
