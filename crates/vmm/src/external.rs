//! Interfaces to the collaborators outside the fault-resolution core.
//!
//! The memory manager consumes three narrow interfaces: a frame allocator, the paging file's
//! reservation bookkeeping and the working-set tracker. Each comes with a small reference
//! implementation so the crate can be exercised on its own.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::ops::Range;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::{FrameNumber, PageNumber, SpaceId, config::CACHE_COLORS, frame::color_of};

/// Number of polls [`FreeFrameList::wait_for_frames`] makes before giving up on frames that
/// are held but never returned.
const WAIT_POLLS: u64 = 1 << 32;

/// A reserved slot in the paging file.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageFileSlot(usize);

impl PageFileSlot {
    /// Creates a slot from its raw index.
    pub const fn new(index: usize) -> Self {
        Self(index)
    }
}

impl fmt::Debug for PageFileSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PageFileSlot({})", self.0)
    }
}

/// Index of a page in its address space's working-set list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WsIndex(usize);

impl WsIndex {
    /// Creates an index from its raw value.
    pub const fn new(index: usize) -> Self {
        Self(index)
    }
}

/// Source of free physical frames.
pub trait FrameAllocator: Send + Sync {
    /// Removes a free frame, preferring one of cache color `color_hint`.
    fn remove_free_frame(&self, color_hint: usize) -> Option<FrameNumber>;

    /// Returns a frame to the free pool.
    fn return_free_frame(&self, frame: FrameNumber);

    /// Returns the number of free frames.
    fn available_frames(&self) -> usize;

    /// Blocks until at least `target` frames are free. Must be called with no locks held.
    ///
    /// Returns false if that many frames will never be free.
    fn wait_for_frames(&self, target: usize) -> bool;
}

/// Paging file space manager.
pub trait PagingFile: Send + Sync {
    /// Releases the reservation of `slot`; the in-memory copy has become authoritative.
    fn release_reservation(&self, slot: PageFileSlot);
}

/// Working-set tracker. Replacement policy lives behind this interface.
pub trait WorkingSetTracker: Send + Sync {
    /// Starts tracking `page` of `space`, returning its index.
    fn track(&self, space: SpaceId, page: PageNumber) -> WsIndex;

    /// Returns the tracking index of `page` in `space`.
    fn locate(&self, space: SpaceId, page: PageNumber) -> Option<WsIndex>;

    /// Stops tracking `page` in `space`.
    fn forget(&self, space: SpaceId, page: PageNumber);
}

/// The collaborators handed to [`Vmm::new`](crate::Vmm::new).
#[derive(Clone)]
pub struct Collaborators {
    pub frames: Arc<dyn FrameAllocator>,
    pub paging: Arc<dyn PagingFile>,
    pub working_set: Arc<dyn WorkingSetTracker>,
}

impl Collaborators {
    /// Bundles the given collaborators.
    pub fn new(
        frames: Arc<dyn FrameAllocator>,
        paging: Arc<dyn PagingFile>,
        working_set: Arc<dyn WorkingSetTracker>,
    ) -> Self {
        Self {
            frames,
            paging,
            working_set,
        }
    }

    /// Creates the reference collaborators over the managed frames `0..managed_frames`.
    pub fn reference(managed_frames: usize) -> Self {
        Self::new(
            Arc::new(FreeFrameList::new(0..managed_frames)),
            Arc::new(PageFileLedger::new()),
            Arc::new(WorkingSetIndex::new()),
        )
    }
}

/// Free frame pool with one list per cache color.
///
/// Every frame the pool was created with is either free or held by a caller that may return
/// it, so a wait for more frames than the pool's capacity fails at once.
pub struct FreeFrameList {
    lists: spin::Mutex<[Vec<FrameNumber>; CACHE_COLORS]>,
    available: AtomicUsize,
    capacity: usize,
}

impl FreeFrameList {
    /// Creates a pool holding the frames in `frames`.
    pub fn new(frames: Range<usize>) -> Self {
        let mut lists: [Vec<FrameNumber>; CACHE_COLORS] = Default::default();
        let count = frames.len();
        // Reversed so that low frames are handed out first.
        for number in frames.rev() {
            let frame = FrameNumber::new(number);
            lists[color_of(frame)].push(frame);
        }
        Self {
            lists: spin::Mutex::new(lists),
            available: AtomicUsize::new(count),
            capacity: count,
        }
    }
}

impl FrameAllocator for FreeFrameList {
    fn remove_free_frame(&self, color_hint: usize) -> Option<FrameNumber> {
        let mut lists = self.lists.lock();
        let frame = (0..CACHE_COLORS)
            .map(|offset| (color_hint + offset) % CACHE_COLORS)
            .find_map(|color| lists[color].pop())?;
        self.available.fetch_sub(1, Ordering::AcqRel);
        Some(frame)
    }

    fn return_free_frame(&self, frame: FrameNumber) {
        self.lists.lock()[color_of(frame)].push(frame);
        self.available.fetch_add(1, Ordering::AcqRel);
    }

    fn available_frames(&self) -> usize {
        self.available.load(Ordering::Acquire)
    }

    fn wait_for_frames(&self, target: usize) -> bool {
        if target > self.capacity {
            log::warn!("waiting for {target} frames from a pool of {}", self.capacity);
            return false;
        }
        for _ in 0..WAIT_POLLS {
            if self.available_frames() >= target {
                return true;
            }
            core::hint::spin_loop();
        }
        log::warn!("gave up waiting for {target} free frames");
        false
    }
}

#[derive(Default)]
struct LedgerState {
    next: usize,
    reserved: BTreeSet<PageFileSlot>,
    releases: usize,
    invalid_releases: usize,
}

/// Paging file reservation bookkeeping.
///
/// Counts releases so that a double release of the same slot is detectable.
#[derive(Default)]
pub struct PageFileLedger {
    state: spin::Mutex<LedgerState>,
}

impl PageFileLedger {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves a fresh slot.
    pub fn reserve(&self) -> PageFileSlot {
        let mut state = self.state.lock();
        let slot = PageFileSlot(state.next);
        state.next += 1;
        state.reserved.insert(slot);
        slot
    }

    /// Returns true if `slot` is still reserved.
    pub fn is_reserved(&self, slot: PageFileSlot) -> bool {
        self.state.lock().reserved.contains(&slot)
    }

    /// Returns the number of successful releases.
    pub fn release_count(&self) -> usize {
        self.state.lock().releases
    }

    /// Returns the number of releases of slots that were not reserved.
    pub fn invalid_release_count(&self) -> usize {
        self.state.lock().invalid_releases
    }
}

impl PagingFile for PageFileLedger {
    fn release_reservation(&self, slot: PageFileSlot) {
        let mut state = self.state.lock();
        if state.reserved.remove(&slot) {
            state.releases += 1;
        } else {
            log::error!("release of unreserved {slot:?}");
            state.invalid_releases += 1;
        }
    }
}

#[derive(Default)]
struct IndexState {
    entries: BTreeMap<(SpaceId, PageNumber), WsIndex>,
    next: usize,
}

/// Working-set index lookup keyed by address space and page.
#[derive(Default)]
pub struct WorkingSetIndex {
    state: spin::Mutex<IndexState>,
}

impl WorkingSetIndex {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of pages tracked for `space`.
    pub fn tracked(&self, space: SpaceId) -> usize {
        self.state
            .lock()
            .entries
            .keys()
            .filter(|(owner, _)| *owner == space)
            .count()
    }
}

impl WorkingSetTracker for WorkingSetIndex {
    fn track(&self, space: SpaceId, page: PageNumber) -> WsIndex {
        let mut state = self.state.lock();
        if let Some(index) = state.entries.get(&(space, page)) {
            return *index;
        }
        let index = WsIndex(state.next);
        state.next += 1;
        state.entries.insert((space, page), index);
        index
    }

    fn locate(&self, space: SpaceId, page: PageNumber) -> Option<WsIndex> {
        self.state.lock().entries.get(&(space, page)).copied()
    }

    fn forget(&self, space: SpaceId, page: PageNumber) {
        self.state.lock().entries.remove(&(space, page));
    }
}
