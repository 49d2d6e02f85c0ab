//! The frame database and the global frame lock.
//!
//! Everything that changes frame identity or frame accounting lives here: the frame
//! directory, the clone registry and the commit ledger. The whole database sits behind one
//! `spin::Mutex`, the frame lock. It ranks below every working-set lock and is never held
//! while waiting for frames.

use spin::{Mutex, MutexGuard};

use crate::{
    Backing, CloneDescriptor, CloneRegistry, Collaborators, FrameDescriptor, FrameDirectory,
    FrameNumber, PageFileSlot, ShareRelease,
};

/// Guard of the global frame lock.
pub type FrameLockGuard<'a> = MutexGuard<'a, FrameDatabase>;

/// Commit accounting against a fixed limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitLedger {
    limit: usize,
    committed: usize,
}

impl CommitLedger {
    /// Creates a ledger with nothing committed.
    pub const fn new(limit: usize) -> Self {
        Self {
            limit,
            committed: 0,
        }
    }

    /// Charges `pages`, returning false without side effects if the limit cannot absorb them.
    pub fn charge(&mut self, pages: usize) -> bool {
        match self.committed.checked_add(pages) {
            Some(total) if total <= self.limit => {
                self.committed = total;
                true
            }
            _ => false,
        }
    }

    /// Returns a previous charge.
    pub fn uncharge(&mut self, pages: usize) {
        assert!(pages <= self.committed, "commit charge underflow");
        self.committed -= pages;
    }

    /// Returns the number of committed pages.
    pub const fn committed(&self) -> usize {
        self.committed
    }
}

/// State protected by the frame lock.
pub struct FrameDatabase {
    directory: FrameDirectory,
    clones: CloneRegistry,
    commit: CommitLedger,
}

impl FrameDatabase {
    /// Creates a database for `managed_frames` frames with the given commit limit.
    pub fn new(managed_frames: usize, commit_limit: usize) -> Self {
        Self {
            directory: FrameDirectory::new(managed_frames),
            clones: CloneRegistry::new(),
            commit: CommitLedger::new(commit_limit),
        }
    }

    pub fn directory(&self) -> &FrameDirectory {
        &self.directory
    }

    pub fn directory_mut(&mut self) -> &mut FrameDirectory {
        &mut self.directory
    }

    pub fn clones(&self) -> &CloneRegistry {
        &self.clones
    }

    pub fn clones_mut(&mut self) -> &mut CloneRegistry {
        &mut self.clones
    }

    pub fn commit(&self) -> &CommitLedger {
        &self.commit
    }

    pub fn commit_mut(&mut self) -> &mut CommitLedger {
        &mut self.commit
    }

    /// Removes a frame from the free pool and installs `descriptor` for it.
    pub fn allocate(
        &mut self,
        env: &Collaborators,
        color_hint: usize,
        descriptor: impl FnOnce(FrameNumber) -> FrameDescriptor,
    ) -> Option<FrameNumber> {
        let frame = env.frames.remove_free_frame(color_hint)?;
        self.directory.insert(frame, descriptor(frame));
        Some(frame)
    }

    /// Drops one share of `frame`, freeing it at zero.
    ///
    /// Unmanaged frames are ignored.
    pub fn drop_share(&mut self, frame: FrameNumber, env: &Collaborators) -> Option<ShareRelease> {
        let release = self.directory.decrement_share(frame)?;
        if let ShareRelease::Free(descriptor) = release {
            Self::free(frame, &descriptor, env);
        }
        Some(release)
    }

    /// Returns a frame whose descriptor has been removed to the free pool.
    fn free(frame: FrameNumber, descriptor: &FrameDescriptor, env: &Collaborators) {
        if let Backing::PageFile(slot) = descriptor.backing {
            log::trace!("frame {frame} freed, releasing {slot:?}");
            env.paging.release_reservation(slot);
        }
        env.frames.return_free_frame(frame);
    }

    /// Ends a write-back of `frame` into `slot`. Returns true if the frame was freed.
    ///
    /// Returns `None` if no write-back of `frame` is in flight.
    pub fn finish_write_back(
        &mut self,
        frame: FrameNumber,
        slot: PageFileSlot,
        env: &Collaborators,
    ) -> Option<bool> {
        let descriptor = self
            .directory
            .get_mut(frame)
            .filter(|d| d.write_in_progress)?;
        descriptor.write_in_progress = false;
        match descriptor.backing {
            // Shared through a clone since the write started; the clone owns the backing.
            Backing::Clone(_) => env.paging.release_reservation(slot),
            previous => {
                descriptor.backing = Backing::PageFile(slot);
                if let Backing::PageFile(old) = previous {
                    if old != slot {
                        env.paging.release_reservation(old);
                    }
                }
            }
        }
        if descriptor.pending_free {
            if let Some(descriptor) = self.directory.remove(frame) {
                Self::free(frame, &descriptor, env);
            }
            return Some(true);
        }
        if descriptor.modified && descriptor.backing == Backing::PageFile(slot) {
            // Dirtied while the write was in flight; the written copy is already stale.
            descriptor.backing = Backing::Demand;
            env.paging.release_reservation(slot);
        }
        Some(false)
    }
}

/// Drops the reference a translation entry held on `frame`.
///
/// If the frame is shared through a clone descriptor, the clone loses a sharer too. Releasing
/// a clone at zero releases its backing with the frame lock dropped, so the returned guard
/// may come from a fresh acquisition.
pub(crate) fn release_entry_reference<'a>(
    lock: &'a Mutex<FrameDatabase>,
    mut frames: FrameLockGuard<'a>,
    frame: FrameNumber,
    env: &Collaborators,
) -> FrameLockGuard<'a> {
    let clone = match frames.directory().get(frame).map(|d| d.backing) {
        Some(Backing::Clone(id)) => Some(id),
        Some(_) => None,
        None => return frames,
    };
    frames.drop_share(frame, env);
    if let Some(id) = clone {
        if let Some(released) = frames.clones_mut().dereference(id) {
            log::trace!("{id:?} released");
            frames = release_clone(lock, frames, released, env);
        }
    }
    frames
}

/// Releases a clone descriptor whose reference count reached zero.
fn release_clone<'a>(
    lock: &'a Mutex<FrameDatabase>,
    frames: FrameLockGuard<'a>,
    clone: CloneDescriptor,
    env: &Collaborators,
) -> FrameLockGuard<'a> {
    let mut frames = match clone.backing {
        Backing::PageFile(slot) => {
            drop(frames);
            env.paging.release_reservation(slot);
            lock.lock()
        }
        _ => frames,
    };
    frames.drop_share(clone.frame, env);
    frames
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        FrameAllocator, Owner, PageFileLedger, PageNumber, SpaceId, external::FreeFrameList,
    };
    use alloc::sync::Arc;

    fn env() -> (Collaborators, Arc<FreeFrameList>, Arc<PageFileLedger>) {
        let frames = Arc::new(FreeFrameList::new(0..8));
        let paging = Arc::new(PageFileLedger::new());
        let env = Collaborators::new(
            frames.clone(),
            paging.clone(),
            Arc::new(crate::WorkingSetIndex::new()),
        );
        (env, frames, paging)
    }

    fn page_owner() -> Owner {
        Owner::Mapping {
            space: SpaceId::new(1),
            page: PageNumber::new(0),
        }
    }

    #[test]
    fn commit_charge_is_all_or_nothing() {
        let mut ledger = CommitLedger::new(5);
        assert!(ledger.charge(4));
        assert!(!ledger.charge(2));
        assert_eq!(ledger.committed(), 4);
        ledger.uncharge(4);
        assert_eq!(ledger.committed(), 0);
    }

    #[test]
    fn freeing_releases_page_file_backing() {
        let (env, frames, paging) = env();
        let slot = paging.reserve();
        let mut db = FrameDatabase::new(8, 16);
        let frame = db
            .allocate(&env, 0, |f| FrameDescriptor::new(f, page_owner(), Backing::PageFile(slot)))
            .unwrap();
        assert_eq!(frames.available_frames(), 7);
        assert!(matches!(db.drop_share(frame, &env), Some(ShareRelease::Free(_))));
        assert_eq!(frames.available_frames(), 8);
        assert_eq!(paging.release_count(), 1);
    }

    #[test]
    fn clone_release_drops_its_frame_share() {
        let (env, frames, paging) = env();
        let lock = Mutex::new(FrameDatabase::new(8, 16));
        let slot = paging.reserve();
        let frame = {
            let mut db = lock.lock();
            let frame = db
                .allocate(&env, 0, |f| FrameDescriptor::new(f, page_owner(), Backing::Demand))
                .unwrap();
            let id = db.clones_mut().create(frame, Backing::PageFile(slot), 2);
            let desc = db.directory_mut().get_mut(frame).unwrap();
            desc.owner = Owner::Clone(id);
            desc.backing = Backing::Clone(id);
            desc.share_count = 3;
            frame
        };

        let db = release_entry_reference(&lock, lock.lock(), frame, &env);
        assert_eq!(db.directory().get(frame).unwrap().share_count, 2);
        let db = release_entry_reference(&lock, db, frame, &env);
        assert!(db.directory().get(frame).is_none());
        assert!(db.clones().is_empty());
        drop(db);
        assert_eq!(paging.release_count(), 1);
        assert_eq!(frames.available_frames(), 8);
    }

    #[test]
    fn write_back_completion_frees_pending_frame() {
        let (env, frames, paging) = env();
        let mut db = FrameDatabase::new(8, 16);
        let frame = db
            .allocate(&env, 0, |f| FrameDescriptor::new(f, page_owner(), Backing::Demand))
            .unwrap();
        db.directory_mut().get_mut(frame).unwrap().write_in_progress = true;
        assert_eq!(db.drop_share(frame, &env), Some(ShareRelease::Deferred));
        assert_eq!(frames.available_frames(), 7);

        let slot = paging.reserve();
        assert_eq!(db.finish_write_back(frame, slot, &env), Some(true));
        assert_eq!(frames.available_frames(), 8);
        assert!(!paging.is_reserved(slot));
    }

    #[test]
    fn write_back_of_redirtied_frame_drops_new_slot() {
        let (env, _frames, paging) = env();
        let mut db = FrameDatabase::new(8, 16);
        let frame = db
            .allocate(&env, 0, |f| FrameDescriptor::new(f, page_owner(), Backing::Demand))
            .unwrap();
        let desc = db.directory_mut().get_mut(frame).unwrap();
        desc.write_in_progress = true;
        desc.modified = true;

        let slot = paging.reserve();
        assert_eq!(db.finish_write_back(frame, slot, &env), Some(false));
        assert_eq!(db.directory().get(frame).unwrap().backing, Backing::Demand);
        assert!(!paging.is_reserved(slot));
    }
}
