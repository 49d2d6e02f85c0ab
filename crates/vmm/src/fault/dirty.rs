//! Dirty-bit faults.

use crate::{
    AddressSpace, Backing, EntryFlags, FlushScope, FrameLockGuard, PreemptionGuard,
    VirtualAddress, Vmm, WorkingSet,
};

use super::bump;

impl Vmm {
    /// Resolves a write through a writable entry that is not yet dirty.
    ///
    /// Returns false if the entry is missing or maps a frame without a descriptor, which the
    /// caller must treat as unserviceable. With the frame lock held, a paging file copy of a
    /// page-file-backed frame is released since the in-memory copy is now authoritative, and
    /// the frame is marked modified. The local cached translation is always invalidated.
    ///
    /// Requires the working-set lock of `owner`.
    pub fn resolve_write_fault(
        &self,
        preempt: &PreemptionGuard<'_>,
        owner: &AddressSpace,
        _working_set: &mut WorkingSet,
        va: VirtualAddress,
        frame_lock: Option<&mut FrameLockGuard<'_>>,
    ) -> bool {
        let map = owner.translation(self.memory());
        let Some((location, entry)) = map.translate(va).filter(|(_, entry)| entry.is_valid())
        else {
            return false;
        };
        let frame = entry.frame();
        let managed = match &frame_lock {
            Some(frames) => frames.directory().get(frame).is_some(),
            None => frame.as_usize() < self.config().managed_frames,
        };
        if !managed {
            return false;
        }

        map.set_flags(location, EntryFlags::DIRTY | EntryFlags::ACCESSED);
        if let Some(frames) = frame_lock {
            let released = frames.directory_mut().get_mut(frame).and_then(|descriptor| {
                descriptor.modified = true;
                match descriptor.backing {
                    Backing::PageFile(slot) if !descriptor.write_in_progress => {
                        descriptor.backing = Backing::Demand;
                        Some(slot)
                    }
                    _ => None,
                }
            });
            if let Some(slot) = released {
                self.collaborators().paging.release_reservation(slot);
                bump(&self.counters().page_file_releases);
                log::trace!("frame {frame} dirtied, released {slot:?}");
            }
        }
        self.tlb()
            .invalidate(FlushScope::Cpu(preempt.cpu()), va.page_number());
        true
    }
}
