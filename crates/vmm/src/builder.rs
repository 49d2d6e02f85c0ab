//! Address space construction and teardown.
//!
//! Creating an address space charges its commit, takes four zero-filled frames (top-level
//! table, transient window table, working-set bitmap, working-set list), wires the top-level
//! table through a transient mapping and registers the result. Registration happens under the
//! expansion lock, and a system-range growth that raced with the copy of the system slots is
//! caught there by comparing generations, so no concurrent remap is ever missed.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::{
    AddressSpace, CpuId, Exhaustion, FrameDescriptor, FrameNumber, SpaceId, StructuralFrames,
    TranslationEntry, Vmm, VmmError, arch,
    config::PROCESS_COMMIT_CHARGE,
    database::release_entry_reference,
    translation::EntryLocation,
    vmm::TABLE_FLAGS,
};

impl Vmm {
    /// Creates a new address space.
    ///
    /// Fails with [`VmmError::ResourceExhaustion`] and no side effects if the commit limit
    /// cannot absorb [`PROCESS_COMMIT_CHARGE`] pages, if no more than `minimum_working_set`
    /// frames are free, or if the allocator runs dry for good.
    pub fn create_address_space(
        &self,
        cpu: CpuId,
        minimum_working_set: usize,
    ) -> Result<Arc<AddressSpace>, VmmError> {
        let id = self.registry().allocate_id();
        let frames = self.take_structural_frames(id, minimum_working_set)?;
        for frame in frames.to_array() {
            self.memory().zero(frame);
        }

        let preempt = self.cpus().disable_preemption(cpu);
        let synced = self.registry().generation();
        {
            let reference = self.system_space().translation(self.memory());
            let top = self.map_transient(&preempt, frames.top_level, self.system_space());
            for slot in arch::SYSTEM_SLOTS {
                top.write_entry(slot, reference.top_entry(slot));
            }
            top.write_entry(
                arch::WINDOW_SLOT,
                TranslationEntry::new(frames.window_table, TABLE_FLAGS),
            );
            for slot in arch::WINDOW_GROWTH_SLOTS {
                top.write_entry(slot, TranslationEntry::EMPTY);
            }
            top.write_entry(
                arch::SELF_MAP_SLOT,
                TranslationEntry::new(frames.top_level, TABLE_FLAGS),
            );
        }
        {
            let window = self.map_transient(&preempt, frames.window_table, self.system_space());
            window.write_entry(
                arch::WORKING_SET_BITMAP_INDEX,
                TranslationEntry::new(frames.working_set_bitmap, TABLE_FLAGS),
            );
            window.write_entry(
                arch::WORKING_SET_LIST_INDEX,
                TranslationEntry::new(frames.working_set_list, TABLE_FLAGS),
            );
        }

        let space = Arc::new(AddressSpace::new(id, frames, minimum_working_set, synced));
        {
            let mut expansion = self.registry().lock_expansion();
            expansion.push(space.clone());
            if self.registry().generation() != synced {
                self.propagate_system_mappings(&preempt, &expansion, &space);
            }
        }
        log::debug!(
            "created {id:?}: top level {}, window table {}",
            frames.top_level,
            frames.window_table
        );
        Ok(space)
    }

    /// Charges the process commit and takes the four structural frames.
    fn take_structural_frames(
        &self,
        id: SpaceId,
        minimum_working_set: usize,
    ) -> Result<StructuralFrames, VmmError> {
        let env = self.collaborators();
        let mut frames = self.lock_frames();
        if !frames.commit_mut().charge(PROCESS_COMMIT_CHARGE) {
            log::warn!("{id:?}: commit limit reached");
            return Err(VmmError::ResourceExhaustion(Exhaustion::Commit));
        }
        if env.frames.available_frames() <= minimum_working_set {
            frames.commit_mut().uncharge(PROCESS_COMMIT_CHARGE);
            log::warn!(
                "{id:?}: {} free frames, minimum working set {minimum_working_set}",
                env.frames.available_frames()
            );
            return Err(VmmError::ResourceExhaustion(Exhaustion::Frames));
        }

        let mut taken: Vec<FrameNumber> = Vec::with_capacity(PROCESS_COMMIT_CHARGE);
        while taken.len() < PROCESS_COMMIT_CHARGE {
            let table = |frame| FrameDescriptor::table(frame, id);
            if let Some(frame) = frames.allocate(env, taken.len(), table) {
                taken.push(frame);
                continue;
            }
            drop(frames);
            let more = env.frames.wait_for_frames(PROCESS_COMMIT_CHARGE - taken.len());
            frames = self.lock_frames();
            if !more {
                for frame in taken {
                    frames.drop_share(frame, env);
                }
                frames.commit_mut().uncharge(PROCESS_COMMIT_CHARGE);
                log::warn!("{id:?}: out of frames while building address space");
                return Err(VmmError::ResourceExhaustion(Exhaustion::Frames));
            }
        }
        Ok(StructuralFrames {
            top_level: taken[0],
            window_table: taken[1],
            working_set_bitmap: taken[2],
            working_set_list: taken[3],
        })
    }

    /// Tears down an address space: unregisters it, releases every user mapping and leaf
    /// table, frees the structural frames and returns the commit charge.
    pub fn destroy_address_space(&self, space: Arc<AddressSpace>) -> Result<(), VmmError> {
        if space.id() == SpaceId::SYSTEM {
            return Err(VmmError::InvalidAddress);
        }
        {
            let mut expansion = self.registry().lock_expansion();
            let index = expansion
                .iter()
                .position(|s| s.id() == space.id())
                .ok_or(VmmError::NotMapped)?;
            expansion.swap_remove(index);
        }

        let env = self.collaborators();
        let mut ws = space.lock_working_set();
        let map = space.translation(self.memory());
        let mut leaf_tables = 0;
        for slot in arch::USER_SLOTS {
            let top = map.top_entry(slot);
            if !top.is_valid() {
                continue;
            }
            for index in 0..arch::ENTRIES_PER_TABLE {
                let entry = map.clear(EntryLocation::new(top.frame(), index));
                if !entry.is_valid() {
                    continue;
                }
                let page = crate::VirtualAddress::new(arch::entry_va(slot, index)).page_number();
                env.working_set.forget(space.id(), page);
                let frames = self.lock_frames();
                drop(release_entry_reference(self.frame_lock(), frames, entry.frame(), env));
            }
            map.set_top_entry(slot, TranslationEntry::EMPTY);
            self.lock_frames().drop_share(top.frame(), env);
            leaf_tables += 1;
        }
        ws.clear();
        drop(ws);
        self.tlb().flush_space(space.id());

        let mut frames = self.lock_frames();
        for frame in space.structural_frames().to_array() {
            frames.drop_share(frame, env);
        }
        frames
            .commit_mut()
            .uncharge(PROCESS_COMMIT_CHARGE + leaf_tables);
        log::debug!("destroyed {:?}", space.id());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FrameAllocator, PageMapping, VirtualAddress, VmmConfig, test_support::*};

    #[test]
    fn new_space_is_wired() {
        let vmm = reference_vmm(VmmConfig::default());
        let space = vmm.create_address_space(CpuId::new(0), 4).unwrap();
        let map = space.translation(vmm.memory());
        let frames = space.structural_frames();
        assert_eq!(map.table_as_data(arch::SELF_MAP_SLOT), Some(frames.top_level));
        assert_eq!(map.table_as_data(arch::WINDOW_SLOT), Some(frames.window_table));
        for slot in arch::WINDOW_GROWTH_SLOTS.chain(arch::USER_SLOTS) {
            assert!(!map.top_entry(slot).is_valid(), "slot {slot}");
        }
        let bitmap = map
            .translate(VirtualAddress::new(arch::entry_va(
                arch::WINDOW_SLOT,
                arch::WORKING_SET_BITMAP_INDEX,
            )))
            .unwrap()
            .1;
        assert_eq!(bitmap.frame(), frames.working_set_bitmap);
        assert!(vmm.registry().contains(space.id()));
        assert_eq!(space.synced_generation(), vmm.registry().generation());
    }

    #[test]
    fn system_slots_match_reference() {
        let vmm = reference_vmm(VmmConfig::default());
        vmm.grow_system_range(13).unwrap();
        let space = vmm.create_address_space(CpuId::new(1), 0).unwrap();
        let reference = vmm.system_space().translation(vmm.memory());
        let map = space.translation(vmm.memory());
        for slot in arch::SYSTEM_SLOTS {
            assert_eq!(map.top_entry(slot).as_raw(), reference.top_entry(slot).as_raw());
        }
    }

    #[test]
    fn commit_exhaustion_has_no_side_effects() {
        let config = VmmConfig {
            commit_limit: 8,
            ..VmmConfig::default()
        };
        let vmm = reference_vmm(config);
        let available = vmm.collaborators().frames.available_frames();
        assert_eq!(
            vmm.create_address_space(CpuId::new(0), 0).err(),
            Some(VmmError::ResourceExhaustion(Exhaustion::Commit))
        );
        assert!(vmm.registry().is_empty());
        assert_eq!(vmm.collaborators().frames.available_frames(), available);
    }

    #[test]
    fn destroy_returns_everything() {
        let vmm = reference_vmm(VmmConfig::default());
        let available = vmm.collaborators().frames.available_frames();
        let committed = vmm.committed_pages();
        let space = vmm.create_address_space(CpuId::new(0), 0).unwrap();
        for n in 0..3 {
            let va = VirtualAddress::new(arch::entry_va(n, 1));
            vmm.map_page(&space, va, PageMapping::Zeroed { writable: true })
                .unwrap();
        }
        vmm.destroy_address_space(space.clone()).unwrap();
        assert_eq!(vmm.collaborators().frames.available_frames(), available);
        assert_eq!(vmm.committed_pages(), committed);
        assert!(vmm.registry().is_empty());
        assert_eq!(
            vmm.destroy_address_space(space),
            Err(VmmError::NotMapped)
        );
    }

    #[test]
    fn system_space_cannot_be_destroyed() {
        let vmm = reference_vmm(VmmConfig::default());
        assert_eq!(
            vmm.destroy_address_space(vmm.system_space().clone()),
            Err(VmmError::InvalidAddress)
        );
    }
}
