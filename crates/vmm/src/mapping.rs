//! Installing and removing page mappings.

use crate::{
    AddressSpace, Backing, CowState, EntryFlags, Exhaustion, FrameDescriptor, FrameNumber, Owner,
    PageFileSlot, SpaceId, TranslationEntry, VirtualAddress, Vmm, VmmError, WorkingSet, arch,
    config::CACHE_COLORS, database::release_entry_reference, translation::EntryLocation,
    vmm::TABLE_FLAGS,
};

/// What a new page mapping is backed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageMapping {
    /// A private demand-zero page.
    Zeroed { writable: bool },
    /// A page read back from the paging file. Starts clean, so the first write raises a
    /// dirty-bit fault.
    PageFile { slot: PageFileSlot, writable: bool },
    /// A page of an executable image, mapped copy-on-write.
    Image,
}

impl PageMapping {
    fn backing(self) -> Backing {
        match self {
            Self::Zeroed { .. } => Backing::Demand,
            Self::PageFile { slot, .. } => Backing::PageFile(slot),
            Self::Image => Backing::Image,
        }
    }

    fn entry(self, frame: FrameNumber) -> TranslationEntry {
        let base = EntryFlags::VALID | EntryFlags::ACCESSED;
        match self {
            Self::Zeroed { writable: true } => {
                TranslationEntry::new(frame, base | EntryFlags::WRITE | EntryFlags::DIRTY)
            }
            Self::PageFile { writable: true, .. } => {
                TranslationEntry::new(frame, base | EntryFlags::WRITE)
            }
            Self::Zeroed { writable: false } | Self::PageFile { writable: false, .. } => {
                TranslationEntry::new(frame, base)
            }
            Self::Image => TranslationEntry::new(frame, base).with_copy_on_write(CowState::Shared),
        }
    }
}

/// Returns the flags distinguishing user-range from system-range mappings.
fn range_flags(va: VirtualAddress) -> EntryFlags {
    if va.is_system() {
        EntryFlags::GLOBAL
    } else {
        EntryFlags::USER
    }
}

impl Vmm {
    /// Returns the location of the leaf entry for `va` in `owner`, creating the user leaf
    /// table if needed. System tables are never created here.
    ///
    /// Requires the working-set lock of `owner`.
    pub(crate) fn ensure_leaf_table(
        &self,
        owner: &AddressSpace,
        working_set: &mut WorkingSet,
        va: VirtualAddress,
    ) -> Result<EntryLocation, VmmError> {
        let map = owner.translation(self.memory());
        if let Some(location) = map.locate(va) {
            return Ok(location);
        }
        if !va.is_user() {
            return Err(VmmError::InvalidAddress);
        }
        let table = {
            let mut frames = self.lock_frames();
            if !frames.commit_mut().charge(1) {
                return Err(VmmError::ResourceExhaustion(Exhaustion::Commit));
            }
            let color = va.top_level_slot() % CACHE_COLORS;
            match frames.allocate(self.collaborators(), color, |f| {
                FrameDescriptor::table(f, owner.id())
            }) {
                Some(table) => table,
                None => {
                    frames.commit_mut().uncharge(1);
                    return Err(VmmError::ResourceExhaustion(Exhaustion::Frames));
                }
            }
        };
        self.memory().zero(table);
        map.set_top_entry(
            va.top_level_slot(),
            TranslationEntry::new(table, TABLE_FLAGS | EntryFlags::USER),
        );
        working_set.add_leaf_table();
        log::trace!("{:?}: leaf table {table} for slot {}", owner.id(), va.top_level_slot());
        Ok(EntryLocation::new(table, va.table_index(0)))
    }

    /// Maps a fresh frame at `va`. System-range addresses are mapped in the reference address
    /// space and become visible to every address space.
    pub fn map_page(
        &self,
        space: &AddressSpace,
        va: VirtualAddress,
        mapping: PageMapping,
    ) -> Result<FrameNumber, VmmError> {
        if !va.is_aligned(arch::PAGE_SIZE) {
            return Err(VmmError::InvalidAddress);
        }
        let owner = self.owner_of(space, va)?;
        let mut ws = owner.lock_working_set();
        let location = self.ensure_leaf_table(owner, &mut ws, va)?;
        let map = owner.translation(self.memory());
        if map.read(location).is_valid() {
            return Err(VmmError::AlreadyMapped);
        }

        let page = va.page_number();
        let ws_index = self.collaborators().working_set.track(owner.id(), page);
        let frame = self.lock_frames().allocate(
            self.collaborators(),
            page.as_usize() % CACHE_COLORS,
            |frame| {
                let mut descriptor = FrameDescriptor::new(
                    frame,
                    Owner::Mapping {
                        space: owner.id(),
                        page,
                    },
                    mapping.backing(),
                );
                descriptor.ws_index = Some(ws_index);
                descriptor.modified = matches!(mapping, PageMapping::Zeroed { writable: true });
                descriptor
            },
        );
        let Some(frame) = frame else {
            self.collaborators().working_set.forget(owner.id(), page);
            return Err(VmmError::ResourceExhaustion(Exhaustion::Frames));
        };
        self.memory().zero(frame);
        map.install(location, mapping.entry(frame).with_flags(range_flags(va)));
        ws.add_resident();
        log::trace!("{:?}: mapped {va} to frame {frame} ({mapping:?})", owner.id());
        Ok(frame)
    }

    /// Maps an unmanaged frame, such as device memory, at `va`.
    ///
    /// The frame gets no descriptor and no working-set tracking. The entry starts dirty since
    /// such frames have no backing to keep clean against.
    pub fn map_io_frame(
        &self,
        space: &AddressSpace,
        va: VirtualAddress,
        frame: FrameNumber,
        writable: bool,
    ) -> Result<(), VmmError> {
        let managed = self.config().managed_frames;
        if frame.as_usize() < managed || frame.as_usize() >= self.config().total_frames() {
            return Err(VmmError::InvalidFrame);
        }
        if !va.is_aligned(arch::PAGE_SIZE) {
            return Err(VmmError::InvalidAddress);
        }
        let owner = self.owner_of(space, va)?;
        let mut ws = owner.lock_working_set();
        let location = self.ensure_leaf_table(owner, &mut ws, va)?;
        let map = owner.translation(self.memory());
        if map.read(location).is_valid() {
            return Err(VmmError::AlreadyMapped);
        }
        let mut flags = EntryFlags::VALID | EntryFlags::ACCESSED | EntryFlags::DIRTY;
        if writable {
            flags |= EntryFlags::WRITE;
        }
        map.install(location, TranslationEntry::new(frame, flags | range_flags(va)));
        Ok(())
    }

    /// Removes the mapping at `va`, dropping its reference on the frame.
    pub fn unmap(&self, space: &AddressSpace, va: VirtualAddress) -> Result<(), VmmError> {
        let owner = self.owner_of(space, va)?;
        let mut ws = owner.lock_working_set();
        let map = owner.translation(self.memory());
        let location = map.locate(va).ok_or(VmmError::NotMapped)?;
        let entry = map.clear(location);
        if !entry.is_valid() {
            return Err(VmmError::NotMapped);
        }
        self.tlb()
            .invalidate(self.flush_scope(owner, va), va.page_number());
        self.release_page(owner.id(), &mut ws, va, entry);
        Ok(())
    }

    /// Drops everything a cleared, previously valid entry held.
    pub(crate) fn release_page(
        &self,
        owner: SpaceId,
        working_set: &mut WorkingSet,
        va: VirtualAddress,
        entry: TranslationEntry,
    ) {
        let frames = self.lock_frames();
        if frames.directory().get(entry.frame()).is_none() {
            return;
        }
        let frames =
            release_entry_reference(self.frame_lock(), frames, entry.frame(), self.collaborators());
        drop(frames);
        self.collaborators()
            .working_set
            .forget(owner, va.page_number());
        working_set.remove_resident();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CpuId, VmmConfig, test_support::reference_vmm};

    const VA: VirtualAddress = VirtualAddress::new(0x200);

    #[test]
    fn map_and_unmap_private_page() {
        let vmm = reference_vmm(VmmConfig::default());
        let space = vmm.create_address_space(CpuId::new(0), 0).unwrap();
        let committed = vmm.committed_pages();
        let frame = vmm
            .map_page(&space, VA, PageMapping::Zeroed { writable: true })
            .unwrap();
        assert_eq!(vmm.committed_pages(), committed + 1, "leaf table charged");

        let descriptor = vmm.frame_descriptor(frame).unwrap();
        assert_eq!(descriptor.share_count, 1);
        assert!(descriptor.ws_index.is_some());
        let entry = space.translation(vmm.memory()).translate(VA).unwrap().1;
        assert!(entry.is_writable() && entry.is_dirty());
        assert!(entry.flags().contains(EntryFlags::USER));
        assert_eq!(space.lock_working_set().resident(), 1);

        assert_eq!(
            vmm.map_page(&space, VA, PageMapping::Zeroed { writable: true }),
            Err(VmmError::AlreadyMapped)
        );
        vmm.unmap(&space, VA).unwrap();
        assert!(vmm.frame_descriptor(frame).is_none());
        assert_eq!(vmm.unmap(&space, VA), Err(VmmError::NotMapped));
        assert_eq!(space.lock_working_set().resident(), 0);
    }

    #[test]
    fn image_pages_are_copy_on_write() {
        let vmm = reference_vmm(VmmConfig::default());
        let space = vmm.create_address_space(CpuId::new(0), 0).unwrap();
        vmm.map_page(&space, VA, PageMapping::Image).unwrap();
        let entry = space.translation(vmm.memory()).translate(VA).unwrap().1;
        assert_eq!(entry.copy_on_write(), CowState::Shared);
        assert!(!entry.is_writable());
    }

    #[test]
    fn rejects_bad_addresses_and_frames() {
        let vmm = reference_vmm(VmmConfig::default());
        let space = vmm.create_address_space(CpuId::new(0), 0).unwrap();
        let window = VirtualAddress::new(arch::slot_base(arch::WINDOW_SLOT));
        let pool = VirtualAddress::new(arch::slot_base(arch::SYSTEM_WINDOW_SLOT));
        let ungrown = VirtualAddress::new(arch::slot_base(13));
        let zeroed = PageMapping::Zeroed { writable: false };
        assert_eq!(vmm.map_page(&space, window, zeroed), Err(VmmError::InvalidAddress));
        assert_eq!(vmm.map_page(&space, pool, zeroed), Err(VmmError::InvalidAddress));
        assert_eq!(vmm.map_page(&space, ungrown, zeroed), Err(VmmError::InvalidAddress));
        assert_eq!(
            vmm.map_page(&space, VirtualAddress::new(0x204), zeroed),
            Err(VmmError::InvalidAddress)
        );
        assert_eq!(
            vmm.map_io_frame(&space, VA, FrameNumber::new(3), true),
            Err(VmmError::InvalidFrame)
        );
    }

    #[test]
    fn io_frames_have_no_descriptor() {
        let vmm = reference_vmm(VmmConfig::default());
        let space = vmm.create_address_space(CpuId::new(0), 0).unwrap();
        let io = FrameNumber::new(vmm.config().managed_frames);
        vmm.map_io_frame(&space, VA, io, true).unwrap();
        assert!(vmm.frame_descriptor(io).is_none());
        vmm.unmap(&space, VA).unwrap();
    }

    #[test]
    fn system_pages_are_global() {
        let vmm = reference_vmm(VmmConfig::default());
        let space = vmm.create_address_space(CpuId::new(0), 0).unwrap();
        let va = VirtualAddress::new(arch::slot_base(arch::SYSTEM_DATA_SLOT));
        let frame = vmm
            .map_page(&space, va, PageMapping::Zeroed { writable: true })
            .unwrap();
        let entry = space.translation(vmm.memory()).translate(va).unwrap().1;
        assert_eq!(entry.frame(), frame);
        assert!(entry.flags().contains(EntryFlags::GLOBAL));
        assert_eq!(
            vmm.frame_descriptor(frame).map(|d| d.owner),
            Some(Owner::Mapping {
                space: SpaceId::SYSTEM,
                page: va.page_number()
            })
        );
    }
}
