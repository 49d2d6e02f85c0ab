//! Structural duplication and protection-change privatisation.
//!
//! Duplicating a range shares every mapped page of the parent with the child. A private page
//! becomes clone-backed: a [`CloneDescriptor`](crate::CloneDescriptor) takes over its backing
//! and counts the two mappings, and writable mappings on both sides turn copy-on-write. While
//! the duplication runs the parent is flagged, so copy-on-write faults against it retry
//! instead of racing the conversion.

use core::ops::Range;

use crate::{
    AddressSpace, Backing, CowState, CpuId, FaultStatus, FlushScope, Owner, VirtualAddress, Vmm,
    VmmError, arch, fault::CopyOutcome,
};

impl Vmm {
    /// Shares every mapped page of `range` in `parent` with `child`.
    ///
    /// `range` must be page aligned and lie in the user range, and `child` must not have
    /// anything mapped there. Returns the number of pages shared.
    pub fn duplicate(
        &self,
        parent: &AddressSpace,
        child: &AddressSpace,
        range: Range<VirtualAddress>,
    ) -> Result<usize, VmmError> {
        let user_end = arch::slot_base(arch::USER_SLOTS.end);
        if parent.id() == child.id()
            || range.start > range.end
            || !range.start.is_aligned(arch::PAGE_SIZE)
            || !range.end.is_aligned(arch::PAGE_SIZE)
            || range.end.as_usize() > user_end
        {
            return Err(VmmError::InvalidAddress);
        }

        let _duplication = parent.begin_duplication();
        let mut shared = 0;
        let mut va = range.start;
        while va < range.end {
            if self.duplicate_page(parent, child, va)? {
                shared += 1;
            }
            va = va + arch::PAGE_SIZE;
        }
        log::debug!(
            "duplicated {shared} pages of {:?} into {:?} ({}..{})",
            parent.id(),
            child.id(),
            range.start,
            range.end
        );
        Ok(shared)
    }

    fn duplicate_page(
        &self,
        parent: &AddressSpace,
        child: &AddressSpace,
        va: VirtualAddress,
    ) -> Result<bool, VmmError> {
        let _parent_ws = parent.lock_working_set();
        let parent_map = parent.translation(self.memory());
        let Some((location, entry)) = parent_map
            .translate(va)
            .filter(|(_, entry)| entry.is_valid())
        else {
            return Ok(false);
        };

        let mut child_ws = child.lock_working_set();
        let child_location = self.ensure_leaf_table(child, &mut child_ws, va)?;
        let child_map = child.translation(self.memory());
        if child_map.read(child_location).is_valid() {
            return Err(VmmError::AlreadyMapped);
        }

        let frame = entry.frame();
        let managed = {
            let mut frames = self.lock_frames();
            match frames.directory().get(frame).copied() {
                None => false,
                Some(descriptor) => {
                    match descriptor.backing {
                        Backing::Clone(id) => {
                            frames.clones_mut().add_reference(id);
                            frames.directory_mut().increment_share(frame);
                        }
                        backing => {
                            let id = frames.clones_mut().create(frame, backing, 2);
                            if let Some(descriptor) = frames.directory_mut().get_mut(frame) {
                                descriptor.owner = Owner::Clone(id);
                                descriptor.backing = Backing::Clone(id);
                                descriptor.share_count += 2;
                            }
                            log::trace!("frame {frame} now shared through {id:?}");
                        }
                    }
                    true
                }
            }
        };

        let page = va.page_number();
        let shared = if managed && entry.is_writable() {
            entry.with_copy_on_write(CowState::Shared)
        } else {
            entry
        };
        if shared != entry {
            parent_map.install(location, shared);
            self.tlb().invalidate(FlushScope::Process(parent.id()), page);
        }
        child_map.install(child_location, shared);
        if managed {
            self.collaborators().working_set.track(child.id(), page);
            child_ws.add_resident();
        }
        Ok(true)
    }

    /// Gives `space` a private, read-only copy of the shared copy-on-write page at `va`, as a
    /// protection change on a shared page does.
    ///
    /// Waits out retries. Returns the handler's final status, which is a
    /// [`FaultStatus::Retry`] only if frames ran out for good.
    pub fn privatize_shared_page(
        &self,
        cpu: CpuId,
        space: &AddressSpace,
        va: VirtualAddress,
    ) -> Result<FaultStatus<CopyOutcome>, VmmError> {
        let owner = self.owner_of(space, va)?;
        loop {
            let status = {
                let preempt = self.cpus().disable_preemption(cpu);
                let mut ws = owner.lock_working_set();
                let map = owner.translation(self.memory());
                let (location, entry) = map
                    .translate(va)
                    .filter(|(_, entry)| entry.is_valid())
                    .ok_or(VmmError::NotMapped)?;
                match entry.copy_on_write() {
                    CowState::None => return Err(VmmError::InvalidFrame),
                    CowState::Shared => {
                        map.install(location, entry.with_copy_on_write(CowState::Reprotect));
                    }
                    CowState::Reprotect => {}
                }
                self.resolve_copy_on_write(&preempt, owner, &mut ws, va)
            };
            match status {
                FaultStatus::Retry(reason) => {
                    if !self.wait_out(owner, reason) {
                        return Ok(status);
                    }
                }
                status => return Ok(status),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        Access, CpuId, FaultOutcome, PageMapping, VmmConfig, WorkingSetTracker,
        test_support::reference_vmm,
    };

    const VA: VirtualAddress = VirtualAddress::new(0x280);

    fn user_range() -> Range<VirtualAddress> {
        VirtualAddress::new(0)..VirtualAddress::new(arch::slot_base(arch::USER_SLOTS.end))
    }

    #[test]
    fn private_page_becomes_clone_backed() {
        let vmm = reference_vmm(VmmConfig::default());
        let cpu = CpuId::new(0);
        let parent = vmm.create_address_space(cpu, 0).unwrap();
        let child = vmm.create_address_space(cpu, 0).unwrap();
        let frame = vmm
            .map_page(&parent, VA, PageMapping::Zeroed { writable: true })
            .unwrap();

        assert_eq!(vmm.duplicate(&parent, &child, user_range()), Ok(1));
        assert!(!parent.is_duplicating());

        let descriptor = vmm.frame_descriptor(frame).unwrap();
        assert_eq!(descriptor.share_count, 3);
        let Backing::Clone(id) = descriptor.backing else {
            panic!("expected clone backing, found {:?}", descriptor.backing);
        };
        assert_eq!(descriptor.owner, Owner::Clone(id));
        assert_eq!(vmm.clone_ref_count(id), 2);

        for space in [&parent, &child] {
            let entry = space.translation(vmm.memory()).translate(VA).unwrap().1;
            assert_eq!(entry.frame(), frame);
            assert_eq!(entry.copy_on_write(), CowState::Shared);
            assert!(!entry.is_writable());
        }
        assert!(
            vmm.collaborators()
                .working_set
                .locate(child.id(), VA.page_number())
                .is_some()
        );
        assert_eq!(child.lock_working_set().resident(), 1);
    }

    #[test]
    fn clone_frames_gain_a_reference() {
        let vmm = reference_vmm(VmmConfig::default());
        let cpu = CpuId::new(0);
        let parent = vmm.create_address_space(cpu, 0).unwrap();
        let first = vmm.create_address_space(cpu, 0).unwrap();
        let second = vmm.create_address_space(cpu, 0).unwrap();
        let frame = vmm
            .map_page(&parent, VA, PageMapping::Zeroed { writable: true })
            .unwrap();
        vmm.duplicate(&parent, &first, user_range()).unwrap();
        vmm.duplicate(&parent, &second, user_range()).unwrap();

        let descriptor = vmm.frame_descriptor(frame).unwrap();
        assert_eq!(descriptor.share_count, 4);
        let Backing::Clone(id) = descriptor.backing else {
            panic!("expected clone backing");
        };
        assert_eq!(vmm.clone_ref_count(id), 3);
    }

    #[test]
    fn read_only_pages_stay_read_only() {
        let vmm = reference_vmm(VmmConfig::default());
        let cpu = CpuId::new(0);
        let parent = vmm.create_address_space(cpu, 0).unwrap();
        let child = vmm.create_address_space(cpu, 0).unwrap();
        vmm.map_page(&parent, VA, PageMapping::Zeroed { writable: false })
            .unwrap();
        vmm.duplicate(&parent, &child, user_range()).unwrap();
        let entry = child.translation(vmm.memory()).translate(VA).unwrap().1;
        assert_eq!(entry.copy_on_write(), CowState::None);
        assert_eq!(
            vmm.handle_fault(cpu, &child, VA, Access::Write),
            FaultStatus::Handled(FaultOutcome::AccessViolation)
        );
    }

    #[test]
    fn rejects_bad_ranges() {
        let vmm = reference_vmm(VmmConfig::default());
        let cpu = CpuId::new(0);
        let parent = vmm.create_address_space(cpu, 0).unwrap();
        let child = vmm.create_address_space(cpu, 0).unwrap();
        let system = VirtualAddress::new(arch::slot_base(arch::SYSTEM_DATA_SLOT));
        assert_eq!(
            vmm.duplicate(&parent, &child, VirtualAddress::new(0)..system),
            Err(VmmError::InvalidAddress)
        );
        assert_eq!(
            vmm.duplicate(&parent, &child, VirtualAddress::new(4)..VA),
            Err(VmmError::InvalidAddress)
        );
        assert_eq!(
            vmm.duplicate(&parent, &parent, user_range()),
            Err(VmmError::InvalidAddress)
        );
    }

    #[test]
    fn child_must_be_empty() {
        let vmm = reference_vmm(VmmConfig::default());
        let cpu = CpuId::new(0);
        let parent = vmm.create_address_space(cpu, 0).unwrap();
        let child = vmm.create_address_space(cpu, 0).unwrap();
        vmm.map_page(&parent, VA, PageMapping::Zeroed { writable: true })
            .unwrap();
        vmm.map_page(&child, VA, PageMapping::Zeroed { writable: true })
            .unwrap();
        assert_eq!(
            vmm.duplicate(&parent, &child, user_range()),
            Err(VmmError::AlreadyMapped)
        );
        assert!(!parent.is_duplicating());
    }

    #[test]
    fn privatized_copy_is_read_only() {
        let vmm = reference_vmm(VmmConfig::default());
        let cpu = CpuId::new(1);
        let parent = vmm.create_address_space(cpu, 0).unwrap();
        let child = vmm.create_address_space(cpu, 0).unwrap();
        let frame = vmm
            .map_page(&parent, VA, PageMapping::Zeroed { writable: true })
            .unwrap();
        vmm.write(cpu, &parent, VA, 0x5151).unwrap();
        vmm.duplicate(&parent, &child, user_range()).unwrap();

        assert_eq!(
            vmm.privatize_shared_page(cpu, &child, VA),
            Ok(FaultStatus::Handled(CopyOutcome::Copied))
        );
        let entry = child.translation(vmm.memory()).translate(VA).unwrap().1;
        assert_ne!(entry.frame(), frame);
        assert!(!entry.is_writable());
        assert_eq!(entry.copy_on_write(), CowState::None);
        assert_eq!(vmm.read(cpu, &child, VA), Ok(0x5151));
        assert_eq!(vmm.frame_descriptor(frame).unwrap().share_count, 2);

        assert_eq!(
            vmm.privatize_shared_page(cpu, &child, VA),
            Err(VmmError::InvalidFrame)
        );
        assert_eq!(
            vmm.write(cpu, &child, VA, 1),
            Err(crate::AccessError::AccessViolation)
        );
    }
}
