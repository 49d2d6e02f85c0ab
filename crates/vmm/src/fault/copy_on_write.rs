//! Copy-on-write faults.

use crate::{
    AddressSpace, Backing, CowState, EntryFlags, FaultStatus, FlushScope, FrameDescriptor,
    InvariantViolation, Owner, PreemptionGuard, RetryReason, VirtualAddress, Vmm, WorkingSet,
    database::release_entry_reference,
};

use super::{CopyOutcome, bump};

impl Vmm {
    /// Resolves a write to a copy-on-write entry.
    ///
    /// A page still being loaded from its image becomes writable in place. Otherwise the page
    /// is copied into a fresh frame of the same cache color, the entry is swapped to the copy
    /// in one atomic step and the old frame loses a share. A `Reprotect` entry gets a private
    /// copy that stays read-only.
    ///
    /// Requires the working-set lock of `owner`. Retries if a duplication of `owner` is in
    /// flight, if free frames are critically low, or if the entry changed underneath.
    pub fn resolve_copy_on_write(
        &self,
        preempt: &PreemptionGuard<'_>,
        owner: &AddressSpace,
        _working_set: &mut WorkingSet,
        va: VirtualAddress,
    ) -> FaultStatus<CopyOutcome> {
        let env = self.collaborators();
        let map = owner.translation(self.memory());
        let Some((location, entry)) = map.translate(va).filter(|(_, entry)| entry.is_valid())
        else {
            return FaultStatus::Fatal(InvariantViolation::EntryNotValid);
        };
        let old = entry.frame();
        let Some(descriptor) = self.frame_descriptor(old) else {
            return FaultStatus::Fatal(InvariantViolation::UnmanagedFrame);
        };
        let page = va.page_number();

        if descriptor.backing == Backing::Image && owner.image_loading_at(page) {
            let writable = entry
                .with_copy_on_write(CowState::None)
                .with_flags(EntryFlags::WRITE | EntryFlags::DIRTY | EntryFlags::ACCESSED);
            if map.replace(location, entry, writable).is_err() {
                return FaultStatus::Retry(RetryReason::MappingInFlux);
            }
            self.tlb()
                .invalidate(FlushScope::Cpu(preempt.cpu()), page);
            bump(&self.counters().in_place);
            log::trace!("{:?}: {va} made writable in place during image load", owner.id());
            return FaultStatus::Handled(CopyOutcome::WritableInPlace);
        }

        if owner.is_duplicating() {
            return FaultStatus::Retry(RetryReason::DuplicationInProgress);
        }
        let reprotect = match entry.copy_on_write() {
            CowState::None => return FaultStatus::Fatal(InvariantViolation::NotCopyOnWrite),
            CowState::Shared => false,
            CowState::Reprotect => true,
        };
        let Some(ws_index) = env.working_set.locate(owner.id(), page) else {
            return FaultStatus::Fatal(InvariantViolation::UntrackedPage);
        };

        let new = {
            let mut frames = self.lock_frames();
            if env.frames.available_frames() < self.config().low_watermark {
                return FaultStatus::Retry(RetryReason::FramesLow);
            }
            let allocated = frames.allocate(env, descriptor.color, |frame| {
                let mut copy = FrameDescriptor::new(
                    frame,
                    Owner::Mapping {
                        space: owner.id(),
                        page,
                    },
                    Backing::Demand,
                );
                copy.ws_index = Some(ws_index);
                copy.modified = true;
                copy
            });
            match allocated {
                Some(frame) => frame,
                None => return FaultStatus::Retry(RetryReason::FramesLow),
            }
        };
        let copied = self.map_transient(preempt, new, owner).copy_page(&map, va);
        if copied != Some(old) {
            self.lock_frames().drop_share(new, env);
            log::trace!("{:?}: {va} remapped to {copied:?} during copy", owner.id());
            return FaultStatus::Retry(RetryReason::MappingInFlux);
        }

        let mut replacement = entry
            .with_frame(new)
            .with_copy_on_write(CowState::None)
            .with_flags(EntryFlags::ACCESSED);
        if !reprotect {
            replacement = replacement.with_flags(EntryFlags::WRITE | EntryFlags::DIRTY);
        }
        if let Err(found) = map.replace(location, entry, replacement) {
            self.lock_frames().drop_share(new, env);
            log::trace!("{:?}: entry for {va} changed to {found:?} during copy", owner.id());
            return FaultStatus::Retry(RetryReason::MappingInFlux);
        }
        self.tlb().invalidate(self.flush_scope(owner, va), page);

        let frames = self.lock_frames();
        drop(release_entry_reference(self.frame_lock(), frames, old, env));
        bump(&self.counters().copies);
        log::trace!(
            "{:?}: copied {va} from frame {old} to {new}{}",
            owner.id(),
            if reprotect { " (read-only)" } else { "" }
        );
        FaultStatus::Handled(CopyOutcome::Copied)
    }
}
