//! Fault servicing.
//!
//! The dispatcher classifies a fault against the in-memory translation entry, takes the
//! owning address space's working-set lock and hands the fault to one of the handlers. A
//! handler that cannot finish on consistent state returns [`FaultStatus::Retry`]; the
//! dispatcher then drops every lock, waits out the cause and reports the retry so the
//! faulting access is restarted from scratch.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::{
    AddressSpace, CowState, CpuId, FaultStatus, FlushScope, PreemptionGuard, RetryReason,
    TranslationEntry, VirtualAddress, Vmm,
};

mod copy_on_write;
mod dirty;

/// The kind of access that faulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// Classification of a fault against the current translation entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// No valid entry maps the address.
    NotPresent,
    /// The entry already permits the access; a cached translation was stale.
    Spurious,
    /// A write through a writable entry that is not yet dirty.
    DirtyBit,
    /// A write to a copy-on-write entry.
    CopyOnWrite,
    /// The access is not permitted.
    AccessViolation,
}

impl FaultKind {
    /// Classifies an `access` against `entry`, the result of walking the tables.
    pub fn classify(entry: Option<TranslationEntry>, access: Access) -> Self {
        let Some(entry) = entry.filter(|entry| entry.is_valid()) else {
            return Self::NotPresent;
        };
        match access {
            Access::Read => Self::Spurious,
            Access::Write if entry.is_writable() && entry.is_dirty() => Self::Spurious,
            Access::Write if entry.is_writable() => Self::DirtyBit,
            Access::Write if entry.copy_on_write() != CowState::None => Self::CopyOnWrite,
            Access::Write => Self::AccessViolation,
        }
    }
}

/// How a copy-on-write fault was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOutcome {
    /// The page was copied into a fresh private frame.
    Copied,
    /// The page was still being loaded from its image and became writable without a copy.
    WritableInPlace,
}

/// Result of a serviced fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The access can be restarted and will succeed unless the mapping changes again.
    Serviced,
    /// The access is not permitted and must be reported at the faulting access.
    AccessViolation,
}

/// Counters of the fault paths taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultStats {
    /// Copy-on-write faults that copied a page.
    pub copies: u64,
    /// Copy-on-write faults resolved in place during an image load.
    pub in_place: u64,
    /// Faults that returned a retry.
    pub retries: u64,
    /// Paging file reservations released by dirty-bit faults.
    pub page_file_releases: u64,
}

#[derive(Default)]
pub(crate) struct FaultCounters {
    copies: AtomicU64,
    in_place: AtomicU64,
    retries: AtomicU64,
    page_file_releases: AtomicU64,
}

impl FaultCounters {
    pub(crate) fn snapshot(&self) -> FaultStats {
        FaultStats {
            copies: self.copies.load(Ordering::Relaxed),
            in_place: self.in_place.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            page_file_releases: self.page_file_releases.load(Ordering::Relaxed),
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Vmm {
    /// Services a fault raised by `access` to `va` in `space` on `cpu`.
    ///
    /// On [`FaultStatus::Retry`] every lock has been dropped and the cause waited out by the
    /// time this returns; the caller restarts the access. A shortage of frames that waiting
    /// cannot end is reported as an access violation.
    pub fn handle_fault(
        &self,
        cpu: CpuId,
        space: &AddressSpace,
        va: VirtualAddress,
        access: Access,
    ) -> FaultStatus<FaultOutcome> {
        let Ok(owner) = self.owner_of(space, va) else {
            return FaultStatus::Handled(FaultOutcome::AccessViolation);
        };
        let status = {
            let preempt = self.cpus().disable_preemption(cpu);
            self.dispatch(&preempt, space, owner, va, access)
        };
        if let FaultStatus::Retry(reason) = status {
            bump(&self.counters().retries);
            log::trace!("{:?}: fault at {va} retried: {reason}", space.id());
            if !self.wait_out(owner, reason) {
                log::warn!("{:?}: out of memory at {va}", space.id());
                return FaultStatus::Handled(FaultOutcome::AccessViolation);
            }
        }
        status
    }

    fn dispatch(
        &self,
        preempt: &PreemptionGuard<'_>,
        space: &AddressSpace,
        owner: &AddressSpace,
        va: VirtualAddress,
        access: Access,
    ) -> FaultStatus<FaultOutcome> {
        let mut ws = owner.lock_working_set();
        let entry = space
            .translation(self.memory())
            .translate(va)
            .map(|(_, entry)| entry);
        let kind = FaultKind::classify(entry, access);
        #[cfg(feature = "detailed-logging")]
        log::trace!("{:?}: {access:?} fault at {va} classified {kind:?}", space.id());
        match kind {
            FaultKind::NotPresent => {
                drop(ws);
                if va.is_system() && self.sync_system_mappings_pinned(preempt, space) {
                    FaultStatus::Handled(FaultOutcome::Serviced)
                } else {
                    FaultStatus::Handled(FaultOutcome::AccessViolation)
                }
            }
            FaultKind::Spurious => {
                self.tlb()
                    .invalidate(FlushScope::Cpu(preempt.cpu()), va.page_number());
                FaultStatus::Handled(FaultOutcome::Serviced)
            }
            FaultKind::DirtyBit => {
                let mut frames = self.lock_frames();
                if self.resolve_write_fault(preempt, owner, &mut ws, va, Some(&mut frames)) {
                    FaultStatus::Handled(FaultOutcome::Serviced)
                } else {
                    FaultStatus::Handled(FaultOutcome::AccessViolation)
                }
            }
            FaultKind::CopyOnWrite => self
                .resolve_copy_on_write(preempt, owner, &mut ws, va)
                .map(|_| FaultOutcome::Serviced),
            FaultKind::AccessViolation => FaultStatus::Handled(FaultOutcome::AccessViolation),
        }
    }

    /// Blocks until the cause of a retry has passed. Call with no locks held.
    ///
    /// Returns false if retrying cannot make progress.
    pub(crate) fn wait_out(&self, owner: &AddressSpace, reason: RetryReason) -> bool {
        match reason {
            RetryReason::DuplicationInProgress => {
                owner.wait_for_duplication();
                true
            }
            RetryReason::FramesLow => {
                let target = self.config().low_watermark.max(1);
                self.collaborators().frames.wait_for_frames(target)
            }
            RetryReason::MappingInFlux => true,
        }
    }
}
