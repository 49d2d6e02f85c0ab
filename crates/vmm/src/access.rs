//! Emulated CPU accesses.
//!
//! Loads and stores go through the per-CPU translation cache and fault exactly where the
//! hardware would: on a missing or invalid entry, on a write to a read-only entry and on a
//! write through a clean writable entry. Faults are serviced by
//! [`Vmm::handle_fault`] and the access is restarted until it succeeds or is refused. A
//! retried fault has already waited out its cause, so the restart is immediate.

use crate::{
    Access, AccessError, AddressSpace, CpuId, FaultOutcome, FaultStatus, PhysicalAddress,
    TranslationEntry, VirtualAddress, Vmm,
};

const WORD_SIZE: usize = 8;

fn permits(entry: TranslationEntry, access: Access) -> bool {
    match access {
        Access::Read => entry.is_valid(),
        Access::Write => entry.is_valid() && entry.is_writable() && entry.is_dirty(),
    }
}

impl Vmm {
    /// Loads the word at `va` as seen by `space` running on `cpu`.
    pub fn read(
        &self,
        cpu: CpuId,
        space: &AddressSpace,
        va: VirtualAddress,
    ) -> Result<u64, AccessError> {
        let address = self.access(cpu, space, va, Access::Read)?;
        Ok(self.memory().load(address))
    }

    /// Stores `value` to the word at `va` as seen by `space` running on `cpu`.
    pub fn write(
        &self,
        cpu: CpuId,
        space: &AddressSpace,
        va: VirtualAddress,
        value: u64,
    ) -> Result<(), AccessError> {
        let address = self.access(cpu, space, va, Access::Write)?;
        self.memory().store(address, value);
        Ok(())
    }

    fn access(
        &self,
        cpu: CpuId,
        space: &AddressSpace,
        va: VirtualAddress,
        access: Access,
    ) -> Result<PhysicalAddress, AccessError> {
        if !va.is_aligned(WORD_SIZE) {
            return Err(AccessError::AccessViolation);
        }
        loop {
            if let Some(entry) = self.cached_translation(cpu, space, va) {
                if permits(entry, access) {
                    return Ok(entry.frame().start() + va.page_offset());
                }
            }
            match self.handle_fault(cpu, space, va, access) {
                FaultStatus::Handled(FaultOutcome::Serviced) => {}
                FaultStatus::Handled(FaultOutcome::AccessViolation) => {
                    return Err(AccessError::AccessViolation);
                }
                FaultStatus::Retry(_) => {}
                FaultStatus::Fatal(violation) => {
                    log::error!("{:?}: fatal fault at {va}: {violation}", space.id());
                    return Err(AccessError::Fatal(violation));
                }
            }
        }
    }

    /// Returns the cached translation of `va`, walking the tables and filling the cache on a
    /// miss. Only valid entries are cached.
    fn cached_translation(
        &self,
        cpu: CpuId,
        space: &AddressSpace,
        va: VirtualAddress,
    ) -> Option<TranslationEntry> {
        let page = va.page_number();
        if let Some(entry) = self.tlb().lookup(cpu, space.id(), page) {
            return Some(entry);
        }
        let (_, entry) = space.translation(self.memory()).translate(va)?;
        if !entry.is_valid() {
            return None;
        }
        self.tlb().fill(cpu, space.id(), page, entry);
        Some(entry)
    }
}
