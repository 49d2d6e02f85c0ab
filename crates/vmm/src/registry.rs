//! Process registry and system-mapping propagation.
//!
//! Every live address space is registered here under the expansion lock. System-range
//! growth bumps a global generation counter; each address space remembers the generation it
//! last synchronized to, and a stale one is fixed up lazily by copying the system slots of
//! the reference address space into its top-level table.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use spin::{Mutex, MutexGuard};

use crate::{
    AddressSpace, CpuId, FlushScope, PageNumber, PreemptionGuard, SpaceId, TranslationEntry, Vmm,
    arch,
};

/// Guard of the expansion lock.
pub type ExpansionGuard<'a> = MutexGuard<'a, Vec<Arc<AddressSpace>>>;

/// Returns true if an address space synchronized at generation `synced` is stale with
/// respect to the global generation `current`.
#[inline]
pub const fn needs_sync(synced: u64, current: u64) -> bool {
    synced < current
}

/// The global list of live address spaces.
pub struct ProcessRegistry {
    spaces: Mutex<Vec<Arc<AddressSpace>>>,
    generation: AtomicU64,
    next_id: AtomicUsize,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self {
            spaces: Mutex::new(Vec::new()),
            generation: AtomicU64::new(0),
            next_id: AtomicUsize::new(SpaceId::SYSTEM.as_usize() + 1),
        }
    }

    /// Acquires the expansion lock.
    pub fn lock_expansion(&self) -> ExpansionGuard<'_> {
        self.spaces.lock()
    }

    /// Returns the current system-mapping generation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Advances the system-mapping generation. Requires the expansion lock.
    pub(crate) fn advance_generation(&self, _expansion: &ExpansionGuard<'_>) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn allocate_id(&self) -> SpaceId {
        SpaceId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the number of registered address spaces.
    pub fn len(&self) -> usize {
        self.spaces.lock().len()
    }

    /// Returns true if no address spaces are registered.
    pub fn is_empty(&self) -> bool {
        self.spaces.lock().is_empty()
    }

    /// Returns true if `id` is registered.
    pub fn contains(&self, id: SpaceId) -> bool {
        self.spaces.lock().iter().any(|space| space.id() == id)
    }

    /// Returns a snapshot of the registered address spaces.
    pub fn spaces(&self) -> Vec<Arc<AddressSpace>> {
        self.spaces.lock().clone()
    }
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns the pages covered by the system range.
pub(crate) fn system_pages() -> core::ops::Range<PageNumber> {
    let start = arch::SYSTEM_SLOTS.start * arch::ENTRIES_PER_TABLE;
    let end = arch::SYSTEM_SLOTS.end * arch::ENTRIES_PER_TABLE;
    PageNumber::new(start)..PageNumber::new(end)
}

impl Vmm {
    /// Copies the system slots of the reference address space into `target`.
    ///
    /// Runs with the expansion lock held and preemption disabled. Only the current CPU's
    /// cached system translations are invalidated; other CPUs fix themselves up when they
    /// fault.
    pub(crate) fn propagate_system_mappings(
        &self,
        preempt: &PreemptionGuard<'_>,
        _expansion: &ExpansionGuard<'_>,
        target: &AddressSpace,
    ) {
        let mut slots = [TranslationEntry::EMPTY; arch::SYSTEM_SLOT_COUNT];
        {
            let reference =
                self.map_transient(preempt, self.system_space().top_level(), self.system_space());
            for (entry, slot) in slots.iter_mut().zip(arch::SYSTEM_SLOTS) {
                *entry = reference.read_entry(slot);
            }
        }
        {
            let window = self.map_transient(preempt, target.top_level(), self.system_space());
            for (entry, slot) in slots.iter().zip(arch::SYSTEM_SLOTS) {
                window.write_entry(slot, *entry);
            }
        }
        self.tlb()
            .invalidate_range(FlushScope::Cpu(preempt.cpu()), system_pages());
        let generation = self.registry().generation();
        target.set_synced_generation(generation);
        log::debug!("{:?} synchronized to system generation {generation}", target.id());
    }

    /// Brings the system slots of `space` up to date if they are stale.
    ///
    /// Returns true if anything was copied.
    pub fn sync_system_mappings(&self, cpu: CpuId, space: &AddressSpace) -> bool {
        let preempt = self.cpus().disable_preemption(cpu);
        self.sync_system_mappings_pinned(&preempt, space)
    }

    pub(crate) fn sync_system_mappings_pinned(
        &self,
        preempt: &PreemptionGuard<'_>,
        space: &AddressSpace,
    ) -> bool {
        if !needs_sync(space.synced_generation(), self.registry().generation()) {
            return false;
        }
        let expansion = self.registry().lock_expansion();
        // Another CPU may have synchronized this space while we waited for the lock.
        if !needs_sync(space.synced_generation(), self.registry().generation()) {
            return false;
        }
        self.propagate_system_mappings(preempt, &expansion, space);
        true
    }
}
