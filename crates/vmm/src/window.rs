//! Transient mappings of arbitrary frames.
//!
//! A frame that is not otherwise mapped, such as a fresh copy target or another address
//! space's top-level table, is touched by mapping it through a transient window. The shared
//! pool in the system range is tried first; when it is exhausted the caller falls back to the
//! per-process hyperspace entry, which maps one frame at a time under the hyperspace lock.

use spin::{Mutex, MutexGuard};

use crate::{
    AddressSpace, EntryFlags, FlushScope, FrameNumber, PhysicalAddress, PhysicalMemory,
    PreemptionGuard, SoftwareTlb, SpaceId, TranslationEntry, TranslationMap, VirtualAddress, Vmm,
    arch, translation::EntryLocation,
};

/// The shared transient window pool: entries of the system window table.
pub(crate) struct WindowPool {
    table: FrameNumber,
    capacity: usize,
    in_use: Mutex<u16>,
}

impl WindowPool {
    pub(crate) fn new(table: FrameNumber, capacity: usize) -> Self {
        assert!(
            capacity <= arch::ENTRIES_PER_TABLE,
            "window pool larger than its table"
        );
        Self {
            table,
            capacity,
            in_use: Mutex::new(0),
        }
    }

    fn claim(&self) -> Option<usize> {
        let mut in_use = self.in_use.lock();
        let index = (0..self.capacity).find(|index| *in_use & (1 << index) == 0)?;
        *in_use |= 1 << index;
        Some(index)
    }

    fn release(&self, index: usize) {
        *self.in_use.lock() &= !(1 << index);
    }
}

enum Slot<'a> {
    Pool {
        pool: &'a WindowPool,
        index: usize,
    },
    Hyperspace {
        table: FrameNumber,
        _lock: MutexGuard<'a, ()>,
    },
}

/// A frame mapped through a transient window. Unmapped when dropped.
///
/// Every access goes through the window's virtual address: the pinned CPU's translation
/// cache is consulted first and filled from the window entry on a miss.
pub struct TransientMapping<'a> {
    memory: &'a PhysicalMemory,
    tlb: &'a SoftwareTlb,
    preempt: &'a PreemptionGuard<'a>,
    slot: Slot<'a>,
    space: SpaceId,
    va: VirtualAddress,
}

impl TransientMapping<'_> {
    fn location(&self) -> EntryLocation {
        match &self.slot {
            Slot::Pool { pool, index } => EntryLocation::new(pool.table, *index),
            Slot::Hyperspace { table, .. } => EntryLocation::new(*table, arch::HYPERSPACE_INDEX),
        }
    }

    /// Returns the virtual address of the window.
    pub fn va(&self) -> VirtualAddress {
        self.va
    }

    /// Returns true if the mapping fell back to the per-process hyperspace entry.
    pub fn is_hyperspace(&self) -> bool {
        matches!(self.slot, Slot::Hyperspace { .. })
    }

    /// Translates the window's virtual address on the pinned CPU.
    fn window_frame(&self) -> FrameNumber {
        let (cpu, page) = (self.preempt.cpu(), self.va.page_number());
        if let Some(entry) = self.tlb.lookup(cpu, self.space, page) {
            return entry.frame();
        }
        let entry = TranslationEntry::from_raw(self.memory.load(self.location().address()));
        assert!(entry.is_valid(), "transient window at {} is not mapped", self.va);
        self.tlb.fill(cpu, self.space, page, entry);
        entry.frame()
    }

    fn word_address(&self, word: usize) -> PhysicalAddress {
        assert!(word < arch::WORDS_PER_PAGE, "word index out of bounds");
        self.window_frame().start() + word * 8
    }

    /// Reads word `word` of the mapped frame.
    pub fn read_word(&self, word: usize) -> u64 {
        self.memory.load(self.word_address(word))
    }

    /// Writes word `word` of the mapped frame.
    pub fn write_word(&self, word: usize, value: u64) {
        self.memory.store(self.word_address(word), value);
    }

    /// Reads entry `index` of the mapped frame viewed as a translation table.
    pub fn read_entry(&self, index: usize) -> TranslationEntry {
        TranslationEntry::from_raw(self.read_word(index))
    }

    /// Writes entry `index` of the mapped frame viewed as a translation table.
    pub fn write_entry(&self, index: usize, entry: TranslationEntry) {
        self.write_word(index, entry.as_raw());
    }

    /// Fills the mapped frame with the page that `va` currently translates to in `source`.
    ///
    /// Returns the frame copied from, or `None` if `va` is not mapped.
    pub fn copy_page(
        &self,
        source: &TranslationMap<'_>,
        va: VirtualAddress,
    ) -> Option<FrameNumber> {
        let (_, entry) = source.translate(va).filter(|(_, entry)| entry.is_valid())?;
        let from = entry.frame().start();
        let to = self.window_frame().start();
        for offset in (0..arch::PAGE_SIZE).step_by(8) {
            self.memory.store(to + offset, self.memory.load(from + offset));
        }
        Some(entry.frame())
    }
}

impl Drop for TransientMapping<'_> {
    fn drop(&mut self) {
        self.memory.store(self.location().address(), 0);
        self.tlb
            .invalidate(FlushScope::Cpu(self.preempt.cpu()), self.va.page_number());
        if let Slot::Pool { pool, index } = self.slot {
            pool.release(index);
        }
    }
}

impl Vmm {
    /// Maps `frame` through a transient window on the pinned CPU.
    ///
    /// Uses the shared pool if an entry is free, otherwise the hyperspace entry of `fallback`.
    pub fn map_transient<'a>(
        &'a self,
        preempt: &'a PreemptionGuard<'a>,
        frame: FrameNumber,
        fallback: &'a AddressSpace,
    ) -> TransientMapping<'a> {
        let (slot, space, va) = match self.window_pool().claim() {
            Some(index) => (
                Slot::Pool {
                    pool: self.window_pool(),
                    index,
                },
                SpaceId::SYSTEM,
                arch::entry_va(arch::SYSTEM_WINDOW_SLOT, index),
            ),
            None => {
                log::trace!("window pool exhausted, using hyperspace of {:?}", fallback.id());
                (
                    Slot::Hyperspace {
                        table: fallback.window_table(),
                        _lock: fallback.lock_hyperspace(),
                    },
                    fallback.id(),
                    arch::entry_va(arch::WINDOW_SLOT, arch::HYPERSPACE_INDEX),
                )
            }
        };
        let mapping = TransientMapping {
            memory: self.memory(),
            tlb: self.tlb(),
            preempt,
            slot,
            space,
            va: VirtualAddress::new(va),
        };
        let entry = TranslationEntry::new(
            frame,
            EntryFlags::VALID | EntryFlags::WRITE | EntryFlags::ACCESSED | EntryFlags::DIRTY,
        );
        self.memory().store(mapping.location().address(), entry.as_raw());
        mapping
    }
}
