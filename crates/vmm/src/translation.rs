//! Translation map: walking and rewriting an address space's tables in physical memory.
//!
//! A [`TranslationMap`] is a view of one top-level table. It never caches anything; every
//! read goes to physical memory and every rewrite is a single atomic word operation, so a
//! concurrent walker sees either the old or the new entry and never a torn one.

use crate::{
    EntryFlags, FrameNumber, PhysicalAddress, PhysicalMemory, TranslationEntry, VirtualAddress,
    arch,
};

/// The physical location of a leaf translation entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryLocation {
    /// Frame holding the leaf table.
    pub table: FrameNumber,
    /// Index of the entry within the table.
    pub index: usize,
}

impl EntryLocation {
    pub const fn new(table: FrameNumber, index: usize) -> Self {
        Self { table, index }
    }

    /// Returns the physical address of the entry.
    pub const fn address(self) -> PhysicalAddress {
        self.table.entry_address(self.index)
    }
}

/// A view of the tables rooted at one top-level table.
#[derive(Clone, Copy)]
pub struct TranslationMap<'a> {
    memory: &'a PhysicalMemory,
    top_level: FrameNumber,
}

impl<'a> TranslationMap<'a> {
    pub fn new(memory: &'a PhysicalMemory, top_level: FrameNumber) -> Self {
        Self { memory, top_level }
    }

    /// Returns the frame of the top-level table.
    pub fn top_level(&self) -> FrameNumber {
        self.top_level
    }

    /// Reads top-level entry `slot`.
    pub fn top_entry(&self, slot: usize) -> TranslationEntry {
        TranslationEntry::from_raw(self.memory.load(self.top_level.entry_address(slot)))
    }

    /// Writes top-level entry `slot`.
    pub fn set_top_entry(&self, slot: usize, entry: TranslationEntry) {
        self.memory
            .store(self.top_level.entry_address(slot), entry.as_raw());
    }

    /// Returns the location of the leaf entry for `va`, if its leaf table is present.
    pub fn locate(&self, va: VirtualAddress) -> Option<EntryLocation> {
        let top = self.top_entry(va.top_level_slot());
        top.is_valid()
            .then(|| EntryLocation::new(top.frame(), va.table_index(0)))
    }

    /// Reads the entry at `location`.
    pub fn read(&self, location: EntryLocation) -> TranslationEntry {
        TranslationEntry::from_raw(self.memory.load(location.address()))
    }

    /// Walks the tables for `va`, returning the leaf entry and where it lives.
    ///
    /// The returned entry may be invalid; `None` means no leaf table covers `va`.
    pub fn translate(&self, va: VirtualAddress) -> Option<(EntryLocation, TranslationEntry)> {
        let location = self.locate(va)?;
        Some((location, self.read(location)))
    }

    /// Writes `entry` at `location`.
    pub fn install(&self, location: EntryLocation, entry: TranslationEntry) {
        self.memory.store(location.address(), entry.as_raw());
    }

    /// Replaces the entry at `location` with `new` only if it still equals `expected`.
    ///
    /// On failure returns the entry actually found.
    pub fn replace(
        &self,
        location: EntryLocation,
        expected: TranslationEntry,
        new: TranslationEntry,
    ) -> Result<(), TranslationEntry> {
        self.memory
            .compare_exchange(location.address(), expected.as_raw(), new.as_raw())
            .map(|_| ())
            .map_err(TranslationEntry::from_raw)
    }

    /// Sets `flags` on the entry at `location`, returning the previous entry.
    pub fn set_flags(&self, location: EntryLocation, flags: EntryFlags) -> TranslationEntry {
        TranslationEntry::from_raw(self.memory.fetch_or(location.address(), flags.bits()))
    }

    /// Clears `flags` on the entry at `location`, returning the previous entry.
    pub fn clear_flags(&self, location: EntryLocation, flags: EntryFlags) -> TranslationEntry {
        let mut current = self.read(location);
        loop {
            match self.replace(location, current, current.without_flags(flags)) {
                Ok(()) => return current,
                Err(found) => current = found,
            }
        }
    }

    /// Clears the entry at `location`, returning the previous entry.
    pub fn clear(&self, location: EntryLocation) -> TranslationEntry {
        TranslationEntry::from_raw(self.memory.swap(location.address(), 0))
    }

    /// Returns the frame of the table in top-level `slot`, found by reading the table as
    /// ordinary data through the recursive self-map.
    pub fn table_as_data(&self, slot: usize) -> Option<FrameNumber> {
        let va = VirtualAddress::new(arch::self_map_va(slot));
        let (_, entry) = self.translate(va)?;
        entry.is_valid().then(|| entry.frame())
    }
}
