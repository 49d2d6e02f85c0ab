//! Translation entry for software emulation.

use core::fmt;

use crate::FrameNumber;

use super::flags::{CowState, EntryFlags};

/// A single translation table entry for software emulation.
///
/// The entry format:
/// - Bits 0-5: Hardware flags ([`EntryFlags`])
/// - Bits 6-7: Copy-on-write state ([`CowState`])
/// - Bits 8-11: Reserved (zero)
/// - Bits 12-63: Frame number
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct TranslationEntry(u64);

impl TranslationEntry {
    /// Flag bits mask (bits 0-5).
    const FLAGS_MASK: u64 = 0x3F;

    /// Copy-on-write state shift.
    const COW_SHIFT: u64 = 6;

    /// Copy-on-write state mask (bits 6-7).
    const COW_MASK: u64 = 0b11 << Self::COW_SHIFT;

    /// Frame number shift.
    const FRAME_SHIFT: u64 = 12;

    /// An entry that maps nothing.
    pub const EMPTY: Self = Self(0);

    /// Creates a new translation entry mapping `frame`.
    pub const fn new(frame: FrameNumber, flags: EntryFlags) -> Self {
        Self(((frame.as_usize() as u64) << Self::FRAME_SHIFT) | (flags.bits() & Self::FLAGS_MASK))
    }

    /// Creates an entry from its raw encoding.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw encoding of this entry.
    pub const fn as_raw(self) -> u64 {
        self.0
    }

    /// Returns the frame this entry maps.
    pub const fn frame(self) -> FrameNumber {
        FrameNumber::new((self.0 >> Self::FRAME_SHIFT) as usize)
    }

    /// Returns the hardware flags of this entry.
    pub const fn flags(self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.0 & Self::FLAGS_MASK)
    }

    /// Returns whether this entry is valid.
    pub const fn is_valid(self) -> bool {
        self.flags().contains(EntryFlags::VALID)
    }

    /// Returns whether this entry permits writes.
    pub const fn is_writable(self) -> bool {
        self.flags().contains(EntryFlags::WRITE)
    }

    /// Returns whether this entry is dirty.
    pub const fn is_dirty(self) -> bool {
        self.flags().contains(EntryFlags::DIRTY)
    }

    /// Returns the copy-on-write state of this entry.
    pub const fn copy_on_write(self) -> CowState {
        CowState::from_bits((self.0 & Self::COW_MASK) >> Self::COW_SHIFT)
    }

    /// Returns a copy of this entry with `flags` added.
    #[must_use]
    pub const fn with_flags(self, flags: EntryFlags) -> Self {
        Self(self.0 | (flags.bits() & Self::FLAGS_MASK))
    }

    /// Returns a copy of this entry with `flags` removed.
    #[must_use]
    pub const fn without_flags(self, flags: EntryFlags) -> Self {
        Self(self.0 & !(flags.bits() & Self::FLAGS_MASK))
    }

    /// Returns a copy of this entry with the given copy-on-write state.
    ///
    /// Entering a copy-on-write state strips write permission.
    #[must_use]
    pub const fn with_copy_on_write(self, state: CowState) -> Self {
        let cleared = self.0 & !Self::COW_MASK;
        let entry = Self(cleared | ((state as u64) << Self::COW_SHIFT));
        if state.is_copy_on_write() {
            entry.without_flags(EntryFlags::WRITE)
        } else {
            entry
        }
    }

    /// Returns a copy of this entry mapping `frame` instead, with the same bits.
    #[must_use]
    pub const fn with_frame(self, frame: FrameNumber) -> Self {
        let bits = self.0 & ((1 << Self::FRAME_SHIFT) - 1);
        Self(bits | ((frame.as_usize() as u64) << Self::FRAME_SHIFT))
    }

    /// Returns false if the entry is copy-on-write yet carries write permission.
    pub const fn is_consistent(self) -> bool {
        !(self.copy_on_write().is_copy_on_write() && self.is_writable())
    }
}

impl fmt::Debug for TranslationEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TranslationEntry")
            .field("frame", &self.frame())
            .field("flags", &self.flags())
            .field("cow", &self.copy_on_write())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_frame_and_flags() {
        let entry = TranslationEntry::new(
            FrameNumber::new(0x1234),
            EntryFlags::VALID | EntryFlags::WRITE,
        );
        assert_eq!(entry.frame(), FrameNumber::new(0x1234));
        assert!(entry.is_valid());
        assert!(entry.is_writable());
        assert!(!entry.is_dirty());
        assert_eq!(entry.copy_on_write(), CowState::None);
    }

    #[test]
    fn copy_on_write_strips_write() {
        let entry = TranslationEntry::new(
            FrameNumber::new(7),
            EntryFlags::VALID | EntryFlags::WRITE | EntryFlags::DIRTY,
        )
        .with_copy_on_write(CowState::Shared);
        assert!(!entry.is_writable());
        assert!(entry.is_dirty());
        assert_eq!(entry.copy_on_write(), CowState::Shared);
        assert!(entry.is_consistent());
    }

    #[test]
    fn with_frame_preserves_bits() {
        let entry = TranslationEntry::new(FrameNumber::new(3), EntryFlags::VALID)
            .with_copy_on_write(CowState::Reprotect);
        let moved = entry.with_frame(FrameNumber::new(99));
        assert_eq!(moved.frame(), FrameNumber::new(99));
        assert_eq!(moved.flags(), entry.flags());
        assert_eq!(moved.copy_on_write(), CowState::Reprotect);
    }

    #[test]
    fn raw_writable_copy_on_write_is_inconsistent() {
        let raw = TranslationEntry::new(FrameNumber::new(1), EntryFlags::VALID | EntryFlags::WRITE)
            .as_raw()
            | (1 << 6);
        assert!(!TranslationEntry::from_raw(raw).is_consistent());
    }

    #[test]
    fn empty_is_not_valid() {
        assert!(!TranslationEntry::EMPTY.is_valid());
        assert_eq!(TranslationEntry::default(), TranslationEntry::EMPTY);
    }
}
