//! Translation entry flags for software emulation.

use bitflags::bitflags;

bitflags! {
    /// Hardware status and protection bits of a translation entry.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct EntryFlags: u64 {
        /// The entry maps a frame.
        const VALID = 1 << 0;
        /// Writes through this entry are permitted.
        const WRITE = 1 << 1;
        /// The page is accessible from user mode.
        const USER = 1 << 2;
        /// The page has been referenced.
        const ACCESSED = 1 << 3;
        /// The page has been written. Writes through a clean entry raise a dirty-bit fault.
        const DIRTY = 1 << 4;
        /// The mapping is shared by every address space.
        const GLOBAL = 1 << 5;
    }
}

/// Copy-on-write state of a translation entry.
///
/// A write fault on a `Shared` entry makes a private, writable copy. A write or protection
/// change on a `Reprotect` entry makes a private copy that keeps its read-only protection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CowState {
    /// Not copy-on-write.
    None = 0,
    /// Genuinely shared; the next write copies the page.
    Shared = 1,
    /// Shared page being made private for a protection change; the copy stays read-only.
    Reprotect = 2,
}

impl CowState {
    pub(super) const fn from_bits(bits: u64) -> Self {
        match bits {
            1 => Self::Shared,
            2 => Self::Reprotect,
            _ => Self::None,
        }
    }

    /// Returns true for either copy-on-write state.
    pub const fn is_copy_on_write(self) -> bool {
        !matches!(self, Self::None)
    }
}
