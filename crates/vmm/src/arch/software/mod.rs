//! Software emulation of the translation hardware.
//!
//! The software-emulated architecture is a "scale model" of a two-level paging design:
//! - 15-bit virtual addresses (32 KiB per address space)
//! - 2 levels of translation tables (top-level table and leaf tables)
//! - 4-bit indexes (16 entries per table)
//! - 7-bit page offset (128-byte pages)
//!
//! A translation table is exactly one frame of sixteen 8-byte entries, so tables can be
//! mapped and read as ordinary data, which the recursive self-map relies on.
//!
//! # Top-level slot layout
//!
//! | Slots   | Use                                                          |
//! |---------|--------------------------------------------------------------|
//! | 0 - 7   | User range, private to each address space                    |
//! | 8       | Transient window table (plus working-set page mappings)      |
//! | 9       | Recursive self-map                                           |
//! | 10 - 11 | Reserved for window growth, always zero                      |
//! | 12 - 15 | System range, shared with the reference address space        |

use core::ops::Range;

mod entry;
mod flags;

pub use entry::TranslationEntry;
pub use flags::{CowState, EntryFlags};

/// Number of bits in a page offset.
pub const PAGE_SHIFT: usize = 7;

/// Page size in bytes (128 bytes = 2^7).
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Size of a single translation entry in bytes.
pub const ENTRY_SIZE: usize = 8;

/// Number of entries in a translation table.
pub const ENTRIES_PER_TABLE: usize = PAGE_SIZE / ENTRY_SIZE;

/// Number of 64-bit words in a page.
pub const WORDS_PER_PAGE: usize = PAGE_SIZE / 8;

/// Number of index bits per table level.
pub const TABLE_INDEX_BITS: usize = 4;

/// Number of translation table levels (top-level and leaf).
pub const PAGE_TABLE_LEVELS: usize = 2;

/// Maximum number of bits in a virtual address.
pub const MAX_VIRTUAL_BITS: usize = PAGE_SHIFT + TABLE_INDEX_BITS * PAGE_TABLE_LEVELS;

/// Maximum number of bits in a physical address.
pub const MAX_PHYSICAL_BITS: usize = 24;

/// Number of bytes covered by one top-level slot.
pub const SLOT_SPAN: usize = 1 << (PAGE_SHIFT + TABLE_INDEX_BITS);

/// Top-level slots making up the per-process user range.
pub const USER_SLOTS: Range<usize> = 0..8;

/// Top-level slot holding the per-process transient window table.
pub const WINDOW_SLOT: usize = 8;

/// Top-level slot holding the recursive self-map entry.
pub const SELF_MAP_SLOT: usize = 9;

/// Top-level slots reserved for transient window growth.
pub const WINDOW_GROWTH_SLOTS: Range<usize> = 10..12;

/// Top-level slots making up the shared system range.
pub const SYSTEM_SLOTS: Range<usize> = 12..16;

/// Number of slots in the system range.
pub const SYSTEM_SLOT_COUNT: usize = SYSTEM_SLOTS.end - SYSTEM_SLOTS.start;

/// System slot whose table holds the reference address space's system data pages.
pub const SYSTEM_DATA_SLOT: usize = 12;

/// System slot whose table backs the global transient window pool.
pub const SYSTEM_WINDOW_SLOT: usize = 15;

/// Window table entry used to map one frame at a time for the owning process.
pub const HYPERSPACE_INDEX: usize = 0;

/// Window table entry mapping the working-set bitmap page.
pub const WORKING_SET_BITMAP_INDEX: usize = 14;

/// Window table entry mapping the working-set list page.
pub const WORKING_SET_LIST_INDEX: usize = 15;

/// Returns the table index for a given virtual address at the specified level.
///
/// - Level 0: Bits 7-10 (leaf table)
/// - Level 1: Bits 11-14 (top-level table)
#[inline]
pub const fn page_index(address: usize, level: usize) -> usize {
    assert!(level < PAGE_TABLE_LEVELS, "level out of range (0-1)");
    let shift = PAGE_SHIFT + level * TABLE_INDEX_BITS;
    (address >> shift) & ((1 << TABLE_INDEX_BITS) - 1)
}

/// Returns the first virtual address mapped through the given top-level slot.
#[inline]
pub const fn slot_base(slot: usize) -> usize {
    assert!(slot < ENTRIES_PER_TABLE, "top-level slot out of range");
    slot * SLOT_SPAN
}

/// Returns the virtual address mapped by entry `index` of the table in `slot`.
#[inline]
pub const fn entry_va(slot: usize, index: usize) -> usize {
    assert!(index < ENTRIES_PER_TABLE, "table index out of bounds");
    slot_base(slot) + (index << PAGE_SHIFT)
}

/// Returns the virtual address at which the self-map exposes the table installed in `slot`.
///
/// Passing [`SELF_MAP_SLOT`] yields the address of the top-level table itself.
#[inline]
pub const fn self_map_va(slot: usize) -> usize {
    entry_va(SELF_MAP_SLOT, slot)
}

/// Returns true if `slot` belongs to the user range.
#[inline]
pub const fn is_user_slot(slot: usize) -> bool {
    slot >= USER_SLOTS.start && slot < USER_SLOTS.end
}

/// Returns true if `slot` belongs to the shared system range.
#[inline]
pub const fn is_system_slot(slot: usize) -> bool {
    slot >= SYSTEM_SLOTS.start && slot < SYSTEM_SLOTS.end
}

/// Validates a physical address for software emulation.
#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    addr < (1 << MAX_PHYSICAL_BITS)
}

/// Validates a virtual address for software emulation.
#[inline]
pub const fn validate_virtual(addr: usize) -> bool {
    addr < (1 << MAX_VIRTUAL_BITS)
}
