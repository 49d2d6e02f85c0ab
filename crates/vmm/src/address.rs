//! Physical and virtual addresses of the scale model.
//!
//! Physical addresses index the emulated memory; virtual addresses are split into a
//! top-level slot, a leaf index and a byte offset by the two-level walk.

use core::fmt;
use core::ops::Add;

use crate::{FrameNumber, PageNumber, arch};

/// Defines an address newtype with the operations shared by both address kinds.
macro_rules! address_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            /// Returns true if the address is a multiple of `align`, a power of two.
            #[inline]
            pub const fn is_aligned(self, align: usize) -> bool {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                self.0 & (align - 1) == 0
            }

            /// Byte offset within the page or frame.
            #[inline]
            pub const fn page_offset(self) -> usize {
                self.0 & (arch::PAGE_SIZE - 1)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_tuple(stringify!($name))
                    .field(&format_args!("{:#06x}", self.0))
                    .finish()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#06x}", self.0)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            /// Offsets the address, re-validating the result.
            #[inline]
            fn add(self, bytes: usize) -> Self {
                Self::new(self.0 + bytes)
            }
        }
    };
}

address_type!(
    /// An address in emulated physical memory.
    ///
    /// Translation entries live at physical addresses; the fault servicer rewrites them
    /// through [`PhysicalMemory`](crate::PhysicalMemory) atomics.
    PhysicalAddress
);

impl PhysicalAddress {
    /// # Panics
    ///
    /// Panics if `addr` is wider than the physical address width of the model.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(
            arch::validate_physical(addr),
            "physical address exceeds maximum width"
        );
        Self(addr)
    }

    #[inline]
    pub const fn frame_number(self) -> FrameNumber {
        FrameNumber::new(self.0 >> arch::PAGE_SHIFT)
    }
}

address_type!(
    /// An address in a 15-bit virtual address space.
    ///
    /// Slots 0-7 of the top-level table cover the per-process user range, slots 12-15 the
    /// system range shared by every address space.
    VirtualAddress
);

impl VirtualAddress {
    /// # Panics
    ///
    /// Panics if `addr` lies outside the virtual address space.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(
            arch::validate_virtual(addr),
            "address is outside the virtual address space"
        );
        Self(addr)
    }

    #[inline]
    pub const fn try_new(addr: usize) -> Option<Self> {
        match arch::validate_virtual(addr) {
            true => Some(Self(addr)),
            false => None,
        }
    }

    /// Index into the table at `level`: 0 is the leaf table, 1 the top-level table.
    #[inline]
    pub const fn table_index(self, level: usize) -> usize {
        arch::page_index(self.0, level)
    }

    #[inline]
    pub const fn top_level_slot(self) -> usize {
        self.table_index(1)
    }

    #[inline]
    pub const fn page_number(self) -> PageNumber {
        PageNumber::new(self.0 >> arch::PAGE_SHIFT)
    }

    /// True for addresses in the shared system range.
    #[inline]
    pub const fn is_system(self) -> bool {
        arch::is_system_slot(self.top_level_slot())
    }

    /// True for addresses in the per-process user range.
    #[inline]
    pub const fn is_user(self) -> bool {
        arch::is_user_slot(self.top_level_slot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod physical_address {
        use super::*;

        #[test]
        #[should_panic(expected = "physical address exceeds maximum width")]
        fn rejects_addresses_beyond_the_model() {
            PhysicalAddress::new(1usize << arch::MAX_PHYSICAL_BITS);
        }

        #[test]
        fn splits_into_frame_and_offset() {
            let addr = PhysicalAddress::new(3 * arch::PAGE_SIZE + 8);
            assert_eq!(addr.frame_number(), FrameNumber::new(3));
            assert_eq!(addr.page_offset(), 8);
            assert_eq!(addr + 8, PhysicalAddress::new(3 * arch::PAGE_SIZE + 16));
        }
    }

    mod virtual_address {
        use super::*;

        #[test]
        #[should_panic(expected = "address is outside the virtual address space")]
        fn rejects_addresses_outside_the_space() {
            VirtualAddress::new(1 << arch::MAX_VIRTUAL_BITS);
        }

        #[test]
        fn try_new_checks_width() {
            assert!(VirtualAddress::try_new(0x8000).is_none());
            assert_eq!(VirtualAddress::try_new(0x7FF8), Some(VirtualAddress::new(0x7FF8)));
        }

        #[test]
        fn walk_indices() {
            // Bits 0-6: offset, bits 7-10: leaf index, bits 11-14: top-level slot.
            let addr = VirtualAddress::new((5 << 11) | (9 << 7) | 0x18);
            assert_eq!(addr.page_offset(), 0x18);
            assert_eq!(addr.table_index(0), 9);
            assert_eq!(addr.top_level_slot(), 5);
            assert_eq!(addr.page_number().start() + 0x18, addr);
        }

        #[test]
        fn user_and_system_ranges() {
            assert!(VirtualAddress::new(0x0100).is_user());
            assert!(!VirtualAddress::new(0x0100).is_system());
            let system = VirtualAddress::new(arch::slot_base(arch::SYSTEM_DATA_SLOT));
            assert!(system.is_system());
            assert!(!system.is_user());
            let window = VirtualAddress::new(arch::slot_base(arch::WINDOW_SLOT));
            assert!(!window.is_system() && !window.is_user());
        }

        #[test]
        fn formatting() {
            let addr = VirtualAddress::new(0x0100);
            assert_eq!(format!("{addr:?}"), "VirtualAddress(0x0100)");
            assert_eq!(format!("{addr}"), "0x0100");
        }
    }
}
