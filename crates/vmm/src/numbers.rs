//! Frame and page numbers.

use core::fmt;
use core::ops::{Add, Sub};

use crate::{
    address::{PhysicalAddress, VirtualAddress},
    arch,
};

/// Defines a page-granular index type. Numbers are unchecked; the address they start at is
/// validated when it is formed.
macro_rules! number_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            #[inline]
            pub const fn new(number: usize) -> Self {
                Self(number)
            }

            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_tuple(stringify!($name)).field(&self.0).finish()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, count: usize) -> Self {
                Self(self.0 + count)
            }
        }

        /// Distance in pages.
        impl Sub for $name {
            type Output = usize;

            #[inline]
            fn sub(self, earlier: Self) -> usize {
                self.0 - earlier.0
            }
        }
    };
}

number_type!(
    /// Index of a physical frame.
    ///
    /// Frames below the managed count carry a descriptor in the frame directory; the I/O
    /// frames above it never do.
    FrameNumber
);

impl FrameNumber {
    #[inline]
    pub const fn start(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 << arch::PAGE_SHIFT)
    }

    /// Physical address of entry `index` when this frame holds a translation table.
    #[inline]
    pub const fn entry_address(self, index: usize) -> PhysicalAddress {
        assert!(index < arch::ENTRIES_PER_TABLE, "table index out of bounds");
        PhysicalAddress::new((self.0 << arch::PAGE_SHIFT) + index * arch::ENTRY_SIZE)
    }
}

number_type!(
    /// Index of a virtual page.
    PageNumber
);

impl PageNumber {
    #[inline]
    pub const fn start(self) -> VirtualAddress {
        VirtualAddress::new(self.0 << arch::PAGE_SHIFT)
    }
}

impl From<PhysicalAddress> for FrameNumber {
    #[inline]
    fn from(addr: PhysicalAddress) -> Self {
        addr.frame_number()
    }
}

impl From<VirtualAddress> for PageNumber {
    #[inline]
    fn from(addr: VirtualAddress) -> Self {
        addr.page_number()
    }
}
