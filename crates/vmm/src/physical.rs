//! Emulated physical memory.
//!
//! Physical memory is a flat array of 64-bit words addressed by [`PhysicalAddress`]. Every
//! word is an [`AtomicU64`] so that translation entries, which live in ordinary frames, can be
//! rewritten with compare-and-exchange while other CPUs read them.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::{FrameNumber, PhysicalAddress, arch};

/// Word-addressable emulated physical memory.
pub struct PhysicalMemory {
    words: Box<[AtomicU64]>,
}

impl PhysicalMemory {
    /// Creates zero-filled physical memory holding `frame_count` frames.
    ///
    /// # Panics
    ///
    /// Panics if the memory would exceed the maximum physical address width.
    pub fn new(frame_count: usize) -> Self {
        assert!(
            arch::validate_physical(frame_count * arch::PAGE_SIZE - 1),
            "physical memory exceeds maximum width"
        );
        let words: Vec<AtomicU64> = (0..frame_count * arch::WORDS_PER_PAGE)
            .map(|_| AtomicU64::new(0))
            .collect();
        Self {
            words: words.into_boxed_slice(),
        }
    }

    /// Returns the number of frames backed by this memory.
    pub fn frame_count(&self) -> usize {
        self.words.len() / arch::WORDS_PER_PAGE
    }

    /// Returns true if `frame` lies within this memory.
    pub fn contains(&self, frame: FrameNumber) -> bool {
        frame.as_usize() < self.frame_count()
    }

    fn word(&self, addr: PhysicalAddress) -> &AtomicU64 {
        assert!(addr.is_aligned(8), "physical access must be word aligned");
        &self.words[addr.as_usize() / 8]
    }

    /// Loads the word at `addr`.
    pub fn load(&self, addr: PhysicalAddress) -> u64 {
        self.word(addr).load(Ordering::Acquire)
    }

    /// Stores `value` to the word at `addr`.
    pub fn store(&self, addr: PhysicalAddress, value: u64) {
        self.word(addr).store(value, Ordering::Release);
    }

    /// Atomically replaces the word at `addr` if it still holds `current`.
    pub fn compare_exchange(
        &self,
        addr: PhysicalAddress,
        current: u64,
        new: u64,
    ) -> Result<u64, u64> {
        self.word(addr)
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
    }

    /// Atomically replaces the word at `addr`, returning the previous value.
    pub fn swap(&self, addr: PhysicalAddress, value: u64) -> u64 {
        self.word(addr).swap(value, Ordering::AcqRel)
    }

    /// Atomically ORs `bits` into the word at `addr`, returning the previous value.
    pub fn fetch_or(&self, addr: PhysicalAddress, bits: u64) -> u64 {
        self.word(addr).fetch_or(bits, Ordering::AcqRel)
    }

    /// Zero-fills `frame`.
    pub fn zero(&self, frame: FrameNumber) {
        let base = frame.start();
        for word in 0..arch::WORDS_PER_PAGE {
            self.store(base + word * 8, 0);
        }
    }

    /// Copies the contents of frame `src` into frame `dst`.
    pub fn copy(&self, src: FrameNumber, dst: FrameNumber) {
        let (src, dst) = (src.start(), dst.start());
        for word in 0..arch::WORDS_PER_PAGE {
            self.store(dst + word * 8, self.load(src + word * 8));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_zeroed() {
        let memory = PhysicalMemory::new(4);
        assert_eq!(memory.frame_count(), 4);
        assert_eq!(memory.load(FrameNumber::new(3).start() + 8), 0);
    }

    #[test]
    fn copy_and_zero() {
        let memory = PhysicalMemory::new(2);
        let (a, b) = (FrameNumber::new(0), FrameNumber::new(1));
        memory.store(a.start() + 16, 0xDEAD);
        memory.copy(a, b);
        assert_eq!(memory.load(b.start() + 16), 0xDEAD);
        memory.zero(a);
        assert_eq!(memory.load(a.start() + 16), 0);
        assert_eq!(memory.load(b.start() + 16), 0xDEAD);
    }

    #[test]
    fn compare_exchange_detects_change() {
        let memory = PhysicalMemory::new(1);
        let addr = PhysicalAddress::new(8);
        assert_eq!(memory.compare_exchange(addr, 0, 5), Ok(0));
        assert_eq!(memory.compare_exchange(addr, 0, 6), Err(5));
        assert_eq!(memory.fetch_or(addr, 2), 5);
        assert_eq!(memory.load(addr), 7);
    }

    #[test]
    #[should_panic(expected = "word aligned")]
    fn unaligned_access_panics() {
        PhysicalMemory::new(1).load(PhysicalAddress::new(3));
    }
}
