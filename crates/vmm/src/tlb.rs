//! Software translation cache.
//!
//! Each emulated CPU caches translation entries keyed by address space and page. A cached
//! entry stays visible after the entry in memory changes, exactly like a hardware TLB, until
//! one of the invalidation operations removes it.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::ops::Range;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::{CpuId, PageNumber, SpaceId, TranslationEntry};

/// Which cached translations an invalidation reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushScope {
    /// The page on a single CPU, for every address space.
    Cpu(CpuId),
    /// The page of one address space, on every CPU.
    Process(SpaceId),
    /// The page of every address space, on every CPU.
    Global,
}

/// Invalidation counts by scope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TlbStats {
    pub local: u64,
    pub process: u64,
    pub global: u64,
}

type CpuCache = spin::Mutex<BTreeMap<(SpaceId, PageNumber), TranslationEntry>>;

/// Per-CPU translation caches.
pub struct SoftwareTlb {
    caches: Box<[CpuCache]>,
    local: AtomicU64,
    process: AtomicU64,
    global: AtomicU64,
}

impl SoftwareTlb {
    /// Creates empty caches for `cpu_count` CPUs.
    pub fn new(cpu_count: usize) -> Self {
        let caches: Vec<CpuCache> = (0..cpu_count)
            .map(|_| spin::Mutex::new(BTreeMap::new()))
            .collect();
        Self {
            caches: caches.into_boxed_slice(),
            local: AtomicU64::new(0),
            process: AtomicU64::new(0),
            global: AtomicU64::new(0),
        }
    }

    fn cache(&self, cpu: CpuId) -> &CpuCache {
        self.caches
            .get(cpu.as_usize())
            .unwrap_or_else(|| panic!("no such CPU: {cpu:?}"))
    }

    /// Returns the cached translation of `page` in `space` on `cpu`.
    pub fn lookup(&self, cpu: CpuId, space: SpaceId, page: PageNumber) -> Option<TranslationEntry> {
        self.cache(cpu).lock().get(&(space, page)).copied()
    }

    /// Caches `entry` as the translation of `page` in `space` on `cpu`.
    pub fn fill(&self, cpu: CpuId, space: SpaceId, page: PageNumber, entry: TranslationEntry) {
        #[cfg(feature = "detailed-logging")]
        log::trace!("tlb fill on {cpu:?}: {space:?} page {page} -> {entry:?}");
        self.cache(cpu).lock().insert((space, page), entry);
    }

    /// Invalidates the cached translations of `page` reached by `scope`.
    pub fn invalidate(&self, scope: FlushScope, page: PageNumber) {
        self.invalidate_range(scope, page..page + 1);
    }

    /// Invalidates the cached translations of every page in `pages` reached by `scope`.
    pub fn invalidate_range(&self, scope: FlushScope, pages: Range<PageNumber>) {
        #[cfg(feature = "detailed-logging")]
        log::trace!("tlb invalidate {scope:?}: pages {}..{}", pages.start, pages.end);
        let in_range = |page: &PageNumber| *page >= pages.start && *page < pages.end;
        match scope {
            FlushScope::Cpu(cpu) => {
                self.local.fetch_add(1, Ordering::Relaxed);
                self.cache(cpu)
                    .lock()
                    .retain(|(_, page), _| !in_range(page));
            }
            FlushScope::Process(target) => {
                self.process.fetch_add(1, Ordering::Relaxed);
                for cache in self.caches.iter() {
                    cache
                        .lock()
                        .retain(|(space, page), _| *space != target || !in_range(page));
                }
            }
            FlushScope::Global => {
                self.global.fetch_add(1, Ordering::Relaxed);
                for cache in self.caches.iter() {
                    cache.lock().retain(|(_, page), _| !in_range(page));
                }
            }
        }
    }

    /// Drops every cached translation of `space`, used when the address space is destroyed.
    pub fn flush_space(&self, space: SpaceId) {
        for cache in self.caches.iter() {
            cache.lock().retain(|(owner, _), _| *owner != space);
        }
    }

    /// Returns the invalidation counts.
    pub fn stats(&self) -> TlbStats {
        TlbStats {
            local: self.local.load(Ordering::Relaxed),
            process: self.process.load(Ordering::Relaxed),
            global: self.global.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EntryFlags, FrameNumber};

    fn entry(frame: usize) -> TranslationEntry {
        TranslationEntry::new(FrameNumber::new(frame), EntryFlags::VALID)
    }

    const A: SpaceId = SpaceId::new(1);
    const B: SpaceId = SpaceId::new(2);

    #[test]
    fn cached_entry_is_stale_until_invalidated() {
        let tlb = SoftwareTlb::new(2);
        let (cpu, page) = (CpuId::new(0), PageNumber::new(5));
        tlb.fill(cpu, A, page, entry(1));
        // The cache keeps answering with the old entry.
        assert_eq!(tlb.lookup(cpu, A, page), Some(entry(1)));
        tlb.invalidate(FlushScope::Cpu(cpu), page);
        assert_eq!(tlb.lookup(cpu, A, page), None);
    }

    #[test]
    fn cpu_scope_leaves_other_cpus() {
        let tlb = SoftwareTlb::new(2);
        let page = PageNumber::new(3);
        tlb.fill(CpuId::new(0), A, page, entry(1));
        tlb.fill(CpuId::new(1), A, page, entry(1));
        tlb.invalidate(FlushScope::Cpu(CpuId::new(0)), page);
        assert_eq!(tlb.lookup(CpuId::new(0), A, page), None);
        assert_eq!(tlb.lookup(CpuId::new(1), A, page), Some(entry(1)));
        assert_eq!(tlb.stats().local, 1);
    }

    #[test]
    fn process_scope_leaves_other_spaces() {
        let tlb = SoftwareTlb::new(2);
        let page = PageNumber::new(3);
        for cpu in [CpuId::new(0), CpuId::new(1)] {
            tlb.fill(cpu, A, page, entry(1));
            tlb.fill(cpu, B, page, entry(2));
        }
        tlb.invalidate(FlushScope::Process(A), page);
        for cpu in [CpuId::new(0), CpuId::new(1)] {
            assert_eq!(tlb.lookup(cpu, A, page), None);
            assert_eq!(tlb.lookup(cpu, B, page), Some(entry(2)));
        }
    }

    #[test]
    fn global_range_and_space_flush() {
        let tlb = SoftwareTlb::new(1);
        let cpu = CpuId::new(0);
        for n in 0..4 {
            tlb.fill(cpu, A, PageNumber::new(n), entry(n));
            tlb.fill(cpu, B, PageNumber::new(n), entry(n));
        }
        tlb.invalidate_range(FlushScope::Global, PageNumber::new(1)..PageNumber::new(3));
        assert!(tlb.lookup(cpu, A, PageNumber::new(0)).is_some());
        assert!(tlb.lookup(cpu, B, PageNumber::new(2)).is_none());
        assert!(tlb.lookup(cpu, A, PageNumber::new(3)).is_some());
        tlb.flush_space(A);
        assert!(tlb.lookup(cpu, A, PageNumber::new(0)).is_none());
        assert!(tlb.lookup(cpu, B, PageNumber::new(0)).is_some());
        assert_eq!(tlb.stats().global, 1);
    }

    #[test]
    #[should_panic(expected = "no such CPU")]
    fn unknown_cpu_panics() {
        SoftwareTlb::new(2).lookup(CpuId::new(2), A, PageNumber::new(0));
    }
}
