//! Emulated CPUs and preemption control.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Identifies an emulated CPU.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CpuId(usize);

impl CpuId {
    /// Creates a CPU identifier.
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    /// Returns the CPU index.
    pub const fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Debug for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CpuId({})", self.0)
    }
}

/// Per-CPU preemption state.
pub struct CpuSet {
    preempt_counts: Box<[AtomicUsize]>,
}

impl CpuSet {
    /// Creates `count` CPUs, all preemptible.
    pub fn new(count: usize) -> Self {
        assert!(count > 0, "at least one CPU is required");
        let counts: Vec<AtomicUsize> = (0..count).map(|_| AtomicUsize::new(0)).collect();
        Self {
            preempt_counts: counts.into_boxed_slice(),
        }
    }

    /// Returns the number of CPUs.
    pub fn count(&self) -> usize {
        self.preempt_counts.len()
    }

    /// Iterates over all CPUs.
    pub fn iter(&self) -> impl Iterator<Item = CpuId> + '_ {
        (0..self.count()).map(CpuId)
    }

    /// Disables preemption on `cpu` until the returned guard is dropped. Nests.
    ///
    /// # Panics
    ///
    /// Panics if `cpu` does not exist.
    pub fn disable_preemption(&self, cpu: CpuId) -> PreemptionGuard<'_> {
        let count = self
            .preempt_counts
            .get(cpu.0)
            .unwrap_or_else(|| panic!("no such CPU: {cpu:?}"));
        count.fetch_add(1, Ordering::AcqRel);
        PreemptionGuard { count, cpu }
    }

    /// Returns true if preemption is disabled on `cpu`.
    pub fn preemption_disabled(&self, cpu: CpuId) -> bool {
        self.preempt_counts
            .get(cpu.0)
            .is_some_and(|count| count.load(Ordering::Acquire) > 0)
    }
}

/// Keeps preemption disabled on one CPU. Holding one proves the code runs on that CPU.
pub struct PreemptionGuard<'a> {
    count: &'a AtomicUsize,
    cpu: CpuId,
}

impl PreemptionGuard<'_> {
    /// Returns the CPU this guard pins.
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }
}

impl Drop for PreemptionGuard<'_> {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guards_nest() {
        let cpus = CpuSet::new(2);
        let cpu = CpuId::new(1);
        {
            let outer = cpus.disable_preemption(cpu);
            let _inner = cpus.disable_preemption(cpu);
            assert_eq!(outer.cpu(), cpu);
            assert!(cpus.preemption_disabled(cpu));
            assert!(!cpus.preemption_disabled(CpuId::new(0)));
        }
        assert!(!cpus.preemption_disabled(cpu));
    }

    #[test]
    #[should_panic(expected = "no such CPU")]
    fn unknown_cpu_panics() {
        CpuSet::new(1).disable_preemption(CpuId::new(4));
    }
}
