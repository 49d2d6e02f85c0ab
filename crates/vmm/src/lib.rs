#![cfg_attr(not(test), no_std)]

//! # Polaris Virtual Memory Manager (VMM)
//!
//! The fault-resolution core of a paged virtual memory manager, running on a software model
//! of the translation hardware. It provides:
//!
//! - A frame directory with per-frame share counts, cache colors and backing descriptors.
//! - Two-level translation maps with a recursive self-map and transient mapping windows.
//! - Clone descriptors for frames shared copy-on-write between address spaces.
//! - Address space construction, teardown and structural duplication.
//! - Copy-on-write and dirty-bit fault handlers returning a [`FaultStatus`] that forces the
//!   caller to handle retries.
//! - Lazy propagation of system-range mappings keyed by a global generation counter.
//!
//! Locks are always taken in this order: an address space's working-set lock, then the
//! global frame lock. The process registry's expansion lock may follow the reference address
//! space's working-set lock, never the frame lock.

extern crate alloc;

mod access;
mod address;
mod address_space;
pub mod arch;
mod builder;
mod clone;
mod config;
mod cpu;
mod database;
mod error;
mod external;
mod fault;
mod fork;
mod frame;
mod frame_directory;
mod mapping;
mod numbers;
mod physical;
mod registry;
mod tlb;
mod translation;
mod vmm;
mod window;

#[cfg(test)]
mod test_support;

pub use address::{PhysicalAddress, VirtualAddress};
pub use address_space::{
    AddressSpace, DirectoryBase, DuplicationGuard, SpaceId, StructuralFrames, WorkingSet,
    WorkingSetGuard,
};
pub use arch::{CowState, EntryFlags, TranslationEntry};
pub use clone::{CloneDescriptor, CloneId, CloneRegistry};
pub use config::{PROCESS_COMMIT_CHARGE, VmmConfig};
pub use cpu::{CpuId, CpuSet, PreemptionGuard};
pub use database::{CommitLedger, FrameDatabase, FrameLockGuard};
pub use error::{AccessError, Exhaustion, FaultStatus, InvariantViolation, RetryReason, VmmError};
pub use external::{
    Collaborators, FrameAllocator, FreeFrameList, PageFileLedger, PageFileSlot, PagingFile,
    WorkingSetIndex, WorkingSetTracker, WsIndex,
};
pub use fault::{Access, CopyOutcome, FaultKind, FaultOutcome, FaultStats};
pub use frame::{Backing, FrameDescriptor, Owner};
pub use frame_directory::{FrameDirectory, ShareRelease};
pub use mapping::PageMapping;
pub use numbers::{FrameNumber, PageNumber};
pub use physical::PhysicalMemory;
pub use registry::{ExpansionGuard, ProcessRegistry, needs_sync};
pub use tlb::{FlushScope, SoftwareTlb, TlbStats};
pub use translation::{EntryLocation, TranslationMap};
pub use vmm::Vmm;
pub use window::TransientMapping;

pub use arch::PAGE_SIZE;
