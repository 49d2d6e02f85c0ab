//! Shared fixtures for the unit tests.

use alloc::sync::Arc;

use crate::{Collaborators, FreeFrameList, PageFileLedger, Vmm, VmmConfig, WorkingSetIndex};

/// Creates a memory manager over the reference collaborators.
pub(crate) fn reference_vmm(config: VmmConfig) -> Vmm {
    reference_vmm_with_ledger(config).0
}

/// Creates a memory manager over the reference collaborators, returning handles to the free
/// frame list and the paging file ledger for inspection.
pub(crate) fn reference_vmm_with_ledger(
    config: VmmConfig,
) -> (Vmm, Arc<FreeFrameList>, Arc<PageFileLedger>) {
    let frames = Arc::new(FreeFrameList::new(0..config.managed_frames));
    let paging = Arc::new(PageFileLedger::new());
    let env = Collaborators::new(
        frames.clone(),
        paging.clone(),
        Arc::new(WorkingSetIndex::new()),
    );
    let vmm = Vmm::new(config, env).expect("bootstrap of the reference address space");
    (vmm, frames, paging)
}
