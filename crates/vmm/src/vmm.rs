//! The memory manager aggregate.

use alloc::sync::Arc;

use spin::Mutex;

use crate::{
    AddressSpace, CloneId, Collaborators, CpuSet, EntryFlags, Exhaustion, FaultStats,
    FlushScope, FrameDatabase, FrameDescriptor, FrameLockGuard, FrameNumber, PageFileSlot,
    PhysicalMemory, ProcessRegistry, SoftwareTlb, SpaceId, StructuralFrames, TlbStats,
    TranslationEntry, TranslationMap, VirtualAddress, VmmConfig, VmmError,
    arch, config::PROCESS_COMMIT_CHARGE, fault::FaultCounters, window::WindowPool,
};

/// Flags of a top-level entry referencing a kernel-owned table.
pub(crate) const TABLE_FLAGS: EntryFlags = EntryFlags::VALID
    .union(EntryFlags::WRITE)
    .union(EntryFlags::ACCESSED)
    .union(EntryFlags::DIRTY);

/// Flags of a top-level entry referencing a shared system table.
pub(crate) const SYSTEM_TABLE_FLAGS: EntryFlags = TABLE_FLAGS.union(EntryFlags::GLOBAL);

/// Pages charged for the reference address space: its structural pages plus the system data
/// table and the window pool table.
const SYSTEM_COMMIT_CHARGE: usize = PROCESS_COMMIT_CHARGE + 2;

/// The virtual memory manager.
///
/// Owns the emulated physical memory and translation caches, the frame database behind the
/// global frame lock, the process registry and the reference address space that holds the
/// authoritative system mappings.
pub struct Vmm {
    config: VmmConfig,
    memory: PhysicalMemory,
    frames: Mutex<FrameDatabase>,
    registry: ProcessRegistry,
    tlb: SoftwareTlb,
    cpus: CpuSet,
    env: Collaborators,
    window_pool: WindowPool,
    system: Arc<AddressSpace>,
    counters: FaultCounters,
}

impl Vmm {
    /// Creates a memory manager and bootstraps the reference address space.
    pub fn new(config: VmmConfig, env: Collaborators) -> Result<Self, VmmError> {
        assert!(
            config.system_window_entries <= arch::ENTRIES_PER_TABLE,
            "window pool larger than its table"
        );
        let memory = PhysicalMemory::new(config.total_frames());
        let mut database = FrameDatabase::new(config.managed_frames, config.commit_limit);
        if !database.commit_mut().charge(SYSTEM_COMMIT_CHARGE) {
            return Err(VmmError::ResourceExhaustion(Exhaustion::Commit));
        }

        let frames = StructuralFrames {
            top_level: take_system_table(&mut database, &env)?,
            window_table: take_system_table(&mut database, &env)?,
            working_set_bitmap: take_system_table(&mut database, &env)?,
            working_set_list: take_system_table(&mut database, &env)?,
        };
        let data_table = take_system_table(&mut database, &env)?;
        let pool_table = take_system_table(&mut database, &env)?;
        for frame in frames.to_array().into_iter().chain([data_table, pool_table]) {
            memory.zero(frame);
        }

        let map = TranslationMap::new(&memory, frames.top_level);
        map.set_top_entry(
            arch::WINDOW_SLOT,
            TranslationEntry::new(frames.window_table, TABLE_FLAGS),
        );
        map.set_top_entry(
            arch::SELF_MAP_SLOT,
            TranslationEntry::new(frames.top_level, TABLE_FLAGS),
        );
        map.set_top_entry(
            arch::SYSTEM_DATA_SLOT,
            TranslationEntry::new(data_table, SYSTEM_TABLE_FLAGS),
        );
        map.set_top_entry(
            arch::SYSTEM_WINDOW_SLOT,
            TranslationEntry::new(pool_table, SYSTEM_TABLE_FLAGS),
        );
        for (index, frame) in [
            (arch::WORKING_SET_BITMAP_INDEX, frames.working_set_bitmap),
            (arch::WORKING_SET_LIST_INDEX, frames.working_set_list),
        ] {
            memory.store(
                frames.window_table.entry_address(index),
                TranslationEntry::new(frame, TABLE_FLAGS).as_raw(),
            );
        }

        log::debug!(
            "bootstrapped reference address space: top level {}, {} managed frames",
            frames.top_level,
            config.managed_frames
        );

        Ok(Self {
            memory,
            frames: Mutex::new(database),
            registry: ProcessRegistry::new(),
            tlb: SoftwareTlb::new(config.cpu_count),
            cpus: CpuSet::new(config.cpu_count),
            env,
            window_pool: WindowPool::new(pool_table, config.system_window_entries),
            system: Arc::new(AddressSpace::new(SpaceId::SYSTEM, frames, 0, 0)),
            counters: FaultCounters::default(),
            config,
        })
    }

    pub fn config(&self) -> &VmmConfig {
        &self.config
    }

    pub fn memory(&self) -> &PhysicalMemory {
        &self.memory
    }

    pub fn tlb(&self) -> &SoftwareTlb {
        &self.tlb
    }

    pub fn cpus(&self) -> &CpuSet {
        &self.cpus
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.env
    }

    /// Returns the reference address space holding the authoritative system mappings.
    pub fn system_space(&self) -> &Arc<AddressSpace> {
        &self.system
    }

    pub(crate) fn window_pool(&self) -> &WindowPool {
        &self.window_pool
    }

    pub(crate) fn counters(&self) -> &FaultCounters {
        &self.counters
    }

    pub(crate) fn frame_lock(&self) -> &Mutex<FrameDatabase> {
        &self.frames
    }

    /// Acquires the global frame lock. Never hold it while acquiring a working-set lock.
    pub fn lock_frames(&self) -> FrameLockGuard<'_> {
        self.frames.lock()
    }

    /// Returns a snapshot of the descriptor of `frame`.
    pub fn frame_descriptor(&self, frame: FrameNumber) -> Option<FrameDescriptor> {
        self.frames.lock().directory().get(frame).copied()
    }

    /// Returns the reference count of clone descriptor `id`, zero once released.
    pub fn clone_ref_count(&self, id: CloneId) -> usize {
        self.frames.lock().clones().ref_count(id)
    }

    /// Returns the number of committed pages.
    pub fn committed_pages(&self) -> usize {
        self.frames.lock().commit().committed()
    }

    pub fn tlb_stats(&self) -> TlbStats {
        self.tlb.stats()
    }

    pub fn fault_stats(&self) -> FaultStats {
        self.counters.snapshot()
    }

    /// Returns the address space whose working-set lock guards the entry for `va`.
    pub(crate) fn owner_of<'a>(
        &'a self,
        space: &'a AddressSpace,
        va: VirtualAddress,
    ) -> Result<&'a AddressSpace, VmmError> {
        let slot = va.top_level_slot();
        if va.is_user() {
            Ok(space)
        } else if va.is_system() && slot != arch::SYSTEM_WINDOW_SLOT {
            Ok(&self.system)
        } else {
            Err(VmmError::InvalidAddress)
        }
    }

    /// Returns the invalidation scope for a rewritten entry of `owner`.
    pub(crate) fn flush_scope(&self, owner: &AddressSpace, va: VirtualAddress) -> FlushScope {
        if va.is_system() {
            FlushScope::Global
        } else {
            FlushScope::Process(owner.id())
        }
    }

    /// Installs a new shared system table in top-level `slot` of the reference address space
    /// and advances the system-mapping generation. Returns the new generation.
    ///
    /// Other address spaces pick the table up lazily through
    /// [`sync_system_mappings`](Self::sync_system_mappings).
    pub fn grow_system_range(&self, slot: usize) -> Result<u64, VmmError> {
        if !arch::is_system_slot(slot) || slot == arch::SYSTEM_WINDOW_SLOT {
            return Err(VmmError::InvalidAddress);
        }
        let table = {
            let mut frames = self.lock_frames();
            if !frames.commit_mut().charge(1) {
                return Err(VmmError::ResourceExhaustion(Exhaustion::Commit));
            }
            match frames.allocate(&self.env, slot, |f| FrameDescriptor::table(f, SpaceId::SYSTEM)) {
                Some(table) => table,
                None => {
                    frames.commit_mut().uncharge(1);
                    return Err(VmmError::ResourceExhaustion(Exhaustion::Frames));
                }
            }
        };
        self.memory.zero(table);

        let map = self.system.translation(&self.memory);
        let expansion = self.registry.lock_expansion();
        if map.top_entry(slot).is_valid() {
            drop(expansion);
            let mut frames = self.lock_frames();
            frames.drop_share(table, &self.env);
            frames.commit_mut().uncharge(1);
            return Err(VmmError::AlreadyMapped);
        }
        map.set_top_entry(slot, TranslationEntry::new(table, SYSTEM_TABLE_FLAGS));
        let generation = self.registry.advance_generation(&expansion);
        self.system.set_synced_generation(generation);
        log::debug!("system range grew into slot {slot}, generation {generation}");
        Ok(generation)
    }

    /// Starts writing the page at `va` back to the paging file.
    ///
    /// The entry is cleaned so that the next write raises a dirty-bit fault. Returns the frame
    /// being written.
    pub fn begin_write_back(
        &self,
        space: &AddressSpace,
        va: VirtualAddress,
    ) -> Result<FrameNumber, VmmError> {
        let owner = self.owner_of(space, va)?;
        let _ws = owner.lock_working_set();
        let map = owner.translation(&self.memory);
        let (location, entry) = map
            .translate(va)
            .filter(|(_, entry)| entry.is_valid())
            .ok_or(VmmError::NotMapped)?;
        let frame = entry.frame();
        {
            let mut frames = self.lock_frames();
            let descriptor = frames
                .directory_mut()
                .get_mut(frame)
                .filter(|d| d.is_page() && !d.write_in_progress)
                .filter(|d| !matches!(d.backing, crate::Backing::Clone(_)))
                .ok_or(VmmError::InvalidFrame)?;
            descriptor.write_in_progress = true;
            descriptor.modified = false;
        }
        map.clear_flags(location, EntryFlags::DIRTY);
        self.tlb
            .invalidate(self.flush_scope(owner, va), va.page_number());
        log::trace!("write-back of frame {frame} started");
        Ok(frame)
    }

    /// Completes a write-back of `frame` into `slot`.
    ///
    /// Returns true if the frame was freed because its last mapping went away meanwhile.
    pub fn complete_write_back(
        &self,
        frame: FrameNumber,
        slot: PageFileSlot,
    ) -> Result<bool, VmmError> {
        let freed = self
            .lock_frames()
            .finish_write_back(frame, slot, &self.env)
            .ok_or(VmmError::InvalidFrame)?;
        log::trace!("write-back of frame {frame} completed into {slot:?}, freed: {freed}");
        Ok(freed)
    }
}

fn take_system_table(
    database: &mut FrameDatabase,
    env: &Collaborators,
) -> Result<FrameNumber, VmmError> {
    database
        .allocate(env, 0, |frame| FrameDescriptor::table(frame, SpaceId::SYSTEM))
        .ok_or(VmmError::ResourceExhaustion(Exhaustion::Frames))
}
