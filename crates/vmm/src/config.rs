//! Memory manager configuration.

/// Pages charged against the commit limit for every address space: the top-level table, the
/// transient window table, the working-set bitmap and the working-set list.
pub const PROCESS_COMMIT_CHARGE: usize = 4;

/// Number of cache colors. A frame's color is its frame number modulo this value.
pub const CACHE_COLORS: usize = 4;

/// Tunables for a [`Vmm`](crate::Vmm) instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmmConfig {
    /// Number of emulated CPUs.
    pub cpu_count: usize,
    /// Number of frames tracked by the frame directory.
    pub managed_frames: usize,
    /// Number of unmanaged frames placed after the managed ones, e.g. for device memory.
    pub io_frames: usize,
    /// Maximum number of pages that may be committed at once.
    pub commit_limit: usize,
    /// Copy-on-write faults retry instead of allocating below this many free frames.
    pub low_watermark: usize,
    /// Number of entries in the shared transient window pool.
    pub system_window_entries: usize,
}

impl VmmConfig {
    /// Returns the total number of emulated frames.
    pub const fn total_frames(&self) -> usize {
        self.managed_frames + self.io_frames
    }
}

impl Default for VmmConfig {
    fn default() -> Self {
        Self {
            cpu_count: 4,
            managed_frames: 256,
            io_frames: 4,
            commit_limit: 512,
            low_watermark: 2,
            system_window_entries: 8,
        }
    }
}
