//! Memory technology and access mode definitions

use serde::{Deserialize, Serialize};

/// Page size every memory segment is aligned to
pub const PAGE_SIZE: usize = 4096;

/// Kind of memory slot and queue regions are placed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryTechnology {
    /// Ordinary shared memory
    #[default]
    SharedMemory,
    /// Physically contiguous shared memory (DMA capable)
    PhysContigSharedMemory,
}

impl MemoryTechnology {
    /// Alignment the start of every segment of this technology is guaranteed to have
    pub const fn start_alignment(self) -> usize {
        PAGE_SIZE
    }
}

/// Access mode for a memory mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}
