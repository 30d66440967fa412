//! POSIX shared memory provider

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use shared_memory::{Shmem, ShmemConf, ShmemError};

use crate::error::MemoryError;
use crate::layout::MemoryRange;
use crate::memory::{
    Mapping, MemoryExchangeHandle, MemoryObject, MemoryProvider, ReadWritableMemory,
    ReadableMemory,
};
use crate::storage::MemoryTechnology;

/// Shared memory region wrapper
pub struct SharedMemory {
    inner: Shmem,
    os_id: String,
    size: usize,
}

// SAFETY: the mapping is process-wide; concurrent access goes through views
// that use atomics or volatile copies.
unsafe impl Send for SharedMemory {}
unsafe impl Sync for SharedMemory {}

fn map_shmem_error(e: ShmemError) -> MemoryError {
    match e {
        ShmemError::MapSizeZero => MemoryError::InvalidSize(0),
        ShmemError::MapOpenFailed(_) => MemoryError::InvalidHandle,
        other => MemoryError::SharedMemory(other.to_string()),
    }
}

impl SharedMemory {
    /// Create a new shared memory region, unlinked again when dropped
    pub fn create(os_id: &str, size: usize) -> Result<Self, MemoryError> {
        let shmem = ShmemConf::new()
            .size(size)
            .os_id(os_id)
            .create()
            .map_err(map_shmem_error)?;

        Ok(Self {
            inner: shmem,
            os_id: os_id.to_string(),
            size,
        })
    }

    /// Open an existing shared memory region
    pub fn open(os_id: &str) -> Result<Self, MemoryError> {
        let shmem = ShmemConf::new()
            .os_id(os_id)
            .open()
            .map_err(map_shmem_error)?;

        let size = shmem.len();

        Ok(Self {
            inner: shmem,
            os_id: os_id.to_string(),
            size,
        })
    }

    /// Get the OS identifier of the shared memory region
    pub fn os_id(&self) -> &str {
        &self.os_id
    }

    /// Get the size of the shared memory region
    pub fn size(&self) -> usize {
        self.size
    }
}

unsafe impl Mapping for SharedMemory {
    fn as_ptr(&self) -> *mut u8 {
        self.inner.as_ptr()
    }

    fn len(&self) -> usize {
        self.size
    }
}

/// Exchange handle naming a shared memory region
///
/// Serializable, so it can travel over any side channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShmemHandle {
    os_id: String,
    size: usize,
}

impl ShmemHandle {
    /// Handle for the segment `os_id` of `size` bytes
    pub fn new(os_id: impl Into<String>, size: usize) -> Self {
        Self {
            os_id: os_id.into(),
            size,
        }
    }

    /// Build a handle for an existing region, discovering its size
    pub fn open(os_id: &str) -> Result<Self, MemoryError> {
        let shm = SharedMemory::open(os_id)?;
        Ok(Self::new(os_id, shm.size()))
    }

    /// Get OS id of the segment
    pub fn os_id(&self) -> &str {
        &self.os_id
    }

    fn map(&self) -> Result<Arc<SharedMemory>, MemoryError> {
        let shm = SharedMemory::open(&self.os_id)?;
        // The OS may round the mapping up to whole pages.
        if shm.size() < self.size {
            return Err(MemoryError::SizeMismatch {
                expected: self.size,
                actual: shm.size(),
            });
        }
        Ok(Arc::new(shm))
    }
}

impl MemoryExchangeHandle for ShmemHandle {
    fn memory_size(&self) -> Result<usize, MemoryError> {
        Ok(self.size)
    }

    fn readable(&self, range: MemoryRange) -> Result<ReadableMemory, MemoryError> {
        ReadableMemory::new(self.map()?).sub_range(range)
    }

    fn read_writable(&self, range: MemoryRange) -> Result<ReadWritableMemory, MemoryError> {
        ReadWritableMemory::new(self.map()?).sub_range(range)
    }
}

/// Provider allocating named POSIX shared memory regions
///
/// Regions are named `<prefix>_<pid>_<counter>` and unlinked when the
/// allocating [`MemoryObject`] and all its views are gone.
#[derive(Debug)]
pub struct ShmemProvider {
    prefix: String,
    counter: AtomicU32,
}

impl ShmemProvider {
    /// Provider naming its segments after `prefix`
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: AtomicU32::new(0),
        }
    }

    /// OS id the `nth` allocation of process `pid` receives
    pub fn os_id_for(prefix: &str, pid: u32, nth: u32) -> String {
        format!("{}_{}_{}", prefix, pid, nth)
    }
}

impl MemoryProvider for ShmemProvider {
    fn allocate(
        &self,
        technology: MemoryTechnology,
        size: usize,
    ) -> Result<MemoryObject, MemoryError> {
        if technology != MemoryTechnology::SharedMemory {
            return Err(MemoryError::UnsupportedType(technology));
        }
        if size == 0 {
            return Err(MemoryError::InvalidSize(size));
        }
        let nth = self.counter.fetch_add(1, Ordering::Relaxed);
        let os_id = Self::os_id_for(&self.prefix, std::process::id(), nth);
        let shm = SharedMemory::create(&os_id, size)?;
        tracing::debug!(os_id = %os_id, size, "created shared memory region");

        let handle = Arc::new(ShmemHandle::new(os_id, size));
        Ok(MemoryObject::new(Arc::new(shm), handle, technology))
    }
}
