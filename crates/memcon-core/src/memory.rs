//! Memory objects, exchange handles and typed views
//!
//! A [`MemoryProvider`] allocates [`MemoryObject`]s. Each object can hand out
//! an exchange handle that another party uses to map the same memory. Mapped
//! memory is reached through [`ReadableMemory`] / [`ReadWritableMemory`], and
//! typed access through [`ReadView`] / [`WriteView`]. Views keep the mapping
//! alive and carry the declared mutability, so pointers never escape without
//! the access rights they were created with.

use std::alloc::{self, Layout};
use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use crate::error::{Error, MemoryError, Result};
use crate::layout::MemoryRange;
use crate::storage::{AccessMode, MemoryTechnology, PAGE_SIZE};

/// A mapping of memory into this process
///
/// # Safety
///
/// `as_ptr` must return the start of `len` bytes that stay mapped for as long
/// as the implementor is alive.
pub unsafe trait Mapping: Send + Sync {
    fn as_ptr(&self) -> *mut u8;
    fn len(&self) -> usize;
}

/// Process-portable token to memory of another party
pub trait MemoryExchangeHandle: Send + Sync + fmt::Debug {
    /// Total size of the memory behind the handle
    fn memory_size(&self) -> std::result::Result<usize, MemoryError>;

    /// Map `range` of the memory for reading
    fn readable(&self, range: MemoryRange) -> std::result::Result<ReadableMemory, MemoryError>;

    /// Map `range` of the memory for reading and writing
    fn read_writable(
        &self,
        range: MemoryRange,
    ) -> std::result::Result<ReadWritableMemory, MemoryError>;
}

/// Shared exchange handle as passed around the handshake
pub type ExchangeHandle = Arc<dyn MemoryExchangeHandle>;

/// Allocator of memory objects
pub trait MemoryProvider: Send + Sync {
    /// Allocate `size` zeroed bytes of the given technology
    fn allocate(
        &self,
        technology: MemoryTechnology,
        size: usize,
    ) -> std::result::Result<MemoryObject, MemoryError>;
}

/// Memory allocated by this process through a [`MemoryProvider`]
#[derive(Clone)]
pub struct MemoryObject {
    mapping: Arc<dyn Mapping>,
    handle: ExchangeHandle,
    technology: MemoryTechnology,
}

impl MemoryObject {
    /// Wrap a mapping created by a provider
    pub fn new(mapping: Arc<dyn Mapping>, handle: ExchangeHandle, technology: MemoryTechnology) -> Self {
        Self {
            mapping,
            handle,
            technology,
        }
    }

    /// Get size in bytes
    pub fn size(&self) -> usize {
        self.mapping.len()
    }

    /// Get memory technology
    pub fn technology(&self) -> MemoryTechnology {
        self.technology
    }

    /// Whole object, read-only
    pub fn readable(&self) -> ReadableMemory {
        ReadableMemory::new(self.mapping.clone())
    }

    /// Read-only view of `range`
    pub fn readable_range(&self, range: MemoryRange) -> std::result::Result<ReadableMemory, MemoryError> {
        self.readable().sub_range(range)
    }

    /// Whole object, read-write
    pub fn read_writable(&self) -> ReadWritableMemory {
        ReadWritableMemory::new(self.mapping.clone())
    }

    /// Read-write view of `range`
    pub fn read_writable_range(
        &self,
        range: MemoryRange,
    ) -> std::result::Result<ReadWritableMemory, MemoryError> {
        self.read_writable().sub_range(range)
    }

    /// Handle a peer can use to map this object
    pub fn exchange_handle(&self) -> ExchangeHandle {
        self.handle.clone()
    }
}

impl fmt::Debug for MemoryObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryObject")
            .field("size", &self.size())
            .field("technology", &self.technology)
            .field("handle", &self.handle)
            .finish()
    }
}

macro_rules! memory_region {
    ($name:ident, $mode:expr) => {
        /// A mapped byte region
        #[derive(Clone)]
        pub struct $name {
            mapping: Arc<dyn Mapping>,
            offset: usize,
            len: usize,
        }

        impl $name {
            /// Wrap a whole mapping
            pub fn new(mapping: Arc<dyn Mapping>) -> Self {
                let len = mapping.len();
                Self {
                    mapping,
                    offset: 0,
                    len,
                }
            }

            /// Size in bytes
            pub fn len(&self) -> usize {
                self.len
            }

            /// Whether the region is empty
            pub fn is_empty(&self) -> bool {
                self.len == 0
            }

            /// Get access mode
            pub fn access_mode(&self) -> AccessMode {
                $mode
            }

            /// Get start pointer
            pub fn as_ptr(&self) -> *const u8 {
                // SAFETY: offset + len never exceeds the mapping length.
                unsafe { self.mapping.as_ptr().add(self.offset) }
            }

            /// Narrow the region to `range`, relative to its start
            pub fn sub_range(&self, range: MemoryRange) -> std::result::Result<Self, MemoryError> {
                if !range.fits_in(self.len) {
                    return Err(MemoryError::OutOfBounds {
                        offset: range.offset(),
                        size: range.size(),
                        available: self.len,
                    });
                }
                Ok(Self {
                    mapping: self.mapping.clone(),
                    offset: self.offset + range.offset(),
                    len: range.size(),
                })
            }

            /// Read-only typed view of `range`
            pub fn read_view<T>(&self, range: MemoryRange) -> Result<ReadView<T>> {
                let (ptr, len) = self.typed_parts::<T>(range)?;
                Ok(ReadView {
                    mapping: self.mapping.clone(),
                    ptr,
                    len,
                    _marker: PhantomData,
                })
            }

            fn typed_parts<T>(&self, range: MemoryRange) -> Result<(NonNull<T>, usize)> {
                let elem = mem::size_of::<T>();
                assert!(elem > 0, "zero-sized types cannot be viewed");
                if !range.fits_in(self.len) {
                    return Err(Error::InvalidConfiguration(format!(
                        "range {}+{} is outside of a {} byte region",
                        range.offset(),
                        range.size(),
                        self.len
                    )));
                }
                if range.size() == 0 || range.size() % elem != 0 {
                    return Err(Error::InvalidConfiguration(format!(
                        "range size {} is not a non-zero multiple of {elem}",
                        range.size()
                    )));
                }
                // SAFETY: the range lies within the region checked above.
                let ptr = unsafe { self.as_ptr().add(range.offset()) } as *mut T;
                if ptr as usize % mem::align_of::<T>() != 0 {
                    return Err(Error::InvalidConfiguration(format!(
                        "offset {} is not aligned to {}",
                        range.offset(),
                        mem::align_of::<T>()
                    )));
                }
                let ptr = NonNull::new(ptr).ok_or_else(|| {
                    Error::InvalidConfiguration("view on a null mapping".to_string())
                })?;
                Ok((ptr, range.size() / elem))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("offset", &self.offset)
                    .field("len", &self.len)
                    .finish()
            }
        }
    };
}

memory_region!(ReadableMemory, AccessMode::ReadOnly);
memory_region!(ReadWritableMemory, AccessMode::ReadWrite);

impl ReadWritableMemory {
    /// Read-write typed view of `range`
    pub fn write_view<T>(&self, range: MemoryRange) -> Result<WriteView<T>> {
        let (ptr, len) = self.typed_parts::<T>(range)?;
        Ok(WriteView {
            mapping: self.mapping.clone(),
            ptr,
            len,
            _marker: PhantomData,
        })
    }

    /// Drop the write permission
    pub fn to_readable(&self) -> ReadableMemory {
        ReadableMemory {
            mapping: self.mapping.clone(),
            offset: self.offset,
            len: self.len,
        }
    }
}

/// Read-only typed view into mapped memory
pub struct ReadView<T> {
    mapping: Arc<dyn Mapping>,
    ptr: NonNull<T>,
    len: usize,
    _marker: PhantomData<*const T>,
}

// SAFETY: the view only hands out shared references or copies; the mapping is
// kept alive by the Arc.
unsafe impl<T: Sync> Send for ReadView<T> {}
unsafe impl<T: Sync> Sync for ReadView<T> {}

impl<T> ReadView<T> {
    /// Number of `T` in the view
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the view is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Get start pointer
    pub fn as_ptr(&self) -> *const T {
        self.ptr.as_ptr()
    }

    /// Shared reference to element `index`; meant for atomics
    pub fn get(&self, index: usize) -> &T {
        assert!(index < self.len, "index {index} out of view of {}", self.len);
        // SAFETY: in bounds and aligned; the mapping outlives self.
        unsafe { &*self.ptr.as_ptr().add(index) }
    }
}

impl<T: Copy> ReadView<T> {
    /// Copy element `index` out of memory another party may write
    pub fn read_volatile(&self, index: usize) -> T {
        assert!(index < self.len, "index {index} out of view of {}", self.len);
        // SAFETY: in bounds and aligned; T is Copy so any bit pattern the
        // protocol allows is a plain value.
        unsafe { ptr::read_volatile(self.ptr.as_ptr().add(index)) }
    }
}

impl ReadView<u8> {
    /// Bytes of the view
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: in bounds for len bytes, kept alive by the mapping.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl<T> fmt::Debug for ReadView<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadView")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

/// Read-write typed view into mapped memory
pub struct WriteView<T> {
    mapping: Arc<dyn Mapping>,
    ptr: NonNull<T>,
    len: usize,
    _marker: PhantomData<*mut T>,
}

// SAFETY: writes go through &mut self or atomics; the mapping is kept alive
// by the Arc.
unsafe impl<T: Send + Sync> Send for WriteView<T> {}

impl<T> WriteView<T> {
    /// Number of `T` in the view
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the view is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Get start pointer
    pub fn as_ptr(&self) -> *mut T {
        self.ptr.as_ptr()
    }

    /// Shared reference to element `index`; meant for atomics
    pub fn get(&self, index: usize) -> &T {
        assert!(index < self.len, "index {index} out of view of {}", self.len);
        // SAFETY: in bounds and aligned; the mapping outlives self.
        unsafe { &*self.ptr.as_ptr().add(index) }
    }

    /// Same memory, write permission dropped
    pub fn to_read_view(&self) -> ReadView<T> {
        ReadView {
            mapping: self.mapping.clone(),
            ptr: self.ptr,
            len: self.len,
            _marker: PhantomData,
        }
    }
}

impl<T: Copy> WriteView<T> {
    /// Copy element `index` out of memory
    pub fn read_volatile(&self, index: usize) -> T {
        self.to_read_view().read_volatile(index)
    }

    /// Store `value` at element `index`
    pub fn write_volatile(&mut self, index: usize, value: T) {
        assert!(index < self.len, "index {index} out of view of {}", self.len);
        // SAFETY: in bounds and aligned; &mut self makes this the only writer
        // in this process.
        unsafe { ptr::write_volatile(self.ptr.as_ptr().add(index), value) }
    }
}

impl WriteView<u8> {
    /// Bytes of the view
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: in bounds for len bytes, kept alive by the mapping.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Copy `data` into the view starting at byte `offset`
    ///
    /// Other views of the same bytes may exist, so no `&mut [u8]` is ever
    /// formed; the copy goes through the raw pointer.
    pub fn copy_from(&mut self, offset: usize, data: &[u8]) {
        let end = offset.checked_add(data.len());
        assert!(
            end.is_some_and(|end| end <= self.len),
            "copy of {} bytes at {offset} out of view of {}",
            data.len(),
            self.len
        );
        // SAFETY: in bounds, checked above; `data` is a Rust slice and cannot
        // overlap mapped shared memory we only reach through raw pointers.
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len()) }
    }
}

impl<T> fmt::Debug for WriteView<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteView")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

/// Page-aligned, zeroed heap memory
struct LocalMapping {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the allocation is plain memory; all concurrent access goes through
// views that use atomics or volatile copies.
unsafe impl Send for LocalMapping {}
unsafe impl Sync for LocalMapping {}

unsafe impl Mapping for LocalMapping {
    fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn len(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for LocalMapping {
    fn drop(&mut self) {
        // SAFETY: allocated in LocalMemoryProvider::allocate with this layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

/// Handle to [`LocalMemoryProvider`] memory, valid inside this process only
#[derive(Clone)]
pub struct LocalHandle {
    mapping: Arc<LocalMapping>,
}

impl fmt::Debug for LocalHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalHandle")
            .field("ptr", &self.mapping.ptr)
            .field("size", &self.mapping.len())
            .finish()
    }
}

impl MemoryExchangeHandle for LocalHandle {
    fn memory_size(&self) -> std::result::Result<usize, MemoryError> {
        Ok(self.mapping.len())
    }

    fn readable(&self, range: MemoryRange) -> std::result::Result<ReadableMemory, MemoryError> {
        ReadableMemory::new(self.mapping.clone()).sub_range(range)
    }

    fn read_writable(
        &self,
        range: MemoryRange,
    ) -> std::result::Result<ReadWritableMemory, MemoryError> {
        ReadWritableMemory::new(self.mapping.clone()).sub_range(range)
    }
}

/// Provider of process-local memory
///
/// Every memory technology is served from ordinary heap memory, which makes
/// this provider suitable for threads of one process and for tests.
#[derive(Debug, Default, Clone)]
pub struct LocalMemoryProvider;

impl LocalMemoryProvider {
    /// Create a provider
    pub fn new() -> Self {
        Self
    }
}

impl MemoryProvider for LocalMemoryProvider {
    fn allocate(
        &self,
        technology: MemoryTechnology,
        size: usize,
    ) -> std::result::Result<MemoryObject, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidSize(size));
        }
        let layout =
            Layout::from_size_align(size, PAGE_SIZE).map_err(|_| MemoryError::InvalidSize(size))?;
        // SAFETY: layout has a non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| {
            MemoryError::InsufficientResources(format!("failed to allocate {size} bytes"))
        })?;
        let mapping = Arc::new(LocalMapping { ptr, layout });
        let handle = Arc::new(LocalHandle {
            mapping: mapping.clone(),
        });
        Ok(MemoryObject::new(mapping, handle, technology))
    }
}
