//! Memory layout planning
//!
//! [`MemoryLayoutPlanner`] places objects, arrays and padding one after another
//! into a segment that does not exist yet. It never touches real memory: it
//! walks a virtual address that starts at the segment's start alignment, so two
//! processes running the same sequence of calls agree on every offset.

use serde::{Deserialize, Serialize};
use std::mem;

/// A byte range inside a memory segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct MemoryRange {
    offset: usize,
    size: usize,
}

impl MemoryRange {
    /// Range of `size` bytes starting at `offset`
    pub const fn new(offset: usize, size: usize) -> Self {
        Self { offset, size }
    }

    /// Start offset in bytes
    pub const fn offset(&self) -> usize {
        self.offset
    }

    /// Size in bytes
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Exclusive end offset, `None` if it does not fit into `usize`
    pub fn end(&self) -> Option<usize> {
        self.offset.checked_add(self.size)
    }

    /// Whether the range lies completely within `len` bytes
    pub fn fits_in(&self, len: usize) -> bool {
        matches!(self.end(), Some(end) if end <= len)
    }

    /// Whether two non-empty ranges share at least one byte
    pub fn overlaps(&self, other: &MemoryRange) -> bool {
        if self.size == 0 || other.size == 0 {
            return false;
        }
        let self_end = self.offset.saturating_add(self.size);
        let other_end = other.offset.saturating_add(other.size);
        self.offset < other_end && other.offset < self_end
    }
}

/// Deterministic placement of data structures in a to-be-allocated segment
#[derive(Debug, Clone)]
pub struct MemoryLayoutPlanner {
    start_alignment: usize,
    current_address: usize,
    space: usize,
}

impl MemoryLayoutPlanner {
    /// Create a planner for a segment whose start is aligned to `start_alignment`
    ///
    /// # Panics
    ///
    /// If `start_alignment` is not a power of two.
    pub fn new(start_alignment: usize) -> Self {
        assert!(
            start_alignment.is_power_of_two(),
            "start alignment {start_alignment} is not a power of two"
        );
        Self {
            start_alignment,
            current_address: start_alignment,
            space: usize::MAX - start_alignment,
        }
    }

    /// Alignment the segment start is assumed to have
    pub fn start_alignment(&self) -> usize {
        self.start_alignment
    }

    /// Reserve room for one `T` at its natural alignment
    pub fn add_object<T>(&mut self) -> MemoryRange {
        self.add_object_aligned::<T>(mem::align_of::<T>())
    }

    /// Reserve room for one `T` at `alignment`
    ///
    /// # Panics
    ///
    /// If `alignment` is not a power of two, exceeds the start alignment or the
    /// object does not fit into the remaining address space.
    pub fn add_object_aligned<T>(&mut self, alignment: usize) -> MemoryRange {
        self.place(mem::size_of::<T>(), alignment)
    }

    /// Reserve room for `count` contiguous `T` at their natural alignment
    pub fn add_object_array<T>(&mut self, count: usize) -> MemoryRange {
        self.add_object_array_aligned::<T>(count, mem::align_of::<T>())
    }

    /// Reserve room for `count` contiguous `T`, the first one placed at `alignment`
    ///
    /// # Panics
    ///
    /// If `count` is zero, on overflow of the array size, or for the same
    /// reasons as [`add_object_aligned`](Self::add_object_aligned).
    pub fn add_object_array_aligned<T>(&mut self, count: usize, alignment: usize) -> MemoryRange {
        assert!(count > 0, "object array must contain at least one element");
        let size = mem::size_of::<T>()
            .checked_mul(count)
            .unwrap_or_else(|| panic!("array of {count} elements overflows the address space"));
        self.place(size, alignment)
    }

    /// Reserve `size` untyped bytes at `alignment`
    pub fn add_raw_bytes(&mut self, size: usize, alignment: usize) -> MemoryRange {
        assert!(size > 0, "raw byte region must not be empty");
        self.place(size, alignment)
    }

    /// Advance the cursor to the absolute `offset`
    ///
    /// # Panics
    ///
    /// If `offset` lies before the current cursor or beyond the address space.
    pub fn add_padding_to_offset(&mut self, offset: usize) {
        let current = self.current_offset();
        assert!(
            offset >= current,
            "cannot pad backwards from offset {current} to {offset}"
        );
        self.advance(offset - current);
    }

    /// Advance the cursor to the next address aligned to `alignment`
    ///
    /// Returns the resulting offset.
    pub fn add_padding_to_alignment(&mut self, alignment: usize) -> usize {
        self.check_alignment(alignment);
        let padding = self.padding_for(alignment);
        self.advance(padding);
        self.current_offset()
    }

    /// Minimum size the real segment must have for everything placed so far
    pub fn required_memory_size(&self) -> usize {
        self.current_offset()
    }

    fn current_offset(&self) -> usize {
        self.current_address - self.start_alignment
    }

    fn padding_for(&self, alignment: usize) -> usize {
        self.current_address.wrapping_neg() & (alignment - 1)
    }

    fn check_alignment(&self, alignment: usize) {
        assert!(
            alignment.is_power_of_two(),
            "alignment {alignment} is not a power of two"
        );
        assert!(
            alignment <= self.start_alignment,
            "alignment {alignment} exceeds start alignment {}",
            self.start_alignment
        );
    }

    fn place(&mut self, size: usize, alignment: usize) -> MemoryRange {
        self.check_alignment(alignment);
        let padding = self.padding_for(alignment);
        let required = padding
            .checked_add(size)
            .filter(|required| *required <= self.space)
            .unwrap_or_else(|| {
                panic!("no room for {size} bytes aligned to {alignment} in the address space")
            });
        let offset = self.current_offset() + padding;
        self.current_address += required;
        self.space -= required;
        MemoryRange::new(offset, size)
    }

    fn advance(&mut self, bytes: usize) {
        assert!(bytes <= self.space, "padding exhausts the address space");
        self.current_address += bytes;
        self.space -= bytes;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[repr(C, align(64))]
    struct CacheLine([u8; 64]);

    fn plan(planner: &mut MemoryLayoutPlanner) -> Vec<MemoryRange> {
        let mut ranges = vec![
            planner.add_object::<u8>(),
            planner.add_object_aligned::<AtomicU32>(8),
            planner.add_object_array::<u32>(7),
            planner.add_object::<CacheLine>(),
        ];
        planner.add_padding_to_alignment(256);
        ranges.push(planner.add_raw_bytes(100, 16));
        ranges
    }

    #[test]
    fn test_placement_honors_alignment() {
        let mut planner = MemoryLayoutPlanner::new(4096);
        let ranges = plan(&mut planner);

        assert_eq!(ranges[0], MemoryRange::new(0, 1));
        assert_eq!(ranges[1], MemoryRange::new(8, 4));
        assert_eq!(ranges[2], MemoryRange::new(12, 28));
        assert_eq!(ranges[3], MemoryRange::new(64, 64));
        assert_eq!(ranges[4], MemoryRange::new(256, 100));
        assert_eq!(planner.required_memory_size(), 356);
    }

    #[test]
    fn test_identical_call_sequences_yield_identical_layouts() {
        let mut a = MemoryLayoutPlanner::new(4096);
        let mut b = MemoryLayoutPlanner::new(4096);
        assert_eq!(plan(&mut a), plan(&mut b));
        assert_eq!(a.required_memory_size(), b.required_memory_size());
    }

    #[test]
    fn test_padding_to_offset() {
        let mut planner = MemoryLayoutPlanner::new(64);
        planner.add_object::<u32>();
        planner.add_padding_to_offset(40);
        assert_eq!(planner.required_memory_size(), 40);
        assert_eq!(planner.add_object::<u16>(), MemoryRange::new(40, 2));
        assert_eq!(planner.add_padding_to_alignment(64), 64);
        // Already aligned: no further padding.
        assert_eq!(planner.add_padding_to_alignment(64), 64);
    }

    #[test]
    #[should_panic(expected = "exceeds start alignment")]
    fn test_alignment_above_start_alignment_panics() {
        let mut planner = MemoryLayoutPlanner::new(4096);
        planner.add_object_aligned::<u64>(8192);
    }

    #[test]
    #[should_panic(expected = "not a power of two")]
    fn test_non_power_of_two_alignment_panics() {
        let mut planner = MemoryLayoutPlanner::new(4096);
        planner.add_object_aligned::<u64>(24);
    }

    #[test]
    #[should_panic(expected = "at least one element")]
    fn test_empty_array_panics() {
        let mut planner = MemoryLayoutPlanner::new(4096);
        planner.add_object_array::<u32>(0);
    }

    #[test]
    #[should_panic(expected = "cannot pad backwards")]
    fn test_padding_backwards_panics() {
        let mut planner = MemoryLayoutPlanner::new(4096);
        planner.add_object_array::<u8>(16);
        planner.add_padding_to_offset(8);
    }

    #[test]
    #[should_panic(expected = "overflows the address space")]
    fn test_array_overflow_panics() {
        let mut planner = MemoryLayoutPlanner::new(4096);
        planner.add_object_array::<u64>(usize::MAX / 2);
    }

    #[test]
    fn test_range_overlap() {
        let a = MemoryRange::new(0, 8);
        assert!(a.overlaps(&MemoryRange::new(7, 1)));
        assert!(!a.overlaps(&MemoryRange::new(8, 8)));
        assert!(!a.overlaps(&MemoryRange::new(4, 0)));
        assert!(!MemoryRange::new(usize::MAX, 2).fits_in(usize::MAX));
    }
}
