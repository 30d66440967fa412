//! Single-producer single-consumer ring buffer on shared index memory.
//!
//! # Protocol
//!
//! Head and tail are `u32` counters in shared memory, advanced modulo
//! `2 × capacity`. Doubling the modulus tells a full ring (`head - tail ==
//! capacity`) from an empty one (`head == tail`) without a separate flag.
//!
//! ```text
//! producer memory             consumer memory
//! ┌──────────────┐            ┌──────────────┐
//! │ head   (rw)  │──acquire──▶│ head   (ro)  │
//! │ buffer (rw)  │            │ buffer (ro)  │
//! │ tail   (ro)  │◀──acquire──│ tail   (rw)  │
//! └──────────────┘            └──────────────┘
//! ```
//!
//! Every endpoint reloads the index owned by its peer with acquire ordering
//! before each operation and publishes its own index with release ordering.
//! The peer may be another process that does not follow the protocol, so
//! every loaded index is validated; a violation is reported as
//! [`Error::QueueCorrupted`] instead of being trusted.

use std::sync::atomic::Ordering;

use crate::config::MAX_QUEUE_CAPACITY;
use crate::error::{Error, Result};
use crate::memory::{ReadView, WriteView};
use crate::queue::{QueueIndex, QUEUE_INDEX_ALIGNMENT};

fn checked_capacity(len: usize) -> u32 {
    assert!(len > 0, "queue buffer must not be empty");
    assert!(
        len <= MAX_QUEUE_CAPACITY as usize,
        "queue capacity {len} exceeds {MAX_QUEUE_CAPACITY}"
    );
    len as u32
}

fn check_index_alignment(address: usize, name: &str) {
    assert!(
        address % QUEUE_INDEX_ALIGNMENT == 0,
        "{name} index at {address:#x} is not {QUEUE_INDEX_ALIGNMENT}-byte aligned"
    );
}

fn check_single_index(len: usize, name: &str) {
    assert!(len == 1, "{name} view must hold exactly one index, got {len}");
}

/// Advance an index by one within the doubled modulus
#[inline]
fn advance(index: u32, capacity: u32) -> u32 {
    let next = index + 1;
    if next == 2 * capacity {
        0
    } else {
        next
    }
}

/// Number of occupied slots, or the corruption that prevents computing it
#[inline]
fn occupied(head: u32, tail: u32, capacity: u32) -> Result<u32> {
    let limit = 2 * capacity;
    let corrupted = || Error::QueueCorrupted {
        head,
        tail,
        capacity,
    };
    if head >= limit || tail >= limit {
        return Err(corrupted());
    }
    let occupied = if head >= tail {
        head - tail
    } else {
        limit - tail + head
    };
    if occupied > capacity {
        return Err(corrupted());
    }
    Ok(occupied)
}

/// Write end of the queue
#[derive(Debug)]
pub struct SpscProducer<T: Copy> {
    buffer: WriteView<T>,
    head: WriteView<QueueIndex>,
    tail: ReadView<QueueIndex>,
    capacity: u32,
    cached_head: u32,
    cached_tail: u32,
    max_fill_level: u32,
}

impl<T: Copy> SpscProducer<T> {
    /// Create the producer and reset the shared head index to zero
    ///
    /// # Panics
    ///
    /// If the buffer is empty or larger than [`MAX_QUEUE_CAPACITY`], or if
    /// head/tail are not 8-byte aligned single indices.
    pub fn new(
        buffer: WriteView<T>,
        head: WriteView<QueueIndex>,
        tail: ReadView<QueueIndex>,
    ) -> Self {
        let capacity = checked_capacity(buffer.len());
        check_single_index(head.len(), "head");
        check_single_index(tail.len(), "tail");
        check_index_alignment(head.as_ptr() as usize, "head");
        check_index_alignment(tail.as_ptr() as usize, "tail");

        head.get(0).store(0, Ordering::Release);
        Self {
            buffer,
            head,
            tail,
            capacity,
            cached_head: 0,
            cached_tail: 0,
            max_fill_level: 0,
        }
    }

    /// Number of elements the queue holds when full
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Refresh the consumer's tail and return the number of occupied slots
    pub fn fill_level(&mut self) -> Result<usize> {
        self.cached_tail = self.tail.get(0).load(Ordering::Acquire);
        let level = occupied(self.cached_head, self.cached_tail, self.capacity)?;
        self.max_fill_level = self.max_fill_level.max(level);
        Ok(level as usize)
    }

    /// Highest fill level observed so far
    ///
    /// An estimate for tuning queue sizes: the consumer's progress is only
    /// seen when the tail is sampled, so it may overstate the real peak.
    pub fn max_fill_level(&mut self) -> Result<usize> {
        self.fill_level()?;
        Ok(self.max_fill_level as usize)
    }

    /// Append `element`; `Ok(false)` without any change if the queue is full
    pub fn produce(&mut self, element: T) -> Result<bool> {
        let level = self.fill_level()? as u32;
        if level == self.capacity {
            return Ok(false);
        }
        let position = self.cached_head % self.capacity;
        self.buffer.write_volatile(position as usize, element);
        self.cached_head = advance(self.cached_head, self.capacity);
        self.head.get(0).store(self.cached_head, Ordering::Release);
        // Assume the element is visible before the consumer gets to it.
        self.max_fill_level = self.max_fill_level.max(level + 1);
        Ok(true)
    }
}

/// Read end of the queue
#[derive(Debug)]
pub struct SpscConsumer<T: Copy> {
    buffer: ReadView<T>,
    head: ReadView<QueueIndex>,
    tail: WriteView<QueueIndex>,
    capacity: u32,
    cached_head: u32,
    cached_tail: u32,
    max_fill_level: u32,
}

impl<T: Copy> SpscConsumer<T> {
    /// Create the consumer and reset the shared tail index to zero
    ///
    /// # Panics
    ///
    /// Same conditions as [`SpscProducer::new`].
    pub fn new(
        buffer: ReadView<T>,
        head: ReadView<QueueIndex>,
        tail: WriteView<QueueIndex>,
    ) -> Self {
        let capacity = checked_capacity(buffer.len());
        check_single_index(head.len(), "head");
        check_single_index(tail.len(), "tail");
        check_index_alignment(head.as_ptr() as usize, "head");
        check_index_alignment(tail.as_ptr() as usize, "tail");

        tail.get(0).store(0, Ordering::Release);
        Self {
            buffer,
            head,
            tail,
            capacity,
            cached_head: 0,
            cached_tail: 0,
            max_fill_level: 0,
        }
    }

    /// Number of elements the queue holds when full
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Refresh the producer's head and return the number of occupied slots
    pub fn fill_level(&mut self) -> Result<usize> {
        self.cached_head = self.head.get(0).load(Ordering::Acquire);
        let level = occupied(self.cached_head, self.cached_tail, self.capacity)?;
        self.max_fill_level = self.max_fill_level.max(level);
        Ok(level as usize)
    }

    /// Highest fill level observed so far
    pub fn max_fill_level(&mut self) -> Result<usize> {
        self.fill_level()?;
        Ok(self.max_fill_level as usize)
    }

    /// Copy of the oldest element, left in the queue
    pub fn peek(&mut self) -> Result<Option<T>> {
        if self.fill_level()? == 0 {
            return Ok(None);
        }
        let position = self.cached_tail % self.capacity;
        Ok(Some(self.buffer.read_volatile(position as usize)))
    }

    /// Drop the oldest element; `Ok(false)` if the queue is empty
    pub fn discard(&mut self) -> Result<bool> {
        if self.fill_level()? == 0 {
            return Ok(false);
        }
        self.cached_tail = advance(self.cached_tail, self.capacity);
        self.tail.get(0).store(self.cached_tail, Ordering::Release);
        Ok(true)
    }

    /// Remove and return the oldest element
    ///
    /// The element is copied out before the tail moves, so the producer can
    /// never overwrite it while it is read.
    pub fn consume(&mut self) -> Result<Option<T>> {
        let element = self.peek()?;
        if element.is_some() {
            self.discard()?;
        }
        Ok(element)
    }
}
