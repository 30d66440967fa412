//! Lock-free SPSC index queues over shared memory
//!
//! The engine lives in [`spsc`]. The rest of the crate talks to queue ends
//! through the role-specific [`WritingQueueEnd`] and [`ReadingQueueEnd`]
//! traits, which only ever carry slot indices.

pub mod spsc;

use std::sync::atomic::AtomicU32;

use crate::error::Result;

pub use spsc::{SpscConsumer, SpscProducer};

/// Index of a slot in the slot memory
pub type SlotIndex = u32;

/// Head or tail index of a queue, stored in shared memory
pub type QueueIndex = AtomicU32;

/// Alignment head and tail indices must have in shared memory
pub const QUEUE_INDEX_ALIGNMENT: usize = 8;

#[cfg(not(target_has_atomic = "32"))]
compile_error!("memcon requires lock-free 32-bit atomics");

/// Producer side of a slot index queue
pub trait WritingQueueEnd: Send {
    fn capacity(&self) -> usize;

    fn fill_level(&mut self) -> Result<usize>;

    fn max_fill_level(&mut self) -> Result<usize>;

    /// Push `index`; `Ok(false)` if the queue is full
    fn push(&mut self, index: SlotIndex) -> Result<bool>;
}

/// Consumer side of a slot index queue
pub trait ReadingQueueEnd: Send {
    fn capacity(&self) -> usize;

    fn fill_level(&mut self) -> Result<usize>;

    fn max_fill_level(&mut self) -> Result<usize>;

    /// Oldest index without removing it
    fn peek(&mut self) -> Result<Option<SlotIndex>>;

    /// Remove the oldest index; `Ok(false)` if the queue is empty
    fn discard(&mut self) -> Result<bool>;

    /// Remove and return the oldest index
    fn pop(&mut self) -> Result<Option<SlotIndex>>;
}

impl WritingQueueEnd for SpscProducer<SlotIndex> {
    fn capacity(&self) -> usize {
        SpscProducer::capacity(self)
    }

    fn fill_level(&mut self) -> Result<usize> {
        SpscProducer::fill_level(self)
    }

    fn max_fill_level(&mut self) -> Result<usize> {
        SpscProducer::max_fill_level(self)
    }

    fn push(&mut self, index: SlotIndex) -> Result<bool> {
        self.produce(index)
    }
}

impl ReadingQueueEnd for SpscConsumer<SlotIndex> {
    fn capacity(&self) -> usize {
        SpscConsumer::capacity(self)
    }

    fn fill_level(&mut self) -> Result<usize> {
        SpscConsumer::fill_level(self)
    }

    fn max_fill_level(&mut self) -> Result<usize> {
        SpscConsumer::max_fill_level(self)
    }

    fn peek(&mut self) -> Result<Option<SlotIndex>> {
        SpscConsumer::peek(self)
    }

    fn discard(&mut self) -> Result<bool> {
        SpscConsumer::discard(self)
    }

    fn pop(&mut self) -> Result<Option<SlotIndex>> {
        self.consume()
    }
}
