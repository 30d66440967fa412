//! Memory managers
//!
//! The managers hide the memory technology behind one interface: they size
//! segments through a [`MemoryLayout`], allocate and map them through a
//! [`MemoryProvider`](crate::memory::MemoryProvider), and bind queue ends and
//! slot descriptors to the mapped memory. Configs that come from the peer are
//! validated before any view is built on them.

pub mod client;
pub mod server;
pub mod strategy;

pub use client::ClientMemoryManager;
pub use server::ServerMemoryManager;
pub use strategy::{layout_for, ContiguousMemoryLayout, MemoryLayout, PlannedMemory, SharedMemoryLayout};

use crate::config::QueueMemoryConfig;
use crate::error::{MemoryError, Result};
use crate::layout::MemoryRange;
use crate::memory::{ExchangeHandle, ReadWritableMemory, ReadableMemory};
use crate::queue::{SlotIndex, SpscConsumer, SpscProducer};

/// Map all memory behind a peer handle read-only, requiring at least `min_size` bytes
fn map_peer_memory(handle: &ExchangeHandle, min_size: usize) -> Result<ReadableMemory> {
    let size = handle.memory_size()?;
    if size < min_size {
        return Err(MemoryError::SizeMismatch {
            expected: min_size,
            actual: size,
        }
        .into());
    }
    Ok(handle.readable(MemoryRange::new(0, size))?)
}

/// Bind the queue ends of one party
///
/// The party produces into the queue whose head and buffer live in its own
/// memory and consumes from the queue whose head and buffer live in the
/// peer's memory. Both configs must have been validated by the caller.
fn bind_queue_ends(
    own_memory: &ReadWritableMemory,
    own: &QueueMemoryConfig,
    peer_memory: &ReadableMemory,
    peer: &QueueMemoryConfig,
) -> Result<(SpscProducer<SlotIndex>, SpscConsumer<SlotIndex>)> {
    let producer = SpscProducer::new(
        own_memory.write_view(own.buffer())?,
        own_memory.write_view(own.head())?,
        peer_memory.read_view(peer.tail())?,
    );
    let consumer = SpscConsumer::new(
        peer_memory.read_view(peer.buffer())?,
        peer_memory.read_view(peer.head())?,
        own_memory.write_view(own.tail())?,
    );
    Ok((producer, consumer))
}
