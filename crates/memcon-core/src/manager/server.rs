//! Server side memory manager

use std::sync::Arc;

use tracing::debug;

use super::strategy::{layout_for, MemoryLayout, PlannedMemory};
use super::{bind_queue_ends, map_peer_memory};
use crate::config::{QueueMemoryConfig, ServerConfig, SlotMemoryConfig};
use crate::error::{Error, Result};
use crate::memory::{ExchangeHandle, MemoryObject, MemoryProvider, ReadWritableMemory, ReadableMemory};
use crate::queue::{SlotIndex, SpscConsumer, SpscProducer};
use crate::slot::WritableSlotDescriptor;
use crate::storage::MemoryTechnology;

/// Plans and allocates the slot memory and the queue memory of all receivers
pub struct ServerMemoryManager {
    provider: Arc<dyn MemoryProvider>,
    layout: Box<dyn MemoryLayout>,
    queue_capacity: u32,
    slots: PlannedMemory<SlotMemoryConfig>,
    queues: PlannedMemory<Vec<QueueMemoryConfig>>,
    client_queue_size: usize,
}

impl ServerMemoryManager {
    /// Validate `config` and plan the slot and queue segments
    pub fn new(config: &ServerConfig, provider: Arc<dyn MemoryProvider>) -> Result<Self> {
        config.validate()?;
        let layout = layout_for(config.memory_technology);
        let queue_capacity = config.number_of_slots;
        let slots = layout.slot_layout(
            config.number_of_slots,
            config.slot_content_size,
            config.slot_content_alignment,
        );
        let queues = layout.queue_layout(config.max_number_receivers as usize, queue_capacity);
        let client_queue_size = layout.queue_layout(1, queue_capacity).size;
        Ok(Self {
            provider,
            layout,
            queue_capacity,
            slots,
            queues,
            client_queue_size,
        })
    }

    /// Get memory technology
    pub fn technology(&self) -> MemoryTechnology {
        self.layout.technology()
    }

    /// Capacity of every queue, equal to the number of slots
    pub fn queue_capacity(&self) -> u32 {
        self.queue_capacity
    }

    /// Layout of the slot memory
    pub fn slot_config(&self) -> &SlotMemoryConfig {
        &self.slots.config
    }

    /// Number of receivers the queue memory has room for
    pub fn max_number_receivers(&self) -> usize {
        self.queues.config.len()
    }

    /// Allocate the slot memory
    pub fn allocate_slot_memory(&self) -> Result<MemoryObject> {
        let object = self.provider.allocate(self.technology(), self.slots.size)?;
        debug!(
            size = self.slots.size,
            slots = self.slots.config.number_of_slots(),
            "allocated slot memory"
        );
        Ok(object)
    }

    /// Queue memory for `max_number_receivers` queues packed one after another
    pub fn allocate_queue_memory(&self) -> Result<MemoryObject> {
        let object = self.provider.allocate(self.technology(), self.queues.size)?;
        debug!(
            size = self.queues.size,
            queues = self.queues.config.len(),
            "allocated server queue memory"
        );
        Ok(object)
    }

    /// Descriptors for every slot of the slot memory
    pub fn writable_slot_descriptors(
        &self,
        memory: &ReadWritableMemory,
    ) -> Result<Vec<WritableSlotDescriptor>> {
        self.slots.config.validate(memory.len())?;
        self.slots
            .config
            .slots()
            .iter()
            .enumerate()
            .map(|(index, slot)| WritableSlotDescriptor::new(index as SlotIndex, memory, slot))
            .collect()
    }

    /// Map the queue memory a client sent its handle for
    pub fn map_client_queue_memory(&self, handle: &ExchangeHandle) -> Result<ReadableMemory> {
        map_peer_memory(handle, self.client_queue_size)
    }

    /// Queue ends towards the client using queue `client_index`
    ///
    /// `client_config` comes from the client and is validated against
    /// `client_memory` before anything is bound to it.
    pub fn initialize_queue_ends(
        &self,
        client_index: usize,
        server_memory: &ReadWritableMemory,
        client_config: &QueueMemoryConfig,
        client_memory: &ReadableMemory,
    ) -> Result<(SpscProducer<SlotIndex>, SpscConsumer<SlotIndex>)> {
        let own = self.queue_config(client_index).ok_or_else(|| {
            Error::InvalidConfiguration(format!(
                "queue index {client_index} exceeds {} receivers",
                self.max_number_receivers()
            ))
        })?;
        own.validate(server_memory.len(), self.queue_capacity)?;
        client_config.validate(client_memory.len(), self.queue_capacity)?;
        bind_queue_ends(server_memory, &own, client_memory, client_config)
    }

    /// Layout of the server's queue `index`
    pub fn queue_config(&self, index: usize) -> Option<QueueMemoryConfig> {
        self.queues.config.get(index).copied()
    }
}
