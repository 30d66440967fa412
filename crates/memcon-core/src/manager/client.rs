//! Client side memory manager

use std::sync::Arc;

use tracing::debug;

use super::strategy::{layout_for, MemoryLayout, PlannedMemory};
use super::{bind_queue_ends, map_peer_memory};
use crate::config::{QueueMemoryConfig, SlotMemoryConfig, MAX_QUEUE_CAPACITY};
use crate::error::{Error, Result};
use crate::memory::{ExchangeHandle, MemoryObject, MemoryProvider, ReadWritableMemory, ReadableMemory};
use crate::queue::{SlotIndex, SpscConsumer, SpscProducer};
use crate::slot::ReadableSlotDescriptor;
use crate::storage::MemoryTechnology;

/// Maps the server's memory and allocates the single queue of one client
pub struct ClientMemoryManager {
    provider: Arc<dyn MemoryProvider>,
    layout: Box<dyn MemoryLayout>,
    number_of_slots: u32,
    queue: PlannedMemory<QueueMemoryConfig>,
}

impl ClientMemoryManager {
    /// `number_of_slots` is announced by the server and therefore checked
    pub fn new(
        technology: MemoryTechnology,
        number_of_slots: u32,
        provider: Arc<dyn MemoryProvider>,
    ) -> Result<Self> {
        if number_of_slots == 0 || number_of_slots > MAX_QUEUE_CAPACITY {
            return Err(Error::InvalidConfiguration(format!(
                "server announced {number_of_slots} slots"
            )));
        }
        let layout = layout_for(technology);
        let planned = layout.queue_layout(1, number_of_slots);
        let queue = PlannedMemory {
            size: planned.size,
            config: planned.config[0],
        };
        Ok(Self {
            provider,
            layout,
            number_of_slots,
            queue,
        })
    }

    /// Get memory technology
    pub fn technology(&self) -> MemoryTechnology {
        self.layout.technology()
    }

    /// Number of slots the server announced
    pub fn number_of_slots(&self) -> u32 {
        self.number_of_slots
    }

    /// Map the server's slot memory read-only after validating `config` against it
    pub fn map_slot_memory(
        &self,
        handle: &ExchangeHandle,
        config: &SlotMemoryConfig,
    ) -> Result<ReadableMemory> {
        if config.number_of_slots() != self.number_of_slots as usize {
            return Err(Error::InvalidConfiguration(format!(
                "slot config describes {} slots instead of {}",
                config.number_of_slots(),
                self.number_of_slots
            )));
        }
        let memory = map_peer_memory(handle, 0)?;
        config.validate(memory.len())?;
        Ok(memory)
    }

    /// Allocate the memory of this client's queue ends
    pub fn allocate_queue_memory(&self) -> Result<MemoryObject> {
        let object = self.provider.allocate(self.technology(), self.queue.size)?;
        debug!(size = self.queue.size, "allocated client queue memory");
        Ok(object)
    }

    /// Descriptors for every slot of the mapped slot memory
    pub fn readable_slot_descriptors(
        &self,
        memory: &ReadableMemory,
        config: &SlotMemoryConfig,
    ) -> Result<Vec<ReadableSlotDescriptor>> {
        config.validate(memory.len())?;
        config
            .slots()
            .iter()
            .enumerate()
            .map(|(index, slot)| ReadableSlotDescriptor::new(index as SlotIndex, memory, slot))
            .collect()
    }

    /// Map the server's queue memory read-only after validating `config` against it
    pub fn map_server_queue_memory(
        &self,
        handle: &ExchangeHandle,
        config: &QueueMemoryConfig,
    ) -> Result<ReadableMemory> {
        let memory = map_peer_memory(handle, 0)?;
        config.validate(memory.len(), self.number_of_slots)?;
        Ok(memory)
    }

    /// Queue ends towards the server, after validating `server_config`
    pub fn initialize_queue_ends(
        &self,
        client_memory: &ReadWritableMemory,
        server_config: &QueueMemoryConfig,
        server_memory: &ReadableMemory,
    ) -> Result<(SpscProducer<SlotIndex>, SpscConsumer<SlotIndex>)> {
        self.queue.config.validate(client_memory.len(), self.number_of_slots)?;
        server_config.validate(server_memory.len(), self.number_of_slots)?;
        bind_queue_ends(client_memory, &self.queue.config, server_memory, server_config)
    }

    /// Layout of this client's queue memory, sent to the server
    pub fn queue_config(&self) -> QueueMemoryConfig {
        self.queue.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::layout::MemoryRange;
    use crate::manager::ServerMemoryManager;
    use crate::memory::LocalMemoryProvider;

    fn provider() -> Arc<dyn MemoryProvider> {
        Arc::new(LocalMemoryProvider::new())
    }

    #[test]
    fn test_rejects_announced_slot_count() {
        assert!(ClientMemoryManager::new(MemoryTechnology::SharedMemory, 0, provider()).is_err());
        assert!(ClientMemoryManager::new(
            MemoryTechnology::SharedMemory,
            MAX_QUEUE_CAPACITY + 1,
            provider()
        )
        .is_err());
    }

    #[test]
    fn test_reads_slots_written_by_server() {
        let config = ServerConfig {
            number_of_slots: 3,
            slot_content_size: 64,
            ..ServerConfig::default()
        };
        let server = ServerMemoryManager::new(&config, provider()).unwrap();
        let slot_memory = server.allocate_slot_memory().unwrap();
        let mut writers = server
            .writable_slot_descriptors(&slot_memory.read_writable())
            .unwrap();
        writers[1].write(b"frame").unwrap();
        writers[1].set_visible(true);

        let client = ClientMemoryManager::new(MemoryTechnology::SharedMemory, 3, provider()).unwrap();
        let view = client
            .map_slot_memory(&slot_memory.exchange_handle(), server.slot_config())
            .unwrap();
        let readers = client
            .readable_slot_descriptors(&view, server.slot_config())
            .unwrap();
        assert!(!readers[0].is_visible());
        assert!(readers[1].is_visible());
        assert_eq!(&readers[1].content()[..5], b"frame");
    }

    #[test]
    fn test_rejects_slot_config_with_wrong_slot_count() {
        let client = ClientMemoryManager::new(MemoryTechnology::SharedMemory, 2, provider()).unwrap();
        let memory = provider()
            .allocate(MemoryTechnology::SharedMemory, 4096)
            .unwrap();
        let config = SlotMemoryConfig::new(vec![crate::config::OneSlotConfig::new(
            MemoryRange::new(0, 4),
            MemoryRange::new(64, 64),
        )]);
        assert!(matches!(
            client.map_slot_memory(&memory.exchange_handle(), &config),
            Err(Error::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_rejects_server_queue_config_overlapping() {
        let client = ClientMemoryManager::new(MemoryTechnology::SharedMemory, 4, provider()).unwrap();
        let memory = provider()
            .allocate(MemoryTechnology::SharedMemory, 4096)
            .unwrap();
        let overlapping = QueueMemoryConfig::new(
            MemoryRange::new(64, 4),
            MemoryRange::new(64, 16),
            MemoryRange::new(128, 4),
        );
        assert!(client
            .map_server_queue_memory(&memory.exchange_handle(), &overlapping)
            .is_err());
    }
}
