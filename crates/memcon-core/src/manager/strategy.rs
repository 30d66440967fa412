//! Memory layout strategies per memory technology

use crate::config::{OneSlotConfig, QueueMemoryConfig, SlotMemoryConfig, VisibilityFlag};
use crate::layout::MemoryLayoutPlanner;
use crate::queue::{QueueIndex, SlotIndex};
use crate::storage::MemoryTechnology;

/// Cache line size used to keep independently written structures apart
pub const CACHE_LINE_SIZE: usize = 64;

/// A planned segment: required size plus the configs describing its content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedMemory<C> {
    pub size: usize,
    pub config: C,
}

/// Places slots and queues into memory of one technology
pub trait MemoryLayout: Send + Sync {
    fn technology(&self) -> MemoryTechnology;

    /// Layout of `number_of_slots` slots of `content_size` bytes each
    fn slot_layout(
        &self,
        number_of_slots: u32,
        content_size: usize,
        content_alignment: usize,
    ) -> PlannedMemory<SlotMemoryConfig>;

    /// Layout of `number_of_queues` queue configs of `capacity` indices each
    fn queue_layout(&self, number_of_queues: usize, capacity: u32) -> PlannedMemory<Vec<QueueMemoryConfig>> {
        let mut planner = MemoryLayoutPlanner::new(self.technology().start_alignment());
        let configs = (0..number_of_queues)
            .map(|_| {
                let head = planner.add_object_aligned::<QueueIndex>(CACHE_LINE_SIZE);
                let buffer =
                    planner.add_object_array_aligned::<SlotIndex>(capacity as usize, CACHE_LINE_SIZE);
                let tail = planner.add_object_aligned::<QueueIndex>(CACHE_LINE_SIZE);
                QueueMemoryConfig::new(head, buffer, tail)
            })
            .collect();
        planner.add_padding_to_alignment(CACHE_LINE_SIZE);
        PlannedMemory {
            size: planner.required_memory_size(),
            config: configs,
        }
    }
}

/// Layout strategy for `technology`
pub fn layout_for(technology: MemoryTechnology) -> Box<dyn MemoryLayout> {
    match technology {
        MemoryTechnology::SharedMemory => Box::new(SharedMemoryLayout),
        MemoryTechnology::PhysContigSharedMemory => Box::new(ContiguousMemoryLayout),
    }
}

/// Ordinary shared memory: each slot's flag sits right before its content
#[derive(Debug, Default, Clone, Copy)]
pub struct SharedMemoryLayout;

impl MemoryLayout for SharedMemoryLayout {
    fn technology(&self) -> MemoryTechnology {
        MemoryTechnology::SharedMemory
    }

    fn slot_layout(
        &self,
        number_of_slots: u32,
        content_size: usize,
        content_alignment: usize,
    ) -> PlannedMemory<SlotMemoryConfig> {
        let mut planner = MemoryLayoutPlanner::new(self.technology().start_alignment());
        let slots = (0..number_of_slots)
            .map(|_| {
                let flag = planner.add_object_aligned::<VisibilityFlag>(CACHE_LINE_SIZE);
                let content = planner.add_raw_bytes(content_size, content_alignment);
                OneSlotConfig::new(flag, content)
            })
            .collect();
        PlannedMemory {
            size: planner.required_memory_size(),
            config: SlotMemoryConfig::new(slots),
        }
    }
}

/// Physically contiguous memory: all contents form one block, flags follow it
#[derive(Debug, Default, Clone, Copy)]
pub struct ContiguousMemoryLayout;

impl MemoryLayout for ContiguousMemoryLayout {
    fn technology(&self) -> MemoryTechnology {
        MemoryTechnology::PhysContigSharedMemory
    }

    fn slot_layout(
        &self,
        number_of_slots: u32,
        content_size: usize,
        content_alignment: usize,
    ) -> PlannedMemory<SlotMemoryConfig> {
        let mut planner = MemoryLayoutPlanner::new(self.technology().start_alignment());
        let contents: Vec<_> = (0..number_of_slots)
            .map(|_| planner.add_raw_bytes(content_size, content_alignment))
            .collect();
        planner.add_padding_to_alignment(CACHE_LINE_SIZE);
        let slots = contents
            .into_iter()
            .map(|content| OneSlotConfig::new(planner.add_object::<VisibilityFlag>(), content))
            .collect();
        PlannedMemory {
            size: planner.required_memory_size(),
            config: SlotMemoryConfig::new(slots),
        }
    }
}
