//! Server configuration and shared memory layout descriptions
//!
//! [`SlotMemoryConfig`] and [`QueueMemoryConfig`] are the "wire format" of a
//! connection: they describe where in a segment each structure lives, and are
//! sent to the peer so it can build identical views into memory it did not
//! allocate. Configs received from a peer are untrusted and must pass
//! `validate` before any view is built on them.

use std::mem;
use std::sync::atomic::AtomicU32;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::layout::MemoryRange;
use crate::manager::strategy::CACHE_LINE_SIZE;
use crate::queue::{QueueIndex, SlotIndex, QUEUE_INDEX_ALIGNMENT};
use crate::storage::MemoryTechnology;

/// Largest queue capacity whose doubled value still fits into a queue index
pub const MAX_QUEUE_CAPACITY: u32 = u32::MAX / 2;

/// Largest segment a configuration may ask for
pub const MAX_SEGMENT_SIZE: usize = isize::MAX as usize / 2;

/// Type of the per-slot global visibility flag
pub type VisibilityFlag = AtomicU32;

/// Location of one queue's structures in the memory of one party
///
/// `head` and `buffer` belong to the queue this party produces into, `tail`
/// to the queue it consumes from. Each party thus only writes memory it
/// allocated itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueMemoryConfig {
    head: MemoryRange,
    buffer: MemoryRange,
    tail: MemoryRange,
}

impl QueueMemoryConfig {
    /// Queue layout from its three regions
    pub const fn new(head: MemoryRange, buffer: MemoryRange, tail: MemoryRange) -> Self {
        Self { head, buffer, tail }
    }

    /// Head index of the queue produced into
    pub fn head(&self) -> MemoryRange {
        self.head
    }

    /// Element buffer of the queue produced into
    pub fn buffer(&self) -> MemoryRange {
        self.buffer
    }

    /// Tail index of the queue consumed from
    pub fn tail(&self) -> MemoryRange {
        self.tail
    }

    /// Check a peer-supplied config against the memory it refers to
    pub fn validate(&self, memory_size: usize, capacity: u32) -> Result<()> {
        let index_size = mem::size_of::<QueueIndex>();
        for (name, range) in [("head", self.head), ("tail", self.tail)] {
            if range.size() != index_size {
                return Err(invalid(format!(
                    "{name} index spans {} bytes instead of {index_size}",
                    range.size()
                )));
            }
            if range.offset() % QUEUE_INDEX_ALIGNMENT != 0 {
                return Err(invalid(format!(
                    "{name} index at offset {} is not {QUEUE_INDEX_ALIGNMENT}-byte aligned",
                    range.offset()
                )));
            }
        }

        let expected = capacity as usize * mem::size_of::<SlotIndex>();
        if self.buffer.size() != expected {
            return Err(invalid(format!(
                "queue buffer spans {} bytes instead of {expected}",
                self.buffer.size()
            )));
        }
        if self.buffer.offset() % mem::align_of::<SlotIndex>() != 0 {
            return Err(invalid(format!(
                "queue buffer at offset {} is misaligned",
                self.buffer.offset()
            )));
        }

        check_disjoint_and_inside(&mut [self.head, self.buffer, self.tail], memory_size)
    }
}

/// Location of one slot: its global visibility flag and its content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OneSlotConfig {
    visibility_flag: MemoryRange,
    content: MemoryRange,
}

impl OneSlotConfig {
    /// Slot layout from its flag and content regions
    pub const fn new(visibility_flag: MemoryRange, content: MemoryRange) -> Self {
        Self {
            visibility_flag,
            content,
        }
    }

    /// Region of the global visibility flag
    pub fn visibility_flag(&self) -> MemoryRange {
        self.visibility_flag
    }

    /// Region of the slot content
    pub fn content(&self) -> MemoryRange {
        self.content
    }
}

/// Location of every slot in the slot memory
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotMemoryConfig {
    slots: Vec<OneSlotConfig>,
}

impl SlotMemoryConfig {
    /// Slot memory layout from per-slot layouts
    pub fn new(slots: Vec<OneSlotConfig>) -> Self {
        Self { slots }
    }

    /// Per-slot layouts, indexed by slot index
    pub fn slots(&self) -> &[OneSlotConfig] {
        &self.slots
    }

    /// Get number of slots
    pub fn number_of_slots(&self) -> usize {
        self.slots.len()
    }

    /// Check a peer-supplied config against the memory it refers to
    pub fn validate(&self, memory_size: usize) -> Result<()> {
        if self.slots.is_empty() {
            return Err(invalid("slot memory config contains no slots".to_string()));
        }
        if self.slots.len() > MAX_QUEUE_CAPACITY as usize {
            return Err(invalid(format!("{} slots exceed the queue capacity", self.slots.len())));
        }
        let flag_size = mem::size_of::<VisibilityFlag>();
        let flag_align = mem::align_of::<VisibilityFlag>();
        let mut ranges = Vec::with_capacity(self.slots.len() * 2);
        for (index, slot) in self.slots.iter().enumerate() {
            let flag = slot.visibility_flag;
            if flag.size() != flag_size || flag.offset() % flag_align != 0 {
                return Err(invalid(format!("visibility flag of slot {index} is malformed")));
            }
            if slot.content.size() == 0 {
                return Err(invalid(format!("slot {index} has no content")));
            }
            ranges.push(flag);
            ranges.push(slot.content);
        }
        check_disjoint_and_inside(&mut ranges, memory_size)
    }
}

/// Per receiver class limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiverClassConfig {
    pub name: String,
    /// Slots receivers of this class may hold at once, counted per class
    pub max_in_flight: u32,
}

/// Configuration of a zero-copy server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub number_of_slots: u32,
    pub slot_content_size: usize,
    pub slot_content_alignment: usize,
    pub max_number_receivers: u32,
    pub memory_technology: MemoryTechnology,
    pub receiver_classes: Vec<ReceiverClassConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            number_of_slots: 16,
            slot_content_size: 4096,
            slot_content_alignment: 64,
            max_number_receivers: 8,
            memory_technology: MemoryTechnology::SharedMemory,
            receiver_classes: vec![ReceiverClassConfig {
                name: "default".to_string(),
                max_in_flight: 16,
            }],
        }
    }
}

impl ServerConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::ConfigParse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check counts, alignment and segment sizes
    pub fn validate(&self) -> Result<()> {
        if self.number_of_slots == 0 || self.number_of_slots > MAX_QUEUE_CAPACITY {
            return Err(invalid(format!(
                "number_of_slots must be within 1..={MAX_QUEUE_CAPACITY}, got {}",
                self.number_of_slots
            )));
        }
        if self.slot_content_size == 0 {
            return Err(invalid("slot_content_size must be > 0".to_string()));
        }
        let alignment = self.slot_content_alignment;
        let max_alignment = self.memory_technology.start_alignment();
        if !alignment.is_power_of_two() || alignment > max_alignment {
            return Err(invalid(format!(
                "slot_content_alignment must be a power of two <= {max_alignment}, got {alignment}"
            )));
        }
        if self.max_number_receivers == 0 {
            return Err(invalid("max_number_receivers must be > 0".to_string()));
        }
        if self.receiver_classes.is_empty() {
            return Err(invalid("at least one receiver class is required".to_string()));
        }
        for class in &self.receiver_classes {
            if class.max_in_flight == 0 {
                return Err(invalid(format!(
                    "receiver class {:?} must allow at least one slot in flight",
                    class.name
                )));
            }
        }
        self.segment_bounds()?;
        Ok(())
    }

    /// Upper bounds of the slot and queue segment sizes
    ///
    /// Every region is charged its worst-case alignment padding, so the
    /// planned segments never exceed these sizes.
    pub fn segment_bounds(&self) -> Result<(usize, usize)> {
        let too_large = |what: &str| {
            invalid(format!(
                "{what} segment of this configuration does not fit into {MAX_SEGMENT_SIZE} bytes"
            ))
        };
        let slots = self.number_of_slots as usize;
        let slot_size = self
            .slot_content_size
            .checked_add(self.slot_content_alignment)
            .and_then(|size| size.checked_add(2 * CACHE_LINE_SIZE))
            .and_then(|size| size.checked_mul(slots))
            .and_then(|size| size.checked_add(CACHE_LINE_SIZE))
            .filter(|size| *size <= MAX_SEGMENT_SIZE)
            .ok_or_else(|| too_large("slot"))?;
        let queue_size = slots
            .checked_mul(mem::size_of::<SlotIndex>())
            .and_then(|size| size.checked_add(4 * 2 * CACHE_LINE_SIZE))
            .and_then(|size| size.checked_mul(self.max_number_receivers as usize))
            .filter(|size| *size <= MAX_SEGMENT_SIZE)
            .ok_or_else(|| too_large("queue"))?;
        Ok((slot_size, queue_size))
    }

    /// Index of the receiver class called `name`
    pub fn class_index(&self, name: &str) -> Option<usize> {
        self.receiver_classes.iter().position(|c| c.name == name)
    }
}

fn invalid(message: String) -> Error {
    Error::InvalidConfiguration(message)
}

fn check_disjoint_and_inside(ranges: &mut [MemoryRange], memory_size: usize) -> Result<()> {
    for range in ranges.iter() {
        if !range.fits_in(memory_size) {
            return Err(invalid(format!(
                "range {}+{} is outside of {memory_size} bytes",
                range.offset(),
                range.size()
            )));
        }
    }
    ranges.sort_unstable_by_key(|r| r.offset());
    for pair in ranges.windows(2) {
        if pair[0].overlaps(&pair[1]) {
            return Err(invalid(format!(
                "ranges at offsets {} and {} overlap",
                pair[0].offset(),
                pair[1].offset()
            )));
        }
    }
    Ok(())
}
