//! Slot descriptors
//!
//! A slot is a region of slot memory plus a global visibility flag. The
//! server writes content through a [`WritableSlotDescriptor`] while the flag
//! is cleared and sets it before handing the slot index to receivers.
//! Receivers check the flag through a [`ReadableSlotDescriptor`] before
//! trusting the content.

use std::sync::atomic::Ordering;

use crate::config::{OneSlotConfig, VisibilityFlag};
use crate::error::{Error, Result};
use crate::memory::{ReadView, ReadWritableMemory, ReadableMemory, WriteView};
use crate::queue::SlotIndex;

const INVISIBLE: u32 = 0;
const VISIBLE: u32 = 1;

/// Server-side access to one slot
#[derive(Debug)]
pub struct WritableSlotDescriptor {
    index: SlotIndex,
    flag: WriteView<VisibilityFlag>,
    content: WriteView<u8>,
}

impl WritableSlotDescriptor {
    /// Bind slot `index` inside the writable slot memory
    pub fn new(index: SlotIndex, memory: &ReadWritableMemory, config: &OneSlotConfig) -> Result<Self> {
        Ok(Self {
            index,
            flag: memory.write_view(config.visibility_flag())?,
            content: memory.write_view(config.content())?,
        })
    }

    /// Index of the slot
    pub fn index(&self) -> SlotIndex {
        self.index
    }

    /// Capacity of the slot content in bytes
    pub fn capacity(&self) -> usize {
        self.content.len()
    }

    /// Current slot content, as receivers would read it
    pub fn content(&self) -> &[u8] {
        self.content.as_slice()
    }

    /// Copy `data` to the start of the slot content
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > self.capacity() {
            return Err(Error::SlotOverflow {
                requested: data.len(),
                available: self.capacity(),
            });
        }
        self.content.copy_from(0, data);
        Ok(())
    }

    /// Publish or withdraw the content for receivers
    pub fn set_visible(&self, visible: bool) {
        let value = if visible { VISIBLE } else { INVISIBLE };
        self.flag.get(0).store(value, Ordering::Release);
    }

    /// Whether the content is currently published
    pub fn is_visible(&self) -> bool {
        self.flag.get(0).load(Ordering::Acquire) == VISIBLE
    }
}

/// Receiver-side access to one slot
#[derive(Debug)]
pub struct ReadableSlotDescriptor {
    index: SlotIndex,
    flag: ReadView<VisibilityFlag>,
    content: ReadView<u8>,
}

impl ReadableSlotDescriptor {
    /// Bind slot `index` inside the mapped slot memory
    pub fn new(index: SlotIndex, memory: &ReadableMemory, config: &OneSlotConfig) -> Result<Self> {
        Ok(Self {
            index,
            flag: memory.read_view(config.visibility_flag())?,
            content: memory.read_view(config.content())?,
        })
    }

    /// Index of the slot
    pub fn index(&self) -> SlotIndex {
        self.index
    }

    /// Capacity of the slot content in bytes
    pub fn capacity(&self) -> usize {
        self.content.len()
    }

    /// Whether the server currently publishes the content
    pub fn is_visible(&self) -> bool {
        self.flag.get(0).load(Ordering::Acquire) == VISIBLE
    }

    /// Slot content as mapped; the server may change it once the flag clears
    pub fn content(&self) -> &[u8] {
        self.content.as_slice()
    }

    /// Copy the content into `out` if the slot is visible before and after the copy
    pub fn read_into(&self, out: &mut [u8]) -> Result<usize> {
        if !self.is_visible() {
            return Err(Error::ProtocolViolation(format!(
                "slot {} is not visible",
                self.index
            )));
        }
        let len = out.len().min(self.capacity());
        out[..len].copy_from_slice(&self.content()[..len]);
        if !self.is_visible() {
            return Err(Error::ProtocolViolation(format!(
                "slot {} was withdrawn while reading",
                self.index
            )));
        }
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::MemoryRange;
    use crate::memory::{LocalMemoryProvider, MemoryProvider};
    use crate::storage::MemoryTechnology;

    fn slot_config() -> OneSlotConfig {
        OneSlotConfig::new(MemoryRange::new(0, 4), MemoryRange::new(64, 32))
    }

    #[test]
    fn test_visibility_and_content_are_shared() {
        let memory = LocalMemoryProvider::new()
            .allocate(MemoryTechnology::SharedMemory, 128)
            .unwrap();
        let mut writer =
            WritableSlotDescriptor::new(3, &memory.read_writable(), &slot_config()).unwrap();
        let reader = ReadableSlotDescriptor::new(3, &memory.readable(), &slot_config()).unwrap();

        writer.write(b"zero-copy").unwrap();
        let mut out = [0u8; 9];
        assert!(reader.read_into(&mut out).is_err());

        writer.set_visible(true);
        assert!(reader.is_visible());
        assert_eq!(reader.read_into(&mut out).unwrap(), 9);
        assert_eq!(&out, b"zero-copy");
        assert_eq!(reader.index(), 3);
    }

    #[test]
    fn test_writes_through_two_descriptors_of_one_slot() {
        let memory = LocalMemoryProvider::new()
            .allocate(MemoryTechnology::SharedMemory, 128)
            .unwrap();
        let mut first =
            WritableSlotDescriptor::new(1, &memory.read_writable(), &slot_config()).unwrap();
        let mut second =
            WritableSlotDescriptor::new(1, &memory.read_writable(), &slot_config()).unwrap();

        first.write(&[0xaa; 32]).unwrap();
        second.write(b"xy").unwrap();
        assert_eq!(&first.content()[..3], &[b'x', b'y', 0xaa]);
        assert_eq!(first.content().len(), 32);

        // a full-capacity write is allowed
        first.write(&[7u8; 32]).unwrap();
        assert!(second.content().iter().all(|b| *b == 7));
    }

    #[test]
    fn test_write_beyond_capacity_fails() {
        let memory = LocalMemoryProvider::new()
            .allocate(MemoryTechnology::SharedMemory, 128)
            .unwrap();
        let mut writer =
            WritableSlotDescriptor::new(0, &memory.read_writable(), &slot_config()).unwrap();
        assert!(matches!(
            writer.write(&[0u8; 33]),
            Err(Error::SlotOverflow {
                requested: 33,
                available: 32
            })
        ));
    }
}
