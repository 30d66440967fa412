//! Slot distribution among receivers
//!
//! [`ServerLogic`] owns the queue ends of every connected receiver. It hands
//! slots to the server for writing, distributes sent slots to receivers
//! subject to the in-flight limit of their receiver class, and takes slots
//! back once every receiver returned them. A receiver that returns a slot it
//! does not hold, or whose queue violates the protocol, is marked corrupted
//! and no longer receives slots.

use std::collections::{BTreeMap, VecDeque};

use tracing::{debug, warn};

use crate::config::ReceiverClassConfig;
use crate::error::{Error, Result};
use crate::queue::{ReadingQueueEnd, SlotIndex, WritingQueueEnd};

/// Identifies a receiver inside the logic layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReceiverHandle(u32);

impl ReceiverHandle {
    /// Raw id
    pub fn id(&self) -> u32 {
        self.0
    }
}

/// Index of a receiver class in the server configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReceiverClassHandle(pub usize);

/// Receiver classes that did not get a sent slot because of their limit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DroppedInformation {
    dropped: Vec<bool>,
}

impl DroppedInformation {
    /// Whether `class` did not get the slot
    pub fn is_dropped_for(&self, class: ReceiverClassHandle) -> bool {
        self.dropped.get(class.0).copied().unwrap_or(false)
    }

    /// Whether any class did not get the slot
    pub fn any_dropped(&self) -> bool {
        self.dropped.iter().any(|d| *d)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Acquired,
    Sent,
}

#[derive(Debug)]
struct SlotUsage {
    state: SlotState,
    /// Receivers holding the slot, per class
    holders: Vec<u32>,
}

impl SlotUsage {
    fn total_holders(&self) -> u32 {
        self.holders.iter().sum()
    }
}

struct ClassUsage {
    name: String,
    max_in_flight: u32,
    in_flight: u32,
}

struct LogicReceiver {
    class: ReceiverClassHandle,
    writer: Box<dyn WritingQueueEnd>,
    reader: Box<dyn ReadingQueueEnd>,
    held: Vec<bool>,
    corrupted: bool,
}

/// Slot bookkeeping of one server
pub struct ServerLogic {
    slots: Vec<SlotUsage>,
    free: VecDeque<SlotIndex>,
    classes: Vec<ClassUsage>,
    receivers: BTreeMap<ReceiverHandle, LogicReceiver>,
    next_handle: u32,
}

impl ServerLogic {
    /// All slots free, no receivers
    pub fn new(number_of_slots: u32, classes: &[ReceiverClassConfig]) -> Self {
        let slots = (0..number_of_slots)
            .map(|_| SlotUsage {
                state: SlotState::Free,
                holders: vec![0; classes.len()],
            })
            .collect();
        Self {
            slots,
            free: (0..number_of_slots).collect(),
            classes: classes
                .iter()
                .map(|c| ClassUsage {
                    name: c.name.clone(),
                    max_in_flight: c.max_in_flight,
                    in_flight: 0,
                })
                .collect(),
            receivers: BTreeMap::new(),
            next_handle: 0,
        }
    }

    /// Get number of slots
    pub fn number_of_slots(&self) -> usize {
        self.slots.len()
    }

    /// Handle of the receiver class called `name`
    pub fn class_handle(&self, name: &str) -> Option<ReceiverClassHandle> {
        self.classes
            .iter()
            .position(|c| c.name == name)
            .map(ReceiverClassHandle)
    }

    /// Slots currently held by receivers of `class`
    pub fn in_flight(&self, class: ReceiverClassHandle) -> u32 {
        self.classes.get(class.0).map_or(0, |c| c.in_flight)
    }

    /// Register the queue ends of a connected receiver
    pub fn add_receiver(
        &mut self,
        class: ReceiverClassHandle,
        writer: Box<dyn WritingQueueEnd>,
        reader: Box<dyn ReadingQueueEnd>,
    ) -> Result<ReceiverHandle> {
        if class.0 >= self.classes.len() {
            return Err(Error::InvalidConfiguration(format!(
                "unknown receiver class {}",
                class.0
            )));
        }
        let handle = ReceiverHandle(self.next_handle);
        self.next_handle = self.next_handle.wrapping_add(1);
        self.receivers.insert(
            handle,
            LogicReceiver {
                class,
                writer,
                reader,
                held: vec![false; self.slots.len()],
                corrupted: false,
            },
        );
        debug!(receiver = handle.0, class = class.0, "receiver added to logic");
        Ok(handle)
    }

    /// Drop a receiver and release every slot it still holds
    pub fn remove_receiver(&mut self, handle: ReceiverHandle) -> Result<()> {
        let receiver = self
            .receivers
            .remove(&handle)
            .ok_or(Error::ReceiverNotFound(handle.0))?;
        for (index, held) in receiver.held.iter().enumerate() {
            if *held {
                self.release(index as SlotIndex, receiver.class);
            }
        }
        debug!(receiver = handle.0, "receiver removed from logic");
        Ok(())
    }

    /// Whether the receiver violated the slot protocol
    pub fn is_receiver_corrupted(&self, handle: ReceiverHandle) -> bool {
        self.receivers.get(&handle).is_some_and(|r| r.corrupted)
    }

    /// Stop distributing slots to a receiver; its held slots stay held until removal
    pub fn mark_corrupted(&mut self, handle: ReceiverHandle) {
        if let Some(receiver) = self.receivers.get_mut(&handle) {
            receiver.corrupted = true;
        }
    }

    /// Take a free slot for writing
    pub fn acquire_slot(&mut self) -> Option<SlotIndex> {
        let index = self.free.pop_front()?;
        self.slots[index as usize].state = SlotState::Acquired;
        Some(index)
    }

    /// Whether `index` is currently acquired for writing
    pub fn is_acquired(&self, index: SlotIndex) -> bool {
        self.expect_acquired(index).is_ok()
    }

    /// Give an acquired slot back without sending it
    pub fn abort_slot(&mut self, index: SlotIndex) -> Result<()> {
        self.expect_acquired(index)?;
        self.free_slot(index);
        Ok(())
    }

    /// Distribute an acquired slot to all receivers whose class has room
    pub fn send_slot(&mut self, index: SlotIndex) -> Result<DroppedInformation> {
        self.expect_acquired(index)?;
        let mut dropped = vec![false; self.classes.len()];
        let mut accepted = vec![false; self.classes.len()];
        for (class, usage) in self.classes.iter().enumerate() {
            if usage.in_flight >= usage.max_in_flight {
                dropped[class] = true;
            }
        }

        let slot = &mut self.slots[index as usize];
        slot.state = SlotState::Sent;
        for (handle, receiver) in self.receivers.iter_mut() {
            let class = receiver.class.0;
            if receiver.corrupted || dropped[class] {
                continue;
            }
            match receiver.writer.push(index) {
                Ok(true) => {
                    receiver.held[index as usize] = true;
                    slot.holders[class] += 1;
                    accepted[class] = true;
                }
                Ok(false) => {
                    warn!(receiver = handle.0, slot = index, "receiver queue overflow");
                    receiver.corrupted = true;
                }
                Err(e) => {
                    warn!(receiver = handle.0, error = %e, "receiver queue corrupted");
                    receiver.corrupted = true;
                }
            }
        }
        for (class, usage) in self.classes.iter_mut().enumerate() {
            if accepted[class] {
                usage.in_flight += 1;
            }
        }
        if slot.total_holders() == 0 {
            self.free_slot(index);
        }
        Ok(DroppedInformation { dropped })
    }

    /// Drain the return queues; returns receivers found corrupted by this call
    pub fn reclaim(&mut self) -> Vec<ReceiverHandle> {
        let mut corrupted = Vec::new();
        let mut returned = Vec::new();
        for (handle, receiver) in self.receivers.iter_mut() {
            if receiver.corrupted {
                continue;
            }
            loop {
                match receiver.reader.pop() {
                    Ok(Some(index)) => {
                        let slot = index as usize;
                        if slot >= receiver.held.len() || !receiver.held[slot] {
                            warn!(receiver = handle.0, slot = index, "returned a slot it does not hold");
                            receiver.corrupted = true;
                            break;
                        }
                        receiver.held[slot] = false;
                        returned.push((index, receiver.class));
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(receiver = handle.0, error = %e, "return queue corrupted");
                        receiver.corrupted = true;
                        break;
                    }
                }
            }
            if receiver.corrupted {
                corrupted.push(*handle);
            }
        }
        for (index, class) in returned {
            self.release(index, class);
        }
        corrupted
    }

    fn expect_acquired(&self, index: SlotIndex) -> Result<()> {
        match self.slots.get(index as usize) {
            Some(slot) if slot.state == SlotState::Acquired => Ok(()),
            _ => Err(Error::InvalidSlot(index)),
        }
    }

    fn release(&mut self, index: SlotIndex, class: ReceiverClassHandle) {
        let slot = &mut self.slots[index as usize];
        slot.holders[class.0] -= 1;
        if slot.holders[class.0] == 0 {
            self.classes[class.0].in_flight -= 1;
        }
        if slot.total_holders() == 0 {
            self.free_slot(index);
        }
    }

    fn free_slot(&mut self, index: SlotIndex) {
        self.slots[index as usize].state = SlotState::Free;
        self.free.push_back(index);
    }
}
