//! Zero-copy server
//!
//! [`Server`] ties the pieces together on a single event loop thread: it owns
//! the slot and queue memory, the [`ServerLogic`] and one [`Receiver`] per
//! client. Side channels never call into a receiver directly. They post
//! [`ServerEvent`]s through an [`EventSender`], and the events are handled on
//! the next [`Server::process_events`] call, which also frees receivers that
//! are no longer in use.

use std::collections::BTreeMap;
use std::sync::{mpsc, Arc};

use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::{Error, ErrorCode, Result};
use crate::logic::{DroppedInformation, ServerLogic};
use crate::manager::ServerMemoryManager;
use crate::memory::{MemoryObject, MemoryProvider, ReadWritableMemory};
use crate::queue::SlotIndex;
use crate::receiver::{
    connection_request, ClientMessage, Receiver, ReceiverContext, ReceiverState, SideChannel,
};
use crate::slot::WritableSlotDescriptor;

/// Identifies a receiver of one server
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReceiverId(u32);

impl ReceiverId {
    /// Raw id, unique for the lifetime of the server
    pub fn id(&self) -> u32 {
        self.0
    }
}

/// Something a side channel observed, handled on the next loop iteration
#[derive(Debug, Clone)]
pub enum ServerEvent {
    Message {
        receiver: ReceiverId,
        message: ClientMessage,
    },
    Error {
        receiver: ReceiverId,
        code: ErrorCode,
    },
}

/// Posts events for one receiver to the server's event queue
#[derive(Debug, Clone)]
pub struct EventSender {
    receiver: ReceiverId,
    tx: mpsc::Sender<ServerEvent>,
}

impl EventSender {
    /// Receiver the events are posted for
    pub fn receiver(&self) -> ReceiverId {
        self.receiver
    }

    /// Queue an inbound message; `false` if the server is gone
    pub fn message(&self, message: ClientMessage) -> bool {
        self.tx
            .send(ServerEvent::Message {
                receiver: self.receiver,
                message,
            })
            .is_ok()
    }

    /// Queue a connection error; `false` if the server is gone
    pub fn error(&self, code: ErrorCode) -> bool {
        self.tx
            .send(ServerEvent::Error {
                receiver: self.receiver,
                code,
            })
            .is_ok()
    }
}

/// Zero-copy server owning slot memory, queues and receivers
pub struct Server {
    manager: ServerMemoryManager,
    slot_memory: MemoryObject,
    queue_memory: MemoryObject,
    queue_view: ReadWritableMemory,
    slots: Vec<WritableSlotDescriptor>,
    logic: ServerLogic,
    receivers: BTreeMap<ReceiverId, Receiver>,
    free_queues: Vec<usize>,
    events_tx: mpsc::Sender<ServerEvent>,
    events_rx: mpsc::Receiver<ServerEvent>,
    next_id: u32,
    shut_down: bool,
}

impl Server {
    /// Validate `config`, allocate slot and queue memory and start with no receivers
    pub fn new(config: &ServerConfig, provider: Arc<dyn MemoryProvider>) -> Result<Self> {
        let manager = ServerMemoryManager::new(config, provider)?;
        let slot_memory = manager.allocate_slot_memory()?;
        let queue_memory = manager.allocate_queue_memory()?;
        let queue_view = queue_memory.read_writable();
        let slots = manager.writable_slot_descriptors(&slot_memory.read_writable())?;
        let logic = ServerLogic::new(config.number_of_slots, &config.receiver_classes);
        let (events_tx, events_rx) = mpsc::channel();
        info!(
            slots = config.number_of_slots,
            receivers = config.max_number_receivers,
            technology = ?config.memory_technology,
            "zero-copy server started"
        );
        Ok(Self {
            free_queues: (0..manager.max_number_receivers()).rev().collect(),
            manager,
            slot_memory,
            queue_memory,
            queue_view,
            slots,
            logic,
            receivers: BTreeMap::new(),
            events_tx,
            events_rx,
            next_id: 0,
            shut_down: false,
        })
    }

    /// Start the handshake with a new receiver of class `class`
    ///
    /// `make_channel` builds the side channel to the receiver; it gets the
    /// [`EventSender`] the channel must post inbound messages and errors to.
    pub fn add_receiver<F>(&mut self, class: &str, make_channel: F) -> Result<ReceiverId>
    where
        F: FnOnce(EventSender) -> Box<dyn SideChannel>,
    {
        let class_handle = self.logic.class_handle(class).ok_or_else(|| {
            Error::InvalidConfiguration(format!("unknown receiver class {class:?}"))
        })?;
        let queue_index = self.free_queues.pop().ok_or(Error::TooManyReceivers)?;
        let id = ReceiverId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);

        let channel = make_channel(EventSender {
            receiver: id,
            tx: self.events_tx.clone(),
        });
        let mut receiver = Receiver::new(queue_index, class_handle, channel);
        let request = connection_request(
            &self.manager,
            queue_index,
            &self.slot_memory.exchange_handle(),
            &self.queue_memory.exchange_handle(),
        )?;
        let connected = receiver.connect(request);
        if connected.is_err() {
            // disconnect right away; the receiver is freed once its channel is idle
            let _ = receiver.terminate(&mut self.logic);
        }
        self.receivers.insert(id, receiver);
        connected?;
        debug!(receiver = id.0, queue = queue_index, class, "receiver added");
        Ok(id)
    }

    /// Handle queued side channel events and free unused receivers
    ///
    /// Returns the number of events handled.
    pub fn process_events(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events_rx.try_recv() {
            handled += 1;
            let (id, message, code) = match event {
                ServerEvent::Message { receiver, message } => (receiver, Some(message), None),
                ServerEvent::Error { receiver, code } => (receiver, None, Some(code)),
            };
            let Some(receiver) = self.receivers.get_mut(&id) else {
                debug!(receiver = id.0, "event for unknown receiver dropped");
                continue;
            };
            let mut ctx = ReceiverContext {
                manager: &self.manager,
                queue_memory: &self.queue_view,
                logic: &mut self.logic,
            };
            if let Some(message) = message {
                receiver.handle_message(message, &mut ctx);
            }
            if let Some(code) = code {
                receiver.on_error(code, ctx.logic);
            }
        }
        self.check_logic_corruption();
        self.release_lost_peers();
        self.collect_garbage();
        handled
    }

    /// Take back slots receivers returned; returns the number of receivers found corrupted
    pub fn reclaim_slots(&mut self) -> usize {
        let corrupted = self.logic.reclaim();
        if !corrupted.is_empty() {
            self.check_logic_corruption();
        }
        corrupted.len()
    }

    /// Take a free slot for writing; its content is withdrawn from receivers first
    pub fn acquire_slot(&mut self) -> Option<SlotIndex> {
        let index = self.logic.acquire_slot()?;
        self.slots[index as usize].set_visible(false);
        Some(index)
    }

    /// Writable access to an acquired slot
    pub fn slot_mut(&mut self, index: SlotIndex) -> Result<&mut WritableSlotDescriptor> {
        if !self.logic.is_acquired(index) {
            return Err(Error::InvalidSlot(index));
        }
        Ok(&mut self.slots[index as usize])
    }

    /// Publish an acquired slot to all receivers and notify the listening ones
    pub fn send_slot(&mut self, index: SlotIndex) -> Result<DroppedInformation> {
        if !self.logic.is_acquired(index) {
            return Err(Error::InvalidSlot(index));
        }
        self.slots[index as usize].set_visible(true);
        let dropped = self.logic.send_slot(index)?;
        self.check_logic_corruption();
        for (id, receiver) in self.receivers.iter_mut() {
            if let Err(e) = receiver.notify_new_slot_sent(&dropped) {
                warn!(receiver = id.0, error = %e, "notification failed");
                let _ = self.events_tx.send(ServerEvent::Error {
                    receiver: *id,
                    code: e.code(),
                });
            }
        }
        Ok(dropped)
    }

    /// Return an acquired slot unsent
    pub fn abort_slot(&mut self, index: SlotIndex) -> Result<()> {
        self.logic.abort_slot(index)
    }

    /// Disconnect receiver `id` and release its slots
    pub fn terminate_receiver(&mut self, id: ReceiverId) -> Result<()> {
        let receiver = self
            .receivers
            .get_mut(&id)
            .ok_or(Error::ReceiverNotFound(id.0))?;
        receiver.terminate(&mut self.logic)
    }

    /// Receivers in `Corrupted` that still hold their slots
    ///
    /// Receivers whose peer is gone are disconnected by [`Server::process_events`]
    /// on their own. The others may still read their slots and stay until
    /// [`Server::terminate_receiver`] is called for them.
    pub fn corrupted_receivers(&self) -> Vec<ReceiverId> {
        self.receivers
            .iter()
            .filter(|(_, receiver)| receiver.state() == ReceiverState::Corrupted)
            .map(|(id, _)| *id)
            .collect()
    }

    /// State of receiver `id`; `None` once it was freed
    pub fn receiver_state(&self, id: ReceiverId) -> Option<ReceiverState> {
        self.receivers.get(&id).map(Receiver::state)
    }

    /// Receivers not yet freed
    pub fn number_of_receivers(&self) -> usize {
        self.receivers.len()
    }

    /// Number of slots in the slot memory
    pub fn number_of_slots(&self) -> usize {
        self.slots.len()
    }

    /// Disconnect every receiver, notifying peers where possible
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        for receiver in self.receivers.values_mut() {
            receiver.handle_server_shutdown(&mut self.logic);
        }
        self.collect_garbage();
        info!(remaining = self.receivers.len(), "zero-copy server shut down");
    }

    fn check_logic_corruption(&mut self) {
        for receiver in self.receivers.values_mut() {
            receiver.check_and_handle_logic_corruption(&mut self.logic);
        }
    }

    /// Disconnect corrupted receivers whose peer can no longer read any slot
    fn release_lost_peers(&mut self) {
        for (id, receiver) in self.receivers.iter_mut() {
            let lost = receiver.state() == ReceiverState::Corrupted
                && matches!(
                    receiver.error_code(),
                    Some(ErrorCode::PeerCrashed | ErrorCode::PeerDisconnected)
                );
            if lost && receiver.terminate(&mut self.logic).is_ok() {
                debug!(receiver = id.0, "slots of lost peer released");
            }
        }
    }

    fn collect_garbage(&mut self) {
        let unused: Vec<ReceiverId> = self
            .receivers
            .iter()
            .filter(|(_, receiver)| !receiver.is_in_use())
            .map(|(id, _)| *id)
            .collect();
        for id in unused {
            if let Some(receiver) = self.receivers.remove(&id) {
                self.free_queues.push(receiver.queue_index());
                debug!(receiver = id.0, queue = receiver.queue_index(), "receiver freed");
            }
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}
