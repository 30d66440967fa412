//! Receiver side of a zero-copy connection
//!
//! [`ClientConnection::accept`] answers a [`ConnectionRequest`]: it maps the
//! server's slot and queue memory read-only, allocates its own queue memory,
//! binds both queue ends and acknowledges over the [`ServerChannel`].

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::manager::ClientMemoryManager;
use crate::memory::MemoryProvider;
use crate::queue::{SlotIndex, SpscConsumer, SpscProducer};
use crate::receiver::{ClientMessage, ConnectionRequest, ServerMessage};
use crate::slot::ReadableSlotDescriptor;

/// Client end of the side channel to the server
pub trait ServerChannel: Send {
    fn send(&mut self, message: ClientMessage) -> Result<()>;
}

/// An accepted connection to a zero-copy server
pub struct ClientConnection {
    channel: Box<dyn ServerChannel>,
    slots: Vec<ReadableSlotDescriptor>,
    to_server: SpscProducer<SlotIndex>,
    from_server: SpscConsumer<SlotIndex>,
    held: Vec<bool>,
    listening: bool,
    terminated: bool,
}

impl ClientConnection {
    /// Answer `request`: map the server's memory, bind the queues and acknowledge
    pub fn accept(
        request: ConnectionRequest,
        provider: Arc<dyn MemoryProvider>,
        mut channel: Box<dyn ServerChannel>,
    ) -> Result<Self> {
        let number_of_slots = u32::try_from(request.number_of_slots()).map_err(|_| {
            Error::InvalidConfiguration(format!("{} slots announced", request.number_of_slots()))
        })?;
        let manager = ClientMemoryManager::new(request.memory_technology, number_of_slots, provider)?;

        let slot_memory = manager.map_slot_memory(&request.slot_memory, &request.slot_config)?;
        let slots = manager.readable_slot_descriptors(&slot_memory, &request.slot_config)?;
        let server_queue_memory =
            manager.map_server_queue_memory(&request.queue_memory, &request.queue_config)?;
        let queue_memory = manager.allocate_queue_memory()?;
        let (to_server, from_server) = manager.initialize_queue_ends(
            &queue_memory.read_writable(),
            &request.queue_config,
            &server_queue_memory,
        )?;

        channel.send(ClientMessage::AckConnection {
            queue_config: manager.queue_config(),
            queue_memory: queue_memory.exchange_handle(),
        })?;
        debug!(slots = number_of_slots, "connection accepted");

        Ok(Self {
            channel,
            held: vec![false; slots.len()],
            slots,
            to_server,
            from_server,
            listening: false,
            terminated: false,
        })
    }

    /// Ask the server for notifications about new slots
    pub fn start_listening(&mut self) -> Result<()> {
        if self.listening {
            return Err(Error::ProtocolViolation("already listening".to_string()));
        }
        self.channel.send(ClientMessage::StartListening)?;
        self.listening = true;
        Ok(())
    }

    /// Stop notifications; slots keep arriving in the queue
    pub fn stop_listening(&mut self) -> Result<()> {
        if !self.listening {
            return Err(Error::ProtocolViolation("not listening".to_string()));
        }
        self.channel.send(ClientMessage::StopListening)?;
        self.listening = false;
        Ok(())
    }

    /// Whether notifications were requested
    pub fn is_listening(&self) -> bool {
        self.listening
    }

    /// Whether the server ended the connection
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Next slot the server sent, if any
    pub fn receive(&mut self) -> Result<Option<SlotIndex>> {
        let Some(index) = self.from_server.consume()? else {
            return Ok(None);
        };
        match self.held.get_mut(index as usize) {
            Some(held) if !*held => {
                *held = true;
                Ok(Some(index))
            }
            _ => Err(Error::InvalidSlot(index)),
        }
    }

    /// A slot received and not yet released
    pub fn slot(&self, index: SlotIndex) -> Result<&ReadableSlotDescriptor> {
        match self.held.get(index as usize) {
            Some(true) => Ok(&self.slots[index as usize]),
            _ => Err(Error::InvalidSlot(index)),
        }
    }

    /// Hand a received slot back to the server
    pub fn release(&mut self, index: SlotIndex) -> Result<()> {
        if !matches!(self.held.get(index as usize), Some(true)) {
            return Err(Error::InvalidSlot(index));
        }
        if !self.to_server.produce(index)? {
            return Err(Error::ProtocolViolation("return queue is full".to_string()));
        }
        self.held[index as usize] = false;
        Ok(())
    }

    /// Number of slots received and not yet released
    pub fn held(&self) -> usize {
        self.held.iter().filter(|h| **h).count()
    }

    /// Handle a message from the server after the handshake
    pub fn handle_message(&mut self, message: ServerMessage) -> Result<()> {
        match message {
            ServerMessage::Notification => Ok(()),
            ServerMessage::Termination => {
                debug!("server terminated the connection");
                self.terminated = true;
                self.listening = false;
                Ok(())
            }
            ServerMessage::ConnectionRequest(_) => Err(Error::ProtocolViolation(
                "connection request on an established connection".to_string(),
            )),
        }
    }

    /// Tell the server this client is done
    pub fn shutdown(mut self) -> Result<()> {
        if self.terminated {
            return Ok(());
        }
        if let Err(e) = self.channel.send(ClientMessage::Shutdown) {
            warn!(error = %e, "failed to send shutdown");
            return Err(e);
        }
        Ok(())
    }
}
