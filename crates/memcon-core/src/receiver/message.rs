//! Handshake messages exchanged over the side channel

use crate::config::{QueueMemoryConfig, SlotMemoryConfig};
use crate::error::Result;
use crate::memory::ExchangeHandle;
use crate::storage::MemoryTechnology;

/// Everything a client needs to map the server's memory
#[derive(Debug, Clone)]
pub struct ConnectionRequest {
    pub memory_technology: MemoryTechnology,
    pub slot_config: SlotMemoryConfig,
    pub slot_memory: ExchangeHandle,
    /// Queue config of the server's side of this connection
    pub queue_config: QueueMemoryConfig,
    pub queue_memory: ExchangeHandle,
}

impl ConnectionRequest {
    /// Number of slots the request announces
    pub fn number_of_slots(&self) -> usize {
        self.slot_config.number_of_slots()
    }
}

/// Server to client
#[derive(Debug, Clone)]
pub enum ServerMessage {
    ConnectionRequest(ConnectionRequest),
    /// A new slot was sent
    Notification,
    /// The server ends the connection
    Termination,
}

/// Client to server
#[derive(Debug, Clone)]
pub enum ClientMessage {
    AckConnection {
        queue_config: QueueMemoryConfig,
        queue_memory: ExchangeHandle,
    },
    StartListening,
    StopListening,
    Shutdown,
}

impl ClientMessage {
    /// Message name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::AckConnection { .. } => "ack_connection",
            ClientMessage::StartListening => "start_listening",
            ClientMessage::StopListening => "stop_listening",
            ClientMessage::Shutdown => "shutdown",
        }
    }
}

/// Server end of the side channel to one client
pub trait SideChannel: Send {
    fn send(&mut self, message: ServerMessage) -> Result<()>;

    /// Whether the peer process is known to have died
    fn is_peer_crashed(&self) -> bool;

    /// Whether a callback of this channel may still be running
    fn is_in_use(&self) -> bool;
}
