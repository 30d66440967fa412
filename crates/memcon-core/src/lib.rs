//! memcon - Zero-copy shared memory connections
//!
//! A server hands slots of shared memory to receivers by passing slot indices
//! through lock-free SPSC queues that live in shared memory themselves.

pub mod client;
pub mod config;
pub mod error;
pub mod layout;
pub mod logic;
pub mod loopback;
pub mod manager;
pub mod memory;
pub mod queue;
pub mod receiver;
pub mod server;
pub mod shm;
pub mod slot;
pub mod storage;

pub use client::{ClientConnection, ServerChannel};
pub use config::{OneSlotConfig, QueueMemoryConfig, ReceiverClassConfig, ServerConfig, SlotMemoryConfig};
pub use error::{Error, ErrorCode, MemoryError, Result};
pub use layout::{MemoryLayoutPlanner, MemoryRange};
pub use logic::{DroppedInformation, ReceiverClassHandle, ReceiverHandle, ServerLogic};
pub use manager::{ClientMemoryManager, ServerMemoryManager};
pub use memory::{
    ExchangeHandle, LocalMemoryProvider, MemoryExchangeHandle, MemoryObject, MemoryProvider, ReadView,
    ReadWritableMemory, ReadableMemory, WriteView,
};
pub use queue::{ReadingQueueEnd, SlotIndex, SpscConsumer, SpscProducer, WritingQueueEnd};
pub use receiver::{ClientMessage, ConnectionRequest, Receiver, ReceiverState, ServerMessage, SideChannel};
pub use server::{EventSender, ReceiverId, Server, ServerEvent};
pub use shm::{ShmemHandle, ShmemProvider};
pub use slot::{ReadableSlotDescriptor, WritableSlotDescriptor};
pub use storage::{AccessMode, MemoryTechnology};
