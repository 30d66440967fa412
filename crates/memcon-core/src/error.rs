//! Error types for memcon

use thiserror::Error;

use crate::storage::MemoryTechnology;

/// Failures reported by a memory provider or a memory exchange handle
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("memory technology {0:?} is not supported by this provider")]
    UnsupportedType(MemoryTechnology),

    #[error("invalid memory size: {0}")]
    InvalidSize(usize),

    #[error("insufficient system resources: {0}")]
    InsufficientResources(String),

    #[error("insufficient privileges to access memory")]
    InsufficientPrivileges,

    #[error("invalid memory exchange handle")]
    InvalidHandle,

    #[error("memory size mismatch: expected {expected}, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("range {offset}+{size} is outside of {available} mapped bytes")]
    OutOfBounds {
        offset: usize,
        size: usize,
        available: usize,
    },

    #[error("shared memory error: {0}")]
    SharedMemory(String),
}

/// Reason a receiver connection was declared corrupted
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    #[error("peer disconnected without following the protocol")]
    PeerDisconnected,

    #[error("peer crashed")]
    PeerCrashed,

    #[error("peer violated the handshake protocol")]
    ProtocolError,

    #[error("shared queue memory corrupted")]
    QueueCorrupted,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("queue corrupted: head={head} tail={tail} capacity={capacity}")]
    QueueCorrupted { head: u32, tail: u32, capacity: u32 },

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("invalid slot index: {0}")]
    InvalidSlot(u32),

    #[error("slot content overflow: {requested} bytes requested, {available} available")]
    SlotOverflow { requested: usize, available: usize },

    #[error("peer crashed")]
    PeerCrashed,

    #[error("side channel send failed: {0}")]
    SendFailed(String),

    #[error("receiver already disconnected")]
    AlreadyDisconnected,

    #[error("receiver not found: {0}")]
    ReceiverNotFound(u32),

    #[error("maximum number of receivers reached")]
    TooManyReceivers,

    #[error("config parse error: {0}")]
    ConfigParse(String),
}

impl Error {
    /// Connection-level error code this error maps to when it is blamed on a peer
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::QueueCorrupted { .. } => ErrorCode::QueueCorrupted,
            Error::PeerCrashed => ErrorCode::PeerCrashed,
            Error::SendFailed(_) | Error::AlreadyDisconnected => ErrorCode::PeerDisconnected,
            _ => ErrorCode::ProtocolError,
        }
    }
}

/// Result type for memcon operations
pub type Result<T> = std::result::Result<T, Error>;
