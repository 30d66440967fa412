//! Receiver connection states

use std::fmt;

/// Connection state of one receiver, seen from the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReceiverState {
    /// Connection request sent or about to be sent, no ack yet
    #[default]
    Connecting,
    /// Queues bound, slots are distributed to the receiver
    Connected,
    /// Protocol or peer failure; only termination is accepted
    Corrupted,
    /// Terminal
    Disconnected,
}

impl ReceiverState {
    /// Whether inbound protocol messages are still processed
    pub fn accepts_messages(self) -> bool {
        matches!(self, ReceiverState::Connecting | ReceiverState::Connected)
    }
}

impl fmt::Display for ReceiverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReceiverState::Connecting => "connecting",
            ReceiverState::Connected => "connected",
            ReceiverState::Corrupted => "corrupted",
            ReceiverState::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}
