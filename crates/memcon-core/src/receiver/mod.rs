//! Server side receiver connections
//!
//! A [`Receiver`] drives the handshake with one client over a [`SideChannel`]
//! and hands the resulting queue ends to the [`ServerLogic`](crate::logic::ServerLogic).

mod connection;
mod message;
mod state;

pub use connection::{connection_request, Receiver, ReceiverContext};
pub use message::{ClientMessage, ConnectionRequest, ServerMessage, SideChannel};
pub use state::ReceiverState;
