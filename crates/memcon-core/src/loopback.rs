//! In-process side channel
//!
//! Connects a [`Server`](crate::server::Server) and a
//! [`ClientConnection`](crate::client::ClientConnection) living in the same
//! process, e.g. on two threads. Messages to the client go through an
//! `mpsc` channel, messages to the server through its [`EventSender`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use crate::client::ServerChannel;
use crate::error::{Error, ErrorCode, Result};
use crate::receiver::{ClientMessage, ServerMessage, SideChannel};
use crate::server::EventSender;

/// Server end of a loopback pair
#[derive(Debug)]
pub struct LoopbackSideChannel {
    tx: mpsc::Sender<ServerMessage>,
    closed: Arc<AtomicBool>,
}

/// Client end of a loopback pair
#[derive(Debug)]
pub struct LoopbackEndpoint {
    rx: mpsc::Receiver<ServerMessage>,
    events: EventSender,
    closed: Arc<AtomicBool>,
    shutdown_sent: Arc<AtomicBool>,
}

/// Channel the client uses to talk to the server
#[derive(Debug, Clone)]
pub struct LoopbackServerChannel {
    events: EventSender,
    shutdown_sent: Arc<AtomicBool>,
}

/// Create a connected pair for the receiver `events` belongs to
pub fn pair(events: EventSender) -> (LoopbackSideChannel, LoopbackEndpoint) {
    let (tx, rx) = mpsc::channel();
    let closed = Arc::new(AtomicBool::new(false));
    (
        LoopbackSideChannel {
            tx,
            closed: closed.clone(),
        },
        LoopbackEndpoint {
            rx,
            events,
            closed,
            shutdown_sent: Arc::new(AtomicBool::new(false)),
        },
    )
}

impl SideChannel for LoopbackSideChannel {
    fn send(&mut self, message: ServerMessage) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::SendFailed("loopback closed".to_string()));
        }
        self.tx
            .send(message)
            .map_err(|_| Error::SendFailed("loopback endpoint dropped".to_string()))
    }

    fn is_peer_crashed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn is_in_use(&self) -> bool {
        false
    }
}

impl LoopbackEndpoint {
    /// Next message from the server, if one is queued
    pub fn try_recv(&self) -> Option<ServerMessage> {
        self.rx.try_recv().ok()
    }

    /// Wait up to `timeout` for the next message from the server
    pub fn recv_timeout(&self, timeout: Duration) -> Option<ServerMessage> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Channel to send client messages with
    pub fn channel(&self) -> LoopbackServerChannel {
        LoopbackServerChannel {
            events: self.events.clone(),
            shutdown_sent: self.shutdown_sent.clone(),
        }
    }
}

impl Drop for LoopbackEndpoint {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
        if !self.shutdown_sent.load(Ordering::Acquire) {
            // the server learns about it on its next loop iteration
            self.events.error(ErrorCode::PeerDisconnected);
        }
    }
}

impl ServerChannel for LoopbackServerChannel {
    fn send(&mut self, message: ClientMessage) -> Result<()> {
        let shutdown = matches!(message, ClientMessage::Shutdown);
        if !self.events.message(message) {
            return Err(Error::SendFailed("server dropped".to_string()));
        }
        if shutdown {
            self.shutdown_sent.store(true, Ordering::Release);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::memory::LocalMemoryProvider;
    use crate::receiver::ReceiverState;
    use crate::server::Server;

    fn server() -> Server {
        Server::new(&ServerConfig::default(), Arc::new(LocalMemoryProvider::new())).unwrap()
    }

    #[test]
    fn test_dropping_endpoint_reports_disconnect() {
        let mut server = server();
        let mut endpoint = None;
        let id = server
            .add_receiver("default", |events| {
                let (side, end) = pair(events);
                endpoint = Some(end);
                Box::new(side) as Box<dyn SideChannel>
            })
            .unwrap();
        let endpoint = endpoint.unwrap();
        assert!(matches!(
            endpoint.try_recv(),
            Some(ServerMessage::ConnectionRequest(_))
        ));

        drop(endpoint);
        assert_eq!(server.receiver_state(id), Some(ReceiverState::Connecting));
        server.process_events();
        assert_eq!(server.receiver_state(id), None);
        assert!(matches!(
            server.terminate_receiver(id),
            Err(Error::ReceiverNotFound(_))
        ));
    }

    #[test]
    fn test_shutdown_is_not_a_disconnect() {
        let mut server = server();
        let mut endpoint = None;
        let id = server
            .add_receiver("default", |events| {
                let (side, end) = pair(events);
                endpoint = Some(end);
                Box::new(side) as Box<dyn SideChannel>
            })
            .unwrap();
        let endpoint = endpoint.unwrap();
        endpoint.channel().send(ClientMessage::Shutdown).unwrap();
        drop(endpoint);
        assert_eq!(server.process_events(), 1);
        assert_eq!(server.receiver_state(id), None);
    }
}
