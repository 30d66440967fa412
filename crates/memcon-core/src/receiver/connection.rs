//! Per receiver connection state machine
//!
//! ```text
//!  Connecting ──ack──▶ Connected ──shutdown──▶ Disconnected
//!      │                  │                         ▲
//!      └──error──▶ Corrupted ◀──error──┘            │
//!                     └──terminate / server shutdown┘
//! ```
//!
//! All triggers run on the server's event loop thread. They take `&mut self`,
//! so a trigger can never be entered while another one is still running.

use std::cell::Cell;
use std::sync::Arc;

use tracing::{debug, warn};

use super::message::{ClientMessage, ConnectionRequest, ServerMessage, SideChannel};
use super::state::ReceiverState;
use crate::config::QueueMemoryConfig;
use crate::error::{Error, ErrorCode, Result};
use crate::logic::{DroppedInformation, ReceiverClassHandle, ReceiverHandle, ServerLogic};
use crate::manager::ServerMemoryManager;
use crate::memory::{ExchangeHandle, ReadWritableMemory};

/// Server resources a trigger may touch
pub struct ReceiverContext<'a> {
    pub manager: &'a ServerMemoryManager,
    pub queue_memory: &'a ReadWritableMemory,
    pub logic: &'a mut ServerLogic,
}

/// Server side of the connection to one receiver
pub struct Receiver {
    queue_index: usize,
    class: ReceiverClassHandle,
    channel: Box<dyn SideChannel>,
    state: ReceiverState,
    connect_called: bool,
    listening: bool,
    logic_handle: Option<ReceiverHandle>,
    error: Option<ErrorCode>,
    in_use: Cell<bool>,
}

impl Receiver {
    /// A receiver in `Connecting` that will use queue `queue_index`
    pub fn new(queue_index: usize, class: ReceiverClassHandle, channel: Box<dyn SideChannel>) -> Self {
        Self {
            queue_index,
            class,
            channel,
            state: ReceiverState::Connecting,
            connect_called: false,
            listening: false,
            logic_handle: None,
            error: None,
            in_use: Cell::new(true),
        }
    }

    /// Current state
    pub fn state(&self) -> ReceiverState {
        self.state
    }

    /// Index of the server queue this receiver uses
    pub fn queue_index(&self) -> usize {
        self.queue_index
    }

    /// Receiver class
    pub fn class(&self) -> ReceiverClassHandle {
        self.class
    }

    /// Whether the receiver asked for notifications
    pub fn is_listening(&self) -> bool {
        self.listening
    }

    /// Reason of the transition to `Corrupted`
    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error
    }

    /// Handle in the logic layer while connected
    pub fn logic_handle(&self) -> Option<ReceiverHandle> {
        self.logic_handle
    }

    /// Send the connection request; the receiver stays `Connecting` until acknowledged
    pub fn connect(&mut self, request: ConnectionRequest) -> Result<()> {
        if self.state != ReceiverState::Connecting || self.connect_called {
            return Err(Error::ProtocolViolation(format!(
                "connect in state {} after connect={}",
                self.state, self.connect_called
            )));
        }
        self.connect_called = true;
        if self.channel.is_peer_crashed() {
            self.enter_corrupted(ErrorCode::PeerCrashed, None);
            return Err(Error::PeerCrashed);
        }
        if let Err(e) = self.channel.send(ServerMessage::ConnectionRequest(request)) {
            self.enter_corrupted(e.code(), None);
            return Err(e);
        }
        debug!(queue = self.queue_index, "connection request sent");
        Ok(())
    }

    /// Dispatch one inbound message
    pub fn handle_message(&mut self, message: ClientMessage, ctx: &mut ReceiverContext<'_>) {
        if !self.state.accepts_messages() {
            debug!(state = %self.state, message = message.kind(), "message ignored");
            return;
        }
        match message {
            ClientMessage::AckConnection {
                queue_config,
                queue_memory,
            } => self.on_ack_connection(&queue_config, &queue_memory, ctx),
            ClientMessage::StartListening => self.on_start_listening(ctx.logic),
            ClientMessage::StopListening => self.on_stop_listening(ctx.logic),
            ClientMessage::Shutdown => self.on_shutdown(ctx.logic),
        }
    }

    /// Bind the client's queue memory and register with the logic layer
    pub fn on_ack_connection(
        &mut self,
        queue_config: &QueueMemoryConfig,
        queue_memory: &ExchangeHandle,
        ctx: &mut ReceiverContext<'_>,
    ) {
        match self.state {
            ReceiverState::Connecting if self.connect_called => {
                match self.bind(queue_config, queue_memory, ctx) {
                    Ok(handle) => {
                        self.logic_handle = Some(handle);
                        self.state = ReceiverState::Connected;
                        debug!(queue = self.queue_index, receiver = handle.id(), "receiver connected");
                    }
                    Err(e) => {
                        warn!(queue = self.queue_index, error = %e, "rejecting connection ack");
                        self.enter_corrupted(e.code(), Some(&mut *ctx.logic));
                    }
                }
            }
            ReceiverState::Connecting | ReceiverState::Connected => {
                self.violation("unexpected connection ack", ctx.logic)
            }
            _ => {}
        }
    }

    /// Start notifications; a second start is a violation
    pub fn on_start_listening(&mut self, logic: &mut ServerLogic) {
        match self.state {
            ReceiverState::Connected if !self.listening => self.listening = true,
            ReceiverState::Connected => self.violation("start listening twice", logic),
            ReceiverState::Connecting => self.violation("start listening before connection", logic),
            _ => {}
        }
    }

    /// Stop notifications; stopping while not listening is a violation
    pub fn on_stop_listening(&mut self, logic: &mut ServerLogic) {
        match self.state {
            ReceiverState::Connected if self.listening => self.listening = false,
            ReceiverState::Connected => self.violation("stop listening while not listening", logic),
            ReceiverState::Connecting => self.violation("stop listening before connection", logic),
            _ => {}
        }
    }

    /// Client is done; release its slots
    pub fn on_shutdown(&mut self, logic: &mut ServerLogic) {
        if self.state.accepts_messages() {
            debug!(queue = self.queue_index, "receiver shut down");
            self.enter_disconnected(logic);
        }
    }

    /// Peer lifecycle error reported by the side channel
    pub fn on_error(&mut self, code: ErrorCode, logic: &mut ServerLogic) {
        if self.state.accepts_messages() {
            warn!(queue = self.queue_index, %code, "side channel error");
            self.enter_corrupted(code, Some(logic));
        }
    }

    /// End the connection from the server side
    pub fn terminate(&mut self, logic: &mut ServerLogic) -> Result<()> {
        if self.state == ReceiverState::Disconnected {
            return Err(Error::AlreadyDisconnected);
        }
        if self.logic_handle.is_some() {
            self.send_termination();
        }
        debug!(queue = self.queue_index, state = %self.state, "receiver terminated");
        self.enter_disconnected(logic);
        Ok(())
    }

    /// Server wide shutdown; notifies the peer if possible
    pub fn handle_server_shutdown(&mut self, logic: &mut ServerLogic) {
        if self.state == ReceiverState::Disconnected {
            return;
        }
        if self.connect_called {
            self.send_termination();
        }
        self.enter_disconnected(logic);
    }

    /// Move to `Corrupted` if the logic layer blamed this receiver
    pub fn check_and_handle_logic_corruption(&mut self, logic: &mut ServerLogic) -> bool {
        let blamed = self
            .logic_handle
            .is_some_and(|handle| logic.is_receiver_corrupted(handle));
        if blamed && self.state.accepts_messages() {
            warn!(queue = self.queue_index, "receiver corrupted the slot protocol");
            self.enter_corrupted(ErrorCode::ProtocolError, Some(logic));
            return true;
        }
        false
    }

    /// Notify a listening receiver about a new slot; `Ok(false)` if nothing was sent
    pub fn notify_new_slot_sent(&mut self, dropped: &DroppedInformation) -> Result<bool> {
        if self.state != ReceiverState::Connected || !self.listening {
            return Ok(false);
        }
        if dropped.is_dropped_for(self.class) {
            return Ok(false);
        }
        self.channel.send(ServerMessage::Notification)?;
        Ok(true)
    }

    /// False once disconnected and no side channel callback can run anymore; stays false
    pub fn is_in_use(&self) -> bool {
        if !self.in_use.get() {
            return false;
        }
        let in_use = self.state != ReceiverState::Disconnected || self.channel.is_in_use();
        self.in_use.set(in_use);
        in_use
    }

    fn bind(
        &self,
        queue_config: &QueueMemoryConfig,
        queue_memory: &ExchangeHandle,
        ctx: &mut ReceiverContext<'_>,
    ) -> Result<ReceiverHandle> {
        let client_memory = ctx.manager.map_client_queue_memory(queue_memory)?;
        let (producer, consumer) = ctx.manager.initialize_queue_ends(
            self.queue_index,
            ctx.queue_memory,
            queue_config,
            &client_memory,
        )?;
        ctx.logic
            .add_receiver(self.class, Box::new(producer), Box::new(consumer))
    }

    fn violation(&mut self, what: &str, logic: &mut ServerLogic) {
        warn!(queue = self.queue_index, state = %self.state, "protocol violation: {what}");
        self.enter_corrupted(ErrorCode::ProtocolError, Some(logic));
    }

    fn enter_corrupted(&mut self, code: ErrorCode, logic: Option<&mut ServerLogic>) {
        if let (Some(handle), Some(logic)) = (self.logic_handle, logic) {
            logic.mark_corrupted(handle);
        }
        self.state = ReceiverState::Corrupted;
        self.error = Some(code);
        self.listening = false;
    }

    fn enter_disconnected(&mut self, logic: &mut ServerLogic) {
        if let Some(handle) = self.logic_handle.take() {
            if let Err(e) = logic.remove_receiver(handle) {
                warn!(receiver = handle.id(), error = %e, "receiver missing from logic");
            }
        }
        self.state = ReceiverState::Disconnected;
        self.listening = false;
    }

    fn send_termination(&mut self) {
        if self.channel.is_peer_crashed() {
            return;
        }
        if let Err(e) = self.channel.send(ServerMessage::Termination) {
            warn!(queue = self.queue_index, error = %e, "failed to send termination");
        }
    }
}

/// Build the request a receiver on queue `queue_index` is connected with
pub fn connection_request(
    manager: &ServerMemoryManager,
    queue_index: usize,
    slot_memory: &ExchangeHandle,
    queue_memory: &ExchangeHandle,
) -> Result<ConnectionRequest> {
    let queue_config = manager.queue_config(queue_index).ok_or(Error::TooManyReceivers)?;
    Ok(ConnectionRequest {
        memory_technology: manager.technology(),
        slot_config: manager.slot_config().clone(),
        slot_memory: Arc::clone(slot_memory),
        queue_config,
        queue_memory: Arc::clone(queue_memory),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use crate::config::ServerConfig;
    use crate::manager::ClientMemoryManager;
    use crate::memory::{LocalMemoryProvider, MemoryObject, MemoryProvider};
    use crate::queue::{ReadingQueueEnd, SlotIndex, SpscConsumer, SpscProducer, WritingQueueEnd};
    use crate::storage::MemoryTechnology;

    #[derive(Clone, Default)]
    struct MockChannel {
        sent: Arc<Mutex<Vec<ServerMessage>>>,
        crashed: Arc<AtomicBool>,
        fail_send: Arc<AtomicBool>,
        callback_running: Arc<AtomicBool>,
    }

    impl MockChannel {
        fn sent_kinds(&self) -> Vec<&'static str> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|m| match m {
                    ServerMessage::ConnectionRequest(_) => "request",
                    ServerMessage::Notification => "notification",
                    ServerMessage::Termination => "termination",
                })
                .collect()
        }
    }

    impl SideChannel for MockChannel {
        fn send(&mut self, message: ServerMessage) -> Result<()> {
            if self.fail_send.load(Ordering::SeqCst) {
                return Err(Error::SendFailed("mock".to_string()));
            }
            self.sent.lock().unwrap().push(message);
            Ok(())
        }

        fn is_peer_crashed(&self) -> bool {
            self.crashed.load(Ordering::SeqCst)
        }

        fn is_in_use(&self) -> bool {
            self.callback_running.load(Ordering::SeqCst)
        }
    }

    struct Fixture {
        manager: ServerMemoryManager,
        logic: ServerLogic,
        slot_memory: MemoryObject,
        queue_memory: MemoryObject,
        provider: Arc<dyn MemoryProvider>,
    }

    /// Client side of a connection, kept alive for the duration of a test
    struct Client {
        memory: MemoryObject,
        queue_config: QueueMemoryConfig,
        ends: Option<(SpscProducer<SlotIndex>, SpscConsumer<SlotIndex>)>,
    }

    impl Fixture {
        fn new() -> Self {
            let config = ServerConfig {
                number_of_slots: 4,
                slot_content_size: 64,
                max_number_receivers: 2,
                ..ServerConfig::default()
            };
            let provider: Arc<dyn MemoryProvider> = Arc::new(LocalMemoryProvider::new());
            let manager = ServerMemoryManager::new(&config, provider.clone()).unwrap();
            let slot_memory = manager.allocate_slot_memory().unwrap();
            let queue_memory = manager.allocate_queue_memory().unwrap();
            Self {
                logic: ServerLogic::new(4, &config.receiver_classes),
                manager,
                slot_memory,
                queue_memory,
                provider,
            }
        }

        fn receiver(&self, channel: &MockChannel) -> Receiver {
            Receiver::new(0, ReceiverClassHandle(0), Box::new(channel.clone()))
        }

        fn request(&self) -> ConnectionRequest {
            connection_request(
                &self.manager,
                0,
                &self.slot_memory.exchange_handle(),
                &self.queue_memory.exchange_handle(),
            )
            .unwrap()
        }

        fn client(&self, request: &ConnectionRequest) -> Client {
            let manager = ClientMemoryManager::new(
                MemoryTechnology::SharedMemory,
                request.number_of_slots() as u32,
                self.provider.clone(),
            )
            .unwrap();
            let memory = manager.allocate_queue_memory().unwrap();
            let server_view = manager
                .map_server_queue_memory(&request.queue_memory, &request.queue_config)
                .unwrap();
            let ends = manager
                .initialize_queue_ends(&memory.read_writable(), &request.queue_config, &server_view)
                .unwrap();
            Client {
                memory,
                queue_config: manager.queue_config(),
                ends: Some(ends),
            }
        }

        fn deliver(&mut self, receiver: &mut Receiver, message: ClientMessage) {
            let queue_memory = self.queue_memory.read_writable();
            let mut ctx = ReceiverContext {
                manager: &self.manager,
                queue_memory: &queue_memory,
                logic: &mut self.logic,
            };
            receiver.handle_message(message, &mut ctx);
        }

        fn connected(&mut self, channel: &MockChannel) -> (Receiver, Client) {
            let mut receiver = self.receiver(channel);
            let request = self.request();
            let client = self.client(&request);
            receiver.connect(request).unwrap();
            self.deliver(&mut receiver, ack(&client));
            assert_eq!(receiver.state(), ReceiverState::Connected);
            (receiver, client)
        }
    }

    fn ack(client: &Client) -> ClientMessage {
        ClientMessage::AckConnection {
            queue_config: client.queue_config,
            queue_memory: client.memory.exchange_handle(),
        }
    }

    #[test]
    fn test_full_lifecycle() {
        let mut fx = Fixture::new();
        let channel = MockChannel::default();
        let (mut receiver, mut client) = fx.connected(&channel);
        assert!(receiver.logic_handle().is_some());

        fx.deliver(&mut receiver, ClientMessage::StartListening);
        assert!(receiver.is_listening());

        let slot = fx.logic.acquire_slot().unwrap();
        let dropped = fx.logic.send_slot(slot).unwrap();
        assert!(receiver.notify_new_slot_sent(&dropped).unwrap());
        let (_, from_server) = client.ends.as_mut().unwrap();
        assert_eq!(from_server.pop().unwrap(), Some(slot));

        fx.deliver(&mut receiver, ClientMessage::StopListening);
        assert!(!receiver.notify_new_slot_sent(&dropped).unwrap());

        fx.deliver(&mut receiver, ClientMessage::Shutdown);
        assert_eq!(receiver.state(), ReceiverState::Disconnected);
        assert!(!receiver.is_in_use());
        assert_eq!(channel.sent_kinds(), vec!["request", "notification"]);
        // the slot the receiver held is released with it
        let free = std::iter::from_fn(|| fx.logic.acquire_slot()).count();
        assert_eq!(free, 4);
    }

    #[test]
    fn test_start_listening_before_ack_corrupts() {
        let mut fx = Fixture::new();
        let channel = MockChannel::default();
        let mut receiver = fx.receiver(&channel);
        receiver.connect(fx.request()).unwrap();
        fx.deliver(&mut receiver, ClientMessage::StartListening);
        assert_eq!(receiver.state(), ReceiverState::Corrupted);
        assert_eq!(receiver.error_code(), Some(ErrorCode::ProtocolError));
    }

    #[test]
    fn test_double_start_listening_corrupts() {
        let mut fx = Fixture::new();
        let channel = MockChannel::default();
        let (mut receiver, _client) = fx.connected(&channel);
        fx.deliver(&mut receiver, ClientMessage::StartListening);
        fx.deliver(&mut receiver, ClientMessage::StartListening);
        assert_eq!(receiver.state(), ReceiverState::Corrupted);
        let handle = receiver.logic_handle().unwrap();
        assert!(fx.logic.is_receiver_corrupted(handle));
    }

    #[test]
    fn test_stop_without_start_corrupts() {
        let mut fx = Fixture::new();
        let channel = MockChannel::default();
        let (mut receiver, _client) = fx.connected(&channel);
        fx.deliver(&mut receiver, ClientMessage::StopListening);
        assert_eq!(receiver.state(), ReceiverState::Corrupted);
    }

    #[test]
    fn test_second_ack_corrupts() {
        let mut fx = Fixture::new();
        let channel = MockChannel::default();
        let (mut receiver, client) = fx.connected(&channel);
        fx.deliver(&mut receiver, ack(&client));
        assert_eq!(receiver.state(), ReceiverState::Corrupted);
    }

    #[test]
    fn test_ack_before_connect_corrupts() {
        let mut fx = Fixture::new();
        let channel = MockChannel::default();
        let mut receiver = fx.receiver(&channel);
        let client = fx.client(&fx.request());
        fx.deliver(&mut receiver, ack(&client));
        assert_eq!(receiver.state(), ReceiverState::Corrupted);
    }

    #[test]
    fn test_hostile_ack_is_rejected() {
        let mut fx = Fixture::new();
        let channel = MockChannel::default();
        let mut receiver = fx.receiver(&channel);
        receiver.connect(fx.request()).unwrap();
        let client = fx.client(&fx.request());
        let hostile = QueueMemoryConfig::new(
            client.queue_config.head(),
            client.queue_config.buffer(),
            client.queue_config.buffer(),
        );
        fx.deliver(
            &mut receiver,
            ClientMessage::AckConnection {
                queue_config: hostile,
                queue_memory: client.memory.exchange_handle(),
            },
        );
        assert_eq!(receiver.state(), ReceiverState::Corrupted);
        assert!(receiver.logic_handle().is_none());
    }

    #[test]
    fn test_disconnected_ignores_everything() {
        let mut fx = Fixture::new();
        let channel = MockChannel::default();
        let (mut receiver, client) = fx.connected(&channel);
        receiver.terminate(&mut fx.logic).unwrap();
        assert_eq!(receiver.state(), ReceiverState::Disconnected);

        fx.deliver(&mut receiver, ClientMessage::StartListening);
        fx.deliver(&mut receiver, ack(&client));
        receiver.on_error(ErrorCode::PeerCrashed, &mut fx.logic);
        receiver.handle_server_shutdown(&mut fx.logic);
        assert!(!receiver.check_and_handle_logic_corruption(&mut fx.logic));
        assert_eq!(receiver.state(), ReceiverState::Disconnected);
        assert!(matches!(
            receiver.terminate(&mut fx.logic),
            Err(Error::AlreadyDisconnected)
        ));
        assert_eq!(channel.sent_kinds(), vec!["request", "termination"]);
    }

    #[test]
    fn test_terminate_before_ack_sends_nothing() {
        let mut fx = Fixture::new();
        let channel = MockChannel::default();
        let mut receiver = fx.receiver(&channel);
        receiver.connect(fx.request()).unwrap();
        receiver.terminate(&mut fx.logic).unwrap();
        assert_eq!(channel.sent_kinds(), vec!["request"]);
    }

    #[test]
    fn test_corrupted_ignores_messages_but_terminates() {
        let mut fx = Fixture::new();
        let channel = MockChannel::default();
        let (mut receiver, _client) = fx.connected(&channel);
        receiver.on_error(ErrorCode::PeerDisconnected, &mut fx.logic);
        assert_eq!(receiver.state(), ReceiverState::Corrupted);
        assert_eq!(receiver.error_code(), Some(ErrorCode::PeerDisconnected));

        fx.deliver(&mut receiver, ClientMessage::Shutdown);
        assert_eq!(receiver.state(), ReceiverState::Corrupted);
        receiver.on_error(ErrorCode::PeerCrashed, &mut fx.logic);
        assert_eq!(receiver.error_code(), Some(ErrorCode::PeerDisconnected));

        receiver.handle_server_shutdown(&mut fx.logic);
        assert_eq!(receiver.state(), ReceiverState::Disconnected);
    }

    #[test]
    fn test_connect_fails_for_crashed_peer() {
        let fx = Fixture::new();
        let channel = MockChannel::default();
        channel.crashed.store(true, Ordering::SeqCst);
        let mut receiver = fx.receiver(&channel);
        assert!(matches!(receiver.connect(fx.request()), Err(Error::PeerCrashed)));
        assert_eq!(receiver.state(), ReceiverState::Corrupted);
        assert!(receiver.connect(fx.request()).is_err());
    }

    #[test]
    fn test_connect_fails_when_send_fails() {
        let fx = Fixture::new();
        let channel = MockChannel::default();
        channel.fail_send.store(true, Ordering::SeqCst);
        let mut receiver = fx.receiver(&channel);
        assert!(matches!(receiver.connect(fx.request()), Err(Error::SendFailed(_))));
        assert_eq!(receiver.state(), ReceiverState::Corrupted);
    }

    #[test]
    fn test_failed_notification_keeps_state() {
        let mut fx = Fixture::new();
        let channel = MockChannel::default();
        let (mut receiver, _client) = fx.connected(&channel);
        fx.deliver(&mut receiver, ClientMessage::StartListening);
        channel.fail_send.store(true, Ordering::SeqCst);
        assert!(receiver
            .notify_new_slot_sent(&DroppedInformation::default())
            .is_err());
        assert_eq!(receiver.state(), ReceiverState::Connected);
    }

    #[test]
    fn test_logic_corruption_is_picked_up() {
        let mut fx = Fixture::new();
        let channel = MockChannel::default();
        let (mut receiver, mut client) = fx.connected(&channel);
        assert!(!receiver.check_and_handle_logic_corruption(&mut fx.logic));

        let (to_server, _) = client.ends.as_mut().unwrap();
        assert!(to_server.push(3).unwrap());
        assert_eq!(fx.logic.reclaim().len(), 1);

        assert!(receiver.check_and_handle_logic_corruption(&mut fx.logic));
        assert_eq!(receiver.state(), ReceiverState::Corrupted);
    }

    #[test]
    fn test_in_use_until_callbacks_finish() {
        let mut fx = Fixture::new();
        let channel = MockChannel::default();
        let mut receiver = fx.receiver(&channel);
        channel.callback_running.store(true, Ordering::SeqCst);
        receiver.terminate(&mut fx.logic).unwrap();
        assert!(receiver.is_in_use());

        channel.callback_running.store(false, Ordering::SeqCst);
        assert!(!receiver.is_in_use());
        channel.callback_running.store(true, Ordering::SeqCst);
        assert!(!receiver.is_in_use());
    }
}
