//! Peer connections
//!
//! A [`Connection`] wraps one transport socket. It translates incoming
//! traffic into [`ConnectionEvent`]s for the node, keeps a ping/pong
//! heartbeat to estimate latency, and tracks RPC calls awaiting a response.
//!
//! Lifecycle: `Connecting -> Open -> Closed`, or `Open -> Errored -> Closed`
//! on transport faults. A closed connection is never reopened.

use crate::network::error::{ConnectionError, NetworkError};
use crate::network::message::{LegacyEvent, Message};
use crate::network::peer_info::{ConnectionKind, PeerId, PeerInfo};
use crate::network::scheduler::ScheduledTask;
use crate::network::transport::{ConnectionId, Socket};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Constants
// =============================================================================

/// Default interval between pings
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Default time a ping may stay unanswered
pub const DEFAULT_PONG_TIMEOUT: Duration = Duration::from_secs(30);

/// Reputation a connection starts with
pub const DEFAULT_REPUTATION: i32 = 100;

pub const INTENTIONAL_DISCONNECT_CODE: u16 = 1000;
pub const SHUTDOWN_CODE: u16 = 1001;
pub const TRANSPORT_ERROR_CODE: u16 = 1006;
pub const UNRESPONSIVE_CODE: u16 = 4008;
pub const INCOMPATIBLE_NETWORK_CODE: u16 = 4102;
pub const SELF_CONNECTION_CODE: u16 = 4101;
pub const BANNED_CODE: u16 = 4403;
pub const DUPLICATE_CONNECTION_CODE: u16 = 4404;
pub const CONNECTION_LIMIT_CODE: u16 = 4405;

// =============================================================================
// Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Errored,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn kind(self) -> ConnectionKind {
        match self {
            Direction::Inbound => ConnectionKind::Inbound,
            Direction::Outbound => ConnectionKind::Outbound,
        }
    }

    fn legacy_handler(self) -> Arc<dyn LegacyHandler> {
        match self {
            Direction::Inbound => Arc::new(InboundLegacy),
            Direction::Outbound => Arc::new(OutboundLegacy),
        }
    }
}

/// Timing parameters of a connection
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub heartbeat_interval: Duration,
    pub pong_timeout: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            pong_timeout: DEFAULT_PONG_TIMEOUT,
        }
    }
}

/// Something a connection reports to the node
#[derive(Debug)]
pub struct ConnectionEvent {
    pub peer_id: PeerId,
    pub connection_id: ConnectionId,
    pub kind: ConnectionEventKind,
}

#[derive(Debug)]
pub enum ConnectionEventKind {
    Message { event: String, data: Value },
    Request(IncomingRequest),
    Legacy(LegacyEvent),
    Error(ConnectionError),
    Misbehaved(String),
    /// The remote announced it is closing
    RemoteClosed { code: u16, reason: String },
    /// Emitted once by [`Connection::disconnect`]
    Closed { peer_info: PeerInfo, code: u16, reason: String },
}

/// An RPC call received from a peer, answered at most once
#[derive(Debug)]
pub struct IncomingRequest {
    pub peer_id: PeerId,
    pub procedure: String,
    pub data: Value,
    id: u64,
    sender: mpsc::Sender<Message>,
}

impl IncomingRequest {
    pub fn respond(self, result: Result<Value, String>) -> Result<(), NetworkError> {
        self.sender
            .try_send(Message::RpcResponse { id: self.id, result })
            .map_err(|_| NetworkError::Connection(ConnectionError::Closed))
    }
}

// =============================================================================
// Legacy compatibility
// =============================================================================

/// Direction-specific handling of the older protocol's single-purpose events
pub trait LegacyHandler: Send + Sync + fmt::Debug {
    /// Translate an announcement received on this connection
    fn on_receive(&self, event: LegacyEvent) -> ConnectionEventKind;

    /// Shape an outgoing event for a peer speaking the older protocol
    fn on_send(&self, event: String, data: Value) -> Message {
        match LegacyEvent::from_event(&event, data) {
            Ok(legacy) => Message::Legacy(legacy),
            Err(data) => Message::Event { event, data },
        }
    }
}

/// Inbound peers deliver legacy announcements on their own channel
#[derive(Debug, Clone, Copy, Default)]
pub struct InboundLegacy;

impl LegacyHandler for InboundLegacy {
    fn on_receive(&self, event: LegacyEvent) -> ConnectionEventKind {
        ConnectionEventKind::Legacy(event)
    }
}

/// Outbound peers fold legacy announcements into generic messages
#[derive(Debug, Clone, Copy, Default)]
pub struct OutboundLegacy;

impl LegacyHandler for OutboundLegacy {
    fn on_receive(&self, event: LegacyEvent) -> ConnectionEventKind {
        ConnectionEventKind::Message {
            event: event.event_name().to_string(),
            data: event.into_payload(),
        }
    }
}

// =============================================================================
// Shared state
// =============================================================================

type PendingCalls = HashMap<u64, oneshot::Sender<Result<Value, String>>>;

/// State touched by the socket pump and the heartbeat as well as the owner
#[derive(Debug)]
struct Shared {
    state: ConnectionState,
    /// Outstanding ping nonce and send time
    ping: Option<(u64, Instant)>,
    latency: Option<Duration>,
    pong_timeout_reported: bool,
    pending: PendingCalls,
    next_request_id: u64,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An RPC call sent to a peer
#[derive(Debug)]
pub struct RpcCall {
    id: u64,
    receiver: oneshot::Receiver<Result<Value, String>>,
    shared: Weak<Mutex<Shared>>,
}

impl RpcCall {
    pub async fn wait(self, timeout: Duration) -> Result<Value, NetworkError> {
        let RpcCall { id, receiver, shared } = self;
        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(reason))) => Err(NetworkError::Rpc(reason)),
            Ok(Err(_)) => Err(NetworkError::Connection(ConnectionError::Closed)),
            Err(_) => {
                if let Some(shared) = shared.upgrade() {
                    lock(&shared).pending.remove(&id);
                }
                Err(NetworkError::Rpc(format!("request {} timed out", id)))
            }
        }
    }
}

// =============================================================================
// Connection
// =============================================================================

/// One live session with a remote peer
#[derive(Debug)]
pub struct Connection {
    peer_info: PeerInfo,
    direction: Direction,
    id: ConnectionId,
    settings: ConnectionSettings,
    legacy: Arc<dyn LegacyHandler>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    shared: Arc<Mutex<Shared>>,
    sender: Option<mpsc::Sender<Message>>,
    session: Option<CancellationToken>,
    heartbeat: Option<ScheduledTask>,
    reputation: i32,
    opened_at: Option<Instant>,
}

impl Connection {
    pub fn new(
        peer_info: PeerInfo,
        direction: Direction,
        settings: ConnectionSettings,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        Self {
            peer_info: peer_info.with_kind(direction.kind()),
            direction,
            id: ConnectionId::new(),
            settings,
            legacy: direction.legacy_handler(),
            events,
            shared: Arc::new(Mutex::new(Shared {
                state: ConnectionState::Connecting,
                ping: None,
                latency: None,
                pong_timeout_reported: false,
                pending: HashMap::new(),
                next_request_id: 1,
            })),
            sender: None,
            session: None,
            heartbeat: None,
            reputation: DEFAULT_REPUTATION,
            opened_at: None,
        }
    }

    /// Replace the default legacy handler for this direction
    pub fn with_legacy_handler(mut self, handler: Arc<dyn LegacyHandler>) -> Self {
        self.legacy = handler;
        self
    }

    pub fn peer_info(&self) -> &PeerInfo {
        &self.peer_info
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_info.peer_id()
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Transport id of the bound socket; empty until a socket is bound
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.shared).state
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Most recent ping round-trip time
    pub fn latency(&self) -> Option<Duration> {
        lock(&self.shared).latency
    }

    pub fn reputation(&self) -> i32 {
        self.reputation
    }

    /// Time since the connection opened
    pub fn uptime(&self) -> Option<Duration> {
        self.opened_at.map(|t| t.elapsed())
    }

    pub fn update_peer_info(&mut self, peer_info: PeerInfo) {
        self.peer_info = peer_info.with_kind(self.direction.kind());
    }

    /// Lower the reputation and return what is left
    pub fn apply_penalty(&mut self, penalty: u32) -> i32 {
        self.reputation = self.reputation.saturating_sub(penalty.min(i32::MAX as u32) as i32);
        self.reputation
    }

    /// Bind the socket of a completed handshake and open the connection
    pub fn bind(&mut self, socket: Socket) -> Result<(), NetworkError> {
        if self.state() != ConnectionState::Connecting {
            return Err(NetworkError::validation(format!(
                "connection to {} is not connecting",
                self.peer_id()
            )));
        }
        self.attach(socket);
        Ok(())
    }

    /// Move an inbound connection onto a replacement socket, keeping its identity
    pub fn set_socket(&mut self, socket: Socket) -> Result<(), NetworkError> {
        if self.direction != Direction::Inbound {
            return Err(NetworkError::validation("only inbound connections can be rebound"));
        }
        if self.state() == ConnectionState::Closed {
            return Err(NetworkError::validation(format!(
                "connection to {} is closed",
                self.peer_id()
            )));
        }
        self.detach();
        self.attach(socket);
        log::debug!("Rebound inbound connection {} to socket {}", self.peer_id(), self.id);
        Ok(())
    }

    fn attach(&mut self, socket: Socket) {
        let Socket {
            id, sender, receiver, ..
        } = socket;
        let token = CancellationToken::new();

        {
            let mut shared = lock(&self.shared);
            shared.state = ConnectionState::Open;
            shared.ping = None;
            shared.pong_timeout_reported = false;
        }

        let pump = Pump {
            peer_id: self.peer_id(),
            connection_id: id.clone(),
            shared: Arc::clone(&self.shared),
            events: self.events.clone(),
            legacy: Arc::clone(&self.legacy),
            sender: sender.clone(),
        };
        tokio::spawn(pump.run(receiver, token.clone()));

        self.heartbeat = Some(start_heartbeat(
            self.settings,
            self.peer_id(),
            id.clone(),
            Arc::clone(&self.shared),
            sender.clone(),
            self.events.clone(),
            token.child_token(),
        ));

        self.id = id;
        self.sender = Some(sender);
        self.session = Some(token);
        self.opened_at.get_or_insert_with(Instant::now);
    }

    /// Unbind the current socket: stop the pump and heartbeat, fail pending calls
    fn detach(&mut self) {
        if let Some(token) = self.session.take() {
            token.cancel();
        }
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.cancel();
        }
        self.sender = None;
        lock(&self.shared).pending.clear();
    }

    /// Fire-and-forget event to the peer
    pub fn send(&self, event: &str, data: Value) -> Result<(), NetworkError> {
        let message = if self.peer_info.is_legacy() {
            self.legacy.on_send(event.to_string(), data)
        } else {
            Message::Event {
                event: event.to_string(),
                data,
            }
        };
        self.send_message(message)
    }

    fn send_message(&self, message: Message) -> Result<(), NetworkError> {
        if !self.is_open() {
            return Err(NetworkError::Connection(ConnectionError::Closed));
        }
        let sender = self
            .sender
            .as_ref()
            .ok_or(NetworkError::Connection(ConnectionError::Closed))?;
        sender.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                NetworkError::Rpc(format!("send buffer to {} is full", self.peer_id()))
            }
            mpsc::error::TrySendError::Closed(_) => NetworkError::Connection(ConnectionError::Reset),
        })
    }

    /// Send an RPC request; the response is awaited through the returned call
    pub fn request(&self, procedure: &str, data: Value) -> Result<RpcCall, NetworkError> {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut shared = lock(&self.shared);
            let id = shared.next_request_id;
            shared.next_request_id += 1;
            shared.pending.insert(id, tx);
            id
        };

        let message = Message::RpcRequest {
            id,
            procedure: procedure.to_string(),
            data,
        };
        if let Err(e) = self.send_message(message) {
            lock(&self.shared).pending.remove(&id);
            return Err(e);
        }

        Ok(RpcCall {
            id,
            receiver: rx,
            shared: Arc::downgrade(&self.shared),
        })
    }

    /// Close the connection and notify the node; later calls do nothing
    pub fn disconnect(&mut self, code: u16, reason: &str) {
        {
            let mut shared = lock(&self.shared);
            if shared.state == ConnectionState::Closed {
                return;
            }
            shared.state = ConnectionState::Closed;
        }

        if let Some(sender) = &self.sender {
            let _ = sender.try_send(Message::Close {
                code,
                reason: reason.to_string(),
            });
        }
        self.detach();

        log::info!("Disconnected {} ({}): {}", self.peer_id(), code, reason);
        let _ = self.events.send(ConnectionEvent {
            peer_id: self.peer_id(),
            connection_id: self.id.clone(),
            kind: ConnectionEventKind::Closed {
                peer_info: self.peer_info.clone(),
                code,
                reason: reason.to_string(),
            },
        });
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.detach();
    }
}

// =============================================================================
// Socket pump
// =============================================================================

/// Reads one socket and turns its traffic into connection events
struct Pump {
    peer_id: PeerId,
    connection_id: ConnectionId,
    shared: Arc<Mutex<Shared>>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    legacy: Arc<dyn LegacyHandler>,
    sender: mpsc::Sender<Message>,
}

impl Pump {
    async fn run(self, mut receiver: mpsc::Receiver<Message>, token: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                message = receiver.recv() => match message {
                    Some(message) => {
                        if token.is_cancelled() {
                            break;
                        }
                        if !self.dispatch(message) {
                            break;
                        }
                    }
                    None => {
                        if !token.is_cancelled() {
                            self.transport_closed();
                        }
                        break;
                    }
                }
            }
        }
    }

    /// Handle one message; returns false when the session should stop reading
    fn dispatch(&self, message: Message) -> bool {
        match message {
            Message::Ping(nonce) => {
                let _ = self.sender.try_send(Message::Pong(nonce));
            }
            Message::Pong(nonce) => {
                let mut shared = lock(&self.shared);
                if let Some((expected, sent_at)) = shared.ping {
                    if expected == nonce {
                        shared.latency = Some(sent_at.elapsed());
                        shared.ping = None;
                    }
                }
            }
            Message::RpcResponse { id, result } => {
                let pending = lock(&self.shared).pending.remove(&id);
                match pending {
                    Some(tx) => {
                        let _ = tx.send(result);
                    }
                    None => log::debug!("Dropping response {} from {} with no caller", id, self.peer_id),
                }
            }
            Message::RpcRequest { id, procedure, data } => {
                self.emit(ConnectionEventKind::Request(IncomingRequest {
                    peer_id: self.peer_id,
                    procedure,
                    data,
                    id,
                    sender: self.sender.clone(),
                }));
            }
            Message::Event { event, data } => {
                self.emit(ConnectionEventKind::Message { event, data });
            }
            Message::Legacy(event) => {
                self.emit(self.legacy.on_receive(event));
            }
            Message::Close { code, reason } => {
                self.emit(ConnectionEventKind::RemoteClosed { code, reason });
                return false;
            }
            Message::Handshake(_) | Message::HandshakeAck(_) => {
                self.emit(ConnectionEventKind::Misbehaved(
                    "handshake sent on an open connection".to_string(),
                ));
            }
        }
        true
    }

    fn transport_closed(&self) {
        {
            let mut shared = lock(&self.shared);
            if shared.state != ConnectionState::Open {
                return;
            }
            shared.state = ConnectionState::Errored;
        }
        self.emit(ConnectionEventKind::Error(ConnectionError::Reset));
    }

    fn emit(&self, kind: ConnectionEventKind) {
        let _ = self.events.send(ConnectionEvent {
            peer_id: self.peer_id,
            connection_id: self.connection_id.clone(),
            kind,
        });
    }
}

// =============================================================================
// Heartbeat
// =============================================================================

fn start_heartbeat(
    settings: ConnectionSettings,
    peer_id: PeerId,
    connection_id: ConnectionId,
    shared: Arc<Mutex<Shared>>,
    sender: mpsc::Sender<Message>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    token: CancellationToken,
) -> ScheduledTask {
    let pong_timeout = settings.pong_timeout;
    let deadline_token = token.clone();
    ScheduledTask::every(settings.heartbeat_interval, token, move || {
        let mut state = lock(&shared);
        // One ping in flight at a time; its deadline task reports a missing pong
        if state.state != ConnectionState::Open || state.ping.is_some() {
            return;
        }

        let nonce: u64 = rand::random();
        if sender.try_send(Message::Ping(nonce)).is_err() {
            return;
        }
        state.ping = Some((nonce, Instant::now()));
        drop(state);

        let deadline = PongDeadline {
            peer_id,
            connection_id: connection_id.clone(),
            shared: Arc::clone(&shared),
            events: events.clone(),
            nonce,
        };
        let token = deadline_token.child_token();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(pong_timeout) => deadline.expire(),
            }
        });
    })
}

/// Report a ping that is still unanswered when its window closes
struct PongDeadline {
    peer_id: PeerId,
    connection_id: ConnectionId,
    shared: Arc<Mutex<Shared>>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    nonce: u64,
}

impl PongDeadline {
    fn expire(self) {
        {
            let mut state = lock(&self.shared);
            let outstanding = matches!(state.ping, Some((nonce, _)) if nonce == self.nonce);
            if !outstanding || state.state != ConnectionState::Open || state.pong_timeout_reported {
                return;
            }
            state.pong_timeout_reported = true;
            state.state = ConnectionState::Errored;
        }
        log::warn!("Peer {} did not answer ping", self.peer_id);
        let _ = self.events.send(ConnectionEvent {
            peer_id: self.peer_id,
            connection_id: self.connection_id,
            kind: ConnectionEventKind::Error(ConnectionError::PongTimeout),
        });
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::net::IpAddr;

    struct Harness {
        connection: Connection,
        remote: Socket,
        events: mpsc::UnboundedReceiver<ConnectionEvent>,
    }

    fn remote_info(protocol: &str) -> PeerInfo {
        PeerInfo {
            protocol_version: protocol.to_string(),
            ..PeerInfo::new(IpAddr::from([10, 0, 0, 2]), 6000).with_nonce("remote")
        }
    }

    fn open(direction: Direction, protocol: &str) -> Harness {
        let settings = ConnectionSettings {
            heartbeat_interval: Duration::from_secs(10),
            pong_timeout: Duration::from_secs(5),
        };
        let (tx, events) = mpsc::unbounded_channel();
        let (local, remote) = Socket::pair("t", (IpAddr::from([10, 0, 0, 1]), 5000), (IpAddr::from([10, 0, 0, 2]), 6000));
        let mut connection = Connection::new(remote_info(protocol), direction, settings, tx);
        assert_eq!(connection.state(), ConnectionState::Connecting);
        connection.bind(local).unwrap();
        Harness {
            connection,
            remote,
            events,
        }
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_bind_opens_connection() {
        let h = open(Direction::Outbound, "1.1");
        assert!(h.connection.is_open());
        assert_eq!(h.connection.id(), "t-a");
        assert_eq!(h.connection.peer_info().connection_kind, ConnectionKind::Outbound);
        assert_eq!(h.connection.reputation(), DEFAULT_REPUTATION);
    }

    #[tokio::test]
    async fn test_generic_messages_are_forwarded() {
        let mut h = open(Direction::Outbound, "1.1");
        h.remote
            .sender
            .send(Message::Event {
                event: "chat".to_string(),
                data: json!("hi"),
            })
            .await
            .unwrap();

        let event = h.events.recv().await.unwrap();
        assert_eq!(event.connection_id, "t-a");
        match event.kind {
            ConnectionEventKind::Message { event, data } => {
                assert_eq!(event, "chat");
                assert_eq!(data, json!("hi"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_inbound_legacy_events_use_their_own_channel() {
        let mut h = open(Direction::Inbound, "1.0");
        h.remote
            .sender
            .send(Message::Legacy(LegacyEvent::PostBlock(json!({"height": 3}))))
            .await
            .unwrap();
        let event = h.events.recv().await.unwrap();
        assert!(matches!(event.kind, ConnectionEventKind::Legacy(LegacyEvent::PostBlock(_))));
    }

    #[tokio::test]
    async fn test_outbound_legacy_events_become_messages() {
        let mut h = open(Direction::Outbound, "1.0");
        h.remote
            .sender
            .send(Message::Legacy(LegacyEvent::PostTransactions(json!([1, 2]))))
            .await
            .unwrap();
        match h.events.recv().await.unwrap().kind {
            ConnectionEventKind::Message { event, data } => {
                assert_eq!(event, "postTransactions");
                assert_eq!(data, json!([1, 2]));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_uses_legacy_form_for_old_peers() {
        let mut h = open(Direction::Outbound, "1.0");
        h.connection.send("postSignatures", json!(["s"])).unwrap();
        h.connection.send("chat", json!(1)).unwrap();
        assert_eq!(
            h.remote.receiver.recv().await,
            Some(Message::Legacy(LegacyEvent::PostSignatures(json!(["s"]))))
        );
        assert_eq!(
            h.remote.receiver.recv().await,
            Some(Message::Event {
                event: "chat".to_string(),
                data: json!(1)
            })
        );
    }

    #[tokio::test]
    async fn test_request_resolves_with_response() {
        let mut h = open(Direction::Outbound, "1.1");
        let call = h.connection.request("status", json!(null)).unwrap();

        let id = match h.remote.receiver.recv().await.unwrap() {
            Message::RpcRequest { id, procedure, .. } => {
                assert_eq!(procedure, "status");
                id
            }
            other => panic!("unexpected message {:?}", other),
        };
        h.remote
            .sender
            .send(Message::RpcResponse {
                id,
                result: Ok(json!({"height": 9})),
            })
            .await
            .unwrap();

        let value = call.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(value, json!({"height": 9}));
    }

    #[tokio::test]
    async fn test_incoming_request_can_be_answered() {
        let mut h = open(Direction::Inbound, "1.1");
        h.remote
            .sender
            .send(Message::RpcRequest {
                id: 4,
                procedure: "blocks".to_string(),
                data: json!({}),
            })
            .await
            .unwrap();

        let request = match h.events.recv().await.unwrap().kind {
            ConnectionEventKind::Request(request) => request,
            other => panic!("unexpected event {:?}", other),
        };
        assert_eq!(request.procedure, "blocks");
        request.respond(Ok(json!([]))).unwrap();
        assert_eq!(
            h.remote.receiver.recv().await,
            Some(Message::RpcResponse { id: 4, result: Ok(json!([])) })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_request_times_out() {
        let h = open(Direction::Outbound, "1.1");
        let call = h.connection.request("slow", json!(null)).unwrap();
        let err = call.wait(Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, NetworkError::Rpc(_)));
        assert!(lock(&h.connection.shared).pending.is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent_and_notifies_once() {
        let mut h = open(Direction::Outbound, "1.1");
        h.connection.disconnect(INTENTIONAL_DISCONNECT_CODE, "bye");
        h.connection.disconnect(INTENTIONAL_DISCONNECT_CODE, "bye again");
        assert_eq!(h.connection.state(), ConnectionState::Closed);

        match h.events.recv().await.unwrap().kind {
            ConnectionEventKind::Closed { code, reason, peer_info } => {
                assert_eq!(code, INTENTIONAL_DISCONNECT_CODE);
                assert_eq!(reason, "bye");
                assert_eq!(peer_info.nonce.as_deref(), Some("remote"));
            }
            other => panic!("unexpected event {:?}", other),
        }
        settle().await;
        assert!(h.events.try_recv().is_err());

        assert_eq!(
            h.remote.receiver.recv().await,
            Some(Message::Close {
                code: INTENTIONAL_DISCONNECT_CODE,
                reason: "bye".to_string()
            })
        );
        assert!(h.connection.send("chat", json!(1)).is_err());
    }

    #[tokio::test]
    async fn test_transport_fault_is_reported_not_thrown() {
        let mut h = open(Direction::Outbound, "1.1");
        drop(h.remote);
        let event = h.events.recv().await.unwrap();
        assert!(matches!(event.kind, ConnectionEventKind::Error(ConnectionError::Reset)));
        assert_eq!(h.connection.state(), ConnectionState::Errored);

        h.connection.disconnect(TRANSPORT_ERROR_CODE, "reset");
        assert_eq!(h.connection.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_remote_close_is_reported() {
        let mut h = open(Direction::Inbound, "1.1");
        h.remote
            .sender
            .send(Message::Close {
                code: 4000,
                reason: "going away".to_string(),
            })
            .await
            .unwrap();
        match h.events.recv().await.unwrap().kind {
            ConnectionEventKind::RemoteClosed { code, reason } => {
                assert_eq!(code, 4000);
                assert_eq!(reason, "going away");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handshake_after_open_is_misbehaviour() {
        let mut h = open(Direction::Inbound, "1.1");
        h.remote
            .sender
            .send(Message::Handshake(remote_info("1.1")))
            .await
            .unwrap();
        assert!(matches!(
            h.events.recv().await.unwrap().kind,
            ConnectionEventKind::Misbehaved(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_measures_latency() {
        let mut h = open(Direction::Outbound, "1.1");
        assert_eq!(h.connection.latency(), None);

        let nonce = match h.remote.receiver.recv().await.unwrap() {
            Message::Ping(nonce) => nonce,
            other => panic!("unexpected message {:?}", other),
        };
        tokio::time::advance(Duration::from_millis(50)).await;
        h.remote.sender.send(Message::Pong(nonce)).await.unwrap();
        settle().await;

        let latency = h.connection.latency().unwrap();
        assert!(latency >= Duration::from_millis(50));
        assert!(latency < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_pong_reports_timeout() {
        let mut h = open(Direction::Outbound, "1.1");
        let started = Instant::now();
        assert!(matches!(h.remote.receiver.recv().await, Some(Message::Ping(_))));
        let ping_sent = started.elapsed();
        assert!(ping_sent >= Duration::from_secs(10) && ping_sent < Duration::from_secs(11));

        let event = h.events.recv().await.unwrap();
        assert!(matches!(event.kind, ConnectionEventKind::Error(ConnectionError::PongTimeout)));
        assert_eq!(h.connection.state(), ConnectionState::Errored);

        // Reported when the 5s pong window closes, not on the next heartbeat
        let reported = started.elapsed() - ping_sent;
        assert!(reported >= Duration::from_secs(5));
        assert!(reported < Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pong_within_window_keeps_connection_open() {
        let mut h = open(Direction::Outbound, "1.1");
        let nonce = match h.remote.receiver.recv().await.unwrap() {
            Message::Ping(nonce) => nonce,
            other => panic!("unexpected message {:?}", other),
        };
        tokio::time::advance(Duration::from_secs(4)).await;
        h.remote.sender.send(Message::Pong(nonce)).await.unwrap();
        settle().await;

        tokio::time::advance(Duration::from_secs(3)).await;
        settle().await;
        assert!(h.connection.is_open());
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_answers_remote_ping() {
        let mut h = open(Direction::Inbound, "1.1");
        h.remote.sender.send(Message::Ping(77)).await.unwrap();
        assert_eq!(h.remote.receiver.recv().await, Some(Message::Pong(77)));
    }

    #[tokio::test]
    async fn test_inbound_socket_can_be_replaced() {
        let mut h = open(Direction::Inbound, "1.1");
        let (local, mut replacement_remote) =
            Socket::pair("r", (IpAddr::from([10, 0, 0, 1]), 5000), (IpAddr::from([10, 0, 0, 2]), 6000));
        h.connection.set_socket(local).unwrap();
        assert_eq!(h.connection.id(), "r-a");
        assert_eq!(h.connection.peer_info().nonce.as_deref(), Some("remote"));
        assert!(h.connection.is_open());

        h.connection.send("chat", json!(2)).unwrap();
        assert!(matches!(replacement_remote.receiver.recv().await, Some(Message::Event { .. })));

        // The old socket is no longer read
        drop(h.remote);
        settle().await;
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_outbound_socket_cannot_be_replaced() {
        let mut h = open(Direction::Outbound, "1.1");
        let (local, _remote) = Socket::pair("r", (IpAddr::from([10, 0, 0, 1]), 5000), (IpAddr::from([10, 0, 0, 2]), 6000));
        assert!(matches!(h.connection.set_socket(local), Err(NetworkError::Validation(_))));
    }

    #[tokio::test]
    async fn test_penalty_lowers_reputation() {
        let mut h = open(Direction::Outbound, "1.1");
        assert_eq!(h.connection.apply_penalty(30), 70);
        assert_eq!(h.connection.apply_penalty(80), -10);
    }
}
