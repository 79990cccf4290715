//! Overlay node
//!
//! The node owns every piece of overlay state: the peer book, the
//! connections table, the ban manager, the populator and the live
//! connections. A single task processes commands, connection events,
//! inbound sockets and completed background work one at a time, so no
//! reaction ever observes another half-done.
//!
//! Applications talk to the node through a cloneable [`NodeHandle`] and
//! observe it through the [`NodeEvent`] stream returned by [`Node::start`].

use crate::network::ban::BanManager;
use crate::network::config::NetworkConfig;
use crate::network::connection::{
    Connection, ConnectionEvent, ConnectionEventKind, Direction, IncomingRequest, RpcCall, BANNED_CODE,
    CONNECTION_LIMIT_CODE, DUPLICATE_CONNECTION_CODE, SELF_CONNECTION_CODE, SHUTDOWN_CODE, TRANSPORT_ERROR_CODE,
    UNRESPONSIVE_CODE,
};
use crate::network::connections_table::ConnectionsTable;
use crate::network::error::{ConnectionError, NetworkError};
use crate::network::handshake::{self, Handshaken};
use crate::network::message::{LegacyEvent, Message, EVENT_NODE_INFO, PROCEDURE_LIST_PEERS, PROCEDURE_STATUS};
use crate::network::peer_info::{parse_peer_record, ConnectionKind, PeerId, PeerInfo};
use crate::network::peer_list::{NewPeers, PeerBook, TriedPeers};
use crate::network::populator::Populator;
use crate::network::selection::{select_for_request, select_for_send};
use crate::network::transport::{Socket, Transport};
use rand::distributions::Alphanumeric;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Reputation lost for a protocol violation
pub const MISBEHAVIOUR_PENALTY: u32 = 10;

/// Length of the random session nonce
const NONCE_LENGTH: usize = 16;

// =============================================================================
// Public types
// =============================================================================

/// Something that happened in the overlay
#[derive(Debug)]
pub enum NodeEvent {
    /// A peer was learned and added to the new list
    PeerDiscovered(PeerInfo),
    PeerConnected(PeerInfo),
    PeerClosed {
        peer_info: PeerInfo,
        code: u16,
        reason: String,
    },
    PeerBanned(PeerInfo),
    PeerUnbanned(PeerInfo),
    /// An outbound attempt failed
    ConnectFailed {
        peer_info: PeerInfo,
        error: ConnectionError,
    },
    /// An inbound session failed before the peer got admitted
    InboundSocketError {
        remote_ip: IpAddr,
        error: ConnectionError,
    },
    Message {
        peer_id: PeerId,
        event: String,
        data: Value,
    },
    /// An RPC call the overlay does not answer itself
    Request(IncomingRequest),
    Legacy {
        peer_id: PeerId,
        event: LegacyEvent,
    },
}

/// Criteria for peer queries
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerFilter {
    pub connection_kind: Option<ConnectionKind>,
    pub min_height: Option<u64>,
    pub limit: Option<usize>,
}

impl PeerFilter {
    pub fn kind(kind: ConnectionKind) -> Self {
        Self {
            connection_kind: Some(kind),
            ..Default::default()
        }
    }

    pub fn apply(&self, peers: impl IntoIterator<Item = PeerInfo>) -> Vec<PeerInfo> {
        let matching = peers
            .into_iter()
            .filter(|p| self.connection_kind.map_or(true, |k| p.connection_kind == k))
            .filter(|p| self.min_height.map_or(true, |h| p.height >= h));
        match self.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        }
    }
}

/// Snapshot of node state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub nonce: String,
    pub port: u16,
    pub height: u64,
    pub outbound: usize,
    pub inbound: usize,
    pub new_peers: usize,
    pub tried_peers: usize,
    pub banned: usize,
}

// =============================================================================
// Commands
// =============================================================================

type Reply<T> = oneshot::Sender<T>;

#[derive(Debug)]
enum Command {
    GetPeers(PeerFilter, Reply<Vec<PeerInfo>>),
    GetConnectedPeers(PeerFilter, Reply<Vec<PeerInfo>>),
    Status(Reply<NodeStatus>),
    Request {
        peer_id: Option<PeerId>,
        procedure: String,
        data: Value,
        reply: Reply<Result<RpcCall, NetworkError>>,
    },
    Emit {
        event: String,
        data: Value,
        reply: Reply<usize>,
    },
    EmitTo {
        peer_id: PeerId,
        event: String,
        data: Value,
        reply: Reply<Result<(), NetworkError>>,
    },
    ApplyPenalty {
        peer_id: PeerId,
        penalty: u32,
        reply: Reply<Result<(), NetworkError>>,
    },
    ApplyNodeInfo {
        height: u64,
        broadhash: String,
        reply: Reply<()>,
    },
    Shutdown(Reply<()>),
}

/// Work finished outside the node task
#[derive(Debug)]
enum Internal {
    PopulatorTick,
    ConnectOutcome {
        peer_id: PeerId,
        result: Result<Handshaken, ConnectionError>,
    },
    InboundOutcome {
        remote_ip: IpAddr,
        result: Result<Handshaken, ConnectionError>,
    },
    DiscoveryResponse {
        peer_id: PeerId,
        result: Result<Value, NetworkError>,
    },
    BanFinished(PeerInfo),
}

// =============================================================================
// Node Handle
// =============================================================================

/// Cloneable entry point to a running node
#[derive(Debug, Clone)]
pub struct NodeHandle {
    commands: mpsc::UnboundedSender<Command>,
    request_timeout: Duration,
}

impl NodeHandle {
    async fn call<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T, NetworkError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .map_err(|_| NetworkError::NotRunning)?;
        rx.await.map_err(|_| NetworkError::NotRunning)
    }

    /// Known peers from both lists, tried first
    pub async fn get_peers(&self, filter: PeerFilter) -> Result<Vec<PeerInfo>, NetworkError> {
        self.call(|reply| Command::GetPeers(filter, reply)).await
    }

    pub async fn get_connected_peers(&self, filter: PeerFilter) -> Result<Vec<PeerInfo>, NetworkError> {
        self.call(|reply| Command::GetConnectedPeers(filter, reply)).await
    }

    pub async fn status(&self) -> Result<NodeStatus, NetworkError> {
        self.call(Command::Status).await
    }

    /// Call `procedure` on a random connected peer
    pub async fn request(&self, procedure: &str, data: Value) -> Result<Value, NetworkError> {
        self.send_request(None, procedure, data).await
    }

    /// Call `procedure` on a specific peer
    pub async fn request_from(&self, peer_id: PeerId, procedure: &str, data: Value) -> Result<Value, NetworkError> {
        self.send_request(Some(peer_id), procedure, data).await
    }

    async fn send_request(&self, peer_id: Option<PeerId>, procedure: &str, data: Value) -> Result<Value, NetworkError> {
        let call = self
            .call(|reply| Command::Request {
                peer_id,
                procedure: procedure.to_string(),
                data,
                reply,
            })
            .await??;
        call.wait(self.request_timeout).await
    }

    /// Broadcast an event to a balanced selection of connected peers;
    /// returns how many peers it was sent to
    pub async fn emit(&self, event: &str, data: Value) -> Result<usize, NetworkError> {
        self.call(|reply| Command::Emit {
            event: event.to_string(),
            data,
            reply,
        })
        .await
    }

    pub async fn emit_to(&self, peer_id: PeerId, event: &str, data: Value) -> Result<(), NetworkError> {
        self.call(|reply| Command::EmitTo {
            peer_id,
            event: event.to_string(),
            data,
            reply,
        })
        .await?
    }

    /// Lower a connected peer's reputation; a peer that reaches zero is banned
    pub async fn apply_penalty(&self, peer_id: PeerId, penalty: u32) -> Result<(), NetworkError> {
        self.call(|reply| Command::ApplyPenalty { peer_id, penalty, reply })
            .await?
    }

    /// Update the advertised chain state and tell connected peers
    pub async fn apply_node_info(&self, height: u64, broadhash: &str) -> Result<(), NetworkError> {
        self.call(|reply| Command::ApplyNodeInfo {
            height,
            broadhash: broadhash.to_string(),
            reply,
        })
        .await
    }

    /// Stop the node, closing every connection
    pub async fn shutdown(&self) -> Result<(), NetworkError> {
        self.call(Command::Shutdown).await
    }
}

// =============================================================================
// Node
// =============================================================================

/// The overlay orchestrator
pub struct Node {
    config: NetworkConfig,
    transport: Arc<dyn Transport>,
    local: PeerInfo,
    book: PeerBook,
    table: ConnectionsTable,
    bans: BanManager,
    populator: Populator,
    connections: HashMap<PeerId, Connection>,
    /// Outbound connections still handshaking
    pending: HashMap<PeerId, Connection>,
    /// Inbound sessions still handshaking
    accepting: usize,
    rng: StdRng,
    running: bool,
    shutdown: CancellationToken,
    shutdown_reply: Option<Reply<()>>,
    events: mpsc::UnboundedSender<NodeEvent>,
    connection_tx: mpsc::UnboundedSender<ConnectionEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
}

impl Node {
    /// Start listening and maintaining connections
    pub async fn start(
        config: NetworkConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<(NodeHandle, mpsc::UnboundedReceiver<NodeEvent>), NetworkError> {
        config.validate()?;

        let mut rng = match config.random_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let secret = config.secret.unwrap_or_else(|| rng.gen());
        let nonce: String = (&mut rng)
            .sample_iter(&Alphanumeric)
            .take(NONCE_LENGTH)
            .map(char::from)
            .collect();
        let local = config.local_peer_info(&nonce);

        let new_peers = NewPeers::with_rng(config.new_peers.clone(), secret, StdRng::seed_from_u64(rng.gen()));
        let tried_peers = TriedPeers::with_rng(config.tried_peers.clone(), secret, StdRng::seed_from_u64(rng.gen()));
        let mut book = PeerBook::new(new_peers, tried_peers, config.max_reconnect_tries);
        for seed in config.seed_peer_ids()? {
            if seed == local.peer_id() {
                log::warn!("Ignoring seed peer {}: it is this node", seed);
                continue;
            }
            let info = PeerInfo::new(seed.ip, seed.port).with_network(config.network_identifier.clone());
            if let Err(e) = book.new_peers.add(info) {
                log::warn!("Could not add seed peer {}: {}", seed, e);
            }
        }

        let inbound = transport.listen().await?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (connection_tx, connection_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let mut node = Node {
            bans: BanManager::new(config.ban_duration(), config.blacklisted_ips.iter().copied()),
            populator: Populator::new(config.max_outbound_connections, config.discovery_sample_size),
            transport,
            local,
            book,
            table: ConnectionsTable::new(),
            connections: HashMap::new(),
            pending: HashMap::new(),
            accepting: 0,
            rng,
            running: true,
            shutdown: CancellationToken::new(),
            shutdown_reply: None,
            events: event_tx,
            connection_tx,
            internal_tx: internal_tx.clone(),
            config,
        };

        let tick_tx = internal_tx.clone();
        node.populator
            .start(node.config.populator_interval(), node.shutdown.child_token(), move || {
                let _ = tick_tx.send(Internal::PopulatorTick);
            });
        // First round right away so seeds are dialed without waiting a full period
        let _ = internal_tx.send(Internal::PopulatorTick);

        log::info!(
            "Node {} started on {} (network {})",
            nonce,
            node.local.peer_id(),
            node.local.network_identifier
        );

        let handle = NodeHandle {
            commands: command_tx,
            request_timeout: node.config.request_timeout(),
        };
        tokio::spawn(node.run(command_rx, connection_rx, internal_rx, inbound));
        Ok((handle, event_rx))
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut connection_events: mpsc::UnboundedReceiver<ConnectionEvent>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
        mut inbound: mpsc::Receiver<Socket>,
    ) {
        let mut listening = true;
        while self.running {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => self.stop(),
                },
                Some(event) = connection_events.recv() => self.handle_connection_event(event),
                Some(work) = internal.recv() => self.handle_internal(work),
                socket = inbound.recv(), if listening => match socket {
                    Some(socket) => self.handle_inbound(socket),
                    None => {
                        log::warn!("Listener closed; no longer accepting peers");
                        listening = false;
                    }
                },
            }
        }

        // Deliver the close notifications produced while stopping
        while let Ok(event) = connection_events.try_recv() {
            self.handle_connection_event(event);
        }
        if let Some(reply) = self.shutdown_reply.take() {
            let _ = reply.send(());
        }
        log::info!("Node {} stopped", self.nonce());
    }

    fn nonce(&self) -> &str {
        self.local.nonce.as_deref().unwrap_or_default()
    }

    fn emit_event(&self, event: NodeEvent) {
        let _ = self.events.send(event);
    }

    fn connected_peers(&self) -> Vec<PeerInfo> {
        self.connections.values().map(|c| c.peer_info().clone()).collect()
    }

    fn count(&self, direction: Direction) -> usize {
        self.connections.values().filter(|c| c.direction() == direction).count()
    }

    fn is_live(&self, peer_id: &PeerId, connection_id: &str) -> bool {
        self.connections.get(peer_id).is_some_and(|c| c.id() == connection_id)
    }

    // =========================================================================
    // Commands
    // =========================================================================

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::GetPeers(filter, reply) => {
                let _ = reply.send(filter.apply(self.book.all()));
            }
            Command::GetConnectedPeers(filter, reply) => {
                let _ = reply.send(filter.apply(self.connected_peers()));
            }
            Command::Status(reply) => {
                let _ = reply.send(NodeStatus {
                    nonce: self.nonce().to_string(),
                    port: self.local.port,
                    height: self.local.height,
                    outbound: self.count(Direction::Outbound),
                    inbound: self.count(Direction::Inbound),
                    new_peers: self.book.new_peers.len(),
                    tried_peers: self.book.tried_peers.len(),
                    banned: self.bans.len(),
                });
            }
            Command::Request {
                peer_id,
                procedure,
                data,
                reply,
            } => {
                let _ = reply.send(self.start_request(peer_id, &procedure, data));
            }
            Command::Emit { event, data, reply } => {
                let _ = reply.send(self.broadcast(&event, data));
            }
            Command::EmitTo {
                peer_id,
                event,
                data,
                reply,
            } => {
                let result = self.connection_for(&peer_id).and_then(|c| c.send(&event, data));
                let _ = reply.send(result);
            }
            Command::ApplyPenalty { peer_id, penalty, reply } => {
                let result = if self.connections.contains_key(&peer_id) {
                    self.penalize(&peer_id, penalty);
                    Ok(())
                } else {
                    Err(NetworkError::PeerNotFound(peer_id))
                };
                let _ = reply.send(result);
            }
            Command::ApplyNodeInfo {
                height,
                broadhash,
                reply,
            } => {
                self.local.height = height;
                self.local.broadhash = broadhash;
                self.announce_node_info();
                let _ = reply.send(());
            }
            Command::Shutdown(reply) => {
                self.shutdown_reply = Some(reply);
                self.stop();
            }
        }
    }

    /// Connection to an unbanned, connected peer
    fn connection_for(&self, peer_id: &PeerId) -> Result<&Connection, NetworkError> {
        if self.bans.is_banned(peer_id) {
            return Err(NetworkError::Banned(*peer_id));
        }
        self.connections
            .get(peer_id)
            .ok_or(NetworkError::PeerNotFound(*peer_id))
    }

    fn start_request(&mut self, peer_id: Option<PeerId>, procedure: &str, data: Value) -> Result<RpcCall, NetworkError> {
        let peer_id = match peer_id {
            Some(peer_id) => peer_id,
            None => {
                let connected = self.connected_peers();
                select_for_request(&connected, Some(1), &mut self.rng)
                    .first()
                    .map(PeerInfo::peer_id)
                    .ok_or(NetworkError::NoPeersAvailable)?
            }
        };
        self.connection_for(&peer_id)?.request(procedure, data)
    }

    fn broadcast(&mut self, event: &str, data: Value) -> usize {
        let connected = self.connected_peers();
        let targets = select_for_send(&connected, self.config.send_peer_limit, &mut self.rng);
        let mut sent = 0;
        for target in targets {
            let peer_id = target.peer_id();
            let Some(connection) = self.connections.get(&peer_id) else {
                continue;
            };
            match connection.send(event, data.clone()) {
                Ok(()) => sent += 1,
                Err(e) => log::warn!("Failed to send {} to {}: {}", event, peer_id, e),
            }
        }
        sent
    }

    fn announce_node_info(&self) {
        let data = match serde_json::to_value(&self.local) {
            Ok(data) => data,
            Err(e) => {
                log::warn!("Could not encode node info: {}", e);
                return;
            }
        };
        for connection in self.connections.values() {
            if let Err(e) = connection.send(EVENT_NODE_INFO, data.clone()) {
                log::debug!("Failed to send node info to {}: {}", connection.peer_id(), e);
            }
        }
    }

    /// Stop maintenance and close every connection
    fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        self.populator.stop();
        self.shutdown.cancel();

        let peers: Vec<PeerId> = self.connections.keys().copied().collect();
        for peer_id in peers {
            self.disconnect_peer(&peer_id, SHUTDOWN_CODE, "node shutting down");
        }
        self.pending.clear();
        self.bans.clear();
    }

    // =========================================================================
    // Background work
    // =========================================================================

    fn handle_internal(&mut self, work: Internal) {
        match work {
            Internal::PopulatorTick => self.populate(),
            Internal::ConnectOutcome { peer_id, result } => self.on_connect_outcome(peer_id, result),
            Internal::InboundOutcome { remote_ip, result } => self.on_inbound_outcome(remote_ip, result),
            Internal::DiscoveryResponse { peer_id, result } => self.on_discovery_response(peer_id, result),
            Internal::BanFinished(peer_info) => {
                if self.running {
                    self.emit_event(NodeEvent::PeerUnbanned(peer_info));
                }
            }
        }
    }

    /// One populator round: dial missing outbound peers and ask for peer lists
    fn populate(&mut self) {
        if !self.running {
            return;
        }

        let outbound = self.count(Direction::Outbound) + self.pending.len();
        let local_id = self.local.peer_id();
        let connections = &self.connections;
        let pending = &self.pending;
        let bans = &self.bans;
        let eligible = |p: &PeerInfo| {
            let id = p.peer_id();
            id != local_id
                && !connections.contains_key(&id)
                && !pending.contains_key(&id)
                && !bans.is_banned(&id)
                && !bans.is_blacklisted(&p.ip_address)
        };
        let candidates = self
            .populator
            .connection_candidates(&self.book, outbound, eligible, &mut self.rng);
        for candidate in candidates {
            self.dial(candidate);
        }

        let connected = self.connected_peers();
        for target in self.populator.discovery_targets(&connected, &mut self.rng) {
            self.request_peer_list(target.peer_id());
        }
    }

    fn dial(&mut self, target: PeerInfo) {
        let peer_id = target.peer_id();
        let connection = Connection::new(
            target.clone(),
            Direction::Outbound,
            self.config.connection_settings(),
            self.connection_tx.clone(),
        );
        self.pending.insert(peer_id, connection);

        let transport = Arc::clone(&self.transport);
        let local = self.local.clone();
        let timeouts = self.config.handshake_timeouts();
        let internal = self.internal_tx.clone();
        let token = self.shutdown.clone();
        log::debug!("Dialing {}", peer_id);
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = token.cancelled() => return,
                result = handshake::dial(transport, target, local, timeouts) => result,
            };
            let _ = internal.send(Internal::ConnectOutcome { peer_id, result });
        });
    }

    fn request_peer_list(&self, peer_id: PeerId) {
        let Some(connection) = self.connections.get(&peer_id) else {
            return;
        };
        let call = match connection.request(PROCEDURE_LIST_PEERS, Value::Null) {
            Ok(call) => call,
            Err(e) => {
                log::debug!("Could not ask {} for peers: {}", peer_id, e);
                return;
            }
        };
        let internal = self.internal_tx.clone();
        let timeout = self.config.request_timeout();
        tokio::spawn(async move {
            let result = call.wait(timeout).await;
            let _ = internal.send(Internal::DiscoveryResponse { peer_id, result });
        });
    }

    fn on_connect_outcome(&mut self, peer_id: PeerId, result: Result<Handshaken, ConnectionError>) {
        let Some(mut connection) = self.pending.remove(&peer_id) else {
            if let Ok(handshaken) = result {
                reject(handshaken.socket, SHUTDOWN_CODE, "no longer connecting");
            }
            return;
        };
        if !self.running {
            if let Ok(handshaken) = result {
                reject(handshaken.socket, SHUTDOWN_CODE, "node shutting down");
            }
            return;
        }

        let Handshaken { peer_info, socket } = match result {
            Ok(handshaken) => handshaken,
            Err(error) => {
                log::warn!("Failed to connect to {}: {}", peer_id, error);
                let peer_info = connection.peer_info().clone();
                self.populator.on_connect_failure(&mut self.book, &peer_info);
                self.emit_event(NodeEvent::ConnectFailed { peer_info, error });
                return;
            }
        };

        if let Err((code, reason)) = self.admit(&peer_info) {
            log::info!("Dropping outbound connection to {}: {}", peer_id, reason);
            if code == SELF_CONNECTION_CODE {
                self.book.new_peers.remove(&peer_id);
                self.book.tried_peers.remove(&peer_id);
            }
            reject(socket, code, &reason);
            return;
        }

        connection.update_peer_info(peer_info);
        if let Err(e) = connection.bind(socket) {
            log::warn!("Could not open connection to {}: {}", peer_id, e);
            return;
        }
        self.populator
            .on_connect_success(&mut self.book, &mut self.table, connection.peer_info(), connection.id());

        log::info!("Connected to {}", peer_id);
        self.emit_event(NodeEvent::PeerConnected(connection.peer_info().clone()));
        self.connections.insert(peer_id, connection);
    }

    /// Admission rules shared by both directions
    fn admit(&self, peer_info: &PeerInfo) -> Result<(), (u16, String)> {
        let peer_id = peer_info.peer_id();
        if self.bans.is_blacklisted(&peer_info.ip_address) {
            return Err((BANNED_CODE, format!("{} is blacklisted", peer_info.ip_address)));
        }
        if self.bans.is_banned(&peer_id) {
            return Err((BANNED_CODE, format!("{} is banned", peer_id)));
        }
        // An inbound peer picks its own port, so a ban holds for its whole address
        if peer_info.connection_kind == ConnectionKind::Inbound && self.bans.is_ip_banned(&peer_info.ip_address) {
            return Err((BANNED_CODE, format!("{} is banned", peer_info.ip_address)));
        }
        if let Some(nonce) = &peer_info.nonce {
            if nonce == self.nonce() {
                return Err((SELF_CONNECTION_CODE, "connected to self".to_string()));
            }
            if self.table.get_connection_id(nonce).is_some() {
                return Err((DUPLICATE_CONNECTION_CODE, format!("already connected to nonce {}", nonce)));
            }
        }
        if self.connections.contains_key(&peer_id) {
            return Err((DUPLICATE_CONNECTION_CODE, format!("already connected to {}", peer_id)));
        }
        Ok(())
    }

    fn handle_inbound(&mut self, socket: Socket) {
        if !self.running {
            return;
        }
        if self.bans.is_blacklisted(&socket.remote_ip) {
            let reason = format!("{} is blacklisted", socket.remote_ip);
            reject(socket, BANNED_CODE, &reason);
            return;
        }
        if self.count(Direction::Inbound) + self.accepting >= self.config.max_inbound_connections {
            log::debug!("Refusing inbound session from {}: inbound limit reached", socket.remote_ip);
            reject(socket, CONNECTION_LIMIT_CODE, "too many inbound connections");
            return;
        }
        self.accepting += 1;

        let remote_ip = socket.remote_ip;
        let local = self.local.clone();
        let ack_timeout = self.config.handshake_timeouts().ack;
        let internal = self.internal_tx.clone();
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = token.cancelled() => return,
                result = handshake::accept(socket, local, ack_timeout) => result,
            };
            let _ = internal.send(Internal::InboundOutcome { remote_ip, result });
        });
    }

    fn on_inbound_outcome(&mut self, remote_ip: IpAddr, result: Result<Handshaken, ConnectionError>) {
        self.accepting = self.accepting.saturating_sub(1);
        let Handshaken { peer_info, socket } = match result {
            Ok(handshaken) => handshaken,
            Err(error) => {
                log::warn!("Inbound handshake from {} failed: {}", remote_ip, error);
                if self.running {
                    self.emit_event(NodeEvent::InboundSocketError { remote_ip, error });
                }
                return;
            }
        };
        if !self.running {
            reject(socket, SHUTDOWN_CODE, "node shutting down");
            return;
        }
        let peer_id = peer_info.peer_id();

        // Same logical peer reconnecting: move the existing connection onto the new socket
        if let Some(existing) = self.connections.get_mut(&peer_id) {
            let same_session = existing.direction() == Direction::Inbound
                && existing.peer_info().nonce.is_some()
                && existing.peer_info().nonce == peer_info.nonce;
            if same_session && !self.bans.is_banned(&peer_id) {
                if let Err(e) = existing.set_socket(socket) {
                    log::warn!("Could not rebind {}: {}", peer_id, e);
                    return;
                }
                existing.update_peer_info(peer_info);
                if let Some(nonce) = &existing.peer_info().nonce {
                    if let Err(e) = self.table.add(nonce, existing.id()) {
                        log::warn!("Could not register session of {}: {}", peer_id, e);
                    }
                }
                return;
            }
        }

        if let Err((code, reason)) = self.admit(&peer_info) {
            log::info!("Dropping inbound connection from {}: {}", peer_id, reason);
            reject(socket, code, &reason);
            return;
        }
        if self.count(Direction::Inbound) >= self.config.max_inbound_connections {
            log::debug!("Dropping inbound connection from {}: inbound limit reached", peer_id);
            reject(socket, CONNECTION_LIMIT_CODE, "too many inbound connections");
            return;
        }

        let mut connection = Connection::new(
            peer_info,
            Direction::Inbound,
            self.config.connection_settings(),
            self.connection_tx.clone(),
        );
        if let Err(e) = connection.bind(socket) {
            log::warn!("Could not open connection from {}: {}", peer_id, e);
            return;
        }
        if let Some(nonce) = &connection.peer_info().nonce {
            if let Err(e) = self.table.add(nonce, connection.id()) {
                log::warn!("Could not register session of {}: {}", peer_id, e);
            }
        }

        let learned = self
            .populator
            .merge_discovered(&mut self.book, vec![connection.peer_info().clone()]);
        for peer in learned {
            self.emit_event(NodeEvent::PeerDiscovered(peer));
        }

        log::info!("Accepted connection from {}", peer_id);
        self.emit_event(NodeEvent::PeerConnected(connection.peer_info().clone()));
        self.connections.insert(peer_id, connection);
    }

    fn on_discovery_response(&mut self, peer_id: PeerId, result: Result<Value, NetworkError>) {
        if !self.running {
            return;
        }
        let value = match result {
            Ok(value) => value,
            Err(e) => {
                log::debug!("Peer list request to {} failed: {}", peer_id, e);
                return;
            }
        };

        let Some(records) = value.get("peers").and_then(Value::as_array) else {
            log::warn!("Malformed peer list from {}", peer_id);
            self.penalize(&peer_id, MISBEHAVIOUR_PENALTY);
            return;
        };

        let mut peers = Vec::with_capacity(records.len());
        let mut invalid = 0;
        for record in records {
            match parse_peer_record(record) {
                Ok(info) => peers.push(info.with_kind(ConnectionKind::Outbound)),
                Err(_) => invalid += 1,
            }
        }
        if invalid > 0 {
            log::warn!("Peer list from {} had {} invalid records", peer_id, invalid);
            self.penalize(&peer_id, MISBEHAVIOUR_PENALTY);
        }

        let local_id = self.local.peer_id();
        let nonce = self.nonce().to_string();
        peers.retain(|p| {
            p.peer_id() != local_id
                && p.nonce.as_deref() != Some(nonce.as_str())
                && p.network_identifier == self.local.network_identifier
                && !self.bans.is_blacklisted(&p.ip_address)
        });

        for peer in self.populator.merge_discovered(&mut self.book, peers) {
            self.emit_event(NodeEvent::PeerDiscovered(peer));
        }
    }

    // =========================================================================
    // Connection events
    // =========================================================================

    fn handle_connection_event(&mut self, event: ConnectionEvent) {
        let ConnectionEvent {
            peer_id,
            connection_id,
            kind,
        } = event;

        let kind = match kind {
            ConnectionEventKind::Closed { peer_info, code, reason } => {
                self.on_closed(peer_id, &connection_id, peer_info, code, reason);
                return;
            }
            other => other,
        };
        if !self.running || !self.is_live(&peer_id, &connection_id) {
            log::debug!("Ignoring event from stale session {}", connection_id);
            return;
        }

        match kind {
            ConnectionEventKind::Message { event, data } if event == EVENT_NODE_INFO => {
                self.on_node_info(&peer_id, data);
            }
            ConnectionEventKind::Message { event, data } => {
                self.emit_event(NodeEvent::Message { peer_id, event, data });
            }
            ConnectionEventKind::Request(request) => self.on_request(request),
            ConnectionEventKind::Legacy(event) => {
                self.emit_event(NodeEvent::Legacy { peer_id, event });
            }
            ConnectionEventKind::Error(ConnectionError::PongTimeout) => {
                let tried = self.book.tried_peers.contains(&peer_id);
                let peer_info = self.connections.get(&peer_id).map(|c| c.peer_info().clone());
                self.disconnect_peer(&peer_id, UNRESPONSIVE_CODE, "ping timeout");
                if let (true, Some(peer_info)) = (tried, peer_info) {
                    let max_tries = self.book.max_reconnect_tries;
                    if self.book.tried_peers.failed_connection_action(&peer_info, max_tries) {
                        log::info!("Dropped unresponsive tried peer {}", peer_id);
                    }
                }
            }
            ConnectionEventKind::Error(error) => {
                log::warn!("Connection to {} failed: {}", peer_id, error);
                self.disconnect_peer(&peer_id, TRANSPORT_ERROR_CODE, &error.to_string());
            }
            ConnectionEventKind::Misbehaved(reason) => {
                log::warn!("Peer {} misbehaved: {}", peer_id, reason);
                self.penalize(&peer_id, MISBEHAVIOUR_PENALTY);
            }
            ConnectionEventKind::RemoteClosed { code, reason } => {
                log::debug!("Peer {} closed the connection ({}): {}", peer_id, code, reason);
                self.disconnect_peer(&peer_id, code, &reason);
            }
            ConnectionEventKind::Closed { .. } => {}
        }
    }

    fn on_closed(&mut self, peer_id: PeerId, connection_id: &str, peer_info: PeerInfo, code: u16, reason: String) {
        if self.is_live(&peer_id, connection_id) {
            self.connections.remove(&peer_id);
        }
        self.forget_session(&peer_info, connection_id);
        self.emit_event(NodeEvent::PeerClosed {
            peer_info,
            code,
            reason,
        });
    }

    /// Drop the table entry of a session, unless the nonce moved to another one
    fn forget_session(&mut self, peer_info: &PeerInfo, connection_id: &str) {
        let Some(nonce) = &peer_info.nonce else {
            return;
        };
        if self.table.get_connection_id(nonce) == Some(connection_id) {
            if let Err(e) = self.table.remove(nonce) {
                log::debug!("Could not remove session of {}: {}", peer_info.peer_id(), e);
            }
        }
    }

    fn disconnect_peer(&mut self, peer_id: &PeerId, code: u16, reason: &str) {
        let Some(mut connection) = self.connections.remove(peer_id) else {
            return;
        };
        let peer_info = connection.peer_info().clone();
        let connection_id = connection.id().to_string();
        connection.disconnect(code, reason);
        self.forget_session(&peer_info, &connection_id);
    }

    fn penalize(&mut self, peer_id: &PeerId, penalty: u32) {
        let Some(connection) = self.connections.get_mut(peer_id) else {
            return;
        };
        let reputation = connection.apply_penalty(penalty);
        log::debug!("Peer {} penalized by {}, reputation {}", peer_id, penalty, reputation);
        if reputation > 0 {
            return;
        }

        let peer_info = connection.peer_info().clone();
        self.disconnect_peer(peer_id, BANNED_CODE, "reputation exhausted");
        let internal = self.internal_tx.clone();
        self.bans.ban_temporarily(peer_info.clone(), move |info| {
            let _ = internal.send(Internal::BanFinished(info));
        });
        if self.bans.is_banned(peer_id) {
            self.emit_event(NodeEvent::PeerBanned(peer_info));
        }
    }

    fn on_request(&mut self, request: IncomingRequest) {
        let peer_id = request.peer_id;
        let result = match request.procedure.as_str() {
            PROCEDURE_LIST_PEERS => self.peer_list_response(&peer_id),
            PROCEDURE_STATUS => serde_json::to_value(&self.local).map_err(|e| e.to_string()),
            _ => {
                self.emit_event(NodeEvent::Request(request));
                return;
            }
        };
        if let Err(e) = request.respond(result) {
            log::debug!("Could not answer {}: {}", peer_id, e);
        }
    }

    /// Sample of known peers, in the requester's record format
    fn peer_list_response(&mut self, requester: &PeerId) -> Result<Value, String> {
        let legacy = self
            .connections
            .get(requester)
            .is_some_and(|c| c.peer_info().is_legacy());
        let known: Vec<PeerInfo> = self
            .book
            .all()
            .into_iter()
            .filter(|p| p.peer_id() != *requester && !self.bans.is_banned(&p.peer_id()))
            .collect();
        let sample = select_for_request(&known, Some(self.config.peer_list_response_limit), &mut self.rng);

        let records = sample
            .iter()
            .map(|p| {
                if legacy {
                    serde_json::to_value(p.to_legacy())
                } else {
                    serde_json::to_value(p)
                }
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| e.to_string())?;
        Ok(json!({ "peers": records }))
    }

    /// Apply a peer's announcement of its new chain state
    fn on_node_info(&mut self, peer_id: &PeerId, data: Value) {
        let advertised = match serde_json::from_value::<PeerInfo>(data) {
            Ok(info) => info.sanitize(),
            Err(e) => {
                log::warn!("Invalid node info from {}: {}", peer_id, e);
                self.penalize(peer_id, MISBEHAVIOUR_PENALTY);
                return;
            }
        };
        let Some(connection) = self.connections.get_mut(peer_id) else {
            return;
        };
        let current = connection.peer_info().clone();
        if advertised.network_identifier != current.network_identifier {
            self.penalize(peer_id, MISBEHAVIOUR_PENALTY);
            return;
        }

        // Identity stays as established by the handshake
        let updated = PeerInfo {
            ip_address: current.ip_address,
            port: current.port,
            nonce: current.nonce.clone(),
            connection_kind: current.connection_kind,
            ..advertised
        };
        connection.update_peer_info(updated.clone());
        if !self.book.tried_peers.update(updated.clone()) {
            self.book.new_peers.update(updated);
        }
    }
}

/// Refuse a handshaken socket, telling the remote why
fn reject(socket: Socket, code: u16, reason: &str) {
    let _ = socket.sender.try_send(Message::Close {
        code,
        reason: reason.to_string(),
    });
}

// =============================================================================
// Tests
// =============================================================================
