//! Transport boundary
//!
//! A [`Socket`] is one session with a remote endpoint: messages pushed onto
//! `sender` go out, messages arriving are pulled from `receiver`. The TCP
//! implementation lives in `server`; [`MemoryNetwork`] wires nodes together
//! inside one process.

use crate::network::error::{ConnectionError, NetworkError};
use crate::network::message::Message;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

/// Buffered messages per socket direction
pub const SOCKET_BUFFER: usize = 256;

/// Transport-assigned session identifier
pub type ConnectionId = String;

/// One transport session
#[derive(Debug)]
pub struct Socket {
    pub id: ConnectionId,
    pub remote_ip: IpAddr,
    pub remote_port: u16,
    pub sender: mpsc::Sender<Message>,
    pub receiver: mpsc::Receiver<Message>,
}

impl Socket {
    /// Two connected in-memory sockets; `a` sees `b`'s address as remote and vice versa
    pub fn pair(id: &str, a: (IpAddr, u16), b: (IpAddr, u16)) -> (Socket, Socket) {
        let (a_tx, b_rx) = mpsc::channel(SOCKET_BUFFER);
        let (b_tx, a_rx) = mpsc::channel(SOCKET_BUFFER);
        let a_side = Socket {
            id: format!("{}-a", id),
            remote_ip: b.0,
            remote_port: b.1,
            sender: a_tx,
            receiver: a_rx,
        };
        let b_side = Socket {
            id: format!("{}-b", id),
            remote_ip: a.0,
            remote_port: a.1,
            sender: b_tx,
            receiver: b_rx,
        };
        (a_side, b_side)
    }
}

/// Dial and listen primitives the overlay consumes
pub trait Transport: Send + Sync {
    fn connect(&self, ip: IpAddr, port: u16) -> BoxFuture<'static, Result<Socket, ConnectionError>>;

    /// Start accepting sessions; each inbound session is delivered on the returned channel
    fn listen(&self) -> BoxFuture<'static, Result<mpsc::Receiver<Socket>, NetworkError>>;
}

// =============================================================================
// In-memory transport
// =============================================================================

type Listeners = HashMap<(IpAddr, u16), mpsc::Sender<Socket>>;

/// Shared registry of in-process listeners
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    listeners: Arc<Mutex<Listeners>>,
    next_id: Arc<AtomicU64>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport for a node reachable at `ip:port`
    pub fn transport(&self, ip: IpAddr, port: u16) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            local: (ip, port),
        }
    }

    /// Remove a listener so further dials are refused
    pub fn unregister(&self, ip: IpAddr, port: u16) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(ip, port));
    }
}

/// One node's view of a [`MemoryNetwork`]
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    local: (IpAddr, u16),
}

impl Transport for MemoryTransport {
    fn connect(&self, ip: IpAddr, port: u16) -> BoxFuture<'static, Result<Socket, ConnectionError>> {
        let network = self.network.clone();
        let local = self.local;
        Box::pin(async move {
            let listener = network
                .listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&(ip, port))
                .cloned()
                .ok_or_else(|| ConnectionError::Refused(format!("no listener on {}:{}", ip, port)))?;

            let n = network.next_id.fetch_add(1, Ordering::Relaxed);
            let (dialer, accepted) = Socket::pair(&format!("mem-{}", n), local, (ip, port));
            listener
                .send(accepted)
                .await
                .map_err(|_| ConnectionError::Refused(format!("listener on {}:{} is gone", ip, port)))?;
            Ok(dialer)
        })
    }

    fn listen(&self) -> BoxFuture<'static, Result<mpsc::Receiver<Socket>, NetworkError>> {
        let network = self.network.clone();
        let local = self.local;
        Box::pin(async move {
            let (tx, rx) = mpsc::channel(SOCKET_BUFFER);
            network
                .listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(local, tx);
            Ok(rx)
        })
    }
}
