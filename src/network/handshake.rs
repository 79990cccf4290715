//! Session handshake
//!
//! The steps for an *outbound* handshake are:
//!
//!   1. Dial the target within the connect timeout.
//!   2. Send `Handshake` with our peer info.
//!   3. Expect `HandshakeAck` with the remote's info within the ack timeout.
//!
//! The steps for an *inbound* handshake are:
//!
//!   1. Expect `Handshake` from the remote within the ack timeout.
//!   2. Send `HandshakeAck` with our peer info.
//!
//! Both sides reject peers advertising a different network identifier.

use crate::network::connection::INCOMPATIBLE_NETWORK_CODE;
use crate::network::error::ConnectionError;
use crate::network::message::Message;
use crate::network::peer_info::{ConnectionKind, PeerInfo};
use crate::network::transport::{Socket, Transport};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// A socket whose remote end has identified itself
#[derive(Debug)]
pub struct Handshaken {
    pub peer_info: PeerInfo,
    pub socket: Socket,
}

/// Timeouts bounding connection establishment
#[derive(Debug, Clone, Copy)]
pub struct HandshakeTimeouts {
    pub connect: Duration,
    pub ack: Duration,
}

/// Dial `target` and perform the outbound handshake
pub async fn dial(
    transport: Arc<dyn Transport>,
    target: PeerInfo,
    local: PeerInfo,
    timeouts: HandshakeTimeouts,
) -> Result<Handshaken, ConnectionError> {
    let mut socket = timeout(timeouts.connect, transport.connect(target.ip_address, target.port))
        .await
        .map_err(|_| ConnectionError::ConnectTimeout)??;

    socket
        .sender
        .send(Message::Handshake(local.clone()))
        .await
        .map_err(|_| ConnectionError::Reset)?;
    log::debug!("Sent handshake to {}", target.peer_id());

    let advertised = timeout(timeouts.ack, expect(&mut socket.receiver, true))
        .await
        .map_err(|_| ConnectionError::AckTimeout)??;

    // Keep the address we dialed; everything else is the remote's own claim
    let peer_info = PeerInfo {
        ip_address: target.ip_address,
        port: target.port,
        ..advertised.sanitize()
    }
    .with_kind(ConnectionKind::Outbound);

    check_compatible(&local, &peer_info, &socket)?;
    Ok(Handshaken { peer_info, socket })
}

/// Perform the inbound handshake on a freshly accepted socket
pub async fn accept(mut socket: Socket, local: PeerInfo, ack_timeout: Duration) -> Result<Handshaken, ConnectionError> {
    let advertised = timeout(ack_timeout, expect(&mut socket.receiver, false))
        .await
        .map_err(|_| ConnectionError::AckTimeout)??;

    // The address comes from the socket, the port is the one the peer listens on
    let peer_info = PeerInfo {
        ip_address: socket.remote_ip,
        ..advertised.sanitize()
    }
    .with_kind(ConnectionKind::Inbound);

    peer_info
        .validate()
        .map_err(|e| ConnectionError::Handshake(e.to_string()))?;
    check_compatible(&local, &peer_info, &socket)?;

    socket
        .sender
        .send(Message::HandshakeAck(local))
        .await
        .map_err(|_| ConnectionError::Reset)?;
    Ok(Handshaken { peer_info, socket })
}

fn check_compatible(local: &PeerInfo, remote: &PeerInfo, socket: &Socket) -> Result<(), ConnectionError> {
    if remote.network_identifier == local.network_identifier {
        return Ok(());
    }
    let reason = format!(
        "expected network {}, peer advertised {}",
        local.network_identifier, remote.network_identifier
    );
    let _ = socket.sender.try_send(Message::Close {
        code: INCOMPATIBLE_NETWORK_CODE,
        reason: reason.clone(),
    });
    Err(ConnectionError::IncompatibleNetwork(reason))
}

async fn expect(receiver: &mut mpsc::Receiver<Message>, ack: bool) -> Result<PeerInfo, ConnectionError> {
    match receiver.recv().await {
        Some(Message::Handshake(info)) if !ack => Ok(info),
        Some(Message::HandshakeAck(info)) if ack => Ok(info),
        Some(Message::Close { code, reason }) => Err(ConnectionError::Refused(format!("{}: {}", code, reason))),
        Some(other) => Err(ConnectionError::Handshake(format!(
            "unexpected {} during handshake",
            other.type_name()
        ))),
        None => Err(ConnectionError::Reset),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::transport::MemoryNetwork;
    use std::net::IpAddr;

    fn info(last: u8, port: u16, network: &str) -> PeerInfo {
        PeerInfo {
            protocol_version: "1.1".to_string(),
            ..PeerInfo::new(IpAddr::from([10, 0, 0, last]), port)
                .with_network(network)
                .with_nonce(format!("nonce-{}", last))
        }
    }

    fn timeouts() -> HandshakeTimeouts {
        HandshakeTimeouts {
            connect: Duration::from_secs(1),
            ack: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn test_dial_and_accept_exchange_peer_info() {
        let network = MemoryNetwork::new();
        let server_info = info(1, 5000, "net");
        let client_info = info(2, 6000, "net");
        let mut inbound = network.transport(server_info.ip_address, 5000).listen().await.unwrap();

        let server_local = server_info.clone();
        let server = tokio::spawn(async move {
            let socket = inbound.recv().await.unwrap();
            accept(socket, server_local, Duration::from_secs(1)).await
        });

        let client = Arc::new(network.transport(client_info.ip_address, 6000));
        let dialed = dial(client, server_info.clone(), client_info.clone(), timeouts())
            .await
            .unwrap();
        let accepted = server.await.unwrap().unwrap();

        assert_eq!(dialed.peer_info.nonce.as_deref(), Some("nonce-1"));
        assert_eq!(dialed.peer_info.connection_kind, ConnectionKind::Outbound);
        assert_eq!(accepted.peer_info.peer_id(), client_info.peer_id());
        assert_eq!(accepted.peer_info.connection_kind, ConnectionKind::Inbound);
    }

    #[tokio::test]
    async fn test_incompatible_network_is_rejected() {
        let network = MemoryNetwork::new();
        let server_info = info(1, 5000, "main");
        let mut inbound = network.transport(server_info.ip_address, 5000).listen().await.unwrap();

        let server = tokio::spawn(async move {
            let socket = inbound.recv().await.unwrap();
            accept(socket, server_info, Duration::from_secs(1)).await
        });

        let client = Arc::new(network.transport(IpAddr::from([10, 0, 0, 2]), 6000));
        let result = dial(client, info(1, 5000, "main"), info(2, 6000, "test"), timeouts()).await;
        assert!(result.is_err());
        assert!(matches!(
            server.await.unwrap(),
            Err(ConnectionError::IncompatibleNetwork(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_hits_ack_timeout() {
        let network = MemoryNetwork::new();
        let mut inbound = network.transport(IpAddr::from([10, 0, 0, 1]), 5000).listen().await.unwrap();
        let holder = tokio::spawn(async move {
            let socket = inbound.recv().await;
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(socket);
        });

        let client = Arc::new(network.transport(IpAddr::from([10, 0, 0, 2]), 6000));
        let err = dial(client, info(1, 5000, "net"), info(2, 6000, "net"), timeouts())
            .await
            .unwrap_err();
        assert_eq!(err, ConnectionError::AckTimeout);
        holder.abort();
    }

    #[tokio::test]
    async fn test_dial_refused_without_listener() {
        let network = MemoryNetwork::new();
        let client = Arc::new(network.transport(IpAddr::from([10, 0, 0, 2]), 6000));
        let err = dial(client, info(1, 5000, "net"), info(2, 6000, "net"), timeouts())
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Refused(_)));
    }
}
