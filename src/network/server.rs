//! TCP transport and message framing
//!
//! Each TCP stream is bridged onto a [`Socket`]: a writer task drains the
//! socket's outgoing channel into the framed stream and a reader task pushes
//! decoded frames onto its incoming channel.

use crate::network::error::{ConnectionError, NetworkError};
use crate::network::message::{Message, MAGIC, MAX_MESSAGE_SIZE};
use crate::network::transport::{Socket, Transport, SOCKET_BUFFER};
use bytes::{Buf, BufMut, BytesMut};
use futures::future::BoxFuture;
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder, Framed};

/// Message codec for length-prefixed framing
pub struct MessageCodec;

impl Encoder<Message> for MessageCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let data = item
            .to_bytes()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;

        if data.len() > MAX_MESSAGE_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Message of {} bytes exceeds the frame limit", data.len()),
            ));
        }

        // Magic (4) + Length (4) + Data
        dst.reserve(8 + data.len());
        dst.put_slice(&MAGIC);
        dst.put_u32(data.len() as u32);
        dst.put_slice(&data);

        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least header
        if src.len() < 8 {
            return Ok(None);
        }

        // Check magic
        if src[..4] != MAGIC {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "Invalid magic bytes",
            ));
        }

        // Get length
        let len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Frame of {} bytes exceeds the limit", len),
            ));
        }

        // Check if we have full message
        if src.len() < 8 + len {
            src.reserve(8 + len - src.len());
            return Ok(None);
        }

        // Skip header
        src.advance(8);

        // Extract message data
        let data = src.split_to(len);

        // Deserialize
        let msg = Message::from_bytes(&data)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;

        Ok(Some(msg))
    }
}

/// Stream-based transport over TCP
#[derive(Debug, Clone)]
pub struct TcpTransport {
    bind_addr: SocketAddr,
    next_id: Arc<AtomicU64>,
}

impl TcpTransport {
    pub fn new(host: IpAddr, port: u16) -> Self {
        Self {
            bind_addr: SocketAddr::new(host, port),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    fn next_socket_id(&self, peer: &SocketAddr) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        format!("tcp-{}-{}", n, peer)
    }
}

impl Transport for TcpTransport {
    fn connect(&self, ip: IpAddr, port: u16) -> BoxFuture<'static, Result<Socket, ConnectionError>> {
        let transport = self.clone();
        Box::pin(async move {
            let stream = TcpStream::connect(SocketAddr::new(ip, port))
                .await
                .map_err(|e| ConnectionError::Refused(e.to_string()))?;
            let peer_addr = stream
                .peer_addr()
                .map_err(|e| ConnectionError::Refused(e.to_string()))?;
            let id = transport.next_socket_id(&peer_addr);
            Ok(bridge_stream(stream, peer_addr, id))
        })
    }

    fn listen(&self) -> BoxFuture<'static, Result<mpsc::Receiver<Socket>, NetworkError>> {
        let transport = self.clone();
        Box::pin(async move {
            let listener = TcpListener::bind(transport.bind_addr).await?;
            log::info!("Server listening on {}", transport.bind_addr);

            let (tx, rx) = mpsc::channel(SOCKET_BUFFER);
            tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, peer_addr)) => {
                            let id = transport.next_socket_id(&peer_addr);
                            if tx.send(bridge_stream(stream, peer_addr, id)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            log::warn!("Failed to accept connection: {}", e);
                        }
                    }
                }
                log::debug!("Listener on {} stopped", transport.bind_addr);
            });
            Ok(rx)
        })
    }
}

/// Spawn reader and writer tasks connecting a TCP stream to a [`Socket`]
fn bridge_stream(stream: TcpStream, peer_addr: SocketAddr, id: String) -> Socket {
    let framed = Framed::new(stream, MessageCodec);
    let (mut writer, mut reader) = framed.split();

    let (out_tx, mut out_rx) = mpsc::channel::<Message>(SOCKET_BUFFER);
    let (in_tx, in_rx) = mpsc::channel::<Message>(SOCKET_BUFFER);

    let read_handle = tokio::spawn(async move {
        loop {
            match reader.next().await {
                Some(Ok(msg)) => {
                    if in_tx.send(msg).await.is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    log::warn!("Error reading from {}: {}", peer_addr, e);
                    break;
                }
                None => {
                    log::debug!("Peer {} closed the stream", peer_addr);
                    break;
                }
            }
        }
    });

    tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if let Err(e) = writer.send(msg).await {
                log::warn!("Error writing to {}: {}", peer_addr, e);
                break;
            }
        }
        // Sender side dropped: the session is over
        let _ = writer.close().await;
        read_handle.abort();
    });

    Socket {
        id,
        remote_ip: peer_addr.ip(),
        remote_port: peer_addr.port(),
        sender: out_tx,
        receiver: in_rx,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_codec() {
        let mut codec = MessageCodec;
        let msg = Message::Ping(12345);

        let mut buf = BytesMut::new();
        codec.encode(msg, &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Message::Ping(12345));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_codec_waits_for_full_frame() {
        let mut codec = MessageCodec;
        let mut full = BytesMut::new();
        codec.encode(Message::Pong(7), &mut full).unwrap();

        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&full[full.len() - 1..]);
        assert_eq!(codec.decode(&mut partial).unwrap(), Some(Message::Pong(7)));
    }

    #[test]
    fn test_codec_rejects_bad_magic_and_oversized_frames() {
        let mut codec = MessageCodec;
        let mut bad = BytesMut::from(&b"XXXX\0\0\0\x01{"[..]);
        assert!(codec.decode(&mut bad).is_err());

        let mut huge = BytesMut::new();
        huge.put_slice(&MAGIC);
        huge.put_u32((MAX_MESSAGE_SIZE + 1) as u32);
        assert!(codec.decode(&mut huge).is_err());
    }

    #[tokio::test]
    async fn test_tcp_transport_round_trip() {
        let localhost: IpAddr = "127.0.0.1".parse().unwrap();
        let listener = std::net::TcpListener::bind((localhost, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let server = TcpTransport::new(localhost, port);
        let mut inbound = server.listen().await.unwrap();

        let client = TcpTransport::new(localhost, 0);
        let mut dialed = client.connect(localhost, port).await.unwrap();
        let mut accepted = inbound.recv().await.unwrap();

        dialed.sender.send(Message::Ping(1)).await.unwrap();
        assert_eq!(accepted.receiver.recv().await, Some(Message::Ping(1)));
        accepted.sender.send(Message::Pong(1)).await.unwrap();
        assert_eq!(dialed.receiver.recv().await, Some(Message::Pong(1)));
    }
}
