//! Connection handling for overlay sessions
//!
//! Manages individual peer connections, including:
//! - Incremental packet decoding from the byte stream
//! - Packet encoding
//! - The per-session task bridging the socket and the node loop

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use super::NodeEvent;
use crate::overlay::{Outbound, SessionHandle};
use crate::protocol::{Decode, Encode, Packet, PacketDecoder};

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] crate::protocol::CodecError),

    #[error("Connection closed in the middle of a packet")]
    Truncated,

    #[error("Connection timeout")]
    Timeout,
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Connection statistics
#[derive(Debug, Default, Clone)]
pub struct ConnectionStats {
    /// Packets sent
    pub packets_sent: u64,
    /// Packets received
    pub packets_received: u64,
    /// Bytes sent
    pub bytes_sent: u64,
    /// Bytes received
    pub bytes_received: u64,
}

/// One peer connection over any byte stream
pub struct Connection<S> {
    /// Remote peer address
    remote_addr: SocketAddr,
    stream: S,
    decoder: PacketDecoder,
    read_buf: BytesMut,
    write_buf: BytesMut,
    /// Last activity timestamp
    last_activity: Instant,
    stats: ConnectionStats,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Connection<S> {
    pub fn new(stream: S, remote_addr: SocketAddr, buffer_size: usize) -> Self {
        Self {
            remote_addr,
            stream,
            decoder: PacketDecoder::new(),
            read_buf: BytesMut::with_capacity(buffer_size),
            write_buf: BytesMut::with_capacity(buffer_size),
            last_activity: Instant::now(),
            stats: ConnectionStats::default(),
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Time since a packet last went in or out
    pub fn idle_time(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Encode and write one packet
    pub async fn send(&mut self, packet: &Packet) -> ConnectionResult<()> {
        self.write_buf.clear();
        self.write_buf.reserve(packet.size());
        packet.write(&mut self.write_buf);

        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;

        self.stats.packets_sent += 1;
        self.stats.bytes_sent += self.write_buf.len() as u64;
        self.last_activity = Instant::now();
        Ok(())
    }

    /// Receive the next packet; `None` once the peer closed cleanly.
    ///
    /// Cancel safe: bytes already read stay buffered for the next call.
    pub async fn recv(&mut self) -> ConnectionResult<Option<Packet>> {
        loop {
            if let Some(packet) = self.decoder.decode(&mut self.read_buf)? {
                self.stats.packets_received += 1;
                self.last_activity = Instant::now();
                return Ok(Some(packet));
            }

            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                if self.read_buf.is_empty() && !self.decoder.in_progress() {
                    return Ok(None);
                }
                return Err(ConnectionError::Truncated);
            }
            self.stats.bytes_received += n as u64;
        }
    }

    pub async fn shutdown(&mut self) -> ConnectionResult<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// Run one session until either side hangs up.
///
/// `opened` builds the event announcing the session to the node loop; it is
/// always delivered before the first packet of the session.
pub async fn run_session<S, F>(
    stream: S,
    remote_addr: SocketAddr,
    buffer_size: usize,
    events: mpsc::UnboundedSender<NodeEvent>,
    opened: F,
) where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnOnce(SessionHandle) -> NodeEvent,
{
    let mut conn = Connection::new(stream, remote_addr, buffer_size);
    let (handle, mut outbound) = SessionHandle::channel();
    let session = handle.id();
    if events.send(opened(handle.clone())).is_err() {
        return;
    }

    let reason = loop {
        tokio::select! {
            result = conn.recv() => {
                match result {
                    Ok(Some(packet)) => {
                        if events.send(NodeEvent::Packet { session, packet }).is_err() {
                            break "node loop stopped".to_string();
                        }
                    }
                    Ok(None) => break "closed by peer".to_string(),
                    Err(e) => {
                        tracing::warn!("Session {} with {}: {}", session, remote_addr, e);
                        break e.to_string();
                    }
                }
            }

            next = outbound.recv() => {
                match next {
                    Some(Outbound::Packet(packet)) => {
                        if let Err(e) = conn.send(&packet).await {
                            tracing::warn!("Session {} with {}: send failed: {}", session, remote_addr, e);
                            break e.to_string();
                        }
                    }
                    Some(Outbound::Close) | None => {
                        let _ = conn.shutdown().await;
                        break "closed locally".to_string();
                    }
                }
            }
        }
    };

    handle.mark_disconnected();
    tracing::debug!(
        "Session {} with {} ended: {} ({} packets in, {} out)",
        session,
        remote_addr,
        reason,
        conn.stats().packets_received,
        conn.stats().packets_sent
    );
    let _ = events.send(NodeEvent::Closed { session, reason });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ConnectionPacket, DisconnectionPacket, Id};
    use tokio_test::io::Builder;

    fn addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 7000))
    }

    fn bytes(packet: &Packet) -> Vec<u8> {
        let mut buf = BytesMut::new();
        packet.write(&mut buf);
        buf.to_vec()
    }

    #[tokio::test]
    async fn test_recv_across_reads() {
        let packet = Packet::from(ConnectionPacket::ConnectOk {
            mother: Id::new(addr()),
            ids: vec![Id::new(addr())],
        });
        let encoded = bytes(&packet);
        let (head, tail) = encoded.split_at(5);

        let stream = Builder::new().read(head).read(tail).build();
        let mut conn = Connection::new(stream, addr(), 64);

        assert_eq!(conn.recv().await.unwrap(), Some(packet));
        assert_eq!(conn.recv().await.unwrap(), None);
        assert_eq!(conn.stats().packets_received, 1);
        assert_eq!(conn.stats().bytes_received, encoded.len() as u64);
    }

    #[tokio::test]
    async fn test_send_writes_encoding() {
        let packet = Packet::from(DisconnectionPacket::Granted);
        let stream = Builder::new().write(&bytes(&packet)).build();
        let mut conn = Connection::new(stream, addr(), 64);

        conn.send(&packet).await.unwrap();
        assert_eq!(conn.stats().packets_sent, 1);
    }

    #[tokio::test]
    async fn test_truncated_packet() {
        let encoded = bytes(&Packet::from(ConnectionPacket::Connect {
            daughter: Id::new(addr()),
        }));
        let stream = Builder::new().read(&encoded[..4]).build();
        let mut conn = Connection::new(stream, addr(), 64);

        assert!(matches!(conn.recv().await, Err(ConnectionError::Truncated)));
    }

    #[tokio::test]
    async fn test_malformed_input() {
        let stream = Builder::new().read(&[9, 0, 0]).build();
        let mut conn = Connection::new(stream, addr(), 64);
        assert!(matches!(conn.recv().await, Err(ConnectionError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_session_forwards_packets() {
        let packet = Packet::from(DisconnectionPacket::Denied);
        let stream = Builder::new().read(&bytes(&packet)).build();
        let (tx, mut rx) = mpsc::unbounded_channel();

        run_session(stream, addr(), 64, tx, NodeEvent::Accepted).await;

        let NodeEvent::Accepted(handle) = rx.recv().await.unwrap() else {
            panic!("session must be announced first");
        };
        match rx.recv().await.unwrap() {
            NodeEvent::Packet { session, packet: received } => {
                assert_eq!(session, handle.id());
                assert_eq!(received, packet);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(rx.recv().await.unwrap(), NodeEvent::Closed { .. }));
        assert!(!handle.is_connected());
    }
}
