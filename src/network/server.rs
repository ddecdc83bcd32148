//! Overlay listener
//!
//! Accepts sessions from daughters and reconnecting nodes and announces each
//! one to the node loop.

use std::net::SocketAddr;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use super::connection::run_session;
use super::{NetworkConfig, NodeEvent};

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bind failed: {0}")]
    BindFailed(String),
}

pub type ServerResult<T> = Result<T, ServerError>;

/// Bound listener, not yet accepting
pub struct Server {
    listener: TcpListener,
    config: NetworkConfig,
}

impl Server {
    pub async fn bind(config: NetworkConfig) -> ServerResult<Self> {
        let listener = TcpListener::bind(config.listen).await.map_err(|e| {
            ServerError::BindFailed(format!("Failed to bind to {}: {}", config.listen, e))
        })?;
        tracing::info!("Listening on {}", listener.local_addr()?);
        Ok(Self { listener, config })
    }

    pub fn local_addr(&self) -> ServerResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Spawn the accept loop; it stops once the node loop is gone.
    pub fn start(self, events: mpsc::UnboundedSender<NodeEvent>) -> tokio::task::JoinHandle<()> {
        let buffer_size = self.config.read_buffer_size;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = self.listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                tracing::debug!("New connection from {}", addr);
                                let _ = stream.set_nodelay(true);
                                let events = events.clone();
                                tokio::spawn(run_session(
                                    stream,
                                    addr,
                                    buffer_size,
                                    events,
                                    NodeEvent::Accepted,
                                ));
                            }
                            Err(e) => {
                                tracing::error!("Accept error: {}", e);
                            }
                        }
                    }
                    _ = events.closed() => {
                        tracing::debug!("Listener stopped");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ConnectionPacket, Encode, Id, Packet};
    use bytes::BytesMut;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn test_accepted_session_reaches_node_loop() {
        let config = NetworkConfig::new(SocketAddr::from(([127, 0, 0, 1], 0)));
        let server = Server::bind(config).await.unwrap();
        let addr = server.local_addr().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _accept = server.start(tx);

        let packet = Packet::from(ConnectionPacket::Connect {
            daughter: Id::new(SocketAddr::from(([127, 0, 0, 1], 9))),
        });
        let mut buf = BytesMut::new();
        packet.write(&mut buf);
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&buf).await.unwrap();

        assert!(matches!(rx.recv().await, Some(NodeEvent::Accepted(_))));
        match rx.recv().await {
            Some(NodeEvent::Packet { packet: received, .. }) => assert_eq!(received, packet),
            other => panic!("unexpected event {:?}", other),
        }

        drop(client);
        assert!(matches!(rx.recv().await, Some(NodeEvent::Closed { .. })));
    }
}
