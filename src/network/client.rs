//! Outgoing sessions
//!
//! Used to join a mother and to reconnect to a new one after a leave.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use super::connection::run_session;
use super::{NetworkConfig, NodeEvent};
use crate::protocol::{Id, Packet};

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection timeout")]
    Timeout,
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Open a TCP connection to `addr` within `timeout`.
pub async fn connect(addr: SocketAddr, timeout: Duration) -> ClientResult<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| ClientError::Timeout)??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Dial `peer` in the background and report the outcome to the node loop.
pub fn dial(
    peer: Id,
    then: Packet,
    config: &NetworkConfig,
    events: mpsc::UnboundedSender<NodeEvent>,
) -> tokio::task::JoinHandle<()> {
    let timeout = config.connect_timeout();
    let buffer_size = config.read_buffer_size;
    tokio::spawn(async move {
        match connect(peer.addr(), timeout).await {
            Ok(stream) => {
                tracing::debug!("Connected to {}", peer);
                run_session(stream, peer.addr(), buffer_size, events, move |handle| {
                    NodeEvent::Dialed { handle, peer, then }
                })
                .await;
            }
            Err(e) => {
                tracing::warn!("Failed to connect to {}: {}", peer, e);
                let _ = events.send(NodeEvent::DialFailed { peer, then });
            }
        }
    })
}
