//! Network module - Handles TCP communication between overlay nodes
//!
//! Provides:
//! - Server for accepting incoming sessions
//! - Dialing out to mothers
//! - Connection management and the node event loop

mod client;
mod connection;
mod driver;
mod server;

pub use client::*;
pub use connection::*;
pub use driver::*;
pub use server::*;

use std::net::SocketAddr;
use std::time::Duration;

use crate::console::Command;
use crate::overlay::{SessionHandle, SessionId};
use crate::protocol::{Id, Packet};

/// Configuration for network operations
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Address to listen on
    pub listen: SocketAddr,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Initial size of per-session buffers
    pub read_buffer_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], crate::protocol::DEFAULT_PORT)),
            connect_timeout_ms: 5000,
            read_buffer_size: 4096,
        }
    }
}

impl NetworkConfig {
    pub fn new(listen: SocketAddr) -> Self {
        Self {
            listen,
            ..Default::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Everything the node loop reacts to
#[derive(Debug)]
pub enum NodeEvent {
    /// A peer connected to our listener
    Accepted(SessionHandle),
    /// A connection we dialed is up
    Dialed {
        handle: SessionHandle,
        peer: Id,
        then: Packet,
    },
    DialFailed {
        peer: Id,
        then: Packet,
    },
    Packet {
        session: SessionId,
        packet: Packet,
    },
    Closed {
        session: SessionId,
        reason: String,
    },
    Command(Command),
}

/// Resolve a `host:port` string to a socket address
pub async fn resolve_host(host: &str) -> std::io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    let mut addrs = lookup_host(host).await?;

    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        )
    })
}
