//! Handles to open peer sessions

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use super::{OverlayError, OverlayResult};
use crate::protocol::Packet;

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// Process-unique session number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub fn next() -> Self {
        Self(NEXT_SESSION.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a session task is asked to do next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Packet(Packet),
    Close,
}

/// A handle for queueing packets on one connection
///
/// Queueing never blocks; the connection task is woken by the channel.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    id: SessionId,
    sender: mpsc::UnboundedSender<Outbound>,
    connected: Arc<AtomicBool>,
}

impl SessionHandle {
    pub fn new(sender: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            id: SessionId::next(),
            sender,
            connected: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Create a handle together with the receiving end of its queue.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Queue a packet for this connection
    pub fn send(&self, packet: impl Into<Packet>) -> OverlayResult<()> {
        if !self.is_connected() {
            return Err(OverlayError::SessionClosed(self.id));
        }

        self.sender
            .send(Outbound::Packet(packet.into()))
            .map_err(|_| OverlayError::SessionClosed(self.id))
    }

    /// Ask the connection task to flush what is queued and hang up.
    pub fn close(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.sender.send(Outbound::Close);
        }
    }

    /// Check if the connection is still active
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.sender.is_closed()
    }

    /// Mark the connection as disconnected
    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}
