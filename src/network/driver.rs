//! The node event loop
//!
//! Every session task, the console and the dialer report to one channel.
//! Events are applied to the `Node` strictly one at a time.

use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;

use super::client::dial;
use super::server::Server;
use super::{NetworkConfig, NodeEvent};
use crate::overlay::{Node, NodeAction};
use crate::protocol::Id;
use crate::worker::WorkOutcome;

/// How long a stopping node waits for its sessions to flush.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Drives a node until it leaves the overlay, fails, or Ctrl-C.
pub struct Driver {
    node: Node,
    config: NetworkConfig,
    events: mpsc::UnboundedSender<NodeEvent>,
    inbox: mpsc::UnboundedReceiver<NodeEvent>,
    outcomes: mpsc::UnboundedReceiver<WorkOutcome>,
}

impl Driver {
    pub fn new(
        node: Node,
        config: NetworkConfig,
        outcomes: mpsc::UnboundedReceiver<WorkOutcome>,
    ) -> Self {
        let (events, inbox) = mpsc::unbounded_channel();
        Self {
            node,
            config,
            events,
            inbox,
            outcomes,
        }
    }

    /// Sender for anything that feeds the loop, such as the console.
    pub fn events(&self) -> mpsc::UnboundedSender<NodeEvent> {
        self.events.clone()
    }

    pub async fn run(mut self, server: Server, mother: Option<Id>) -> anyhow::Result<()> {
        let _listener = server.start(self.events.clone());
        tracing::info!("Node {} is up", self.node.id());

        if let Some(mother) = mother {
            let join = self.node.join(mother);
            self.perform(vec![join]);
        }

        loop {
            let flow = tokio::select! {
                Some(event) = self.inbox.recv() => self.handle(event)?,
                Some(outcome) = self.outcomes.recv() => {
                    self.node.on_work_outcome(outcome);
                    Flow::Continue
                }
                result = tokio::signal::ctrl_c() => {
                    result.context("Failed to listen for Ctrl-C")?;
                    tracing::info!("Interrupted, shutting down");
                    Flow::Stop
                }
            };
            if flow == Flow::Stop {
                break;
            }
        }

        self.drain().await;
        tracing::info!("Node {} stopped", self.node.id());
        Ok(())
    }

    fn handle(&mut self, event: NodeEvent) -> anyhow::Result<Flow> {
        let actions = match event {
            NodeEvent::Accepted(handle) => {
                self.node.session_opened(handle);
                Vec::new()
            }
            NodeEvent::Dialed { handle, peer, then } => {
                if let Err(e) = self.node.on_dialed(handle, peer, then) {
                    tracing::warn!("Dialed session to {} unusable: {}", peer, e);
                }
                Vec::new()
            }
            NodeEvent::DialFailed { peer, then } => self.node.dial_failed(peer, &then),
            NodeEvent::Packet { session, packet } => match self.node.on_packet(session, packet) {
                Ok(actions) => actions,
                Err(e) if e.is_fatal() => {
                    tracing::error!("{}", e);
                    return Err(e).context(format!("Session {} broke the protocol", session));
                }
                Err(e) => {
                    tracing::warn!("Session {}: {}", session, e);
                    Vec::new()
                }
            },
            NodeEvent::Closed { session, reason } => {
                tracing::warn!("Session {} closed: {}", session, reason);
                self.node.session_closed(session);
                Vec::new()
            }
            NodeEvent::Command(command) => {
                if let Err(e) = self.node.on_command(command) {
                    if e.is_fatal() {
                        return Err(e.into());
                    }
                    tracing::warn!("{}", e);
                }
                Vec::new()
            }
        };
        Ok(self.perform(actions))
    }

    fn perform(&mut self, actions: Vec<NodeAction>) -> Flow {
        let mut flow = Flow::Continue;
        for action in actions {
            match action {
                NodeAction::Dial { peer, then } => {
                    tracing::debug!("Dialing {} for {}", peer, then.name());
                    dial(peer, then, &self.config, self.events.clone());
                }
                NodeAction::Shutdown => flow = Flow::Stop,
            }
        }
        flow
    }

    /// Let session tasks flush what they queued before the runtime goes away.
    async fn drain(&mut self) {
        self.node.close_all();
        let wait = async {
            while self.node.open_sessions() > 0 {
                match self.inbox.recv().await {
                    Some(NodeEvent::Closed { session, .. }) => self.node.session_closed(session),
                    Some(NodeEvent::Accepted(handle)) => handle.close(),
                    Some(NodeEvent::Dialed { handle, .. }) => handle.close(),
                    Some(_) => {}
                    None => break,
                }
            }
        };
        if tokio::time::timeout(DRAIN_TIMEOUT, wait).await.is_err() {
            tracing::debug!("{} session(s) did not close in time", self.node.open_sessions());
        }
    }
}
