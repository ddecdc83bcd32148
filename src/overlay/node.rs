//! The local node
//!
//! `Node` owns the routing table, the state of every open session and the
//! three protocol machines. The network driver feeds it events one at a time
//! and carries out the actions it returns.

use std::collections::HashMap;

use super::join;
use super::leave::Disconnector;
use super::routes::RoutingTable;
use super::session::{SessionHandle, SessionId};
use super::work::Dispatcher;
use super::{OverlayError, OverlayResult, ProtocolState};
use crate::console::Command;
use crate::protocol::{ConnectionPacket, DisconnectionPacket, Id, Packet};
use crate::worker::WorkOutcome;

/// I/O the driver must perform on behalf of the node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeAction {
    /// Open a connection to `peer`, then hand it to `Node::on_dialed`.
    Dial { peer: Id, then: Packet },
    Shutdown,
}

#[derive(Debug)]
struct Slot {
    handle: SessionHandle,
    state: ProtocolState,
}

pub struct Node {
    routes: RoutingTable,
    sessions: HashMap<SessionId, Slot>,
    leave: Disconnector,
    work: Dispatcher,
    leaving: bool,
}

impl Node {
    pub fn new(me: Id, work: Dispatcher) -> Self {
        Self {
            routes: RoutingTable::new(me),
            sessions: HashMap::new(),
            leave: Disconnector::new(),
            work,
            leaving: false,
        }
    }

    pub fn id(&self) -> Id {
        self.routes.me()
    }

    pub fn routes(&self) -> &RoutingTable {
        &self.routes
    }

    pub fn is_leaving(&self) -> bool {
        self.leaving
    }

    pub fn open_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Ask every session to hang up once its queue is flushed.
    pub fn close_all(&self) {
        for slot in self.sessions.values() {
            slot.handle.close();
        }
    }

    /// The dial that makes this node a daughter of `mother`.
    pub fn join(&self, mother: Id) -> NodeAction {
        NodeAction::Dial {
            peer: mother,
            then: ConnectionPacket::Connect { daughter: self.id() }.into(),
        }
    }

    pub fn session_opened(&mut self, handle: SessionHandle) {
        tracing::debug!("Session {} opened", handle.id());
        self.sessions.insert(
            handle.id(),
            Slot {
                handle,
                state: ProtocolState::Connecting,
            },
        );
    }

    /// A connection opened for `NodeAction::Dial` is up.
    pub fn on_dialed(
        &mut self,
        handle: SessionHandle,
        peer: Id,
        then: Packet,
    ) -> OverlayResult<()> {
        if !self.sessions.contains_key(&handle.id()) {
            self.session_opened(handle.clone());
        }
        if let Packet::Disconnection(DisconnectionPacket::Reconnect { .. }) = &then {
            let old = self.routes.mother();
            self.routes.remove(old);
            self.routes.find_and_replace(old, peer);
            self.routes.add(peer, peer, &handle);
            self.routes.set_mother(peer);
        }
        handle.send(then)
    }

    /// A `NodeAction::Dial` could not connect.
    pub fn dial_failed(&mut self, peer: Id, then: &Packet) -> Vec<NodeAction> {
        match then {
            Packet::Connection(ConnectionPacket::Connect { .. }) => {
                tracing::error!("Could not join the overlay through {}", peer);
                vec![NodeAction::Shutdown]
            }
            _ => {
                tracing::error!("Could not reach new mother {}", peer);
                Vec::new()
            }
        }
    }

    /// Apply a packet received on `session`.
    pub fn on_packet(
        &mut self,
        session: SessionId,
        packet: Packet,
    ) -> OverlayResult<Vec<NodeAction>> {
        let Some(slot) = self.sessions.get(&session) else {
            tracing::warn!("{} arrived on unknown session {}", packet.name(), session);
            return Ok(Vec::new());
        };
        let handle = slot.handle.clone();
        let state = if self.leaving {
            ProtocolState::Disconnecting
        } else {
            slot.state
        };
        tracing::debug!("{} on session {} in state {:?}", packet.name(), session, state);

        let mut actions = Vec::new();
        let next = match packet {
            Packet::Connection(packet) => join::process(&handle, packet, &mut self.routes, state)?,
            Packet::Disconnection(packet) => {
                if let DisconnectionPacket::PleaseReconnect { mother } = &packet {
                    // Our subtree moves along with us.
                    let reconnect = DisconnectionPacket::Reconnect {
                        id: self.id(),
                        ancestors: self.routes.subtree(),
                    };
                    actions.push(NodeAction::Dial {
                        peer: *mother,
                        then: reconnect.into(),
                    });
                }
                self.leave.process(&handle, packet, &mut self.routes, state)?
            }
            Packet::Work(packet) => self.work.process(&handle, packet, &mut self.routes, state)?,
        };

        match next {
            ProtocolState::Disconnecting => self.leaving = true,
            ProtocolState::DisconnectionDenied => self.leaving = false,
            ProtocolState::Refused => {
                handle.close();
                actions.push(NodeAction::Shutdown);
            }
            ProtocolState::Closed => {
                self.close_all();
                actions.push(NodeAction::Shutdown);
            }
            _ => {}
        }
        if next != state {
            if let Some(slot) = self.sessions.get_mut(&session) {
                slot.state = next;
            }
        }
        Ok(actions)
    }

    pub fn session_closed(&mut self, session: SessionId) {
        let Some(slot) = self.sessions.remove(&session) else {
            return;
        };
        slot.handle.mark_disconnected();
        let detached = self.routes.detach(session);
        for peer in &detached {
            self.work.forget(*peer, &self.routes);
            self.leave.peer_lost(*peer, &mut self.routes);
        }
        if detached.contains(&self.routes.mother()) && !self.leaving {
            tracing::warn!("Lost the link to mother {}", self.routes.mother());
        }
        tracing::debug!("Session {} closed ({:?})", session, slot.state);
    }

    pub fn on_command(&mut self, command: Command) -> OverlayResult<()> {
        match command {
            Command::Start(start) => {
                let request_id = self.work.start(start, &self.routes);
                tracing::info!("Started request {}", request_id);
            }
            Command::Disconnect => {
                if self.routes.is_root() {
                    return Err(OverlayError::RootCannotLeave);
                }
                if self.leaving {
                    return Err(OverlayError::AlreadyLeaving);
                }
                let mother = self.routes.mother();
                let request = DisconnectionPacket::Request {
                    daughters: self.routes.daughters_for_disconnection(),
                };
                if !self.routes.send_to(mother, request) {
                    return Err(OverlayError::Unreachable(mother));
                }
                self.leaving = true;
                tracing::info!("Asked {} to leave the overlay", mother);
            }
            Command::Routes => tracing::info!("{}", self.routes),
        }
        Ok(())
    }

    pub fn on_work_outcome(&mut self, outcome: WorkOutcome) {
        self.work.on_outcome(outcome, &self.routes);
    }
}
