//! Routing table of the local node
//!
//! Every known peer maps to the neighbour that leads to it. Neighbours that
//! have an open connection also carry its session handle; peers behind them
//! share it through their next hop.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use super::session::{SessionHandle, SessionId};
use crate::protocol::{Id, Packet};

/// Next hops, mother pointer and sessions
#[derive(Debug, Clone)]
pub struct RoutingTable {
    me: Id,
    mother: Id,
    routes: HashMap<Id, Id>,
    sessions: HashMap<Id, SessionHandle>,
}

impl RoutingTable {
    pub fn new(me: Id) -> Self {
        let mut routes = HashMap::new();
        routes.insert(me, me);
        Self {
            me,
            mother: me,
            routes,
            sessions: HashMap::new(),
        }
    }

    pub fn me(&self) -> Id {
        self.me
    }

    pub fn mother(&self) -> Id {
        self.mother
    }

    pub fn is_root(&self) -> bool {
        self.mother == self.me
    }

    pub fn set_mother(&mut self, mother: Id) {
        if mother != self.mother {
            tracing::info!("Mother of {} is now {}", self.me, mother);
            self.mother = mother;
        }
    }

    /// Route `peer` through `next_hop`, reached over `session`. Last write wins.
    pub fn add(&mut self, peer: Id, next_hop: Id, session: &SessionHandle) {
        if peer == self.me || next_hop == self.me {
            return;
        }
        self.routes.insert(peer, next_hop);
        self.sessions.insert(next_hop, session.clone());
    }

    /// Forget `peer` and its session, if it had one.
    pub fn remove(&mut self, peer: Id) {
        if peer == self.me {
            return;
        }
        self.routes.remove(&peer);
        self.sessions.remove(&peer);
    }

    pub fn next_hop(&self, peer: Id) -> Option<Id> {
        self.routes.get(&peer).copied()
    }

    pub fn contains(&self, peer: Id) -> bool {
        self.routes.contains_key(&peer)
    }

    /// Session leading to `peer`, if the link is up.
    pub fn session_for(&self, peer: Id) -> Option<&SessionHandle> {
        self.routes
            .get(&peer)
            .and_then(|hop| self.sessions.get(hop))
    }

    /// Neighbour whose session is `session`.
    pub fn peer_of(&self, session: SessionId) -> Option<Id> {
        self.sessions
            .iter()
            .find(|(_, handle)| handle.id() == session)
            .map(|(id, _)| *id)
    }

    /// Distinct next hops other than self, sorted.
    pub fn neighbours(&self) -> Vec<Id> {
        let hops: BTreeSet<Id> = self
            .routes
            .values()
            .copied()
            .filter(|hop| *hop != self.me)
            .collect();
        hops.into_iter().collect()
    }

    /// Neighbours other than the mother.
    pub fn daughters(&self) -> Vec<Id> {
        let mother = self.mother;
        self.neighbours()
            .into_iter()
            .filter(|hop| *hop != mother)
            .collect()
    }

    /// Self followed by every daughter, as carried by a leave request.
    pub fn daughters_for_disconnection(&self) -> Vec<Id> {
        let mut ids = vec![self.me];
        ids.extend(self.daughters());
        ids
    }

    /// Every peer reached through a daughter, daughters included.
    pub fn subtree(&self) -> Vec<Id> {
        let mut ids: Vec<Id> = self
            .routes
            .iter()
            .filter(|(_, hop)| **hop != self.me && **hop != self.mother)
            .map(|(peer, _)| *peer)
            .collect();
        ids.sort();
        ids
    }

    /// Every known peer, self included.
    pub fn all_ids(&self) -> Vec<Id> {
        let mut ids: Vec<Id> = self.routes.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Queue `packet` towards `peer`. Returns false when there is no live
    /// session on the way.
    pub fn send_to(&self, peer: Id, packet: impl Into<Packet>) -> bool {
        let Some(session) = self.session_for(peer) else {
            tracing::debug!("No session towards {}, dropping packet", peer);
            return false;
        };
        match session.send(packet) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("Cannot reach {}: {}", peer, e);
                false
            }
        }
    }

    /// Queue `packet` on every neighbour for which `exclude` is false.
    pub fn send_to_neighbours(&self, packet: impl Into<Packet>, exclude: impl Fn(Id) -> bool) {
        let packet = packet.into();
        for neighbour in self.neighbours() {
            if !exclude(neighbour) {
                self.send_to(neighbour, packet.clone());
            }
        }
    }

    pub fn send_to_daughters(&self, packet: impl Into<Packet>) {
        let mother = self.mother;
        self.send_to_neighbours(packet, |id| id == mother);
    }

    /// Point everything that went through `old` at `new` instead.
    pub fn find_and_replace(&mut self, old: Id, new: Id) {
        if old == self.me || new == self.me {
            return;
        }
        for (peer, hop) in self.routes.iter_mut() {
            if *hop == old && *peer != self.me {
                *hop = new;
            }
        }
        if self.sessions.contains_key(&new) {
            self.sessions.remove(&old);
        }
    }

    /// Drop the handle of a closed session. Routes through it stay until a
    /// topology change removes them.
    pub fn detach(&mut self, session: SessionId) -> Vec<Id> {
        let detached: Vec<Id> = self
            .sessions
            .iter()
            .filter(|(_, handle)| handle.id() == session)
            .map(|(id, _)| *id)
            .collect();
        for id in &detached {
            self.sessions.remove(id);
        }
        detached
    }
}

impl fmt::Display for RoutingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Routes of {} (mother {})", self.me, self.mother)?;
        let mut entries: Vec<_> = self.routes.iter().collect();
        entries.sort();
        for (peer, hop) in entries {
            let link = if self.sessions.contains_key(hop) || hop == &self.me {
                ""
            } else {
                " (no link)"
            };
            writeln!(f, "  {} -> {}{}", peer, hop, link)?;
        }
        Ok(())
    }
}
