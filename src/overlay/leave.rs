//! Graceful leave and reparenting
//!
//! The leaver asks its mother for permission. Once granted, the leaver's
//! daughters reconnect to that mother, and when the last one is in, the
//! mother floods `Disconnected` so everyone drops the leaver.

use std::collections::HashSet;

use super::routes::RoutingTable;
use super::session::SessionHandle;
use super::{OverlayError, OverlayResult, ProtocolState};
use crate::protocol::{DisconnectionPacket, Id};

/// Mother-side bookkeeping for the one disconnection being serviced.
#[derive(Debug, Default)]
pub struct Disconnector {
    leaver: Option<Id>,
    expected: HashSet<Id>,
}

impl Disconnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// The daughter currently leaving through this node, if any.
    pub fn leaver(&self) -> Option<Id> {
        self.leaver
    }

    /// Apply one disconnection-family packet received on `session`.
    pub fn process(
        &mut self,
        session: &SessionHandle,
        packet: DisconnectionPacket,
        routes: &mut RoutingTable,
        state: ProtocolState,
    ) -> OverlayResult<ProtocolState> {
        match packet {
            DisconnectionPacket::Request { daughters } => {
                self.on_request(session, daughters, routes, state)?;
                Ok(state)
            }
            DisconnectionPacket::Denied => {
                tracing::warn!("Disconnection denied by {}", routes.mother());
                Ok(ProtocolState::DisconnectionDenied)
            }
            DisconnectionPacket::Granted => {
                let mother = routes.mother();
                tracing::info!("Disconnection granted, handing daughters over to {}", mother);
                routes.send_to_daughters(DisconnectionPacket::PleaseReconnect { mother });
                Ok(ProtocolState::Disconnecting)
            }
            DisconnectionPacket::PleaseReconnect { mother } => {
                tracing::info!("Asked to reconnect to {}", mother);
                Ok(ProtocolState::Reconnecting)
            }
            DisconnectionPacket::Reconnect { id, ancestors } => {
                if !self.expected.remove(&id) {
                    tracing::warn!("Ignoring unexpected Reconnect from {}", id);
                    return Ok(state);
                }
                routes.add(id, id, session);
                for ancestor in ancestors {
                    routes.add(ancestor, id, session);
                }
                tracing::info!("{} reconnected", id);
                if self.expected.is_empty() {
                    self.complete(routes);
                }
                Ok(ProtocolState::Connected)
            }
            DisconnectionPacket::Disconnected { source, leaver } => {
                if leaver == routes.me() {
                    tracing::info!("Left the overlay");
                    return Ok(ProtocolState::Closed);
                }
                routes.remove(leaver);
                routes.find_and_replace(leaver, source);
                let from = routes.peer_of(session.id());
                routes.send_to_neighbours(
                    DisconnectionPacket::Disconnected { source, leaver },
                    |id| Some(id) == from || id == leaver,
                );
                tracing::info!("{} left the overlay", leaver);
                Ok(state)
            }
        }
    }

    /// The link to `peer` is gone. If `peer` was leaving through us, its
    /// daughters can no longer be told to come over, so stop waiting for them.
    pub fn peer_lost(&mut self, peer: Id, routes: &mut RoutingTable) {
        if self.leaver != Some(peer) {
            return;
        }
        if !self.expected.is_empty() {
            tracing::warn!(
                "{} dropped before {} daughter(s) reconnected, giving up on them",
                peer,
                self.expected.len()
            );
            self.expected.clear();
        }
        self.complete(routes);
    }

    fn on_request(
        &mut self,
        session: &SessionHandle,
        daughters: Vec<Id>,
        routes: &mut RoutingTable,
        state: ProtocolState,
    ) -> OverlayResult<()> {
        if state == ProtocolState::Disconnecting || self.leaver.is_some() {
            tracing::info!("Denying disconnection: another one is in progress");
            session.send(DisconnectionPacket::Denied)?;
            return Ok(());
        }
        let Some((&leaver, rest)) = daughters.split_first() else {
            return Err(OverlayError::ProtocolViolation(
                "disconnection request without a leaver".to_string(),
            ));
        };

        self.leaver = Some(leaver);
        self.expected = rest.iter().copied().collect();
        session.send(DisconnectionPacket::Granted)?;
        tracing::info!(
            "Granted disconnection of {}, waiting for {} daughter(s)",
            leaver,
            self.expected.len()
        );

        if self.expected.is_empty() {
            self.complete(routes);
        }
        Ok(())
    }

    fn complete(&mut self, routes: &mut RoutingTable) {
        let Some(leaver) = self.leaver.take() else {
            return;
        };
        let me = routes.me();
        routes.send_to_neighbours(DisconnectionPacket::Disconnected { source: me, leaver }, |_| {
            false
        });
        routes.remove(leaver);
        tracing::info!("{} removed from the overlay", leaver);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::Outbound;
    use crate::protocol::Packet;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn id(port: u16) -> Id {
        Id::new(std::net::SocketAddr::from(([127, 0, 0, 1], port)))
    }

    fn drain(rx: &mut UnboundedReceiver<Outbound>) -> Vec<Packet> {
        let mut packets = Vec::new();
        while let Ok(Outbound::Packet(p)) = rx.try_recv() {
            packets.push(p);
        }
        packets
    }

    #[test]
    fn test_leaf_leaves_immediately() {
        let mut routes = RoutingTable::new(id(1));
        let (leaf, mut leaf_rx) = SessionHandle::channel();
        routes.add(id(2), id(2), &leaf);

        let mut disconnector = Disconnector::new();
        disconnector
            .process(
                &leaf,
                DisconnectionPacket::Request {
                    daughters: vec![id(2)],
                },
                &mut routes,
                ProtocolState::Connected,
            )
            .unwrap();

        assert_eq!(
            drain(&mut leaf_rx),
            vec![
                Packet::from(DisconnectionPacket::Granted),
                Packet::from(DisconnectionPacket::Disconnected {
                    source: id(1),
                    leaver: id(2),
                }),
            ]
        );
        assert!(!routes.contains(id(2)));
        assert_eq!(disconnector.leaver(), None);
    }

    #[test]
    fn test_second_request_denied() {
        let mut routes = RoutingTable::new(id(1));
        let (a, _a_rx) = SessionHandle::channel();
        let (b, mut b_rx) = SessionHandle::channel();
        routes.add(id(2), id(2), &a);
        routes.add(id(3), id(3), &b);

        let mut disconnector = Disconnector::new();
        disconnector
            .process(
                &a,
                DisconnectionPacket::Request {
                    daughters: vec![id(2), id(4)],
                },
                &mut routes,
                ProtocolState::Connected,
            )
            .unwrap();
        disconnector
            .process(
                &b,
                DisconnectionPacket::Request {
                    daughters: vec![id(3)],
                },
                &mut routes,
                ProtocolState::Connected,
            )
            .unwrap();

        assert_eq!(drain(&mut b_rx), vec![Packet::from(DisconnectionPacket::Denied)]);
        assert_eq!(disconnector.leaver(), Some(id(2)));
    }

    #[test]
    fn test_request_denied_while_leaving_ourselves() {
        let mut routes = RoutingTable::new(id(1));
        let (a, mut a_rx) = SessionHandle::channel();
        routes.add(id(2), id(2), &a);
        let mut disconnector = Disconnector::new();
        disconnector
            .process(
                &a,
                DisconnectionPacket::Request {
                    daughters: vec![id(2)],
                },
                &mut routes,
                ProtocolState::Disconnecting,
            )
            .unwrap();
        assert_eq!(drain(&mut a_rx), vec![Packet::from(DisconnectionPacket::Denied)]);
        assert!(routes.contains(id(2)));
    }

    #[test]
    fn test_empty_request_is_fatal() {
        let mut routes = RoutingTable::new(id(1));
        let (a, _rx) = SessionHandle::channel();
        let err = Disconnector::new()
            .process(
                &a,
                DisconnectionPacket::Request { daughters: vec![] },
                &mut routes,
                ProtocolState::Connected,
            )
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_granted_asks_daughters_to_reconnect() {
        let mut routes = RoutingTable::new(id(2));
        let (up, mut up_rx) = SessionHandle::channel();
        let (down, mut down_rx) = SessionHandle::channel();
        routes.add(id(1), id(1), &up);
        routes.set_mother(id(1));
        routes.add(id(3), id(3), &down);

        let state = Disconnector::new()
            .process(&up, DisconnectionPacket::Granted, &mut routes, ProtocolState::Connected)
            .unwrap();

        assert_eq!(state, ProtocolState::Disconnecting);
        assert!(drain(&mut up_rx).is_empty());
        assert_eq!(
            drain(&mut down_rx),
            vec![Packet::from(DisconnectionPacket::PleaseReconnect { mother: id(1) })]
        );
    }

    #[test]
    fn test_unexpected_reconnect_ignored() {
        let mut routes = RoutingTable::new(id(1));
        let (a, _rx) = SessionHandle::channel();
        let state = Disconnector::new()
            .process(
                &a,
                DisconnectionPacket::Reconnect {
                    id: id(9),
                    ancestors: vec![],
                },
                &mut routes,
                ProtocolState::Connecting,
            )
            .unwrap();
        assert_eq!(state, ProtocolState::Connecting);
        assert!(!routes.contains(id(9)));
    }

    #[test]
    fn test_disconnected_retargets_and_forwards() {
        // We are 3, a former daughter of 2 already reconnected to 1
        let mut routes = RoutingTable::new(id(3));
        let (up, mut up_rx) = SessionHandle::channel();
        let (down, mut down_rx) = SessionHandle::channel();
        routes.add(id(1), id(1), &up);
        routes.set_mother(id(1));
        routes.add(id(7), id(2), &up);
        routes.add(id(4), id(4), &down);

        let packet = DisconnectionPacket::Disconnected {
            source: id(1),
            leaver: id(2),
        };
        let state = Disconnector::new()
            .process(&up, packet.clone(), &mut routes, ProtocolState::Reconnecting)
            .unwrap();

        assert_eq!(state, ProtocolState::Reconnecting);
        assert!(!routes.contains(id(2)));
        assert_eq!(routes.next_hop(id(7)), Some(id(1)));
        assert!(drain(&mut up_rx).is_empty());
        assert_eq!(drain(&mut down_rx), vec![Packet::from(packet)]);
    }

    #[test]
    fn test_lost_leaver_releases_the_slot() {
        let mut routes = RoutingTable::new(id(1));
        let (a, _a_rx) = SessionHandle::channel();
        let (b, mut b_rx) = SessionHandle::channel();
        routes.add(id(2), id(2), &a);
        routes.add(id(3), id(3), &b);

        let mut disconnector = Disconnector::new();
        disconnector
            .process(
                &a,
                DisconnectionPacket::Request {
                    daughters: vec![id(2), id(4)],
                },
                &mut routes,
                ProtocolState::Connected,
            )
            .unwrap();
        assert_eq!(disconnector.leaver(), Some(id(2)));

        // A peer that is not leaving changes nothing
        disconnector.peer_lost(id(3), &mut routes);
        assert_eq!(disconnector.leaver(), Some(id(2)));

        // 4 never reconnects and 2 hangs up
        routes.detach(a.id());
        disconnector.peer_lost(id(2), &mut routes);
        assert_eq!(disconnector.leaver(), None);
        assert!(!routes.contains(id(2)));
        assert_eq!(
            drain(&mut b_rx),
            vec![Packet::from(DisconnectionPacket::Disconnected {
                source: id(1),
                leaver: id(2),
            })]
        );

        // The next leave can go ahead
        disconnector
            .process(
                &b,
                DisconnectionPacket::Request {
                    daughters: vec![id(3)],
                },
                &mut routes,
                ProtocolState::Connected,
            )
            .unwrap();
        assert_eq!(
            drain(&mut b_rx),
            vec![
                Packet::from(DisconnectionPacket::Granted),
                Packet::from(DisconnectionPacket::Disconnected {
                    source: id(1),
                    leaver: id(3),
                }),
            ]
        );
    }

    #[test]
    fn test_leaver_closes_on_disconnected() {
        let mut routes = RoutingTable::new(id(2));
        let (up, _rx) = SessionHandle::channel();
        let state = Disconnector::new()
            .process(
                &up,
                DisconnectionPacket::Disconnected {
                    source: id(1),
                    leaver: id(2),
                },
                &mut routes,
                ProtocolState::Disconnecting,
            )
            .unwrap();
        assert_eq!(state, ProtocolState::Closed);
    }
}
