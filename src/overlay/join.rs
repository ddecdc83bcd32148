//! Join protocol
//!
//! A newcomer sends `Connect` to the node it wants as mother. The mother
//! answers with every id it knows and floods `AddNode` so the rest of the tree
//! learns the new route.

use super::routes::RoutingTable;
use super::session::SessionHandle;
use super::{OverlayResult, ProtocolState};
use crate::protocol::{ConnectionPacket, Id};

/// Apply one connection-family packet received on `session`.
pub fn process(
    session: &SessionHandle,
    packet: ConnectionPacket,
    routes: &mut RoutingTable,
    state: ProtocolState,
) -> OverlayResult<ProtocolState> {
    match packet {
        ConnectionPacket::Connect { daughter } => {
            if state == ProtocolState::Disconnecting {
                tracing::info!("Refusing {}: this node is leaving", daughter);
                session.send(ConnectionPacket::ConnectKo)?;
                return Ok(state);
            }
            accept(session, daughter, routes)?;
            Ok(ProtocolState::Connected)
        }
        ConnectionPacket::ConnectKo => {
            tracing::warn!("Join refused by {}", routes.mother());
            Ok(ProtocolState::Refused)
        }
        ConnectionPacket::ConnectOk { mother, ids } => {
            joined(session, mother, ids, routes)?;
            Ok(ProtocolState::Connected)
        }
        ConnectionPacket::AddNode { source, daughter } => {
            if daughter != routes.me() {
                tracing::debug!("{} is reachable through {}", daughter, source);
                routes.add(daughter, source, session);
                let me = routes.me();
                routes.send_to_neighbours(ConnectionPacket::AddNode { source: me, daughter }, |id| {
                    id == source
                });
            }
            Ok(state)
        }
    }
}

fn accept(session: &SessionHandle, daughter: Id, routes: &mut RoutingTable) -> OverlayResult<()> {
    let me = routes.me();
    session.send(ConnectionPacket::ConnectOk {
        mother: me,
        ids: routes.all_ids(),
    })?;
    routes.add(daughter, daughter, session);
    routes.send_to_neighbours(ConnectionPacket::AddNode { source: me, daughter }, |id| {
        id == daughter
    });
    tracing::info!("{} joined as a daughter of {}", daughter, me);
    Ok(())
}

fn joined(
    session: &SessionHandle,
    mother: Id,
    ids: Vec<Id>,
    routes: &mut RoutingTable,
) -> OverlayResult<()> {
    let me = routes.me();
    routes.add(mother, mother, session);
    routes.set_mother(mother);

    // Nodes that already hang below us must become known above, and the
    // mother's side of the tree must become known below.
    for peer in routes.subtree() {
        session.send(ConnectionPacket::AddNode {
            source: me,
            daughter: peer,
        })?;
    }
    for id in ids {
        if id == me || routes.contains(id) && routes.next_hop(id) != Some(mother) {
            continue;
        }
        routes.add(id, mother, session);
        routes.send_to_daughters(ConnectionPacket::AddNode {
            source: me,
            daughter: id,
        });
    }

    tracing::info!("Joined the overlay under {}", mother);
    Ok(())
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
    fn test_connect_accepted_and_announced() {
        let mut routes = RoutingTable::new(id(1));
        let (up, mut up_rx) = SessionHandle::channel();
        routes.add(id(0), id(0), &up);
        routes.set_mother(id(0));

        let (link, mut rx) = SessionHandle::channel();
        let state = process(
            &link,
            ConnectionPacket::Connect { daughter: id(2) },
            &mut routes,
            ProtocolState::Connecting,
        )
        .unwrap();

        assert_eq!(state, ProtocolState::Connected);
        assert_eq!(routes.next_hop(id(2)), Some(id(2)));
        assert_eq!(
            drain(&mut rx),
            vec![Packet::from(ConnectionPacket::ConnectOk {
                mother: id(1),
                ids: vec![id(0), id(1)],
            })]
        );
        assert_eq!(
            drain(&mut up_rx),
            vec![Packet::from(ConnectionPacket::AddNode {
                source: id(1),
                daughter: id(2),
            })]
        );
    }

    #[test]
    fn test_connect_refused_while_leaving() {
        let mut routes = RoutingTable::new(id(1));
        let (link, mut rx) = SessionHandle::channel();
        let state = process(
            &link,
            ConnectionPacket::Connect { daughter: id(2) },
            &mut routes,
            ProtocolState::Disconnecting,
        )
        .unwrap();

        assert_eq!(state, ProtocolState::Disconnecting);
        assert!(!routes.contains(id(2)));
        assert_eq!(drain(&mut rx), vec![Packet::from(ConnectionPacket::ConnectKo)]);
    }

    #[test]
    fn test_connect_ko_is_terminal() {
        let mut routes = RoutingTable::new(id(2));
        let (link, _rx) = SessionHandle::channel();
        let state = process(
            &link,
            ConnectionPacket::ConnectKo,
            &mut routes,
            ProtocolState::Connecting,
        )
        .unwrap();
        assert_eq!(state, ProtocolState::Refused);
        assert!(state.is_terminal());
    }

    #[test]
    fn test_connect_ok_installs_routes() {
        let mut routes = RoutingTable::new(id(2));
        let (link, _rx) = SessionHandle::channel();
        process(
            &link,
            ConnectionPacket::ConnectOk {
                mother: id(1),
                ids: vec![id(0), id(1), id(5)],
            },
            &mut routes,
            ProtocolState::Connecting,
        )
        .unwrap();

        assert_eq!(routes.mother(), id(1));
        for peer in [id(0), id(1), id(5)] {
            assert_eq!(routes.next_hop(peer), Some(id(1)));
        }
        assert!(routes.daughters().is_empty());
    }

    #[test]
    fn test_connect_ok_announces_existing_subtree() {
        let mut routes = RoutingTable::new(id(2));
        let (down, mut down_rx) = SessionHandle::channel();
        routes.add(id(3), id(3), &down);

        let (up, mut up_rx) = SessionHandle::channel();
        process(
            &up,
            ConnectionPacket::ConnectOk {
                mother: id(1),
                ids: vec![id(1)],
            },
            &mut routes,
            ProtocolState::Connecting,
        )
        .unwrap();

        assert_eq!(
            drain(&mut up_rx),
            vec![Packet::from(ConnectionPacket::AddNode {
                source: id(2),
                daughter: id(3),
            })]
        );
        assert_eq!(
            drain(&mut down_rx),
            vec![Packet::from(ConnectionPacket::AddNode {
                source: id(2),
                daughter: id(1),
            })]
        );
    }

    #[test]
    fn test_add_node_floods_minus_back_edge() {
        let mut routes = RoutingTable::new(id(2));
        let (a, mut a_rx) = SessionHandle::channel();
        let (b, mut b_rx) = SessionHandle::channel();
        routes.add(id(1), id(1), &a);
        routes.add(id(3), id(3), &b);

        let state = process(
            &a,
            ConnectionPacket::AddNode {
                source: id(1),
                daughter: id(7),
            },
            &mut routes,
            ProtocolState::Connected,
        )
        .unwrap();

        assert_eq!(state, ProtocolState::Connected);
        assert_eq!(routes.next_hop(id(7)), Some(id(1)));
        assert!(drain(&mut a_rx).is_empty());
        assert_eq!(
            drain(&mut b_rx),
            vec![Packet::from(ConnectionPacket::AddNode {
                source: id(2),
                daughter: id(7),
            })]
        );
    }
}
