//! Live connections keyed by remote peer, with duplicate resolution.
//!
//! When two connections to the same peer meet, both nodes must keep the
//! *same* one or they end up closing each other's survivor. The rule each
//! side applies is symmetric:
//!
//! * initiated from different ends: keep the one dialed by the smaller
//!   [`PeerId`];
//! * both initiated locally: keep the existing one and close the new one;
//! * both initiated remotely: hold the new one in standby. The remote applies
//!   the previous rule and closes one of them; whichever stays open is
//!   promoted when the active one goes away.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use libp2p::PeerId;
use plexus_net_upgrade::{Connection, ConnectionId, Endpoint};
use tracing::{debug, trace};

/// Result of [`ConnectionTable::try_insert`].
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    /// The connection is now the active one for its peer.
    Accepted,
    /// An existing connection wins; the caller closes the new one.
    Rejected { existing: Connection },
    /// The new connection wins; the caller closes `previous`.
    Replaced { previous: Connection },
    /// Kept alongside `active` until the remote closes one of them.
    Standby { active: Connection },
}

#[derive(Debug)]
struct Slot {
    active: Connection,
    standby: Vec<Connection>,
}

#[derive(Debug, Clone)]
pub struct ConnectionTable {
    local_peer_id: PeerId,
    slots: Arc<DashMap<PeerId, Slot>>,
}

impl ConnectionTable {
    pub fn new(local_peer_id: PeerId) -> Self {
        Self {
            local_peer_id,
            slots: Arc::new(DashMap::new()),
        }
    }

    /// Registers a connection, resolving duplicates atomically per peer.
    pub fn try_insert(&self, connection: Connection) -> InsertOutcome {
        let peer = connection.remote_peer_id();

        let mut slot = match self.slots.entry(peer) {
            Entry::Vacant(entry) => {
                entry.insert(Slot {
                    active: connection,
                    standby: Vec::new(),
                });
                return InsertOutcome::Accepted;
            }
            Entry::Occupied(entry) => entry.into_ref(),
        };

        slot.standby.retain(|c| !c.is_closed());
        if slot.active.is_closed() {
            trace!(peer_id = %peer, stale = %slot.active.id(), "replacing closed connection");
            slot.active = connection;
            return InsertOutcome::Accepted;
        }

        let existing = slot.active.clone();
        let existing_initiator = self.initiator(&existing);
        let new_initiator = self.initiator(&connection);

        let outcome = if existing_initiator != new_initiator {
            let winner = self.local_peer_id.min(peer);
            if new_initiator == winner {
                slot.active = connection.clone();
                InsertOutcome::Replaced { previous: existing }
            } else {
                InsertOutcome::Rejected { existing }
            }
        } else if new_initiator == self.local_peer_id {
            InsertOutcome::Rejected { existing }
        } else {
            slot.standby.push(connection.clone());
            InsertOutcome::Standby { active: existing }
        };

        debug!(peer_id = %peer, new = %connection.id(), ?outcome, "duplicate connection resolved");
        outcome
    }

    fn initiator(&self, connection: &Connection) -> PeerId {
        match connection.endpoint() {
            Endpoint::Dialer => self.local_peer_id,
            Endpoint::Listener => connection.remote_peer_id(),
        }
    }

    /// Removes one connection. Promotes a live standby if the active one was
    /// removed. Returns whether anything was removed.
    pub fn remove(&self, peer: &PeerId, id: ConnectionId) -> bool {
        let Entry::Occupied(mut entry) = self.slots.entry(*peer) else {
            return false;
        };
        let slot = entry.get_mut();

        if slot.active.id() != id {
            let before = slot.standby.len();
            slot.standby.retain(|c| c.id() != id);
            return slot.standby.len() != before;
        }

        slot.standby.retain(|c| !c.is_closed());
        if slot.standby.is_empty() {
            entry.remove();
        } else {
            let promoted = slot.standby.remove(0);
            trace!(peer_id = %peer, promoted = %promoted.id(), "standby connection promoted");
            slot.active = promoted;
        }
        true
    }

    /// Removes every connection to `peer`, active first.
    pub fn remove_peer(&self, peer: &PeerId) -> Vec<Connection> {
        match self.slots.remove(peer) {
            Some((_, slot)) => std::iter::once(slot.active).chain(slot.standby).collect(),
            None => Vec::new(),
        }
    }

    /// The active connection to `peer`, if it is still open.
    pub fn get(&self, peer: &PeerId) -> Option<Connection> {
        self.slots
            .get(peer)
            .map(|slot| slot.active.clone())
            .filter(|c| !c.is_closed())
    }

    /// Point-in-time copy of the open active connection per peer.
    pub fn all_muxed(&self) -> HashMap<PeerId, Connection> {
        self.slots
            .iter()
            .filter(|slot| !slot.value().active.is_closed())
            .map(|slot| (*slot.key(), slot.value().active.clone()))
            .collect()
    }

    /// Every connection held, active and standby.
    pub fn connections(&self) -> Vec<Connection> {
        self.slots
            .iter()
            .flat_map(|slot| {
                std::iter::once(slot.active.clone()).chain(slot.standby.iter().cloned()).collect::<Vec<_>>()
            })
            .collect()
    }

    /// Number of peers with an active connection.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use libp2p::identity::Keypair;
    use plexus_net_primitives::{Multiaddr, TransportKind};
    use plexus_net_transport::ByteStream;
    use plexus_net_upgrade::{UpgradeConfig, Upgrader};
    use tokio_util::compat::TokioAsyncReadCompatExt;

    use super::*;

    struct Node {
        upgrader: Upgrader,
    }

    impl Node {
        fn new() -> Self {
            Self {
                upgrader: Upgrader::new(Keypair::generate_ed25519(), UpgradeConfig::default()),
            }
        }

        fn id(&self) -> PeerId {
            self.upgrader.local_peer_id()
        }
    }

    /// Connects `dialer` to `listener`, returning (dialer side, listener side).
    async fn connect(dialer: &Node, listener: &Node) -> (Connection, Connection) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (a, b): (ByteStream, ByteStream) = (Box::new(a.compat()), Box::new(b.compat()));
        let addr: Multiaddr = "/ip4/127.0.0.1/tcp/1".parse().unwrap();
        let (out, inb) = tokio::join!(
            dialer.upgrader.upgrade_outbound(a, addr.clone(), TransportKind::Tcp, None),
            listener.upgrader.upgrade_inbound(b, addr, TransportKind::Tcp),
        );
        (out.unwrap(), inb.unwrap())
    }

    /// Two nodes ordered so that `low.id() < high.id()`.
    fn ordered_pair() -> (Node, Node) {
        let (a, b) = (Node::new(), Node::new());
        if a.id() < b.id() { (a, b) } else { (b, a) }
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let (a, b) = (Node::new(), Node::new());
        let table = ConnectionTable::new(a.id());
        let (conn, _remote) = connect(&a, &b).await;

        assert_matches!(table.try_insert(conn.clone()), InsertOutcome::Accepted);
        assert_eq!(table.get(&b.id()).unwrap().id(), conn.id());
        assert_eq!(table.len(), 1);
        assert_eq!(table.all_muxed().len(), 1);
    }

    #[tokio::test]
    async fn test_crossed_dials_agree_on_survivor() {
        let (low, high) = ordered_pair();
        let low_table = ConnectionTable::new(low.id());
        let high_table = ConnectionTable::new(high.id());

        let (low_out, high_in) = connect(&low, &high).await;
        let (high_out, low_in) = connect(&high, &low).await;

        // Each side sees its own dial first.
        assert_matches!(low_table.try_insert(low_out.clone()), InsertOutcome::Accepted);
        assert_matches!(high_table.try_insert(high_out.clone()), InsertOutcome::Accepted);

        // The connection dialed by the smaller id survives on both ends.
        assert_matches!(
            low_table.try_insert(low_in.clone()),
            InsertOutcome::Rejected { existing } if existing.id() == low_out.id()
        );
        assert_matches!(
            high_table.try_insert(high_in.clone()),
            InsertOutcome::Replaced { previous } if previous.id() == high_out.id()
        );
        assert_eq!(high_table.get(&low.id()).unwrap().id(), high_in.id());
    }

    #[tokio::test]
    async fn test_duplicate_local_dial_keeps_existing() {
        let (a, b) = (Node::new(), Node::new());
        let table = ConnectionTable::new(a.id());
        let (first, _r1) = connect(&a, &b).await;
        let (second, _r2) = connect(&a, &b).await;

        assert_matches!(table.try_insert(first.clone()), InsertOutcome::Accepted);
        assert_matches!(
            table.try_insert(second),
            InsertOutcome::Rejected { existing } if existing.id() == first.id()
        );
    }

    #[tokio::test]
    async fn test_duplicate_remote_dial_goes_to_standby_and_is_promoted() {
        let (a, b) = (Node::new(), Node::new());
        let table = ConnectionTable::new(a.id());
        let (_r1, first) = connect(&b, &a).await;
        let (_r2, second) = connect(&b, &a).await;

        assert_matches!(table.try_insert(first.clone()), InsertOutcome::Accepted);
        assert_matches!(
            table.try_insert(second.clone()),
            InsertOutcome::Standby { active } if active.id() == first.id()
        );
        assert_eq!(table.connections().len(), 2);

        assert!(table.remove(&b.id(), first.id()));
        assert_eq!(table.get(&b.id()).unwrap().id(), second.id());
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_closed_active_is_replaced() {
        let (a, b) = (Node::new(), Node::new());
        let table = ConnectionTable::new(a.id());
        let (first, _r1) = connect(&a, &b).await;
        let (second, _r2) = connect(&a, &b).await;

        table.try_insert(first.clone());
        first.close().await;
        assert!(table.get(&b.id()).is_none());
        assert!(table.all_muxed().is_empty());

        assert_matches!(table.try_insert(second.clone()), InsertOutcome::Accepted);
        assert_eq!(table.get(&b.id()).unwrap().id(), second.id());
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let (a, b) = (Node::new(), Node::new());
        let table = ConnectionTable::new(a.id());
        let (conn, _remote) = connect(&a, &b).await;
        table.try_insert(conn.clone());

        assert!(table.remove(&b.id(), conn.id()));
        assert!(!table.remove(&b.id(), conn.id()));
        assert!(table.is_empty());

        table.try_insert(conn.clone());
        assert_eq!(table.remove_peer(&b.id()).len(), 1);
        assert!(table.remove_peer(&b.id()).is_empty());
    }
}
