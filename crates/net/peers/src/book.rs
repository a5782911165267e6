//! Known peers: identities, addresses and Identify metadata.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use libp2p::PeerId;
use plexus_net_primitives::{Multiaddr, PeerInfo, peer_id_of, without_peer_id};
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::events::{EventEmitter, PeerBookEvent};

/// Metadata learned from an Identify exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentifyMetadata {
    pub protocol_version: String,
    pub agent_version: String,
    pub protocols: Vec<String>,
}

/// Everything known about one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub id: PeerId,
    /// Known addresses without `/p2p/<id>`, in the order first learned.
    pub addrs: Vec<Multiaddr>,
    pub protocols: Option<Vec<String>>,
    pub agent_version: Option<String>,
    pub protocol_version: Option<String>,
    pub first_seen: Instant,
    pub last_seen: Instant,
}

impl PeerRecord {
    fn new(id: PeerId) -> Self {
        let now = Instant::now();
        Self {
            id,
            addrs: Vec::new(),
            protocols: None,
            agent_version: None,
            protocol_version: None,
            first_seen: now,
            last_seen: now,
        }
    }

    /// True once Identify metadata has been merged.
    pub fn is_identified(&self) -> bool {
        self.protocols.is_some()
    }

    pub fn supports(&self, protocol: &str) -> bool {
        self.protocols
            .as_ref()
            .is_some_and(|protocols| protocols.iter().any(|p| p == protocol))
    }

    pub fn peer_info(&self) -> PeerInfo {
        PeerInfo::new(self.id, self.addrs.clone())
    }

    /// Merges addresses, returning how many were new.
    fn merge_addrs(&mut self, addrs: impl IntoIterator<Item = Multiaddr>) -> usize {
        let mut added = 0;
        for addr in addrs {
            let addr = without_peer_id(&addr);
            if addr.is_empty() || self.addrs.contains(&addr) {
                continue;
            }
            self.addrs.push(addr);
            added += 1;
        }
        added
    }
}

/// Concurrent map of known peers. Records are never removed.
///
/// Clones share the same book.
#[derive(Debug, Clone, Default)]
pub struct PeerBook {
    peers: Arc<DashMap<PeerId, PeerRecord>>,
    events: EventEmitter,
}

impl PeerBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the record or union-merges `addrs` into it. Never shrinks a record.
    pub fn put(&self, id: PeerId, addrs: impl IntoIterator<Item = Multiaddr>) {
        let event = match self.peers.entry(id) {
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                record.last_seen = Instant::now();
                let added = record.merge_addrs(addrs);
                (added > 0).then_some(PeerBookEvent::Updated { id })
            }
            Entry::Vacant(entry) => {
                let mut record = PeerRecord::new(id);
                record.merge_addrs(addrs);
                entry.insert(record);
                Some(PeerBookEvent::Added { id })
            }
        };

        if let Some(event) = event {
            trace!(peer_id = %id, ?event, "peer book changed");
            self.events.emit(event);
        }
    }

    pub fn put_info(&self, info: &PeerInfo) {
        self.put(info.id, info.addrs.iter().cloned());
    }

    /// Merges Identify metadata, creating the record if needed.
    pub fn set_identify(&self, id: PeerId, metadata: IdentifyMetadata) {
        {
            let mut record = self.peers.entry(id).or_insert_with(|| PeerRecord::new(id));
            record.protocols = Some(metadata.protocols);
            record.agent_version = Some(metadata.agent_version);
            record.protocol_version = Some(metadata.protocol_version);
            record.last_seen = Instant::now();
        }
        debug!(peer_id = %id, "peer identified");
        self.events.emit(PeerBookEvent::Identified { id });
    }

    pub fn get(&self, id: &PeerId) -> Option<PeerRecord> {
        self.peers.get(id).map(|record| record.clone())
    }

    /// Point-in-time copy of every record.
    pub fn get_all(&self) -> HashMap<PeerId, PeerRecord> {
        self.peers
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    /// The peer an address belongs to: its `/p2p` component if the peer is
    /// known, otherwise the first record listing the address.
    pub fn find_by_addr(&self, addr: &Multiaddr) -> Option<PeerId> {
        if let Some(id) = peer_id_of(addr).filter(|id| self.contains(id)) {
            return Some(id);
        }
        let addr = without_peer_id(addr);
        self.peers
            .iter()
            .find(|entry| entry.value().addrs.contains(&addr))
            .map(|entry| *entry.key())
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerBookEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use libp2p::identity::Keypair;

    use super::*;

    fn peer() -> PeerId {
        Keypair::generate_ed25519().public().to_peer_id()
    }

    fn addr(s: &str) -> Multiaddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_put_merges_and_never_shrinks() {
        let book = PeerBook::new();
        let id = peer();

        book.put(id, [addr("/ip4/127.0.0.1/tcp/1"), addr("/ip4/127.0.0.1/tcp/2/ws")]);
        book.put(id, [addr("/ip4/127.0.0.1/tcp/1")]);
        book.put(id, std::iter::empty());

        let record = book.get(&id).unwrap();
        assert_eq!(
            record.addrs,
            vec![addr("/ip4/127.0.0.1/tcp/1"), addr("/ip4/127.0.0.1/tcp/2/ws")]
        );
        assert_eq!(book.len(), 1);
        assert!(!record.is_identified());
    }

    #[test]
    fn test_put_strips_peer_component() {
        let book = PeerBook::new();
        let id = peer();

        book.put(id, [addr(&format!("/ip4/127.0.0.1/tcp/1/p2p/{id}"))]);
        book.put(id, [addr("/ip4/127.0.0.1/tcp/1")]);

        assert_eq!(book.get(&id).unwrap().addrs, vec![addr("/ip4/127.0.0.1/tcp/1")]);
    }

    #[test]
    fn test_set_identify_creates_and_marks_identified() {
        let book = PeerBook::new();
        let id = peer();

        book.set_identify(
            id,
            IdentifyMetadata {
                protocol_version: "ipfs/0.1.0".into(),
                agent_version: "plexus/0.1.0".into(),
                protocols: vec!["/echo/1.0.0".into()],
            },
        );

        let record = book.get(&id).unwrap();
        assert!(record.is_identified());
        assert!(record.supports("/echo/1.0.0"));
        assert_eq!(record.agent_version.as_deref(), Some("plexus/0.1.0"));
    }

    #[test]
    fn test_find_by_addr() {
        let book = PeerBook::new();
        let (a, b) = (peer(), peer());
        book.put(a, [addr("/ip4/127.0.0.1/tcp/1")]);
        book.put(b, [addr("/ip4/127.0.0.1/tcp/2")]);

        assert_eq!(book.find_by_addr(&addr("/ip4/127.0.0.1/tcp/2")), Some(b));
        assert_eq!(
            book.find_by_addr(&addr(&format!("/ip4/127.0.0.1/tcp/9/p2p/{a}"))),
            Some(a)
        );
        assert_eq!(book.find_by_addr(&addr("/ip4/127.0.0.1/tcp/3")), None);
    }

    #[tokio::test]
    async fn test_events() {
        let book = PeerBook::new();
        let mut rx = book.subscribe();
        let id = peer();

        book.put(id, [addr("/ip4/127.0.0.1/tcp/1")]);
        book.put(id, [addr("/ip4/127.0.0.1/tcp/1")]);
        book.put(id, [addr("/ip4/127.0.0.1/tcp/2")]);
        book.set_identify(id, IdentifyMetadata::default());

        assert_eq!(rx.recv().await.unwrap(), PeerBookEvent::Added { id });
        // the no-op merge emits nothing
        assert_eq!(rx.recv().await.unwrap(), PeerBookEvent::Updated { id });
        assert_eq!(rx.recv().await.unwrap(), PeerBookEvent::Identified { id });
    }

    #[test]
    fn test_concurrent_puts() {
        use std::thread;

        let book = PeerBook::new();
        let id = peer();
        let handles: Vec<_> = (0..8u16)
            .map(|port| {
                let book = book.clone();
                thread::spawn(move || book.put(id, [addr(&format!("/ip4/127.0.0.1/tcp/{port}"))]))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(book.len(), 1);
        assert_eq!(book.get(&id).unwrap().addrs.len(), 8);
    }
}
