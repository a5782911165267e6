//! What a caller can ask the swarm to dial or hang up on.

use plexus_net_primitives::{Multiaddr, PeerId, PeerInfo};

/// A dial or hang-up target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialTarget {
    /// A peer known to the peer book.
    Peer(PeerId),
    /// An address, with or without a trailing `/p2p/<id>`.
    Addr(Multiaddr),
    /// A peer with candidate addresses. Empty `addrs` falls back to the peer book.
    Info(PeerInfo),
}

impl DialTarget {
    /// The peer id carried by the target itself, without consulting the peer book.
    pub fn peer_id(&self) -> Option<PeerId> {
        match self {
            Self::Peer(id) => Some(*id),
            Self::Info(info) => Some(info.id),
            Self::Addr(addr) => plexus_net_primitives::peer_id_of(addr),
        }
    }
}

impl From<PeerId> for DialTarget {
    fn from(id: PeerId) -> Self {
        Self::Peer(id)
    }
}

impl From<Multiaddr> for DialTarget {
    fn from(addr: Multiaddr) -> Self {
        Self::Addr(addr)
    }
}

impl From<&Multiaddr> for DialTarget {
    fn from(addr: &Multiaddr) -> Self {
        Self::Addr(addr.clone())
    }
}

impl From<PeerInfo> for DialTarget {
    fn from(info: PeerInfo) -> Self {
        Self::Info(info)
    }
}

impl From<&PeerInfo> for DialTarget {
    fn from(info: &PeerInfo) -> Self {
        Self::Info(info.clone())
    }
}

#[cfg(test)]
mod tests {
    use libp2p::identity::Keypair;

    use super::*;

    #[test]
    fn test_peer_id_of_targets() {
        let id = Keypair::generate_ed25519().public().to_peer_id();
        let bare: Multiaddr = "/ip4/127.0.0.1/tcp/1".parse().unwrap();
        let full: Multiaddr = format!("/ip4/127.0.0.1/tcp/1/p2p/{id}").parse().unwrap();

        assert_eq!(DialTarget::from(id).peer_id(), Some(id));
        assert_eq!(DialTarget::from(&full).peer_id(), Some(id));
        assert_eq!(DialTarget::from(bare).peer_id(), None);
        assert_eq!(DialTarget::from(PeerInfo::new(id, vec![])).peer_id(), Some(id));
    }
}
