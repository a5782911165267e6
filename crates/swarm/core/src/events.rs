use plexus_net_primitives::{Multiaddr, PeerId, PeerInfo, TransportKind};
use plexus_net_upgrade::{ConnectionId, Endpoint};

/// Swarm lifecycle events, delivered to every [`Swarm::subscribe`](crate::Swarm::subscribe) receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwarmEvent {
    ListenerStarted {
        addr: Multiaddr,
    },
    ListenerClosed {
        addr: Multiaddr,
    },
    /// A connection became the active one for its peer.
    ConnectionEstablished {
        peer_id: PeerId,
        connection_id: ConnectionId,
        endpoint: Endpoint,
        transport: TransportKind,
    },
    ConnectionClosed {
        peer_id: PeerId,
        connection_id: ConnectionId,
    },
    /// Identify metadata for the peer was merged into the peer book.
    Identified {
        peer_id: PeerId,
    },
    /// A discovery source announced a peer.
    PeerDiscovered(PeerInfo),
}

impl SwarmEvent {
    /// The remote peer this event is about, if any.
    pub fn peer_id(&self) -> Option<PeerId> {
        match self {
            Self::ConnectionEstablished { peer_id, .. }
            | Self::ConnectionClosed { peer_id, .. }
            | Self::Identified { peer_id } => Some(*peer_id),
            Self::PeerDiscovered(info) => Some(info.id),
            Self::ListenerStarted { .. } | Self::ListenerClosed { .. } => None,
        }
    }
}
