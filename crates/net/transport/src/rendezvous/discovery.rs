use futures::stream::{BoxStream, StreamExt};
use plexus_net_primitives::PeerInfo;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::trace;

use crate::{Discovery, DiscoveryEvent};

const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Peers announced by the broker of a rendezvous listener.
#[derive(Debug, Clone)]
pub struct RendezvousDiscovery {
    tx: broadcast::Sender<DiscoveryEvent>,
}

impl Default for RendezvousDiscovery {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(DEFAULT_CHANNEL_CAPACITY);
        Self { tx }
    }
}

impl RendezvousDiscovery {
    pub(crate) fn peer_discovered(&self, info: PeerInfo) {
        trace!(peer_id = %info.id, "rendezvous peer discovered");
        let _ = self.tx.send(DiscoveryEvent::PeerDiscovered(info));
    }
}

impl Discovery for RendezvousDiscovery {
    fn events(&self) -> BoxStream<'static, DiscoveryEvent> {
        BroadcastStream::new(self.tx.subscribe())
            .filter_map(|event| futures::future::ready(event.ok()))
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use libp2p::identity::Keypair;

    use super::*;

    #[tokio::test]
    async fn test_events_after_subscribe_are_delivered() {
        let discovery = RendezvousDiscovery::default();
        let peer = Keypair::generate_ed25519().public().to_peer_id();

        discovery.peer_discovered(PeerInfo::new(peer, vec![]));
        let mut events = discovery.events();
        discovery.peer_discovered(PeerInfo::new(peer, vec![]));

        let DiscoveryEvent::PeerDiscovered(info) = events.next().await.unwrap();
        assert_eq!(info.id, peer);
    }
}
