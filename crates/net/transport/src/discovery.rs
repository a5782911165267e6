use futures::stream::BoxStream;
use plexus_net_primitives::PeerInfo;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    PeerDiscovered(PeerInfo),
}

/// A source of peer discoveries.
///
/// Events produced before [`Discovery::events`] is called are not replayed.
pub trait Discovery: Send + Sync {
    fn events(&self) -> BoxStream<'static, DiscoveryEvent>;
}
