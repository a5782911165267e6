//! Peer book events and non-blocking broadcast emitter.

use libp2p::PeerId;
use tokio::sync::broadcast;

/// Peer book events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerBookEvent {
    /// A record was created.
    Added { id: PeerId },
    /// New addresses were merged into an existing record.
    Updated { id: PeerId },
    /// Identify metadata was merged.
    Identified { id: PeerId },
}

impl PeerBookEvent {
    pub fn peer_id(&self) -> &PeerId {
        match self {
            Self::Added { id } | Self::Updated { id } | Self::Identified { id } => id,
        }
    }
}

const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Non-blocking broadcast emitter. Slow subscribers drop events independently.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<PeerBookEvent>,
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn emit(&self, event: PeerBookEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerBookEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
