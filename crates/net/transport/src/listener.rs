use plexus_net_primitives::Multiaddr;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::ByteStream;

/// Backlog of accepted but not yet collected streams.
pub(crate) const ACCEPT_BACKLOG: usize = 32;

/// A raw inbound stream together with the address it came from.
pub struct Inbound {
    pub stream: ByteStream,
    pub remote_addr: Multiaddr,
}

impl std::fmt::Debug for Inbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inbound")
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}

/// A bound listener. Dropping it stops the accept loop.
#[derive(Debug)]
pub struct Listener {
    local_addr: Multiaddr,
    incoming: mpsc::Receiver<Inbound>,
    _guard: DropGuard,
}

impl Listener {
    pub(crate) fn new(
        local_addr: Multiaddr,
        incoming: mpsc::Receiver<Inbound>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            local_addr,
            incoming,
            _guard: shutdown.drop_guard(),
        }
    }

    /// Address peers can dial to reach this listener.
    pub fn local_addr(&self) -> &Multiaddr {
        &self.local_addr
    }

    /// Next inbound stream, or `None` once the accept loop has ended.
    pub async fn accept(&mut self) -> Option<Inbound> {
        self.incoming.recv().await
    }
}
