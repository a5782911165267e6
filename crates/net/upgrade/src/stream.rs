use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};

use futures::{AsyncRead, AsyncWrite};
use libp2p::core::muxing::SubstreamBox;
use plexus_net_primitives::PeerId;

/// A negotiated substream of a [`Connection`](crate::Connection).
pub struct Stream {
    inner: SubstreamBox,
    protocol: String,
    remote_peer_id: PeerId,
    _counter: StreamCounter,
}

impl Stream {
    pub(crate) fn new(
        inner: SubstreamBox,
        protocol: String,
        remote_peer_id: PeerId,
        counter: StreamCounter,
    ) -> Self {
        Self {
            inner,
            protocol,
            remote_peer_id,
            _counter: counter,
        }
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn remote_peer_id(&self) -> PeerId {
        self.remote_peer_id
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("protocol", &self.protocol)
            .field("remote_peer_id", &self.remote_peer_id)
            .finish_non_exhaustive()
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_close(cx)
    }
}

/// Counts live streams of a connection; decrements on drop.
#[derive(Debug)]
pub(crate) struct StreamCounter(Arc<AtomicUsize>);

impl StreamCounter {
    pub(crate) fn acquire(count: &Arc<AtomicUsize>) -> Self {
        count.fetch_add(1, Ordering::Relaxed);
        Self(count.clone())
    }
}

impl Drop for StreamCounter {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}
