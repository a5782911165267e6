//! Multiplexed connection handle and its driver task.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::task::Poll;
use std::time::Duration;

use futures::future::poll_fn;
use libp2p::core::muxing::{StreamMuxerBox, StreamMuxerExt, SubstreamBox};
use plexus_net_primitives::{Multiaddr, PeerId, TransportKind};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tracing::{debug, trace};

use crate::negotiate;
use crate::stream::StreamCounter;
use crate::{ConnectionError, NegotiationError, Stream, UpgradeConfig};

const COMMAND_BUFFER: usize = 32;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which side initiated the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Endpoint {
    Dialer,
    Listener,
}

enum Command {
    OpenStream(oneshot::Sender<Result<SubstreamBox, ConnectionError>>),
    Close,
}

/// Handle to a live multiplexed connection. Clones share the connection.
///
/// The multiplexer is owned by a driver task. The connection closes when
/// [`Connection::close`] is called, when the remote goes away, or when the
/// last handle is dropped.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    id: ConnectionId,
    remote_peer_id: PeerId,
    remote_addr: Multiaddr,
    transport: TransportKind,
    endpoint: Endpoint,
    stream_open_timeout: Duration,
    commands: mpsc::Sender<Command>,
    inbound: Mutex<mpsc::UnboundedReceiver<SubstreamBox>>,
    closed: watch::Receiver<bool>,
    num_streams: Arc<AtomicUsize>,
}

impl Connection {
    pub(crate) fn spawn(
        muxer: StreamMuxerBox,
        remote_peer_id: PeerId,
        remote_addr: Multiaddr,
        transport: TransportKind,
        endpoint: Endpoint,
        config: &UpgradeConfig,
    ) -> Self {
        let id = ConnectionId::next();
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);

        let driver = Driver {
            id,
            remote_peer_id,
            muxer,
            commands: commands_rx,
            inbound: inbound_tx,
            pending_opens: VecDeque::new(),
            close_timeout: config.close_timeout,
        };
        tokio::spawn(driver.run(closed_tx));

        debug!(%id, peer_id = %remote_peer_id, %remote_addr, %transport, %endpoint, "connection established");
        Self {
            inner: Arc::new(Inner {
                id,
                remote_peer_id,
                remote_addr,
                transport,
                endpoint,
                stream_open_timeout: config.stream_open_timeout,
                commands: commands_tx,
                inbound: Mutex::new(inbound_rx),
                closed: closed_rx,
                num_streams: Arc::new(AtomicUsize::new(0)),
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn remote_peer_id(&self) -> PeerId {
        self.inner.remote_peer_id
    }

    pub fn remote_addr(&self) -> &Multiaddr {
        &self.inner.remote_addr
    }

    pub fn transport(&self) -> TransportKind {
        self.inner.transport
    }

    pub fn endpoint(&self) -> Endpoint {
        self.inner.endpoint
    }

    /// Number of negotiated streams currently alive.
    pub fn num_streams(&self) -> usize {
        self.inner.num_streams.load(Ordering::Relaxed)
    }

    /// True once the connection has started closing.
    pub fn is_closed(&self) -> bool {
        self.inner.commands.is_closed() || *self.inner.closed.borrow()
    }

    /// Resolves once the connection is fully closed.
    pub async fn closed(&self) {
        let mut closed = self.inner.closed.clone();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    /// Closes the connection, resetting all of its streams. Idempotent.
    pub async fn close(&self) {
        let _ = self.inner.commands.send(Command::Close).await;
        self.closed().await;
    }

    /// Opens a substream and negotiates `protocol` on it.
    pub async fn open_stream(&self, protocol: &str) -> Result<Stream, ConnectionError> {
        tokio::time::timeout(self.inner.stream_open_timeout, self.open_stream_inner(protocol))
            .await
            .map_err(|_| ConnectionError::StreamOpenTimeout)?
    }

    async fn open_stream_inner(&self, protocol: &str) -> Result<Stream, ConnectionError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .commands
            .send(Command::OpenStream(tx))
            .await
            .map_err(|_| ConnectionError::Closed)?;
        let mut substream = rx.await.map_err(|_| ConnectionError::Closed)??;

        match negotiate::dialer_select(&mut substream, &[protocol]).await {
            Ok(protocol) => {
                trace!(id = %self.id(), %protocol, "outbound stream negotiated");
                Ok(self.wrap(substream, protocol))
            }
            Err(NegotiationError::Rejected(_)) => {
                Err(ConnectionError::ProtocolNotSupported(protocol.to_string()))
            }
            // a close racing the negotiation shows up as an I/O error on the substream
            Err(_) if self.is_closed() => Err(ConnectionError::Closed),
            Err(e) => Err(e.into()),
        }
    }

    /// Next inbound substream, before protocol negotiation.
    ///
    /// Returns `None` once the connection is closed.
    pub async fn next_inbound(&self) -> Option<PendingStream> {
        let substream = self.inner.inbound.lock().await.recv().await?;
        Some(PendingStream {
            substream,
            connection: self.clone(),
        })
    }

    /// Next inbound stream whose proposed protocol is in `supported`.
    ///
    /// Streams proposing nothing supported are rejected and skipped.
    pub async fn accept_stream<P: AsRef<str>>(&self, supported: &[P]) -> Result<Stream, ConnectionError> {
        loop {
            let pending = self.next_inbound().await.ok_or(ConnectionError::Closed)?;
            match pending.negotiate(supported).await {
                Ok(stream) => return Ok(stream),
                Err(e) => trace!(id = %self.id(), error = %e, "inbound stream rejected"),
            }
        }
    }

    fn wrap(&self, substream: SubstreamBox, protocol: String) -> Stream {
        Stream::new(
            substream,
            protocol,
            self.inner.remote_peer_id,
            StreamCounter::acquire(&self.inner.num_streams),
        )
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("remote_peer_id", &self.inner.remote_peer_id)
            .field("remote_addr", &self.inner.remote_addr)
            .field("transport", &self.inner.transport)
            .field("endpoint", &self.inner.endpoint)
            .finish_non_exhaustive()
    }
}

/// An inbound substream awaiting protocol selection.
pub struct PendingStream {
    substream: SubstreamBox,
    connection: Connection,
}

impl PendingStream {
    /// Selects the first protocol proposed by the remote that is in `supported`.
    pub async fn negotiate<P: AsRef<str>>(mut self, supported: &[P]) -> Result<Stream, ConnectionError> {
        let timeout = self.connection.inner.stream_open_timeout;
        let protocol = tokio::time::timeout(
            timeout,
            negotiate::listener_select(&mut self.substream, supported),
        )
        .await
        .map_err(|_| ConnectionError::StreamOpenTimeout)??;
        Ok(self.connection.wrap(self.substream, protocol))
    }
}

struct Driver {
    id: ConnectionId,
    remote_peer_id: PeerId,
    muxer: StreamMuxerBox,
    commands: mpsc::Receiver<Command>,
    inbound: mpsc::UnboundedSender<SubstreamBox>,
    pending_opens: VecDeque<oneshot::Sender<Result<SubstreamBox, ConnectionError>>>,
    close_timeout: Duration,
}

impl Driver {
    async fn run(mut self, closed: watch::Sender<bool>) {
        let reason = poll_fn(|cx| self.poll(cx)).await;
        debug!(id = %self.id, peer_id = %self.remote_peer_id, %reason, "connection closing");

        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            if let Command::OpenStream(tx) = command {
                self.pending_opens.push_back(tx);
            }
        }
        for tx in self.pending_opens.drain(..) {
            let _ = tx.send(Err(ConnectionError::Closed));
        }

        let muxer = &mut self.muxer;
        match tokio::time::timeout(self.close_timeout, poll_fn(|cx| muxer.poll_close_unpin(cx))).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => trace!(id = %self.id, error = %e, "multiplexer close failed"),
            Err(_) => debug!(id = %self.id, "multiplexer close timed out"),
        }

        let _ = closed.send(true);
        trace!(id = %self.id, "connection closed");
    }

    fn poll(&mut self, cx: &mut std::task::Context<'_>) -> Poll<CloseReason> {
        loop {
            match self.commands.poll_recv(cx) {
                Poll::Ready(Some(Command::OpenStream(tx))) => {
                    self.pending_opens.push_back(tx);
                    continue;
                }
                Poll::Ready(Some(Command::Close)) => return Poll::Ready(CloseReason::Local),
                Poll::Ready(None) => return Poll::Ready(CloseReason::Dropped),
                Poll::Pending => {}
            }

            if !self.pending_opens.is_empty() {
                match self.muxer.poll_outbound_unpin(cx) {
                    Poll::Ready(Ok(substream)) => {
                        if let Some(tx) = self.pending_opens.pop_front() {
                            let _ = tx.send(Ok(substream));
                        }
                        continue;
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(CloseReason::Error(e.to_string())),
                    Poll::Pending => {}
                }
            }

            match self.muxer.poll_inbound_unpin(cx) {
                Poll::Ready(Ok(substream)) => {
                    let _ = self.inbound.send(substream);
                    continue;
                }
                Poll::Ready(Err(e)) => return Poll::Ready(CloseReason::Error(e.to_string())),
                Poll::Pending => {}
            }

            match self.muxer.poll_unpin(cx) {
                Poll::Ready(Ok(_event)) => continue,
                Poll::Ready(Err(e)) => return Poll::Ready(CloseReason::Error(e.to_string())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

enum CloseReason {
    Local,
    Dropped,
    Error(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("closed locally"),
            Self::Dropped => f.write_str("all handles dropped"),
            Self::Error(e) => write!(f, "{e}"),
        }
    }
}
