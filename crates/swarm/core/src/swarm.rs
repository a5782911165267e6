//! The connection swarm.
//!
//! A [`Swarm`] owns an ordered list of transports, an [`Upgrader`], the
//! [`PeerBook`] and the [`ConnectionTable`]. Outbound dials and inbound
//! connections from every listener take the same registration path, so both
//! are subject to the same duplicate resolution. Every registered connection
//! gets a background task serving its inbound streams and one watching for it
//! to close; active connections also get an identify task.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::future::join_all;
use futures::stream::BoxStream;
use libp2p::identity::Keypair;
use parking_lot::{Mutex, RwLock};
use plexus_net_identify::{self as identify, IdentifyInfo};
use plexus_net_peers::{
    ConnectionTable, IdentifyMetadata, InsertOutcome, PeerBook, PeerBookEvent, PeerRecord,
};
use plexus_net_primitives::{Multiaddr, PeerId, PeerInfo, TransportKind, with_peer_id};
use plexus_net_transport::{
    AnyTransport, DiscoveryEvent, Inbound, Listener, Transport, TransportError,
};
use plexus_net_upgrade::{Connection, ConnectionId, Endpoint, PendingStream, Stream, Upgrader};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use crate::config::SwarmConfig;
use crate::error::{DialError, ListenError};
use crate::events::SwarmEvent;
use crate::handler::{self, Handlers};
use crate::metrics::SwarmMetrics;
use crate::target::DialTarget;

/// Handle to a running swarm. Clones share the swarm.
#[derive(Clone)]
pub struct Swarm {
    inner: Arc<Inner>,
}

struct Inner {
    keypair: Keypair,
    local_peer_id: PeerId,
    config: SwarmConfig,
    transports: Vec<AnyTransport>,
    upgrader: Upgrader,
    peer_book: PeerBook,
    connections: ConnectionTable,
    handlers: Handlers,
    listen_addrs: RwLock<Vec<Multiaddr>>,
    /// Connections reported through `ConnectionEstablished`.
    announced: Mutex<HashSet<ConnectionId>>,
    /// Discovery streams subscribed at build time, drained by `start`.
    discoveries: Mutex<Vec<BoxStream<'static, DiscoveryEvent>>>,
    events: broadcast::Sender<SwarmEvent>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    metrics: SwarmMetrics,
}

impl std::fmt::Debug for Swarm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Swarm")
            .field("local_peer_id", &self.inner.local_peer_id)
            .field("listen_addrs", &*self.inner.listen_addrs.read())
            .field("connections", &self.inner.connections.len())
            .field("handlers", &self.inner.handlers)
            .finish_non_exhaustive()
    }
}

impl Swarm {
    pub(crate) fn new(
        keypair: Keypair,
        config: SwarmConfig,
        transports: Vec<AnyTransport>,
        discoveries: Vec<BoxStream<'static, DiscoveryEvent>>,
    ) -> Self {
        let local_peer_id = keypair.public().to_peer_id();
        let upgrader = Upgrader::new(keypair.clone(), config.upgrade_config());
        let (events, _) = broadcast::channel(config.event_channel_capacity);

        Self {
            inner: Arc::new(Inner {
                keypair,
                local_peer_id,
                transports,
                upgrader,
                peer_book: PeerBook::new(),
                connections: ConnectionTable::new(local_peer_id),
                handlers: Handlers::default(),
                listen_addrs: RwLock::new(Vec::new()),
                announced: Mutex::new(HashSet::new()),
                discoveries: Mutex::new(discoveries),
                events,
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
                metrics: SwarmMetrics::default(),
                config,
            }),
        }
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.inner.local_peer_id
    }

    pub fn config(&self) -> &SwarmConfig {
        &self.inner.config
    }

    /// Addresses currently being listened on.
    pub fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.inner.listen_addrs.read().clone()
    }

    /// This node as others should dial it: every listen address, ending in `/p2p/<local id>`.
    pub fn peer_info(&self) -> PeerInfo {
        let id = self.inner.local_peer_id;
        let addrs = self
            .inner
            .listen_addrs
            .read()
            .iter()
            .map(|addr| with_peer_id(addr, id))
            .collect();
        PeerInfo::new(id, addrs)
    }

    pub fn peer_book(&self) -> &PeerBook {
        &self.inner.peer_book
    }

    /// Point-in-time copy of the active connection per peer.
    pub fn all_muxed(&self) -> HashMap<PeerId, Connection> {
        self.inner.connections.all_muxed()
    }

    /// The live connection to `peer`, if any.
    pub fn connection(&self, peer: &PeerId) -> Option<Connection> {
        self.inner.connections.get(peer)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SwarmEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Protocols this node answers on inbound streams, including identify.
    pub fn protocols(&self) -> Vec<String> {
        let mut protocols = self.inner.handlers.protocols();
        if !protocols.iter().any(|p| p == identify::PROTOCOL) {
            protocols.push(identify::PROTOCOL.to_string());
        }
        protocols
    }

    /// Registers a handler for inbound streams of `protocol`, replacing any
    /// previous one. Identify streams are always answered by the swarm itself.
    pub fn handle<F, Fut>(&self, protocol: impl Into<String>, handler: F)
    where
        F: Fn(PeerId, Stream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let protocol = protocol.into();
        let replaced = self.inner.handlers.insert(protocol.clone(), handler::boxed(handler));
        debug!(%protocol, replaced, "protocol handler registered");
    }

    /// Removes the handler for `protocol`. Returns whether one was registered.
    pub fn unhandle(&self, protocol: &str) -> bool {
        self.inner.handlers.remove(protocol)
    }

    /// Starts discovery and binds every configured listen address.
    ///
    /// Returns the bound addresses. Call once.
    pub async fn start(&self) -> Result<Vec<Multiaddr>, ListenError> {
        if self.is_stopped() {
            return Err(ListenError::Stopped);
        }

        let discoveries = std::mem::take(&mut *self.inner.discoveries.lock());
        for events in discoveries {
            self.spawn_discovery(events);
        }

        let mut bound = Vec::new();
        for addr in self.inner.config.listen_multiaddrs()? {
            bound.push(self.listen_on(addr).await?);
        }
        info!(peer_id = %self.inner.local_peer_id, addrs = ?bound, "swarm started");
        Ok(bound)
    }

    /// Binds `addr` on the first transport that can listen on it and starts
    /// accepting. Returns the address peers can dial.
    pub async fn listen_on(&self, addr: Multiaddr) -> Result<Multiaddr, ListenError> {
        if self.is_stopped() {
            return Err(ListenError::Stopped);
        }

        let transport = self
            .inner
            .transports
            .iter()
            .find(|t| t.can_listen(&addr))
            .ok_or_else(|| ListenError::Unsupported(addr.clone()))?;
        let kind = transport.kind();
        let listener = transport.listen(&addr).await?;
        let local_addr = listener.local_addr().clone();

        self.inner.listen_addrs.write().push(local_addr.clone());
        info!(%local_addr, transport = %kind, "listening");
        self.emit(SwarmEvent::ListenerStarted {
            addr: local_addr.clone(),
        });

        self.inner.tasks.spawn(self.clone().accept_loop(listener, kind));
        Ok(local_addr)
    }

    async fn accept_loop(self, mut listener: Listener, kind: TransportKind) {
        let local_addr = listener.local_addr().clone();

        loop {
            let inbound = tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                inbound = listener.accept() => inbound,
            };
            let Some(Inbound { stream, remote_addr }) = inbound else {
                break;
            };

            trace!(%local_addr, %remote_addr, "inbound stream accepted");
            let swarm = self.clone();
            self.inner.tasks.spawn(async move {
                match swarm.inner.upgrader.upgrade_inbound(stream, remote_addr.clone(), kind).await {
                    Ok(conn) if conn.remote_peer_id() == swarm.inner.local_peer_id => {
                        debug!(%remote_addr, "closing inbound connection from ourselves");
                        conn.close().await;
                    }
                    Ok(conn) => {
                        swarm.register(conn);
                    }
                    Err(e) => debug!(%remote_addr, transport = %kind, error = %e, "inbound upgrade failed"),
                }
            });
        }

        drop(listener);
        self.inner.listen_addrs.write().retain(|a| a != &local_addr);
        debug!(%local_addr, "listener closed");
        self.emit(SwarmEvent::ListenerClosed { addr: local_addr });
    }

    /// Returns a live connection to `target`, dialing if there is none.
    ///
    /// Candidate addresses are tried in order with the first transport that
    /// can dial each one. The first candidate that yields a byte stream is
    /// upgraded; an upgrade failure is returned without trying the rest.
    /// Identify runs in the background afterwards; see [`Swarm::identified`].
    pub async fn dial(&self, target: impl Into<DialTarget>) -> Result<Connection, DialError> {
        let target = target.into();
        let result = self.dial_target(&target).await;
        if let Err(e) = &result {
            self.inner.metrics.inc_dial_failures();
            debug!(?target, error = %e, category = %e.category(), "dial failed");
        }
        result
    }

    /// Dials `target` and opens a stream for `protocol` on the resulting connection.
    pub async fn dial_protocol(
        &self,
        target: impl Into<DialTarget>,
        protocol: &str,
    ) -> Result<Stream, DialError> {
        let conn = self.dial(target).await?;
        conn.open_stream(protocol).await.map_err(|e| {
            debug!(peer_id = %conn.remote_peer_id(), %protocol, error = %e, "stream open failed");
            DialError::from(e)
        })
    }

    async fn dial_target(&self, target: &DialTarget) -> Result<Connection, DialError> {
        if self.is_stopped() {
            return Err(DialError::Stopped);
        }

        let expected = target.peer_id();
        if expected == Some(self.inner.local_peer_id) {
            return Err(DialError::DialSelf);
        }

        if let Some(conn) = self.resolve_peer(target).and_then(|peer| self.inner.connections.get(&peer)) {
            trace!(peer_id = %conn.remote_peer_id(), connection_id = %conn.id(), "reusing live connection");
            return Ok(conn);
        }

        let mut attempts = 0;
        let mut last = None;
        for addr in self.candidates(target)? {
            let Some(transport) = self.inner.transports.iter().find(|t| t.can_dial(&addr)) else {
                trace!(%addr, "no transport can dial candidate");
                continue;
            };
            let kind = transport.kind();
            attempts += 1;
            self.inner.metrics.inc_dial_attempts();

            let dial = tokio::time::timeout(self.inner.config.dial_timeout(), transport.dial(&addr));
            let stream = match dial.await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    debug!(%addr, transport = %kind, error = %e, "dial candidate failed");
                    last = Some(e);
                    continue;
                }
                Err(_) => {
                    debug!(%addr, transport = %kind, "dial candidate timed out");
                    last = Some(TransportError::Unreachable {
                        addr: addr.clone(),
                        source: io::ErrorKind::TimedOut.into(),
                    });
                    continue;
                }
            };

            let conn = self
                .inner
                .upgrader
                .upgrade_outbound(stream, addr.clone(), kind, expected)
                .await?;
            if conn.remote_peer_id() == self.inner.local_peer_id {
                conn.close().await;
                return Err(DialError::DialSelf);
            }
            return self.register(conn).ok_or(DialError::Stopped);
        }

        Err(DialError::AllCandidatesFailed { attempts, last })
    }

    /// The peer a target refers to: its own id, or the peer book owner of a bare address.
    fn resolve_peer(&self, target: &DialTarget) -> Option<PeerId> {
        target.peer_id().or_else(|| match target {
            DialTarget::Addr(addr) => self.inner.peer_book.find_by_addr(addr),
            DialTarget::Peer(_) | DialTarget::Info(_) => None,
        })
    }

    fn candidates(&self, target: &DialTarget) -> Result<Vec<Multiaddr>, DialError> {
        let (id, explicit) = match target {
            DialTarget::Addr(addr) => return Ok(vec![addr.clone()]),
            DialTarget::Info(info) => (info.id, info.addrs.as_slice()),
            DialTarget::Peer(id) => (*id, [].as_slice()),
        };

        let addrs = if explicit.is_empty() {
            self.inner
                .peer_book
                .get(&id)
                .map(|record| record.addrs)
                .unwrap_or_default()
        } else {
            explicit.to_vec()
        };
        if addrs.is_empty() {
            return Err(DialError::NoKnownAddress(id));
        }
        Ok(addrs.iter().map(|addr| with_peer_id(addr, id)).collect())
    }

    /// Closes every connection to the peer `target` resolves to.
    ///
    /// Unknown or already disconnected peers are a no-op. The peer book
    /// record is kept.
    pub async fn hang_up(&self, target: impl Into<DialTarget>) -> Result<(), DialError> {
        let target = target.into();
        let Some(peer) = self.resolve_peer(&target) else {
            trace!(?target, "hang up: target resolves to no known peer");
            return Ok(());
        };

        let connections = self.inner.connections.remove_peer(&peer);
        if connections.is_empty() {
            trace!(peer_id = %peer, "hang up: not connected");
            return Ok(());
        }

        debug!(peer_id = %peer, connections = connections.len(), "hanging up");
        join_all(connections.iter().map(|conn| conn.close())).await;
        Ok(())
    }

    /// Waits until identify metadata for `peer` is in the peer book.
    ///
    /// Returns `None` on timeout.
    pub async fn identified(&self, peer: PeerId, timeout: Duration) -> Option<PeerRecord> {
        let mut events = self.inner.peer_book.subscribe();
        let book = &self.inner.peer_book;
        let current = || book.get(&peer).filter(PeerRecord::is_identified);

        if let Some(record) = current() {
            return Some(record);
        }

        let wait = async {
            loop {
                match events.recv().await {
                    Ok(PeerBookEvent::Identified { id }) if id == peer => return current(),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if let Some(record) = current() {
                            return Some(record);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.ok().flatten()
    }

    /// Stops listeners and discovery, closes every connection and waits
    /// (bounded by the close timeout) for background tasks to finish.
    pub async fn stop(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();

        let connections = self.inner.connections.connections();
        let peers: HashSet<_> = connections.iter().map(Connection::remote_peer_id).collect();
        for peer in &peers {
            self.inner.connections.remove_peer(peer);
        }
        join_all(connections.iter().map(|conn| conn.close())).await;

        self.inner.tasks.close();
        if tokio::time::timeout(self.inner.config.close_timeout(), self.inner.tasks.wait())
            .await
            .is_err()
        {
            warn!(remaining = self.inner.tasks.len(), "background tasks still running after stop");
        }
        self.inner.listen_addrs.write().clear();
        info!(peer_id = %self.inner.local_peer_id, "swarm stopped");
    }

    /// Puts `conn` in the connection table and returns the connection to use
    /// for its peer, which is `conn` unless an existing one wins.
    fn register(&self, conn: Connection) -> Option<Connection> {
        if self.is_stopped() {
            self.spawn_close(conn);
            return None;
        }

        let connection = match self.inner.connections.try_insert(conn.clone()) {
            InsertOutcome::Accepted => {
                self.announce(&conn);
                self.supervise(&conn);
                conn
            }
            InsertOutcome::Replaced { previous } => {
                self.inner.metrics.inc_connections_deduplicated();
                self.announce(&conn);
                self.supervise(&conn);
                self.spawn_close(previous);
                conn
            }
            InsertOutcome::Rejected { existing } => {
                self.inner.metrics.inc_connections_deduplicated();
                self.spawn_close(conn);
                existing
            }
            InsertOutcome::Standby { active } => {
                self.supervise(&conn);
                active
            }
        };
        Some(connection)
    }

    /// Records a connection that became active and starts identify on it.
    /// Runs at most once per connection.
    fn announce(&self, conn: &Connection) {
        if !self.inner.announced.lock().insert(conn.id()) {
            return;
        }
        let peer_id = conn.remote_peer_id();
        match conn.endpoint() {
            Endpoint::Dialer => self.inner.peer_book.put(peer_id, [conn.remote_addr().clone()]),
            // the remote's source address is ephemeral; identify supplies real ones
            Endpoint::Listener => self.inner.peer_book.put(peer_id, std::iter::empty()),
        }

        self.inner.metrics.inc_connections_established();
        info!(
            %peer_id,
            connection_id = %conn.id(),
            endpoint = %conn.endpoint(),
            transport = %conn.transport(),
            "peer connected"
        );
        self.emit(SwarmEvent::ConnectionEstablished {
            peer_id,
            connection_id: conn.id(),
            endpoint: conn.endpoint(),
            transport: conn.transport(),
        });

        self.spawn_identify(conn.clone());
    }

    /// Serves inbound streams on `conn` and unregisters it once it closes.
    /// A standby promoted in its place is announced.
    fn supervise(&self, conn: &Connection) {
        self.inner.tasks.spawn(self.clone().serve_inbound(conn.clone()));

        let swarm = self.clone();
        let conn = conn.clone();
        self.inner.tasks.spawn(async move {
            conn.closed().await;
            let peer_id = conn.remote_peer_id();
            let removed = swarm.inner.connections.remove(&peer_id, conn.id());

            if swarm.inner.announced.lock().remove(&conn.id()) {
                swarm.inner.metrics.inc_connections_closed();
                info!(%peer_id, connection_id = %conn.id(), "peer disconnected");
                swarm.emit(SwarmEvent::ConnectionClosed {
                    peer_id,
                    connection_id: conn.id(),
                });
            }

            if removed && let Some(next) = swarm.inner.connections.get(&peer_id) {
                swarm.announce(&next);
            }
        });
    }

    fn spawn_close(&self, conn: Connection) {
        trace!(peer_id = %conn.remote_peer_id(), connection_id = %conn.id(), "closing duplicate connection");
        self.inner.tasks.spawn(async move { conn.close().await });
    }

    async fn serve_inbound(self, conn: Connection) {
        loop {
            let pending = tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                pending = conn.next_inbound() => pending,
            };
            let Some(pending) = pending else {
                break;
            };
            let observed = conn.remote_addr().clone();
            self.inner.tasks.spawn(self.clone().dispatch(pending, observed));
        }
    }

    async fn dispatch(self, pending: PendingStream, observed_addr: Multiaddr) {
        let supported = self.protocols();
        let stream = match pending.negotiate(supported.as_slice()).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!(error = %e, "inbound stream negotiation failed");
                return;
            }
        };
        let peer_id = stream.remote_peer_id();
        let protocol = stream.protocol().to_string();

        if protocol == identify::PROTOCOL {
            let info = self.local_identify(Some(observed_addr));
            if let Err(e) = identify::respond(stream, &info).await {
                debug!(%peer_id, error = %e, "identify response failed");
            }
            return;
        }

        match self.inner.handlers.get(&protocol) {
            Some(handler) => {
                trace!(%peer_id, %protocol, "dispatching inbound stream");
                (*handler)(peer_id, stream).await;
            }
            None => debug!(%peer_id, %protocol, "handler removed during negotiation"),
        }
    }

    fn local_identify(&self, observed_addr: Option<Multiaddr>) -> IdentifyInfo {
        IdentifyInfo {
            public_key: self.inner.keypair.public(),
            protocol_version: self.inner.config.protocol_version.clone(),
            agent_version: self.inner.config.agent_version.clone(),
            listen_addrs: self.listen_addrs(),
            observed_addr,
            protocols: self.protocols(),
        }
    }

    fn spawn_identify(&self, conn: Connection) {
        let swarm = self.clone();
        let timeout = self.inner.config.identify_timeout();

        self.inner.tasks.spawn(async move {
            let peer_id = conn.remote_peer_id();
            let exchange = async {
                let stream = conn.open_stream(identify::PROTOCOL).await?;
                Ok::<_, eyre::Report>(identify::request(stream).await?)
            };

            match tokio::time::timeout(timeout, exchange).await {
                Ok(Ok(info)) => swarm.on_identified(peer_id, info),
                Ok(Err(e)) => debug!(%peer_id, error = %e, "identify failed"),
                Err(_) => debug!(%peer_id, ?timeout, "identify timed out"),
            }
        });
    }

    fn on_identified(&self, peer_id: PeerId, info: IdentifyInfo) {
        debug!(
            %peer_id,
            agent = %info.agent_version,
            addrs = info.listen_addrs.len(),
            protocols = info.protocols.len(),
            "peer identified"
        );
        self.inner.peer_book.put(peer_id, info.listen_addrs);
        self.inner.peer_book.set_identify(
            peer_id,
            IdentifyMetadata {
                protocol_version: info.protocol_version,
                agent_version: info.agent_version,
                protocols: info.protocols,
            },
        );
        self.emit(SwarmEvent::Identified { peer_id });
    }

    fn spawn_discovery(&self, mut events: BoxStream<'static, DiscoveryEvent>) {
        let swarm = self.clone();
        self.inner.tasks.spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = swarm.inner.shutdown.cancelled() => break,
                    event = events.next() => event,
                };
                match event {
                    Some(DiscoveryEvent::PeerDiscovered(info)) => swarm.on_discovered(info),
                    None => break,
                }
            }
        });
    }

    fn on_discovered(&self, info: PeerInfo) {
        if info.id == self.inner.local_peer_id {
            return;
        }
        debug!(peer = %info, "peer discovered");
        self.inner.peer_book.put_info(&info);
        self.emit(SwarmEvent::PeerDiscovered(info));
    }

    fn emit(&self, event: SwarmEvent) {
        let _ = self.inner.events.send(event);
    }
}
