use std::io;

use async_trait::async_trait;
use libp2p::multiaddr::Protocol;
use plexus_net_primitives::{Multiaddr, ParsedAddr, PeerId, PeerInfo, TransportKind, without_peer_id};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::RendezvousDiscovery;
use super::proto::{self, BrokerMessage, ClientMessage, SessionId};
use crate::listener::ACCEPT_BACKLOG;
use crate::ws::connect_ws;
use crate::{ByteStream, Inbound, Listener, Transport, TransportError, WsStream};

/// Transport reaching peers through a rendezvous broker.
#[derive(Debug, Clone)]
pub struct RendezvousTransport {
    kind: TransportKind,
    local_peer_id: PeerId,
    discovery: RendezvousDiscovery,
}

impl RendezvousTransport {
    /// `/p2p-webrtc-star` addresses, brokered by a signalling server.
    pub fn webrtc_star(local_peer_id: PeerId) -> Self {
        Self::new(TransportKind::WebRtcStar, local_peer_id)
    }

    /// `/p2p-websocket-star` addresses, brokered by a rendezvous server.
    pub fn websocket_star(local_peer_id: PeerId) -> Self {
        Self::new(TransportKind::WebSocketStar, local_peer_id)
    }

    fn new(kind: TransportKind, local_peer_id: PeerId) -> Self {
        Self {
            kind,
            local_peer_id,
            discovery: RendezvousDiscovery::default(),
        }
    }

    /// Peers announced by the brokers this transport listens through.
    pub fn discovery(&self) -> RendezvousDiscovery {
        self.discovery.clone()
    }

    fn parse(&self, addr: &Multiaddr) -> Option<ParsedAddr> {
        ParsedAddr::parse(addr)
            .ok()
            .filter(|parsed| parsed.kind == self.kind)
    }
}

#[async_trait]
impl Transport for RendezvousTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn can_dial(&self, addr: &Multiaddr) -> bool {
        self.parse(addr).is_some_and(|parsed| parsed.peer_id.is_some())
    }

    fn can_listen(&self, addr: &Multiaddr) -> bool {
        self.parse(addr)
            .is_some_and(|parsed| parsed.peer_id.is_none_or(|id| id == self.local_peer_id))
    }

    async fn dial(&self, addr: &Multiaddr) -> Result<ByteStream, TransportError> {
        let (parsed, to) = self
            .parse(addr)
            .and_then(|parsed| parsed.peer_id.map(|to| (parsed, to)))
            .ok_or_else(|| TransportError::AddressUnsupported(addr.clone()))?;

        let mut ws = connect_ws(addr, &parsed).await?;
        let dial = ClientMessage::Dial {
            from: self.local_peer_id,
            to,
        };
        proto::send(&mut ws, &dial)
            .await
            .map_err(|e| TransportError::unreachable(addr, e.into()))?;

        match proto::recv(&mut ws).await {
            Ok(Some(BrokerMessage::Connected)) => {
                trace!(%addr, "rendezvous session connected");
                Ok(Box::new(WsStream::new(ws)))
            }
            Ok(Some(BrokerMessage::DialFailed { reason })) => Err(TransportError::unreachable(
                addr,
                io::Error::new(io::ErrorKind::ConnectionRefused, reason),
            )),
            Ok(Some(other)) => Err(TransportError::unreachable(
                addr,
                io::Error::other(format!("unexpected broker reply: {other:?}")),
            )),
            Ok(None) => Err(TransportError::unreachable(
                addr,
                io::ErrorKind::UnexpectedEof.into(),
            )),
            Err(e) => Err(TransportError::unreachable(addr, e.into())),
        }
    }

    async fn listen(&self, addr: &Multiaddr) -> Result<Listener, TransportError> {
        let parsed = self
            .parse(addr)
            .filter(|_| self.can_listen(addr))
            .ok_or_else(|| TransportError::AddressUnsupported(addr.clone()))?;
        let base = without_peer_id(addr);

        let mut control = connect_ws(addr, &parsed).await?;
        proto::send(
            &mut control,
            &ClientMessage::Register {
                peer: self.local_peer_id,
            },
        )
        .await
        .map_err(io::Error::from)?;

        match proto::recv(&mut control).await.map_err(io::Error::from)? {
            Some(BrokerMessage::Registered) => {}
            other => {
                return Err(io::Error::other(format!("broker refused registration: {other:?}")).into());
            }
        }

        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        let shutdown = CancellationToken::new();
        let session = ControlSession {
            base: base.clone(),
            parsed,
            local_peer_id: self.local_peer_id,
            discovery: self.discovery.clone(),
            incoming: tx,
        };
        tokio::spawn(session.run(control, shutdown.clone()));

        let local_addr = base.with(Protocol::P2p(self.local_peer_id));
        debug!(%local_addr, kind = %self.kind, "rendezvous listener registered");
        Ok(Listener::new(local_addr, rx, shutdown))
    }
}

/// State of one registered control socket.
struct ControlSession {
    /// `<broker ws address>/<kind>`
    base: Multiaddr,
    parsed: ParsedAddr,
    local_peer_id: PeerId,
    discovery: RendezvousDiscovery,
    incoming: mpsc::Sender<Inbound>,
}

impl ControlSession {
    async fn run(self, mut control: WebSocketStream<TcpStream>, shutdown: CancellationToken) {
        loop {
            let msg = tokio::select! {
                _ = shutdown.cancelled() => break,
                msg = proto::recv::<_, BrokerMessage>(&mut control) => msg,
            };

            match msg {
                Ok(Some(BrokerMessage::PeerJoined { peer })) if peer != self.local_peer_id => {
                    let addr = self.base.clone().with(Protocol::P2p(peer));
                    self.discovery.peer_discovered(PeerInfo::new(peer, vec![addr]));
                }
                Ok(Some(BrokerMessage::PeerJoined { .. })) => {}
                Ok(Some(BrokerMessage::PeerLeft { peer })) => {
                    trace!(peer_id = %peer, "peer left rendezvous");
                }
                Ok(Some(BrokerMessage::Incoming { session, from })) => {
                    tokio::spawn(self.accept(session, from));
                }
                Ok(Some(other)) => debug!(?other, "ignoring unexpected broker message"),
                Ok(None) => {
                    debug!(base = %self.base, "broker closed control socket");
                    break;
                }
                Err(e) => {
                    warn!(base = %self.base, error = %e, "rendezvous control socket failed");
                    break;
                }
            }
        }

        let _ = control.close(None).await;
        trace!(base = %self.base, "rendezvous listener stopped");
    }

    fn accept(&self, session: SessionId, from: PeerId) -> impl Future<Output = ()> + Send + 'static {
        let base = self.base.clone();
        let parsed = self.parsed.clone();
        let incoming = self.incoming.clone();

        async move {
            let stream = match attach(&base, &parsed, session).await {
                Ok(ws) => WsStream::new(ws),
                Err(e) => {
                    debug!(peer_id = %from, session, error = %e, "failed to accept brokered session");
                    return;
                }
            };
            let inbound = Inbound {
                stream: Box::new(stream),
                remote_addr: base.with(Protocol::P2p(from)),
            };
            let _ = incoming.send(inbound).await;
        }
    }
}

/// Opens an accept socket for `session` and waits for the broker to splice it.
async fn attach(
    base: &Multiaddr,
    parsed: &ParsedAddr,
    session: SessionId,
) -> Result<WebSocketStream<TcpStream>, TransportError> {
    let mut ws = connect_ws(base, parsed).await?;
    proto::send(&mut ws, &ClientMessage::Accept { session })
        .await
        .map_err(|e| TransportError::unreachable(base, e.into()))?;

    match proto::recv(&mut ws).await {
        Ok(Some(BrokerMessage::Connected)) => Ok(ws),
        Ok(other) => Err(TransportError::unreachable(
            base,
            io::Error::other(format!("unexpected broker reply: {other:?}")),
        )),
        Err(e) => Err(TransportError::unreachable(base, e.into())),
    }
}
