//! Transports that turn a multiaddress into a duplex byte stream.
//!
//! The set is closed: [`AnyTransport`] covers TCP, WebSocket and the two
//! rendezvous-brokered kinds. The swarm picks the first transport whose
//! [`Transport::can_dial`] accepts an address. None of them look at the bytes
//! they carry; security and multiplexing are layered on top by the upgrader.

mod discovery;
mod error;
mod listener;
pub mod rendezvous;
mod tcp;
mod ws;

use async_trait::async_trait;
use futures::{AsyncRead, AsyncWrite};
use plexus_net_primitives::{Multiaddr, TransportKind};

pub use discovery::{Discovery, DiscoveryEvent};
pub use error::TransportError;
pub use listener::{Inbound, Listener};
pub use rendezvous::{RendezvousDiscovery, RendezvousTransport};
pub use tcp::TcpTransport;
pub use ws::{WsStream, WsTransport};

/// Duplex byte stream accepted by the upgrader.
pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncReadWrite for T {}

pub type ByteStream = Box<dyn AsyncReadWrite>;

#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Whether `addr` is an address this transport can dial. Pure.
    fn can_dial(&self, addr: &Multiaddr) -> bool;

    /// Whether `addr` is an address this transport can listen on. Pure.
    fn can_listen(&self, addr: &Multiaddr) -> bool;

    async fn dial(&self, addr: &Multiaddr) -> Result<ByteStream, TransportError>;

    async fn listen(&self, addr: &Multiaddr) -> Result<Listener, TransportError>;
}

#[derive(Debug, Clone)]
pub enum AnyTransport {
    Tcp(TcpTransport),
    WebSocket(WsTransport),
    Rendezvous(RendezvousTransport),
}

impl AnyTransport {
    /// Discovery source of this transport, if it has one.
    pub fn discovery(&self) -> Option<RendezvousDiscovery> {
        match self {
            Self::Rendezvous(t) => Some(t.discovery()),
            Self::Tcp(_) | Self::WebSocket(_) => None,
        }
    }
}

#[async_trait]
impl Transport for AnyTransport {
    fn kind(&self) -> TransportKind {
        match self {
            Self::Tcp(t) => t.kind(),
            Self::WebSocket(t) => t.kind(),
            Self::Rendezvous(t) => t.kind(),
        }
    }

    fn can_dial(&self, addr: &Multiaddr) -> bool {
        match self {
            Self::Tcp(t) => t.can_dial(addr),
            Self::WebSocket(t) => t.can_dial(addr),
            Self::Rendezvous(t) => t.can_dial(addr),
        }
    }

    fn can_listen(&self, addr: &Multiaddr) -> bool {
        match self {
            Self::Tcp(t) => t.can_listen(addr),
            Self::WebSocket(t) => t.can_listen(addr),
            Self::Rendezvous(t) => t.can_listen(addr),
        }
    }

    async fn dial(&self, addr: &Multiaddr) -> Result<ByteStream, TransportError> {
        match self {
            Self::Tcp(t) => t.dial(addr).await,
            Self::WebSocket(t) => t.dial(addr).await,
            Self::Rendezvous(t) => t.dial(addr).await,
        }
    }

    async fn listen(&self, addr: &Multiaddr) -> Result<Listener, TransportError> {
        match self {
            Self::Tcp(t) => t.listen(addr).await,
            Self::WebSocket(t) => t.listen(addr).await,
            Self::Rendezvous(t) => t.listen(addr).await,
        }
    }
}

impl From<TcpTransport> for AnyTransport {
    fn from(t: TcpTransport) -> Self {
        Self::Tcp(t)
    }
}

impl From<WsTransport> for AnyTransport {
    fn from(t: WsTransport) -> Self {
        Self::WebSocket(t)
    }
}

impl From<RendezvousTransport> for AnyTransport {
    fn from(t: RendezvousTransport) -> Self {
        Self::Rendezvous(t)
    }
}

#[cfg(test)]
mod tests {
    use libp2p::identity::Keypair;

    use super::*;

    fn addr(s: &str) -> Multiaddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_can_dial_selects_exactly_one_transport() {
        let local = Keypair::generate_ed25519().public().to_peer_id();
        let remote = Keypair::generate_ed25519().public().to_peer_id();
        let transports: Vec<AnyTransport> = vec![
            TcpTransport::default().into(),
            WsTransport::default().into(),
            RendezvousTransport::webrtc_star(local).into(),
            RendezvousTransport::websocket_star(local).into(),
        ];

        let cases = [
            (addr("/ip4/127.0.0.1/tcp/9090"), TransportKind::Tcp),
            (addr("/ip4/127.0.0.1/tcp/9091/ws"), TransportKind::WebSocket),
            (
                addr(&format!("/ip4/127.0.0.1/tcp/15555/ws/p2p-webrtc-star/p2p/{remote}")),
                TransportKind::WebRtcStar,
            ),
            (
                addr(&format!("/ip4/127.0.0.1/tcp/24642/ws/p2p-websocket-star/p2p/{remote}")),
                TransportKind::WebSocketStar,
            ),
        ];

        for (addr, expected) in cases {
            let matching: Vec<_> = transports.iter().filter(|t| t.can_dial(&addr)).collect();
            assert_eq!(matching.len(), 1, "{addr}");
            assert_eq!(matching[0].kind(), expected);
        }
    }

    #[test]
    fn test_nothing_dials_unsupported_chains() {
        let local = Keypair::generate_ed25519().public().to_peer_id();
        let transports: Vec<AnyTransport> = vec![
            TcpTransport::default().into(),
            WsTransport::default().into(),
            RendezvousTransport::websocket_star(local).into(),
        ];

        for addr in [
            addr("/ip4/127.0.0.1/udp/9090"),
            addr("/ip4/127.0.0.1/tcp/9090/wss"),
            // brokered dial needs a target peer
            addr("/ip4/127.0.0.1/tcp/24642/ws/p2p-websocket-star"),
        ] {
            assert!(transports.iter().all(|t| !t.can_dial(&addr)), "{addr}");
        }
    }
}
