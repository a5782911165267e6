//! Network primitives shared by the plexus transports and swarm.
//!
//! Peer identities and multiaddresses come from libp2p. This crate adds the
//! pieces the swarm needs on top of them: [`PeerInfo`] as advertised by a node,
//! and [`ParsedAddr`], which walks a multiaddress chain and decides which
//! transport it narrows to.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use libp2p::multiaddr::Protocol;
pub use libp2p::{Multiaddr, PeerId};

/// Transport families a multiaddress can narrow to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::AsRefStr)]
#[strum(serialize_all = "kebab-case")]
pub enum TransportKind {
    /// `/tcp/<port>`
    Tcp,
    /// `/tcp/<port>/ws`
    #[strum(serialize = "ws")]
    WebSocket,
    /// `/tcp/<port>/ws/p2p-webrtc-star`, brokered by a signalling server.
    #[strum(serialize = "p2p-webrtc-star")]
    WebRtcStar,
    /// `/tcp/<port>/ws/p2p-websocket-star`, brokered by a rendezvous server.
    #[strum(serialize = "p2p-websocket-star")]
    WebSocketStar,
}

impl TransportKind {
    /// The multiaddress segment selecting a brokered transport.
    pub fn broker_protocol(&self) -> Option<Protocol<'static>> {
        match self {
            Self::WebRtcStar => Some(Protocol::P2pWebRtcStar),
            Self::WebSocketStar => Some(Protocol::P2pWebSocketStar),
            Self::Tcp | Self::WebSocket => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("unsupported multiaddress: {0}")]
    Unsupported(Multiaddr),
}

/// Network host of a multiaddress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Host {
    Ip(IpAddr),
    Dns(String),
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip(IpAddr::V6(ip)) => write!(f, "[{ip}]"),
            Self::Ip(ip) => write!(f, "{ip}"),
            Self::Dns(name) => f.write_str(name),
        }
    }
}

/// A multiaddress chain broken into the parts the transports care about.
///
/// Accepted shapes (each optionally followed by `/p2p/<peer>`):
///
/// ```text
/// /<ip4|ip6|dns|dns4|dns6>/<host>/tcp/<port>
/// /<ip4|ip6|dns|dns4|dns6>/<host>/tcp/<port>/ws
/// /<ip4|ip6|dns|dns4|dns6>/<host>/tcp/<port>/ws/p2p-webrtc-star
/// /<ip4|ip6|dns|dns4|dns6>/<host>/tcp/<port>/ws/p2p-websocket-star
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAddr {
    pub host: Host,
    pub port: u16,
    pub kind: TransportKind,
    pub peer_id: Option<PeerId>,
}

impl ParsedAddr {
    pub fn parse(addr: &Multiaddr) -> Result<Self, AddressError> {
        let unsupported = || AddressError::Unsupported(addr.clone());
        let mut iter = addr.iter();

        let host = match iter.next() {
            Some(Protocol::Ip4(ip)) => Host::Ip(IpAddr::V4(ip)),
            Some(Protocol::Ip6(ip)) => Host::Ip(IpAddr::V6(ip)),
            Some(Protocol::Dns(name) | Protocol::Dns4(name) | Protocol::Dns6(name)) => {
                Host::Dns(name.to_string())
            }
            _ => return Err(unsupported()),
        };

        let port = match iter.next() {
            Some(Protocol::Tcp(port)) => port,
            _ => return Err(unsupported()),
        };

        let mut kind = TransportKind::Tcp;
        let mut next = iter.next();

        if matches!(next, Some(Protocol::Ws(_))) {
            kind = TransportKind::WebSocket;
            next = iter.next();

            match next {
                Some(Protocol::P2pWebRtcStar) => {
                    kind = TransportKind::WebRtcStar;
                    next = iter.next();
                }
                Some(Protocol::P2pWebSocketStar) => {
                    kind = TransportKind::WebSocketStar;
                    next = iter.next();
                }
                _ => {}
            }
        }

        let peer_id = match next {
            Some(Protocol::P2p(peer_id)) => {
                next = iter.next();
                Some(peer_id)
            }
            _ => None,
        };

        if next.is_some() {
            return Err(unsupported());
        }

        Ok(Self {
            host,
            port,
            kind,
            peer_id,
        })
    }

    /// `host:port` string usable with `TcpStream::connect`.
    pub fn socket_target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Socket address when the host is a literal IP.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self.host {
            Host::Ip(ip) => Some(SocketAddr::new(ip, self.port)),
            Host::Dns(_) => None,
        }
    }

    /// WebSocket URL of the `/ws` part of the chain.
    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}/", self.host, self.port)
    }
}

/// Trailing `/p2p/<peer>` component of an address, if any.
pub fn peer_id_of(addr: &Multiaddr) -> Option<PeerId> {
    match addr.iter().last() {
        Some(Protocol::P2p(peer_id)) => Some(peer_id),
        _ => None,
    }
}

/// Appends `/p2p/<peer>` unless the address already ends with a peer id.
pub fn with_peer_id(addr: &Multiaddr, peer_id: PeerId) -> Multiaddr {
    match peer_id_of(addr) {
        Some(_) => addr.clone(),
        None => addr.clone().with(Protocol::P2p(peer_id)),
    }
}

/// Strips a trailing `/p2p/<peer>` component.
pub fn without_peer_id(addr: &Multiaddr) -> Multiaddr {
    let mut addr = addr.clone();
    if let Some(Protocol::P2p(_)) = addr.iter().last() {
        addr.pop();
    }
    addr
}

/// `/ip4|ip6/<ip>/tcp/<port>` for a socket address.
pub fn socket_addr_to_multiaddr(addr: SocketAddr) -> Multiaddr {
    let mut multiaddr = Multiaddr::empty();
    match addr.ip() {
        IpAddr::V4(ip) => multiaddr.push(Protocol::Ip4(ip)),
        IpAddr::V6(ip) => multiaddr.push(Protocol::Ip6(ip)),
    }
    multiaddr.push(Protocol::Tcp(addr.port()));
    multiaddr
}

/// Replaces an unspecified listen IP with the loopback address of the same family.
pub fn advertised_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(v4) if v4.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(v6) if v6.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    }
}

/// Identity and advertised addresses of a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: PeerId,
    pub addrs: Vec<Multiaddr>,
}

impl PeerInfo {
    pub fn new(id: PeerId, addrs: Vec<Multiaddr>) -> Self {
        Self { id, addrs }
    }
}

impl fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [", self.id)?;
        for (i, addr) in self.addrs.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{addr}")?;
        }
        f.write_str("]")
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use libp2p::identity::Keypair;

    use super::*;

    fn addr(s: &str) -> Multiaddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_tcp() {
        let parsed = ParsedAddr::parse(&addr("/ip4/127.0.0.1/tcp/4001")).unwrap();
        assert_eq!(parsed.kind, TransportKind::Tcp);
        assert_eq!(parsed.port, 4001);
        assert_eq!(parsed.socket_target(), "127.0.0.1:4001");
        assert!(parsed.peer_id.is_none());
    }

    #[test]
    fn test_parse_ws_with_peer() {
        let peer = Keypair::generate_ed25519().public().to_peer_id();
        let parsed =
            ParsedAddr::parse(&addr(&format!("/ip4/127.0.0.1/tcp/25011/ws/p2p/{peer}"))).unwrap();
        assert_eq!(parsed.kind, TransportKind::WebSocket);
        assert_eq!(parsed.peer_id, Some(peer));
        assert_eq!(parsed.ws_url(), "ws://127.0.0.1:25011/");
    }

    #[test]
    fn test_parse_brokered() {
        let star = ParsedAddr::parse(&addr("/ip4/127.0.0.1/tcp/24642/ws/p2p-webrtc-star")).unwrap();
        assert_eq!(star.kind, TransportKind::WebRtcStar);
        assert_eq!(star.ws_url(), "ws://127.0.0.1:24642/");

        let wss = ParsedAddr::parse(&addr("/dns4/example.org/tcp/443/ws/p2p-websocket-star"))
            .unwrap();
        assert_eq!(wss.kind, TransportKind::WebSocketStar);
        assert_eq!(wss.host, Host::Dns("example.org".to_string()));
    }

    #[test]
    fn test_parse_rejects_unknown_chains() {
        assert_matches!(
            ParsedAddr::parse(&addr("/ip4/127.0.0.1/udp/4001")),
            Err(AddressError::Unsupported(_))
        );
        assert_matches!(
            ParsedAddr::parse(&addr("/ip4/127.0.0.1/tcp/4001/p2p-websocket-star")),
            Err(AddressError::Unsupported(_))
        );
    }

    #[test]
    fn test_ipv6_formatting() {
        let parsed = ParsedAddr::parse(&addr("/ip6/::1/tcp/80/ws")).unwrap();
        assert_eq!(parsed.ws_url(), "ws://[::1]:80/");
    }

    #[test]
    fn test_peer_id_helpers() {
        let peer = Keypair::generate_ed25519().public().to_peer_id();
        let base = addr("/ip4/127.0.0.1/tcp/4001");

        let full = with_peer_id(&base, peer);
        assert_eq!(peer_id_of(&full), Some(peer));
        assert_eq!(with_peer_id(&full, peer), full);
        assert_eq!(without_peer_id(&full), base);
        assert_eq!(without_peer_id(&base), base);
    }

    #[test]
    fn test_advertised_ip() {
        assert_eq!(
            advertised_ip("0.0.0.0".parse().unwrap()),
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        );
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(advertised_ip(ip), ip);
    }
}
