//! Rendezvous transports against the in-process broker.

use std::time::Duration;

use assert_matches::assert_matches;
use futures::{AsyncReadExt, AsyncWriteExt, StreamExt};
use libp2p::identity::Keypair;
use libp2p::multiaddr::Protocol;
use plexus_net_primitives::{PeerId, TransportKind};
use plexus_net_transport::{Discovery, DiscoveryEvent, RendezvousTransport, Transport, TransportError};
use plexus_test_utils::{RendezvousServer, eventually, init_tracing};

fn peer() -> PeerId {
    Keypair::generate_ed25519().public().to_peer_id()
}

#[tokio::test]
async fn test_listen_registers_and_advertises_peer_address() {
    init_tracing();
    let broker = RendezvousServer::start().await.unwrap();
    let id = peer();
    let transport = RendezvousTransport::websocket_star(id);
    let base = broker.addr(TransportKind::WebSocketStar);

    assert!(transport.can_listen(&base));
    let listener = transport.listen(&base).await.unwrap();

    assert_eq!(*listener.local_addr(), base.with(Protocol::P2p(id)));
    assert!(eventually(Duration::from_secs(2), || broker.registered() == vec![id]).await);
}

#[tokio::test]
async fn test_registered_peers_discover_each_other() {
    init_tracing();
    let broker = RendezvousServer::start().await.unwrap();
    let base = broker.addr(TransportKind::WebRtcStar);
    let (a, b) = (peer(), peer());
    let ta = RendezvousTransport::webrtc_star(a);
    let tb = RendezvousTransport::webrtc_star(b);
    let mut a_events = ta.discovery().events();
    let mut b_events = tb.discovery().events();

    let _la = ta.listen(&base).await.unwrap();
    let _lb = tb.listen(&base).await.unwrap();

    let DiscoveryEvent::PeerDiscovered(seen_by_a) = tokio::time::timeout(Duration::from_secs(2), a_events.next())
        .await
        .unwrap()
        .unwrap();
    let DiscoveryEvent::PeerDiscovered(seen_by_b) = tokio::time::timeout(Duration::from_secs(2), b_events.next())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(seen_by_a.id, b);
    assert_eq!(seen_by_a.addrs, vec![base.clone().with(Protocol::P2p(b))]);
    assert_eq!(seen_by_b.id, a);
    // the announced address is directly dialable
    assert!(tb.can_dial(&seen_by_b.addrs[0]));
}

#[tokio::test]
async fn test_dial_through_broker() {
    init_tracing();
    let broker = RendezvousServer::start().await.unwrap();
    let base = broker.addr(TransportKind::WebSocketStar);
    let (a, b) = (peer(), peer());
    let listening = RendezvousTransport::websocket_star(a);
    let dialing = RendezvousTransport::websocket_star(b);

    let mut listener = listening.listen(&base).await.unwrap();
    let target = listener.local_addr().clone();
    assert!(dialing.can_dial(&target));

    let (dialed, accepted) = tokio::join!(dialing.dial(&target), listener.accept());
    let mut outbound = dialed.unwrap();
    let inbound = accepted.unwrap();
    assert_eq!(inbound.remote_addr, base.with(Protocol::P2p(b)));
    let mut inbound = inbound.stream;

    outbound.write_all(b"hey").await.unwrap();
    outbound.flush().await.unwrap();
    let mut buf = [0u8; 3];
    inbound.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hey");

    inbound.write_all(b"ho").await.unwrap();
    inbound.flush().await.unwrap();
    let mut buf = [0u8; 2];
    outbound.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ho");
}

#[tokio::test]
async fn test_dial_unregistered_peer_is_unreachable() {
    init_tracing();
    let broker = RendezvousServer::start().await.unwrap();
    let transport = RendezvousTransport::websocket_star(peer());
    let target = broker
        .addr(TransportKind::WebSocketStar)
        .with(Protocol::P2p(peer()));

    let result = transport.dial(&target).await.map(|_| ());
    assert_matches!(result, Err(TransportError::Unreachable { .. }));
}

#[tokio::test]
async fn test_listen_without_broker_fails() {
    init_tracing();
    let broker = RendezvousServer::start().await.unwrap();
    let base = broker.addr(TransportKind::WebSocketStar);
    broker.stop();
    drop(broker);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let transport = RendezvousTransport::websocket_star(peer());
    assert!(transport.listen(&base).await.is_err());
}

#[tokio::test]
async fn test_wrong_kind_is_not_dialable() {
    let broker = RendezvousServer::start().await.unwrap();
    let transport = RendezvousTransport::webrtc_star(peer());
    let target = broker
        .addr(TransportKind::WebSocketStar)
        .with(Protocol::P2p(peer()));

    assert!(!transport.can_dial(&target));
    assert_matches!(
        transport.dial(&target).await.map(|_| ()),
        Err(TransportError::AddressUnsupported(_))
    );
}
