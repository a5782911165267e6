//! Swarm nodes for tests.

use futures::{AsyncReadExt, AsyncWriteExt};
use libp2p::identity::Keypair;
use plexus_net_primitives::{Multiaddr, PeerId, TransportKind};
use plexus_net_transport::{RendezvousTransport, TcpTransport, WsTransport};
use plexus_swarm::{Stream, Swarm, SwarmBuilder, SwarmConfig};
use tracing::debug;

pub const ECHO_PROTOCOL: &str = "/echo/1.0.0";

/// Stream handler writing back everything it reads until the remote closes.
pub async fn echo(peer_id: PeerId, stream: Stream) {
    let (mut reader, mut writer) = stream.split();
    match futures::io::copy(&mut reader, &mut writer).await {
        Ok(bytes) => debug!(%peer_id, bytes, "echo finished"),
        Err(e) => debug!(%peer_id, error = %e, "echo failed"),
    }
    let _ = writer.close().await;
}

/// `/ip4/0.0.0.0/tcp/0`
pub fn tcp_any() -> Multiaddr {
    parse("/ip4/0.0.0.0/tcp/0")
}

/// `/ip4/0.0.0.0/tcp/0/ws`
pub fn ws_any() -> Multiaddr {
    parse("/ip4/0.0.0.0/tcp/0/ws")
}

fn parse(s: &str) -> Multiaddr {
    s.parse()
        .unwrap_or_else(|e| panic!("invalid multiaddr {s}: {e}"))
}

/// Builds a swarm with one transport per entry of `transports`, in order,
/// registers the [`echo`] handler and starts listening on `listen_addrs`.
///
/// Rendezvous transports also feed their discovery into the swarm.
pub async fn spawn_node(transports: &[TransportKind], listen_addrs: &[Multiaddr]) -> Swarm {
    let keypair = Keypair::generate_ed25519();
    let local = keypair.public().to_peer_id();

    let config = listen_addrs
        .iter()
        .fold(SwarmConfig::default(), |config, addr| config.with_listen_addr(addr.to_string()));
    let mut builder = SwarmBuilder::new(keypair).with_config(config);
    for kind in transports {
        builder = match kind {
            TransportKind::Tcp => builder.with_transport(TcpTransport::default()),
            TransportKind::WebSocket => builder.with_transport(WsTransport::default()),
            TransportKind::WebRtcStar => {
                let transport = RendezvousTransport::webrtc_star(local);
                builder.with_discovery(&transport.discovery()).with_transport(transport)
            }
            TransportKind::WebSocketStar => {
                let transport = RendezvousTransport::websocket_star(local);
                builder.with_discovery(&transport.discovery()).with_transport(transport)
            }
        };
    }

    let swarm = builder
        .build()
        .unwrap_or_else(|e| panic!("failed to build swarm: {e}"));
    swarm.handle(ECHO_PROTOCOL, echo);
    swarm
        .start()
        .await
        .unwrap_or_else(|e| panic!("failed to start swarm: {e}"));
    swarm
}

/// Writes `payload` on a stream, closes the write half and reads the reply to EOF.
pub async fn round_trip(mut stream: Stream, payload: &[u8]) -> std::io::Result<Vec<u8>> {
    stream.write_all(payload).await?;
    stream.close().await?;
    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).await?;
    Ok(reply)
}
