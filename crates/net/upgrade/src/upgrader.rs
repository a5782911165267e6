use std::sync::Arc;

use libp2p::core::muxing::StreamMuxerBox;
use libp2p::core::upgrade::{InboundConnectionUpgrade, OutboundConnectionUpgrade};
use libp2p::identity::Keypair;
use libp2p::{noise, yamux};
use plexus_net_primitives::{Multiaddr, PeerId, TransportKind};
use plexus_net_transport::ByteStream;
use tracing::{debug, trace};

use crate::negotiate;
use crate::{Connection, Endpoint, NegotiationError, UpgradeConfig, UpgradeError};

pub const NOISE_PROTOCOL: &str = "/noise";
pub const YAMUX_PROTOCOL: &str = "/yamux/1.0.0";

/// Upgrades raw streams into [`Connection`]s using the local identity.
#[derive(Clone)]
pub struct Upgrader {
    keypair: Arc<Keypair>,
    config: UpgradeConfig,
}

impl std::fmt::Debug for Upgrader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upgrader")
            .field("local_peer_id", &self.local_peer_id())
            .field("config", &self.config)
            .finish()
    }
}

impl Upgrader {
    pub fn new(keypair: Keypair, config: UpgradeConfig) -> Self {
        Self {
            keypair: Arc::new(keypair),
            config,
        }
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.keypair.public().to_peer_id()
    }

    pub fn config(&self) -> &UpgradeConfig {
        &self.config
    }

    /// Upgrades a stream we dialed. `expected` is checked against the
    /// identity proven by the handshake.
    pub async fn upgrade_outbound(
        &self,
        stream: ByteStream,
        remote_addr: Multiaddr,
        transport: TransportKind,
        expected: Option<PeerId>,
    ) -> Result<Connection, UpgradeError> {
        let (remote, muxer) = tokio::time::timeout(
            self.config.upgrade_timeout,
            self.secure_and_mux(stream, Endpoint::Dialer, expected),
        )
        .await
        .map_err(|_| UpgradeError::Timeout)??;
        Ok(Connection::spawn(
            muxer,
            remote,
            remote_addr,
            transport,
            Endpoint::Dialer,
            &self.config,
        ))
    }

    /// Upgrades a stream accepted by a listener.
    pub async fn upgrade_inbound(
        &self,
        stream: ByteStream,
        remote_addr: Multiaddr,
        transport: TransportKind,
    ) -> Result<Connection, UpgradeError> {
        let (remote, muxer) = tokio::time::timeout(
            self.config.upgrade_timeout,
            self.secure_and_mux(stream, Endpoint::Listener, None),
        )
        .await
        .map_err(|_| UpgradeError::Timeout)??;
        Ok(Connection::spawn(
            muxer,
            remote,
            remote_addr,
            transport,
            Endpoint::Listener,
            &self.config,
        ))
    }

    async fn secure_and_mux(
        &self,
        mut stream: ByteStream,
        endpoint: Endpoint,
        expected: Option<PeerId>,
    ) -> Result<(PeerId, StreamMuxerBox), UpgradeError> {
        let security = select(&mut stream, endpoint, &[NOISE_PROTOCOL])
            .await
            .map_err(|e| match e {
                NegotiationError::Codec(plexus_net_codec::CodecError::Io(e)) => UpgradeError::Io(e),
                other => UpgradeError::HandshakeFailed(format!("security negotiation: {other}")),
            })?;
        trace!(%security, %endpoint, "security protocol selected");

        let noise = noise::Config::new(&self.keypair)
            .map_err(|e| UpgradeError::HandshakeFailed(e.to_string()))?;
        let (remote, mut secure) = match endpoint {
            Endpoint::Dialer => noise.upgrade_outbound(stream, NOISE_PROTOCOL).await,
            Endpoint::Listener => noise.upgrade_inbound(stream, NOISE_PROTOCOL).await,
        }
        .map_err(|e| UpgradeError::HandshakeFailed(e.to_string()))?;
        if let Some(expected) = expected
            && expected != remote
        {
            return Err(UpgradeError::HandshakeFailed(format!(
                "expected peer {expected}, remote proved {remote}"
            )));
        }
        trace!(peer_id = %remote, "noise handshake complete");

        let multiplexer = select(&mut secure, endpoint, self.config.multiplexers.as_slice())
            .await
            .map_err(|e| match e {
                NegotiationError::Rejected(_) | NegotiationError::NoCommonProtocol(_) => {
                    UpgradeError::NoSharedMultiplexer
                }
                NegotiationError::Codec(plexus_net_codec::CodecError::Io(e)) => UpgradeError::Io(e),
                other => UpgradeError::Multiplexer(other.to_string()),
            })?;
        if multiplexer != YAMUX_PROTOCOL {
            debug!(%multiplexer, "negotiated multiplexer is not available");
            return Err(UpgradeError::NoSharedMultiplexer);
        }

        let yamux = yamux::Config::default();
        let muxer = match endpoint {
            Endpoint::Dialer => yamux.upgrade_outbound(secure, YAMUX_PROTOCOL).await,
            Endpoint::Listener => yamux.upgrade_inbound(secure, YAMUX_PROTOCOL).await,
        }
        .map_err(|e| UpgradeError::Multiplexer(e.to_string()))?;

        Ok((remote, StreamMuxerBox::new(muxer)))
    }
}

async fn select<S, P>(io: &mut S, endpoint: Endpoint, protocols: &[P]) -> Result<String, NegotiationError>
where
    S: futures::AsyncRead + futures::AsyncWrite + Unpin,
    P: AsRef<str>,
{
    match endpoint {
        Endpoint::Dialer => negotiate::dialer_select(io, protocols).await,
        Endpoint::Listener => negotiate::listener_select(io, protocols).await,
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use futures::{AsyncReadExt, AsyncWriteExt};
    use tokio_util::compat::TokioAsyncReadCompatExt;

    use super::*;
    use crate::ConnectionError;

    fn pipe() -> (ByteStream, ByteStream) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (Box::new(a.compat()), Box::new(b.compat()))
    }

    fn addr() -> Multiaddr {
        "/ip4/127.0.0.1/tcp/1".parse().unwrap()
    }

    async fn connected(dialer: &Upgrader, listener: &Upgrader) -> (Connection, Connection) {
        let (a, b) = pipe();
        let (out, inb) = tokio::join!(
            dialer.upgrade_outbound(a, addr(), TransportKind::Tcp, Some(listener.local_peer_id())),
            listener.upgrade_inbound(b, addr(), TransportKind::Tcp),
        );
        (out.unwrap(), inb.unwrap())
    }

    fn upgrader() -> Upgrader {
        Upgrader::new(Keypair::generate_ed25519(), UpgradeConfig::default())
    }

    #[tokio::test]
    async fn test_upgrade_establishes_identities() {
        let (a, b) = (upgrader(), upgrader());
        let (out, inb) = connected(&a, &b).await;

        assert_eq!(out.remote_peer_id(), b.local_peer_id());
        assert_eq!(inb.remote_peer_id(), a.local_peer_id());
        assert_eq!(out.endpoint(), Endpoint::Dialer);
        assert_eq!(inb.endpoint(), Endpoint::Listener);
        assert!(!out.is_closed());
    }

    #[tokio::test]
    async fn test_identity_mismatch_fails_handshake() {
        let (a, b) = (upgrader(), upgrader());
        let stranger = Keypair::generate_ed25519().public().to_peer_id();
        let (s1, s2) = pipe();

        let (out, _inb) = tokio::join!(
            a.upgrade_outbound(s1, addr(), TransportKind::Tcp, Some(stranger)),
            b.upgrade_inbound(s2, addr(), TransportKind::Tcp),
        );
        assert_matches!(out, Err(UpgradeError::HandshakeFailed(_)));
    }

    #[tokio::test]
    async fn test_no_shared_multiplexer() {
        let a = upgrader();
        let b = Upgrader::new(
            Keypair::generate_ed25519(),
            UpgradeConfig {
                multiplexers: vec!["/mplex/6.7.0".to_string()],
                ..Default::default()
            },
        );
        let (s1, s2) = pipe();

        let (out, inb) = tokio::join!(
            a.upgrade_outbound(s1, addr(), TransportKind::Tcp, None),
            b.upgrade_inbound(s2, addr(), TransportKind::Tcp),
        );
        assert_matches!(out, Err(UpgradeError::NoSharedMultiplexer));
        assert_matches!(inb, Err(UpgradeError::NoSharedMultiplexer));
    }

    #[tokio::test]
    async fn test_stream_echo_and_counting() {
        let (a, b) = (upgrader(), upgrader());
        let (out, inb) = connected(&a, &b).await;

        let server = tokio::spawn(async move {
            let mut stream = inb.accept_stream(&["/echo/1.0.0"]).await.unwrap();
            assert_eq!(stream.protocol(), "/echo/1.0.0");
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
            stream.close().await.unwrap();
            inb
        });

        let mut stream = out.open_stream("/echo/1.0.0").await.unwrap();
        assert_eq!(out.num_streams(), 1);
        stream.write_all(b"hey").await.unwrap();
        stream.close().await.unwrap();
        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"hey");

        drop(stream);
        assert_eq!(out.num_streams(), 0);
        let _inb = server.await.unwrap();
    }

    #[tokio::test]
    async fn test_unsupported_protocol() {
        let (a, b) = (upgrader(), upgrader());
        let (out, inb) = connected(&a, &b).await;

        let server = tokio::spawn(async move {
            let _ = inb.accept_stream(&["/echo/1.0.0"]).await;
        });

        let result = out.open_stream("/unknown/1.0.0").await;
        assert_matches!(result, Err(ConnectionError::ProtocolNotSupported(p)) if p == "/unknown/1.0.0");
        server.abort();
    }

    #[tokio::test]
    async fn test_stream_open_times_out_when_remote_never_answers() {
        let a = Upgrader::new(
            Keypair::generate_ed25519(),
            UpgradeConfig {
                stream_open_timeout: std::time::Duration::from_millis(200),
                ..Default::default()
            },
        );
        let b = upgrader();
        let (out, inb) = connected(&a, &b).await;

        // take the substream but never run negotiation on it
        let server = tokio::spawn(async move {
            let pending = inb.next_inbound().await;
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            drop(pending);
        });

        let result = out.open_stream("/echo/1.0.0").await;
        assert_matches!(result, Err(ConnectionError::StreamOpenTimeout));
        assert!(!out.is_closed());
        server.abort();
    }

    #[tokio::test]
    async fn test_close_during_open_stream_fails_cleanly() {
        let (a, b) = (upgrader(), upgrader());

        for _ in 0..20 {
            let (out, _inb) = connected(&a, &b).await;
            let (opened, ()) = tokio::time::timeout(
                std::time::Duration::from_secs(5),
                async { tokio::join!(out.open_stream("/echo/1.0.0"), out.close()) },
            )
            .await
            .unwrap();

            assert_matches!(opened, Err(ConnectionError::Closed));
            assert!(out.is_closed());
        }
    }

    #[tokio::test]
    async fn test_close_is_observed_by_both_sides() {
        let (a, b) = (upgrader(), upgrader());
        let (out, inb) = connected(&a, &b).await;

        out.close().await;
        assert!(out.is_closed());
        // idempotent
        out.close().await;

        tokio::time::timeout(std::time::Duration::from_secs(5), inb.closed())
            .await
            .unwrap();
        assert!(inb.is_closed());
        assert_matches!(out.open_stream("/echo/1.0.0").await, Err(ConnectionError::Closed));
    }
}
