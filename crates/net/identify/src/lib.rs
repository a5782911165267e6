//! Identify protocol.
//!
//! The side that opens an `/ipfs/id/1.0.0` stream reads one message; the
//! side that accepts it writes its own description and closes. The message
//! carries the sender's public key, which must hash to the peer id proven by
//! the connection's handshake.

use std::io;

use asynchronous_codec::Framed;
use futures::{SinkExt, TryStreamExt};
use libp2p::identity::PublicKey;
use plexus_net_codec::{CodecError, PostcardCodec};
use plexus_net_primitives::{Multiaddr, PeerId};
use plexus_net_upgrade::Stream;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const PROTOCOL: &str = "/ipfs/id/1.0.0";

const MAX_MESSAGE_SIZE: usize = 64 * 1024;

type IdentifyCodec = PostcardCodec<IdentifyMessage, IdentifyError>;

#[derive(Debug, thiserror::Error)]
pub enum IdentifyError {
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("stream closed before identify message")]
    ConnectionClosed,
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),
    #[error("public key belongs to {actual}, connection is with {expected}")]
    PeerMismatch { expected: PeerId, actual: PeerId },
    #[error("invalid multiaddress in identify message")]
    InvalidAddress,
}

impl From<io::Error> for IdentifyError {
    fn from(err: io::Error) -> Self {
        Self::Codec(CodecError::Io(err))
    }
}

/// A peer's self-description.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentifyInfo {
    pub public_key: PublicKey,
    pub protocol_version: String,
    pub agent_version: String,
    pub listen_addrs: Vec<Multiaddr>,
    /// The address the sender sees the receiver at.
    pub observed_addr: Option<Multiaddr>,
    pub protocols: Vec<String>,
}

impl IdentifyInfo {
    pub fn peer_id(&self) -> PeerId {
        self.public_key.to_peer_id()
    }
}

/// Wire form: keys and addresses as their binary encodings.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct IdentifyMessage {
    public_key: Vec<u8>,
    protocol_version: String,
    agent_version: String,
    listen_addrs: Vec<Vec<u8>>,
    observed_addr: Option<Vec<u8>>,
    protocols: Vec<String>,
}

impl From<&IdentifyInfo> for IdentifyMessage {
    fn from(info: &IdentifyInfo) -> Self {
        Self {
            public_key: info.public_key.encode_protobuf(),
            protocol_version: info.protocol_version.clone(),
            agent_version: info.agent_version.clone(),
            listen_addrs: info.listen_addrs.iter().map(|a| a.to_vec()).collect(),
            observed_addr: info.observed_addr.as_ref().map(|a| a.to_vec()),
            protocols: info.protocols.clone(),
        }
    }
}

impl TryFrom<IdentifyMessage> for IdentifyInfo {
    type Error = IdentifyError;

    fn try_from(msg: IdentifyMessage) -> Result<Self, Self::Error> {
        let public_key = PublicKey::try_decode_protobuf(&msg.public_key)
            .map_err(|e| IdentifyError::InvalidPublicKey(e.to_string()))?;
        let listen_addrs = msg
            .listen_addrs
            .into_iter()
            .map(Multiaddr::try_from)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| IdentifyError::InvalidAddress)?;
        let observed_addr = msg
            .observed_addr
            .map(Multiaddr::try_from)
            .transpose()
            .map_err(|_| IdentifyError::InvalidAddress)?;

        Ok(Self {
            public_key,
            protocol_version: msg.protocol_version,
            agent_version: msg.agent_version,
            listen_addrs,
            observed_addr,
            protocols: msg.protocols,
        })
    }
}

/// Answers an inbound identify stream with `info`, then closes it.
pub async fn respond(stream: Stream, info: &IdentifyInfo) -> Result<(), IdentifyError> {
    let remote = stream.remote_peer_id();
    let mut framed = Framed::new(stream, IdentifyCodec::new(MAX_MESSAGE_SIZE));

    debug!(peer_id = %remote, "identify: sending our info");
    framed.send(IdentifyMessage::from(info)).await?;
    framed.close().await?;
    Ok(())
}

/// Reads the remote's identify message from a stream we opened.
///
/// Fails if the advertised key does not belong to the stream's remote peer.
pub async fn request(stream: Stream) -> Result<IdentifyInfo, IdentifyError> {
    let expected = stream.remote_peer_id();
    let mut framed = Framed::new(stream, IdentifyCodec::new(MAX_MESSAGE_SIZE));

    let msg = framed
        .try_next()
        .await?
        .ok_or(IdentifyError::ConnectionClosed)?;
    let info = IdentifyInfo::try_from(msg)?;

    let actual = info.peer_id();
    if actual != expected {
        return Err(IdentifyError::PeerMismatch { expected, actual });
    }
    debug!(peer_id = %actual, agent = %info.agent_version, "identify: received peer info");
    Ok(info)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use libp2p::identity::Keypair;
    use plexus_net_primitives::TransportKind;
    use plexus_net_transport::ByteStream;
    use plexus_net_upgrade::{Connection, UpgradeConfig, Upgrader};
    use tokio_util::compat::TokioAsyncReadCompatExt;

    use super::*;

    async fn connect(a: Keypair, b: Keypair) -> (Connection, Connection) {
        let (s1, s2) = tokio::io::duplex(64 * 1024);
        let (s1, s2): (ByteStream, ByteStream) = (Box::new(s1.compat()), Box::new(s2.compat()));
        let addr: Multiaddr = "/ip4/127.0.0.1/tcp/1".parse().unwrap();
        let a = Upgrader::new(a, UpgradeConfig::default());
        let b = Upgrader::new(b, UpgradeConfig::default());
        let (out, inb) = tokio::join!(
            a.upgrade_outbound(s1, addr.clone(), TransportKind::Tcp, None),
            b.upgrade_inbound(s2, addr, TransportKind::Tcp),
        );
        (out.unwrap(), inb.unwrap())
    }

    fn info_for(key: &Keypair) -> IdentifyInfo {
        IdentifyInfo {
            public_key: key.public(),
            protocol_version: "ipfs/0.1.0".into(),
            agent_version: "plexus/0.1.0".into(),
            listen_addrs: vec!["/ip4/127.0.0.1/tcp/4001".parse().unwrap()],
            observed_addr: Some("/ip4/10.0.0.1/tcp/5555".parse().unwrap()),
            protocols: vec![PROTOCOL.into(), "/echo/1.0.0".into()],
        }
    }

    #[tokio::test]
    async fn test_identify_exchange() {
        let (ka, kb) = (Keypair::generate_ed25519(), Keypair::generate_ed25519());
        let info = info_for(&kb);
        let (a, b) = connect(ka, kb).await;

        let responder = {
            let info = info.clone();
            tokio::spawn(async move {
                let stream = b.accept_stream(&[PROTOCOL]).await.unwrap();
                respond(stream, &info).await.unwrap();
                b
            })
        };

        let stream = a.open_stream(PROTOCOL).await.unwrap();
        let received = request(stream).await.unwrap();
        assert_eq!(received, info);
        assert_eq!(received.peer_id(), a.remote_peer_id());
        let _b = responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_foreign_key_is_rejected() {
        let (ka, kb) = (Keypair::generate_ed25519(), Keypair::generate_ed25519());
        let impostor = info_for(&Keypair::generate_ed25519());
        let (a, b) = connect(ka, kb).await;

        let responder = tokio::spawn(async move {
            let stream = b.accept_stream(&[PROTOCOL]).await.unwrap();
            respond(stream, &impostor).await.unwrap();
            b
        });

        let stream = a.open_stream(PROTOCOL).await.unwrap();
        assert_matches!(request(stream).await, Err(IdentifyError::PeerMismatch { .. }));
        let _b = responder.await.unwrap();
    }
}
