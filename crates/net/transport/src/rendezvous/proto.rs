//! Broker wire protocol. One postcard message per WebSocket binary frame.

use futures::{Sink, SinkExt, Stream, StreamExt};
use plexus_net_codec::CodecError;
use plexus_net_primitives::PeerId;
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::{self, Message};

pub const MAX_MESSAGE_SIZE: usize = 16 * 1024;

/// Broker-assigned identifier pairing a dial socket with its accept socket.
pub type SessionId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// First message on a control socket.
    Register { peer: PeerId },
    /// First message on a dial socket.
    Dial { from: PeerId, to: PeerId },
    /// First message on an accept socket, answering `Incoming`.
    Accept { session: SessionId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BrokerMessage {
    Registered,
    PeerJoined { peer: PeerId },
    PeerLeft { peer: PeerId },
    Incoming { session: SessionId, from: PeerId },
    /// Both ends are attached; frames after this one are relayed verbatim.
    Connected,
    DialFailed { reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    WebSocket(#[from] tungstenite::Error),
}

impl From<ProtoError> for std::io::Error {
    fn from(err: ProtoError) -> Self {
        match err {
            ProtoError::Codec(CodecError::Io(e)) => e,
            ProtoError::WebSocket(e) => crate::ws::into_io_error(e),
            other => std::io::Error::other(other),
        }
    }
}

pub async fn send<S, M>(sink: &mut S, msg: &M) -> Result<(), ProtoError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
    M: Serialize,
{
    let body = plexus_net_codec::encode(msg, MAX_MESSAGE_SIZE)?;
    sink.send(Message::binary(body)).await?;
    Ok(())
}

/// Next broker-protocol message, or `None` once the socket is closed.
pub async fn recv<S, M>(stream: &mut S) -> Result<Option<M>, ProtoError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    M: for<'de> Deserialize<'de>,
{
    while let Some(msg) = stream.next().await {
        match msg? {
            Message::Binary(data) => return Ok(Some(plexus_net_codec::decode(&data)?)),
            Message::Close(_) => return Ok(None),
            _ => {}
        }
    }
    Ok(None)
}
