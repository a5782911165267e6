use std::io;

use plexus_net_codec::CodecError;

#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    /// The remote rejected every protocol we proposed.
    #[error("remote rejected protocols {0:?}")]
    Rejected(Vec<String>),
    /// The remote proposed nothing we support.
    #[error("no supported protocol in proposal {0:?}")]
    NoCommonProtocol(Vec<String>),
    #[error("unexpected negotiation message")]
    UnexpectedMessage,
    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[derive(Debug, thiserror::Error)]
pub enum UpgradeError {
    #[error("secure handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("no shared multiplexer")]
    NoSharedMultiplexer,
    #[error("multiplexer setup failed: {0}")]
    Multiplexer(String),
    #[error("upgrade timed out")]
    Timeout,
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection closed")]
    Closed,
    #[error("protocol not supported by remote: {0}")]
    ProtocolNotSupported(String),
    #[error("timed out opening stream")]
    StreamOpenTimeout,
    #[error(transparent)]
    Negotiation(NegotiationError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<NegotiationError> for ConnectionError {
    fn from(err: NegotiationError) -> Self {
        match err {
            NegotiationError::Codec(CodecError::Io(e)) => Self::Io(e),
            other => Self::Negotiation(other),
        }
    }
}
