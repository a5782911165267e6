use plexus_net_primitives::{Multiaddr, PeerId};
use plexus_net_transport::TransportError;
use plexus_net_upgrade::{ConnectionError, UpgradeError};

use crate::config::ConfigError;

/// Coarse grouping of failures, for logging and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorCategory {
    /// The target could not be turned into a dialable address. Fixable by the caller.
    AddressResolution,
    /// No transport produced a byte stream. Retryable.
    DialFailure,
    /// A byte stream was reached but could not be secured or multiplexed.
    UpgradeFailure,
    /// A connection exists but the requested stream could not be opened.
    /// The connection stays usable for other protocols.
    ProtocolFailure,
    Shutdown,
}

#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("no known address for peer {0}")]
    NoKnownAddress(PeerId),
    #[error("refusing to dial the local peer")]
    DialSelf,
    #[error("all {attempts} dial candidates failed")]
    AllCandidatesFailed {
        attempts: usize,
        #[source]
        last: Option<TransportError>,
    },
    #[error("connection upgrade failed: {0}")]
    UpgradeFailed(#[from] UpgradeError),
    #[error("protocol not supported by remote: {0}")]
    ProtocolNotSupported(String),
    #[error("timed out opening stream")]
    StreamOpenTimeout,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("stream failed: {0}")]
    Stream(ConnectionError),
    #[error("swarm is stopped")]
    Stopped,
}

impl DialError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NoKnownAddress(_) | Self::DialSelf => ErrorCategory::AddressResolution,
            Self::AllCandidatesFailed { .. } => ErrorCategory::DialFailure,
            Self::UpgradeFailed(_) => ErrorCategory::UpgradeFailure,
            Self::ProtocolNotSupported(_)
            | Self::StreamOpenTimeout
            | Self::ConnectionClosed
            | Self::Stream(_) => ErrorCategory::ProtocolFailure,
            Self::Stopped => ErrorCategory::Shutdown,
        }
    }
}

impl From<ConnectionError> for DialError {
    fn from(err: ConnectionError) -> Self {
        match err {
            ConnectionError::Closed => Self::ConnectionClosed,
            ConnectionError::ProtocolNotSupported(p) => Self::ProtocolNotSupported(p),
            ConnectionError::StreamOpenTimeout => Self::StreamOpenTimeout,
            other => Self::Stream(other),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ListenError {
    #[error("no transport can listen on {0}")]
    Unsupported(Multiaddr),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("swarm is stopped")]
    Stopped,
}
