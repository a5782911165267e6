use std::io;

use plexus_net_primitives::{AddressError, Multiaddr};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("address not supported by this transport: {0}")]
    AddressUnsupported(Multiaddr),
    #[error("{addr} unreachable: {source}")]
    Unreachable {
        addr: Multiaddr,
        #[source]
        source: io::Error,
    },
    #[error("listener error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    pub(crate) fn unreachable(addr: &Multiaddr, source: io::Error) -> Self {
        Self::Unreachable {
            addr: addr.clone(),
            source,
        }
    }
}

impl From<AddressError> for TransportError {
    fn from(err: AddressError) -> Self {
        match err {
            AddressError::Unsupported(addr) => Self::AddressUnsupported(addr),
        }
    }
}
