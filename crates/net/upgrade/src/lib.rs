//! Turns raw transport streams into authenticated, multiplexed connections.
//!
//! An upgrade runs three steps over the raw stream: negotiate `/noise`, run the
//! Noise XX handshake to learn the remote [`PeerId`](plexus_net_primitives::PeerId),
//! then negotiate and start a multiplexer. The result is a [`Connection`], a
//! cheap handle to a background driver task that owns the multiplexer.
//!
//! The same protocol-list exchange ([`negotiate`]) selects the application
//! protocol of every substream.

mod config;
mod connection;
mod error;
pub mod negotiate;
mod stream;
mod upgrader;

pub use config::UpgradeConfig;
pub use connection::{Connection, ConnectionId, Endpoint, PendingStream};
pub use error::{ConnectionError, NegotiationError, UpgradeError};
pub use stream::Stream;
pub use upgrader::{NOISE_PROTOCOL, Upgrader, YAMUX_PROTOCOL};
