//! Rendezvous-brokered transports (`p2p-webrtc-star`, `p2p-websocket-star`).
//!
//! Both kinds reach peers through a broker speaking [`proto`] over WebSocket
//! binary frames. A listener keeps a control socket registered with the
//! broker; a dial opens a fresh socket, asks the broker for the target, and
//! once both sides are attached the broker splices their frames together.

mod discovery;
pub mod proto;
mod transport;

pub use discovery::RendezvousDiscovery;
pub use transport::RendezvousTransport;
