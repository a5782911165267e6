//! Fixtures for swarm tests: an in-process rendezvous broker, node
//! construction, the echo handler and polling helpers.

mod broker;
mod node;
mod wait;

pub use broker::RendezvousServer;
pub use node::{ECHO_PROTOCOL, echo, round_trip, spawn_node, tcp_any, ws_any};
pub use wait::eventually;

/// Installs a test log writer honoring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    plexus_observability::init_test_logging();
}
