//! Peer knowledge and live connection tracking.
//!
//! [`PeerBook`] remembers every peer ever seen, connected or not.
//! [`ConnectionTable`] holds the live connections and keeps at most one
//! active connection per peer.

pub mod book;
pub mod events;
pub mod table;

pub use book::{IdentifyMetadata, PeerBook, PeerRecord};
pub use events::{EventEmitter, PeerBookEvent};
pub use table::{ConnectionTable, InsertOutcome};
