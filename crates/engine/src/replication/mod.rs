//! Replication between an authority and its peers
//!
//! - [`Authority`]: owns the final order of a trunk and hosts methods
//! - [`Replicator`]: keeps a peer trunk speculative until the authority
//!   acknowledges or rejects its commits
//! - [`Transport`]: how message blobs move; [`LoopbackTransport`] connects
//!   two ends in one process
//! - [`Message`]: what moves

pub mod authority;
pub mod message;
pub mod replicator;
pub mod transport;

pub use authority::{Authority, AuthorityStats, MethodHandler, Peer};
pub use message::Message;
pub use replicator::{Replicator, ReplicatorStats};
pub use transport::{LoopbackTransport, Receiver, Transport};
