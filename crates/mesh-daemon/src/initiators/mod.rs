//! Connection bootstrapping strategies.
//!
//! An initiator knows how to get offer/answer material to a remote node and
//! back. It yields an open [`PeerConnection`] or fails with
//! [`PeerError::ConnectionFailure`]; retrying is the peer's business.

mod accepted;
mod http_api;
mod peer_relay;
mod rendezvous;

pub use accepted::AcceptedInitiator;
pub use http_api::{ConnectPeerRequest, HttpApiInitiator};
pub use peer_relay::PeerRelayInitiator;
pub use rendezvous::{RendezvousInitiator, RendezvousMessage, conversation_id};

use crate::error::PeerError;
use async_trait::async_trait;
use mesh_core::{InitiatorTarget, PeerConnection};

#[async_trait]
pub trait Initiator: Send + Sync {
    /// What this initiator connects to; equal targets are duplicate joins.
    fn target(&self) -> InitiatorTarget;

    /// Whether this node opened the connection. Both ends of a link must
    /// agree on the opener when settling duplicates.
    fn opened_locally(&self) -> bool {
        true
    }

    /// Bootstrap a fresh connection. Safe to call again after a failure.
    async fn connect(&self) -> Result<Box<dyn PeerConnection>, PeerError>;
}
