//! Transport capability traits.
//!
//! The control plane never touches sockets directly. A transport provides an
//! offer/answer bootstrap and, once both sides exchanged their material, an
//! ordered reliable message channel.
//!
//! ```text
//! Offerer                                  Answerer
//!   create_offer() ── description ──────▶ accept_offer(offer)
//!                  ◀───────── answer ──── (returns PendingConnection)
//!   complete(answer)                       open()
//!        └──────────── PeerConnection ─────────┘
//! ```
//!
//! How the descriptions travel (HTTP, rendezvous server, relayed through a
//! third peer) is the initiator's business, not the transport's.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Invalid session description: {0}")]
    InvalidDescription(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Connection closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Opaque offer or answer material.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescription {
    pub offer: String,
    #[serde(default)]
    pub ice_candidates: Vec<String>,
}

impl SessionDescription {
    pub fn new(offer: impl Into<String>, ice_candidates: Vec<String>) -> Self {
        Self {
            offer: offer.into(),
            ice_candidates,
        }
    }
}

/// An open, ordered, reliable message channel to one remote node.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Short description of the remote end, for logs
    fn label(&self) -> &str;

    /// Send one message
    async fn send(&self, data: &[u8]) -> Result<()>;

    /// Receive the next message. Returns `Closed` once the channel is gone.
    async fn recv(&self) -> Result<Vec<u8>>;

    /// Close the channel. Closing twice is not an error.
    async fn close(&self) -> Result<()>;
}

/// Offer created locally, waiting for the remote's answer.
#[async_trait]
pub trait OutgoingOffer: Send {
    fn description(&self) -> SessionDescription;

    async fn complete(self: Box<Self>, answer: SessionDescription)
    -> Result<Box<dyn PeerConnection>>;
}

/// Answering side of a bootstrap, waiting for the channel to open.
#[async_trait]
pub trait PendingConnection: Send {
    async fn open(self: Box<Self>) -> Result<Box<dyn PeerConnection>>;
}

/// Factory for connections.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn create_offer(&self) -> Result<Box<dyn OutgoingOffer>>;

    async fn accept_offer(
        &self,
        offer: &SessionDescription,
    ) -> Result<(SessionDescription, Box<dyn PendingConnection>)>;
}
