//! Errors surfaced by peers and the peers manager.

use mesh_core::TransportError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum PeerError {
    /// Target unreachable, handshake timed out, or the remote rejected the offer
    #[error("Connection failure: {0}")]
    ConnectionFailure(String),

    #[error("RPC timed out after {0:?}")]
    RpcTimeout(Duration),

    #[error("Peer destroyed")]
    PeerDestroyed,

    /// Remote sent something that breaks the protocol contract
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Remote answered the RPC with an error
    #[error("RPC rejected: {0}")]
    RpcRejected(String),
}

impl From<TransportError> for PeerError {
    fn from(err: TransportError) -> Self {
        PeerError::ConnectionFailure(err.to_string())
    }
}

impl From<reqwest::Error> for PeerError {
    fn from(err: reqwest::Error) -> Self {
        PeerError::ConnectionFailure(err.to_string())
    }
}
