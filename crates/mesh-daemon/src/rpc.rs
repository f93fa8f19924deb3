//! Correlation of RPC requests with their responses.
//!
//! Each outgoing request registers a oneshot keyed by the envelope uuid.
//! Responses may arrive in any order; unknown or late responses are dropped.

use crate::error::PeerError;
use mesh_core::ControllerMessage;
use mesh_core::protocol::RpcEnvelope;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

pub type RpcResult = Result<ControllerMessage, PeerError>;

#[derive(Default)]
pub struct PendingRpcs {
    pending: Mutex<HashMap<String, oneshot::Sender<RpcResult>>>,
}

impl PendingRpcs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start waiting for the response to request `uuid`.
    pub fn register(&self, uuid: &str) -> oneshot::Receiver<RpcResult> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(uuid.to_string(), tx);
        rx
    }

    /// Stop waiting for `uuid` (timed out or never sent).
    pub fn cancel(&self, uuid: &str) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(uuid);
    }

    /// Complete the request matching a response envelope.
    ///
    /// Returns false when nobody is waiting for it.
    pub fn resolve(&self, envelope: RpcEnvelope) -> bool {
        let Some(tx) = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&envelope.uuid)
        else {
            debug!("Dropping response for unknown RPC {}", envelope.uuid);
            return false;
        };

        let result = match (envelope.error, envelope.message) {
            (Some(error), _) => Err(PeerError::RpcRejected(error)),
            (None, Some(message)) => Ok(*message),
            (None, None) => Err(PeerError::ProtocolViolation(
                "RPC response without message or error".to_string(),
            )),
        };
        // The caller may have given up already
        let _ = tx.send(result);
        true
    }

    /// Fail every outstanding request.
    pub fn fail_all(&self, error: PeerError) {
        let drained: Vec<_> = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        for (_, tx) in drained {
            let _ = tx.send(Err(error.clone()));
        }
    }

    pub fn len(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
