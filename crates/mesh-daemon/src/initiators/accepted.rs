use super::Initiator;
use crate::error::PeerError;
use async_trait::async_trait;
use mesh_core::{InitiatorTarget, PeerConnection, PendingConnection};
use std::sync::Mutex;

/// Answering side of a bootstrap that already happened elsewhere (signaling
/// endpoint, relayed RPC, rendezvous). Can connect exactly once.
pub struct AcceptedInitiator {
    session: String,
    pending: Mutex<Option<Box<dyn PendingConnection>>>,
}

impl AcceptedInitiator {
    pub fn new(session: &str, pending: Box<dyn PendingConnection>) -> Self {
        Self {
            session: session.to_string(),
            pending: Mutex::new(Some(pending)),
        }
    }
}

#[async_trait]
impl Initiator for AcceptedInitiator {
    fn target(&self) -> InitiatorTarget {
        InitiatorTarget::Accepted {
            session: self.session.clone(),
        }
    }

    fn opened_locally(&self) -> bool {
        false
    }

    async fn connect(&self) -> Result<Box<dyn PeerConnection>, PeerError> {
        let pending = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| {
                PeerError::ConnectionFailure(format!(
                    "Accepted session {} was already used",
                    self.session
                ))
            })?;
        Ok(pending.open().await?)
    }
}
