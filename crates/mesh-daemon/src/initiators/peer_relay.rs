use super::Initiator;
use crate::error::PeerError;
use crate::manager::PeersManager;
use async_trait::async_trait;
use mesh_core::protocol::PeerConnectionInfoMessage;
use mesh_core::{ControllerMessage, InitiatorTarget, PeerConnection, SessionDescription, Transport};
use std::sync::{Arc, Weak};
use tracing::{debug, info};

/// Tunnels offer/answer material through already-connected peers as RPCs.
pub struct PeerRelayInitiator {
    target_uuid: String,
    manager: Weak<PeersManager>,
    transport: Arc<dyn Transport>,
}

impl PeerRelayInitiator {
    pub fn new(target_uuid: &str, manager: Weak<PeersManager>, transport: Arc<dyn Transport>) -> Self {
        Self {
            target_uuid: target_uuid.to_string(),
            manager,
            transport,
        }
    }
}

#[async_trait]
impl Initiator for PeerRelayInitiator {
    fn target(&self) -> InitiatorTarget {
        InitiatorTarget::peer_relay(&self.target_uuid)
    }

    async fn connect(&self) -> Result<Box<dyn PeerConnection>, PeerError> {
        let manager = self
            .manager
            .upgrade()
            .ok_or_else(|| PeerError::ConnectionFailure("Peers manager is gone".to_string()))?;

        let relays = manager.relay_candidates(&self.target_uuid);
        if relays.is_empty() {
            return Err(PeerError::ConnectionFailure(format!(
                "No connected peer can relay to {}",
                self.target_uuid
            )));
        }

        let offer = self.transport.create_offer().await?;
        let description = offer.description();
        let request = ControllerMessage::PeerConnectionInfo(PeerConnectionInfoMessage {
            peer_uuid: self.target_uuid.clone(),
            offer: Some(description.offer),
            ice_candidates: Some(description.ice_candidates),
        });

        for relay in relays {
            let relay_uuid = relay.uuid();
            match relay.send_rpc(request.clone()).await {
                Ok(ControllerMessage::PeerConnectionInfo(PeerConnectionInfoMessage {
                    offer: Some(answer),
                    ice_candidates,
                    ..
                })) => {
                    info!("Got answer from {} relayed by {}", self.target_uuid, relay_uuid);
                    let answer = SessionDescription::new(answer, ice_candidates.unwrap_or_default());
                    return Ok(offer.complete(answer).await?);
                }
                Ok(other) => {
                    debug!(
                        "Relay {} answered with unexpected {} message",
                        relay_uuid,
                        other.message_type()
                    );
                }
                Err(e) => {
                    debug!("Relay {} could not reach {}: {}", relay_uuid, self.target_uuid, e);
                }
            }
        }

        Err(PeerError::ConnectionFailure(format!(
            "No relay could reach {}",
            self.target_uuid
        )))
    }
}
