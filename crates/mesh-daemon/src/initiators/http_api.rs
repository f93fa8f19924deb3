use super::Initiator;
use crate::error::PeerError;
use async_trait::async_trait;
use mesh_core::{InitiatorTarget, PeerConnection, SessionDescription, Transport};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Body of `POST /connect_peer`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectPeerRequest {
    #[serde(flatten)]
    pub description: SessionDescription,
    /// Uuid of the node making the request, informational only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_uuid: Option<String>,
}

/// Direct exchange with a node exposing the signaling endpoint.
pub struct HttpApiInitiator {
    endpoint: String,
    local_uuid: String,
    transport: Arc<dyn Transport>,
    client: reqwest::Client,
}

impl HttpApiInitiator {
    pub fn new(endpoint: &str, local_uuid: &str, transport: Arc<dyn Transport>) -> Self {
        let endpoint = match InitiatorTarget::http_api(endpoint) {
            InitiatorTarget::HttpApi { endpoint } => endpoint,
            _ => endpoint.to_string(),
        };
        Self {
            endpoint,
            local_uuid: local_uuid.to_string(),
            transport,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Initiator for HttpApiInitiator {
    fn target(&self) -> InitiatorTarget {
        InitiatorTarget::http_api(&self.endpoint)
    }

    async fn connect(&self) -> Result<Box<dyn PeerConnection>, PeerError> {
        let offer = self.transport.create_offer().await?;
        let request = ConnectPeerRequest {
            description: offer.description(),
            peer_uuid: Some(self.local_uuid.clone()),
        };

        let url = format!("{}/connect_peer", self.endpoint);
        debug!("Sending offer to {}", url);
        let response = self.client.post(&url).json(&request).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(PeerError::ConnectionFailure(format!(
                "{} answered {}",
                url, status
            )));
        }

        let answer: SessionDescription = response.json().await.map_err(|e| {
            PeerError::ConnectionFailure(format!("Invalid answer from {}: {}", url, e))
        })?;

        Ok(offer.complete(answer).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let request = ConnectPeerRequest {
            description: SessionDescription::new("tok", vec!["ws://a:1".into()]),
            peer_uuid: Some("p".into()),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["offer"], "tok");
        assert_eq!(value["iceCandidates"][0], "ws://a:1");
        assert_eq!(value["peerUuid"], "p");
    }

    #[test]
    fn test_request_without_peer_uuid() {
        let request: ConnectPeerRequest =
            serde_json::from_str(r#"{"offer":"tok","iceCandidates":[]}"#).unwrap();
        assert_eq!(request.description.offer, "tok");
        assert!(request.peer_uuid.is_none());
    }
}
