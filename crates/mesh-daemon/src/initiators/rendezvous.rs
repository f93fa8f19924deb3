//! Offer/answer exchange through a rendezvous service.
//!
//! Both nodes derive the same conversation id from their two uuids. The node
//! with the smaller uuid hosts: it posts an offer and polls for the answer.
//! The other node polls for the offer, answers it and waits for the channel.
//!
//! ```text
//! POST/GET {host}/api/conversations/{conversation}/offer
//! POST/GET {host}/api/conversations/{conversation}/answer
//! ```
//!
//! A `GET` answering 404 means the counterpart has not posted yet.

use super::Initiator;
use crate::error::PeerError;
use async_trait::async_trait;
use mesh_core::{InitiatorTarget, PeerConnection, SessionDescription, Transport};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

/// What gets posted to and read from a conversation slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RendezvousMessage {
    /// Uuid of the node that posted the message
    pub from: String,
    /// For answers: the offer token being answered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
    pub description: SessionDescription,
}

/// Conversation id shared by two nodes, independent of who joins whom.
pub fn conversation_id(a: &str, b: &str) -> String {
    if a <= b {
        format!("{}_{}", a, b)
    } else {
        format!("{}_{}", b, a)
    }
}

pub struct RendezvousInitiator {
    host: String,
    target_uuid: String,
    local_uuid: String,
    is_host: bool,
    poll_interval: Duration,
    transport: Arc<dyn Transport>,
    client: reqwest::Client,
    /// Last offer token answered, so a stale offer is not answered twice
    last_answered: Mutex<Option<String>>,
}

impl RendezvousInitiator {
    pub fn new(
        host: &str,
        target_uuid: &str,
        local_uuid: &str,
        poll_interval: Duration,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let host = match InitiatorTarget::rendezvous(host, target_uuid) {
            InitiatorTarget::Rendezvous { host, .. } => host,
            _ => host.to_string(),
        };
        Self {
            host,
            target_uuid: target_uuid.to_string(),
            local_uuid: local_uuid.to_string(),
            is_host: local_uuid < target_uuid,
            poll_interval,
            transport,
            client: reqwest::Client::new(),
            last_answered: Mutex::new(None),
        }
    }

    pub fn is_host(&self) -> bool {
        self.is_host
    }

    fn slot_url(&self, slot: &str) -> String {
        format!(
            "{}/api/conversations/{}/{}",
            self.host,
            conversation_id(&self.local_uuid, &self.target_uuid),
            slot
        )
    }

    async fn post(&self, slot: &str, message: &RendezvousMessage) -> Result<(), PeerError> {
        let url = self.slot_url(slot);
        let response = self.client.post(&url).json(message).send().await?;
        if !response.status().is_success() {
            return Err(PeerError::ConnectionFailure(format!(
                "{} answered {}",
                url,
                response.status()
            )));
        }
        Ok(())
    }

    /// Fetch a slot. `Ok(None)` when it is still empty.
    async fn fetch(&self, slot: &str) -> Result<Option<RendezvousMessage>, PeerError> {
        let url = self.slot_url(slot);
        let response = self.client.get(&url).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let message = response.json().await.map_err(|e| {
                    PeerError::ConnectionFailure(format!("Invalid message from {}: {}", url, e))
                })?;
                Ok(Some(message))
            }
            status => Err(PeerError::ConnectionFailure(format!(
                "{} answered {}",
                url, status
            ))),
        }
    }

    async fn connect_as_host(&self) -> Result<Box<dyn PeerConnection>, PeerError> {
        let offer = self.transport.create_offer().await?;
        let description = offer.description();
        let token = description.offer.clone();

        // The service may not accept the conversation until it exists on both
        // ends; keep registering until it does.
        let message = RendezvousMessage {
            from: self.local_uuid.clone(),
            in_reply_to: None,
            description,
        };
        while let Err(e) = self.post("offer", &message).await {
            debug!("Rendezvous offer for {} not accepted yet: {}", self.target_uuid, e);
            tokio::time::sleep(self.poll_interval).await;
        }
        info!("Posted rendezvous offer for {}", self.target_uuid);

        loop {
            match self.fetch("answer").await? {
                Some(answer)
                    if answer.from == self.target_uuid
                        && answer.in_reply_to.as_deref() == Some(token.as_str()) =>
                {
                    return Ok(offer.complete(answer.description).await?);
                }
                _ => tokio::time::sleep(self.poll_interval).await,
            }
        }
    }

    async fn connect_as_guest(&self) -> Result<Box<dyn PeerConnection>, PeerError> {
        let offer = loop {
            match self.fetch("offer").await {
                Ok(Some(offer)) if offer.from == self.target_uuid && !self.already_answered(&offer) => {
                    break offer;
                }
                Ok(_) => {}
                Err(e) => debug!("Rendezvous offer for {} unavailable: {}", self.target_uuid, e),
            }
            tokio::time::sleep(self.poll_interval).await;
        };

        let token = offer.description.offer.clone();
        let (answer, pending) = self.transport.accept_offer(&offer.description).await?;
        self.post(
            "answer",
            &RendezvousMessage {
                from: self.local_uuid.clone(),
                in_reply_to: Some(token.clone()),
                description: answer,
            },
        )
        .await?;
        *self.last_answered.lock().unwrap_or_else(|e| e.into_inner()) = Some(token);
        info!("Answered rendezvous offer from {}", self.target_uuid);

        Ok(pending.open().await?)
    }

    fn already_answered(&self, offer: &RendezvousMessage) -> bool {
        self.last_answered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_deref()
            == Some(offer.description.offer.as_str())
    }
}

#[async_trait]
impl Initiator for RendezvousInitiator {
    fn target(&self) -> InitiatorTarget {
        InitiatorTarget::rendezvous(&self.host, &self.target_uuid)
    }

    /// The host posts the offer; the guest only answers it.
    fn opened_locally(&self) -> bool {
        self.is_host
    }

    async fn connect(&self) -> Result<Box<dyn PeerConnection>, PeerError> {
        if self.is_host {
            self.connect_as_host().await
        } else {
            self.connect_as_guest().await
        }
    }
}
