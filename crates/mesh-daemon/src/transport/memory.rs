//! In-process transport.
//!
//! Nodes sharing one [`MemoryNetwork`] exchange offer tokens instead of
//! network addresses; accepting an offer creates a channel pair and parks the
//! offerer's end until it completes the offer with the answer. Used by tests
//! and by embedders running several nodes in one process.

use async_trait::async_trait;
use mesh_core::transport::Result;
use mesh_core::{
    OutgoingOffer, PeerConnection, PendingConnection, SessionDescription, Transport,
    TransportError,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tracing::debug;
use uuid::Uuid;

/// Shared hub of parked connections.
#[derive(Default)]
pub struct MemoryNetwork {
    answered: Mutex<HashMap<String, MemoryConnection>>,
    /// Close switches of every connection created, for fault injection
    links: Mutex<Vec<Weak<watch::Sender<bool>>>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A transport endpoint on this network.
    pub fn transport(self: &Arc<Self>, label: &str) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            network: Arc::clone(self),
            label: label.to_string(),
        })
    }

    /// Close every open connection, as if the network went down.
    ///
    /// Returns the number of connections closed.
    pub fn sever_all(&self) -> usize {
        let mut links = self.links.lock().unwrap_or_else(|e| e.into_inner());
        let mut closed = 0;
        links.retain(|link| match link.upgrade() {
            Some(switch) => {
                if !*switch.borrow() {
                    switch.send_replace(true);
                    closed += 1;
                }
                false
            }
            None => false,
        });
        closed
    }

    fn pair(&self, offerer: &str, answerer: &str) -> (MemoryConnection, MemoryConnection) {
        let (a, b) = MemoryConnection::pair(offerer, answerer);
        self.links
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::downgrade(&a.closed));
        (a, b)
    }

    fn discard_answer(&self, token: &str) {
        self.answered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(token);
    }
}

pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
    label: String,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn create_offer(&self) -> Result<Box<dyn OutgoingOffer>> {
        Ok(Box::new(MemoryOffer {
            network: Arc::clone(&self.network),
            token: Uuid::new_v4().to_string(),
        }))
    }

    async fn accept_offer(
        &self,
        offer: &SessionDescription,
    ) -> Result<(SessionDescription, Box<dyn PendingConnection>)> {
        if offer.offer.is_empty() {
            return Err(TransportError::InvalidDescription("empty offer token".into()));
        }
        let (offerer_end, answerer_end) = self.network.pair(&offer.offer, &self.label);
        self.network
            .answered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(offer.offer.clone(), offerer_end);
        debug!("{} answered memory offer {}", self.label, offer.offer);

        let answer = SessionDescription::new(offer.offer.clone(), Vec::new());
        Ok((
            answer,
            Box::new(MemoryPending {
                network: Arc::clone(&self.network),
                token: offer.offer.clone(),
                connection: Some(answerer_end),
            }),
        ))
    }
}

struct MemoryOffer {
    network: Arc<MemoryNetwork>,
    token: String,
}

#[async_trait]
impl OutgoingOffer for MemoryOffer {
    fn description(&self) -> SessionDescription {
        SessionDescription::new(self.token.clone(), Vec::new())
    }

    async fn complete(
        self: Box<Self>,
        answer: SessionDescription,
    ) -> Result<Box<dyn PeerConnection>> {
        if answer.offer != self.token {
            return Err(TransportError::InvalidDescription(format!(
                "answer for {} does not match offer {}",
                answer.offer, self.token
            )));
        }
        let connection = self
            .network
            .answered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.token)
            .ok_or_else(|| {
                TransportError::ConnectionFailed(format!("offer {} was never answered", self.token))
            })?;
        Ok(Box::new(connection))
    }
}

impl Drop for MemoryOffer {
    fn drop(&mut self) {
        self.network.discard_answer(&self.token);
    }
}

struct MemoryPending {
    network: Arc<MemoryNetwork>,
    token: String,
    connection: Option<MemoryConnection>,
}

#[async_trait]
impl PendingConnection for MemoryPending {
    async fn open(mut self: Box<Self>) -> Result<Box<dyn PeerConnection>> {
        let connection = self.connection.take().ok_or(TransportError::Closed)?;
        Ok(Box::new(connection))
    }
}

impl Drop for MemoryPending {
    fn drop(&mut self) {
        // Never opened: the parked offerer end has nobody to talk to
        if self.connection.is_some() {
            self.network.discard_answer(&self.token);
        }
    }
}

/// One end of an in-process channel pair.
pub struct MemoryConnection {
    label: String,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: AsyncMutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    /// Shared by both ends; flipping it closes the pair
    closed: Arc<watch::Sender<bool>>,
}

impl MemoryConnection {
    /// Two connected ends, labelled by the remote they talk to.
    pub fn pair(left: &str, right: &str) -> (Self, Self) {
        let (left_tx, right_rx) = mpsc::unbounded_channel();
        let (right_tx, left_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);

        (
            Self {
                label: format!("memory:{}", right),
                tx: left_tx,
                rx: AsyncMutex::new(left_rx),
                closed: Arc::clone(&closed),
            },
            Self {
                label: format!("memory:{}", left),
                tx: right_tx,
                rx: AsyncMutex::new(right_rx),
                closed,
            },
        )
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[async_trait]
impl PeerConnection for MemoryConnection {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send(&self, data: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.tx
            .send(data.to_vec())
            .map_err(|_| TransportError::Closed)
    }

    /// Messages written before the pair was closed are still delivered.
    async fn recv(&self) -> Result<Vec<u8>> {
        let mut closed = self.closed.subscribe();
        let mut rx = self.rx.lock().await;
        if let Ok(data) = rx.try_recv() {
            return Ok(data);
        }
        if *closed.borrow_and_update() {
            return Err(TransportError::Closed);
        }

        tokio::select! {
            data = rx.recv() => data.ok_or(TransportError::Closed),
            _ = closed.changed() => rx.try_recv().map_err(|_| TransportError::Closed),
        }
    }

    async fn close(&self) -> Result<()> {
        self.closed.send_replace(true);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connected_pair() -> (Box<dyn PeerConnection>, Box<dyn PeerConnection>) {
        let network = MemoryNetwork::new();
        let alice = network.transport("alice");
        let bob = network.transport("bob");

        let offer = alice.create_offer().await.unwrap();
        let (answer, pending) = bob.accept_offer(&offer.description()).await.unwrap();
        let bob_end = pending.open().await.unwrap();
        let alice_end = offer.complete(answer).await.unwrap();
        (alice_end, bob_end)
    }

    #[tokio::test]
    async fn test_offer_answer_roundtrip() {
        let (alice, bob) = connected_pair().await;

        alice.send(b"one").await.unwrap();
        alice.send(b"two").await.unwrap();
        bob.send(b"back").await.unwrap();

        assert_eq!(bob.recv().await.unwrap(), b"one");
        assert_eq!(bob.recv().await.unwrap(), b"two");
        assert_eq!(alice.recv().await.unwrap(), b"back");
    }

    #[tokio::test]
    async fn test_close_wakes_both_ends() {
        let (alice, bob) = connected_pair().await;

        let waiting = tokio::spawn(async move { bob.recv().await });
        alice.close().await.unwrap();

        assert!(matches!(waiting.await.unwrap(), Err(TransportError::Closed)));
        assert!(matches!(alice.recv().await, Err(TransportError::Closed)));
        assert!(matches!(alice.send(b"x").await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_messages_sent_before_close_are_delivered() {
        let (alice, bob) = connected_pair().await;

        alice.send(b"last words").await.unwrap();
        alice.close().await.unwrap();

        assert_eq!(bob.recv().await.unwrap(), b"last words");
        assert!(matches!(bob.recv().await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_unanswered_offer_fails() {
        let network = MemoryNetwork::new();
        let alice = network.transport("alice");
        let offer = alice.create_offer().await.unwrap();
        let token = offer.description().offer;

        let result = offer.complete(SessionDescription::new(token, vec![])).await;
        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
    }

    #[tokio::test]
    async fn test_abandoned_offer_releases_answer() {
        let network = MemoryNetwork::new();
        let alice = network.transport("alice");
        let bob = network.transport("bob");

        let offer = alice.create_offer().await.unwrap();
        let (_answer, pending) = bob.accept_offer(&offer.description()).await.unwrap();
        let _bob_end = pending.open().await.unwrap();
        assert_eq!(network.answered.lock().unwrap().len(), 1);

        drop(offer);
        assert!(network.answered.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unopened_answer_is_released() {
        let network = MemoryNetwork::new();
        let alice = network.transport("alice");
        let bob = network.transport("bob");

        let offer = alice.create_offer().await.unwrap();
        let (answer, pending) = bob.accept_offer(&offer.description()).await.unwrap();
        drop(pending);
        assert!(network.answered.lock().unwrap().is_empty());

        let result = offer.complete(answer).await;
        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
    }

    #[tokio::test]
    async fn test_sever_all() {
        let network = MemoryNetwork::new();
        let alice = network.transport("alice");
        let bob = network.transport("bob");
        let offer = alice.create_offer().await.unwrap();
        let (answer, pending) = bob.accept_offer(&offer.description()).await.unwrap();
        let bob_end = pending.open().await.unwrap();
        let _alice_end = offer.complete(answer).await.unwrap();

        assert_eq!(network.sever_all(), 1);
        assert!(matches!(bob_end.recv().await, Err(TransportError::Closed)));
        assert_eq!(network.sever_all(), 0);
    }
}
