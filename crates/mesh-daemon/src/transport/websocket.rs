//! WebSocket transport.
//!
//! Session descriptions carry a one-time token in `offer` and the reachable
//! `ws://` URLs of their author in `iceCandidates`. Whichever side advertised
//! URLs is dialled by the other; the first frame on a dialled socket is the
//! token, which the accept loop uses to hand the socket to the waiting offer.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use mesh_core::transport::Result;
use mesh_core::{
    OutgoingOffer, PeerConnection, PendingConnection, SessionDescription, Transport,
    TransportError,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex as AsyncMutex, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, accept_async, connect_async,
    tungstenite::{Error as WsError, Message},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Time allowed for a dialled socket to upgrade and present its token.
const ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);

struct WsShared {
    /// URL other nodes can dial, None for a client-only transport
    advertised: Option<String>,
    /// Offers (or answers) waiting for the remote to dial in, by token
    waiting: Mutex<HashMap<String, oneshot::Sender<WsStream>>>,
}

impl WsShared {
    fn wait_for(&self, token: &str) -> oneshot::Receiver<WsStream> {
        let (tx, rx) = oneshot::channel();
        self.waiting
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(token.to_string(), tx);
        rx
    }

    fn forget(&self, token: &str) {
        self.waiting
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(token);
    }

    fn candidates(&self) -> Vec<String> {
        self.advertised.iter().cloned().collect()
    }
}

pub struct WsTransport {
    shared: Arc<WsShared>,
    local_addr: Option<SocketAddr>,
    accept_task: Option<JoinHandle<()>>,
}

impl WsTransport {
    /// Listen on `listen` and advertise `advertise` (defaults to
    /// `ws://<bound address>`).
    pub async fn bind(listen: &str, advertise: Option<String>) -> std::io::Result<Arc<Self>> {
        let listener = TcpListener::bind(listen).await?;
        let local_addr = listener.local_addr()?;
        let advertised = advertise.unwrap_or_else(|| format!("ws://{}", local_addr));
        info!("WebSocket transport listening on {} (advertised as {})", local_addr, advertised);

        let shared = Arc::new(WsShared {
            advertised: Some(advertised),
            waiting: Mutex::new(HashMap::new()),
        });
        let accept_task = tokio::spawn(accept_loop(listener, Arc::clone(&shared)));

        Ok(Arc::new(Self {
            shared,
            local_addr: Some(local_addr),
            accept_task: Some(accept_task),
        }))
    }

    /// A transport that only dials out. It can only reach nodes that
    /// advertise an address.
    pub fn client_only() -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(WsShared {
                advertised: None,
                waiting: Mutex::new(HashMap::new()),
            }),
            local_addr: None,
            accept_task: None,
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn advertised_url(&self) -> Option<&str> {
        self.shared.advertised.as_deref()
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<WsShared>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    if let Err(e) = route_incoming(stream, addr, shared).await {
                        debug!("Dropped incoming connection from {}: {}", addr, e);
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

/// Upgrade a dialled socket and hand it to whoever waits for its token.
async fn route_incoming(stream: TcpStream, addr: SocketAddr, shared: Arc<WsShared>) -> Result<()> {
    let mut ws = tokio::time::timeout(ACCEPT_TIMEOUT, accept_async(MaybeTlsStream::Plain(stream)))
        .await
        .map_err(|_| TransportError::ConnectionFailed("upgrade timed out".into()))?
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

    let first = tokio::time::timeout(ACCEPT_TIMEOUT, ws.next())
        .await
        .map_err(|_| TransportError::ConnectionFailed("no token received".into()))?;
    let token = match first {
        Some(Ok(Message::Text(text))) => text.to_string(),
        Some(Ok(Message::Binary(data))) => String::from_utf8_lossy(&data).into_owned(),
        Some(Ok(other)) => {
            return Err(TransportError::InvalidDescription(format!(
                "expected token, got {:?}",
                other
            )));
        }
        Some(Err(e)) => return Err(TransportError::ReceiveFailed(e.to_string())),
        None => return Err(TransportError::Closed),
    };

    let waiter = shared
        .waiting
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&token);
    match waiter {
        Some(tx) => {
            debug!("Incoming connection from {} matched token {}", addr, token);
            if let Err(mut ws) = tx.send(ws) {
                let _ = ws.close(None).await;
            }
            Ok(())
        }
        None => {
            warn!("Incoming connection from {} with unknown token", addr);
            let _ = ws.close(None).await;
            Err(TransportError::InvalidDescription("unknown token".into()))
        }
    }
}

/// Dial the first reachable candidate and present `token`.
async fn dial(candidates: &[String], token: &str) -> Result<Box<dyn PeerConnection>> {
    let mut last_error = TransportError::ConnectionFailed("no candidates".into());
    for url in candidates {
        match connect_async(url.as_str()).await {
            Ok((mut ws, _)) => {
                ws.send(Message::Text(token.to_string().into()))
                    .await
                    .map_err(|e| TransportError::SendFailed(e.to_string()))?;
                debug!("Dialled {}", url);
                return Ok(Box::new(WsConnection::new(ws, url.clone())));
            }
            Err(e) => {
                debug!("Could not dial {}: {}", url, e);
                last_error = TransportError::ConnectionFailed(format!("{}: {}", url, e));
            }
        }
    }
    Err(last_error)
}

async fn wait_for_dial(rx: oneshot::Receiver<WsStream>, token: &str) -> Result<Box<dyn PeerConnection>> {
    let ws = rx.await.map_err(|_| TransportError::Closed)?;
    Ok(Box::new(WsConnection::new(ws, format!("ws-accepted:{}", token))))
}

#[async_trait]
impl Transport for WsTransport {
    async fn create_offer(&self) -> Result<Box<dyn OutgoingOffer>> {
        let token = Uuid::new_v4().to_string();
        let rx = self
            .shared
            .advertised
            .is_some()
            .then(|| self.shared.wait_for(&token));
        Ok(Box::new(WsOffer {
            shared: Arc::clone(&self.shared),
            token,
            rx,
        }))
    }

    async fn accept_offer(
        &self,
        offer: &SessionDescription,
    ) -> Result<(SessionDescription, Box<dyn PendingConnection>)> {
        if !offer.ice_candidates.is_empty() {
            // Offerer is reachable: we dial it
            let answer = SessionDescription::new(offer.offer.clone(), Vec::new());
            let pending = WsPending::Dial {
                candidates: offer.ice_candidates.clone(),
                token: offer.offer.clone(),
            };
            return Ok((answer, Box::new(pending)));
        }

        if self.shared.advertised.is_none() {
            return Err(TransportError::ConnectionFailed(
                "neither side advertises an address".into(),
            ));
        }
        let token = Uuid::new_v4().to_string();
        let rx = self.shared.wait_for(&token);
        let answer = SessionDescription::new(token.clone(), self.shared.candidates());
        let pending = WsPending::Wait(DialWait {
            shared: Arc::clone(&self.shared),
            token,
            rx: Some(rx),
        });
        Ok((answer, Box::new(pending)))
    }
}

struct WsOffer {
    shared: Arc<WsShared>,
    token: String,
    rx: Option<oneshot::Receiver<WsStream>>,
}

#[async_trait]
impl OutgoingOffer for WsOffer {
    fn description(&self) -> SessionDescription {
        SessionDescription::new(self.token.clone(), self.shared.candidates())
    }

    async fn complete(
        mut self: Box<Self>,
        answer: SessionDescription,
    ) -> Result<Box<dyn PeerConnection>> {
        if !answer.ice_candidates.is_empty() {
            self.shared.forget(&self.token);
            return dial(&answer.ice_candidates, &answer.offer).await;
        }
        match self.rx.take() {
            Some(rx) => wait_for_dial(rx, &self.token).await,
            None => Err(TransportError::ConnectionFailed(
                "answer carries no address to dial".into(),
            )),
        }
    }
}

impl Drop for WsOffer {
    fn drop(&mut self) {
        self.shared.forget(&self.token);
    }
}

enum WsPending {
    Dial { candidates: Vec<String>, token: String },
    Wait(DialWait),
}

/// Answer parked until the offerer dials in. Unregisters its token when
/// dropped, opened or not.
struct DialWait {
    shared: Arc<WsShared>,
    token: String,
    rx: Option<oneshot::Receiver<WsStream>>,
}

impl DialWait {
    async fn open(mut self) -> Result<Box<dyn PeerConnection>> {
        let rx = self.rx.take().ok_or(TransportError::Closed)?;
        wait_for_dial(rx, &self.token).await
    }
}

impl Drop for DialWait {
    fn drop(&mut self) {
        self.shared.forget(&self.token);
    }
}

#[async_trait]
impl PendingConnection for WsPending {
    async fn open(self: Box<Self>) -> Result<Box<dyn PeerConnection>> {
        match *self {
            WsPending::Dial { candidates, token } => dial(&candidates, &token).await,
            WsPending::Wait(waiting) => waiting.open().await,
        }
    }
}

/// An open WebSocket, split so reads and writes do not block each other.
pub struct WsConnection {
    label: String,
    write: AsyncMutex<SplitSink<WsStream, Message>>,
    read: AsyncMutex<SplitStream<WsStream>>,
    closed: watch::Sender<bool>,
}

impl WsConnection {
    fn new(ws: WsStream, label: String) -> Self {
        let (write, read) = ws.split();
        let (closed, _) = watch::channel(false);
        Self {
            label,
            write: AsyncMutex::new(write),
            read: AsyncMutex::new(read),
            closed,
        }
    }
}

#[async_trait]
impl PeerConnection for WsConnection {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send(&self, data: &[u8]) -> Result<()> {
        if *self.closed.borrow() {
            return Err(TransportError::Closed);
        }
        let mut write = self.write.lock().await;
        write
            .send(Message::Binary(data.to_vec().into()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn recv(&self) -> Result<Vec<u8>> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(TransportError::Closed);
        }

        let mut read = self.read.lock().await;
        loop {
            let next = tokio::select! {
                next = read.next() => next,
                _ = closed.changed() => return Err(TransportError::Closed),
            };
            match next {
                Some(Ok(msg)) => match msg {
                    Message::Binary(data) => return Ok(data.to_vec()),
                    Message::Text(text) => return Ok(text.as_bytes().to_vec()),
                    Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
                    Message::Close(_) => {
                        debug!("Received close frame from {}", self.label);
                        return Err(TransportError::Closed);
                    }
                },
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
                    return Err(TransportError::Closed);
                }
                Some(Err(e)) => return Err(TransportError::ReceiveFailed(e.to_string())),
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.closed.send_replace(true);
        if let Ok(mut write) = self.write.try_lock() {
            let _ = write.send(Message::Close(None)).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_offer_answer_over_loopback() {
        let alice = WsTransport::bind("127.0.0.1:0", None).await.unwrap();
        let bob = WsTransport::bind("127.0.0.1:0", None).await.unwrap();

        let offer = alice.create_offer().await.unwrap();
        let description = offer.description();
        assert_eq!(description.ice_candidates.len(), 1);

        let (answer, pending) = bob.accept_offer(&description).await.unwrap();
        let (alice_end, bob_end) = tokio::join!(offer.complete(answer), pending.open());
        let alice_end = alice_end.unwrap();
        let bob_end = bob_end.unwrap();

        alice_end.send(b"hello").await.unwrap();
        assert_eq!(bob_end.recv().await.unwrap(), b"hello");
        bob_end.send(b"world").await.unwrap();
        assert_eq!(alice_end.recv().await.unwrap(), b"world");

        alice_end.close().await.unwrap();
        assert!(matches!(alice_end.recv().await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_client_only_offer_is_dialled_back() {
        let client = WsTransport::client_only();
        let server = WsTransport::bind("127.0.0.1:0", None).await.unwrap();

        let offer = client.create_offer().await.unwrap();
        assert!(offer.description().ice_candidates.is_empty());

        let (answer, pending) = server.accept_offer(&offer.description()).await.unwrap();
        assert_eq!(answer.ice_candidates.len(), 1);

        let (client_end, server_end) = tokio::join!(offer.complete(answer), pending.open());
        let client_end = client_end.unwrap();
        let server_end = server_end.unwrap();

        server_end.send(b"ping").await.unwrap();
        assert_eq!(client_end.recv().await.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn test_dropped_answer_stops_waiting() {
        let client = WsTransport::client_only();
        let server = WsTransport::bind("127.0.0.1:0", None).await.unwrap();

        let offer = client.create_offer().await.unwrap();
        let (_answer, pending) = server.accept_offer(&offer.description()).await.unwrap();
        assert_eq!(server.shared.waiting.lock().unwrap().len(), 1);

        drop(pending);
        assert!(server.shared.waiting.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_offer_stops_waiting() {
        let alice = WsTransport::bind("127.0.0.1:0", None).await.unwrap();
        let offer = alice.create_offer().await.unwrap();
        assert_eq!(alice.shared.waiting.lock().unwrap().len(), 1);

        drop(offer);
        assert!(alice.shared.waiting.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_two_client_only_nodes_cannot_connect() {
        let a = WsTransport::client_only();
        let b = WsTransport::client_only();
        let offer = a.create_offer().await.unwrap();
        assert!(b.accept_offer(&offer.description()).await.is_err());
    }
}
