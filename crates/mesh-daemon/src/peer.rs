//! One remote node and the connection to it.
//!
//! A peer owns an initiator and runs the state machine
//!
//! ```text
//! Idle → Connecting → Connected → Disconnected → Destroyed
//!             ↑                        │
//!             └──── (recovery) ────────┘
//! ```
//!
//! Every connection attempt gets a new generation number. Tasks spawned for
//! a connection (reader, writer, liveness, timekeeping) carry the generation
//! they belong to and ignore themselves once it is stale.

use crate::error::PeerError;
use crate::initiators::Initiator;
use crate::rpc::PendingRpcs;
use mesh_core::protocol::{
    PeerInfoMessage, ProtocolError, RpcEnvelope, TimekeepResponseMessage, decode, encode,
};
use mesh_core::reconnect::duration_ms;
use mesh_core::timekeeping::next_delay;
use mesh_core::{
    ControllerMessage, DisconnectReason, InitiatorKind, InitiatorTarget, LocalPeer,
    PeerConnection, PeerState, ReconnectConfig, ReconnectState, TimekeepConfig,
    TimekeepEstimator, TimekeepSample, now_ms,
};
use serde::Deserialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};

/// Messages queued while not connected. Further sends fail.
pub const MAX_PENDING_MESSAGES: usize = 256;

/// How long destroy waits for the disconnect notice to be written.
const DISCONNECT_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Keepalive and handshake timing.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LivenessConfig {
    #[serde(with = "duration_ms")]
    pub ping_interval: Duration,
    /// Silence after which the connection is considered dead
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    /// Time allowed from calling the initiator to receiving `peerInfo`
    #[serde(with = "duration_ms")]
    pub handshake_timeout: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(2),
            timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PeerOptions {
    pub liveness: LivenessConfig,
    pub timekeep: TimekeepConfig,
    pub rpc_timeout: Duration,
    /// Reconnect policy. None means the peer is destroyed when its
    /// connection drops.
    pub recovery: Option<ReconnectConfig>,
}

impl Default for PeerOptions {
    fn default() -> Self {
        Self {
            liveness: LivenessConfig::default(),
            timekeep: TimekeepConfig::default(),
            rpc_timeout: Duration::from_secs(5),
            recovery: None,
        }
    }
}

/// Lifecycle and traffic notifications, consumed by the peers manager.
#[derive(Debug)]
pub enum PeerEvent {
    Connected(Arc<Peer>),
    Message(Arc<Peer>, ControllerMessage),
    RpcRequest(Arc<Peer>, RpcEnvelope),
    Disconnected(Arc<Peer>),
    Destroyed(Arc<Peer>),
}

type Outgoing = (ControllerMessage, Option<oneshot::Sender<bool>>);

/// Tasks and queues of one connection.
struct Link {
    generation: u64,
    connection: Arc<dyn PeerConnection>,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    reader: Option<JoinHandle<()>>,
    writer: JoinHandle<()>,
    timers: Vec<JoinHandle<()>>,
}

impl Link {
    /// Close the connection and stop its tasks. The reader is left running
    /// when the caller is the reader itself.
    async fn shutdown(self, abort_reader: bool) {
        for timer in &self.timers {
            timer.abort();
        }
        let _ = self.connection.close().await;
        self.writer.abort();
        if abort_reader {
            if let Some(reader) = self.reader {
                reader.abort();
            }
        }
    }
}

struct PeerInner {
    uuid: String,
    name: String,
    instance_uuid: String,
    state: PeerState,
    buffer: VecDeque<ControllerMessage>,
    generation: u64,
    link: Option<Link>,
    handshake: Option<oneshot::Sender<Result<(), PeerError>>>,
    reconnect: ReconnectState,
    recovery: Option<JoinHandle<()>>,
}

enum Flow {
    Continue,
    Close(DisconnectReason),
}

pub struct Peer {
    local: Arc<LocalPeer>,
    initiator: Box<dyn Initiator>,
    target: InitiatorTarget,
    options: PeerOptions,
    events: mpsc::UnboundedSender<PeerEvent>,
    inner: Mutex<PeerInner>,
    rpcs: PendingRpcs,
    estimator: Mutex<TimekeepEstimator>,
    last_received: Mutex<Instant>,
    me: Weak<Peer>,
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("Peer")
            .field("uuid", &inner.uuid)
            .field("name", &inner.name)
            .field("state", &inner.state)
            .field("target", &self.target)
            .finish()
    }
}

impl Peer {
    /// Create an idle peer. Call [`Peer::connect`] to start it.
    pub fn new(
        local: Arc<LocalPeer>,
        initiator: Box<dyn Initiator>,
        options: PeerOptions,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Arc<Self> {
        let target = initiator.target();
        let placeholder = target.placeholder();
        let estimator = TimekeepEstimator::new(options.timekeep.clone());

        Arc::new_cyclic(|me| Self {
            local,
            initiator,
            target,
            options,
            events,
            inner: Mutex::new(PeerInner {
                uuid: placeholder.clone(),
                name: placeholder.clone(),
                instance_uuid: placeholder,
                state: PeerState::Idle,
                buffer: VecDeque::new(),
                generation: 0,
                link: None,
                handshake: None,
                reconnect: ReconnectState::new(),
                recovery: None,
            }),
            rpcs: PendingRpcs::new(),
            estimator: Mutex::new(estimator),
            last_received: Mutex::new(Instant::now()),
            me: me.clone(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, PeerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, make: impl FnOnce(Arc<Peer>) -> PeerEvent) {
        if let Some(me) = self.me.upgrade() {
            let _ = self.events.send(make(me));
        }
    }

    // ==================== Accessors ====================

    /// Remote node uuid, or a placeholder until the handshake completed.
    pub fn uuid(&self) -> String {
        self.lock().uuid.clone()
    }

    pub fn name(&self) -> String {
        self.lock().name.clone()
    }

    pub fn instance_uuid(&self) -> String {
        self.lock().instance_uuid.clone()
    }

    pub fn state(&self) -> PeerState {
        self.lock().state
    }

    pub fn target(&self) -> &InitiatorTarget {
        &self.target
    }

    pub fn kind(&self) -> InitiatorKind {
        self.target.kind()
    }

    /// Whether this node opened the current connection.
    pub fn opened_locally(&self) -> bool {
        self.initiator.opened_locally()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == PeerState::Connected
    }

    pub fn has_recovery(&self) -> bool {
        self.options.recovery.is_some()
    }

    /// Estimated remote clock minus local clock, in milliseconds.
    pub fn clock_offset(&self) -> Option<f64> {
        self.estimator
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .offset()
    }

    pub fn round_trip(&self) -> Option<f64> {
        self.estimator
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .rtt()
    }

    // ==================== Connecting ====================

    /// Run the initiator and wait for the identity handshake.
    ///
    /// Calling this on a peer that is already connecting or connected is a
    /// no-op. On failure the peer either schedules recovery or is destroyed.
    pub async fn connect(&self) -> Result<(), PeerError> {
        if !self.begin_connecting(true)? {
            return Ok(());
        }

        match self.attempt().await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!("Could not connect to {}: {}", self.target, err);
                match &err {
                    PeerError::PeerDestroyed => {}
                    PeerError::ProtocolViolation(_) => {
                        self.destroy(DisconnectReason::ConnectionFailed, false).await;
                    }
                    _ => self.after_failure(DisconnectReason::ConnectionFailed).await,
                }
                Err(err)
            }
        }
    }

    /// Move to Connecting. `Ok(false)` when already connecting or connected.
    fn begin_connecting(&self, cancel_recovery: bool) -> Result<bool, PeerError> {
        let recovery = {
            let mut inner = self.lock();
            match inner.state {
                PeerState::Destroyed => return Err(PeerError::PeerDestroyed),
                PeerState::Connecting | PeerState::Connected => return Ok(false),
                PeerState::Idle | PeerState::Disconnected => {
                    set_state(&mut inner, PeerState::Connecting);
                }
            }
            if cancel_recovery {
                inner.recovery.take()
            } else {
                None
            }
        };
        if let Some(recovery) = recovery {
            recovery.abort();
        }
        Ok(true)
    }

    async fn attempt(&self) -> Result<(), PeerError> {
        let generation = {
            let mut inner = self.lock();
            inner.generation += 1;
            inner.generation
        };
        debug!("Connecting to {} (attempt {})", self.target, generation);

        let result = match timeout(
            self.options.liveness.handshake_timeout,
            self.establish(generation),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(PeerError::ConnectionFailure(format!(
                "Handshake with {} timed out",
                self.target
            ))),
        };

        match result {
            Ok(()) => Ok(()),
            Err(err) => self.abandon(generation, err).await,
        }
    }

    async fn establish(&self, generation: u64) -> Result<(), PeerError> {
        let connection: Arc<dyn PeerConnection> = Arc::from(self.initiator.connect().await?);
        let (handshake_tx, handshake_rx) = oneshot::channel();

        let accepted = {
            let mut inner = self.lock();
            if inner.state == PeerState::Connecting && inner.generation == generation {
                let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
                let hello = ControllerMessage::peer_info(
                    &self.local.uuid,
                    &self.local.name,
                    &self.local.instance_uuid,
                );
                let _ = outgoing.send((hello, None));

                *self.last_received.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
                let writer = tokio::spawn(write_loop(Arc::clone(&connection), outgoing_rx));
                let reader = self.me.upgrade().map(|peer| {
                    tokio::spawn(read_loop(peer, Arc::clone(&connection), generation))
                });

                inner.link = Some(Link {
                    generation,
                    connection: Arc::clone(&connection),
                    outgoing,
                    reader,
                    writer,
                    timers: Vec::new(),
                });
                inner.handshake = Some(handshake_tx);
                None
            } else if inner.state.is_destroyed() {
                Some(PeerError::PeerDestroyed)
            } else {
                Some(PeerError::ConnectionFailure(
                    "Connection attempt superseded".to_string(),
                ))
            }
        };
        if let Some(err) = accepted {
            let _ = connection.close().await;
            return Err(err);
        }

        debug!("Transport to {} open via {}", self.target, connection.label());
        handshake_rx.await.map_err(|_| {
            PeerError::ConnectionFailure("Handshake abandoned".to_string())
        })?
    }

    /// Clean up after a failed attempt.
    async fn abandon(&self, generation: u64, err: PeerError) -> Result<(), PeerError> {
        let link = {
            let mut inner = self.lock();
            if inner.generation != generation {
                return Err(err);
            }
            if inner.state == PeerState::Connected {
                // Handshake finished right as the timeout fired
                return Ok(());
            }
            inner.handshake = None;
            if inner.state == PeerState::Connecting {
                set_state(&mut inner, PeerState::Disconnected);
            }
            inner.link.take()
        };
        if let Some(link) = link {
            link.shutdown(true).await;
        }
        Err(err)
    }

    // ==================== Inbound ====================

    fn on_message(&self, generation: u64, message: ControllerMessage) -> Flow {
        match message {
            ControllerMessage::Ping => {
                self.send_on_link(generation, ControllerMessage::Pong);
            }
            ControllerMessage::Pong => {}
            ControllerMessage::PeerInfo(info) => return self.on_peer_info(generation, info),
            ControllerMessage::TimekeepRequest(request) => {
                let response = ControllerMessage::TimekeepResponse(TimekeepResponseMessage {
                    sent_at: request.sent_at,
                    responded_at: now_ms(),
                });
                self.send_on_link(generation, response);
            }
            ControllerMessage::TimekeepResponse(response) => {
                let sample =
                    TimekeepSample::from_exchange(response.sent_at, response.responded_at, now_ms());
                let accepted = self
                    .estimator
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .add_sample(sample);
                if !accepted {
                    debug!("Discarding timekeeping sample {:?}", sample);
                }
            }
            ControllerMessage::Disconnect(notice) => {
                info!("{} announced disconnect: {}", self.uuid(), notice.reason);
                let reason = if notice.reason == DisconnectReason::DuplicateConnection.as_str() {
                    DisconnectReason::DuplicateConnection
                } else {
                    DisconnectReason::RemoteDestroyed
                };
                return Flow::Close(reason);
            }
            ControllerMessage::Rpc(envelope) if envelope.is_response => {
                self.rpcs.resolve(envelope);
            }
            other => {
                if !self.is_connected() {
                    warn!(
                        "Dropping {} from {} received before handshake",
                        other.message_type(),
                        self.target
                    );
                    return Flow::Continue;
                }
                match other {
                    ControllerMessage::Rpc(envelope) => {
                        self.emit(|peer| PeerEvent::RpcRequest(peer, envelope))
                    }
                    message => self.emit(|peer| PeerEvent::Message(peer, message)),
                }
            }
        }
        Flow::Continue
    }

    fn on_peer_info(&self, generation: u64, info: PeerInfoMessage) -> Flow {
        if info.uuid == self.local.uuid {
            warn!("{} turned out to be ourselves", self.target);
            if let Some(tx) = self.lock().handshake.take() {
                let _ = tx.send(Err(PeerError::ProtocolViolation(
                    "Connected to ourselves".to_string(),
                )));
            }
            return Flow::Close(DisconnectReason::ConnectionFailed);
        }

        let mut guard = self.lock();
        let inner = &mut *guard;
        if inner.link.as_ref().map(|l| l.generation) != Some(generation) {
            return Flow::Continue;
        }

        match inner.state {
            PeerState::Connecting => {
                if let Some(expected) = self.target.target_uuid() {
                    if expected != info.uuid {
                        warn!(
                            "Expected {} behind {} but {} answered",
                            expected, self.target, info.uuid
                        );
                    }
                }
                if inner.instance_uuid != info.instance_uuid {
                    self.estimator
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .reset();
                }
                if info.version != mesh_core::protocol::PROTOCOL_VERSION {
                    debug!("{} speaks protocol version {}", info.uuid, info.version);
                }

                inner.uuid = info.uuid;
                inner.name = info.name;
                inner.instance_uuid = info.instance_uuid;
                set_state(inner, PeerState::Connected);
                inner.reconnect.reset();

                if let Some(link) = inner.link.as_mut() {
                    for message in inner.buffer.drain(..) {
                        let _ = link.outgoing.send((message, None));
                    }
                    link.timers.push(tokio::spawn(liveness_loop(
                        self.me.clone(),
                        generation,
                        self.options.liveness.clone(),
                    )));
                    link.timers.push(tokio::spawn(timekeeping_loop(
                        self.me.clone(),
                        generation,
                        self.options.timekeep.clone(),
                    )));
                }
                if let Some(tx) = inner.handshake.take() {
                    let _ = tx.send(Ok(()));
                }
                info!("Connected to {} ({}) via {}", inner.name, inner.uuid, self.target);
                drop(guard);

                self.emit(PeerEvent::Connected);
                Flow::Continue
            }
            PeerState::Connected => {
                if inner.uuid != info.uuid {
                    warn!(
                        "{} changed identity to {} mid-connection",
                        inner.uuid, info.uuid
                    );
                    return Flow::Close(DisconnectReason::ConnectionFailed);
                }
                inner.name = info.name;
                Flow::Continue
            }
            _ => Flow::Continue,
        }
    }

    /// Queue a message on the live connection of `generation`.
    fn send_on_link(&self, generation: u64, message: ControllerMessage) -> bool {
        let inner = self.lock();
        match inner.link.as_ref() {
            Some(link) if link.generation == generation => {
                link.outgoing.send((message, None)).is_ok()
            }
            _ => false,
        }
    }

    async fn on_link_closed(&self, generation: u64, reason: DisconnectReason) {
        let link = {
            let mut inner = self.lock();
            if inner.link.as_ref().map(|l| l.generation) != Some(generation) {
                return;
            }
            match inner.state {
                PeerState::Connected => {
                    set_state(&mut inner, PeerState::Disconnected);
                    inner.link.take()
                }
                PeerState::Connecting => {
                    if let Some(tx) = inner.handshake.take() {
                        let _ = tx.send(Err(PeerError::ConnectionFailure(format!(
                            "Connection closed during handshake ({})",
                            reason
                        ))));
                    }
                    return;
                }
                _ => return,
            }
        };

        info!("Disconnected from {} ({})", self.uuid(), reason);
        if let Some(link) = link {
            link.shutdown(false).await;
        }
        self.rpcs
            .fail_all(PeerError::ConnectionFailure("Connection lost".to_string()));
        self.emit(PeerEvent::Disconnected);
        self.after_failure(reason).await;
    }

    /// Recover or give up after the connection dropped or an attempt failed.
    async fn after_failure(&self, reason: DisconnectReason) {
        let final_reason = matches!(
            reason,
            DisconnectReason::DuplicateConnection
                | DisconnectReason::StaleInstance
                | DisconnectReason::UserRequested
                | DisconnectReason::Exiting
        );
        if self.options.recovery.is_some() && !final_reason {
            self.spawn_recovery();
        } else {
            self.destroy(reason, false).await;
        }
    }

    // ==================== Recovery ====================

    fn spawn_recovery(&self) {
        let Some(peer) = self.me.upgrade() else {
            return;
        };
        let handle = tokio::spawn(async move { peer.recovery_loop().await });

        let previous = {
            let mut inner = self.lock();
            if inner.state.is_destroyed() {
                handle.abort();
                return;
            }
            inner.recovery.replace(handle)
        };
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    async fn recovery_loop(self: Arc<Self>) {
        let Some(config) = self.options.recovery.clone() else {
            return;
        };

        loop {
            let delay = {
                let mut inner = self.lock();
                if inner.state != PeerState::Disconnected {
                    return;
                }
                if inner.reconnect.exceeded_max_attempts(&config) {
                    None
                } else {
                    Some(inner.reconnect.next_attempt(&config))
                }
            };

            let Some(delay) = delay else {
                warn!("Giving up on {} after repeated failures", self.target);
                // Detach our own handle so destroy does not abort us
                self.lock().recovery.take();
                self.destroy(DisconnectReason::ConnectionFailed, false).await;
                return;
            };

            debug!("Reconnecting to {} in {:?}", self.target, delay);
            tokio::time::sleep(delay).await;

            match self.begin_connecting(false) {
                Ok(true) => {}
                _ => return,
            }
            match self.attempt().await {
                Ok(()) => return,
                Err(PeerError::PeerDestroyed) => return,
                Err(PeerError::ProtocolViolation(msg)) => {
                    warn!("Stopping recovery of {}: {}", self.target, msg);
                    self.lock().recovery.take();
                    self.destroy(DisconnectReason::ConnectionFailed, false).await;
                    return;
                }
                Err(err) => debug!("Reconnect to {} failed: {}", self.target, err),
            }
        }
    }

    // ==================== Teardown ====================

    /// Tear the peer down for good. Idempotent.
    ///
    /// With `advertise`, a connected peer is told why before the transport
    /// closes.
    pub async fn destroy(&self, reason: DisconnectReason, advertise: bool) {
        let (link, recovery, was_connected) = {
            let mut inner = self.lock();
            if inner.state.is_destroyed() {
                return;
            }
            let was_connected = inner.state == PeerState::Connected;
            set_state(&mut inner, PeerState::Destroyed);
            inner.buffer.clear();
            if let Some(tx) = inner.handshake.take() {
                let _ = tx.send(Err(PeerError::PeerDestroyed));
            }
            (inner.link.take(), inner.recovery.take(), was_connected)
        };

        info!("Destroying peer {} ({})", self.uuid(), reason);
        if let Some(recovery) = recovery {
            recovery.abort();
        }
        if let Some(link) = link {
            if advertise && was_connected {
                let (ack_tx, ack_rx) = oneshot::channel();
                let notice = ControllerMessage::disconnect(reason.as_str());
                if link.outgoing.send((notice, Some(ack_tx))).is_ok() {
                    let _ = timeout(DISCONNECT_FLUSH_TIMEOUT, ack_rx).await;
                }
            }
            link.shutdown(true).await;
        }

        self.rpcs.fail_all(PeerError::PeerDestroyed);
        self.emit(PeerEvent::Destroyed);
    }

    // ==================== Outbound ====================

    /// Send a message to the remote.
    ///
    /// Connected: resolves once the message is written. Not yet connected
    /// (or reconnecting): the message is queued and sent in order after the
    /// handshake. Returns false when the message was dropped.
    pub async fn send_controller_message(&self, message: ControllerMessage) -> bool {
        let ack = {
            let mut inner = self.lock();
            match inner.state {
                PeerState::Connected => {
                    let Some(link) = inner.link.as_ref() else {
                        return false;
                    };
                    let (ack_tx, ack_rx) = oneshot::channel();
                    if link.outgoing.send((message, Some(ack_tx))).is_err() {
                        return false;
                    }
                    ack_rx
                }
                PeerState::Idle | PeerState::Connecting => {
                    return Self::enqueue(&mut inner, message);
                }
                PeerState::Disconnected if self.options.recovery.is_some() => {
                    return Self::enqueue(&mut inner, message);
                }
                PeerState::Disconnected | PeerState::Destroyed => return false,
            }
        };
        ack.await.unwrap_or(false)
    }

    fn enqueue(inner: &mut PeerInner, message: ControllerMessage) -> bool {
        if inner.buffer.len() >= MAX_PENDING_MESSAGES {
            warn!(
                "Pending queue for {} is full, dropping {}",
                inner.uuid,
                message.message_type()
            );
            return false;
        }
        inner.buffer.push_back(message);
        true
    }

    /// Send `message` as an RPC and wait for the correlated response.
    pub async fn send_rpc(&self, message: ControllerMessage) -> Result<ControllerMessage, PeerError> {
        let envelope = RpcEnvelope::request(message);
        let id = envelope.uuid.clone();
        let rx = self.rpcs.register(&id);

        if self.state().is_destroyed() {
            self.rpcs.cancel(&id);
            return Err(PeerError::PeerDestroyed);
        }
        if !self
            .send_controller_message(ControllerMessage::Rpc(envelope))
            .await
        {
            self.rpcs.cancel(&id);
            return Err(if self.state().is_destroyed() {
                PeerError::PeerDestroyed
            } else {
                PeerError::ConnectionFailure(format!("Could not send RPC to {}", self.uuid()))
            });
        }

        match timeout(self.options.rpc_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PeerError::PeerDestroyed),
            Err(_) => {
                self.rpcs.cancel(&id);
                Err(PeerError::RpcTimeout(self.options.rpc_timeout))
            }
        }
    }
}

// ==================== Connection tasks ====================

fn set_state(inner: &mut PeerInner, next: PeerState) {
    debug_assert!(
        inner.state.can_transition_to(next),
        "illegal peer transition {} -> {}",
        inner.state,
        next
    );
    inner.state = next;
}

async fn write_loop(
    connection: Arc<dyn PeerConnection>,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
) {
    while let Some((message, ack)) = outgoing.recv().await {
        let result = connection.send(&encode(&message)).await;
        let sent = result.is_ok();
        if let Some(ack) = ack {
            let _ = ack.send(sent);
        }
        if let Err(e) = result {
            debug!("Write to {} failed: {}", connection.label(), e);
            break;
        }
    }
}

async fn read_loop(peer: Arc<Peer>, connection: Arc<dyn PeerConnection>, generation: u64) {
    let reason = loop {
        match connection.recv().await {
            Ok(data) => {
                *peer.last_received.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
                match decode(&data) {
                    Ok(message) => {
                        if let Flow::Close(reason) = peer.on_message(generation, message) {
                            break reason;
                        }
                    }
                    Err(ProtocolError::UnknownType(kind)) => {
                        debug!("Ignoring unknown message type {} from {}", kind, connection.label());
                    }
                    Err(e) => {
                        warn!("Invalid message from {}: {}", connection.label(), e);
                    }
                }
            }
            Err(e) => {
                debug!("Connection to {} closed: {}", connection.label(), e);
                break DisconnectReason::RemoteClosed;
            }
        }
    };
    peer.on_link_closed(generation, reason).await;
}

async fn liveness_loop(peer: Weak<Peer>, generation: u64, config: LivenessConfig) {
    let mut ticker = tokio::time::interval(config.ping_interval);
    // First tick fires immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(peer) = peer.upgrade() else {
            return;
        };

        let silent = peer
            .last_received
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed();
        if silent > config.timeout {
            warn!("No traffic from {} for {:?}", peer.uuid(), silent);
            // Own task: closing the link aborts this one
            tokio::spawn(async move {
                peer.on_link_closed(generation, DisconnectReason::LivenessTimeout)
                    .await
            });
            return;
        }
        if !peer.send_on_link(generation, ControllerMessage::Ping) {
            return;
        }
    }
}

async fn timekeeping_loop(peer: Weak<Peer>, generation: u64, config: TimekeepConfig) {
    let mut sent = 0u32;
    loop {
        let delay = {
            let mut rng = rand::rng();
            next_delay(&config, sent, &mut rng)
        };
        tokio::time::sleep(delay).await;

        let Some(peer) = peer.upgrade() else {
            return;
        };
        if !peer.send_on_link(generation, ControllerMessage::timekeep_request(now_ms())) {
            return;
        }
        sent = sent.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryConnection;
    use async_trait::async_trait;
    use mesh_core::protocol::CreatePipeMessage;

    /// Initiator handing out connections prepared by the test.
    struct StubInitiator {
        connections: Mutex<VecDeque<MemoryConnection>>,
    }

    impl StubInitiator {
        fn new(connections: Vec<MemoryConnection>) -> Box<Self> {
            Box::new(Self {
                connections: Mutex::new(connections.into()),
            })
        }
    }

    #[async_trait]
    impl Initiator for StubInitiator {
        fn target(&self) -> InitiatorTarget {
            InitiatorTarget::http_api("http://stub")
        }

        async fn connect(&self) -> Result<Box<dyn PeerConnection>, PeerError> {
            match self.connections.lock().unwrap().pop_front() {
                Some(connection) => Ok(Box::new(connection)),
                None => Err(PeerError::ConnectionFailure("no more connections".into())),
            }
        }
    }

    /// Plays the remote node by hand on the other end of a memory pair.
    struct Remote {
        end: MemoryConnection,
    }

    impl Remote {
        async fn send(&self, message: ControllerMessage) {
            self.end.send(&encode(&message)).await.unwrap();
        }

        async fn recv(&self) -> ControllerMessage {
            decode(&self.end.recv().await.unwrap()).unwrap()
        }

        /// Next message that is not keepalive or timekeeping traffic.
        async fn recv_significant(&self) -> ControllerMessage {
            loop {
                match self.recv().await {
                    ControllerMessage::Ping
                    | ControllerMessage::TimekeepRequest(_)
                    | ControllerMessage::TimekeepResponse(_) => continue,
                    other => return other,
                }
            }
        }

        async fn handshake(&self, uuid: &str) {
            match self.recv().await {
                ControllerMessage::PeerInfo(_) => {}
                other => panic!("Expected peerInfo first, got {:?}", other),
            }
            self.send(ControllerMessage::peer_info(uuid, "remote", "remote-instance"))
                .await;
        }
    }

    fn setup(
        options: PeerOptions,
    ) -> (Arc<Peer>, Remote, mpsc::UnboundedReceiver<PeerEvent>) {
        let (local_end, remote_end) = MemoryConnection::pair("local", "remote");
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = Peer::new(
            Arc::new(LocalPeer::with_uuid("local-uuid", "local")),
            StubInitiator::new(vec![local_end]),
            options,
            tx,
        );
        (peer, Remote { end: remote_end }, rx)
    }

    fn create_pipe(n: usize) -> ControllerMessage {
        ControllerMessage::CreatePipe(CreatePipeMessage {
            source_uuid: format!("source-{}", n),
            sink_uuid: "sink".into(),
        })
    }

    // ==================== Handshake ====================

    #[tokio::test]
    async fn test_connect_adopts_remote_identity() {
        let (peer, remote, mut events) = setup(PeerOptions::default());
        assert_eq!(peer.uuid(), "placeholderForHttpApiJoin_http://stub");

        let connecting = {
            let peer = peer.clone();
            tokio::spawn(async move { peer.connect().await })
        };
        remote.handshake("remote-uuid").await;
        connecting.await.unwrap().unwrap();

        assert_eq!(peer.state(), PeerState::Connected);
        assert_eq!(peer.uuid(), "remote-uuid");
        assert_eq!(peer.instance_uuid(), "remote-instance");
        assert!(matches!(events.recv().await, Some(PeerEvent::Connected(_))));
    }

    #[tokio::test]
    async fn test_connecting_to_ourselves_destroys() {
        let (peer, remote, _events) = setup(PeerOptions::default());
        let connecting = {
            let peer = peer.clone();
            tokio::spawn(async move { peer.connect().await })
        };
        remote.handshake("local-uuid").await;

        let result = connecting.await.unwrap();
        assert!(matches!(result, Err(PeerError::ProtocolViolation(_))));
        assert_eq!(peer.state(), PeerState::Destroyed);
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let options = PeerOptions {
            liveness: LivenessConfig {
                handshake_timeout: Duration::from_millis(100),
                ..Default::default()
            },
            ..Default::default()
        };
        let (peer, _remote, _events) = setup(options);

        let result = peer.connect().await;
        assert!(matches!(result, Err(PeerError::ConnectionFailure(_))));
        // No recovery policy: a failed first attempt is final
        assert_eq!(peer.state(), PeerState::Destroyed);
    }

    // ==================== Messaging ====================

    #[tokio::test]
    async fn test_buffered_messages_flush_in_order() {
        let (peer, remote, _events) = setup(PeerOptions::default());

        for i in 0..3 {
            assert!(peer.send_controller_message(create_pipe(i)).await);
        }

        let connecting = {
            let peer = peer.clone();
            tokio::spawn(async move { peer.connect().await })
        };
        remote.handshake("remote-uuid").await;
        connecting.await.unwrap().unwrap();
        assert!(peer.send_controller_message(create_pipe(3)).await);

        for i in 0..4 {
            assert_eq!(remote.recv_significant().await, create_pipe(i));
        }
    }

    #[tokio::test]
    async fn test_messages_surface_as_events() {
        let (peer, remote, mut events) = setup(PeerOptions::default());
        let connecting = {
            let peer = peer.clone();
            tokio::spawn(async move { peer.connect().await })
        };
        remote.handshake("remote-uuid").await;
        connecting.await.unwrap().unwrap();

        remote.send(create_pipe(7)).await;

        assert!(matches!(events.recv().await, Some(PeerEvent::Connected(_))));
        match events.recv().await {
            Some(PeerEvent::Message(from, message)) => {
                assert_eq!(from.uuid(), "remote-uuid");
                assert_eq!(message, create_pipe(7));
            }
            other => panic!("Expected message event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rpc_response_resolves_request() {
        let (peer, remote, _events) = setup(PeerOptions::default());
        let connecting = {
            let peer = peer.clone();
            tokio::spawn(async move { peer.connect().await })
        };
        remote.handshake("remote-uuid").await;
        connecting.await.unwrap().unwrap();

        let request = {
            let peer = peer.clone();
            tokio::spawn(async move { peer.send_rpc(ControllerMessage::RequestSourcesList).await })
        };
        let envelope = match remote.recv_significant().await {
            ControllerMessage::Rpc(envelope) => envelope,
            other => panic!("Expected rpc, got {:?}", other),
        };
        assert!(!envelope.is_response);
        remote
            .send(ControllerMessage::Rpc(RpcEnvelope::response(
                envelope.uuid,
                ControllerMessage::Pong,
            )))
            .await;

        assert_eq!(request.await.unwrap().unwrap(), ControllerMessage::Pong);
    }

    #[tokio::test]
    async fn test_rpc_timeout() {
        let options = PeerOptions {
            rpc_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let (peer, remote, _events) = setup(options);
        let connecting = {
            let peer = peer.clone();
            tokio::spawn(async move { peer.connect().await })
        };
        remote.handshake("remote-uuid").await;
        connecting.await.unwrap().unwrap();

        let result = peer.send_rpc(ControllerMessage::RequestSourcesList).await;
        assert!(matches!(result, Err(PeerError::RpcTimeout(_))));
    }

    // ==================== Teardown ====================

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let (peer, remote, mut events) = setup(PeerOptions::default());
        let connecting = {
            let peer = peer.clone();
            tokio::spawn(async move { peer.connect().await })
        };
        remote.handshake("remote-uuid").await;
        connecting.await.unwrap().unwrap();

        peer.destroy(DisconnectReason::UserRequested, true).await;
        peer.destroy(DisconnectReason::UserRequested, true).await;

        assert_eq!(
            remote.recv_significant().await,
            ControllerMessage::disconnect("userRequested")
        );

        let mut destroyed = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, PeerEvent::Destroyed(_)) {
                destroyed += 1;
            }
        }
        assert_eq!(destroyed, 1);
    }

    #[tokio::test]
    async fn test_send_after_destroy_fails() {
        let (peer, _remote, _events) = setup(PeerOptions::default());
        peer.destroy(DisconnectReason::UserRequested, false).await;

        assert!(!peer.send_controller_message(create_pipe(0)).await);
        assert!(matches!(
            peer.send_rpc(ControllerMessage::RequestSourcesList).await,
            Err(PeerError::PeerDestroyed)
        ));
        assert!(matches!(peer.connect().await, Err(PeerError::PeerDestroyed)));
    }

    #[tokio::test]
    async fn test_remote_close_without_recovery_destroys() {
        let (peer, remote, mut events) = setup(PeerOptions::default());
        let connecting = {
            let peer = peer.clone();
            tokio::spawn(async move { peer.connect().await })
        };
        remote.handshake("remote-uuid").await;
        connecting.await.unwrap().unwrap();

        remote.end.close().await.unwrap();

        let mut seen = Vec::new();
        while let Some(event) = events.recv().await {
            let done = matches!(event, PeerEvent::Destroyed(_));
            seen.push(event);
            if done {
                break;
            }
        }
        assert!(matches!(seen[0], PeerEvent::Connected(_)));
        assert!(matches!(seen[1], PeerEvent::Disconnected(_)));
        assert_eq!(peer.state(), PeerState::Destroyed);
    }

    // ==================== Liveness ====================

    fn silent_remote_options(recovery: Option<ReconnectConfig>) -> PeerOptions {
        PeerOptions {
            liveness: LivenessConfig {
                ping_interval: Duration::from_millis(50),
                timeout: Duration::from_millis(200),
                ..Default::default()
            },
            recovery,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_silent_remote_without_recovery_is_destroyed() {
        let (peer, remote, mut events) = setup(silent_remote_options(None));
        let connecting = {
            let peer = peer.clone();
            tokio::spawn(async move { peer.connect().await })
        };
        remote.handshake("remote-uuid").await;
        connecting.await.unwrap().unwrap();

        // The remote end stays open but never answers again
        let mut seen = Vec::new();
        timeout(Duration::from_secs(2), async {
            while let Some(event) = events.recv().await {
                let done = matches!(event, PeerEvent::Destroyed(_));
                seen.push(event);
                if done {
                    break;
                }
            }
        })
        .await
        .expect("peer was not destroyed after going silent");

        assert!(seen.iter().any(|e| matches!(e, PeerEvent::Disconnected(_))));
        assert_eq!(peer.state(), PeerState::Destroyed);
        drop(remote);
    }

    #[tokio::test]
    async fn test_silent_remote_with_recovery_is_kept() {
        let recovery = ReconnectConfig {
            initial_delay: Duration::from_secs(5),
            ..Default::default()
        };
        let (peer, remote, mut events) = setup(silent_remote_options(Some(recovery)));
        let connecting = {
            let peer = peer.clone();
            tokio::spawn(async move { peer.connect().await })
        };
        remote.handshake("remote-uuid").await;
        connecting.await.unwrap().unwrap();

        timeout(Duration::from_secs(2), async {
            while let Some(event) = events.recv().await {
                if matches!(event, PeerEvent::Disconnected(_)) {
                    break;
                }
            }
        })
        .await
        .expect("peer never noticed the silence");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(matches!(
            peer.state(),
            PeerState::Disconnected | PeerState::Connecting
        ));
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, PeerEvent::Destroyed(_)));
        }

        peer.destroy(DisconnectReason::UserRequested, false).await;
        drop(remote);
    }

    // ==================== Timekeeping ====================

    #[tokio::test]
    async fn test_timekeeping_produces_offset() {
        let options = PeerOptions {
            timekeep: TimekeepConfig {
                burst_interval: Duration::from_millis(10),
                ..Default::default()
            },
            ..Default::default()
        };
        let (peer, remote, _events) = setup(options);
        let connecting = {
            let peer = peer.clone();
            tokio::spawn(async move { peer.connect().await })
        };
        remote.handshake("remote-uuid").await;
        connecting.await.unwrap().unwrap();
        assert!(peer.clock_offset().is_none());

        // Answer as a node whose clock runs one second ahead
        loop {
            if let ControllerMessage::TimekeepRequest(request) = remote.recv().await {
                remote
                    .send(ControllerMessage::TimekeepResponse(TimekeepResponseMessage {
                        sent_at: request.sent_at,
                        responded_at: now_ms() + 1000.0,
                    }))
                    .await;
                break;
            }
        }

        for _ in 0..50 {
            if peer.clock_offset().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let offset = peer.clock_offset().unwrap();
        assert!((offset - 1000.0).abs() < 100.0, "offset was {}", offset);
    }
}
