//! Registry of peers and the entry point for everything above the transport.
//!
//! The manager creates peers through the join operations, keeps at most one
//! live connection per remote node, fans messages out to subscribers and
//! answers the built-in RPCs (connection info relay).
//!
//! Peers report to the manager over a single event channel, processed by one
//! task in arrival order. Messages from one peer therefore reach handlers in
//! the order they were received.

use crate::error::PeerError;
use crate::initiators::{
    AcceptedInitiator, HttpApiInitiator, Initiator, PeerRelayInitiator, RendezvousInitiator,
};
use crate::peer::{LivenessConfig, Peer, PeerEvent, PeerOptions};
use crate::router::{MessageRouter, Subscription};
use futures::future::join_all;
use mesh_core::protocol::{PeerConnectionInfoMessage, PeerDiscoveryMessage, RpcEnvelope};
use mesh_core::timekeeping::DEFAULT_LATENCY_THRESHOLD;
use mesh_core::{
    ControllerMessage, DisconnectReason, InitiatorKind, InitiatorTarget, LatencyReporter,
    LocalPeer, MessageType, ReconnectConfig, SessionDescription, TimekeepConfig, Transport,
};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub liveness: LivenessConfig,
    pub timekeep: TimekeepConfig,
    /// Backoff for peers joined over HTTP or rendezvous
    pub reconnect: ReconnectConfig,
    pub rpc_timeout: Duration,
    pub rendezvous_poll_interval: Duration,
    /// Minimum sink latency change (ms) worth announcing
    pub latency_threshold: f64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            liveness: LivenessConfig::default(),
            timekeep: TimekeepConfig::default(),
            reconnect: ReconnectConfig::default(),
            rpc_timeout: Duration::from_secs(5),
            rendezvous_poll_interval: Duration::from_secs(1),
            latency_threshold: DEFAULT_LATENCY_THRESHOLD,
        }
    }
}

/// Outcome of two connections to the same node instance.
enum Duplicate {
    KeepNew,
    KeepOld,
    /// The other side decides and tells us
    Defer,
}

pub struct PeersManager {
    local: Arc<LocalPeer>,
    transport: Arc<dyn Transport>,
    config: ManagerConfig,
    peers: RwLock<Vec<Arc<Peer>>>,
    router: Arc<MessageRouter<Arc<Peer>>>,
    new_peers: broadcast::Sender<Arc<Peer>>,
    events: mpsc::UnboundedSender<PeerEvent>,
    /// Node uuid -> uuids of connected peers that announced it
    announcers: Mutex<HashMap<String, HashSet<String>>>,
    latency: Mutex<LatencyReporter>,
    shutting_down: AtomicBool,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl PeersManager {
    /// Create the manager and start its event loop. Must be called inside a
    /// tokio runtime.
    pub fn new(
        local: LocalPeer,
        transport: Arc<dyn Transport>,
        config: ManagerConfig,
    ) -> Arc<Self> {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (new_peers, _) = broadcast::channel(64);
        let latency = LatencyReporter::new(config.latency_threshold);

        let manager = Arc::new(Self {
            local: Arc::new(local),
            transport,
            config,
            peers: RwLock::new(Vec::new()),
            router: Arc::new(MessageRouter::new()),
            new_peers,
            events,
            announcers: Mutex::new(HashMap::new()),
            latency: Mutex::new(latency),
            shutting_down: AtomicBool::new(false),
            event_task: Mutex::new(None),
        });

        let task = tokio::spawn(event_loop(Arc::downgrade(&manager), events_rx));
        *manager.event_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
        manager.register_builtins();

        info!(
            "Peers manager started for {} ({})",
            manager.local.name, manager.local.uuid
        );
        manager
    }

    pub fn local(&self) -> &LocalPeer {
        &self.local
    }

    fn peer_options(&self, recover: bool) -> PeerOptions {
        PeerOptions {
            liveness: self.config.liveness.clone(),
            timekeep: self.config.timekeep.clone(),
            rpc_timeout: self.config.rpc_timeout,
            recovery: recover.then(|| self.config.reconnect.clone()),
        }
    }

    // ==================== Joining ====================

    /// Join a node exposing the signaling endpoint at `endpoint`.
    ///
    /// `Ok(None)` when an equivalent join already exists.
    pub async fn join_peer_with_http_api(
        self: &Arc<Self>,
        endpoint: &str,
    ) -> Result<Option<Arc<Peer>>, PeerError> {
        let initiator = HttpApiInitiator::new(endpoint, &self.local.uuid, Arc::clone(&self.transport));
        self.join(Box::new(initiator), true).await
    }

    /// Join `peer_uuid` through the rendezvous service at `host`.
    pub async fn join_peer_with_rendezvous_api(
        self: &Arc<Self>,
        host: &str,
        peer_uuid: &str,
    ) -> Result<Option<Arc<Peer>>, PeerError> {
        if peer_uuid == self.local.uuid {
            warn!("Refusing to join ourselves through {}", host);
            return Ok(None);
        }
        let initiator = RendezvousInitiator::new(
            host,
            peer_uuid,
            &self.local.uuid,
            self.config.rendezvous_poll_interval,
            Arc::clone(&self.transport),
        );
        self.join(Box::new(initiator), true).await
    }

    /// Join `target_uuid` by relaying offer/answer through connected peers.
    pub async fn join_peer_with_peer_relay(
        self: &Arc<Self>,
        target_uuid: &str,
    ) -> Result<Option<Arc<Peer>>, PeerError> {
        if target_uuid == self.local.uuid {
            return Ok(None);
        }
        let initiator = PeerRelayInitiator::new(
            target_uuid,
            Arc::downgrade(self),
            Arc::clone(&self.transport),
        );
        self.join(Box::new(initiator), false).await
    }

    async fn join(
        self: &Arc<Self>,
        initiator: Box<dyn Initiator>,
        recover: bool,
    ) -> Result<Option<Arc<Peer>>, PeerError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(PeerError::ConnectionFailure("Shutting down".to_string()));
        }

        let target = initiator.target();
        let peer = {
            let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
            if is_duplicate_join(&peers, &target) {
                debug!("Already joined {}, skipping", target);
                return Ok(None);
            }
            let peer = Peer::new(
                Arc::clone(&self.local),
                initiator,
                self.peer_options(recover),
                self.events.clone(),
            );
            peers.push(Arc::clone(&peer));
            peer
        };

        info!("Joining {}", target);
        peer.connect().await?;
        Ok(Some(peer))
    }

    /// Answer an offer received out of band and start the resulting peer.
    pub async fn accept_offer(
        self: &Arc<Self>,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, PeerError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(PeerError::ConnectionFailure("Shutting down".to_string()));
        }

        let (answer, pending) = self.transport.accept_offer(offer).await?;
        let session = Uuid::new_v4().to_string();
        let peer = Peer::new(
            Arc::clone(&self.local),
            Box::new(AcceptedInitiator::new(&session, pending)),
            self.peer_options(false),
            self.events.clone(),
        );
        self.register_peer(Arc::clone(&peer));

        tokio::spawn(async move {
            if let Err(e) = peer.connect().await {
                debug!("Accepted session {} failed: {}", session, e);
            }
        });
        Ok(answer)
    }

    // ==================== Registry ====================

    pub fn register_peer(&self, peer: Arc<Peer>) {
        self.peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(peer);
    }

    pub fn unregister_peer(&self, peer: &Arc<Peer>) {
        self.peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|p| !Arc::ptr_eq(p, peer));
    }

    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.peers.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn connected_peers(&self) -> Vec<Arc<Peer>> {
        self.peers()
            .into_iter()
            .filter(|p| p.is_connected())
            .collect()
    }

    pub fn get_connected_peer_by_uuid(&self, uuid: &str) -> Option<Arc<Peer>> {
        self.peers()
            .into_iter()
            .find(|p| p.is_connected() && p.uuid() == uuid)
    }

    pub fn is_connected_to_at_least_one_peer(&self) -> bool {
        self.peers().iter().any(|p| p.is_connected())
    }

    /// Connected peers that may forward connection info to `target_uuid`.
    /// Peers that announced the target come first.
    pub fn relay_candidates(&self, target_uuid: &str) -> Vec<Arc<Peer>> {
        let announced: HashSet<String> = self
            .announcers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(target_uuid)
            .cloned()
            .unwrap_or_default();

        let (mut first, rest): (Vec<_>, Vec<_>) = self
            .connected_peers()
            .into_iter()
            .filter(|p| p.uuid() != target_uuid)
            .partition(|p| announced.contains(&p.uuid()));
        first.extend(rest);
        first
    }

    /// Estimated clock offset to a connected node, in milliseconds.
    pub fn clock_offset(&self, uuid: &str) -> Option<f64> {
        self.get_connected_peer_by_uuid(uuid)
            .and_then(|p| p.clock_offset())
    }

    // ==================== Messaging ====================

    /// Send `message` once to every live peer not in `exclude`.
    ///
    /// Returns how many peers accepted it.
    pub async fn broadcast(&self, message: ControllerMessage, exclude: &[String]) -> usize {
        let targets = self.broadcast_targets(exclude, false);
        let sends = targets
            .iter()
            .map(|peer| peer.send_controller_message(message.clone()));
        join_all(sends).await.into_iter().filter(|sent| *sent).count()
    }

    /// Send `message` as an RPC to every connected peer not in `exclude`.
    pub async fn broadcast_rpc(
        &self,
        message: ControllerMessage,
        exclude: &[String],
    ) -> Vec<(String, Result<ControllerMessage, PeerError>)> {
        let targets = self.broadcast_targets(exclude, true);
        let calls = targets.iter().map(|peer| {
            let message = message.clone();
            async move { (peer.uuid(), peer.send_rpc(message).await) }
        });
        join_all(calls).await
    }

    /// One peer per node uuid, connected peers preferred.
    fn broadcast_targets(&self, exclude: &[String], connected_only: bool) -> Vec<Arc<Peer>> {
        let mut candidates: Vec<Arc<Peer>> = self
            .peers()
            .into_iter()
            .filter(|p| {
                let state = p.state();
                !state.is_destroyed() && (!connected_only || p.is_connected())
            })
            .collect();
        candidates.sort_by_key(|p| !p.is_connected());

        let mut seen = HashSet::new();
        candidates
            .into_iter()
            .filter(|p| {
                let uuid = p.uuid();
                !exclude.contains(&uuid) && seen.insert(uuid)
            })
            .collect()
    }

    /// Subscribe to one message type from any peer.
    pub fn on_controller_message(
        &self,
        message_type: MessageType,
        handler: impl Fn(&ControllerMessage, &Arc<Peer>) + Send + Sync + 'static,
    ) -> Subscription {
        self.router.subscribe(message_type, handler)
    }

    /// Answer RPCs wrapping `message_type`. Replaces any previous responder.
    pub fn on_rpc<F, Fut>(&self, message_type: MessageType, responder: F)
    where
        F: Fn(ControllerMessage, Arc<Peer>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ControllerMessage, String>> + Send + 'static,
    {
        self.router.on_rpc(message_type, responder);
    }

    /// Peers that complete their handshake from now on.
    pub fn subscribe_new_connected_peer(&self) -> broadcast::Receiver<Arc<Peer>> {
        self.new_peers.subscribe()
    }

    /// Record a sink latency and broadcast it when it moved enough.
    ///
    /// Returns true when an update was sent.
    pub async fn report_sink_latency(&self, sink_uuid: &str, latency: f64) -> bool {
        let update = self
            .latency
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .update(sink_uuid, latency);
        match update {
            Some(message) => {
                self.broadcast(message, &[]).await;
                true
            }
            None => false,
        }
    }

    pub fn forget_sink(&self, sink_uuid: &str) {
        self.latency
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .forget(sink_uuid);
    }

    /// Destroy every peer, telling connected ones we are leaving.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let peers = self.peers();
        info!("Shutting down, disconnecting {} peers", peers.len());
        join_all(
            peers
                .iter()
                .map(|peer| peer.destroy(DisconnectReason::Exiting, true)),
        )
        .await;
    }

    // ==================== Events ====================

    fn handle_event(self: &Arc<Self>, event: PeerEvent) {
        match event {
            PeerEvent::Connected(peer) => self.on_peer_connected(peer),
            PeerEvent::Message(peer, message) => {
                self.router.dispatch(&message, &peer);
            }
            PeerEvent::RpcRequest(peer, envelope) => self.on_rpc_request(peer, envelope),
            PeerEvent::Disconnected(peer) => {
                debug!("Peer {} disconnected", peer.uuid());
            }
            PeerEvent::Destroyed(peer) => {
                let uuid = peer.uuid();
                self.unregister_peer(&peer);
                let mut announcers = self.announcers.lock().unwrap_or_else(|e| e.into_inner());
                for set in announcers.values_mut() {
                    set.remove(&uuid);
                }
                announcers.retain(|_, set| !set.is_empty());
            }
        }
    }

    fn on_peer_connected(self: &Arc<Self>, peer: Arc<Peer>) {
        if !peer.is_connected() {
            return;
        }
        let uuid = peer.uuid();
        let rivals: Vec<Arc<Peer>> = self
            .peers()
            .into_iter()
            .filter(|p| !Arc::ptr_eq(p, &peer) && p.is_connected() && p.uuid() == uuid)
            .collect();

        for rival in rivals {
            if rival.instance_uuid() != peer.instance_uuid() {
                info!("{} restarted, dropping connection to its old instance", uuid);
                tokio::spawn(async move {
                    rival
                        .destroy(DisconnectReason::StaleInstance, false)
                        .await
                });
                continue;
            }

            match self.resolve_duplicate(&peer, &rival) {
                Duplicate::KeepNew => {
                    debug!("Closing older duplicate connection to {}", uuid);
                    tokio::spawn(async move {
                        rival
                            .destroy(DisconnectReason::DuplicateConnection, true)
                            .await
                    });
                }
                Duplicate::KeepOld => {
                    debug!("Closing newer duplicate connection to {}", uuid);
                    tokio::spawn(async move {
                        peer.destroy(DisconnectReason::DuplicateConnection, true)
                            .await
                    });
                    return;
                }
                Duplicate::Defer => return,
            }
        }

        let _ = self.new_peers.send(Arc::clone(&peer));

        let known: Vec<String> = self
            .connected_peers()
            .iter()
            .map(|p| p.uuid())
            .filter(|u| *u != uuid)
            .collect();
        let discovery = ControllerMessage::peer_discovery(known);
        tokio::spawn(async move {
            peer.send_controller_message(discovery).await;
        });
    }

    /// Both sides must keep the same connection: the one opened by the
    /// smaller node uuid. Between two connections opened by the same node,
    /// that node keeps the older one.
    fn resolve_duplicate(&self, new: &Peer, old: &Peer) -> Duplicate {
        let opened_by = |peer: &Peer| {
            if peer.opened_locally() {
                self.local.uuid.clone()
            } else {
                peer.uuid()
            }
        };
        let new_opener = opened_by(new);
        let old_opener = opened_by(old);

        if new_opener != old_opener {
            if new_opener < old_opener {
                Duplicate::KeepNew
            } else {
                Duplicate::KeepOld
            }
        } else if new_opener == self.local.uuid {
            Duplicate::KeepOld
        } else {
            Duplicate::Defer
        }
    }

    fn on_rpc_request(self: &Arc<Self>, peer: Arc<Peer>, envelope: RpcEnvelope) {
        let RpcEnvelope { uuid, message, .. } = envelope;
        let message_type = message.as_ref().map(|m| m.message_type());
        let responder = message_type.and_then(|t| self.router.responder(t));

        tokio::spawn(async move {
            let reply = match (responder, message) {
                (Some(responder), Some(message)) => {
                    match responder(*message, Arc::clone(&peer)).await {
                        Ok(response) => RpcEnvelope::response(uuid, response),
                        Err(e) => RpcEnvelope::error(uuid, e),
                    }
                }
                _ => {
                    let name = message_type
                        .map(|t| t.to_string())
                        .unwrap_or_else(|| "empty request".to_string());
                    debug!("No RPC handler for {} from {}", name, peer.uuid());
                    RpcEnvelope::error(uuid, format!("No handler for {}", name))
                }
            };
            peer.send_controller_message(ControllerMessage::Rpc(reply))
                .await;
        });
    }

    // ==================== Built-in handlers ====================

    fn register_builtins(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.router
            .subscribe(MessageType::PeerDiscovery, move |message, from| {
                let (Some(manager), ControllerMessage::PeerDiscovery(discovery)) =
                    (weak.upgrade(), message)
                else {
                    return;
                };
                manager.on_peer_discovery(from, discovery);
            })
            .detach();

        let weak = Arc::downgrade(self);
        self.router
            .on_rpc(MessageType::PeerConnectionInfo, move |message, from| {
                let weak = weak.clone();
                async move {
                    let manager = weak
                        .upgrade()
                        .ok_or_else(|| "Shutting down".to_string())?;
                    manager.on_connection_info(message, from).await
                }
            });
    }

    fn on_peer_discovery(self: &Arc<Self>, from: &Arc<Peer>, discovery: &PeerDiscoveryMessage) {
        let from_uuid = from.uuid();
        {
            let mut announcers = self.announcers.lock().unwrap_or_else(|e| e.into_inner());
            for uuid in &discovery.peers_uuid {
                announcers
                    .entry(uuid.clone())
                    .or_default()
                    .insert(from_uuid.clone());
            }
        }

        for uuid in &discovery.peers_uuid {
            if *uuid == self.local.uuid || self.get_connected_peer_by_uuid(uuid).is_some() {
                continue;
            }
            let manager = Arc::clone(self);
            let uuid = uuid.clone();
            tokio::spawn(async move {
                match manager.join_peer_with_peer_relay(&uuid).await {
                    Ok(Some(_)) => info!("Connected to {} through a relay", uuid),
                    Ok(None) => {}
                    Err(e) => debug!("Relay join to {} failed: {}", uuid, e),
                }
            });
        }
    }

    /// Either answer an offer addressed to us or forward it to its target.
    async fn on_connection_info(
        self: &Arc<Self>,
        message: ControllerMessage,
        from: Arc<Peer>,
    ) -> Result<ControllerMessage, String> {
        let ControllerMessage::PeerConnectionInfo(info) = message else {
            return Err("Expected peerConnectionInfo".to_string());
        };

        if info.peer_uuid == self.local.uuid {
            let offer = SessionDescription::new(
                info.offer.unwrap_or_default(),
                info.ice_candidates.unwrap_or_default(),
            );
            let answer = self.accept_offer(&offer).await.map_err(|e| e.to_string())?;
            debug!("Answered relayed offer from {}", from.uuid());
            return Ok(ControllerMessage::PeerConnectionInfo(
                PeerConnectionInfoMessage {
                    peer_uuid: self.local.uuid.clone(),
                    offer: Some(answer.offer),
                    ice_candidates: Some(answer.ice_candidates),
                },
            ));
        }

        let target = self
            .get_connected_peer_by_uuid(&info.peer_uuid)
            .ok_or_else(|| format!("Not connected to {}", info.peer_uuid))?;
        if Arc::ptr_eq(&target, &from) {
            return Err("Refusing to relay back to the sender".to_string());
        }

        debug!("Relaying connection info from {} to {}", from.uuid(), info.peer_uuid);
        target
            .send_rpc(ControllerMessage::PeerConnectionInfo(info))
            .await
            .map_err(|e| e.to_string())
    }
}

impl Drop for PeersManager {
    fn drop(&mut self) {
        if let Some(task) = self
            .event_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
    }
}

/// A join is redundant when a live peer has the same target, or already
/// reaches the node it targets.
fn is_duplicate_join(peers: &[Arc<Peer>], target: &InitiatorTarget) -> bool {
    let live = || peers.iter().filter(|p| !p.state().is_destroyed());

    if live().any(|p| p.target() == target) {
        return true;
    }
    let Some(uuid) = target.target_uuid() else {
        return false;
    };
    if live().any(|p| p.is_connected() && p.uuid() == uuid) {
        return true;
    }
    // Relay joins also yield to any pending join aimed at the same node
    target.kind() == InitiatorKind::PeerRelay
        && live().any(|p| p.target().target_uuid() == Some(uuid))
}

async fn event_loop(manager: Weak<PeersManager>, mut events: mpsc::UnboundedReceiver<PeerEvent>) {
    while let Some(event) = events.recv().await {
        let Some(manager) = manager.upgrade() else {
            return;
        };
        manager.handle_event(event);
    }
}
