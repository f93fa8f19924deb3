//! Peer lifecycle types shared between the core and the daemon.
//!
//! Provides `PeerState` for the connection state machine, `DisconnectReason`
//! for teardown bookkeeping and `InitiatorTarget`, the key used to deduplicate
//! join attempts.

use serde::Serialize;
use std::fmt::{self, Display, Formatter};

/// Connection state of a peer.
///
/// ```text
/// Idle → Connecting → Connected → Disconnected → Destroyed
///             ↑                        │
///             └──── (recovery) ────────┘
/// ```
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum PeerState {
    /// Created, `connect()` not called yet
    Idle,
    /// Initiator running or waiting for the remote identity handshake
    Connecting,
    /// Handshake complete, messages flow
    Connected,
    /// Transport closed; may reconnect if the peer has a recovery policy
    Disconnected,
    /// Torn down, terminal
    Destroyed,
}

impl PeerState {
    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// Destroying is always allowed (and a no-op when already destroyed).
    pub fn can_transition_to(&self, next: PeerState) -> bool {
        use PeerState::*;
        match (self, next) {
            (Destroyed, _) => false,
            (_, Destroyed) => true,
            (Idle, Connecting) => true,
            (Connecting, Connected) | (Connecting, Disconnected) => true,
            (Connected, Disconnected) => true,
            (Disconnected, Connecting) => true,
            _ => false,
        }
    }

    pub fn is_destroyed(&self) -> bool {
        matches!(self, PeerState::Destroyed)
    }
}

impl Display for PeerState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeerState::Idle => "idle",
            PeerState::Connecting => "connecting",
            PeerState::Connected => "connected",
            PeerState::Disconnected => "disconnected",
            PeerState::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

/// Reason a peer was disconnected or destroyed.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum DisconnectReason {
    /// destroy() called locally
    UserRequested,
    /// Local process shutting down
    Exiting,
    /// Transport closed by the remote or the network
    RemoteClosed,
    /// Remote announced its own teardown
    RemoteDestroyed,
    /// No traffic within the liveness window
    LivenessTimeout,
    /// Initiator or identity handshake failed
    ConnectionFailed,
    /// Another connection to the same peer instance already exists
    DuplicateConnection,
    /// A newer instance of the same peer connected
    StaleInstance,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::UserRequested => "userRequested",
            DisconnectReason::Exiting => "exiting",
            DisconnectReason::RemoteClosed => "remoteClosed",
            DisconnectReason::RemoteDestroyed => "remoteDestroyed",
            DisconnectReason::LivenessTimeout => "livenessTimeout",
            DisconnectReason::ConnectionFailed => "connectionFailed",
            DisconnectReason::DuplicateConnection => "duplicateConnection",
            DisconnectReason::StaleInstance => "staleInstance",
        }
    }
}

impl Display for DisconnectReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The strategy family of an initiator.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum InitiatorKind {
    HttpApi,
    Rendezvous,
    PeerRelay,
    /// Answering side of an offer we received
    Accepted,
}

/// What an initiator connects to. Two joins with equal targets are duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InitiatorTarget {
    HttpApi { endpoint: String },
    Rendezvous { host: String, peer_uuid: String },
    PeerRelay { target_uuid: String },
    Accepted { session: String },
}

impl InitiatorTarget {
    /// HTTP target with the endpoint normalized (trailing slashes removed).
    pub fn http_api(endpoint: &str) -> Self {
        Self::HttpApi {
            endpoint: normalize_url(endpoint),
        }
    }

    pub fn rendezvous(host: &str, peer_uuid: &str) -> Self {
        Self::Rendezvous {
            host: normalize_url(host),
            peer_uuid: peer_uuid.to_string(),
        }
    }

    pub fn peer_relay(target_uuid: &str) -> Self {
        Self::PeerRelay {
            target_uuid: target_uuid.to_string(),
        }
    }

    pub fn kind(&self) -> InitiatorKind {
        match self {
            InitiatorTarget::HttpApi { .. } => InitiatorKind::HttpApi,
            InitiatorTarget::Rendezvous { .. } => InitiatorKind::Rendezvous,
            InitiatorTarget::PeerRelay { .. } => InitiatorKind::PeerRelay,
            InitiatorTarget::Accepted { .. } => InitiatorKind::Accepted,
        }
    }

    /// Uuid of the remote node when it is known before connecting.
    pub fn target_uuid(&self) -> Option<&str> {
        match self {
            InitiatorTarget::Rendezvous { peer_uuid, .. } => Some(peer_uuid),
            InitiatorTarget::PeerRelay { target_uuid } => Some(target_uuid),
            InitiatorTarget::HttpApi { .. } | InitiatorTarget::Accepted { .. } => None,
        }
    }

    /// Placeholder uuid/name used until the remote identity handshake arrives.
    pub fn placeholder(&self) -> String {
        match self {
            InitiatorTarget::HttpApi { endpoint } => {
                format!("placeholderForHttpApiJoin_{}", endpoint)
            }
            InitiatorTarget::Rendezvous { host, .. } => {
                format!("placeholderForRendezvousJoin_{}", host)
            }
            InitiatorTarget::PeerRelay { target_uuid } => {
                format!("placeholderForPeerRelay_{}", target_uuid)
            }
            InitiatorTarget::Accepted { session } => format!("placeholderForAccepted_{}", session),
        }
    }
}

impl Display for InitiatorTarget {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            InitiatorTarget::HttpApi { endpoint } => write!(f, "http:{}", endpoint),
            InitiatorTarget::Rendezvous { host, peer_uuid } => {
                write!(f, "rendezvous:{}/{}", host, peer_uuid)
            }
            InitiatorTarget::PeerRelay { target_uuid } => write!(f, "relay:{}", target_uuid),
            InitiatorTarget::Accepted { session } => write!(f, "accepted:{}", session),
        }
    }
}

fn normalize_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}
