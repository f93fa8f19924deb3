//! mesh-core: Shared Rust library for the audio mesh control plane.
//!
//! This crate provides the runtime-agnostic pieces of peer coordination:
//! - The closed catalogue of control-plane messages and its JSON codec
//! - Peer identity and connection state types
//! - Transport capability traits (offer/answer bootstrap, message channel)
//! - Reconnection backoff policy
//! - Clock-offset estimation and sink latency reporting
//! - Audio source/sink collaborator interfaces

pub mod audio;
pub mod identity;
pub mod peers;
pub mod protocol;
pub mod reconnect;
pub mod timekeeping;
pub mod transport;

pub use identity::{LocalPeer, now_ms};
pub use peers::{DisconnectReason, InitiatorKind, InitiatorTarget, PeerState};
pub use protocol::{ControllerMessage, MessageType, ProtocolError};
pub use reconnect::{ReconnectConfig, ReconnectState};
pub use timekeeping::{LatencyReporter, TimekeepConfig, TimekeepEstimator, TimekeepSample};
pub use transport::{
    OutgoingOffer, PeerConnection, PendingConnection, SessionDescription, Transport,
    TransportError,
};
