//! mesh-daemon: tokio runtime for the audio mesh control plane.
//!
//! Thin library layer over the daemon components so integration tests and
//! embedders can drive peers managers directly.

pub mod config;
pub mod error;
pub mod initiators;
pub mod manager;
pub mod peer;
pub mod router;
pub mod rpc;
pub mod signaling;
pub mod transport;

// Re-export key types for convenience
pub use config::MeshConfig;
pub use error::PeerError;
pub use manager::{ManagerConfig, PeersManager};
pub use peer::{LivenessConfig, Peer, PeerEvent, PeerOptions};
pub use router::{MessageRouter, Subscription};
pub use transport::{MemoryNetwork, WsTransport};
