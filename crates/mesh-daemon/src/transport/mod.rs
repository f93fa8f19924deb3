//! Transports implementing the core capability traits.
//!
//! - `websocket`: tokio-tungstenite sockets, the daemon's default
//! - `memory`: in-process channel pairs for tests and embedders

pub mod memory;
pub mod websocket;

pub use memory::{MemoryConnection, MemoryNetwork, MemoryTransport};
pub use websocket::{WsConnection, WsTransport};
