//! Protocol definitions for the control plane.
//!
//! This module defines the wire protocol for peer communication:
//! - The message catalogue (`messages`)
//! - JSON encoding and tolerant decoding (`codec`)

pub mod codec;
pub mod messages;

/// Current protocol version, carried in the `peerInfo` handshake.
///
/// Increment when making breaking changes to the protocol.
pub const PROTOCOL_VERSION: u32 = 1;

pub use codec::{MAX_MESSAGE_SIZE, ProtocolError, decode, encode};
pub use messages::{
    AddLocalSinkMessage, AddLocalSourceMessage, AddRemoteSourceMessage, ControllerMessage,
    CreatePipeMessage, DisconnectMessage, MessageType, PeerConnectionInfoMessage,
    PeerDiscoveryMessage, PeerInfoMessage, RemovePipeMessage, RemoveSourceMessage, RpcEnvelope,
    SinkLatencyUpdateMessage, TimekeepRequestMessage, TimekeepResponseMessage,
    UpdateLocalSinkMessage, UpdateLocalSourceMessage,
};
