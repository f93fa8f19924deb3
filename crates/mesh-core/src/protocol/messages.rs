//! Control-plane message catalogue.
//!
//! Every message exchanged between peers is one variant of
//! [`ControllerMessage`], serialized as a JSON object discriminated by its
//! `type` field. Unknown fields are ignored so peers running a slightly newer
//! protocol can still talk to us.

use crate::audio::{SinkPatch, SinkType, SourcePatch, SourceType};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use uuid::Uuid;

use super::PROTOCOL_VERSION;

/// Announce a source created on the sending peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddLocalSourceMessage {
    pub source_type: SourceType,
    pub name: String,
    pub uuid: String,
    pub channels: u32,
    pub latency: f64,
    pub started_at: f64,
}

/// Announce a source owned by another peer, relayed by the sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddRemoteSourceMessage {
    pub source_type: SourceType,
    pub name: String,
    pub uuid: String,
    pub channels: u32,
    pub latency: f64,
    pub started_at: f64,
    pub peer_uuid: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddLocalSinkMessage {
    pub sink_type: SinkType,
    pub name: String,
    pub uuid: String,
    pub channels: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveSourceMessage {
    pub uuid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePipeMessage {
    pub source_uuid: String,
    pub sink_uuid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemovePipeMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_uuid: Option<String>,
    pub sink_uuid: String,
}

/// Offer/answer material for relay-based bootstrapping.
///
/// `peer_uuid` is the node the material is addressed to when sent as a
/// request, and the node that produced it when sent as a reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerConnectionInfoMessage {
    pub peer_uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ice_candidates: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimekeepRequestMessage {
    pub sent_at: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimekeepResponseMessage {
    /// Echo of the request's `sent_at`
    pub sent_at: f64,
    /// Responder clock when the request was answered
    pub responded_at: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SinkLatencyUpdateMessage {
    pub sink_uuid: String,
    pub latency: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateLocalSinkMessage {
    pub sink_uuid: String,
    pub body: SinkPatch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateLocalSourceMessage {
    pub source_uuid: String,
    pub body: SourcePatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerDiscoveryMessage {
    pub peers_uuid: Vec<String>,
}

/// Identity handshake, the first message sent on every connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfoMessage {
    pub uuid: String,
    pub name: String,
    pub instance_uuid: String,
    #[serde(default = "default_version")]
    pub version: u32,
}

fn default_version() -> u32 {
    PROTOCOL_VERSION
}

/// Sent right before a peer tears its side of the connection down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectMessage {
    pub reason: String,
}

/// Correlated request/response wrapper around another message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcEnvelope {
    pub uuid: String,
    #[serde(default)]
    pub is_response: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Box<ControllerMessage>>,
}

impl RpcEnvelope {
    /// New request with a fresh correlation id.
    pub fn request(message: ControllerMessage) -> Self {
        Self {
            uuid: Uuid::new_v4().to_string(),
            is_response: false,
            error: None,
            message: Some(Box::new(message)),
        }
    }

    pub fn response(uuid: String, message: ControllerMessage) -> Self {
        Self {
            uuid,
            is_response: true,
            error: None,
            message: Some(Box::new(message)),
        }
    }

    pub fn error(uuid: String, error: impl Into<String>) -> Self {
        Self {
            uuid,
            is_response: true,
            error: Some(error.into()),
            message: None,
        }
    }

    /// Type of the wrapped message, used to find the RPC handler.
    pub fn inner_type(&self) -> Option<MessageType> {
        self.message.as_ref().map(|m| m.message_type())
    }
}

/// The closed set of control-plane messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ControllerMessage {
    Ping,
    Pong,
    RequestSourcesList,
    AddLocalSource(AddLocalSourceMessage),
    AddRemoteSource(AddRemoteSourceMessage),
    AddLocalSink(AddLocalSinkMessage),
    RemoveLocalSource(RemoveSourceMessage),
    RemoveRemoteSource(RemoveSourceMessage),
    CreatePipe(CreatePipeMessage),
    RemovePipe(RemovePipeMessage),
    PeerConnectionInfo(PeerConnectionInfoMessage),
    TimekeepRequest(TimekeepRequestMessage),
    TimekeepResponse(TimekeepResponseMessage),
    SinkLatencyUpdate(SinkLatencyUpdateMessage),
    UpdateLocalSink(UpdateLocalSinkMessage),
    UpdateLocalSource(UpdateLocalSourceMessage),
    PeerDiscovery(PeerDiscoveryMessage),
    PeerInfo(PeerInfoMessage),
    Disconnect(DisconnectMessage),
    Rpc(RpcEnvelope),
}

impl ControllerMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            ControllerMessage::Ping => MessageType::Ping,
            ControllerMessage::Pong => MessageType::Pong,
            ControllerMessage::RequestSourcesList => MessageType::RequestSourcesList,
            ControllerMessage::AddLocalSource(_) => MessageType::AddLocalSource,
            ControllerMessage::AddRemoteSource(_) => MessageType::AddRemoteSource,
            ControllerMessage::AddLocalSink(_) => MessageType::AddLocalSink,
            ControllerMessage::RemoveLocalSource(_) => MessageType::RemoveLocalSource,
            ControllerMessage::RemoveRemoteSource(_) => MessageType::RemoveRemoteSource,
            ControllerMessage::CreatePipe(_) => MessageType::CreatePipe,
            ControllerMessage::RemovePipe(_) => MessageType::RemovePipe,
            ControllerMessage::PeerConnectionInfo(_) => MessageType::PeerConnectionInfo,
            ControllerMessage::TimekeepRequest(_) => MessageType::TimekeepRequest,
            ControllerMessage::TimekeepResponse(_) => MessageType::TimekeepResponse,
            ControllerMessage::SinkLatencyUpdate(_) => MessageType::SinkLatencyUpdate,
            ControllerMessage::UpdateLocalSink(_) => MessageType::UpdateLocalSink,
            ControllerMessage::UpdateLocalSource(_) => MessageType::UpdateLocalSource,
            ControllerMessage::PeerDiscovery(_) => MessageType::PeerDiscovery,
            ControllerMessage::PeerInfo(_) => MessageType::PeerInfo,
            ControllerMessage::Disconnect(_) => MessageType::Disconnect,
            ControllerMessage::Rpc(_) => MessageType::Rpc,
        }
    }

    pub fn peer_discovery(peers_uuid: Vec<String>) -> Self {
        ControllerMessage::PeerDiscovery(PeerDiscoveryMessage { peers_uuid })
    }

    pub fn timekeep_request(sent_at: f64) -> Self {
        ControllerMessage::TimekeepRequest(TimekeepRequestMessage { sent_at })
    }

    pub fn disconnect(reason: impl Into<String>) -> Self {
        ControllerMessage::Disconnect(DisconnectMessage {
            reason: reason.into(),
        })
    }

    pub fn peer_info(uuid: &str, name: &str, instance_uuid: &str) -> Self {
        ControllerMessage::PeerInfo(PeerInfoMessage {
            uuid: uuid.to_string(),
            name: name.to_string(),
            instance_uuid: instance_uuid.to_string(),
            version: PROTOCOL_VERSION,
        })
    }
}

/// Fieldless tag of a [`ControllerMessage`], used as the routing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Ping,
    Pong,
    RequestSourcesList,
    AddLocalSource,
    AddRemoteSource,
    AddLocalSink,
    RemoveLocalSource,
    RemoveRemoteSource,
    CreatePipe,
    RemovePipe,
    PeerConnectionInfo,
    TimekeepRequest,
    TimekeepResponse,
    SinkLatencyUpdate,
    UpdateLocalSink,
    UpdateLocalSource,
    PeerDiscovery,
    PeerInfo,
    Disconnect,
    Rpc,
}

impl MessageType {
    pub const ALL: [MessageType; 20] = [
        MessageType::Ping,
        MessageType::Pong,
        MessageType::RequestSourcesList,
        MessageType::AddLocalSource,
        MessageType::AddRemoteSource,
        MessageType::AddLocalSink,
        MessageType::RemoveLocalSource,
        MessageType::RemoveRemoteSource,
        MessageType::CreatePipe,
        MessageType::RemovePipe,
        MessageType::PeerConnectionInfo,
        MessageType::TimekeepRequest,
        MessageType::TimekeepResponse,
        MessageType::SinkLatencyUpdate,
        MessageType::UpdateLocalSink,
        MessageType::UpdateLocalSource,
        MessageType::PeerDiscovery,
        MessageType::PeerInfo,
        MessageType::Disconnect,
        MessageType::Rpc,
    ];

    /// Wire tag, as found in the `type` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::RequestSourcesList => "requestSourcesList",
            MessageType::AddLocalSource => "addLocalSource",
            MessageType::AddRemoteSource => "addRemoteSource",
            MessageType::AddLocalSink => "addLocalSink",
            MessageType::RemoveLocalSource => "removeLocalSource",
            MessageType::RemoveRemoteSource => "removeRemoteSource",
            MessageType::CreatePipe => "createPipe",
            MessageType::RemovePipe => "removePipe",
            MessageType::PeerConnectionInfo => "peerConnectionInfo",
            MessageType::TimekeepRequest => "timekeepRequest",
            MessageType::TimekeepResponse => "timekeepResponse",
            MessageType::SinkLatencyUpdate => "sinkLatencyUpdate",
            MessageType::UpdateLocalSink => "updateLocalSink",
            MessageType::UpdateLocalSource => "updateLocalSource",
            MessageType::PeerDiscovery => "peerDiscovery",
            MessageType::PeerInfo => "peerInfo",
            MessageType::Disconnect => "disconnect",
            MessageType::Rpc => "rpc",
        }
    }
}

impl Display for MessageType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_json(msg: &ControllerMessage) -> String {
        serde_json::to_string(msg).unwrap()
    }

    // ==================== Wire format ====================

    #[test]
    fn test_unit_messages_are_bare_type() {
        assert_eq!(to_json(&ControllerMessage::Ping), r#"{"type":"ping"}"#);
        assert_eq!(
            to_json(&ControllerMessage::RequestSourcesList),
            r#"{"type":"requestSourcesList"}"#
        );
    }

    #[test]
    fn test_peer_discovery_wire_format() {
        let msg = ControllerMessage::peer_discovery(vec!["a".into(), "b".into()]);
        assert_eq!(
            to_json(&msg),
            r#"{"type":"peerDiscovery","peersUuid":["a","b"]}"#
        );
    }

    #[test]
    fn test_timekeep_response_wire_format() {
        let msg = ControllerMessage::TimekeepResponse(TimekeepResponseMessage {
            sent_at: 1000.0,
            responded_at: 1010.0,
        });
        let json = to_json(&msg);
        assert!(json.contains("\"type\":\"timekeepResponse\""));
        assert!(json.contains("\"sentAt\":1000.0"));
        assert!(json.contains("\"respondedAt\":1010.0"));
    }

    #[test]
    fn test_add_remote_source_parses_from_peer_json() {
        let json = r#"{
            "type": "addRemoteSource",
            "sourceType": "librespot",
            "name": "Spotify",
            "uuid": "s1",
            "channels": 2,
            "latency": 50,
            "startedAt": 1234.5,
            "peerUuid": "p1"
        }"#;
        let msg: ControllerMessage = serde_json::from_str(json).unwrap();
        match msg {
            ControllerMessage::AddRemoteSource(m) => {
                assert_eq!(m.source_type, SourceType::Librespot);
                assert_eq!(m.peer_uuid, "p1");
                assert_eq!(m.latency, 50.0);
            }
            other => panic!("Expected AddRemoteSource, got {:?}", other),
        }
    }

    #[test]
    fn test_unrecognized_source_type_still_parses() {
        let json = r#"{
            "type": "addRemoteSource",
            "sourceType": "airplay",
            "name": "Living room",
            "uuid": "s2",
            "channels": 2,
            "latency": 80,
            "startedAt": 1234.5,
            "peerUuid": "p2"
        }"#;
        let msg: ControllerMessage = serde_json::from_str(json).unwrap();
        match msg {
            ControllerMessage::AddRemoteSource(m) => {
                assert_eq!(m.source_type, SourceType::Unknown);
                assert_eq!(m.uuid, "s2");
            }
            other => panic!("Expected AddRemoteSource, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let json = r#"{"type":"createPipe","sourceUuid":"s","sinkUuid":"k","volume":0.5}"#;
        let msg: ControllerMessage = serde_json::from_str(json).unwrap();
        assert_eq!(
            msg,
            ControllerMessage::CreatePipe(CreatePipeMessage {
                source_uuid: "s".into(),
                sink_uuid: "k".into(),
            })
        );
    }

    #[test]
    fn test_peer_connection_info_optional_fields() {
        let msg = ControllerMessage::PeerConnectionInfo(PeerConnectionInfoMessage {
            peer_uuid: "z".into(),
            offer: None,
            ice_candidates: None,
        });
        assert_eq!(
            to_json(&msg),
            r#"{"type":"peerConnectionInfo","peerUuid":"z"}"#
        );
    }

    #[test]
    fn test_update_local_sink_partial_body() {
        let json = r#"{"type":"updateLocalSink","sinkUuid":"k","body":{"latency":42}}"#;
        let msg: ControllerMessage = serde_json::from_str(json).unwrap();
        match msg {
            ControllerMessage::UpdateLocalSink(m) => {
                assert_eq!(m.body.latency, Some(42.0));
                assert!(m.body.name.is_none());
            }
            other => panic!("Expected UpdateLocalSink, got {:?}", other),
        }
    }

    #[test]
    fn test_peer_info_defaults_version() {
        let json = r#"{"type":"peerInfo","uuid":"u","name":"n","instanceUuid":"i"}"#;
        let msg: ControllerMessage = serde_json::from_str(json).unwrap();
        match msg {
            ControllerMessage::PeerInfo(info) => assert_eq!(info.version, PROTOCOL_VERSION),
            other => panic!("Expected PeerInfo, got {:?}", other),
        }
    }

    // ==================== RPC envelope ====================

    #[test]
    fn test_rpc_request_nests_message() {
        let envelope = RpcEnvelope::request(ControllerMessage::Ping);
        let json = to_json(&ControllerMessage::Rpc(envelope.clone()));
        assert!(json.starts_with(r#"{"type":"rpc""#));
        assert!(json.contains(r#""message":{"type":"ping"}"#));
        assert!(json.contains(r#""isResponse":false"#));
        assert_eq!(envelope.inner_type(), Some(MessageType::Ping));
    }

    #[test]
    fn test_rpc_requests_get_unique_ids() {
        let a = RpcEnvelope::request(ControllerMessage::Ping);
        let b = RpcEnvelope::request(ControllerMessage::Ping);
        assert_ne!(a.uuid, b.uuid);
    }

    #[test]
    fn test_rpc_error_has_no_message() {
        let envelope = RpcEnvelope::error("id".into(), "no handler");
        assert!(envelope.is_response);
        assert!(envelope.inner_type().is_none());
        let json = to_json(&ControllerMessage::Rpc(envelope));
        assert!(!json.contains("\"message\""));
        assert!(json.contains("\"error\":\"no handler\""));
    }

    // ==================== MessageType ====================

    #[test]
    fn test_message_type_matches_wire_tag() {
        let samples = vec![
            ControllerMessage::Pong,
            ControllerMessage::timekeep_request(1.0),
            ControllerMessage::peer_discovery(vec![]),
            ControllerMessage::disconnect("exiting"),
            ControllerMessage::peer_info("u", "n", "i"),
            ControllerMessage::Rpc(RpcEnvelope::request(ControllerMessage::Ping)),
        ];
        for msg in samples {
            let value: serde_json::Value = serde_json::to_value(&msg).unwrap();
            assert_eq!(value["type"], msg.message_type().as_str());
        }
    }

    #[test]
    fn test_message_type_from_str() {
        for t in MessageType::ALL {
            assert_eq!(t.as_str().parse::<MessageType>(), Ok(t));
        }
        assert!("nope".parse::<MessageType>().is_err());
    }
}
