//! JSON codec for controller messages.
//!
//! Decoding distinguishes messages we cannot parse at all from well-formed
//! messages of a type we do not know, so callers can log the latter at a
//! lower level (a newer peer is not an error).

use super::messages::{ControllerMessage, MessageType};
use thiserror::Error;

/// Maximum encoded message size (1 MiB). Control messages are tiny; anything
/// larger is a misbehaving peer.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Message too large ({0} > {MAX_MESSAGE_SIZE} bytes)")]
    TooLarge(usize),
}

/// Serialize a message to JSON bytes.
pub fn encode(message: &ControllerMessage) -> Vec<u8> {
    serde_json::to_vec(message).expect("ControllerMessage serialization should not fail")
}

/// Parse a message from JSON bytes.
pub fn decode(data: &[u8]) -> Result<ControllerMessage, ProtocolError> {
    if data.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::TooLarge(data.len()));
    }

    match serde_json::from_slice::<ControllerMessage>(data) {
        Ok(message) => Ok(message),
        Err(err) => {
            // Tell "valid object, unknown type" apart from garbage
            let value: serde_json::Value = serde_json::from_slice(data)
                .map_err(|_| ProtocolError::Malformed(err.to_string()))?;
            match value.get("type").and_then(|t| t.as_str()) {
                Some(tag) if tag.parse::<MessageType>().is_err() => {
                    Err(ProtocolError::UnknownType(tag.to_string()))
                }
                _ => Err(ProtocolError::Malformed(err.to_string())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::SinkLatencyUpdateMessage;

    #[test]
    fn test_encode_decode() {
        let msg = ControllerMessage::SinkLatencyUpdate(SinkLatencyUpdateMessage {
            sink_uuid: "k".into(),
            latency: 12.5,
        });
        assert_eq!(decode(&encode(&msg)).unwrap(), msg);
    }

    #[test]
    fn test_unknown_type() {
        let err = decode(br#"{"type":"hologram","x":1}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownType(ref t) if t == "hologram"));
    }

    #[test]
    fn test_known_type_missing_fields_is_malformed() {
        let err = decode(br#"{"type":"createPipe"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_not_json_is_malformed() {
        assert!(matches!(
            decode(b"not json").unwrap_err(),
            ProtocolError::Malformed(_)
        ));
        assert!(matches!(decode(b"").unwrap_err(), ProtocolError::Malformed(_)));
        assert!(matches!(
            decode(&[0xFF, 0xFE]).unwrap_err(),
            ProtocolError::Malformed(_)
        ));
    }

    #[test]
    fn test_missing_type_is_malformed() {
        assert!(matches!(
            decode(br#"{"uuid":"x"}"#).unwrap_err(),
            ProtocolError::Malformed(_)
        ));
    }

    #[test]
    fn test_too_large() {
        let data = vec![b' '; MAX_MESSAGE_SIZE + 1];
        assert!(matches!(
            decode(&data).unwrap_err(),
            ProtocolError::TooLarge(_)
        ));
    }
}
