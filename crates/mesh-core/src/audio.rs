//! Audio collaborator interfaces.
//!
//! Capture, encoding, playback and device enumeration live outside this
//! crate. The control plane only needs the descriptors it announces to peers
//! and two capabilities: a source that yields encoded chunks on demand and a
//! sink that reports its effective latency.

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("Audio device not found: {0}")]
    DeviceNotFound(String),
    #[error("Audio stream failed: {0}")]
    StreamFailed(String),
}

/// Backend that produces a source's audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    /// Native loopback/capture device
    Rtaudio,
    /// Spotify Connect receiver
    Librespot,
    /// Silence generator
    Null,
    /// Source living on another peer
    Remote,
    /// Backend this build does not know about
    #[serde(other)]
    Unknown,
}

/// Backend that plays a sink's audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkType {
    Rtaudio,
    Webaudio,
    Null,
    #[serde(other)]
    Unknown,
}

/// Announced description of an audio source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceDescriptor {
    #[serde(rename = "type")]
    pub source_type: SourceType,
    pub name: String,
    pub uuid: String,
    /// Uuid of the peer owning the capture device
    pub peer_uuid: String,
    pub channels: u32,
    /// Encoding + capture latency in milliseconds
    pub latency: f64,
    /// Wall-clock ms when the first chunk was produced
    pub started_at: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
}

/// Partial update of a source descriptor. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourcePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
}

impl SourceDescriptor {
    pub fn apply(&mut self, patch: &SourcePatch) {
        if let Some(name) = &patch.name {
            self.name = name.clone();
        }
        if let Some(channels) = patch.channels {
            self.channels = channels;
        }
        if let Some(latency) = patch.latency {
            self.latency = latency;
        }
        if let Some(started_at) = patch.started_at {
            self.started_at = started_at;
        }
        if let Some(device_name) = &patch.device_name {
            self.device_name = Some(device_name.clone());
        }
    }
}

/// Announced description of an audio sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SinkDescriptor {
    #[serde(rename = "type")]
    pub sink_type: SinkType,
    pub name: String,
    pub uuid: String,
    pub peer_uuid: String,
    pub channels: u32,
    /// Output latency in milliseconds
    #[serde(default)]
    pub latency: f64,
    /// Uuid of the source currently piped into this sink
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipe_from: Option<String>,
}

/// Partial update of a sink descriptor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SinkPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipe_from: Option<String>,
}

impl SinkDescriptor {
    pub fn apply(&mut self, patch: &SinkPatch) {
        if let Some(name) = &patch.name {
            self.name = name.clone();
        }
        if let Some(channels) = patch.channels {
            self.channels = channels;
        }
        if let Some(latency) = patch.latency {
            self.latency = latency;
        }
        if let Some(pipe_from) = &patch.pipe_from {
            self.pipe_from = Some(pipe_from.clone());
        }
    }
}

/// A source of encoded audio.
///
/// `encoded_chunks` is lazy: nothing is captured until the stream is polled.
/// Calling it again after the previous stream ended restarts capture.
pub trait AudioSource: Send + Sync {
    fn descriptor(&self) -> SourceDescriptor;

    fn encoded_chunks(&self) -> BoxStream<'static, Result<Vec<u8>, AudioError>>;

    /// Capture plus encoding latency in milliseconds.
    fn latency(&self) -> f64 {
        self.descriptor().latency
    }
}

/// A playback endpoint. Only its latency matters to the control plane.
pub trait AudioSink: Send + Sync {
    fn descriptor(&self) -> SinkDescriptor;

    /// Current effective output latency in milliseconds.
    fn latency(&self) -> f64;
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    struct SilenceSource {
        chunks: usize,
    }

    impl AudioSource for SilenceSource {
        fn descriptor(&self) -> SourceDescriptor {
            sample_source()
        }

        fn encoded_chunks(&self) -> BoxStream<'static, Result<Vec<u8>, AudioError>> {
            futures::stream::iter((0..self.chunks).map(|_| Ok(vec![0u8; 4]))).boxed()
        }
    }

    fn sample_source() -> SourceDescriptor {
        SourceDescriptor {
            source_type: SourceType::Rtaudio,
            name: "Loopback".into(),
            uuid: "src-1".into(),
            peer_uuid: "peer-1".into(),
            channels: 2,
            latency: 20.0,
            started_at: 1000.0,
            device_name: Some("Speakers".into()),
        }
    }

    #[tokio::test]
    async fn test_source_stream_is_restartable() {
        let source = SilenceSource { chunks: 3 };
        let first: Vec<_> = source.encoded_chunks().collect().await;
        let second: Vec<_> = source.encoded_chunks().collect().await;
        assert_eq!(first.len(), 3);
        assert_eq!(second.len(), 3);
        assert_eq!(source.latency(), 20.0);
    }

    #[test]
    fn test_source_wire_format() {
        let json = serde_json::to_string(&sample_source()).unwrap();
        assert!(json.contains("\"type\":\"rtaudio\""));
        assert!(json.contains("\"peerUuid\":\"peer-1\""));
        assert!(json.contains("\"startedAt\":1000.0"));
    }

    #[test]
    fn test_unrecognized_backend_types_parse() {
        let sink: SinkType = serde_json::from_str("\"bluetooth\"").unwrap();
        assert_eq!(sink, SinkType::Unknown);
        let source: SourceType = serde_json::from_str("\"airplay\"").unwrap();
        assert_eq!(source, SourceType::Unknown);
        let known: SinkType = serde_json::from_str("\"webaudio\"").unwrap();
        assert_eq!(known, SinkType::Webaudio);
    }

    #[test]
    fn test_source_patch_only_touches_present_fields() {
        let mut source = sample_source();
        source.apply(&SourcePatch {
            latency: Some(35.0),
            ..Default::default()
        });
        assert_eq!(source.latency, 35.0);
        assert_eq!(source.name, "Loopback");
        assert_eq!(source.channels, 2);
    }

    #[test]
    fn test_sink_patch_sets_pipe() {
        let mut sink = SinkDescriptor {
            sink_type: SinkType::Null,
            name: "Null".into(),
            uuid: "sink-1".into(),
            peer_uuid: "peer-2".into(),
            channels: 2,
            latency: 0.0,
            pipe_from: None,
        };
        sink.apply(&SinkPatch {
            pipe_from: Some("src-1".into()),
            ..Default::default()
        });
        assert_eq!(sink.pipe_from.as_deref(), Some("src-1"));
    }

    #[test]
    fn test_empty_patch_serializes_to_empty_object() {
        let json = serde_json::to_string(&SinkPatch::default()).unwrap();
        assert_eq!(json, "{}");
    }
}
