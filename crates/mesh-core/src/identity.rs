//! Identity of the local node in the mesh.
//!
//! A node has two identifiers:
//! - `uuid`: stable across restarts when configured, identifies the node
//! - `instance_uuid`: regenerated on every process start, lets remote peers
//!   tell a restarted node apart from a stale connection to its old instance

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use web_time::{SystemTime, UNIX_EPOCH};

/// Identity of this process, shared by reference with the peers manager.
///
/// # Examples
/// ```
/// use mesh_core::LocalPeer;
///
/// let local = LocalPeer::new("living-room");
/// assert_eq!(local.name, "living-room");
/// assert_ne!(local.uuid, local.instance_uuid);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalPeer {
    pub uuid: String,
    pub name: String,
    pub instance_uuid: String,
}

impl LocalPeer {
    /// Create an identity with a freshly generated uuid.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_uuid(Uuid::new_v4().to_string(), name)
    }

    /// Create an identity with a persisted uuid. The instance uuid is always new.
    pub fn with_uuid(uuid: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            name: name.into(),
            instance_uuid: Uuid::new_v4().to_string(),
        }
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
///
/// Millisecond resolution with a fractional part. Timekeeping exchanges
/// compare these values across machines, which is exactly the offset being
/// estimated.
pub fn now_ms() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64() * 1000.0)
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_generates_distinct_ids() {
        let a = LocalPeer::new("a");
        let b = LocalPeer::new("b");
        assert_ne!(a.uuid, b.uuid);
        assert_ne!(a.instance_uuid, b.instance_uuid);
    }

    #[test]
    fn test_with_uuid_keeps_uuid_but_new_instance() {
        let first = LocalPeer::with_uuid("fixed", "node");
        let restarted = LocalPeer::with_uuid("fixed", "node");
        assert_eq!(first.uuid, restarted.uuid);
        assert_ne!(first.instance_uuid, restarted.instance_uuid);
    }

    #[test]
    fn test_serde_camel_case() {
        let local = LocalPeer::with_uuid("u1", "kitchen");
        let json = serde_json::to_string(&local).unwrap();
        assert!(json.contains("\"instanceUuid\""));
    }

    #[test]
    fn test_now_ms_is_recent() {
        // 2020-01-01 in ms
        assert!(now_ms() > 1_577_836_800_000.0);
    }
}
