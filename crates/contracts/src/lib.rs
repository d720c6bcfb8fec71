use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const CLUSTER_API_VERSION: &str = "cluster.open-cluster-management.io/v1";
pub const CLUSTER_KIND: &str = "ManagedCluster";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WatchEventType {
    Added,
    Deleted,
}

impl WatchEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            WatchEventType::Added => "ADDED",
            WatchEventType::Deleted => "DELETED",
        }
    }
}

/// One line of a watch response: the event type plus the full cluster
/// record for additions, or a name-only stub for deletions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchEvent {
    #[serde(rename = "type")]
    pub event_type: WatchEventType,
    pub object: Value,
}

impl WatchEvent {
    pub fn added(object: Value) -> Self {
        Self {
            event_type: WatchEventType::Added,
            object,
        }
    }

    pub fn deleted(cluster_name: &str) -> Self {
        Self {
            event_type: WatchEventType::Deleted,
            object: deleted_cluster_stub(cluster_name),
        }
    }
}

/// Minimal record carried by DELETED events. The full payload is gone from
/// the database by the time the deletion is observed, so only the identity
/// fields are reconstructed.
pub fn deleted_cluster_stub(cluster_name: &str) -> Value {
    serde_json::json!({
        "apiVersion": CLUSTER_API_VERSION,
        "kind": CLUSTER_KIND,
        "metadata": { "name": cluster_name },
    })
}

/// Derived key of a cluster record: `payload.metadata.name`.
pub fn cluster_name(payload: &Value) -> Option<&str> {
    payload
        .get("metadata")
        .and_then(|metadata| metadata.get("name"))
        .and_then(Value::as_str)
}

/// A single RFC 6902-style operation. `op` stays a plain string so that
/// unsupported operations surface as 501 rather than a body-decode failure.
#[derive(Debug, Clone, Deserialize)]
pub struct PatchOperation {
    pub op: String,
    pub path: String,
    #[serde(default)]
    pub value: String,
}
