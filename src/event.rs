//! The event value type streamed out of an agent session.
//!
//! Events are intentionally loosely typed: `kind` is the wire-level event
//! name (`"item.completed"`, `"permission.requested"`, ...) and `data` is
//! its JSON payload. Rules match on `kind` as a plain string and reach into
//! `data` for specific fields (`action`, `permission_id`, `item.role`, ...).
//! This mirrors the daemon's own untyped SSE frames and keeps the guard's
//! rule grammar a direct match for the wire format.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single event read off an agent's SSE stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

impl Event {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }

    /// Synthetic event fired when a no-activity timer expires.
    pub fn no_activity() -> Self {
        Self::new("no_activity", Value::Object(Default::default()))
    }

    pub fn is_kind(&self, kind: &str) -> bool {
        self.kind == kind
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    /// The `action` field carried by `permission.requested` events.
    pub fn action(&self) -> &str {
        self.str_field("action").unwrap_or("")
    }

    /// The `permission_id` field carried by `permission.requested` events.
    pub fn permission_id(&self) -> Option<&str> {
        self.str_field("permission_id")
    }

    /// The role of the completed/started item, for `item.*` events.
    pub fn item_role(&self) -> Option<&str> {
        self.data.get("item")?.get("role")?.as_str()
    }

    /// The item id of the completed/started item, for `item.*` events.
    pub fn item_id(&self) -> Option<&str> {
        self.data.get("item")?.get("item_id")?.as_str()
    }

    /// Paths referenced by `file_ref` content parts of a completed item.
    pub fn referenced_file_paths(&self) -> Vec<&str> {
        let Some(content) = self.data.get("item").and_then(|i| i.get("content")) else {
            return Vec::new();
        };
        let Some(parts) = content.as_array() else {
            return Vec::new();
        };
        parts
            .iter()
            .filter(|p| p.get("type").and_then(Value::as_str) == Some("file_ref"))
            .filter_map(|p| p.get("path").and_then(Value::as_str))
            .collect()
    }
}
