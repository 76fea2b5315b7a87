use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wildcard subscription matching every non-reserved broadcast type.
pub const WILDCARD_EVENT: &str = "*";

const RESERVED_NAMESPACES: [&str; 3] = ["widget:", "pipeline:", "bridge:"];

/// Internal namespaces excluded from wildcard subscriptions and forbidden
/// for widget-emitted events.
pub fn is_reserved_namespace(event_type: &str) -> bool {
    RESERVED_NAMESPACES
        .iter()
        .any(|ns| event_type.starts_with(ns))
}

/// An event on the broadcast bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastEvent {
    pub event_type: String,
    #[serde(default)]
    pub payload: Value,
    /// Canvas the event originated on. For cross-canvas deliveries this is
    /// the `fromCanvas` provenance receivers use to spot foreign origin.
    pub source_canvas_id: String,
    pub timestamp_ms: u64,
}

impl BroadcastEvent {
    pub fn new(
        event_type: impl Into<String>,
        payload: Value,
        source_canvas_id: impl Into<String>,
        timestamp_ms: u64,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            source_canvas_id: source_canvas_id.into(),
            timestamp_ms,
        }
    }

    pub fn matches(&self, pattern: &str) -> bool {
        if pattern == WILDCARD_EVENT {
            return !is_reserved_namespace(&self.event_type);
        }
        self.event_type == pattern
    }
}
