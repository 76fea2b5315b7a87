use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closed set of message kinds crossing the sandbox boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "camelCase")]
pub enum EnvelopeKind {
    #[serde(rename = "widget:init")]
    WidgetInit,
    #[serde(rename = "widget:ready")]
    WidgetReady,
    #[serde(rename = "widget:requestInit")]
    WidgetRequestInit,
    #[serde(rename = "widget:config")]
    WidgetConfig,
    #[serde(rename = "widget:reset")]
    WidgetReset,
    #[serde(rename = "widget:output")]
    WidgetOutput,
    /// Payload addressed to a declared input port.
    Input(String),
    /// Broadcast event delivery.
    Event(String),
}

impl EnvelopeKind {
    pub fn label(&self) -> String {
        match self {
            EnvelopeKind::WidgetInit => "widget:init".to_string(),
            EnvelopeKind::WidgetReady => "widget:ready".to_string(),
            EnvelopeKind::WidgetRequestInit => "widget:requestInit".to_string(),
            EnvelopeKind::WidgetConfig => "widget:config".to_string(),
            EnvelopeKind::WidgetReset => "widget:reset".to_string(),
            EnvelopeKind::WidgetOutput => "widget:output".to_string(),
            EnvelopeKind::Input(port) => format!("input:{port}"),
            EnvelopeKind::Event(name) => format!("event:{name}"),
        }
    }
}

/// The unit of serialization across the sandbox boundary.
///
/// Payloads must be JSON-serializable: no live object references, no
/// functions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub kind: EnvelopeKind,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    pub fn new(kind: EnvelopeKind, payload: Value) -> Self {
        Self { kind, payload }
    }

    pub fn bare(kind: EnvelopeKind) -> Self {
        Self {
            kind,
            payload: Value::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitPayload {
    pub canvas_id: String,
    pub widget_id: String,
    #[serde(default)]
    pub config: Value,
}

/// Widget-to-host output notification, the external envelope form of
/// `emit_output`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputPayload {
    pub output_id: String,
    #[serde(default)]
    pub data: Value,
}
