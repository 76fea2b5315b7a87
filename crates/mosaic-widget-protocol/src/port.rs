use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Closed set of payload kinds a port may declare.
///
/// Coercion is advisory: the router always delivers the raw payload and a
/// receiving widget validates at its own input handlers. The registry exists
/// for manifest-driven tooling and static checks, not to block delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortType {
    String,
    Number,
    Boolean,
    Object,
    Array,
    Any,
    /// Payload is ignored, the message itself is the signal.
    Trigger,
    /// Opaque passthrough.
    Event,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot coerce {found} to {expected}")]
pub struct CoercionError {
    pub expected: &'static str,
    pub found: &'static str,
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

impl PortType {
    pub const ALL: [PortType; 8] = [
        PortType::String,
        PortType::Number,
        PortType::Boolean,
        PortType::Object,
        PortType::Array,
        PortType::Any,
        PortType::Trigger,
        PortType::Event,
    ];

    pub fn parse(name: &str) -> Option<PortType> {
        match name {
            "string" => Some(PortType::String),
            "number" => Some(PortType::Number),
            "boolean" => Some(PortType::Boolean),
            "object" => Some(PortType::Object),
            "array" => Some(PortType::Array),
            "any" => Some(PortType::Any),
            "trigger" => Some(PortType::Trigger),
            "event" => Some(PortType::Event),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PortType::String => "string",
            PortType::Number => "number",
            PortType::Boolean => "boolean",
            PortType::Object => "object",
            PortType::Array => "array",
            PortType::Any => "any",
            PortType::Trigger => "trigger",
            PortType::Event => "event",
        }
    }

    /// Advisory coercion of a raw payload toward this kind.
    ///
    /// Scalar conversions are applied only where lossless; `any` and `event`
    /// pass through untouched; `trigger` discards the payload entirely.
    pub fn coerce(self, raw: &Value) -> Result<Value, CoercionError> {
        let mismatch = || CoercionError {
            expected: self.as_str(),
            found: json_kind(raw),
        };
        match self {
            PortType::Any | PortType::Event => Ok(raw.clone()),
            PortType::Trigger => Ok(Value::Null),
            PortType::String => match raw {
                Value::String(_) => Ok(raw.clone()),
                Value::Number(n) => Ok(Value::String(n.to_string())),
                Value::Bool(b) => Ok(Value::String(b.to_string())),
                _ => Err(mismatch()),
            },
            PortType::Number => match raw {
                Value::Number(_) => Ok(raw.clone()),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .and_then(serde_json::Number::from_f64)
                    .map(Value::Number)
                    .ok_or_else(mismatch),
                _ => Err(mismatch()),
            },
            PortType::Boolean => match raw {
                Value::Bool(_) => Ok(raw.clone()),
                Value::String(s) => match s.trim() {
                    "true" => Ok(Value::Bool(true)),
                    "false" => Ok(Value::Bool(false)),
                    _ => Err(mismatch()),
                },
                _ => Err(mismatch()),
            },
            PortType::Object => match raw {
                Value::Object(_) => Ok(raw.clone()),
                _ => Err(mismatch()),
            },
            PortType::Array => match raw {
                Value::Array(_) => Ok(raw.clone()),
                _ => Err(mismatch()),
            },
        }
    }
}

impl std::fmt::Display for PortType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
