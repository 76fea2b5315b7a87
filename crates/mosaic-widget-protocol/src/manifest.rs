use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::port::PortType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WidgetKind {
    Display,
    Interactive,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScaleMode {
    #[default]
    Scale,
    Stretch,
    Contain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    #[serde(default)]
    pub draggable: bool,
    #[serde(default)]
    pub resizable: bool,
    #[serde(default)]
    pub rotatable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SizeConstraints {
    pub width: f64,
    pub height: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_height: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_height: Option<f64>,
    #[serde(default)]
    pub scale_mode: ScaleMode,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SkinDescriptor {
    #[serde(default)]
    pub themeable: bool,
    /// Named color/variable slots with their default values.
    #[serde(default)]
    pub slots: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EventsDescriptor {
    #[serde(default)]
    pub emits: Vec<String>,
    #[serde(default)]
    pub listens: Vec<String>,
}

/// One declared port, the normalized internal shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortDecl {
    #[serde(rename = "type")]
    pub port_type: PortType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

/// List-form port entry, the second accepted wire shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortEntry {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub port_type: PortType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

/// Port declarations as they appear on the wire.
///
/// Two shapes exist for historical reasons: a flat `{name: {...}}` mapping
/// and a `[{id, name, type}]` list. Both normalize to the same ordered
/// name/decl pairs before any port-name check runs; only serialization keeps
/// the two forms apart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortDeclarations {
    Mapping(Map<String, Value>),
    List(Vec<PortEntry>),
}

impl Default for PortDeclarations {
    fn default() -> Self {
        PortDeclarations::Mapping(Map::new())
    }
}

impl PortDeclarations {
    pub fn is_empty(&self) -> bool {
        match self {
            PortDeclarations::Mapping(m) => m.is_empty(),
            PortDeclarations::List(l) => l.is_empty(),
        }
    }

    /// Flatten either wire shape into ordered `(name, decl)` pairs.
    ///
    /// Mapping entries that are not objects or carry an unknown `type` are
    /// returned as errors by name so the validator can report them all at
    /// once instead of failing on the first.
    pub fn normalize(&self) -> (Vec<(String, PortDecl)>, Vec<String>) {
        let mut ports = Vec::new();
        let mut bad = Vec::new();
        match self {
            PortDeclarations::Mapping(map) => {
                for (name, raw) in map {
                    match serde_json::from_value::<PortDecl>(raw.clone()) {
                        Ok(decl) => ports.push((name.clone(), decl)),
                        Err(_) => bad.push(name.clone()),
                    }
                }
            }
            PortDeclarations::List(entries) => {
                for entry in entries {
                    let name = entry
                        .name
                        .clone()
                        .filter(|n| !n.is_empty())
                        .unwrap_or_else(|| entry.id.clone());
                    ports.push((
                        name,
                        PortDecl {
                            port_type: entry.port_type,
                            description: entry.description.clone(),
                            default: entry.default.clone(),
                        },
                    ));
                }
            }
        }
        (ports, bad)
    }
}

/// Static declaration of a widget: identity, ports, capabilities, size.
///
/// Immutable once an instance has been created from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WidgetManifest {
    pub id: String,
    pub version: String,
    pub kind: WidgetKind,
    #[serde(default)]
    pub inputs: PortDeclarations,
    #[serde(default)]
    pub outputs: PortDeclarations,
    #[serde(default)]
    pub capabilities: Capabilities,
    pub size: SizeConstraints,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skin: Option<SkinDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events: Option<EventsDescriptor>,
}

impl WidgetManifest {
    pub fn new(id: impl Into<String>, version: impl Into<String>, kind: WidgetKind) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
            kind,
            inputs: PortDeclarations::default(),
            outputs: PortDeclarations::default(),
            capabilities: Capabilities::default(),
            size: SizeConstraints {
                width: 200.0,
                height: 200.0,
                min_width: None,
                min_height: None,
                max_width: None,
                max_height: None,
                scale_mode: ScaleMode::Scale,
            },
            skin: None,
            events: None,
        }
    }

    pub fn with_size(mut self, width: f64, height: f64) -> Self {
        self.size.width = width;
        self.size.height = height;
        self
    }

    pub fn with_input(mut self, name: impl Into<String>, port_type: PortType) -> Self {
        push_port(&mut self.inputs, name.into(), port_type, None);
        self
    }

    pub fn with_input_default(
        mut self,
        name: impl Into<String>,
        port_type: PortType,
        default: Value,
    ) -> Self {
        push_port(&mut self.inputs, name.into(), port_type, Some(default));
        self
    }

    pub fn with_output(mut self, name: impl Into<String>, port_type: PortType) -> Self {
        push_port(&mut self.outputs, name.into(), port_type, None);
        self
    }
}

fn push_port(decls: &mut PortDeclarations, name: String, port_type: PortType, default: Option<Value>) {
    match decls {
        PortDeclarations::Mapping(map) => {
            let decl = PortDecl {
                port_type,
                description: None,
                default,
            };
            map.insert(
                name,
                serde_json::to_value(decl).unwrap_or(Value::Null),
            );
        }
        PortDeclarations::List(entries) => entries.push(PortEntry {
            id: name.clone(),
            name: Some(name),
            port_type,
            description: None,
            default,
        }),
    }
}
