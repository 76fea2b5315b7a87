use serde_json::json;

use mosaic_widget_protocol::{PortType, WidgetKind, WidgetManifest};

use super::{validate_manifest, ManifestRegistry};
use crate::error::Error;

fn clock_manifest() -> WidgetManifest {
    WidgetManifest::new("clock", "1.0.0", WidgetKind::Display)
        .with_size(160.0, 80.0)
        .with_input_default("timezone", PortType::String, json!("UTC"))
        .with_output("tick", PortType::Number)
}

#[test]
fn valid_manifest_normalizes_and_registers() {
    let registry = ManifestRegistry::new();
    let normalized = registry.register(&clock_manifest()).expect("must register");
    assert_eq!(normalized.id(), "clock");
    assert_eq!(normalized.input_type("timezone"), Some(PortType::String));
    assert!(normalized.output("tick").is_some());
    assert!(normalized.output("timezone").is_none());
    assert_eq!(registry.manifest_ids(), vec!["clock".to_string()]);
}

#[test]
fn duplicate_id_conflicts() {
    let registry = ManifestRegistry::new();
    registry.register(&clock_manifest()).expect("first register");
    let err = registry.register(&clock_manifest()).unwrap_err();
    assert!(matches!(err, Error::Conflict { resource: "manifest", .. }));
}

#[test]
fn empty_id_and_bad_version_are_rejected() {
    let mut manifest = clock_manifest();
    manifest.id = "  ".to_string();
    manifest.version = "latest".to_string();
    let issues = validate_manifest(&manifest).unwrap_err();
    assert!(issues.iter().any(|i| i.field == "id"));
    assert!(issues.iter().any(|i| i.field == "version"));
}

#[test]
fn inconsistent_size_bounds_are_rejected() {
    let mut manifest = clock_manifest();
    manifest.size.min_width = Some(200.0);
    manifest.size.max_height = Some(40.0);
    let issues = validate_manifest(&manifest).unwrap_err();
    assert!(issues.iter().any(|i| i.field == "size.minWidth"));
    assert!(issues.iter().any(|i| i.field == "size.maxHeight"));
}

#[test]
fn unknown_port_kind_is_reported_by_name() {
    let manifest: WidgetManifest = serde_json::from_value(json!({
        "id": "gauge",
        "version": "0.1.0",
        "kind": "display",
        "size": {"width": 100, "height": 100},
        "inputs": {"value": {"type": "number"}, "level": {"type": "voltage"}}
    }))
    .unwrap();
    let issues = validate_manifest(&manifest).unwrap_err();
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].field, "inputs.level");
}

#[test]
fn list_shape_with_duplicate_names_is_rejected() {
    let manifest: WidgetManifest = serde_json::from_value(json!({
        "id": "dup",
        "version": "0.1.0",
        "kind": "interactive",
        "size": {"width": 100, "height": 100},
        "inputs": [
            {"id": "a", "type": "string"},
            {"id": "b", "name": "a", "type": "number"}
        ]
    }))
    .unwrap();
    let issues = validate_manifest(&manifest).unwrap_err();
    assert!(issues.iter().any(|i| i.field == "inputs.a"));
}

#[test]
fn reserved_event_namespace_is_rejected() {
    let manifest: WidgetManifest = serde_json::from_value(json!({
        "id": "noisy",
        "version": "0.1.0",
        "kind": "display",
        "size": {"width": 100, "height": 100},
        "events": {"emits": ["widget:boom"], "listens": []}
    }))
    .unwrap();
    let issues = validate_manifest(&manifest).unwrap_err();
    assert!(issues.iter().any(|i| i.field == "events"));
}

#[test]
fn input_defaults_follow_declaration_order() {
    let manifest: WidgetManifest = serde_json::from_value(json!({
        "id": "form",
        "version": "2.0.0",
        "kind": "interactive",
        "size": {"width": 300, "height": 200},
        "inputs": {
            "title": {"type": "string", "default": "untitled"},
            "fire": {"type": "trigger"},
            "limit": {"type": "number", "default": 10}
        }
    }))
    .unwrap();
    let normalized = validate_manifest(&manifest).expect("valid");
    let defaults = normalized.input_defaults();
    let keys: Vec<&String> = defaults.keys().collect();
    assert_eq!(keys, vec!["title", "limit"]);
    assert_eq!(defaults["limit"], json!(10));
}

#[test]
fn unregister_removes_manifest() {
    let registry = ManifestRegistry::new();
    registry.register(&clock_manifest()).expect("register");
    assert!(registry.contains("clock"));
    assert!(registry.unregister("clock").is_some());
    assert!(!registry.contains("clock"));
    assert!(registry.get("clock").is_none());
}
