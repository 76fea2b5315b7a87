use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::{Map, Value};
use tracing::warn;

use mosaic_widget_protocol::{is_reserved_namespace, PortDecl, PortType, WidgetManifest};

use crate::error::{Error, Result, ValidationIssue};

/// A manifest that survived validation, with both port shapes flattened into
/// ordered name/decl pairs. Port-name checks at runtime always run against
/// this form, never against the wire shapes.
#[derive(Debug, Clone)]
pub struct NormalizedManifest {
    pub manifest: WidgetManifest,
    inputs: Vec<(String, PortDecl)>,
    outputs: Vec<(String, PortDecl)>,
}

impl NormalizedManifest {
    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    pub fn input(&self, name: &str) -> Option<&PortDecl> {
        self.inputs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, decl)| decl)
    }

    pub fn output(&self, name: &str) -> Option<&PortDecl> {
        self.outputs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, decl)| decl)
    }

    pub fn inputs(&self) -> &[(String, PortDecl)] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[(String, PortDecl)] {
        &self.outputs
    }

    pub fn input_type(&self, name: &str) -> Option<PortType> {
        self.input(name).map(|d| d.port_type)
    }

    /// Statically-bound input values: every declared input default, in
    /// declaration order. Handed to widgets at mount.
    pub fn input_defaults(&self) -> Map<String, Value> {
        let mut out = Map::new();
        for (name, decl) in &self.inputs {
            if let Some(default) = &decl.default {
                out.insert(name.clone(), default.clone());
            }
        }
        out
    }
}

fn looks_like_semver(version: &str) -> bool {
    let core = version.split(['-', '+']).next().unwrap_or("");
    let parts: Vec<&str> = core.split('.').collect();
    parts.len() == 3 && parts.iter().all(|p| !p.is_empty() && p.parse::<u64>().is_ok())
}

fn check_size(manifest: &WidgetManifest, issues: &mut Vec<ValidationIssue>) {
    let size = &manifest.size;
    if size.width <= 0.0 || size.height <= 0.0 {
        issues.push(ValidationIssue::new("size", "width and height must be positive"));
    }
    let bounds = [
        ("minWidth", size.min_width, size.width, true),
        ("minHeight", size.min_height, size.height, true),
        ("maxWidth", size.max_width, size.width, false),
        ("maxHeight", size.max_height, size.height, false),
    ];
    for (field, bound, base, is_min) in bounds {
        let Some(bound) = bound else { continue };
        let ok = if is_min { bound <= base } else { bound >= base };
        if !ok {
            issues.push(ValidationIssue::new(
                format!("size.{field}"),
                "inconsistent with declared width/height",
            ));
        }
    }
}

fn normalize_ports(
    decls: &mosaic_widget_protocol::PortDeclarations,
    side: &str,
    issues: &mut Vec<ValidationIssue>,
) -> Vec<(String, PortDecl)> {
    let (ports, bad) = decls.normalize();
    for name in bad {
        issues.push(ValidationIssue::new(
            format!("{side}.{name}"),
            "port type is not a known kind",
        ));
    }
    let mut seen = Vec::new();
    for (name, _) in &ports {
        if name.is_empty() {
            issues.push(ValidationIssue::new(side, "port name must be non-empty"));
        } else if seen.contains(name) {
            issues.push(ValidationIssue::new(
                format!("{side}.{name}"),
                "duplicate port name",
            ));
        } else {
            seen.push(name.clone());
        }
    }
    ports
}

/// Validate a manifest and flatten it to the canonical internal shape.
///
/// A manifest failing validation is rejected at registration time and never
/// reaches widget-instance creation.
pub fn validate_manifest(
    manifest: &WidgetManifest,
) -> std::result::Result<NormalizedManifest, Vec<ValidationIssue>> {
    let mut issues = Vec::new();

    if manifest.id.trim().is_empty() {
        issues.push(ValidationIssue::new("id", "must be non-empty"));
    }
    if !looks_like_semver(&manifest.version) {
        issues.push(ValidationIssue::new(
            "version",
            "must be a semver major.minor.patch string",
        ));
    }
    check_size(manifest, &mut issues);

    let inputs = normalize_ports(&manifest.inputs, "inputs", &mut issues);
    let outputs = normalize_ports(&manifest.outputs, "outputs", &mut issues);

    if let Some(events) = &manifest.events {
        for name in events.emits.iter().chain(events.listens.iter()) {
            if is_reserved_namespace(name) {
                issues.push(ValidationIssue::new(
                    "events",
                    format!("`{name}` uses a reserved namespace"),
                ));
            }
        }
    }

    if issues.is_empty() {
        Ok(NormalizedManifest {
            manifest: manifest.clone(),
            inputs,
            outputs,
        })
    } else {
        Err(issues)
    }
}

/// Owned manifest store with an injected lifecycle, never ambient global
/// state: every host owns its own registry, so independent hosts can coexist
/// in one process.
#[derive(Default)]
pub struct ManifestRegistry {
    inner: RwLock<HashMap<String, Arc<NormalizedManifest>>>,
}

impl ManifestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and register. Duplicate ids conflict; invalid manifests are
    /// rejected before any instance can be created from them.
    pub fn register(&self, manifest: &WidgetManifest) -> Result<Arc<NormalizedManifest>> {
        let normalized = validate_manifest(manifest).map_err(|issues| {
            warn!(
                target: "mosaic_widgets::registry",
                widget_id = %manifest.id,
                issues = issues.len(),
                "reject invalid manifest"
            );
            Error::validation(manifest.id.clone(), issues)
        })?;
        let Ok(mut map) = self.inner.write() else {
            return Err(Error::persistence("registry write", "lock poisoned"));
        };
        if map.contains_key(&manifest.id) {
            return Err(Error::conflict("manifest", manifest.id.clone()));
        }
        let normalized = Arc::new(normalized);
        map.insert(manifest.id.clone(), Arc::clone(&normalized));
        Ok(normalized)
    }

    pub fn get(&self, widget_id: &str) -> Option<Arc<NormalizedManifest>> {
        let map = self.inner.read().ok()?;
        map.get(widget_id).cloned()
    }

    pub fn contains(&self, widget_id: &str) -> bool {
        self.inner
            .read()
            .map(|map| map.contains_key(widget_id))
            .unwrap_or(false)
    }

    pub fn unregister(&self, widget_id: &str) -> Option<Arc<NormalizedManifest>> {
        let mut map = self.inner.write().ok()?;
        map.remove(widget_id)
    }

    pub fn manifest_ids(&self) -> Vec<String> {
        let Ok(map) = self.inner.read() else {
            return Vec::new();
        };
        let mut ids = map.keys().cloned().collect::<Vec<_>>();
        ids.sort();
        ids
    }
}

#[cfg(test)]
#[path = "tests/manifest_registry_tests.rs"]
mod tests;
