use serde_json::{Map, Value};

/// Namespace prefix applied to skin override keys before they reach the
/// active style scope.
pub const SKIN_VAR_PREFIX: &str = "--mosaic-";

/// Reserved input port name carrying skin override maps.
pub const SKIN_APPLY_PORT: &str = "skin.apply";

/// Prefix every non-namespaced key of a `skin.apply` payload. Keys that
/// already carry a `--` namespace pass through untouched.
pub fn prefix_overrides(overrides: &Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::new();
    for (key, value) in overrides {
        let key = if key.starts_with("--") {
            key.clone()
        } else {
            format!("{SKIN_VAR_PREFIX}{key}")
        };
        out.insert(key, value.clone());
    }
    out
}
