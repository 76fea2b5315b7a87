use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::instance::InstanceId;
use crate::manifest_registry::NormalizedManifest;

pub const DEFAULT_QUIET_PERIOD: Duration = Duration::from_millis(300);
pub const DEFAULT_MAX_WRITE_ATTEMPTS: u32 = 5;

/// The external document-store collaborator holding durable state blobs,
/// keyed by placement. Backend implementation is out of scope; the host only
/// makes request/response calls against this trait.
pub trait StateStore: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<Value>>;
    fn save(&self, key: &str, blob: &Value) -> Result<()>;
}

/// In-memory store used in tests and as the default backend.
#[derive(Default)]
pub struct MemoryStateStore {
    inner: Mutex<HashMap<String, Value>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.lock().ok()?.get(key).cloned()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.inner.lock().ok().and_then(|m| m.get(key).cloned()))
    }

    fn save(&self, key: &str, blob: &Value) -> Result<()> {
        if let Ok(mut map) = self.inner.lock() {
            map.insert(key.to_string(), blob.clone());
        }
        Ok(())
    }
}

/// One-time rewrite of a legacy state shape, run at load before the blob
/// reaches the widget.
pub trait StateMigration: Send + Sync {
    fn name(&self) -> &'static str;
    fn applies(&self, blob: &Map<String, Value>) -> bool;
    fn migrate(&self, blob: Map<String, Value>) -> Map<String, Value>;
}

/// Migrates the historical inline-array shape to the external document
/// reference shape: the legacy field's items move into a document value
/// under `document_field`, and the legacy field is removed for good.
pub struct LegacyInlineListMigration {
    pub legacy_field: String,
    pub document_field: String,
}

impl LegacyInlineListMigration {
    pub fn new(legacy_field: impl Into<String>, document_field: impl Into<String>) -> Self {
        Self {
            legacy_field: legacy_field.into(),
            document_field: document_field.into(),
        }
    }
}

impl StateMigration for LegacyInlineListMigration {
    fn name(&self) -> &'static str {
        "legacy-inline-list"
    }

    fn applies(&self, blob: &Map<String, Value>) -> bool {
        blob.get(&self.legacy_field).map(Value::is_array).unwrap_or(false)
            && !blob.contains_key(&self.document_field)
    }

    fn migrate(&self, mut blob: Map<String, Value>) -> Map<String, Value> {
        let Some(items) = blob.remove(&self.legacy_field) else {
            return blob;
        };
        let mut document = Map::new();
        document.insert("content".to_string(), items);
        document.insert(
            "contentType".to_string(),
            Value::String("application/json".to_string()),
        );
        blob.insert(self.document_field.clone(), Value::Object(document));
        blob
    }
}

struct PendingWrite {
    key: String,
    blob: Map<String, Value>,
    due: Instant,
    attempts: u32,
}

/// Mediates between ephemeral in-memory widget state and the durable store:
/// rapid `set_state` bursts coalesce into one write after a quiet period,
/// destruction flushes synchronously, write failures retry with backoff and
/// are surfaced through logs, never thrown into widget code.
pub struct PersistenceAdapter {
    store: Box<dyn StateStore>,
    quiet_period: Duration,
    max_write_attempts: u32,
    pending: Mutex<HashMap<InstanceId, PendingWrite>>,
    migrations: Vec<Box<dyn StateMigration>>,
}

impl PersistenceAdapter {
    pub fn new(store: Box<dyn StateStore>, quiet_period: Duration, max_write_attempts: u32) -> Self {
        Self {
            store,
            quiet_period,
            max_write_attempts,
            pending: Mutex::new(HashMap::new()),
            migrations: Vec::new(),
        }
    }

    pub fn with_migration(mut self, migration: Box<dyn StateMigration>) -> Self {
        self.migrations.push(migration);
        self
    }

    pub fn store(&self) -> &dyn StateStore {
        self.store.as_ref()
    }

    /// Load a placement's state blob. Corrupt or missing blobs fall back to
    /// the manifest's declared defaults and never throw past the mount
    /// boundary. Matching legacy shapes are migrated and rewritten once.
    pub fn load_state(&self, key: &str, manifest: &NormalizedManifest) -> Map<String, Value> {
        let raw = match self.store.load(key) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(
                    target: "mosaic_widgets::persistence",
                    key,
                    "state read failed, falling back to manifest defaults: {err}"
                );
                return manifest.input_defaults();
            }
        };
        let blob = match raw {
            Some(Value::Object(blob)) => blob,
            Some(other) => {
                warn!(
                    target: "mosaic_widgets::persistence",
                    key,
                    found = %other,
                    "corrupt state blob, falling back to manifest defaults"
                );
                return manifest.input_defaults();
            }
            None => return manifest.input_defaults(),
        };
        self.migrate_if_needed(key, blob)
    }

    fn migrate_if_needed(&self, key: &str, mut blob: Map<String, Value>) -> Map<String, Value> {
        for migration in &self.migrations {
            if !migration.applies(&blob) {
                continue;
            }
            blob = migration.migrate(blob);
            info!(
                target: "mosaic_widgets::persistence",
                key,
                migration = migration.name(),
                "migrated legacy state shape"
            );
            if let Err(err) = self.store.save(key, &Value::Object(blob.clone())) {
                warn!(
                    target: "mosaic_widgets::persistence",
                    key,
                    "failed to rewrite migrated state: {err}"
                );
            }
        }
        blob
    }

    /// Record a dirty blob. The durable write happens after the quiet
    /// period; another write before then replaces the blob and restarts the
    /// period, so a burst collapses into a single write.
    pub fn note_write(&self, instance: InstanceId, key: &str, blob: Map<String, Value>, now: Instant) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(
                instance,
                PendingWrite {
                    key: key.to_string(),
                    blob,
                    due: now + self.quiet_period,
                    attempts: 0,
                },
            );
        }
    }

    pub fn has_pending(&self, instance: InstanceId) -> bool {
        self.pending
            .lock()
            .map(|p| p.contains_key(&instance))
            .unwrap_or(false)
    }

    /// Write every blob whose quiet period elapsed. Failed writes stay
    /// pending with exponential backoff until the attempt cap, then drop.
    pub fn flush_due(&self, now: Instant) -> usize {
        let due: Vec<(InstanceId, String, Map<String, Value>, u32)> = {
            let Ok(pending) = self.pending.lock() else {
                return 0;
            };
            pending
                .iter()
                .filter(|(_, w)| w.due <= now)
                .map(|(id, w)| (*id, w.key.clone(), w.blob.clone(), w.attempts))
                .collect()
        };
        let mut flushed = 0;
        for (instance, key, blob, attempts) in due {
            match self.store.save(&key, &Value::Object(blob)) {
                Ok(()) => {
                    if let Ok(mut pending) = self.pending.lock() {
                        pending.remove(&instance);
                    }
                    flushed += 1;
                }
                Err(err) => self.back_off(instance, &key, attempts, now, &err),
            }
        }
        flushed
    }

    fn back_off(
        &self,
        instance: InstanceId,
        key: &str,
        attempts: u32,
        now: Instant,
        err: &crate::error::Error,
    ) {
        let attempts = attempts.saturating_add(1);
        if attempts >= self.max_write_attempts {
            warn!(
                target: "mosaic_widgets::persistence",
                key,
                attempts,
                "dropping state write after repeated failures: {err}"
            );
            if let Ok(mut pending) = self.pending.lock() {
                pending.remove(&instance);
            }
            return;
        }
        let delay = self.quiet_period.saturating_mul(1 << attempts.min(8));
        warn!(
            target: "mosaic_widgets::persistence",
            key,
            attempts,
            retry_in_ms = delay.as_millis() as u64,
            "state write failed, will retry: {err}"
        );
        if let Ok(mut pending) = self.pending.lock() {
            if let Some(write) = pending.get_mut(&instance) {
                write.attempts = attempts;
                write.due = now + delay;
            }
        }
    }

    /// Synchronous flush used at destroy time: whatever is pending for the
    /// instance is written now, before `on_destroy` completes.
    pub fn flush_now(&self, instance: InstanceId) {
        let taken = self
            .pending
            .lock()
            .ok()
            .and_then(|mut p| p.remove(&instance));
        let Some(write) = taken else {
            return;
        };
        if let Err(err) = self.store.save(&write.key, &Value::Object(write.blob)) {
            warn!(
                target: "mosaic_widgets::persistence",
                key = %write.key,
                "final state flush failed: {err}"
            );
        } else {
            debug!(
                target: "mosaic_widgets::persistence",
                key = %write.key,
                "flushed state on destroy"
            );
        }
    }

    /// Drop a pending write without flushing (used when the store itself is
    /// being torn down).
    pub fn abandon(&self, instance: InstanceId) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&instance);
        }
    }
}

#[cfg(test)]
#[path = "tests/persistence_tests.rs"]
mod tests;
