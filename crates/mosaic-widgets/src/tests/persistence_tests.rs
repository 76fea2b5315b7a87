use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};

use mosaic_widget_protocol::{PortType, WidgetKind, WidgetManifest};

use super::{
    LegacyInlineListMigration, MemoryStateStore, PersistenceAdapter, StateStore,
};
use crate::error::{Error, Result};
use crate::instance::InstanceId;
use crate::manifest_registry::{validate_manifest, NormalizedManifest};

const QUIET: Duration = Duration::from_millis(300);

fn counter_manifest() -> NormalizedManifest {
    let manifest = WidgetManifest::new("counter", "1.0.0", WidgetKind::Interactive)
        .with_input_default("count", PortType::Number, json!(0))
        .with_input_default("label", PortType::String, json!("total"));
    validate_manifest(&manifest).expect("valid")
}

fn blob(entries: &[(&str, Value)]) -> Map<String, Value> {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// Store double that can be made to fail a fixed number of saves, while
/// keeping the successfully written blobs observable from the test.
#[derive(Default)]
struct FlakyStore {
    fail_saves: AtomicU32,
    saved: Mutex<Vec<(String, Value)>>,
}

impl FlakyStore {
    fn failing(times: u32) -> Self {
        Self {
            fail_saves: AtomicU32::new(times),
            saved: Mutex::new(Vec::new()),
        }
    }

    fn saves(&self) -> Vec<(String, Value)> {
        self.saved.lock().unwrap().clone()
    }
}

impl StateStore for Arc<FlakyStore> {
    fn load(&self, _key: &str) -> Result<Option<Value>> {
        Ok(None)
    }

    fn save(&self, key: &str, value: &Value) -> Result<()> {
        let remaining = self.fail_saves.load(Ordering::Acquire);
        if remaining > 0 {
            self.fail_saves.store(remaining - 1, Ordering::Release);
            return Err(Error::persistence("save", format!("{key}: store unavailable")));
        }
        self.saved
            .lock()
            .unwrap()
            .push((key.to_string(), value.clone()));
        Ok(())
    }
}

#[test]
fn burst_of_writes_coalesces_into_one_save_after_the_quiet_period() {
    let store = Arc::new(FlakyStore::default());
    let adapter = PersistenceAdapter::new(Box::new(Arc::clone(&store)), QUIET, 5);
    let id = InstanceId(1);
    let t0 = Instant::now();

    adapter.note_write(id, "canvas-a/counter/1", blob(&[("count", json!(1))]), t0);
    adapter.note_write(
        id,
        "canvas-a/counter/1",
        blob(&[("count", json!(2))]),
        t0 + Duration::from_millis(100),
    );
    adapter.note_write(
        id,
        "canvas-a/counter/1",
        blob(&[("count", json!(3))]),
        t0 + Duration::from_millis(200),
    );

    // Quiet period restarted at every write, so nothing is due yet.
    assert_eq!(adapter.flush_due(t0 + Duration::from_millis(400)), 0);
    assert_eq!(adapter.flush_due(t0 + Duration::from_millis(501)), 1);
    assert!(!adapter.has_pending(id));

    let saves = store.saves();
    assert_eq!(saves.len(), 1);
    assert_eq!(saves[0].1, json!({"count": 3}));
}

#[test]
fn flush_now_writes_the_pending_blob_immediately() {
    let store = Arc::new(FlakyStore::default());
    let adapter = PersistenceAdapter::new(Box::new(Arc::clone(&store)), QUIET, 5);
    let id = InstanceId(7);
    adapter.note_write(id, "k", blob(&[("count", json!(9))]), Instant::now());

    adapter.flush_now(id);
    assert!(!adapter.has_pending(id));
    assert_eq!(store.saves(), vec![("k".to_string(), json!({"count": 9}))]);

    // Nothing pending, nothing written.
    adapter.flush_now(id);
    assert_eq!(store.saves().len(), 1);
}

#[test]
fn missing_state_falls_back_to_manifest_defaults() {
    let adapter = PersistenceAdapter::new(Box::new(MemoryStateStore::new()), QUIET, 5);
    let state = adapter.load_state("never-written", &counter_manifest());
    assert_eq!(state.get("count"), Some(&json!(0)));
    assert_eq!(state.get("label"), Some(&json!("total")));
}

#[test]
fn corrupt_state_falls_back_to_manifest_defaults() {
    let store = MemoryStateStore::new();
    store.save("k", &json!("not an object")).expect("save");
    let adapter = PersistenceAdapter::new(Box::new(store), QUIET, 5);
    let state = adapter.load_state("k", &counter_manifest());
    assert_eq!(state.get("count"), Some(&json!(0)));
}

#[test]
fn load_error_falls_back_to_manifest_defaults() {
    struct BrokenStore;
    impl StateStore for BrokenStore {
        fn load(&self, key: &str) -> Result<Option<Value>> {
            Err(Error::persistence("load", format!("{key}: disk gone")))
        }
        fn save(&self, _key: &str, _value: &Value) -> Result<()> {
            Ok(())
        }
    }
    let adapter = PersistenceAdapter::new(Box::new(BrokenStore), QUIET, 5);
    let state = adapter.load_state("k", &counter_manifest());
    assert_eq!(state.get("count"), Some(&json!(0)));
}

#[test]
fn failed_write_retries_with_backoff_then_succeeds() {
    let store = Arc::new(FlakyStore::failing(1));
    let adapter = PersistenceAdapter::new(Box::new(Arc::clone(&store)), QUIET, 5);
    let id = InstanceId(3);
    let t0 = Instant::now();
    adapter.note_write(id, "k", blob(&[("count", json!(4))]), t0);

    let due = t0 + QUIET;
    assert_eq!(adapter.flush_due(due), 0);
    assert!(adapter.has_pending(id), "failed write stays pending");

    // Backed off past one quiet period, not yet due again.
    assert_eq!(adapter.flush_due(due + QUIET), 0);
    assert_eq!(adapter.flush_due(due + QUIET * 2), 1);
    assert_eq!(store.saves().len(), 1);
}

#[test]
fn repeatedly_failing_write_is_dropped_at_the_attempt_cap() {
    let store = Arc::new(FlakyStore::failing(u32::MAX));
    let adapter = PersistenceAdapter::new(Box::new(Arc::clone(&store)), QUIET, 2);
    let id = InstanceId(4);
    let t0 = Instant::now();
    adapter.note_write(id, "k", blob(&[("count", json!(4))]), t0);

    let mut now = t0 + QUIET;
    adapter.flush_due(now);
    assert!(adapter.has_pending(id));
    now += QUIET * 8;
    adapter.flush_due(now);
    assert!(!adapter.has_pending(id), "dropped after the attempt cap");
    assert!(store.saves().is_empty());
}

#[test]
fn abandon_discards_a_pending_write_without_saving() {
    let store = Arc::new(FlakyStore::default());
    let adapter = PersistenceAdapter::new(Box::new(Arc::clone(&store)), QUIET, 5);
    let id = InstanceId(5);
    adapter.note_write(id, "k", blob(&[("count", json!(1))]), Instant::now());
    adapter.abandon(id);
    assert!(!adapter.has_pending(id));
    assert!(store.saves().is_empty());
}

#[test]
fn legacy_inline_list_is_migrated_and_rewritten_once() {
    let store = MemoryStateStore::new();
    store
        .save(
            "k",
            &json!({"todos": [{"text": "a"}, {"text": "b"}], "count": 2}),
        )
        .expect("save");
    let adapter = PersistenceAdapter::new(Box::new(store), QUIET, 5)
        .with_migration(Box::new(LegacyInlineListMigration::new("todos", "todosDocument")));

    let state = adapter.load_state("k", &counter_manifest());
    assert!(state.get("todos").is_none());
    assert_eq!(
        state.get("todosDocument"),
        Some(&json!({
            "content": [{"text": "a"}, {"text": "b"}],
            "contentType": "application/json"
        }))
    );
    assert_eq!(state.get("count"), Some(&json!(2)));

    // Rewrite happened in the store, so the next load finds the new shape
    // and the migration no longer applies.
    let rewritten = adapter.store().load("k").expect("load").expect("present");
    assert!(rewritten.get("todos").is_none());
    assert!(rewritten.get("todosDocument").is_some());
}

#[test]
fn migration_skips_blobs_already_in_the_new_shape() {
    let store = MemoryStateStore::new();
    store
        .save("k", &json!({"todos": [1], "todosDocument": {"content": []}}))
        .expect("save");
    let adapter = PersistenceAdapter::new(Box::new(store), QUIET, 5)
        .with_migration(Box::new(LegacyInlineListMigration::new("todos", "todosDocument")));
    let state = adapter.load_state("k", &counter_manifest());
    assert_eq!(state.get("todos"), Some(&json!([1])));
}
