use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use crate::sandbox::WidgetSandbox;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceId(pub u64);

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "instance-{}", self.0)
    }
}

/// Lifecycle of a placed widget: `unmounted -> mounted -> destroyed`,
/// monotonic, no re-entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecyclePhase {
    Unmounted = 1,
    Mounted = 2,
    Destroyed = 3,
}

impl LifecyclePhase {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Unmounted,
            2 => Self::Mounted,
            _ => Self::Destroyed,
        }
    }
}

/// Atomic phase cell enforcing monotonic transitions.
#[derive(Debug)]
pub struct PhaseCell {
    state: AtomicU8,
}

impl Default for PhaseCell {
    fn default() -> Self {
        Self {
            state: AtomicU8::new(LifecyclePhase::Unmounted as u8),
        }
    }
}

impl PhaseCell {
    pub fn phase(&self) -> LifecyclePhase {
        LifecyclePhase::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Returns false when the instance already left the unmounted phase.
    pub fn mark_mounted(&self) -> bool {
        self.state
            .compare_exchange(
                LifecyclePhase::Unmounted as u8,
                LifecyclePhase::Mounted as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Returns false when already destroyed; destruction from the unmounted
    /// phase is allowed (a placement removed before it ever mounted).
    pub fn mark_destroyed(&self) -> bool {
        let prev = self
            .state
            .swap(LifecyclePhase::Destroyed as u8, Ordering::AcqRel);
        prev != LifecyclePhase::Destroyed as u8
    }

    pub fn is_mounted(&self) -> bool {
        self.phase() == LifecyclePhase::Mounted
    }

    pub fn is_destroyed(&self) -> bool {
        self.phase() == LifecyclePhase::Destroyed
    }
}

/// One placed widget: manifest reference, canvas scope, phase, sandbox.
#[derive(Clone)]
pub struct InstanceRecord {
    pub id: InstanceId,
    pub widget_id: String,
    pub canvas_id: String,
    /// Durable placement key chosen by the graph editor; persistence is
    /// keyed by it so a destroyed-and-reloaded placement finds its state.
    pub placement_id: String,
    pub phase: Arc<PhaseCell>,
    pub sandbox: Arc<WidgetSandbox>,
}

#[derive(Default)]
pub struct InstanceRegistry {
    next_id: AtomicU64,
    inner: Mutex<HashMap<InstanceId, InstanceRecord>>,
}

impl InstanceRegistry {
    pub fn allocate_id(&self) -> InstanceId {
        InstanceId(
            self.next_id
                .fetch_add(1, Ordering::Relaxed)
                .saturating_add(1),
        )
    }

    pub fn register(&self, record: InstanceRecord) {
        if let Ok(mut map) = self.inner.lock() {
            map.insert(record.id, record);
        }
    }

    pub fn get(&self, id: InstanceId) -> Option<InstanceRecord> {
        let map = self.inner.lock().ok()?;
        map.get(&id).cloned()
    }

    pub fn remove(&self, id: InstanceId) -> Option<InstanceRecord> {
        let mut map = self.inner.lock().ok()?;
        map.remove(&id)
    }

    pub fn contains(&self, id: InstanceId) -> bool {
        self.inner
            .lock()
            .map(|map| map.contains_key(&id))
            .unwrap_or(false)
    }

    pub fn ids_for_canvas(&self, canvas_id: &str) -> Vec<InstanceId> {
        let Ok(map) = self.inner.lock() else {
            return Vec::new();
        };
        let mut ids = map
            .values()
            .filter(|r| r.canvas_id == canvas_id)
            .map(|r| r.id)
            .collect::<Vec<_>>();
        ids.sort_by_key(|id| id.0);
        ids
    }

    pub fn all_ids(&self) -> Vec<InstanceId> {
        let Ok(map) = self.inner.lock() else {
            return Vec::new();
        };
        let mut ids = map.keys().copied().collect::<Vec<_>>();
        ids.sort_by_key(|id| id.0);
        ids
    }
}
