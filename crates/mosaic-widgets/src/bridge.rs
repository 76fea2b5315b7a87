use std::sync::Mutex;

use tracing::debug;

use mosaic_widget_protocol::BroadcastEvent;

use crate::instance::{InstanceId, InstanceRegistry};
use crate::sandbox::EventHook;

struct EventSubscription {
    instance: InstanceId,
    pattern: String,
    hook: EventHook,
}

/// Broadcast delivery scoped to a canvas id, plus the explicit cross-canvas
/// channel that ignores canvas boundaries.
///
/// Cross-canvas deliveries carry the originating canvas as provenance
/// (`source_canvas_id`), and the receiving sandbox is flagged during the
/// delivery so an unchanged re-broadcast of a foreign event is suppressed
/// at the emit side (feedback-loop guard).
#[derive(Default)]
pub struct CanvasBridge {
    subscriptions: Mutex<Vec<EventSubscription>>,
}

impl CanvasBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, instance: InstanceId, pattern: impl Into<String>, hook: EventHook) {
        if let Ok(mut subs) = self.subscriptions.lock() {
            subs.push(EventSubscription {
                instance,
                pattern: pattern.into(),
                hook,
            });
        }
    }

    /// Drop every subscription of a destroyed instance.
    pub fn remove_instance(&self, instance: InstanceId) {
        if let Ok(mut subs) = self.subscriptions.lock() {
            subs.retain(|s| s.instance != instance);
        }
    }

    fn matching_subscribers(&self, event: &BroadcastEvent) -> Vec<(InstanceId, EventHook)> {
        let Ok(subs) = self.subscriptions.lock() else {
            return Vec::new();
        };
        subs.iter()
            .filter(|s| event.matches(&s.pattern))
            .map(|s| (s.instance, s.hook.clone()))
            .collect()
    }

    /// Deliver only to mounted instances sharing the event's canvas.
    pub fn publish_local(&self, instances: &InstanceRegistry, event: &BroadcastEvent) {
        let mut delivered = 0usize;
        for (instance, hook) in self.matching_subscribers(event) {
            let Some(record) = instances.get(instance) else {
                continue;
            };
            if !record.phase.is_mounted() || record.canvas_id != event.source_canvas_id {
                continue;
            }
            record.sandbox.run_guarded("on_event", || hook(event));
            delivered += 1;
        }
        debug!(
            target: "mosaic_widgets::bridge",
            event_type = %event.event_type,
            canvas = %event.source_canvas_id,
            delivered,
            "local broadcast"
        );
    }

    /// Deliver to every mounted subscriber regardless of canvas. Receivers
    /// on a foreign canvas see the delivery flagged so they cannot echo it
    /// back onto the cross-canvas channel unchanged.
    pub fn publish_cross_canvas(&self, instances: &InstanceRegistry, event: &BroadcastEvent) {
        let mut delivered = 0usize;
        for (instance, hook) in self.matching_subscribers(event) {
            let Some(record) = instances.get(instance) else {
                continue;
            };
            if !record.phase.is_mounted() {
                continue;
            }
            let foreign = record.canvas_id != event.source_canvas_id;
            if foreign {
                record.sandbox.enter_foreign_delivery(event);
            }
            record.sandbox.run_guarded("on_event", || hook(event));
            if foreign {
                record.sandbox.leave_foreign_delivery();
            }
            delivered += 1;
        }
        debug!(
            target: "mosaic_widgets::bridge",
            event_type = %event.event_type,
            from_canvas = %event.source_canvas_id,
            delivered,
            "cross-canvas broadcast"
        );
    }
}

#[cfg(test)]
#[path = "tests/bridge_tests.rs"]
mod tests;
