use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use serde_json::Value;
use tracing::{debug, warn};

use crate::instance::{InstanceId, InstanceRegistry};

pub const DEFAULT_RECURSION_CEILING: usize = 10;

/// One end of a pipeline connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PortRef {
    pub instance: InstanceId,
    pub port: String,
}

impl PortRef {
    pub fn new(instance: InstanceId, port: impl Into<String>) -> Self {
        Self {
            instance,
            port: port.into(),
        }
    }
}

/// Directed edge from a declared output port to a declared input port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConnection {
    pub source: PortRef,
    pub target: PortRef,
}

/// Owned store of the connection set, created and destroyed by the host
/// graph editor; the router only consumes the current snapshot.
///
/// Insertion order is preserved and is the delivery order within one
/// emission. Same-tick fan-in to a single input therefore resolves
/// deterministically: the most recently inserted connection is the last
/// writer.
#[derive(Default)]
pub struct ConnectionGraph {
    edges: Mutex<Vec<PipelineConnection>>,
    snapshot: ArcSwap<Vec<PipelineConnection>>,
}

impl ConnectionGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn refresh_snapshot(&self, edges: &[PipelineConnection]) {
        self.snapshot.store(Arc::new(edges.to_vec()));
    }

    /// Add an edge. Re-adding an identical edge is a no-op so an emission is
    /// delivered at most once per connection.
    pub fn connect(&self, source: PortRef, target: PortRef) -> bool {
        let Ok(mut edges) = self.edges.lock() else {
            return false;
        };
        let edge = PipelineConnection { source, target };
        if edges.contains(&edge) {
            return false;
        }
        edges.push(edge);
        self.refresh_snapshot(&edges);
        true
    }

    pub fn disconnect(&self, source: &PortRef, target: &PortRef) -> bool {
        let Ok(mut edges) = self.edges.lock() else {
            return false;
        };
        let before = edges.len();
        edges.retain(|e| !(&e.source == source && &e.target == target));
        let changed = edges.len() != before;
        if changed {
            self.refresh_snapshot(&edges);
        }
        changed
    }

    /// Drop every edge touching an instance; used when a placement is
    /// removed and by the router's lazy pruning of dead targets.
    pub fn prune_instance(&self, instance: InstanceId) -> usize {
        let Ok(mut edges) = self.edges.lock() else {
            return 0;
        };
        let before = edges.len();
        edges.retain(|e| e.source.instance != instance && e.target.instance != instance);
        let pruned = before - edges.len();
        if pruned > 0 {
            self.refresh_snapshot(&edges);
        }
        pruned
    }

    pub fn snapshot(&self) -> Arc<Vec<PipelineConnection>> {
        self.snapshot.load_full()
    }

    pub fn connections_from(&self, source: &PortRef) -> Vec<PipelineConnection> {
        self.snapshot()
            .iter()
            .filter(|e| &e.source == source)
            .cloned()
            .collect()
    }
}

struct DepthGuard<'a>(&'a AtomicUsize);

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Host-side fan-out of emitted outputs to all connected inputs.
///
/// Fire-and-forget: at-most-once per emission per connection, no retries,
/// no back-pressure. "Latest value wins" pipeline semantics, not a durable
/// log.
pub struct PipelineRouter {
    graph: ConnectionGraph,
    depth: AtomicUsize,
    recursion_ceiling: usize,
}

impl PipelineRouter {
    pub fn new(recursion_ceiling: usize) -> Self {
        Self {
            graph: ConnectionGraph::new(),
            depth: AtomicUsize::new(0),
            recursion_ceiling,
        }
    }

    pub fn graph(&self) -> &ConnectionGraph {
        &self.graph
    }

    /// Deliver `payload` to every connection whose source is
    /// `(source, port)`, in connection-insertion order.
    ///
    /// Self-loops are permitted; re-entrant emissions past the recursion
    /// ceiling are dropped with a cycle warning instead of recursing
    /// without bound.
    pub fn route_output(
        &self,
        instances: &InstanceRegistry,
        source: InstanceId,
        port: &str,
        payload: &Value,
    ) {
        let depth = self.depth.fetch_add(1, Ordering::AcqRel);
        let _guard = DepthGuard(&self.depth);
        if depth >= self.recursion_ceiling {
            warn!(
                target: "mosaic_widgets::router",
                instance = %source,
                port,
                ceiling = self.recursion_ceiling,
                "emission cycle hit recursion ceiling, dropping re-entrant emission"
            );
            return;
        }

        let source_ref = PortRef::new(source, port);
        let mut dead_targets = Vec::new();
        for connection in self.graph.connections_from(&source_ref) {
            let target = &connection.target;
            let Some(record) = instances.get(target.instance) else {
                dead_targets.push(target.instance);
                continue;
            };
            if record.phase.is_destroyed() {
                dead_targets.push(target.instance);
                continue;
            }
            if !record.phase.is_mounted() {
                debug!(
                    target: "mosaic_widgets::router",
                    instance = %target.instance,
                    port = %target.port,
                    "skip delivery to unmounted target"
                );
                continue;
            }
            if record.sandbox.manifest().input(&target.port).is_none() {
                warn!(
                    target: "mosaic_widgets::router",
                    instance = %target.instance,
                    widget_id = %record.widget_id,
                    port = %target.port,
                    "skip connection to undeclared input"
                );
                continue;
            }
            // Advisory only: a coercion mismatch is logged, delivery of the
            // raw payload still happens. Receivers validate at their input
            // handlers.
            if let Some(port_type) = record.sandbox.manifest().input_type(&target.port) {
                if let Err(err) = port_type.coerce(payload) {
                    debug!(
                        target: "mosaic_widgets::router",
                        instance = %target.instance,
                        port = %target.port,
                        "coercion mismatch, delivering raw payload: {err}"
                    );
                }
            }
            record.sandbox.deliver_input(&target.port, payload);
        }

        for instance in dead_targets {
            let pruned = self.graph.prune_instance(instance);
            if pruned > 0 {
                debug!(
                    target: "mosaic_widgets::router",
                    instance = %instance,
                    pruned,
                    "pruned connections to destroyed instance"
                );
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/router_tests.rs"]
mod tests;
