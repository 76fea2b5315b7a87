use std::sync::{Arc, Mutex};

use serde_json::{json, Value};

use mosaic_widget_protocol::{PortType, WidgetKind, WidgetManifest};

use super::{ConnectionGraph, PipelineRouter, PortRef};
use crate::instance::{InstanceId, InstanceRecord, InstanceRegistry, PhaseCell};
use crate::manifest_registry::validate_manifest;
use crate::sandbox::WidgetSandbox;

fn relay_record(registry: &InstanceRegistry) -> InstanceRecord {
    let manifest = WidgetManifest::new("relay", "1.0.0", WidgetKind::Display)
        .with_input("in", PortType::Any)
        .with_output("out", PortType::Any);
    let normalized = Arc::new(validate_manifest(&manifest).expect("valid"));
    let id = registry.allocate_id();
    let record = InstanceRecord {
        id,
        widget_id: "relay".to_string(),
        canvas_id: "canvas-a".to_string(),
        placement_id: format!("canvas-a/relay/{}", id.0),
        phase: Arc::new(PhaseCell::default()),
        sandbox: Arc::new(WidgetSandbox::new(id, normalized)),
    };
    record.phase.mark_mounted();
    registry.register(record.clone());
    record
}

fn collect_inputs(record: &InstanceRecord) -> Arc<Mutex<Vec<Value>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = Arc::clone(&seen);
    record.sandbox.register_input_hook(
        "in",
        Arc::new(move |payload| {
            s.lock().unwrap().push(payload.clone());
        }),
    );
    seen
}

#[test]
fn graph_preserves_insertion_order_and_dedupes() {
    let graph = ConnectionGraph::new();
    let a = PortRef::new(InstanceId(1), "out");
    let b = PortRef::new(InstanceId(2), "in");
    let c = PortRef::new(InstanceId(3), "in");
    assert!(graph.connect(a.clone(), b.clone()));
    assert!(graph.connect(a.clone(), c.clone()));
    assert!(!graph.connect(a.clone(), b.clone()));
    let from_a = graph.connections_from(&a);
    assert_eq!(from_a.len(), 2);
    assert_eq!(from_a[0].target, b);
    assert_eq!(from_a[1].target, c);
    assert!(graph.disconnect(&a, &b));
    assert!(!graph.disconnect(&a, &b));
    assert_eq!(graph.connections_from(&a).len(), 1);
}

#[test]
fn emission_fans_out_in_connection_insertion_order() {
    let registry = InstanceRegistry::default();
    let source = relay_record(&registry);
    let first = relay_record(&registry);
    let second = relay_record(&registry);
    let order = Arc::new(Mutex::new(Vec::new()));
    for (tag, record) in [("first", &first), ("second", &second)] {
        let order = Arc::clone(&order);
        record.sandbox.register_input_hook(
            "in",
            Arc::new(move |_payload| {
                order.lock().unwrap().push(tag);
            }),
        );
    }

    let router = PipelineRouter::new(10);
    router
        .graph()
        .connect(PortRef::new(source.id, "out"), PortRef::new(first.id, "in"));
    router
        .graph()
        .connect(PortRef::new(source.id, "out"), PortRef::new(second.id, "in"));
    router.route_output(&registry, source.id, "out", &json!("ping"));
    assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
}

#[test]
fn fan_in_from_one_emission_delivers_once_per_connection() {
    let registry = InstanceRegistry::default();
    let source = relay_record(&registry);
    let target = relay_record(&registry);
    let seen = collect_inputs(&target);

    let router = PipelineRouter::new(10);
    router
        .graph()
        .connect(PortRef::new(source.id, "out"), PortRef::new(target.id, "in"));
    router.route_output(&registry, source.id, "out", &json!(1));
    router.route_output(&registry, source.id, "out", &json!(2));
    assert_eq!(*seen.lock().unwrap(), vec![json!(1), json!(2)]);
}

#[test]
fn destroyed_target_is_skipped_and_pruned_lazily() {
    let registry = InstanceRegistry::default();
    let source = relay_record(&registry);
    let target = relay_record(&registry);
    let seen = collect_inputs(&target);

    let router = PipelineRouter::new(10);
    router
        .graph()
        .connect(PortRef::new(source.id, "out"), PortRef::new(target.id, "in"));
    target.phase.mark_destroyed();
    router.route_output(&registry, source.id, "out", &json!("late"));
    assert!(seen.lock().unwrap().is_empty());
    assert!(router
        .graph()
        .connections_from(&PortRef::new(source.id, "out"))
        .is_empty());
}

#[test]
fn unmounted_target_is_skipped_but_keeps_its_connection() {
    let registry = InstanceRegistry::default();
    let source = relay_record(&registry);
    let manifest = WidgetManifest::new("late-riser", "1.0.0", WidgetKind::Display)
        .with_input("in", PortType::Any);
    let normalized = Arc::new(validate_manifest(&manifest).expect("valid"));
    let id = registry.allocate_id();
    let target = InstanceRecord {
        id,
        widget_id: "late-riser".to_string(),
        canvas_id: "canvas-a".to_string(),
        placement_id: "canvas-a/late-riser/1".to_string(),
        phase: Arc::new(PhaseCell::default()),
        sandbox: Arc::new(WidgetSandbox::new(id, normalized)),
    };
    registry.register(target.clone());
    let seen = collect_inputs(&target);

    let router = PipelineRouter::new(10);
    router
        .graph()
        .connect(PortRef::new(source.id, "out"), PortRef::new(target.id, "in"));
    router.route_output(&registry, source.id, "out", &json!("early"));
    assert!(seen.lock().unwrap().is_empty());

    target.phase.mark_mounted();
    router.route_output(&registry, source.id, "out", &json!("now"));
    assert_eq!(*seen.lock().unwrap(), vec![json!("now")]);
}

#[test]
fn self_loop_stops_at_the_recursion_ceiling() {
    let registry = Arc::new(InstanceRegistry::default());
    let looper = relay_record(&registry);
    let router = Arc::new(PipelineRouter::new(4));
    router
        .graph()
        .connect(PortRef::new(looper.id, "out"), PortRef::new(looper.id, "in"));

    let count = Arc::new(Mutex::new(0usize));
    let c = Arc::clone(&count);
    let re_router = Arc::clone(&router);
    let re_registry = Arc::clone(&registry);
    let id = looper.id;
    looper.sandbox.register_input_hook(
        "in",
        Arc::new(move |payload| {
            *c.lock().unwrap() += 1;
            re_router.route_output(&re_registry, id, "out", payload);
        }),
    );

    router.route_output(&registry, looper.id, "out", &json!("spin"));
    // Depth 0 is the initial emission; re-entrant emissions past the
    // ceiling are dropped, no stack overflow, no hang.
    assert_eq!(*count.lock().unwrap(), 4);
}

#[test]
fn coercion_mismatch_still_delivers_raw_payload() {
    let registry = InstanceRegistry::default();
    let source = relay_record(&registry);
    let manifest = WidgetManifest::new("strict", "1.0.0", WidgetKind::Display)
        .with_input("in", PortType::Number);
    let normalized = Arc::new(validate_manifest(&manifest).expect("valid"));
    let id = registry.allocate_id();
    let target = InstanceRecord {
        id,
        widget_id: "strict".to_string(),
        canvas_id: "canvas-a".to_string(),
        placement_id: "canvas-a/strict/1".to_string(),
        phase: Arc::new(PhaseCell::default()),
        sandbox: Arc::new(WidgetSandbox::new(id, normalized)),
    };
    target.phase.mark_mounted();
    registry.register(target.clone());
    let seen = collect_inputs(&target);

    let router = PipelineRouter::new(10);
    router
        .graph()
        .connect(PortRef::new(source.id, "out"), PortRef::new(target.id, "in"));
    router.route_output(&registry, source.id, "out", &json!({"not": "a number"}));
    assert_eq!(*seen.lock().unwrap(), vec![json!({"not": "a number"})]);
}
