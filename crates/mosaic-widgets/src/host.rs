use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{unbounded, Receiver, Sender};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use mosaic_widget_protocol::{
    is_reserved_namespace, BroadcastEvent, Envelope, EnvelopeKind, InitPayload, OutputPayload,
    WidgetManifest,
};

use crate::bridge::CanvasBridge;
use crate::error::{ContractViolationKind, Error, Result};
use crate::instance::{InstanceId, InstanceRecord, InstanceRegistry, PhaseCell};
use crate::manifest_registry::ManifestRegistry;
use crate::persistence::{
    MemoryStateStore, PersistenceAdapter, StateStore, DEFAULT_MAX_WRITE_ATTEMPTS,
    DEFAULT_QUIET_PERIOD,
};
use crate::request::{
    HostOperations, NoOperations, RequestBroker, RequestTicket, DEFAULT_REQUEST_TIMEOUT,
};
use crate::router::{PipelineRouter, PortRef, DEFAULT_RECURSION_CEILING};
use crate::sandbox::{EventHook, HostLink, MountContext, RuntimeApi, WidgetSandbox};
use crate::skin::SKIN_APPLY_PORT;

/// Whether `request_close()` from widgets is honored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClosePolicy {
    #[default]
    Allow,
    Deny,
}

#[derive(Debug, Clone)]
pub struct HostConfig {
    pub recursion_ceiling: usize,
    pub quiet_period: Duration,
    pub max_write_attempts: u32,
    pub request_timeout: Duration,
    pub close_policy: ClosePolicy,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            recursion_ceiling: DEFAULT_RECURSION_CEILING,
            quiet_period: DEFAULT_QUIET_PERIOD,
            max_write_attempts: DEFAULT_MAX_WRITE_ATTEMPTS,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            close_policy: ClosePolicy::Allow,
        }
    }
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Everything the sandboxes reach back into: registries, router, bridge,
/// persistence, request broker. One allocation so [`RuntimeApi`] can hold a
/// weak link to the whole host.
pub struct HostCore {
    config: HostConfig,
    instances: InstanceRegistry,
    router: PipelineRouter,
    bridge: CanvasBridge,
    adapter: PersistenceAdapter,
    broker: RequestBroker,
    operations: Arc<dyn HostOperations>,
    pending_mounts: Mutex<HashSet<InstanceId>>,
}

impl HostCore {
    fn record(&self, instance: InstanceId) -> Result<InstanceRecord> {
        self.instances
            .get(instance)
            .ok_or_else(|| Error::not_found("instance", instance.to_string()))
    }

    fn complete_mount(&self, record: &InstanceRecord) {
        if !record.phase.mark_mounted() {
            debug!(
                target: "mosaic_widgets::host",
                instance = %record.id,
                "skip mount, phase already advanced"
            );
            return;
        }
        let manifest = record.sandbox.manifest();
        let context = MountContext {
            state: record.sandbox.state(),
            inputs: manifest.input_defaults(),
            canvas_id: record.canvas_id.clone(),
            widget_id: record.widget_id.clone(),
        };
        record.sandbox.fire_mount(context);
        info!(
            target: "mosaic_widgets::host",
            instance = %record.id,
            widget_id = %record.widget_id,
            canvas = %record.canvas_id,
            "mounted"
        );
    }

    /// Remove a placement: final persistence flush, guaranteed `on_destroy`
    /// delivery, then teardown of routes, subscriptions, pending requests.
    pub fn destroy_instance(&self, instance: InstanceId) -> Result<()> {
        let record = self.record(instance)?;
        if !record.phase.mark_destroyed() {
            return Ok(());
        }
        // Pending debounced writes land before on_destroy completes.
        self.adapter.flush_now(instance);
        record.sandbox.fire_destroy();
        // A set_state from inside on_destroy still counts.
        self.adapter.flush_now(instance);
        self.broker.abandon_for_instance(instance);
        self.bridge.remove_instance(instance);
        self.router.graph().prune_instance(instance);
        if let Ok(mut pending) = self.pending_mounts.lock() {
            pending.remove(&instance);
        }
        self.instances.remove(instance);
        info!(
            target: "mosaic_widgets::host",
            instance = %instance,
            widget_id = %record.widget_id,
            "destroyed"
        );
        Ok(())
    }
}

impl HostLink for HostCore {
    fn route_output(&self, instance: InstanceId, port: &str, payload: Value) {
        self.router
            .route_output(&self.instances, instance, port, &payload);
    }

    fn state_written(&self, instance: InstanceId) {
        let Some(record) = self.instances.get(instance) else {
            return;
        };
        self.adapter.note_write(
            instance,
            &record.placement_id,
            record.sandbox.state(),
            Instant::now(),
        );
    }

    fn publish_event(&self, instance: InstanceId, event_type: &str, payload: Value, cross_canvas: bool) {
        let Some(record) = self.instances.get(instance) else {
            return;
        };
        let event = BroadcastEvent::new(event_type, payload, record.canvas_id.clone(), now_unix_ms());
        if cross_canvas {
            self.bridge.publish_cross_canvas(&self.instances, &event);
        } else {
            self.bridge.publish_local(&self.instances, &event);
        }
    }

    fn subscribe_event(&self, instance: InstanceId, pattern: &str, hook: EventHook) {
        self.bridge.subscribe(instance, pattern, hook);
    }

    fn submit_request(&self, instance: InstanceId, operation: &str, args: Value) -> RequestTicket {
        self.broker.submit(instance, operation, args, Instant::now())
    }

    fn close_requested(&self, instance: InstanceId) -> Result<()> {
        match self.config.close_policy {
            ClosePolicy::Allow => self.destroy_instance(instance),
            ClosePolicy::Deny => {
                warn!(
                    target: "mosaic_widgets::host",
                    instance = %instance,
                    "close request denied by policy"
                );
                Err(Error::CloseDenied {
                    instance_id: instance,
                })
            }
        }
    }
}

/// The host: owns the manifest registry, all running instances, and the
/// single-threaded envelope queue. One `CanvasHost` per embedding; several
/// can coexist in a process since nothing here is ambient global state.
pub struct CanvasHost {
    manifests: ManifestRegistry,
    core: Arc<HostCore>,
    queue_tx: Sender<(InstanceId, Envelope)>,
    queue_rx: Receiver<(InstanceId, Envelope)>,
}

impl CanvasHost {
    pub fn new(config: HostConfig) -> Self {
        Self::with_parts(
            config,
            Box::new(MemoryStateStore::new()),
            Arc::new(NoOperations),
        )
    }

    pub fn with_parts(
        config: HostConfig,
        store: Box<dyn StateStore>,
        operations: Arc<dyn HostOperations>,
    ) -> Self {
        let adapter =
            PersistenceAdapter::new(store, config.quiet_period, config.max_write_attempts);
        Self::with_adapter(config, adapter, operations)
    }

    pub fn with_adapter(
        config: HostConfig,
        adapter: PersistenceAdapter,
        operations: Arc<dyn HostOperations>,
    ) -> Self {
        let (queue_tx, queue_rx) = unbounded();
        let core = Arc::new(HostCore {
            router: PipelineRouter::new(config.recursion_ceiling),
            broker: RequestBroker::new(config.request_timeout),
            config,
            instances: InstanceRegistry::default(),
            bridge: CanvasBridge::new(),
            adapter,
            operations,
            pending_mounts: Mutex::new(HashSet::new()),
        });
        Self {
            manifests: ManifestRegistry::new(),
            core,
            queue_tx,
            queue_rx,
        }
    }

    pub fn manifests(&self) -> &ManifestRegistry {
        &self.manifests
    }

    pub fn persistence(&self) -> &PersistenceAdapter {
        &self.core.adapter
    }

    pub fn requests(&self) -> &RequestBroker {
        &self.core.broker
    }

    // --- registration / placement --------------------------------------

    pub fn register_widget(&self, manifest: &WidgetManifest) -> Result<()> {
        self.manifests.register(manifest).map(|_| ())
    }

    /// Place a widget on a canvas. `placement_id` is the durable key the
    /// state blob is stored under; re-creating a placement with the same key
    /// restores its persisted state (or manifest defaults when absent).
    pub fn create_instance(
        &self,
        widget_id: &str,
        canvas_id: &str,
        placement_id: &str,
    ) -> Result<InstanceId> {
        let manifest = self
            .manifests
            .get(widget_id)
            .ok_or_else(|| Error::not_found("manifest", widget_id))?;
        let id = self.core.instances.allocate_id();
        let sandbox = Arc::new(WidgetSandbox::new(id, Arc::clone(&manifest)));
        sandbox.seed_state(self.core.adapter.load_state(placement_id, &manifest));
        sandbox.set_init_payload(InitPayload {
            canvas_id: canvas_id.to_string(),
            widget_id: widget_id.to_string(),
            config: Value::Null,
        });
        self.core.instances.register(InstanceRecord {
            id,
            widget_id: widget_id.to_string(),
            canvas_id: canvas_id.to_string(),
            placement_id: placement_id.to_string(),
            phase: Arc::new(PhaseCell::default()),
            sandbox,
        });
        debug!(
            target: "mosaic_widgets::host",
            instance = %id,
            widget_id,
            canvas = canvas_id,
            "created instance"
        );
        Ok(id)
    }

    /// Runtime API handle for an instance; what in-process widget code is
    /// given and all it is given.
    pub fn api(&self, instance: InstanceId) -> Result<RuntimeApi> {
        let record = self.core.record(instance)?;
        let link: Arc<dyn HostLink> = Arc::clone(&self.core) as Arc<dyn HostLink>;
        Ok(RuntimeApi::new(record.sandbox, Arc::downgrade(&link)))
    }

    /// Run in-process widget setup and confirm sandbox readiness. The setup
    /// callback registers hooks through the passed API; a panic in it is
    /// contained like any other sandbox fault.
    pub fn attach_widget<F>(&self, instance: InstanceId, setup: F) -> Result<()>
    where
        F: FnOnce(&RuntimeApi),
    {
        let record = self.core.record(instance)?;
        let api = self.api(instance)?;
        record.sandbox.run_guarded("widget setup", || setup(&api));
        record.sandbox.mark_ready();
        let pending = self
            .core
            .pending_mounts
            .lock()
            .map(|mut p| p.remove(&instance))
            .unwrap_or(false);
        if pending {
            self.core.complete_mount(&record);
        }
        Ok(())
    }

    /// Mount an instance. Fires `on_mount` exactly once when the sandbox has
    /// confirmed readiness; otherwise sends `widget:init` and defers until
    /// `widget:ready` arrives.
    pub fn mount(&self, instance: InstanceId) -> Result<()> {
        let record = self.core.record(instance)?;
        if record.sandbox.is_ready() {
            self.core.complete_mount(&record);
            return Ok(());
        }
        if let Some(init) = record.sandbox.init_payload() {
            record.sandbox.push_outbound(Envelope::new(
                EnvelopeKind::WidgetInit,
                serde_json::to_value(init)?,
            ));
        }
        if let Ok(mut pending) = self.core.pending_mounts.lock() {
            pending.insert(instance);
        }
        Ok(())
    }

    pub fn destroy_instance(&self, instance: InstanceId) -> Result<()> {
        self.core.destroy_instance(instance)
    }

    // --- pipeline graph editing ----------------------------------------

    /// Connect a declared output port to a declared input port. Undeclared
    /// ports are contract violations and never enter the graph.
    pub fn connect(
        &self,
        source: InstanceId,
        source_port: &str,
        target: InstanceId,
        target_port: &str,
    ) -> Result<bool> {
        let source_record = self.core.record(source)?;
        let target_record = self.core.record(target)?;
        if source_record.sandbox.manifest().output(source_port).is_none() {
            return Err(Error::contract_violation(
                source_record.widget_id,
                source_port,
                ContractViolationKind::EmitUndeclaredOutput,
            ));
        }
        if target_record.sandbox.manifest().input(target_port).is_none() {
            return Err(Error::contract_violation(
                target_record.widget_id,
                target_port,
                ContractViolationKind::SubscribeUndeclaredInput,
            ));
        }
        Ok(self.core.router.graph().connect(
            PortRef::new(source, source_port),
            PortRef::new(target, target_port),
        ))
    }

    pub fn disconnect(
        &self,
        source: InstanceId,
        source_port: &str,
        target: InstanceId,
        target_port: &str,
    ) -> bool {
        self.core.router.graph().disconnect(
            &PortRef::new(source, source_port),
            &PortRef::new(target, target_port),
        )
    }

    /// Current connection set, in insertion order.
    pub fn connections(&self) -> Vec<crate::router::PipelineConnection> {
        self.core.router.graph().snapshot().as_ref().clone()
    }

    // --- envelopes -------------------------------------------------------

    /// Queue an envelope for an instance. Processing happens in [`Self::pump`],
    /// strictly in arrival order, each message run to completion.
    pub fn deliver_envelope(&self, instance: InstanceId, envelope: Envelope) {
        let _ = self.queue_tx.send((instance, envelope));
    }

    /// Drain the envelope queue, dispatch pending requests, expire overdue
    /// ones, and flush due persistence writes.
    pub fn pump(&self) {
        while let Ok((instance, envelope)) = self.queue_rx.try_recv() {
            self.process_envelope(instance, envelope);
        }
        let now = Instant::now();
        self.core.broker.dispatch(self.core.operations.as_ref(), now);
        self.core.adapter.flush_due(now);
    }

    fn process_envelope(&self, instance: InstanceId, envelope: Envelope) {
        let Ok(record) = self.core.record(instance) else {
            debug!(
                target: "mosaic_widgets::host",
                instance = %instance,
                kind = %envelope.kind.label(),
                "drop envelope for unknown instance"
            );
            return;
        };
        match envelope.kind.clone() {
            EnvelopeKind::WidgetReady => {
                record.sandbox.mark_ready();
                let pending = self
                    .core
                    .pending_mounts
                    .lock()
                    .map(|mut p| p.remove(&instance))
                    .unwrap_or(false);
                if pending {
                    self.core.complete_mount(&record);
                }
            }
            EnvelopeKind::WidgetRequestInit => {
                // Idempotent re-send of the init context; no state reset.
                // Carries the latest applied config, not the one captured at
                // creation.
                if let Some(mut init) = record.sandbox.init_payload() {
                    let config = record.sandbox.config();
                    if !config.is_null() {
                        init.config = config;
                    }
                    if let Ok(payload) = serde_json::to_value(init) {
                        record
                            .sandbox
                            .push_outbound(Envelope::new(EnvelopeKind::WidgetInit, payload));
                    }
                }
            }
            EnvelopeKind::WidgetConfig => {
                record.sandbox.set_config(envelope.payload.clone());
                record.sandbox.push_outbound(envelope);
            }
            EnvelopeKind::WidgetReset => {
                record.sandbox.clear_transient();
                record.sandbox.push_outbound(envelope);
            }
            EnvelopeKind::WidgetOutput => {
                match serde_json::from_value::<OutputPayload>(envelope.payload) {
                    Ok(output) => {
                        if record.sandbox.manifest().output(&output.output_id).is_none() {
                            let violation = Error::contract_violation(
                                record.widget_id.clone(),
                                output.output_id,
                                ContractViolationKind::EmitUndeclaredOutput,
                            );
                            warn!(
                                target: "mosaic_widgets::host",
                                instance = %instance,
                                "{violation}"
                            );
                        } else {
                            self.core.route_output(instance, &output.output_id, output.data);
                        }
                    }
                    Err(err) => {
                        warn!(
                            target: "mosaic_widgets::host",
                            instance = %instance,
                            "malformed widget:output payload: {err}"
                        );
                    }
                }
            }
            EnvelopeKind::Input(port) => {
                if port == SKIN_APPLY_PORT {
                    if let Value::Object(overrides) = &envelope.payload {
                        record.sandbox.apply_skin(overrides);
                    } else {
                        warn!(
                            target: "mosaic_widgets::host",
                            instance = %instance,
                            "skin.apply payload must be a flat object"
                        );
                    }
                    return;
                }
                if !record.phase.is_mounted() {
                    debug!(
                        target: "mosaic_widgets::host",
                        instance = %instance,
                        port,
                        "skip input delivery to unmounted instance"
                    );
                    return;
                }
                if record.sandbox.manifest().input(&port).is_none() {
                    warn!(
                        target: "mosaic_widgets::host",
                        instance = %instance,
                        widget_id = %record.widget_id,
                        port,
                        "drop delivery to undeclared input"
                    );
                    return;
                }
                record.sandbox.deliver_input(&port, &envelope.payload);
            }
            EnvelopeKind::Event(name) => {
                // The envelope form is subject to the same reserved-namespace
                // rule as in-process emit.
                if is_reserved_namespace(&name) {
                    let violation = Error::contract_violation(
                        record.widget_id.clone(),
                        name,
                        ContractViolationKind::ReservedEventNamespace,
                    );
                    warn!(
                        target: "mosaic_widgets::host",
                        instance = %instance,
                        "{violation}"
                    );
                    return;
                }
                self.core
                    .publish_event(instance, &name, envelope.payload, false);
            }
            EnvelopeKind::WidgetInit => {
                debug!(
                    target: "mosaic_widgets::host",
                    instance = %instance,
                    "widget:init is host-to-widget only, ignoring"
                );
            }
        }
    }

    // --- state -----------------------------------------------------------

    /// Host-driven state replacement (restore, collaborative sync). Fires
    /// the instance's `on_state_change` hooks and persists immediately.
    pub fn restore_state(&self, instance: InstanceId, blob: Map<String, Value>) -> Result<()> {
        let record = self.core.record(instance)?;
        record.sandbox.replace_state(blob);
        self.core.adapter.note_write(
            instance,
            &record.placement_id,
            record.sandbox.state(),
            Instant::now(),
        );
        self.core.adapter.flush_now(instance);
        Ok(())
    }

    // --- introspection ---------------------------------------------------

    pub fn instances_on_canvas(&self, canvas_id: &str) -> Vec<InstanceId> {
        self.core.instances.ids_for_canvas(canvas_id)
    }

    pub fn active_widget_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .core
            .instances
            .all_ids()
            .into_iter()
            .filter_map(|id| self.core.instances.get(id))
            .filter(|r| r.phase.is_mounted())
            .map(|r| r.widget_id)
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Host-to-widget envelopes queued on an instance's channel; what an
    /// out-of-process widget would drain from its end of the boundary.
    pub fn drain_outbound(&self, instance: InstanceId) -> Vec<Envelope> {
        self.core
            .instances
            .get(instance)
            .map(|r| r.sandbox.drain_outbound())
            .unwrap_or_default()
    }

    pub fn skin_vars(&self, instance: InstanceId) -> Map<String, Value> {
        self.core
            .instances
            .get(instance)
            .map(|r| r.sandbox.skin_vars())
            .unwrap_or_default()
    }

    /// Flush everything and drop all instances. The explicit counterpart of
    /// construction, so embedders control the full lifecycle.
    pub fn teardown(&self) {
        for id in self.core.instances.all_ids() {
            let _ = self.core.destroy_instance(id);
        }
    }
}

impl Drop for CanvasHost {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
#[path = "tests/host_tests.rs"]
mod tests;
