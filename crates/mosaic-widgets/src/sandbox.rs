use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde_json::{Map, Value};
use tracing::{debug, warn};

use mosaic_widget_protocol::{
    is_reserved_namespace, BroadcastEvent, Envelope, InitPayload, LogLevel,
};

use crate::error::{ContractViolationKind, Error, Result};
use crate::instance::InstanceId;
use crate::manifest_registry::NormalizedManifest;
use crate::request::RequestTicket;
use crate::skin;

pub type InputHook = Arc<dyn Fn(&Value) + Send + Sync>;
pub type MountHook = Arc<dyn Fn(&MountContext) + Send + Sync>;
pub type StateChangeHook = Arc<dyn Fn(&Map<String, Value>) + Send + Sync>;
pub type EventHook = Arc<dyn Fn(&BroadcastEvent) + Send + Sync>;
pub type DestroyHook = Arc<dyn Fn() + Send + Sync>;

/// Context handed to `on_mount` hooks: prior persisted state, statically
/// bound input values, and the instance's placement identity.
#[derive(Debug, Clone)]
pub struct MountContext {
    pub state: Map<String, Value>,
    pub inputs: Map<String, Value>,
    pub canvas_id: String,
    pub widget_id: String,
}

/// Host-side services a sandbox reaches through its runtime API.
///
/// Held weakly by [`RuntimeApi`]: once the host is torn down every call
/// becomes a logged no-op, which is also how late effects from destroyed
/// hosts are absorbed.
pub trait HostLink: Send + Sync {
    fn route_output(&self, instance: InstanceId, port: &str, payload: Value);
    fn state_written(&self, instance: InstanceId);
    fn publish_event(&self, instance: InstanceId, event_type: &str, payload: Value, cross_canvas: bool);
    fn subscribe_event(&self, instance: InstanceId, pattern: &str, hook: EventHook);
    fn submit_request(&self, instance: InstanceId, operation: &str, args: Value) -> RequestTicket;
    fn close_requested(&self, instance: InstanceId) -> Result<()>;
}

/// The isolation unit hosting one running widget.
///
/// Owns the private state blob, the registered hooks, and the outbound
/// envelope channel to (conceptual) widget code living outside the process.
/// Every hook invocation crosses [`WidgetSandbox::run_guarded`], so a
/// panicking callback is contained here and never reaches the router, the
/// bridge, or sibling instances.
pub struct WidgetSandbox {
    instance_id: InstanceId,
    manifest: Arc<NormalizedManifest>,
    state: Mutex<Map<String, Value>>,
    skin_vars: Mutex<Map<String, Value>>,
    latest_config: Mutex<Value>,
    init_payload: Mutex<Option<InitPayload>>,
    outbound: Mutex<Vec<Envelope>>,

    ready: AtomicBool,
    mount_fired: AtomicBool,
    mount_context: Mutex<Option<MountContext>>,
    mount_hooks: Mutex<Vec<MountHook>>,
    input_hooks: Mutex<Vec<(String, InputHook)>>,
    state_change_hooks: Mutex<Vec<StateChangeHook>>,
    destroy_hooks: Mutex<Vec<DestroyHook>>,
    /// Set by the bridge while delivering a foreign (cross-canvas) event, so
    /// an unchanged re-broadcast of the same event can be suppressed.
    foreign_event: Mutex<Option<(String, Value)>>,
}

impl WidgetSandbox {
    pub fn new(instance_id: InstanceId, manifest: Arc<NormalizedManifest>) -> Self {
        Self {
            instance_id,
            manifest,
            state: Mutex::new(Map::new()),
            skin_vars: Mutex::new(Map::new()),
            latest_config: Mutex::new(Value::Null),
            init_payload: Mutex::new(None),
            outbound: Mutex::new(Vec::new()),
            ready: AtomicBool::new(false),
            mount_fired: AtomicBool::new(false),
            mount_context: Mutex::new(None),
            mount_hooks: Mutex::new(Vec::new()),
            input_hooks: Mutex::new(Vec::new()),
            state_change_hooks: Mutex::new(Vec::new()),
            destroy_hooks: Mutex::new(Vec::new()),
            foreign_event: Mutex::new(None),
        }
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    pub fn manifest(&self) -> &Arc<NormalizedManifest> {
        &self.manifest
    }

    pub fn widget_id(&self) -> &str {
        self.manifest.id()
    }

    // --- readiness / mount ---------------------------------------------

    pub fn mark_ready(&self) -> bool {
        !self.ready.swap(true, Ordering::AcqRel)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn set_init_payload(&self, payload: InitPayload) {
        if let Ok(mut slot) = self.init_payload.lock() {
            *slot = Some(payload);
        }
    }

    pub fn init_payload(&self) -> Option<InitPayload> {
        self.init_payload.lock().ok().and_then(|slot| slot.clone())
    }

    /// Fire `on_mount` hooks exactly once. Hooks registered later are
    /// invoked immediately from the stored context.
    pub fn fire_mount(&self, context: MountContext) {
        if self.mount_fired.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Ok(mut slot) = self.mount_context.lock() {
            *slot = Some(context.clone());
        }
        let hooks = self
            .mount_hooks
            .lock()
            .map(|h| h.clone())
            .unwrap_or_default();
        for hook in hooks {
            self.run_guarded("on_mount", || hook(&context));
        }
    }

    pub fn register_mount_hook(&self, hook: MountHook) {
        if self.mount_fired.load(Ordering::Acquire) {
            let context = self.mount_context.lock().ok().and_then(|s| s.clone());
            if let Some(context) = context {
                self.run_guarded("on_mount", || hook(&context));
            }
            return;
        }
        if let Ok(mut hooks) = self.mount_hooks.lock() {
            hooks.push(hook);
        }
    }

    // --- input subscriptions -------------------------------------------

    /// Subscribe to a declared input port. Undeclared ports are ignored and
    /// logged; re-registering the same hook on the same port is a no-op, so
    /// duplicate subscription never duplicates delivery.
    pub fn register_input_hook(&self, port: &str, hook: InputHook) {
        if self.manifest.input(port).is_none() {
            warn!(
                target: "mosaic_widgets::sandbox",
                instance = %self.instance_id,
                widget_id = %self.widget_id(),
                port,
                "ignore subscription on undeclared input"
            );
            return;
        }
        let Ok(mut hooks) = self.input_hooks.lock() else {
            return;
        };
        let duplicate = hooks
            .iter()
            .any(|(p, h)| p == port && Arc::ptr_eq(h, &hook));
        if duplicate {
            debug!(
                target: "mosaic_widgets::sandbox",
                instance = %self.instance_id,
                port,
                "skip duplicate input subscription"
            );
            return;
        }
        hooks.push((port.to_string(), hook));
    }

    /// Deliver a payload to every subscriber of `port`, in subscription
    /// order. A faulting subscriber does not block the others.
    pub fn deliver_input(&self, port: &str, payload: &Value) -> usize {
        let hooks: Vec<InputHook> = {
            let Ok(all) = self.input_hooks.lock() else {
                return 0;
            };
            all.iter()
                .filter(|(p, _)| p == port)
                .map(|(_, h)| Arc::clone(h))
                .collect()
        };
        let mut delivered = 0;
        for hook in hooks {
            if self.run_guarded("on_input", || hook(payload)) {
                delivered += 1;
            }
        }
        delivered
    }

    // --- state ----------------------------------------------------------

    pub fn state(&self) -> Map<String, Value> {
        self.state.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Shallow-merge `partial` into the private state blob, synchronously:
    /// a `state()` read in the same turn reflects the merge.
    pub fn merge_state(&self, partial: Map<String, Value>) {
        if let Ok(mut state) = self.state.lock() {
            for (key, value) in partial {
                state.insert(key, value);
            }
        }
    }

    /// Host-driven replacement (restore, collaborative sync). Fires
    /// `on_state_change`, which a widget's own `set_state` never does.
    pub fn replace_state(&self, blob: Map<String, Value>) {
        if let Ok(mut state) = self.state.lock() {
            *state = blob;
        }
        let snapshot = self.state();
        let hooks = self
            .state_change_hooks
            .lock()
            .map(|h| h.clone())
            .unwrap_or_default();
        for hook in hooks {
            self.run_guarded("on_state_change", || hook(&snapshot));
        }
    }

    /// Seed state at creation without notifying anyone.
    pub fn seed_state(&self, blob: Map<String, Value>) {
        if let Ok(mut state) = self.state.lock() {
            *state = blob;
        }
    }

    pub fn register_state_change_hook(&self, hook: StateChangeHook) {
        if let Ok(mut hooks) = self.state_change_hooks.lock() {
            hooks.push(hook);
        }
    }

    // --- destroy --------------------------------------------------------

    pub fn register_destroy_hook(&self, hook: DestroyHook) {
        if let Ok(mut hooks) = self.destroy_hooks.lock() {
            hooks.push(hook);
        }
    }

    /// Run `on_destroy` hooks; delivery is guaranteed before teardown
    /// completes.
    pub fn fire_destroy(&self) {
        let hooks = self
            .destroy_hooks
            .lock()
            .map(|h| h.clone())
            .unwrap_or_default();
        for hook in hooks {
            self.run_guarded("on_destroy", || hook());
        }
    }

    // --- config / skin / outbound --------------------------------------

    pub fn set_config(&self, config: Value) {
        if let Ok(mut slot) = self.latest_config.lock() {
            *slot = config;
        }
    }

    pub fn config(&self) -> Value {
        self.latest_config
            .lock()
            .map(|c| c.clone())
            .unwrap_or(Value::Null)
    }

    /// Apply a `skin.apply` override map onto the instance's style scope,
    /// prefixing non-namespaced keys first.
    pub fn apply_skin(&self, overrides: &Map<String, Value>) {
        let prefixed = skin::prefix_overrides(overrides);
        if let Ok(mut vars) = self.skin_vars.lock() {
            for (key, value) in prefixed {
                vars.insert(key, value);
            }
        }
    }

    pub fn skin_vars(&self) -> Map<String, Value> {
        self.skin_vars.lock().map(|v| v.clone()).unwrap_or_default()
    }

    /// Clear transient UI scope (`widget:reset`). Persisted state survives.
    pub fn clear_transient(&self) {
        if let Ok(mut vars) = self.skin_vars.lock() {
            vars.clear();
        }
    }

    pub fn push_outbound(&self, envelope: Envelope) {
        if let Ok(mut queue) = self.outbound.lock() {
            queue.push(envelope);
        }
    }

    pub fn drain_outbound(&self) -> Vec<Envelope> {
        self.outbound
            .lock()
            .map(|mut q| std::mem::take(&mut *q))
            .unwrap_or_default()
    }

    // --- cross-canvas feedback guard -----------------------------------

    pub fn enter_foreign_delivery(&self, event: &BroadcastEvent) {
        if let Ok(mut slot) = self.foreign_event.lock() {
            *slot = Some((event.event_type.clone(), event.payload.clone()));
        }
    }

    pub fn leave_foreign_delivery(&self) {
        if let Ok(mut slot) = self.foreign_event.lock() {
            *slot = None;
        }
    }

    /// True when re-broadcasting `event_type`/`payload` would bounce the
    /// foreign event currently being delivered back unchanged.
    pub fn would_echo_foreign(&self, event_type: &str, payload: &Value) -> bool {
        let Ok(slot) = self.foreign_event.lock() else {
            return false;
        };
        slot.as_ref()
            .map(|(t, p)| t == event_type && p == payload)
            .unwrap_or(false)
    }

    // --- fault containment ---------------------------------------------

    /// Invoke a widget callback behind the isolation boundary. A panic is
    /// logged as a sandbox fault attributed to this instance and swallowed.
    pub fn run_guarded<F: FnOnce()>(&self, context: &'static str, f: F) -> bool {
        match catch_unwind(AssertUnwindSafe(f)) {
            Ok(()) => true,
            Err(_) => {
                let fault = Error::sandbox_fault(self.instance_id, context);
                warn!(
                    target: "mosaic_widgets::sandbox",
                    instance = %self.instance_id,
                    widget_id = %self.widget_id(),
                    "{fault}"
                );
                false
            }
        }
    }
}

/// The capability set handed to widget code: everything a sandboxed widget
/// may do, and nothing else.
#[derive(Clone)]
pub struct RuntimeApi {
    sandbox: Arc<WidgetSandbox>,
    link: Weak<dyn HostLink>,
}

impl RuntimeApi {
    pub fn new(sandbox: Arc<WidgetSandbox>, link: Weak<dyn HostLink>) -> Self {
        Self { sandbox, link }
    }

    fn with_link<T>(&self, op: &'static str, f: impl FnOnce(Arc<dyn HostLink>) -> T) -> Option<T> {
        match self.link.upgrade() {
            Some(link) => Some(f(link)),
            None => {
                debug!(
                    target: "mosaic_widgets::sandbox",
                    instance = %self.sandbox.instance_id,
                    op,
                    "host gone, dropping call"
                );
                None
            }
        }
    }

    pub fn widget_id(&self) -> &str {
        self.sandbox.widget_id()
    }

    pub fn on_mount<F>(&self, hook: F)
    where
        F: Fn(&MountContext) + Send + Sync + 'static,
    {
        self.sandbox.register_mount_hook(Arc::new(hook));
    }

    pub fn on_input<F>(&self, port: &str, hook: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.sandbox.register_input_hook(port, Arc::new(hook));
    }

    /// Arc form for callers that keep the hook around; this is what makes
    /// re-subscription idempotent.
    pub fn on_input_shared(&self, port: &str, hook: InputHook) {
        self.sandbox.register_input_hook(port, hook);
    }

    /// Hand a payload to the pipeline router. Non-blocking, no ack.
    /// Emitting an undeclared port is a contract violation: rejected and
    /// logged, the instance keeps running.
    pub fn emit_output(&self, port: &str, payload: Value) {
        if self.sandbox.manifest.output(port).is_none() {
            let violation = Error::contract_violation(
                self.sandbox.widget_id(),
                port,
                ContractViolationKind::EmitUndeclaredOutput,
            );
            warn!(
                target: "mosaic_widgets::sandbox",
                instance = %self.sandbox.instance_id,
                "{violation}"
            );
            return;
        }
        self.with_link("emit_output", |link| {
            link.route_output(self.sandbox.instance_id, port, payload);
        });
    }

    /// Shallow-merge into persisted state; the in-memory copy is updated
    /// synchronously, the durable write is debounced by the host.
    pub fn set_state(&self, partial: Map<String, Value>) {
        self.sandbox.merge_state(partial);
        self.with_link("set_state", |link| {
            link.state_written(self.sandbox.instance_id);
        });
    }

    pub fn state(&self) -> Map<String, Value> {
        self.sandbox.state()
    }

    pub fn on_state_change<F>(&self, hook: F)
    where
        F: Fn(&Map<String, Value>) + Send + Sync + 'static,
    {
        self.sandbox.register_state_change_hook(Arc::new(hook));
    }

    pub fn on_destroy<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.sandbox.register_destroy_hook(Arc::new(hook));
    }

    /// Subscribe on the broadcast bus, canvas-scoped by default. The `*`
    /// pattern matches every non-reserved type.
    pub fn on<F>(&self, pattern: &str, hook: F)
    where
        F: Fn(&BroadcastEvent) + Send + Sync + 'static,
    {
        self.with_link("on", |link| {
            link.subscribe_event(self.sandbox.instance_id, pattern, Arc::new(hook));
        });
    }

    /// Publish on the broadcast bus, scoped to this instance's canvas.
    pub fn emit(&self, event_type: &str, payload: Value) {
        self.emit_scoped(event_type, payload, false);
    }

    /// Publish on the explicit cross-canvas channel.
    pub fn emit_cross_canvas(&self, event_type: &str, payload: Value) {
        self.emit_scoped(event_type, payload, true);
    }

    fn emit_scoped(&self, event_type: &str, payload: Value, cross_canvas: bool) {
        if is_reserved_namespace(event_type) {
            let violation = Error::contract_violation(
                self.sandbox.widget_id(),
                event_type,
                ContractViolationKind::ReservedEventNamespace,
            );
            warn!(
                target: "mosaic_widgets::sandbox",
                instance = %self.sandbox.instance_id,
                "{violation}"
            );
            return;
        }
        if cross_canvas && self.sandbox.would_echo_foreign(event_type, &payload) {
            warn!(
                target: "mosaic_widgets::sandbox",
                instance = %self.sandbox.instance_id,
                event_type,
                "suppress unchanged re-broadcast of foreign event"
            );
            return;
        }
        self.with_link("emit", |link| {
            link.publish_event(self.sandbox.instance_id, event_type, payload, cross_canvas);
        });
    }

    /// The only two-way call shape. Resolves through the host's operation
    /// broker; rejects with a typed timeout error rather than hang.
    pub fn request(&self, operation: &str, args: Value) -> RequestTicket {
        match self.with_link("request", |link| {
            link.submit_request(self.sandbox.instance_id, operation, args)
        }) {
            Some(ticket) => ticket,
            None => RequestTicket::failed(Error::request_failure(operation, "host gone")),
        }
    }

    /// Ask the host to remove this instance. The host decides synchronously;
    /// the widget never self-destroys.
    pub fn request_close(&self) -> Result<()> {
        match self.with_link("request_close", |link| {
            link.close_requested(self.sandbox.instance_id)
        }) {
            Some(result) => result,
            None => Ok(()),
        }
    }

    /// Forward to host-side diagnostics. Never fails.
    pub fn log(&self, level: LogLevel, message: &str) {
        let instance = self.sandbox.instance_id;
        let widget_id = self.sandbox.widget_id();
        match level {
            LogLevel::Error => tracing::error!(target: "mosaic_widgets::widget", %instance, widget_id, "{message}"),
            LogLevel::Warn => tracing::warn!(target: "mosaic_widgets::widget", %instance, widget_id, "{message}"),
            LogLevel::Info => tracing::info!(target: "mosaic_widgets::widget", %instance, widget_id, "{message}"),
            LogLevel::Debug => tracing::debug!(target: "mosaic_widgets::widget", %instance, widget_id, "{message}"),
            LogLevel::Trace => tracing::trace!(target: "mosaic_widgets::widget", %instance, widget_id, "{message}"),
        }
    }
}

#[cfg(test)]
#[path = "tests/sandbox_tests.rs"]
mod tests;
