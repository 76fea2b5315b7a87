use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::instance::InstanceId;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u64);

/// What an operation handler did with a request.
pub enum OperationOutcome {
    /// Resolved synchronously.
    Ready(Result<Value>),
    /// The collaborator answers later via [`RequestBroker::complete`], or
    /// the deadline rejects the request first.
    Pending,
}

/// Scoped host operations a widget may `request()`. The document store
/// (`document:create` / `document:get` / `document:update`) is one such
/// collaborator; its backend is out of scope behind this trait.
pub trait HostOperations: Send + Sync {
    fn handle(&self, operation: &str, args: &Value) -> OperationOutcome;
}

/// Handler that knows no operations; every request fails typed.
#[derive(Default)]
pub struct NoOperations;

impl HostOperations for NoOperations {
    fn handle(&self, operation: &str, _args: &Value) -> OperationOutcome {
        OperationOutcome::Ready(Err(Error::request_failure(operation, "no handler registered")))
    }
}

/// In-memory document store answering the `document:*` operations; test
/// double for the external collaborator.
#[derive(Default)]
pub struct MemoryDocumentStore {
    next_id: AtomicU64,
    documents: Mutex<HashMap<String, Value>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn document(&self, id: &str) -> Option<Value> {
        self.documents.lock().ok()?.get(id).cloned()
    }

    fn create(&self, args: &Value) -> Result<Value> {
        let id = format!("doc-{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let mut document = args.as_object().cloned().unwrap_or_default();
        document.insert("id".to_string(), Value::String(id.clone()));
        let document = Value::Object(document);
        if let Ok(mut map) = self.documents.lock() {
            map.insert(id, document.clone());
        }
        Ok(json!({ "document": document }))
    }

    fn get(&self, args: &Value) -> Result<Value> {
        let id = required_str(args, "id", "document:get")?;
        match self.document(id) {
            Some(document) => Ok(json!({ "document": document })),
            None => Err(Error::not_found("document", id)),
        }
    }

    fn update(&self, args: &Value) -> Result<Value> {
        let id = required_str(args, "id", "document:update")?.to_string();
        let patch = args.as_object().cloned().unwrap_or_default();
        let Ok(mut map) = self.documents.lock() else {
            return Err(Error::request_failure("document:update", "store unavailable"));
        };
        let Some(Value::Object(document)) = map.get_mut(&id) else {
            return Err(Error::not_found("document", id));
        };
        for (key, value) in patch {
            if key != "id" {
                document.insert(key, value);
            }
        }
        Ok(json!({ "document": Value::Object(document.clone()) }))
    }
}

fn required_str<'a>(args: &'a Value, field: &str, operation: &str) -> Result<&'a str> {
    args.get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::request_failure(operation, format!("missing `{field}`")))
}

impl HostOperations for MemoryDocumentStore {
    fn handle(&self, operation: &str, args: &Value) -> OperationOutcome {
        let result = match operation {
            "document:create" => self.create(args),
            "document:get" => self.get(args),
            "document:update" => self.update(args),
            other => Err(Error::request_failure(other, "unknown operation")),
        };
        OperationOutcome::Ready(result)
    }
}

/// Widget-side handle to a pending `request()`.
pub struct RequestTicket {
    id: RequestId,
    operation: String,
    rx: oneshot::Receiver<Result<Value>>,
}

impl RequestTicket {
    fn new(id: RequestId, operation: String, rx: oneshot::Receiver<Result<Value>>) -> Self {
        Self { id, operation, rx }
    }

    /// A ticket that already failed, for calls that never reached the host.
    pub fn failed(error: Error) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(error));
        Self::new(RequestId(0), String::new(), rx)
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Non-blocking poll. `None` while still pending; abandoned requests
    /// (owning instance destroyed) resolve to a typed failure.
    pub fn try_result(&mut self) -> Option<Result<Value>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(Error::request_failure(
                self.operation.clone(),
                "request abandoned",
            ))),
        }
    }
}

struct PendingRequest {
    instance: InstanceId,
    operation: String,
    args: Value,
    deadline: Instant,
    dispatched: bool,
    tx: oneshot::Sender<Result<Value>>,
}

/// Two-way request/response plumbing between sandboxes and host
/// collaborators. Requests either resolve, reject typed on deadline, or are
/// abandoned with their instance; none of them hang and late resolutions
/// never crash.
pub struct RequestBroker {
    next_id: AtomicU64,
    timeout: Duration,
    pending: Mutex<HashMap<RequestId, PendingRequest>>,
}

impl RequestBroker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            next_id: AtomicU64::new(0),
            timeout,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn submit(
        &self,
        instance: InstanceId,
        operation: &str,
        args: Value,
        now: Instant,
    ) -> RequestTicket {
        let id = RequestId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(
                id,
                PendingRequest {
                    instance,
                    operation: operation.to_string(),
                    args,
                    deadline: now + self.timeout,
                    dispatched: false,
                    tx,
                },
            );
        }
        RequestTicket::new(id, operation.to_string(), rx)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Hand undispatched requests to the operation handler and reject
    /// everything past its deadline.
    pub fn dispatch(&self, operations: &dyn HostOperations, now: Instant) {
        let work: Vec<(RequestId, String, Value)> = {
            let Ok(mut pending) = self.pending.lock() else {
                return;
            };
            pending
                .iter_mut()
                .filter(|(_, req)| !req.dispatched)
                .map(|(id, req)| {
                    req.dispatched = true;
                    (*id, req.operation.clone(), req.args.clone())
                })
                .collect()
        };
        for (id, operation, args) in work {
            match operations.handle(&operation, &args) {
                OperationOutcome::Ready(result) => self.complete(id, result),
                OperationOutcome::Pending => {}
            }
        }
        self.expire_due(now);
    }

    /// Reject every request whose deadline has passed with a typed timeout.
    pub fn expire_due(&self, now: Instant) {
        let expired: Vec<(RequestId, String, InstanceId)> = {
            let Ok(pending) = self.pending.lock() else {
                return;
            };
            pending
                .iter()
                .filter(|(_, req)| req.deadline <= now)
                .map(|(id, req)| (*id, req.operation.clone(), req.instance))
                .collect()
        };
        for (id, operation, instance) in expired {
            warn!(
                target: "mosaic_widgets::request",
                instance = %instance,
                operation = %operation,
                "request deadline passed"
            );
            self.complete(id, Err(Error::request_timeout(operation)));
        }
    }

    /// Resolve a pending request. Unknown ids are late resolutions for
    /// requests already timed out or abandoned; they are logged and ignored.
    pub fn complete(&self, id: RequestId, result: Result<Value>) {
        let taken = self.pending.lock().ok().and_then(|mut p| p.remove(&id));
        match taken {
            Some(req) => {
                // Receiver may be gone when the widget dropped its ticket.
                let _ = req.tx.send(result);
            }
            None => {
                debug!(
                    target: "mosaic_widgets::request",
                    request = id.0,
                    "ignoring late resolution"
                );
            }
        }
    }

    /// Abandon every pending request of a destroyed instance: the tickets
    /// close, the results are ignored.
    pub fn abandon_for_instance(&self, instance: InstanceId) -> usize {
        let Ok(mut pending) = self.pending.lock() else {
            return 0;
        };
        let before = pending.len();
        pending.retain(|_, req| req.instance != instance);
        let abandoned = before - pending.len();
        if abandoned > 0 {
            debug!(
                target: "mosaic_widgets::request",
                instance = %instance,
                abandoned,
                "abandoned pending requests"
            );
        }
        abandoned
    }
}

/// Args shape of `document:create` as widgets send it.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentPayload {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_type: Option<String>,
}

impl DocumentPayload {
    pub fn to_args(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Map::new()))
    }
}

#[cfg(test)]
#[path = "tests/request_tests.rs"]
mod tests;
