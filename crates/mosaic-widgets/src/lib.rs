//! Host runtime for sandboxed canvas widgets.
//!
//! A [`host::CanvasHost`] owns a registry of validated manifests, the
//! instances placed on its canvases, the pipeline connection graph, the
//! broadcast bridge, and the persistence adapter. Widget code only ever sees
//! a [`sandbox::RuntimeApi`]; faults inside widget callbacks are contained at
//! the sandbox boundary and never reach the router or sibling instances.

pub mod bridge;
pub mod error;
pub mod host;
pub mod instance;
pub mod manifest_registry;
pub mod persistence;
pub mod request;
pub mod router;
pub mod sandbox;
pub mod skin;

pub use error::{ContractViolationKind, Error, Result, ValidationIssue};
pub use host::{CanvasHost, ClosePolicy, HostConfig};
pub use instance::{InstanceId, LifecyclePhase};
pub use manifest_registry::{validate_manifest, ManifestRegistry, NormalizedManifest};
pub use persistence::{
    LegacyInlineListMigration, MemoryStateStore, PersistenceAdapter, StateMigration, StateStore,
};
pub use request::{
    DocumentPayload, HostOperations, MemoryDocumentStore, OperationOutcome, RequestBroker,
    RequestId, RequestTicket,
};
pub use router::{ConnectionGraph, PipelineConnection, PipelineRouter, PortRef};
pub use sandbox::{MountContext, RuntimeApi, WidgetSandbox};
