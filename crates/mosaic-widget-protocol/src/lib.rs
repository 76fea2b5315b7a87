//! Wire-level types of the widget runtime protocol.
//!
//! Everything crossing the sandbox boundary is declared here: the manifest a
//! widget registers with, the closed set of port kinds, message envelopes,
//! and broadcast events. Payloads are always JSON values; live references
//! never cross the boundary.

mod envelope;
mod event;
mod log;
mod manifest;
mod port;

pub use envelope::{Envelope, EnvelopeKind, InitPayload, OutputPayload};
pub use event::{is_reserved_namespace, BroadcastEvent, WILDCARD_EVENT};
pub use log::LogLevel;
pub use manifest::{
    Capabilities, EventsDescriptor, PortDecl, PortDeclarations, PortEntry, ScaleMode,
    SizeConstraints, SkinDescriptor, WidgetKind, WidgetManifest,
};
pub use port::{CoercionError, PortType};
