//! MCP protocol layer — the JSON-RPC engine, cancellation, capability
//! gating, and version negotiation.

pub mod abort;
pub mod engine;
pub mod negotiation;
pub mod policy;

pub use abort::{AbortController, AbortSignal};
pub use engine::{
    NotificationHandler, NotificationOptions, ProgressCallback, Protocol, ProtocolOptions,
    RequestHandler, RequestHandlerExtra, RequestOptions, DEFAULT_REQUEST_TIMEOUT,
};
pub use negotiation::negotiate_version;
pub use policy::{CapabilityPolicy, PermissivePolicy};
