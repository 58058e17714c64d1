//! Session tracking for the SSE transport.

pub mod registry;

pub use registry::{Session, SessionRegistry};
