//! Monologue MCP Server — an MCP protocol engine with an SSE transport,
//! serving an LLM-backed "Pragmatic vs Creative" monologue tool.
//!
//! The library layers, bottom up: JSON-RPC message types ([`types`]), the
//! transport abstraction ([`transport`]), the request/response engine
//! ([`protocol`]), the capability-aware server facade ([`server`]), and the
//! tool and HTTP glue on top.

pub mod config;
#[cfg(feature = "sse")]
pub mod http;
pub mod llm;
pub mod protocol;
pub mod server;
#[cfg(feature = "sse")]
pub mod session;
pub mod streaming;
pub mod tools;
pub mod transport;
pub mod types;

pub use config::ServerConfig;
pub use protocol::Protocol;
pub use server::{Server, ServerOptions};
#[cfg(feature = "sse")]
pub use session::SessionRegistry;
pub use tools::ToolRegistry;
pub use transport::InMemoryTransport;
#[cfg(feature = "sse")]
pub use transport::SseServerTransport;
