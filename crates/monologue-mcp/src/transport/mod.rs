//! Transport layer — the duplex channel the protocol engine talks through.

pub mod memory;
#[cfg(feature = "sse")]
pub mod sse;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use crate::types::{JsonRpcMessage, McpError, McpResult};

pub use memory::InMemoryTransport;
#[cfg(feature = "sse")]
pub use sse::{SseServerTransport, SseStream, SseTransportOptions};

/// Largest POST body accepted by default.
pub const MAXIMUM_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Called for every message the transport receives.
pub type MessageCallback = Arc<dyn Fn(JsonRpcMessage, MessageExtra) + Send + Sync>;
/// Called for transport-level and protocol diagnostics.
pub type ErrorCallback = Arc<dyn Fn(&McpError) + Send + Sync>;
/// Called once when the connection closes.
pub type CloseCallback = Arc<dyn Fn() + Send + Sync>;

/// HTTP details of the request that carried a message.
#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
    /// Lower-cased header names mapped to their values.
    pub headers: HashMap<String, String>,
}

impl RequestInfo {
    /// Look up a header by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// Out-of-band information delivered alongside a received message.
#[derive(Debug, Clone, Default)]
pub struct MessageExtra {
    pub request_info: Option<RequestInfo>,
    /// Opaque authentication details supplied by the HTTP layer.
    pub auth_info: Option<Value>,
}

/// Callbacks a transport invokes. The engine installs these on connect.
#[derive(Clone, Default)]
pub struct TransportCallbacks {
    pub on_message: Option<MessageCallback>,
    pub on_error: Option<ErrorCallback>,
    pub on_close: Option<CloseCallback>,
}

/// A duplex message channel carrying one logical connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Begin delivering messages. Fails when called twice.
    async fn start(&self) -> McpResult<()>;

    /// Deliver one message to the peer.
    async fn send(&self, message: JsonRpcMessage) -> McpResult<()>;

    /// Close the connection, firing `on_close` exactly once.
    async fn close(&self) -> McpResult<()>;

    /// Session identity minted by the transport, if it has one.
    fn session_id(&self) -> Option<String> {
        None
    }

    /// Currently installed callbacks.
    fn callbacks(&self) -> TransportCallbacks;

    /// Replace the installed callbacks.
    fn set_callbacks(&self, callbacks: TransportCallbacks);
}

/// Callback storage shared by the transports in this crate.
///
/// Callbacks are cloned out before being invoked so no lock is held while
/// user code runs.
#[derive(Default)]
pub(crate) struct CallbackSlot {
    callbacks: RwLock<TransportCallbacks>,
}

impl CallbackSlot {
    pub(crate) fn get(&self) -> TransportCallbacks {
        self.callbacks.read().clone()
    }

    pub(crate) fn set(&self, callbacks: TransportCallbacks) {
        *self.callbacks.write() = callbacks;
    }

    pub(crate) fn emit_message(&self, message: JsonRpcMessage, extra: MessageExtra) {
        let callback = self.callbacks.read().on_message.clone();
        if let Some(callback) = callback {
            callback(message, extra);
        }
    }

    pub(crate) fn emit_error(&self, error: McpError) {
        let callback = self.callbacks.read().on_error.clone();
        match callback {
            Some(callback) => callback(&error),
            None => tracing::debug!("Transport error with no handler installed: {error}"),
        }
    }

    pub(crate) fn emit_close(&self) {
        let callback = self.callbacks.read().on_close.clone();
        if let Some(callback) = callback {
            callback();
        }
    }
}
