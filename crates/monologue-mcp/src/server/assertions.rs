//! Method → capability tables for the server side of a connection.

use std::sync::Arc;

use parking_lot::RwLock;

use super::ServerState;
use crate::protocol::CapabilityPolicy;
use crate::types::{McpError, McpResult};

/// Capability gate backed by the server's negotiated state.
pub(crate) struct ServerPolicy {
    pub(crate) state: Arc<RwLock<ServerState>>,
}

fn unsupported(side: &str, capability: &str, method: &str) -> McpError {
    McpError::CapabilityNotSupported(format!(
        "{side} does not support {capability} (required for {method})"
    ))
}

impl CapabilityPolicy for ServerPolicy {
    fn assert_capability_for_method(&self, method: &str) -> McpResult<()> {
        let state = self.state.read();
        let client = state.client_capabilities.as_ref();
        match method {
            "sampling/createMessage" if client.and_then(|c| c.sampling.as_ref()).is_none() => {
                Err(unsupported("Client", "sampling", method))
            }
            "elicitation/create" if client.and_then(|c| c.elicitation.as_ref()).is_none() => {
                Err(unsupported("Client", "elicitation", method))
            }
            "roots/list" if client.and_then(|c| c.roots.as_ref()).is_none() => {
                Err(unsupported("Client", "listing roots", method))
            }
            _ => Ok(()),
        }
    }

    fn assert_notification_capability(&self, method: &str) -> McpResult<()> {
        let state = self.state.read();
        let caps = &state.capabilities;
        match method {
            "notifications/message" if caps.logging.is_none() => {
                Err(unsupported("Server", "logging", method))
            }
            "notifications/resources/updated" | "notifications/resources/list_changed"
                if caps.resources.is_none() =>
            {
                Err(unsupported("Server", "notifying about resources", method))
            }
            "notifications/tools/list_changed" if caps.tools.is_none() => {
                Err(unsupported("Server", "notifying of tool list changes", method))
            }
            "notifications/prompts/list_changed" if caps.prompts.is_none() => {
                Err(unsupported("Server", "notifying of prompt list changes", method))
            }
            _ => Ok(()),
        }
    }

    fn assert_request_handler_capability(&self, method: &str) -> McpResult<()> {
        let state = self.state.read();
        let caps = &state.capabilities;
        match method {
            // Servers never declare sampling.
            "sampling/createMessage" => Err(unsupported("Server", "sampling", method)),
            "logging/setLevel" if caps.logging.is_none() => {
                Err(unsupported("Server", "logging", method))
            }
            "prompts/get" | "prompts/list" if caps.prompts.is_none() => {
                Err(unsupported("Server", "prompts", method))
            }
            "resources/list"
            | "resources/templates/list"
            | "resources/read"
            | "resources/subscribe"
            | "resources/unsubscribe"
                if caps.resources.is_none() =>
            {
                Err(unsupported("Server", "resources", method))
            }
            "tools/call" | "tools/list" if caps.tools.is_none() => {
                Err(unsupported("Server", "tools", method))
            }
            _ => Ok(()),
        }
    }
}
