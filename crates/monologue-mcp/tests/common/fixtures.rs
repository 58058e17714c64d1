//! Test data fixtures for MCP server tests.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use monologue_mcp::config::LlmConfig;
use monologue_mcp::llm::{
    ContentBlock, LlmError, MessageClient, MessageRequest, MessageResponse,
};
use monologue_mcp::server::{Server, ServerOptions};
use monologue_mcp::tools::ToolRegistry;
use monologue_mcp::types::{
    ClientCapabilities, Implementation, ServerCapabilities, LATEST_PROTOCOL_VERSION,
};

use super::RawPeer;

/// Canned LLM client that records what it was asked.
pub struct FakeClient {
    reply: Result<Vec<ContentBlock>, String>,
    pub requests: Mutex<Vec<MessageRequest>>,
}

impl FakeClient {
    pub fn replying(text: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: Ok(vec![ContentBlock::Text {
                text: text.to_string(),
            }]),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Answers successfully with no content blocks.
    pub fn empty() -> Arc<Self> {
        Arc::new(Self {
            reply: Ok(Vec::new()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn failing(message: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: Err(message.to_string()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn last_request(&self) -> Option<MessageRequest> {
        self.requests.lock().last().cloned()
    }
}

#[async_trait]
impl MessageClient for FakeClient {
    async fn create_message(&self, request: MessageRequest) -> Result<MessageResponse, LlmError> {
        self.requests.lock().push(request);
        match &self.reply {
            Ok(content) => Ok(MessageResponse {
                content: content.clone(),
                model: Some("fake-model".to_string()),
                stop_reason: Some("end_turn".to_string()),
            }),
            Err(message) => Err(LlmError::Api {
                status: 529,
                message: message.clone(),
            }),
        }
    }
}

pub fn test_info() -> Implementation {
    Implementation::new("monologue-mcp-test", "0.0.0")
}

/// A tools-only server with the monologue tool installed.
pub fn create_tool_server(client: Arc<FakeClient>) -> Server {
    let server = Server::new(
        test_info(),
        ServerOptions {
            capabilities: ServerCapabilities::tools_only(),
            ..ServerOptions::default()
        },
    )
    .expect("create server");
    Arc::new(ToolRegistry::new(client, LlmConfig::default()))
        .install(&server)
        .expect("install tools");
    server
}

/// Perform the initialize handshake from the raw peer.
pub async fn initialize(peer: &mut RawPeer, capabilities: ClientCapabilities) -> serde_json::Value {
    let reply = peer
        .call(
            0,
            "initialize",
            json!({
                "protocolVersion": LATEST_PROTOCOL_VERSION,
                "capabilities": capabilities,
                "clientInfo": {"name": "raw-peer", "version": "1.0.0"},
            }),
        )
        .await;
    peer.send(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
        .await;
    reply
}
