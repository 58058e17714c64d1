//! MCP tool implementations.

pub mod generate_monologue;

use std::sync::Arc;

use crate::config::LlmConfig;
use crate::llm::MessageClient;
use crate::protocol::RequestHandlerExtra;
use crate::server::Server;
use crate::types::{
    CallTool, CallToolParams, ListTools, McpResult, ToolCallResult, ToolDefinition,
    ToolListResult,
};

/// Registry of available MCP tools.
pub struct ToolRegistry {
    client: Arc<dyn MessageClient>,
    llm: LlmConfig,
}

impl ToolRegistry {
    pub fn new(client: Arc<dyn MessageClient>, llm: LlmConfig) -> Self {
        Self { client, llm }
    }

    /// List all available tool definitions.
    pub fn list_tools() -> Vec<ToolDefinition> {
        vec![generate_monologue::definition()]
    }

    /// Dispatch a tool call.
    ///
    /// Unknown tools and provider failures come back as `isError` results;
    /// malformed arguments are `InvalidParams`.
    pub async fn call(
        &self,
        params: CallToolParams,
        extra: Option<&RequestHandlerExtra>,
    ) -> McpResult<ToolCallResult> {
        tracing::debug!("Tool call: {}", params.name);
        match params.name.as_str() {
            generate_monologue::NAME => {
                generate_monologue::execute(
                    params.arguments,
                    self.client.as_ref(),
                    &self.llm,
                    extra,
                )
                .await
            }
            other => Ok(ToolCallResult::error(format!("Unknown tool: {other}"))),
        }
    }

    /// Serve `tools/list` and `tools/call` on `server`.
    ///
    /// Fails when the server has not declared the `tools` capability.
    pub fn install(self: Arc<Self>, server: &Server) -> McpResult<()> {
        server.set_request_handler::<ListTools, _, _>(|_params, _extra| async {
            Ok(ToolListResult {
                tools: Self::list_tools(),
                next_cursor: None,
            })
        })?;

        server.set_request_handler::<CallTool, _, _>(move |params, extra| {
            let registry = self.clone();
            async move { registry.call(params, Some(&extra)).await }
        })
    }
}
