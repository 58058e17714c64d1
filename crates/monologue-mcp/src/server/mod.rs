//! Capability-aware MCP server facade over the protocol engine.
//!
//! Owns the initialize handshake, the capability tables, and the
//! per-session logging threshold.

mod assertions;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use crate::protocol::{
    negotiate_version, NotificationOptions, Protocol, ProtocolOptions, RequestHandlerExtra,
    RequestOptions,
};
use crate::transport::Transport;
use crate::types::{
    ClientCapabilities, CreateMessage, CreateMessageParams, CreateMessageResult, ElicitAction,
    ElicitParams, ElicitResult, Elicit, EmptyParams, EmptyResult, Implementation, Initialize,
    InitializeParams, InitializeResult, Initialized, ListRoots, ListRootsResult, LoggingLevel,
    LoggingMessage, LoggingMessageParams, McpError, McpNotification, McpRequest, McpResult, Ping,
    PromptListChanged, ResourceListChanged, ResourceUpdated, ResourceUpdatedParams,
    ServerCapabilities, SetLevel, ToolListChanged,
};

use assertions::ServerPolicy;

/// Construction options for [`Server`].
#[derive(Debug, Clone, Default)]
pub struct ServerOptions {
    pub capabilities: ServerCapabilities,
    /// Free-form guidance returned from `initialize`.
    pub instructions: Option<String>,
    pub protocol: ProtocolOptions,
}

type InitializedCallback = Arc<dyn Fn() + Send + Sync>;

/// Negotiated and declared state shared with the capability policy.
pub(crate) struct ServerState {
    capabilities: ServerCapabilities,
    client_capabilities: Option<ClientCapabilities>,
    client_version: Option<Implementation>,
    logging_levels: HashMap<Option<String>, LoggingLevel>,
    on_initialized: Option<InitializedCallback>,
}

impl ServerState {
    fn new(capabilities: ServerCapabilities) -> Self {
        Self {
            capabilities,
            client_capabilities: None,
            client_version: None,
            logging_levels: HashMap::new(),
            on_initialized: None,
        }
    }
}

/// An MCP server bound to at most one transport at a time.
#[derive(Clone)]
pub struct Server {
    protocol: Protocol,
    info: Implementation,
    state: Arc<RwLock<ServerState>>,
}

impl Server {
    /// Create a server and install its built-in handlers.
    pub fn new(info: Implementation, options: ServerOptions) -> McpResult<Self> {
        let state = Arc::new(RwLock::new(ServerState::new(options.capabilities)));
        let policy = Arc::new(ServerPolicy {
            state: state.clone(),
        });
        let server = Self {
            protocol: Protocol::with_policy(options.protocol, policy),
            info,
            state,
        };

        server.install_initialize(options.instructions)?;
        server.install_initialized();
        if server.state.read().capabilities.logging.is_some() {
            server.install_set_level()?;
        }
        Ok(server)
    }

    fn install_initialize(&self, instructions: Option<String>) -> McpResult<()> {
        let state = self.state.clone();
        let info = self.info.clone();
        self.protocol.set_request_handler::<Initialize, _, _>(
            move |params: InitializeParams, _extra| {
                let state = state.clone();
                let server_info = info.clone();
                let instructions = instructions.clone();
                async move {
                    let protocol_version = negotiate_version(&params.protocol_version);
                    tracing::info!(
                        "Initialize from {} {} (protocol {protocol_version})",
                        params.client_info.name,
                        params.client_info.version
                    );
                    let capabilities = {
                        let mut state = state.write();
                        state.client_capabilities = Some(params.capabilities);
                        state.client_version = Some(params.client_info);
                        state.capabilities.clone()
                    };
                    Ok(InitializeResult {
                        protocol_version: protocol_version.to_string(),
                        capabilities,
                        server_info,
                        instructions,
                    })
                }
            },
        )
    }

    fn install_initialized(&self) {
        let state = self.state.clone();
        self.protocol
            .set_notification_handler::<Initialized, _, _>(move |_params: EmptyParams| {
                let callback = state.read().on_initialized.clone();
                if let Some(callback) = callback {
                    callback();
                }
                async { Ok(()) }
            });
    }

    fn install_set_level(&self) -> McpResult<()> {
        let state = self.state.clone();
        self.protocol
            .set_request_handler::<SetLevel, _, _>(move |params, extra| {
                let key = logging_session_key(&extra);
                tracing::debug!("Logging level for {key:?} set to {:?}", params.level);
                state.write().logging_levels.insert(key, params.level);
                async { Ok(EmptyResult {}) }
            })
    }

    /// Merge additional capabilities into the declared set.
    ///
    /// Only allowed before a transport is attached.
    pub fn register_capabilities(&self, capabilities: ServerCapabilities) -> McpResult<()> {
        if self.protocol.is_connected() {
            return Err(McpError::InvalidState(
                "Cannot register capabilities after connecting to transport".to_string(),
            ));
        }

        let had_logging = {
            let mut state = self.state.write();
            let had_logging = state.capabilities.logging.is_some();
            state.capabilities = merge_capabilities(&state.capabilities, &capabilities)?;
            had_logging
        };
        if !had_logging && self.state.read().capabilities.logging.is_some() {
            self.install_set_level()?;
        }
        Ok(())
    }

    /// Invoked when the client sends `notifications/initialized`.
    pub fn set_on_initialized(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.state.write().on_initialized = Some(Arc::new(callback));
    }

    /// Attach to `transport` and start it.
    pub async fn connect(&self, transport: Arc<dyn Transport>) -> McpResult<()> {
        self.protocol.connect(transport).await
    }

    pub async fn close(&self) -> McpResult<()> {
        self.protocol.close().await
    }

    /// The underlying engine, for registering handlers.
    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    pub fn server_info(&self) -> &Implementation {
        &self.info
    }

    /// Capabilities the client declared during `initialize`.
    pub fn client_capabilities(&self) -> Option<ClientCapabilities> {
        self.state.read().client_capabilities.clone()
    }

    /// Client name and version from `initialize`.
    pub fn client_version(&self) -> Option<Implementation> {
        self.state.read().client_version.clone()
    }

    /// Capabilities this server currently declares.
    pub fn capabilities(&self) -> ServerCapabilities {
        self.state.read().capabilities.clone()
    }

    pub async fn ping(&self) -> McpResult<EmptyResult> {
        self.protocol
            .request::<Ping>(EmptyParams {}, RequestOptions::default())
            .await
    }

    /// Ask the client to sample from its LLM.
    pub async fn create_message(
        &self,
        params: CreateMessageParams,
        options: RequestOptions,
    ) -> McpResult<CreateMessageResult> {
        self.protocol.request::<CreateMessage>(params, options).await
    }

    /// Ask the client to collect structured input from the user.
    ///
    /// Accepted content is checked against the requested schema.
    pub async fn elicit_input(
        &self,
        params: ElicitParams,
        options: RequestOptions,
    ) -> McpResult<ElicitResult> {
        let schema = params.requested_schema.clone();
        let result = self.protocol.request::<Elicit>(params, options).await?;

        if result.action == ElicitAction::Accept {
            if let Some(content) = &result.content {
                validate_elicited_content(&schema, &Value::Object(content.clone()))?;
            }
        }
        Ok(result)
    }

    pub async fn list_roots(&self, options: RequestOptions) -> McpResult<ListRootsResult> {
        self.protocol
            .request::<ListRoots>(EmptyParams {}, options)
            .await
    }

    /// Send a log message to the client unless it falls below the session's
    /// threshold. Without the `logging` capability this is a no-op.
    pub async fn send_logging_message(
        &self,
        params: LoggingMessageParams,
        session_id: Option<&str>,
    ) -> McpResult<()> {
        let ignored = {
            let state = self.state.read();
            if state.capabilities.logging.is_none() {
                return Ok(());
            }
            state
                .logging_levels
                .get(&session_id.map(str::to_string))
                .is_some_and(|minimum| params.level < *minimum)
        };
        if ignored {
            return Ok(());
        }
        self.protocol
            .notification::<LoggingMessage>(params, NotificationOptions::default())
            .await
    }

    pub async fn send_resource_updated(&self, params: ResourceUpdatedParams) -> McpResult<()> {
        self.protocol
            .notification::<ResourceUpdated>(params, NotificationOptions::default())
            .await
    }

    pub async fn send_resource_list_changed(&self) -> McpResult<()> {
        self.send_list_changed::<ResourceListChanged>().await
    }

    pub async fn send_tool_list_changed(&self) -> McpResult<()> {
        self.send_list_changed::<ToolListChanged>().await
    }

    pub async fn send_prompt_list_changed(&self) -> McpResult<()> {
        self.send_list_changed::<PromptListChanged>().await
    }

    async fn send_list_changed<N>(&self) -> McpResult<()>
    where
        N: McpNotification<Params = EmptyParams>,
    {
        self.protocol
            .notification::<N>(EmptyParams {}, NotificationOptions::default())
            .await
    }

    /// Register a handler for one of the request methods the server serves.
    pub fn set_request_handler<R, F, Fut>(&self, handler: F) -> McpResult<()>
    where
        R: McpRequest + 'static,
        F: Fn(R::Params, RequestHandlerExtra) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = McpResult<R::Result>> + Send + 'static,
    {
        self.protocol.set_request_handler::<R, F, Fut>(handler)
    }
}

/// Logging thresholds are keyed by transport session, falling back to the
/// `mcp-session-id` header.
fn logging_session_key(extra: &RequestHandlerExtra) -> Option<String> {
    extra.session_id.clone().or_else(|| {
        extra
            .request_info
            .as_ref()
            .and_then(|info| info.header("mcp-session-id"))
            .map(str::to_string)
    })
}

/// Shallow per-key merge: nested objects are combined, other values replaced.
fn merge_capabilities(
    base: &ServerCapabilities,
    additional: &ServerCapabilities,
) -> McpResult<ServerCapabilities> {
    let mut merged = serde_json::to_value(base)?;
    let additional = serde_json::to_value(additional)?;

    if let (Value::Object(merged), Value::Object(additional)) = (&mut merged, additional) {
        for (key, value) in additional {
            match (merged.get_mut(&key), value) {
                (Some(Value::Object(existing)), Value::Object(extra)) => existing.extend(extra),
                (_, value) => {
                    merged.insert(key, value);
                }
            }
        }
    }
    Ok(serde_json::from_value(merged)?)
}

fn validate_elicited_content(schema: &Value, content: &Value) -> McpResult<()> {
    let validator = jsonschema::validator_for(schema).map_err(|e| {
        McpError::InternalError(format!("Error validating elicitation response: {e}"))
    })?;

    let errors = validator
        .iter_errors(content)
        .map(|e| e.to_string())
        .collect::<Vec<_>>();
    if errors.is_empty() {
        return Ok(());
    }
    Err(McpError::InvalidParams(format!(
        "Elicitation response content does not match requested schema: {}",
        errors.join("; ")
    )))
}
