//! Phase 3: Server facade tests — initialize handshake, capability gates,
//! logging thresholds, and server-initiated requests.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::json;

use common::fixtures::{initialize, test_info};
use common::RawPeer;
use monologue_mcp::protocol::{ProtocolOptions, RequestOptions};
use monologue_mcp::server::{Server, ServerOptions};
use monologue_mcp::types::{
    CallTool, ClientCapabilities, CreateMessageParams, ElicitAction, ElicitParams,
    ElicitationCapability, LoggingCapability, LoggingLevel, LoggingMessageParams, McpError,
    SamplingCapability, SamplingMessage, ServerCapabilities, ToolCallResult,
    LATEST_PROTOCOL_VERSION,
};

fn server_with(capabilities: ServerCapabilities) -> Server {
    Server::new(
        test_info(),
        ServerOptions {
            capabilities,
            ..ServerOptions::default()
        },
    )
    .unwrap()
}

fn strict_server() -> Server {
    Server::new(
        test_info(),
        ServerOptions {
            capabilities: ServerCapabilities::tools_only(),
            protocol: ProtocolOptions {
                enforce_strict_capabilities: true,
                ..ProtocolOptions::default()
            },
            ..ServerOptions::default()
        },
    )
    .unwrap()
}

fn logging_server() -> Server {
    server_with(ServerCapabilities {
        logging: Some(LoggingCapability {}),
        ..ServerCapabilities::tools_only()
    })
}

fn log(level: LoggingLevel, text: &str) -> LoggingMessageParams {
    LoggingMessageParams {
        level,
        logger: None,
        data: json!(text),
    }
}

// ==================== Initialize ====================

#[tokio::test]
async fn test_initialize_returns_server_identity() {
    let server = Server::new(
        test_info(),
        ServerOptions {
            capabilities: ServerCapabilities::tools_only(),
            instructions: Some("Call generate-monologue.".to_string()),
            ..ServerOptions::default()
        },
    )
    .unwrap();
    let mut peer = RawPeer::connect_server(&server).await;

    let reply = initialize(&mut peer, ClientCapabilities::default()).await;
    let result = &reply["result"];
    assert_eq!(result["protocolVersion"], LATEST_PROTOCOL_VERSION);
    assert_eq!(result["capabilities"], json!({"tools": {}}));
    assert_eq!(result["serverInfo"]["name"], "monologue-mcp-test");
    assert_eq!(result["instructions"], "Call generate-monologue.");
}

#[tokio::test]
async fn test_initialize_negotiates_version() {
    let server = server_with(ServerCapabilities::tools_only());
    let mut peer = RawPeer::connect_server(&server).await;

    let older = peer
        .call(
            0,
            "initialize",
            json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "clientInfo": {"name": "old-client", "version": "0.1.0"},
            }),
        )
        .await;
    assert_eq!(older["result"]["protocolVersion"], "2024-11-05");

    let unknown = peer
        .call(
            1,
            "initialize",
            json!({
                "protocolVersion": "1999-01-01",
                "capabilities": {},
                "clientInfo": {"name": "future-client", "version": "9.0.0"},
            }),
        )
        .await;
    assert_eq!(unknown["result"]["protocolVersion"], LATEST_PROTOCOL_VERSION);
}

#[tokio::test]
async fn test_initialize_records_client_details() {
    let server = server_with(ServerCapabilities::tools_only());
    let initialized = Arc::new(AtomicUsize::new(0));
    let counter = initialized.clone();
    server.set_on_initialized(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let mut peer = RawPeer::connect_server(&server).await;
    assert!(server.client_capabilities().is_none());

    initialize(
        &mut peer,
        ClientCapabilities {
            sampling: Some(SamplingCapability {}),
            ..ClientCapabilities::default()
        },
    )
    .await;
    RawPeer::settle().await;

    let capabilities = server.client_capabilities().unwrap();
    assert!(capabilities.sampling.is_some());
    assert!(capabilities.elicitation.is_none());
    assert_eq!(server.client_version().unwrap().name, "raw-peer");
    assert_eq!(initialized.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_malformed_initialize_is_invalid_params() {
    let server = server_with(ServerCapabilities::tools_only());
    let mut peer = RawPeer::connect_server(&server).await;

    let reply = peer
        .call(0, "initialize", json!({"protocolVersion": 5}))
        .await;
    assert_eq!(reply["error"]["code"], -32602);
}

// ==================== Capabilities ====================

#[tokio::test]
async fn test_register_capabilities_merges_before_connect() {
    let server = server_with(ServerCapabilities::tools_only());
    server
        .register_capabilities(ServerCapabilities {
            logging: Some(LoggingCapability {}),
            ..ServerCapabilities::default()
        })
        .unwrap();

    let capabilities = server.capabilities();
    assert!(capabilities.tools.is_some());
    assert!(capabilities.logging.is_some());

    // logging/setLevel becomes available once logging is declared.
    let mut peer = RawPeer::connect_server(&server).await;
    let reply = peer
        .call(1, "logging/setLevel", json!({"level": "error"}))
        .await;
    assert_eq!(reply["result"], json!({}));
}

#[tokio::test]
async fn test_register_capabilities_after_connect_fails() {
    let server = server_with(ServerCapabilities::tools_only());
    let _peer = RawPeer::connect_server(&server).await;

    let err = server
        .register_capabilities(ServerCapabilities {
            logging: Some(LoggingCapability {}),
            ..ServerCapabilities::default()
        })
        .unwrap_err();
    assert!(matches!(err, McpError::InvalidState(_)));
    assert!(server.capabilities().logging.is_none());
}

#[tokio::test]
async fn test_tool_handlers_require_tools_capability() {
    let server = server_with(ServerCapabilities::default());
    let err = server
        .set_request_handler::<CallTool, _, _>(|_params, _extra| async {
            Ok(ToolCallResult::text("unreachable".into()))
        })
        .unwrap_err();
    assert!(matches!(err, McpError::CapabilityNotSupported(_)));
    assert!(err.to_string().contains("tools"));
}

#[tokio::test]
async fn test_notifications_require_local_capability() {
    let server = server_with(ServerCapabilities::default());
    let mut peer = RawPeer::connect_server(&server).await;

    let err = server.send_tool_list_changed().await.unwrap_err();
    assert!(matches!(err, McpError::CapabilityNotSupported(_)));
    assert!(server.send_resource_list_changed().await.is_err());

    let server = server_with(ServerCapabilities::tools_only());
    let mut tools_peer = RawPeer::connect_server(&server).await;
    server.send_tool_list_changed().await.unwrap();
    let message = tools_peer.recv().await;
    assert_eq!(message.method(), Some("notifications/tools/list_changed"));

    RawPeer::settle().await;
    assert!(peer.try_recv().is_none());
}

#[tokio::test]
async fn test_set_level_unavailable_without_logging() {
    let server = server_with(ServerCapabilities::tools_only());
    let mut peer = RawPeer::connect_server(&server).await;

    let reply = peer
        .call(1, "logging/setLevel", json!({"level": "debug"}))
        .await;
    assert_eq!(reply["error"]["code"], -32601);

    // Without the capability, logging is a silent no-op.
    server
        .send_logging_message(log(LoggingLevel::Emergency, "dropped"), None)
        .await
        .unwrap();
    RawPeer::settle().await;
    assert!(peer.try_recv().is_none());
}

// ==================== Logging ====================

#[tokio::test]
async fn test_logging_threshold_filters_messages() {
    let server = logging_server();
    let mut peer = RawPeer::connect_server(&server).await;
    initialize(&mut peer, ClientCapabilities::default()).await;

    let reply = peer
        .call(1, "logging/setLevel", json!({"level": "warning"}))
        .await;
    assert_eq!(reply["result"], json!({}));

    server
        .send_logging_message(log(LoggingLevel::Info, "quiet"), None)
        .await
        .unwrap();
    server
        .send_logging_message(log(LoggingLevel::Error, "loud"), None)
        .await
        .unwrap();

    let message = peer.recv_value().await;
    assert_eq!(message["method"], "notifications/message");
    assert_eq!(message["params"]["level"], "error");
    assert_eq!(message["params"]["data"], "loud");
    assert!(peer.try_recv().is_none());
}

#[tokio::test]
async fn test_logging_threshold_is_per_session() {
    let server = logging_server();
    let mut peer = RawPeer::connect_server_with_session(&server, Some("session-a")).await;
    initialize(&mut peer, ClientCapabilities::default()).await;

    peer.call(1, "logging/setLevel", json!({"level": "critical"}))
        .await;

    server
        .send_logging_message(log(LoggingLevel::Warning, "filtered"), Some("session-a"))
        .await
        .unwrap();
    RawPeer::settle().await;
    assert!(peer.try_recv().is_none());

    // A session with no threshold of its own receives everything.
    server
        .send_logging_message(log(LoggingLevel::Debug, "unfiltered"), Some("session-b"))
        .await
        .unwrap();
    let message = peer.recv_value().await;
    assert_eq!(message["params"]["data"], "unfiltered");
}

// ==================== Server-initiated requests ====================

fn sampling_params() -> CreateMessageParams {
    CreateMessageParams {
        messages: vec![SamplingMessage {
            role: "user".to_string(),
            content: json!({"type": "text", "text": "hello"}),
        }],
        model_preferences: None,
        system_prompt: None,
        include_context: None,
        temperature: None,
        max_tokens: 100,
        stop_sequences: None,
        metadata: None,
    }
}

#[tokio::test]
async fn test_strict_server_refuses_sampling_without_client_support() {
    let server = strict_server();
    let mut peer = RawPeer::connect_server(&server).await;
    initialize(&mut peer, ClientCapabilities::default()).await;

    let err = server
        .create_message(sampling_params(), RequestOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, McpError::CapabilityNotSupported(_)));
    assert_eq!(
        err.to_string(),
        "Client does not support sampling (required for sampling/createMessage)"
    );

    RawPeer::settle().await;
    assert!(peer.try_recv().is_none());
}

#[tokio::test]
async fn test_create_message_round_trip() {
    let server = strict_server();
    let mut peer = RawPeer::connect_server(&server).await;
    initialize(
        &mut peer,
        ClientCapabilities {
            sampling: Some(SamplingCapability {}),
            ..ClientCapabilities::default()
        },
    )
    .await;

    let sampler = server.clone();
    let task = tokio::spawn(async move {
        sampler
            .create_message(sampling_params(), RequestOptions::default())
            .await
    });

    let request = peer.recv_value().await;
    assert_eq!(request["method"], "sampling/createMessage");
    assert_eq!(request["params"]["maxTokens"], 100);
    peer.send(json!({
        "jsonrpc": "2.0",
        "id": request["id"],
        "result": {
            "role": "assistant",
            "content": {"type": "text", "text": "hi there"},
            "model": "client-model",
            "stopReason": "endTurn",
        },
    }))
    .await;

    let result = task.await.unwrap().unwrap();
    assert_eq!(result.model, "client-model");
    assert_eq!(result.content["text"], "hi there");
}

fn elicit_params() -> ElicitParams {
    ElicitParams {
        message: "Who are you?".to_string(),
        requested_schema: json!({
            "type": "object",
            "properties": {"name": {"type": "string"}},
            "required": ["name"],
        }),
    }
}

async fn elicit_with_reply(result: serde_json::Value) -> Result<ElicitAction, McpError> {
    let server = server_with(ServerCapabilities::tools_only());
    let mut peer = RawPeer::connect_server(&server).await;
    initialize(
        &mut peer,
        ClientCapabilities {
            elicitation: Some(ElicitationCapability {}),
            ..ClientCapabilities::default()
        },
    )
    .await;

    let elicitor = server.clone();
    let task = tokio::spawn(async move {
        elicitor
            .elicit_input(elicit_params(), RequestOptions::default())
            .await
    });
    let request = peer.recv_value().await;
    assert_eq!(request["method"], "elicitation/create");
    assert_eq!(request["params"]["requestedSchema"]["required"][0], "name");
    peer.send(json!({"jsonrpc": "2.0", "id": request["id"], "result": result}))
        .await;

    task.await.unwrap().map(|result| result.action)
}

#[tokio::test]
async fn test_elicit_input_accepts_valid_content() {
    let action = elicit_with_reply(json!({"action": "accept", "content": {"name": "Ada"}}))
        .await
        .unwrap();
    assert_eq!(action, ElicitAction::Accept);
}

#[tokio::test]
async fn test_elicit_input_rejects_content_outside_schema() {
    let err = elicit_with_reply(json!({"action": "accept", "content": {"name": 7}}))
        .await
        .unwrap_err();
    assert_eq!(err.code(), -32602);
    assert!(err
        .message()
        .starts_with("Elicitation response content does not match requested schema"));
}

#[tokio::test]
async fn test_elicit_input_decline_skips_validation() {
    let action = elicit_with_reply(json!({"action": "decline"}))
        .await
        .unwrap();
    assert_eq!(action, ElicitAction::Decline);
}

#[tokio::test]
async fn test_server_ping_and_roots() {
    let server = server_with(ServerCapabilities::tools_only());
    let mut peer = RawPeer::connect_server(&server).await;

    let pinger = server.clone();
    let ping = tokio::spawn(async move { pinger.ping().await });
    let request = peer.recv_value().await;
    assert_eq!(request["method"], "ping");
    assert!(request.get("params").is_none());
    peer.send(json!({"jsonrpc": "2.0", "id": request["id"], "result": {}}))
        .await;
    ping.await.unwrap().unwrap();

    let lister = server.clone();
    let roots = tokio::spawn(async move { lister.list_roots(RequestOptions::default()).await });
    let request = peer.recv_value().await;
    assert_eq!(request["method"], "roots/list");
    peer.send(json!({
        "jsonrpc": "2.0",
        "id": request["id"],
        "result": {"roots": [{"uri": "file:///work", "name": "work"}]},
    }))
    .await;
    let roots = roots.await.unwrap().unwrap();
    assert_eq!(roots.roots[0].uri, "file:///work");
}
