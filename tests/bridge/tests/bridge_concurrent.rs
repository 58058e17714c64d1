//! Concurrent traffic: two engines talking over a linked in-memory pair.
//!
//! Tests verify that requests flowing in both directions at once are
//! correlated correctly, and that handlers can call back into the peer
//! while their own request is still open.

use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::{json, Value};
use tokio::sync::Barrier;

use monologue_mcp::config::LlmConfig;
use monologue_mcp::llm::{
    ContentBlock, LlmError, MessageClient, MessageRequest, MessageResponse,
};
use monologue_mcp::protocol::{
    NotificationOptions, Protocol, ProtocolOptions, RequestHandlerExtra, RequestOptions,
};
use monologue_mcp::types::{
    CallTool, CallToolParams, ClientCapabilities, EmptyParams, Implementation, Initialize,
    InitializeParams, Initialized, JsonRpcRequest, McpError, Ping, ServerCapabilities,
    LATEST_PROTOCOL_VERSION,
};
use monologue_mcp::{InMemoryTransport, Server, ServerOptions, ToolRegistry};

// ─── Helpers ───────────────────────────────────────────────────────────────

fn echo_engine(name: &'static str) -> Protocol {
    let engine = Protocol::new(ProtocolOptions::default());
    engine
        .set_request_handler_raw(
            "test/echo",
            Arc::new(move |request: JsonRpcRequest, _extra: RequestHandlerExtra| {
                async move {
                    Ok(json!({
                        "answered_by": name,
                        "params": request.params.unwrap_or(Value::Null),
                    }))
                }
                .boxed()
            }),
        )
        .expect("register echo");
    engine
}

async fn link(a: &Protocol, b: &Protocol) {
    let (left, right) = InMemoryTransport::create_linked_pair();
    a.connect(left).await.expect("connect a");
    b.connect(right).await.expect("connect b");
}

/// Replies with the user prompt it was given.
struct PromptEchoClient;

#[async_trait]
impl MessageClient for PromptEchoClient {
    async fn create_message(&self, request: MessageRequest) -> Result<MessageResponse, LlmError> {
        let prompt = request
            .messages
            .first()
            .map(|message| message.content.clone())
            .unwrap_or_default();
        Ok(MessageResponse {
            content: vec![ContentBlock::Text { text: prompt }],
            model: Some(request.model),
            stop_reason: Some("end_turn".to_string()),
        })
    }
}

async fn tool_server_and_client() -> (Server, Protocol) {
    let server = Server::new(
        Implementation::new("bridge-server", "0.0.0"),
        ServerOptions {
            capabilities: ServerCapabilities::tools_only(),
            ..ServerOptions::default()
        },
    )
    .expect("create server");
    Arc::new(ToolRegistry::new(
        Arc::new(PromptEchoClient),
        LlmConfig::default(),
    ))
    .install(&server)
    .expect("install tools");

    let client = Protocol::new(ProtocolOptions::default());
    let (client_end, server_end) = InMemoryTransport::create_linked_pair();
    server.connect(server_end).await.expect("connect server");
    client.connect(client_end).await.expect("connect client");

    let init = client
        .request::<Initialize>(
            InitializeParams {
                protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
                capabilities: ClientCapabilities::default(),
                client_info: Implementation::new("bridge-client", "0.0.0"),
            },
            RequestOptions::default(),
        )
        .await
        .expect("initialize");
    assert_eq!(init.server_info.name, "bridge-server");
    client
        .notification::<Initialized>(EmptyParams {}, NotificationOptions::default())
        .await
        .expect("initialized");

    (server, client)
}

// ─── Tests ─────────────────────────────────────────────────────────────────

/// Both sides issue requests at the same time.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_requests_in_both_directions() {
    let a = echo_engine("a");
    let b = echo_engine("b");
    link(&a, &b).await;

    let barrier = Arc::new(Barrier::new(10));
    let mut handles = vec![];

    for n in 0..10u32 {
        let (caller, expected) = if n % 2 == 0 {
            (a.clone(), "b")
        } else {
            (b.clone(), "a")
        };
        let barrier = barrier.clone();
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            let reply = caller
                .request_raw("test/echo", Some(json!({"n": n})), RequestOptions::default())
                .await
                .expect("echo");
            assert_eq!(reply["answered_by"], expected);
            assert_eq!(reply["params"]["n"], n);
            n
        }));
    }

    let mut finished = vec![];
    for handle in handles {
        finished.push(handle.await.unwrap());
    }
    finished.sort();
    assert_eq!(finished, (0..10).collect::<Vec<_>>());
    assert_eq!(a.pending_request_count(), 0);
    assert_eq!(b.pending_request_count(), 0);
}

/// A handler calls back into the peer before answering.
#[tokio::test]
async fn test_handler_can_call_peer_mid_request() {
    let a = Protocol::new(ProtocolOptions::default());
    let b = Protocol::new(ProtocolOptions::default());
    b.set_request_handler_raw(
        "test/nested",
        Arc::new(|_request: JsonRpcRequest, extra: RequestHandlerExtra| {
            async move {
                extra
                    .send_request::<Ping>(EmptyParams {}, RequestOptions::default())
                    .await?;
                Ok::<_, McpError>(json!({"pinged": true}))
            }
            .boxed()
        }),
    )
    .expect("register nested");
    link(&a, &b).await;

    let reply = a
        .request_raw("test/nested", None, RequestOptions::default())
        .await
        .expect("nested");
    assert_eq!(reply, json!({"pinged": true}));
}

/// Several clients' worth of tool calls through one server at once.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_tool_calls() {
    let (_server, client) = tool_server_and_client().await;

    let barrier = Arc::new(Barrier::new(8));
    let mut handles = vec![];
    for n in 0..8u32 {
        let client = client.clone();
        let barrier = barrier.clone();
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            let result = client
                .request::<CallTool>(
                    CallToolParams {
                        name: "generate-monologue".to_string(),
                        arguments: Some(json!({"task": format!("task-{n}"), "lines": 3})),
                    },
                    RequestOptions::default(),
                )
                .await
                .expect("tool call");
            let text = result.first_text().unwrap_or_default().to_string();
            assert!(
                text.contains(&format!("Current task: task-{n}\n")),
                "call {n} got {text:?}"
            );
            assert!(result.is_error.is_none());
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(client.pending_request_count(), 0);
}
