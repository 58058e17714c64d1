//! HTTP glue — axum routes that open SSE sessions and route POSTed messages
//! to them.

use std::sync::{Arc, Weak};

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};

use crate::config::ServerConfig;
use crate::protocol::ProtocolOptions;
use crate::server::{Server, ServerOptions};
use crate::session::{Session, SessionRegistry};
use crate::tools::ToolRegistry;
use crate::transport::{SseServerTransport, Transport, TransportCallbacks};
use crate::types::{
    Implementation, McpError, McpNotification, McpResult, ServerCapabilities, ToolListChanged,
    SERVER_NAME, SERVER_VERSION,
};

/// Shared state of the HTTP layer.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub sessions: SessionRegistry,
    pub tools: Arc<ToolRegistry>,
    /// Expected bearer token; `None` disables the check.
    pub auth_token: Option<String>,
}

impl AppState {
    pub fn new(config: ServerConfig, tools: Arc<ToolRegistry>) -> Self {
        let auth_token = config.auth.resolve_token();
        Self {
            config: Arc::new(config),
            sessions: SessionRegistry::new(),
            tools,
            auth_token,
        }
    }
}

#[derive(Debug, Deserialize)]
struct MessageQuery {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

/// Build a server for one session: tools only, with the tool handlers
/// installed.
pub fn create_server(config: &ServerConfig, tools: Arc<ToolRegistry>) -> McpResult<Server> {
    let server = Server::new(
        Implementation::new(SERVER_NAME, SERVER_VERSION),
        ServerOptions {
            capabilities: ServerCapabilities::tools_only(),
            instructions: config.instructions.clone(),
            protocol: ProtocolOptions {
                default_request_timeout: config.request_timeout(),
                debounced_notification_methods: vec![ToolListChanged::METHOD.to_string()],
                ..ProtocolOptions::default()
            },
        },
    )?;
    tools.install(&server)?;
    Ok(server)
}

/// The application router.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);

    Router::new()
        .route(&state.config.sse_path, get(open_sse))
        .route(&state.config.message_path, post(post_message))
        .route("/health", get(|| async { "ok" }))
        .layer(cors)
        .with_state(state)
}

/// Bind and serve until Ctrl-C.
pub async fn serve(state: AppState) -> McpResult<()> {
    let addr = state.config.addr.clone();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(McpError::Io)?;

    tracing::info!(
        "SSE transport listening on {addr} (stream {}, messages {})",
        state.config.sse_path,
        state.config.message_path
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {e}");
            }
        })
        .await
        .map_err(|e| McpError::Transport(e.to_string()))?;

    tracing::info!("Server stopped");
    Ok(())
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(expected) = &state.auth_token else {
        return Ok(());
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    if presented == Some(expected.as_str()) {
        Ok(())
    } else {
        Err((StatusCode::UNAUTHORIZED, "Unauthorized").into_response())
    }
}

async fn open_sse(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(rejection) = authorize(&state, &headers) {
        return rejection;
    }

    match open_session(&state).await {
        Ok(response) => response,
        Err(e) => {
            tracing::error!("Failed to open SSE session: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn open_session(state: &AppState) -> McpResult<Response> {
    let transport = SseServerTransport::new(
        state.config.message_path.clone(),
        state.config.transport_options(),
    );
    let server = create_server(&state.config, state.tools.clone())?;

    let session_id = transport.session_id().to_string();
    let sessions = state.sessions.clone();
    transport.set_callbacks(TransportCallbacks {
        on_close: Some(Arc::new(move || {
            sessions.remove(&session_id);
        })),
        ..TransportCallbacks::default()
    });

    server.connect(transport.clone()).await?;
    let stream = transport.take_stream().ok_or_else(|| {
        McpError::InvalidState("SSE stream already taken".to_string())
    })?;

    state.sessions.insert(Session {
        transport: transport.clone(),
        server,
    });
    spawn_keepalive(Arc::downgrade(&transport), state.config.keepalive_interval());

    Ok(stream.into_response())
}

/// Write `: keepalive` comments until the session goes away.
fn spawn_keepalive(transport: Weak<SseServerTransport>, period: std::time::Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(transport) = transport.upgrade() else {
                break;
            };
            if transport.send_comment("keepalive").is_err() {
                break;
            }
        }
    });
}

async fn post_message(
    State(state): State<AppState>,
    Query(query): Query<MessageQuery>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    if let Err(rejection) = authorize(&state, &headers) {
        return rejection;
    }

    let Some(session_id) = query.session_id else {
        return (StatusCode::BAD_REQUEST, "Missing sessionId parameter").into_response();
    };
    let Some(session) = state.sessions.get(&session_id) else {
        return (StatusCode::NOT_FOUND, "Session not found").into_response();
    };

    session.transport.handle_post_message(&headers, body).await
}
