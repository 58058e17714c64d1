//! SSE transport — server-to-client messages over a Server-Sent Events
//! stream, client-to-server messages over HTTP POST.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::Stream;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use url::Url;

use super::{
    CallbackSlot, MessageExtra, RequestInfo, Transport, TransportCallbacks, MAXIMUM_MESSAGE_SIZE,
};
use crate::types::{JsonRpcMessage, McpError, McpResult};

/// POST validation and size settings.
#[derive(Debug, Clone)]
pub struct SseTransportOptions {
    /// Exact `Host` values accepted when protection is on. Empty accepts any.
    pub allowed_hosts: Vec<String>,
    /// Exact `Origin` values accepted when protection is on. Empty accepts any.
    pub allowed_origins: Vec<String>,
    pub enable_dns_rebinding_protection: bool,
    pub max_message_size: usize,
}

impl Default for SseTransportOptions {
    fn default() -> Self {
        Self {
            allowed_hosts: Vec::new(),
            allowed_origins: Vec::new(),
            enable_dns_rebinding_protection: false,
            max_message_size: MAXIMUM_MESSAGE_SIZE,
        }
    }
}

/// One frame on the event stream.
#[derive(Debug, Clone, PartialEq)]
pub enum SseFrame {
    /// Tells the client where to POST, with the session id attached.
    Endpoint(String),
    /// A JSON-encoded message.
    Message(String),
    /// A comment line; ignored by parsers, used for keep-alive.
    Comment(String),
}

impl SseFrame {
    pub fn encode(&self) -> String {
        match self {
            SseFrame::Endpoint(url) => format!("event: endpoint\ndata: {url}\n\n"),
            SseFrame::Message(json) => format!("event: message\ndata: {json}\n\n"),
            SseFrame::Comment(text) => format!(": {text}\n\n"),
        }
    }
}

/// Server side of one SSE session.
///
/// `start` opens the frame channel and queues the endpoint frame; the HTTP
/// layer takes the matching [`SseStream`] and streams it to the client.
pub struct SseServerTransport {
    endpoint: String,
    session_id: String,
    options: SseTransportOptions,
    sender: Mutex<Option<mpsc::UnboundedSender<SseFrame>>>,
    stream: Mutex<Option<mpsc::UnboundedReceiver<SseFrame>>>,
    callbacks: CallbackSlot,
    started: AtomicBool,
    closed: AtomicBool,
    this: Weak<SseServerTransport>,
}

impl SseServerTransport {
    /// Create a transport that directs the client to POST to `endpoint`.
    pub fn new(endpoint: impl Into<String>, options: SseTransportOptions) -> Arc<Self> {
        let endpoint = endpoint.into();
        Arc::new_cyclic(|this| Self {
            endpoint,
            session_id: uuid::Uuid::new_v4().to_string(),
            options,
            sender: Mutex::new(None),
            stream: Mutex::new(None),
            callbacks: CallbackSlot::default(),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            this: this.clone(),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn options(&self) -> &SseTransportOptions {
        &self.options
    }

    /// Whether the event stream is open.
    pub fn is_connected(&self) -> bool {
        self.sender.lock().is_some()
    }

    /// The endpoint path with `sessionId` set, keeping any other query
    /// parameters and fragment.
    pub fn endpoint_url(&self) -> McpResult<String> {
        let base = Url::parse("http://localhost")
            .map_err(|e| McpError::Transport(format!("Invalid base URL: {e}")))?;
        let mut url = base
            .join(&self.endpoint)
            .map_err(|e| McpError::Transport(format!("Invalid endpoint {}: {e}", self.endpoint)))?;

        let retained: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(key, _)| key != "sessionId")
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();
        url.query_pairs_mut()
            .clear()
            .extend_pairs(retained)
            .append_pair("sessionId", &self.session_id);

        let mut relative = url.path().to_string();
        if let Some(query) = url.query() {
            relative.push('?');
            relative.push_str(query);
        }
        if let Some(fragment) = url.fragment() {
            relative.push('#');
            relative.push_str(fragment);
        }
        Ok(relative)
    }

    /// Take the event stream for this session. Returns `None` before
    /// `start` or when already taken.
    pub fn take_stream(&self) -> Option<SseStream> {
        let frames = self.stream.lock().take()?;
        Some(SseStream {
            frames,
            _guard: StreamGuard {
                transport: self.this.clone(),
            },
        })
    }

    /// Write a comment frame, e.g. a keep-alive.
    pub fn send_comment(&self, text: &str) -> McpResult<()> {
        self.push(SseFrame::Comment(text.to_string()))
    }

    fn push(&self, frame: SseFrame) -> McpResult<()> {
        let sender = self.sender.lock();
        let sender = sender.as_ref().ok_or(McpError::NotConnected)?;
        sender.send(frame).map_err(|_| McpError::NotConnected)
    }

    /// Check `Host` and `Origin` against the allow-lists.
    ///
    /// Returns the rejection message, or `None` when the request passes.
    pub fn validate_request_headers(&self, headers: &HeaderMap) -> Option<String> {
        if !self.options.enable_dns_rebinding_protection {
            return None;
        }

        let header_value = |name: header::HeaderName| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };

        if !self.options.allowed_hosts.is_empty() {
            let host = header_value(header::HOST);
            if !host
                .as_ref()
                .is_some_and(|host| self.options.allowed_hosts.contains(host))
            {
                return Some(format!(
                    "Invalid Host header: {}",
                    host.unwrap_or_default()
                ));
            }
        }

        if !self.options.allowed_origins.is_empty() {
            let origin = header_value(header::ORIGIN);
            if !origin
                .as_ref()
                .is_some_and(|origin| self.options.allowed_origins.contains(origin))
            {
                return Some(format!(
                    "Invalid Origin header: {}",
                    origin.unwrap_or_default()
                ));
            }
        }

        None
    }

    /// Handle one POSTed message and produce the HTTP reply.
    ///
    /// The protocol reply, if any, travels later over the event stream.
    pub async fn handle_post_message(&self, headers: &HeaderMap, body: Body) -> Response {
        if !self.is_connected() {
            return (StatusCode::INTERNAL_SERVER_ERROR, "SSE connection not established")
                .into_response();
        }

        if let Some(rejection) = self.validate_request_headers(headers) {
            self.callbacks
                .emit_error(McpError::Transport(rejection.clone()));
            return (StatusCode::FORBIDDEN, rejection).into_response();
        }

        let content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        let media_type = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        if media_type != "application/json" {
            return self.bad_request(format!("Unsupported content-type: {media_type}"));
        }

        let bytes = match axum::body::to_bytes(body, self.options.max_message_size).await {
            Ok(bytes) => bytes,
            Err(e) => return self.bad_request(format!("Failed to read request body: {e}")),
        };
        let text = match String::from_utf8(bytes.to_vec()) {
            Ok(text) => text,
            Err(e) => return self.bad_request(format!("Request body is not valid UTF-8: {e}")),
        };

        let extra = MessageExtra {
            request_info: Some(request_info(headers)),
            auth_info: None,
        };
        let parsed = serde_json::from_str::<Value>(&text)
            .map_err(McpError::from)
            .and_then(|value| self.handle_message(value, extra));
        match parsed {
            Ok(()) => (StatusCode::ACCEPTED, "Accepted").into_response(),
            Err(_) => (StatusCode::BAD_REQUEST, format!("Invalid message: {text}")).into_response(),
        }
    }

    fn bad_request(&self, message: String) -> Response {
        self.callbacks
            .emit_error(McpError::Transport(message.clone()));
        (StatusCode::BAD_REQUEST, message).into_response()
    }

    /// Validate and deliver a message however it arrived.
    pub fn handle_message(&self, value: Value, extra: MessageExtra) -> McpResult<()> {
        let message = match JsonRpcMessage::classify(value) {
            Ok(message) => message,
            Err(e) => {
                self.callbacks
                    .emit_error(McpError::ParseError(e.message()));
                return Err(e);
            }
        };
        self.callbacks.emit_message(message, extra);
        Ok(())
    }

    /// Detach the stream and fire `on_close` the first time only.
    fn shutdown(&self) {
        self.sender.lock().take();
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!("SSE session {} closed", self.session_id);
            self.callbacks.emit_close();
        }
    }
}

#[async_trait]
impl Transport for SseServerTransport {
    async fn start(&self) -> McpResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(McpError::InvalidState(
                "SSE transport already started; connect() starts it automatically".to_string(),
            ));
        }
        let endpoint = self.endpoint_url()?;

        let (tx, rx) = mpsc::unbounded_channel();
        // Cannot fail: the receiver is alive until stored below.
        let _ = tx.send(SseFrame::Endpoint(endpoint));
        *self.sender.lock() = Some(tx);
        *self.stream.lock() = Some(rx);
        tracing::debug!("SSE session {} started", self.session_id);
        Ok(())
    }

    async fn send(&self, message: JsonRpcMessage) -> McpResult<()> {
        let json = serde_json::to_string(&message)?;
        self.push(SseFrame::Message(json))
    }

    async fn close(&self) -> McpResult<()> {
        self.shutdown();
        Ok(())
    }

    fn session_id(&self) -> Option<String> {
        Some(self.session_id.clone())
    }

    fn callbacks(&self) -> TransportCallbacks {
        self.callbacks.get()
    }

    fn set_callbacks(&self, callbacks: TransportCallbacks) {
        self.callbacks.set(callbacks);
    }
}

fn request_info(headers: &HeaderMap) -> RequestInfo {
    let headers = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_ascii_lowercase(), value.to_string()))
        })
        .collect();
    RequestInfo { headers }
}

struct StreamGuard {
    transport: Weak<SseServerTransport>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if let Some(transport) = self.transport.upgrade() {
            transport.shutdown();
        }
    }
}

/// The event stream of one session. Dropping it (client went away) closes
/// the transport.
pub struct SseStream {
    frames: mpsc::UnboundedReceiver<SseFrame>,
    _guard: StreamGuard,
}

impl Stream for SseStream {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.frames
            .poll_recv(cx)
            .map(|frame| frame.map(|frame| Ok(Bytes::from(frame.encode()))))
    }
}

impl IntoResponse for SseStream {
    fn into_response(self) -> Response {
        (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "text/event-stream"),
                (header::CACHE_CONTROL, "no-cache, no-transform"),
                (header::CONNECTION, "keep-alive"),
            ],
            Body::from_stream(self),
        )
            .into_response()
    }
}
