//! Protocol engine — request/response correlation, handler dispatch,
//! timeouts, cancellation, progress, and debounced notifications.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::{self, BoxFuture};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use super::abort::{AbortController, AbortSignal};
use super::policy::{CapabilityPolicy, PermissivePolicy};
use crate::streaming::ProgressReporter;
use crate::transport::{
    CloseCallback, ErrorCallback, MessageCallback, MessageExtra, RequestInfo, Transport,
    TransportCallbacks,
};
use crate::types::{
    Cancelled, CancelledParams, EmptyResult, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, McpError, McpNotification, McpRequest, McpResult, Ping, Progress,
    ProgressNotification, ProgressParams, ProgressToken, RequestId,
};

/// Timeout applied to outbound requests that do not set their own.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(60_000);

/// Type-erased request handler: receives the raw request, returns the raw result.
pub type RequestHandler = Arc<
    dyn Fn(JsonRpcRequest, RequestHandlerExtra) -> BoxFuture<'static, McpResult<Value>>
        + Send
        + Sync,
>;

/// Type-erased notification handler.
pub type NotificationHandler =
    Arc<dyn Fn(JsonRpcNotification) -> BoxFuture<'static, McpResult<()>> + Send + Sync>;

/// Receives progress updates for one outbound request.
pub type ProgressCallback = Arc<dyn Fn(Progress) + Send + Sync>;

/// Engine-wide behaviour switches.
#[derive(Debug, Clone)]
pub struct ProtocolOptions {
    /// Check the peer's capabilities before sending any request.
    pub enforce_strict_capabilities: bool,
    /// Parameterless notifications of these methods are coalesced.
    pub debounced_notification_methods: Vec<String>,
    /// Timeout for requests that do not set one.
    pub default_request_timeout: Duration,
}

impl Default for ProtocolOptions {
    fn default() -> Self {
        Self {
            enforce_strict_capabilities: false,
            debounced_notification_methods: Vec::new(),
            default_request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Per-call options for [`Protocol::request`].
#[derive(Clone, Default)]
pub struct RequestOptions {
    pub timeout: Option<Duration>,
    /// Hard ceiling when the timeout is reset by progress.
    pub max_total_timeout: Option<Duration>,
    pub reset_timeout_on_progress: bool,
    pub on_progress: Option<ProgressCallback>,
    pub signal: Option<AbortSignal>,
    /// The inbound request this one is issued on behalf of.
    pub related_request_id: Option<RequestId>,
}

impl RequestOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_total_timeout(mut self, max_total: Duration) -> Self {
        self.max_total_timeout = Some(max_total);
        self
    }

    pub fn reset_timeout_on_progress(mut self) -> Self {
        self.reset_timeout_on_progress = true;
        self
    }

    pub fn with_progress(mut self, callback: impl Fn(Progress) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(callback));
        self
    }

    pub fn with_signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }
}

/// Per-call options for [`Protocol::notification`].
#[derive(Debug, Clone, Default)]
pub struct NotificationOptions {
    pub related_request_id: Option<RequestId>,
}

/// Context handed to every request handler invocation.
#[derive(Clone)]
pub struct RequestHandlerExtra {
    /// Fires when the peer cancels this request.
    pub signal: AbortSignal,
    pub session_id: Option<String>,
    pub request_id: RequestId,
    /// `_meta` of the request params.
    pub meta: Option<Map<String, Value>>,
    pub auth_info: Option<Value>,
    pub request_info: Option<RequestInfo>,
    protocol: Protocol,
}

impl RequestHandlerExtra {
    /// Send a notification tied to this request.
    pub async fn send_notification<N: McpNotification>(&self, params: N::Params) -> McpResult<()> {
        self.protocol
            .notification::<N>(params, self.related_options())
            .await
    }

    pub async fn send_notification_raw(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        self.protocol
            .notification_raw(method, params, self.related_options())
            .await
    }

    /// Send a request to the peer on behalf of this request.
    pub async fn send_request<R: McpRequest>(
        &self,
        params: R::Params,
        options: RequestOptions,
    ) -> McpResult<R::Result> {
        let options = RequestOptions {
            related_request_id: Some(self.request_id.clone()),
            ..options
        };
        self.protocol.request::<R>(params, options).await
    }

    /// The progress token the caller attached, if any.
    pub fn progress_token(&self) -> Option<ProgressToken> {
        let token = self.meta.as_ref()?.get("progressToken")?;
        serde_json::from_value(token.clone()).ok()
    }

    /// A reporter for progress on this request, when the caller asked for it.
    pub fn progress_reporter(&self) -> Option<ProgressReporter> {
        let token = self.progress_token()?;
        Some(ProgressReporter::new(
            self.protocol.clone(),
            token,
            self.request_id.clone(),
        ))
    }

    fn related_options(&self) -> NotificationOptions {
        NotificationOptions {
            related_request_id: Some(self.request_id.clone()),
        }
    }
}

/// Timer bookkeeping for one outbound request.
#[derive(Debug)]
struct RequestTimer {
    started: Instant,
    timeout: Duration,
    max_total: Option<Duration>,
    reset_on_progress: bool,
    deadline: Instant,
}

impl RequestTimer {
    fn new(
        started: Instant,
        timeout: Duration,
        max_total: Option<Duration>,
        reset_on_progress: bool,
    ) -> Self {
        Self {
            started,
            timeout,
            max_total,
            reset_on_progress,
            deadline: started + timeout,
        }
    }

    /// Push the deadline out by one timeout, unless the total budget is spent.
    fn reset(&mut self, now: Instant) -> McpResult<()> {
        let elapsed = now.saturating_duration_since(self.started);
        if let Some(max_total) = self.max_total {
            if elapsed >= max_total {
                return Err(McpError::RequestTimeout {
                    message: "Maximum total timeout exceeded".to_string(),
                    data: json!({
                        "maxTotalTimeout": max_total.as_millis() as u64,
                        "totalElapsed": elapsed.as_millis() as u64,
                    }),
                });
            }
        }
        self.deadline = now + self.timeout;
        Ok(())
    }
}

struct PendingRequest {
    settle: oneshot::Sender<McpResult<Value>>,
    timer: RequestTimer,
}

#[derive(Default)]
struct EngineState {
    transport: Option<Arc<dyn Transport>>,
    next_message_id: i64,
    request_handlers: HashMap<String, RequestHandler>,
    notification_handlers: HashMap<String, NotificationHandler>,
    fallback_request_handler: Option<RequestHandler>,
    fallback_notification_handler: Option<NotificationHandler>,
    handler_aborts: HashMap<RequestId, AbortController>,
    pending: HashMap<i64, PendingRequest>,
    progress_handlers: HashMap<i64, ProgressCallback>,
    debounced_pending: HashSet<String>,
    /// Notification handlers of the current connection, run in arrival order.
    notification_queue: Option<mpsc::UnboundedSender<BoxFuture<'static, ()>>>,
}

struct Inner {
    options: ProtocolOptions,
    policy: Arc<dyn CapabilityPolicy>,
    state: Mutex<EngineState>,
    on_close: Mutex<Option<CloseCallback>>,
    on_error: Mutex<Option<ErrorCallback>>,
}

/// The JSON-RPC engine for one logical connection.
///
/// Cheap to clone; clones share the same connection state. Locks are never
/// held across an `.await` or while handler code runs.
#[derive(Clone)]
pub struct Protocol {
    inner: Arc<Inner>,
}

impl Protocol {
    /// Create an engine that allows every method.
    pub fn new(options: ProtocolOptions) -> Self {
        Self::with_policy(options, Arc::new(PermissivePolicy))
    }

    /// Create an engine gated by `policy`.
    pub fn with_policy(options: ProtocolOptions, policy: Arc<dyn CapabilityPolicy>) -> Self {
        let protocol = Self {
            inner: Arc::new(Inner {
                options,
                policy,
                state: Mutex::new(EngineState::default()),
                on_close: Mutex::new(None),
                on_error: Mutex::new(None),
            }),
        };
        protocol.install_builtin_handlers();
        protocol
    }

    fn install_builtin_handlers(&self) {
        let weak = Arc::downgrade(&self.inner);
        let cancelled: NotificationHandler = Arc::new(move |notification| {
            let outcome = match Weak::upgrade(&weak) {
                Some(inner) => Protocol { inner }.on_cancelled(notification),
                None => Ok(()),
            };
            future::ready(outcome).boxed()
        });

        let weak = Arc::downgrade(&self.inner);
        let progress: NotificationHandler = Arc::new(move |notification| {
            let outcome = match Weak::upgrade(&weak) {
                Some(inner) => decode_params::<ProgressParams>(
                    ProgressNotification::METHOD,
                    notification.params,
                )
                .map(|params| Protocol { inner }.on_progress(params)),
                None => Ok(()),
            };
            future::ready(outcome).boxed()
        });

        // Automatic pong unless overridden.
        let ping = typed_request_handler::<Ping, _, _>(|_, _| async { Ok(EmptyResult {}) });

        let mut state = self.inner.state.lock();
        state
            .notification_handlers
            .insert(Cancelled::METHOD.to_string(), cancelled);
        state
            .notification_handlers
            .insert(ProgressNotification::METHOD.to_string(), progress);
        state.request_handlers.insert(Ping::METHOD.to_string(), ping);
    }

    /// Engine options.
    pub fn options(&self) -> &ProtocolOptions {
        &self.inner.options
    }

    /// The attached transport, if connected.
    pub fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.inner.state.lock().transport.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().transport.is_some()
    }

    /// Number of outbound requests still awaiting settlement.
    pub fn pending_request_count(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Invoked once the connection closes.
    pub fn set_on_close(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self.inner.on_close.lock() = Some(Arc::new(callback));
    }

    /// Invoked for non-fatal diagnostics: unknown response ids, handler
    /// failures, failed sends.
    pub fn set_on_error(&self, callback: impl Fn(&McpError) + Send + Sync + 'static) {
        *self.inner.on_error.lock() = Some(Arc::new(callback));
    }

    /// Attach to `transport` and start it.
    ///
    /// Callbacks already installed on the transport keep firing, ahead of
    /// the engine's own.
    pub async fn connect(&self, transport: Arc<dyn Transport>) -> McpResult<()> {
        let previous = transport.callbacks();

        let engine = self.clone();
        let previous_on_message = previous.on_message.clone();
        let on_message: MessageCallback = Arc::new(move |message, extra| {
            if let Some(previous) = &previous_on_message {
                previous(message.clone(), extra.clone());
            }
            engine.handle_message(message, extra);
        });

        let engine = self.clone();
        let previous_on_error = previous.on_error.clone();
        let on_error: ErrorCallback = Arc::new(move |error: &McpError| {
            if let Some(previous) = &previous_on_error {
                previous(error);
            }
            engine.emit_error(error);
        });

        let engine = self.clone();
        let previous_on_close = previous.on_close.clone();
        let on_close: CloseCallback = Arc::new(move || {
            if let Some(previous) = &previous_on_close {
                previous();
            }
            engine.handle_close();
        });

        transport.set_callbacks(TransportCallbacks {
            on_message: Some(on_message),
            on_error: Some(on_error),
            on_close: Some(on_close),
        });
        self.inner.state.lock().transport = Some(transport.clone());

        transport.start().await
    }

    /// Close the attached transport.
    pub async fn close(&self) -> McpResult<()> {
        let transport = self.inner.state.lock().transport.clone();
        match transport {
            Some(transport) => transport.close().await,
            None => Ok(()),
        }
    }

    /// Send a typed request and decode its result.
    pub async fn request<R: McpRequest>(
        &self,
        params: R::Params,
        options: RequestOptions,
    ) -> McpResult<R::Result> {
        let params = encode_params(&params)?;
        let result = self.request_raw(R::METHOD, params, options).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Send a request and wait for its settlement.
    pub async fn request_raw(
        &self,
        method: &str,
        params: Option<Value>,
        options: RequestOptions,
    ) -> McpResult<Value> {
        let RequestOptions {
            timeout,
            max_total_timeout,
            reset_timeout_on_progress,
            on_progress,
            signal,
            related_request_id: _,
        } = options;
        let timeout = timeout.unwrap_or(self.inner.options.default_request_timeout);
        let started = Instant::now();

        let (message_id, transport, request, settle_rx) = {
            let mut state = self.inner.state.lock();
            let transport = state.transport.clone().ok_or(McpError::NotConnected)?;
            if self.inner.options.enforce_strict_capabilities {
                self.inner.policy.assert_capability_for_method(method)?;
            }
            if let Some(reason) = signal.as_ref().and_then(AbortSignal::reason) {
                return Err(McpError::Cancelled(reason));
            }

            let message_id = state.next_message_id;
            state.next_message_id += 1;

            let params = match on_progress {
                Some(callback) => {
                    state.progress_handlers.insert(message_id, callback);
                    Some(attach_progress_token(params, message_id))
                }
                None => params,
            };

            let (settle, settle_rx) = oneshot::channel();
            state.pending.insert(
                message_id,
                PendingRequest {
                    settle,
                    timer: RequestTimer::new(
                        started,
                        timeout,
                        max_total_timeout,
                        reset_timeout_on_progress,
                    ),
                },
            );
            let request = JsonRpcRequest::new(RequestId::Number(message_id), method, params);
            (message_id, transport, request, settle_rx)
        };
        let _guard = PendingGuard {
            protocol: self,
            message_id,
        };

        tracing::debug!("Sending request {message_id}: {method}");
        transport.send(JsonRpcMessage::Request(request)).await?;

        let mut settle_rx = settle_rx;
        let mut deadline = started + timeout;
        loop {
            let abort = async {
                match &signal {
                    Some(signal) => signal.aborted().await,
                    None => future::pending().await,
                }
            };

            tokio::select! {
                biased;
                settled = &mut settle_rx => {
                    return settled.unwrap_or(Err(McpError::ConnectionClosed));
                }
                reason = abort => {
                    return self
                        .cancel_outbound(message_id, reason.clone(), McpError::Cancelled(reason), settle_rx)
                        .await;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    match self.pending_deadline(message_id) {
                        Some(next) if next > deadline => deadline = next,
                        Some(_) => {
                            let error = McpError::RequestTimeout {
                                message: "Request timed out".to_string(),
                                data: json!({ "timeout": timeout.as_millis() as u64 }),
                            };
                            return self
                                .cancel_outbound(message_id, error.to_string(), error, settle_rx)
                                .await;
                        }
                        None => return settle_rx.await.unwrap_or(Err(McpError::ConnectionClosed)),
                    }
                }
            }
        }
    }

    fn pending_deadline(&self, message_id: i64) -> Option<Instant> {
        self.inner
            .state
            .lock()
            .pending
            .get(&message_id)
            .map(|pending| pending.timer.deadline)
    }

    /// Drop a pending request and tell the peer to stop working on it.
    async fn cancel_outbound(
        &self,
        message_id: i64,
        reason: String,
        error: McpError,
        settle_rx: oneshot::Receiver<McpResult<Value>>,
    ) -> McpResult<Value> {
        let (was_pending, transport) = {
            let mut state = self.inner.state.lock();
            state.progress_handlers.remove(&message_id);
            (
                state.pending.remove(&message_id).is_some(),
                state.transport.clone(),
            )
        };
        if !was_pending {
            // Settled concurrently; that outcome stands.
            return settle_rx.await.unwrap_or(Err(McpError::ConnectionClosed));
        }

        if let Some(transport) = transport {
            let params = CancelledParams {
                request_id: RequestId::Number(message_id),
                reason: Some(reason),
            };
            let notification =
                JsonRpcNotification::new(Cancelled::METHOD, serde_json::to_value(params).ok());
            if let Err(e) = transport.send(notification.into()).await {
                self.report_error(McpError::Transport(format!(
                    "Failed to send cancellation: {e}"
                )));
            }
        }
        Err(error)
    }

    /// Send a typed notification.
    pub async fn notification<N: McpNotification>(
        &self,
        params: N::Params,
        options: NotificationOptions,
    ) -> McpResult<()> {
        let params = encode_params(&params)?;
        self.notification_raw(N::METHOD, params, options).await
    }

    /// Send a one-way message after checking local capability.
    pub async fn notification_raw(
        &self,
        method: &str,
        params: Option<Value>,
        options: NotificationOptions,
    ) -> McpResult<()> {
        let transport = self
            .inner
            .state
            .lock()
            .transport
            .clone()
            .ok_or(McpError::NotConnected)?;
        self.inner.policy.assert_notification_capability(method)?;

        let can_debounce = params.is_none()
            && options.related_request_id.is_none()
            && self
                .inner
                .options
                .debounced_notification_methods
                .iter()
                .any(|m| m == method);

        if can_debounce {
            if !self
                .inner
                .state
                .lock()
                .debounced_pending
                .insert(method.to_string())
            {
                return Ok(());
            }

            let engine = self.clone();
            let method = method.to_string();
            tokio::spawn(async move {
                // Calls made before this task runs collapse into one send.
                tokio::task::yield_now().await;
                let transport = {
                    let mut state = engine.inner.state.lock();
                    state.debounced_pending.remove(&method);
                    state.transport.clone()
                };
                let Some(transport) = transport else {
                    return;
                };
                let notification = JsonRpcNotification::new(method, None);
                if let Err(e) = transport.send(notification.into()).await {
                    engine.report_error(e);
                }
            });
            return Ok(());
        }

        transport
            .send(JsonRpcNotification::new(method, params).into())
            .await
    }

    /// Register a typed request handler, replacing any previous one.
    pub fn set_request_handler<R, F, Fut>(&self, handler: F) -> McpResult<()>
    where
        R: McpRequest + 'static,
        F: Fn(R::Params, RequestHandlerExtra) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = McpResult<R::Result>> + Send + 'static,
    {
        self.set_request_handler_raw(R::METHOD, typed_request_handler::<R, F, Fut>(handler))
    }

    /// Register a raw request handler, replacing any previous one.
    pub fn set_request_handler_raw(&self, method: &str, handler: RequestHandler) -> McpResult<()> {
        self.inner.policy.assert_request_handler_capability(method)?;
        self.inner
            .state
            .lock()
            .request_handlers
            .insert(method.to_string(), handler);
        Ok(())
    }

    pub fn remove_request_handler(&self, method: &str) {
        self.inner.state.lock().request_handlers.remove(method);
    }

    /// Fail if a handler for `method` is already installed.
    pub fn assert_can_set_request_handler(&self, method: &str) -> McpResult<()> {
        if self.inner.state.lock().request_handlers.contains_key(method) {
            return Err(McpError::InvalidState(format!(
                "A request handler for {method} already exists, which would be overridden"
            )));
        }
        Ok(())
    }

    /// Register a typed notification handler, replacing any previous one.
    pub fn set_notification_handler<N, F, Fut>(&self, handler: F)
    where
        N: McpNotification + 'static,
        F: Fn(N::Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = McpResult<()>> + Send + 'static,
    {
        let erased: NotificationHandler = Arc::new(move |notification: JsonRpcNotification| {
            match decode_params::<N::Params>(N::METHOD, notification.params) {
                Ok(params) => handler(params).boxed(),
                Err(e) => future::ready(Err(e)).boxed(),
            }
        });
        self.set_notification_handler_raw(N::METHOD, erased);
    }

    pub fn set_notification_handler_raw(&self, method: &str, handler: NotificationHandler) {
        self.inner
            .state
            .lock()
            .notification_handlers
            .insert(method.to_string(), handler);
    }

    pub fn remove_notification_handler(&self, method: &str) {
        self.inner.state.lock().notification_handlers.remove(method);
    }

    /// Handles requests for methods with no registered handler.
    pub fn set_fallback_request_handler(&self, handler: RequestHandler) {
        self.inner.state.lock().fallback_request_handler = Some(handler);
    }

    /// Handles notifications for methods with no registered handler.
    pub fn set_fallback_notification_handler(&self, handler: NotificationHandler) {
        self.inner.state.lock().fallback_notification_handler = Some(handler);
    }

    fn handle_message(&self, message: JsonRpcMessage, extra: MessageExtra) {
        match message {
            JsonRpcMessage::Response(response) => {
                self.on_response(response.id, Ok(response.result));
            }
            JsonRpcMessage::Error(error) => {
                self.on_response(error.id, Err(McpError::from_error_object(error.error)));
            }
            JsonRpcMessage::Request(request) => self.on_request(request, extra),
            JsonRpcMessage::Notification(notification) => self.on_notification(notification),
        }
    }

    fn on_response(&self, id: RequestId, outcome: McpResult<Value>) {
        let pending = id.as_message_id().and_then(|message_id| {
            let mut state = self.inner.state.lock();
            let pending = state.pending.remove(&message_id)?;
            state.progress_handlers.remove(&message_id);
            Some(pending)
        });

        match pending {
            Some(pending) => {
                // The waiter may have gone away; nothing to settle then.
                let _ = pending.settle.send(outcome);
            }
            None => self.report_error(McpError::InvalidRequest(format!(
                "Received a response for an unknown message ID: {id}"
            ))),
        }
    }

    fn on_request(&self, request: JsonRpcRequest, extra: MessageExtra) {
        let controller = AbortController::new();
        let (handler, transport) = {
            let mut state = self.inner.state.lock();
            let handler = state
                .request_handlers
                .get(&request.method)
                .cloned()
                .or_else(|| state.fallback_request_handler.clone());
            if handler.is_some() {
                state
                    .handler_aborts
                    .insert(request.id.clone(), controller.clone());
            }
            (handler, state.transport.clone())
        };

        let Some(handler) = handler else {
            tracing::debug!("No handler for {}", request.method);
            let reply = McpError::MethodNotFound("Method not found".to_string())
                .to_json_rpc_error(request.id);
            let engine = self.clone();
            tokio::spawn(async move {
                let Some(transport) = transport else {
                    return;
                };
                if let Err(e) = transport.send(reply.into()).await {
                    engine.report_error(McpError::Transport(format!(
                        "Failed to send an error response: {e}"
                    )));
                }
            });
            return;
        };

        let id = request.id.clone();
        let handler_extra = RequestHandlerExtra {
            signal: controller.signal(),
            session_id: transport.as_ref().and_then(|t| t.session_id()),
            request_id: id.clone(),
            meta: request.meta().cloned(),
            auth_info: extra.auth_info,
            request_info: extra.request_info,
            protocol: self.clone(),
        };
        let invocation = handler(request, handler_extra);

        let engine = self.clone();
        tokio::spawn(async move {
            let outcome = match AssertUnwindSafe(invocation).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(_) => Err(McpError::InternalError(String::new())),
            };

            if !controller.is_aborted() {
                if let Some(transport) = transport {
                    let reply: JsonRpcMessage = match outcome {
                        Ok(result) => JsonRpcResponse::new(id.clone(), result).into(),
                        Err(error) => {
                            tracing::debug!("Request {id} failed: {error}");
                            error.to_json_rpc_error(id.clone()).into()
                        }
                    };
                    if let Err(e) = transport.send(reply).await {
                        engine.report_error(McpError::Transport(format!(
                            "Failed to send response: {e}"
                        )));
                    }
                }
            }

            engine.inner.state.lock().handler_aborts.remove(&id);
        });
    }

    fn on_notification(&self, notification: JsonRpcNotification) {
        let handler = {
            let state = self.inner.state.lock();
            state
                .notification_handlers
                .get(&notification.method)
                .cloned()
                .or_else(|| state.fallback_notification_handler.clone())
        };
        let Some(handler) = handler else {
            return;
        };

        let invocation = handler(notification);
        let engine = self.clone();
        self.enqueue_notification(
            async move {
                let outcome = match AssertUnwindSafe(invocation).catch_unwind().await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(McpError::InternalError("handler panicked".to_string())),
                };
                if let Err(error) = outcome {
                    engine.report_error(McpError::InternalError(format!(
                        "Uncaught error in notification handler: {error}"
                    )));
                }
            }
            .boxed(),
        );
    }

    /// Queue a notification handler behind the ones already received.
    ///
    /// A single task per connection drains the queue, so handlers run one
    /// at a time in the order their notifications arrived.
    fn enqueue_notification(&self, job: BoxFuture<'static, ()>) {
        let mut state = self.inner.state.lock();
        let job = match &state.notification_queue {
            Some(queue) => match queue.send(job) {
                Ok(()) => return,
                Err(mpsc::error::SendError(job)) => job,
            },
            None => job,
        };

        let (queue, mut jobs) = mpsc::unbounded_channel::<BoxFuture<'static, ()>>();
        tokio::spawn(async move {
            while let Some(job) = jobs.recv().await {
                job.await;
            }
        });
        if queue.send(job).is_err() {
            tracing::debug!("Notification queue closed before its first job");
        }
        state.notification_queue = Some(queue);
    }

    fn on_cancelled(&self, notification: JsonRpcNotification) -> McpResult<()> {
        let params: CancelledParams = decode_params(Cancelled::METHOD, notification.params)?;
        let controller = self
            .inner
            .state
            .lock()
            .handler_aborts
            .get(&params.request_id)
            .cloned();
        if let Some(controller) = controller {
            tracing::debug!("Peer cancelled request {}", params.request_id);
            controller.abort(
                params
                    .reason
                    .unwrap_or_else(|| "Request cancelled by peer".to_string()),
            );
        }
        Ok(())
    }

    fn on_progress(&self, params: ProgressParams) {
        let Some(message_id) = params.progress_token.as_message_id() else {
            self.report_unknown_progress(&params);
            return;
        };

        let handler = {
            let mut state = self.inner.state.lock();
            let Some(handler) = state.progress_handlers.get(&message_id).cloned() else {
                drop(state);
                self.report_unknown_progress(&params);
                return;
            };

            let expired = match state.pending.get_mut(&message_id) {
                Some(pending) if pending.timer.reset_on_progress => {
                    pending.timer.reset(Instant::now()).err()
                }
                _ => None,
            };
            if let Some(error) = expired {
                state.progress_handlers.remove(&message_id);
                if let Some(pending) = state.pending.remove(&message_id) {
                    let _ = pending.settle.send(Err(error));
                }
                return;
            }
            handler
        };

        handler(Progress::from(params));
    }

    fn report_unknown_progress(&self, params: &ProgressParams) {
        self.report_error(McpError::InvalidParams(format!(
            "Received a progress notification for an unknown token: {}",
            serde_json::to_string(params).unwrap_or_default()
        )));
    }

    fn handle_close(&self) {
        let pending = {
            let mut state = self.inner.state.lock();
            state.progress_handlers.clear();
            state.debounced_pending.clear();
            // Handlers already queued still run; the drain task then exits.
            state.notification_queue = None;
            state.transport = None;
            std::mem::take(&mut state.pending)
        };

        let callback = self.inner.on_close.lock().clone();
        if let Some(callback) = callback {
            callback();
        }

        if !pending.is_empty() {
            tracing::debug!(
                "Connection closed with {} pending request(s)",
                pending.len()
            );
        }
        for (_, request) in pending {
            let _ = request.settle.send(Err(McpError::ConnectionClosed));
        }
    }

    fn report_error(&self, error: McpError) {
        self.emit_error(&error);
    }

    fn emit_error(&self, error: &McpError) {
        tracing::warn!("{error}");
        let callback = self.inner.on_error.lock().clone();
        if let Some(callback) = callback {
            callback(error);
        }
    }
}

/// Removes the pending record if the request future is dropped early.
struct PendingGuard<'a> {
    protocol: &'a Protocol,
    message_id: i64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.protocol.inner.state.lock();
        state.pending.remove(&self.message_id);
        state.progress_handlers.remove(&self.message_id);
    }
}

fn typed_request_handler<R, F, Fut>(handler: F) -> RequestHandler
where
    R: McpRequest + 'static,
    F: Fn(R::Params, RequestHandlerExtra) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = McpResult<R::Result>> + Send + 'static,
{
    Arc::new(move |request: JsonRpcRequest, extra| {
        match decode_params::<R::Params>(R::METHOD, request.params) {
            Ok(params) => {
                let invocation = handler(params, extra);
                async move {
                    let result = invocation.await?;
                    Ok(serde_json::to_value(result)?)
                }
                .boxed()
            }
            Err(e) => future::ready(Err(e)).boxed(),
        }
    })
}

fn decode_params<P: DeserializeOwned>(method: &str, params: Option<Value>) -> McpResult<P> {
    let value = params.unwrap_or_else(|| Value::Object(Map::new()));
    serde_json::from_value(value)
        .map_err(|e| McpError::InvalidParams(format!("Invalid params for {method}: {e}")))
}

/// Serialize params, omitting them entirely when empty.
fn encode_params<P: Serialize>(params: &P) -> McpResult<Option<Value>> {
    Ok(match serde_json::to_value(params)? {
        Value::Null => None,
        Value::Object(map) if map.is_empty() => None,
        value => Some(value),
    })
}

fn attach_progress_token(params: Option<Value>, message_id: i64) -> Value {
    let mut object = match params {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };
    let meta = object
        .entry("_meta")
        .or_insert_with(|| Value::Object(Map::new()));
    if !meta.is_object() {
        *meta = Value::Object(Map::new());
    }
    if let Value::Object(meta) = meta {
        meta.insert("progressToken".to_string(), json!(message_id));
    }
    Value::Object(object)
}
