//! Shared helpers for the integration tests.
#![allow(dead_code)]

pub mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;

use monologue_mcp::protocol::Protocol;
use monologue_mcp::server::Server;
use monologue_mcp::transport::{InMemoryTransport, Transport, TransportCallbacks};
use monologue_mcp::types::JsonRpcMessage;

/// The far end of an in-memory pair, driven by hand with raw JSON.
pub struct RawPeer {
    pub transport: Arc<InMemoryTransport>,
    inbox: mpsc::UnboundedReceiver<JsonRpcMessage>,
}

impl RawPeer {
    /// Link a raw peer to `protocol` and start both ends.
    pub async fn connect(protocol: &Protocol) -> Self {
        let (ours, theirs) = InMemoryTransport::create_linked_pair();
        let peer = Self::attach(ours).await;
        protocol.connect(theirs).await.expect("connect engine");
        peer
    }

    /// Link a raw peer to `server` and start both ends.
    pub async fn connect_server(server: &Server) -> Self {
        Self::connect_server_with_session(server, None).await
    }

    /// Like [`connect_server`](Self::connect_server), with the server's end
    /// reporting `session_id`.
    pub async fn connect_server_with_session(server: &Server, session_id: Option<&str>) -> Self {
        let (ours, theirs) = match session_id {
            Some(id) => InMemoryTransport::create_linked_pair_with_session(id),
            None => InMemoryTransport::create_linked_pair(),
        };
        let peer = Self::attach(ours).await;
        server.connect(theirs).await.expect("connect server");
        peer
    }

    async fn attach(transport: Arc<InMemoryTransport>) -> Self {
        let (tx, inbox) = mpsc::unbounded_channel();
        transport.set_callbacks(TransportCallbacks {
            on_message: Some(Arc::new(move |message, _extra| {
                let _ = tx.send(message);
            })),
            ..TransportCallbacks::default()
        });
        transport.start().await.expect("start raw peer");
        Self { transport, inbox }
    }

    /// Send one raw JSON message.
    pub async fn send(&self, value: Value) {
        let message = JsonRpcMessage::classify(value).expect("valid message");
        self.transport.send(message).await.expect("send");
    }

    /// Next message, failing after one second.
    pub async fn recv(&mut self) -> JsonRpcMessage {
        tokio::time::timeout(Duration::from_secs(1), self.inbox.recv())
            .await
            .expect("timed out waiting for a message")
            .expect("peer channel closed")
    }

    /// Next message as JSON.
    pub async fn recv_value(&mut self) -> Value {
        serde_json::to_value(self.recv().await).expect("serialize")
    }

    /// A message that has already arrived, if any.
    pub fn try_recv(&mut self) -> Option<JsonRpcMessage> {
        self.inbox.try_recv().ok()
    }

    /// Let spawned handler tasks run.
    pub async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    /// Send a request and wait for the reply with the same id.
    pub async fn call(&mut self, id: i64, method: &str, params: Value) -> Value {
        self.send(serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        }))
        .await;
        loop {
            let reply = self.recv_value().await;
            if reply["id"] == id && reply.get("method").is_none() {
                return reply;
            }
        }
    }
}
