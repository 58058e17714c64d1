//! In-process transport pair, used for embedding and tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{CallbackSlot, MessageExtra, Transport, TransportCallbacks};
use crate::types::{JsonRpcMessage, McpError, McpResult};

/// One end of a linked in-memory transport pair.
///
/// Messages sent before the peer has started are queued and delivered when
/// it starts. Closing either end closes both.
pub struct InMemoryTransport {
    peer: Mutex<Option<Weak<InMemoryTransport>>>,
    queue: Mutex<Vec<JsonRpcMessage>>,
    callbacks: CallbackSlot,
    started: AtomicBool,
    closed: AtomicBool,
    session_id: Option<String>,
}

impl InMemoryTransport {
    /// Create two transports wired to each other.
    pub fn create_linked_pair() -> (Arc<Self>, Arc<Self>) {
        let a = Arc::new(Self::unlinked(None));
        let b = Arc::new(Self::unlinked(None));
        *a.peer.lock() = Some(Arc::downgrade(&b));
        *b.peer.lock() = Some(Arc::downgrade(&a));
        (a, b)
    }

    /// Like [`create_linked_pair`](Self::create_linked_pair), but the second
    /// end reports `session_id` as its session.
    pub fn create_linked_pair_with_session(session_id: &str) -> (Arc<Self>, Arc<Self>) {
        let a = Arc::new(Self::unlinked(None));
        let b = Arc::new(Self::unlinked(Some(session_id.to_string())));
        *a.peer.lock() = Some(Arc::downgrade(&b));
        *b.peer.lock() = Some(Arc::downgrade(&a));
        (a, b)
    }

    fn unlinked(session_id: Option<String>) -> Self {
        Self {
            peer: Mutex::new(None),
            queue: Mutex::new(Vec::new()),
            callbacks: CallbackSlot::default(),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            session_id,
        }
    }

    fn receive(&self, message: JsonRpcMessage) {
        {
            let mut queue = self.queue.lock();
            if !self.started.load(Ordering::SeqCst) {
                queue.push(message);
                return;
            }
        }
        self.callbacks.emit_message(message, MessageExtra::default());
    }

    /// Whether this end has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn start(&self) -> McpResult<()> {
        let queued = {
            let mut queue = self.queue.lock();
            if self.started.swap(true, Ordering::SeqCst) {
                return Err(McpError::InvalidState(
                    "In-memory transport already started".to_string(),
                ));
            }
            std::mem::take(&mut *queue)
        };
        for message in queued {
            self.callbacks.emit_message(message, MessageExtra::default());
        }
        Ok(())
    }

    async fn send(&self, message: JsonRpcMessage) -> McpResult<()> {
        if self.is_closed() {
            return Err(McpError::NotConnected);
        }
        let peer = self.peer.lock().as_ref().and_then(Weak::upgrade);
        match peer {
            Some(peer) => {
                peer.receive(message);
                Ok(())
            }
            None => Err(McpError::NotConnected),
        }
    }

    async fn close(&self) -> McpResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let peer = self.peer.lock().take().and_then(|weak| weak.upgrade());
        self.callbacks.emit_close();
        if let Some(peer) = peer {
            peer.close().await?;
        }
        Ok(())
    }

    fn session_id(&self) -> Option<String> {
        self.session_id.clone()
    }

    fn callbacks(&self) -> TransportCallbacks {
        self.callbacks.get()
    }

    fn set_callbacks(&self, callbacks: TransportCallbacks) {
        self.callbacks.set(callbacks);
    }
}
