//! Live SSE sessions, keyed by the session id handed out in the endpoint
//! frame.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::server::Server;
use crate::transport::SseServerTransport;

/// One connected client: its transport and the server answering it.
#[derive(Clone)]
pub struct Session {
    pub transport: Arc<SseServerTransport>,
    pub server: Server,
}

/// Routes POSTed messages to the session that owns them.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Session) {
        let id = session.transport.session_id().to_string();
        tracing::info!("Session {id} opened");
        self.sessions.write().insert(id, session);
    }

    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.sessions.read().get(session_id).cloned()
    }

    pub fn remove(&self, session_id: &str) -> Option<Session> {
        let removed = self.sessions.write().remove(session_id);
        if removed.is_some() {
            tracing::info!("Session {session_id} removed");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.read().keys().cloned().collect()
    }
}
