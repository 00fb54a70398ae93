//! Session issuance and lifecycle.
//!
//! A session is an opaque, collision-free identifier plus a cancellation
//! token derived from the application root. Sessions are created by
//! `initialize` and live until explicitly discarded.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Pluggable persistence for sessions.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create a new session and return its ID.
    async fn issue(&self) -> Result<String>;

    /// Return a child cancellation token scoped to the session.
    async fn context(&self, session_id: &str) -> Result<CancellationToken>;

    /// Remove the session, cancelling its token.
    async fn delete(&self, session_id: &str) -> Result<()>;
}

/// In-memory session store.
///
/// NOTE: only suitable for a single-process deployment.
pub struct InMemorySessionStore {
    root: CancellationToken,
    sessions: RwLock<HashMap<String, CancellationToken>>,
}

impl InMemorySessionStore {
    pub fn new(root: CancellationToken) -> Self {
        Self {
            root,
            sessions: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn issue(&self) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let token = self.root.child_token();
        self.sessions.write().await.insert(id.clone(), token);
        debug!(session_id = %id, "session issued");
        Ok(id)
    }

    async fn context(&self, session_id: &str) -> Result<CancellationToken> {
        let sessions = self.sessions.read().await;
        let token = sessions
            .get(session_id)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
        Ok(token.child_token())
    }

    async fn delete(&self, session_id: &str) -> Result<()> {
        if let Some(token) = self.sessions.write().await.remove(session_id) {
            token.cancel();
            debug!(session_id = %session_id, "session discarded");
        }
        Ok(())
    }
}

/// Issues and retires sessions through a [`SessionStore`].
#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    pub fn in_memory(root: CancellationToken) -> Self {
        Self::new(Arc::new(InMemorySessionStore::new(root)))
    }

    /// Start a session, returning its ID.
    pub async fn start(&self) -> Result<String> {
        self.store.issue().await
    }

    /// A session-scoped cancellation token; errors for unknown IDs.
    pub async fn context(&self, session_id: &str) -> Result<CancellationToken> {
        self.store.context(session_id).await
    }

    /// Discard a session, cancelling everything scoped to it.
    pub async fn discard(&self, session_id: &str) -> Result<()> {
        self.store.delete(session_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn context_is_live_until_discard() {
        let manager = SessionManager::in_memory(CancellationToken::new());
        let id = manager.start().await.unwrap();

        let token = manager.context(&id).await.unwrap();
        assert!(!token.is_cancelled());

        manager.discard(&id).await.unwrap();
        assert!(token.is_cancelled());
        assert!(manager.context(&id).await.is_err());
    }

    #[tokio::test]
    async fn unknown_session_errors() {
        let manager = SessionManager::in_memory(CancellationToken::new());
        let err = manager.context("missing").await.unwrap_err();
        assert_eq!(err.jsonrpc_code(), -32001);
    }

    #[tokio::test]
    async fn session_ids_are_unique() {
        let manager = SessionManager::in_memory(CancellationToken::new());
        let a = manager.start().await.unwrap();
        let b = manager.start().await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn root_cancellation_reaches_every_session() {
        let root = CancellationToken::new();
        let manager = SessionManager::in_memory(root.clone());
        let id = manager.start().await.unwrap();
        let token = manager.context(&id).await.unwrap();

        root.cancel();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn discard_is_idempotent() {
        let manager = SessionManager::in_memory(CancellationToken::new());
        let id = manager.start().await.unwrap();
        manager.discard(&id).await.unwrap();
        manager.discard(&id).await.unwrap();
    }
}
