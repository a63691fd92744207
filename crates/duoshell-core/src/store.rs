use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use duoshell_types::{TerminalError, TerminalResult};

use crate::session::TerminalSession;
use crate::state::TerminalStateManager;

/// Explicit handle to all live sessions and their shared state manager
#[derive(Clone, Default)]
pub struct SessionStore {
    sessions: Arc<RwLock<HashMap<String, Arc<TerminalSession>>>>,
    states: Arc<TerminalStateManager>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn states(&self) -> Arc<TerminalStateManager> {
        Arc::clone(&self.states)
    }

    pub async fn get(&self, name: &str) -> TerminalResult<Arc<TerminalSession>> {
        self.sessions
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| TerminalError::SessionNotFound(name.to_string()))
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.sessions.read().await.contains_key(name)
    }

    /// Insert a session unless one with the same name already exists.
    ///
    /// Returns the session now stored under the name and whether it is the
    /// one passed in.
    pub async fn insert_if_absent(
        &self,
        session: Arc<TerminalSession>,
    ) -> (Arc<TerminalSession>, bool) {
        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(session.name()) {
            return (Arc::clone(existing), false);
        }
        sessions.insert(session.name().to_string(), Arc::clone(&session));
        (session, true)
    }

    pub async fn remove(&self, name: &str) -> Option<Arc<TerminalSession>> {
        self.sessions.write().await.remove(name)
    }

    /// All sessions, ordered by name
    pub async fn list(&self) -> Vec<Arc<TerminalSession>> {
        let mut sessions: Vec<_> = self.sessions.read().await.values().cloned().collect();
        sessions.sort_by(|a, b| a.name().cmp(b.name()));
        sessions
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
