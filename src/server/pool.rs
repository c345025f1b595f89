//! Registry of live sessions, keyed by session id.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::session::Session;
use crate::error::{Result, TunnelError};
use crate::protocol::SessionId;

#[derive(Default)]
pub struct SessionPool {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
}

impl SessionPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Register a session. An id that is already taken is rejected and the
    /// new session is closed instead of replacing the existing one.
    pub async fn add(&self, session: Arc<Session>) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(session.id()) {
            warn!("Refusing to register duplicate session {}", session.id());
            session.close();
            return Err(TunnelError::DuplicateSession(session.id().clone()));
        }
        sessions.insert(session.id().clone(), session);
        Ok(())
    }

    /// Remove a session and signal it to close. Removing an absent id is a no-op.
    pub async fn remove(&self, id: &SessionId) -> Option<Arc<Session>> {
        let removed = self.sessions.write().await.remove(id);
        if let Some(session) = &removed {
            debug!("Session {} to {} removed", id, session.host());
            session.close();
        }
        removed
    }

    /// Remove every session the client has not pushed to or polled within
    /// `max_idle`, returning their ids.
    pub async fn remove_idle(&self, max_idle: Duration) -> Vec<SessionId> {
        let idle: Vec<SessionId> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|session| session.idle_for() > max_idle)
            .map(|session| session.id().clone())
            .collect();

        for id in &idle {
            self.remove(id).await;
        }
        idle
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    #[cfg(test)]
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
