//! Process-wide lookup from session id to the live [`TransportSession`].
//!
//! The registry is the single source of truth for "is this session alive":
//! a delivery for an id it does not know is answered with 404 and never
//! reaches any stream.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{SessionId, TransportSession};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("session {0} is already registered")]
    DuplicateSession(SessionId),
    #[error("session {0} not found")]
    NotFound(SessionId),
}

/// Storage for live sessions.
///
/// Implementations must not await I/O while holding their internal lock.
#[async_trait]
pub trait SessionRegistry: Send + Sync + 'static {
    /// Insert a session; an id that is already live is rejected.
    async fn register(&self, session: Arc<TransportSession>) -> Result<(), RegistryError>;

    async fn resolve(&self, id: &str) -> Result<Arc<TransportSession>, RegistryError>;

    /// Remove a session. Removing an unknown id is a no-op.
    async fn unregister(&self, id: &str);

    /// Number of live sessions.
    async fn len(&self) -> usize;

    async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Remove and return every live session.
    async fn drain(&self) -> Vec<Arc<TransportSession>>;
}

/// The in-memory registry used by a single server process.
#[derive(Default)]
pub struct LocalSessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<TransportSession>>>,
}

impl LocalSessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionRegistry for LocalSessionRegistry {
    async fn register(&self, session: Arc<TransportSession>) -> Result<(), RegistryError> {
        let mut sessions = self.sessions.write().await;
        let id = session.id().clone();
        if sessions.contains_key(&id) {
            return Err(RegistryError::DuplicateSession(id));
        }
        sessions.insert(id, session);
        Ok(())
    }

    async fn resolve(&self, id: &str) -> Result<Arc<TransportSession>, RegistryError> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.into()))
    }

    async fn unregister(&self, id: &str) {
        if self.sessions.write().await.remove(id).is_some() {
            tracing::debug!(session_id = id, "session unregistered");
        }
    }

    async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn drain(&self) -> Vec<Arc<TransportSession>> {
        self.sessions
            .write()
            .await
            .drain()
            .map(|(_, session)| session)
            .collect()
    }
}
