use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;

use crate::session::types::{SessionDeletion, SessionId};

/// The durable existence table: which session ids have ever been created
/// and not yet cleaned up. Content is never persisted here; durability of
/// payloads is the replication protocol's job.
///
/// The SQL-backed implementation lives outside this crate; nodes run the
/// in-memory variant unless a store collaborator is wired in.
#[async_trait]
pub trait ExistenceStore: Send + Sync {
    async fn create_sessions(&self, session_ids: &[SessionId]) -> Result<()>;

    async fn exists(&self, session_id: SessionId) -> Result<bool>;

    async fn delete_sessions(&self, deletions: &[SessionDeletion]) -> Result<()>;
}

pub struct InMemoryExistenceStore {
    sessions: DashMap<SessionId, ()>,
    deletes: AtomicUsize,
}

impl InMemoryExistenceStore {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            deletes: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Total deletion events applied, counting repeats. Stats surface for
    /// operators and tests.
    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::Relaxed)
    }
}

impl Default for InMemoryExistenceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExistenceStore for InMemoryExistenceStore {
    async fn create_sessions(&self, session_ids: &[SessionId]) -> Result<()> {
        for id in session_ids {
            self.sessions.insert(*id, ());
        }
        Ok(())
    }

    async fn exists(&self, session_id: SessionId) -> Result<bool> {
        Ok(self.sessions.contains_key(&session_id))
    }

    async fn delete_sessions(&self, deletions: &[SessionDeletion]) -> Result<()> {
        for deletion in deletions {
            self.sessions.remove(&deletion.session_id);
            self.deletes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}
