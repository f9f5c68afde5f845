//! Persistence seam for session snapshots.
//!
//! The engine never persists anything itself; an external collaborator
//! implements `SessionPersistence`. The in-memory implementation exists for
//! tests and as a reference for the listing semantics.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::session::Session;

/// A persisted view of one session, keyed by session id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    /// Display name; the problem statement the session works on.
    pub name: String,
    pub technique: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub session: Session,
}

impl SessionSnapshot {
    pub fn from_session(session: &Session) -> Self {
        Self {
            session_id: session.id.clone(),
            name: session.problem.clone(),
            technique: session.technique.clone(),
            created_at: session.started_at,
            updated_at: session.last_activity,
            session: session.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortBy {
    #[default]
    Created,
    Updated,
    Name,
    Technique,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ListOptions {
    pub limit: Option<usize>,
    pub offset: usize,
    pub sort_by: SortBy,
    pub order: SortOrder,
}

/// Snapshot storage owned by an external collaborator.
#[async_trait]
pub trait SessionPersistence: Send + Sync {
    async fn save(&self, snapshot: SessionSnapshot) -> Result<()>;

    async fn load(&self, session_id: &str) -> Result<Option<SessionSnapshot>>;

    async fn delete(&self, session_id: &str) -> Result<bool>;

    async fn list(&self, options: &ListOptions) -> Result<Vec<SessionSnapshot>>;
}

/// Reference implementation backing tests.
#[derive(Default)]
pub struct InMemoryPersistence {
    snapshots: RwLock<HashMap<String, SessionSnapshot>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionPersistence for InMemoryPersistence {
    async fn save(&self, snapshot: SessionSnapshot) -> Result<()> {
        self.snapshots
            .write()
            .insert(snapshot.session_id.clone(), snapshot);
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Option<SessionSnapshot>> {
        Ok(self.snapshots.read().get(session_id).cloned())
    }

    async fn delete(&self, session_id: &str) -> Result<bool> {
        Ok(self.snapshots.write().remove(session_id).is_some())
    }

    async fn list(&self, options: &ListOptions) -> Result<Vec<SessionSnapshot>> {
        let mut snapshots: Vec<SessionSnapshot> =
            self.snapshots.read().values().cloned().collect();

        snapshots.sort_by(|a, b| {
            let ordering = match options.sort_by {
                SortBy::Created => a.created_at.cmp(&b.created_at),
                SortBy::Updated => a.updated_at.cmp(&b.updated_at),
                SortBy::Name => a.name.cmp(&b.name),
                SortBy::Technique => a.technique.cmp(&b.technique),
            };
            match options.order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            }
        });

        let listed = snapshots
            .into_iter()
            .skip(options.offset)
            .take(options.limit.unwrap_or(usize::MAX))
            .collect();
        Ok(listed)
    }
}
