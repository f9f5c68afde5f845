//! Session registry with TTL eviction and capacity policy.
//!
//! All session mutation flows through the per-id lock; the background
//! cleanup path uses non-blocking acquisition and never waits on an active
//! session.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use super::lock::SessionLocks;
use super::{
    validate_session_id, ParallelGroup, ParallelMeta, Session, generate_session_id,
};
use crate::config::SessionStoreConfig;
use crate::error::{EngineError, Result};

/// Caller-supplied fields for a new session.
#[derive(Debug, Clone, Default)]
pub struct SessionData {
    pub technique: String,
    pub problem: String,
    pub parallel_group: Option<String>,
    pub depends_on: Vec<String>,
    pub parallel_meta: Option<ParallelMeta>,
}

impl SessionData {
    pub fn new(technique: impl Into<String>, problem: impl Into<String>) -> Self {
        Self {
            technique: technique.into(),
            problem: problem.into(),
            ..Self::default()
        }
    }

    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.parallel_group = Some(group_id.into());
        self
    }

    pub fn with_dependencies(mut self, depends_on: Vec<String>) -> Self {
        self.depends_on = depends_on;
        self
    }

    pub fn with_parallel_meta(mut self, meta: ParallelMeta) -> Self {
        self.parallel_meta = Some(meta);
        self
    }
}

/// Registry of sessions and parallel groups.
pub struct SessionStore {
    config: SessionStoreConfig,
    sessions: RwLock<HashMap<String, Session>>,
    groups: RwLock<HashMap<String, ParallelGroup>>,
    locks: SessionLocks,
}

impl SessionStore {
    pub fn new(config: SessionStoreConfig) -> Self {
        Self {
            config,
            sessions: RwLock::new(HashMap::new()),
            groups: RwLock::new(HashMap::new()),
            locks: SessionLocks::new(),
        }
    }

    pub fn locks(&self) -> &SessionLocks {
        &self.locks
    }

    pub fn config(&self) -> &SessionStoreConfig {
        &self.config
    }

    // === Session CRUD ===

    /// Create a session, generating an id when none is supplied.
    ///
    /// At capacity, TTL-expired sessions are evicted first; if the store is
    /// still full the call fails with a resource-exhausted error.
    pub fn create_session(&self, data: SessionData, id: Option<String>) -> Result<Session> {
        let id = match id {
            Some(id) => {
                validate_session_id(&id)?;
                id
            }
            None => generate_session_id(),
        };

        if self.sessions.read().contains_key(&id) {
            return Err(EngineError::session_exists(&id));
        }

        if self.len() >= self.config.max_sessions {
            let evicted = self.evict_expired();
            debug!(evicted = evicted.len(), "eviction before create");
            if self.len() >= self.config.max_sessions {
                return Err(EngineError::sessions_exhausted(self.config.max_sessions));
            }
        } else if self.under_pressure() {
            let evicted = self.evict_expired();
            if !evicted.is_empty() {
                debug!(evicted = evicted.len(), "proactive eviction under pressure");
            }
        }

        let mut session = Session::new(id.clone(), data.technique, data.problem);
        session.parallel_group = data.parallel_group;
        session.depends_on = data.depends_on;
        session.parallel_meta = data.parallel_meta;

        let mut sessions = self.sessions.write();
        // Re-check under the write lock; another creator may have won.
        if sessions.contains_key(&id) {
            return Err(EngineError::session_exists(&id));
        }
        sessions.insert(id, session.clone());
        Ok(session)
    }

    pub fn get_session(&self, id: &str) -> Option<Session> {
        self.sessions.read().get(id).cloned()
    }

    pub fn delete_session(&self, id: &str) -> bool {
        self.sessions.write().remove(id).is_some()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.read().contains_key(id)
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

    /// Find the session driving `technique` for a given plan.
    pub fn find_by_plan(&self, plan_id: &str, technique: &str) -> Option<Session> {
        self.sessions
            .read()
            .values()
            .find(|s| {
                s.technique == technique
                    && s.parallel_meta
                        .as_ref()
                        .is_some_and(|m| m.plan_id == plan_id)
            })
            .cloned()
    }

    /// Mutate a session under its lock. Waits behind earlier updaters.
    pub async fn update_session<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut Session) -> Result<T>,
    ) -> Result<T> {
        let _guard = self.locks.acquire(id).await?;
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| EngineError::session_not_found(id))?;
        let result = f(session)?;

        if session.approx_bytes() > self.config.max_session_bytes {
            // Oldest step records go first; the session itself survives.
            while session.approx_bytes() > self.config.max_session_bytes
                && session.history.len() > 1
            {
                session.history.remove(0);
            }
            debug!(session_id = %id, "trimmed oversized session history");
        }
        Ok(result)
    }

    /// Refresh a session's activity timestamp under its lock.
    pub async fn touch_session(&self, id: &str) -> Result<()> {
        let _guard = self.locks.acquire(id).await?;
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| EngineError::session_not_found(id))?;
        session.touch();
        Ok(())
    }

    /// Best-effort touch for the cleanup path. Never blocks on the lock;
    /// failures are swallowed.
    pub fn try_touch_session(&self, id: &str) {
        let Some(_guard) = self.locks.try_acquire(id) else {
            trace!(session_id = %id, "skipping touch, session busy");
            return;
        };
        if let Some(session) = self.sessions.write().get_mut(id) {
            session.touch();
        }
    }

    // === Eviction ===

    /// Whether the live-session count crossed the pressure threshold.
    pub fn under_pressure(&self) -> bool {
        self.config.memory_monitoring && self.len() >= self.config.pressure_limit()
    }

    /// Evict sessions idle longer than the TTL. Sessions whose lock is held
    /// are busy and skipped. Returns the evicted ids; idempotent.
    pub fn evict_expired(&self) -> Vec<String> {
        let ttl = chrono::Duration::from_std(self.config.session_ttl())
            .unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 1000));
        let now = Utc::now();

        let expired: Vec<String> = self
            .sessions
            .read()
            .values()
            .filter(|s| s.idle_since(now) > ttl)
            .map(|s| s.id.clone())
            .collect();

        let mut evicted = Vec::new();
        for id in expired {
            let Some(_guard) = self.locks.try_acquire(&id) else {
                trace!(session_id = %id, "expired session busy, skipping eviction");
                continue;
            };
            if self.sessions.write().remove(&id).is_some() {
                evicted.push(id);
            }
        }

        if !evicted.is_empty() {
            info!(count = evicted.len(), "evicted expired sessions");
        }
        evicted
    }

    /// Spawn the periodic cleanup task. The caller owns the handle and must
    /// abort it on shutdown.
    ///
    /// Members of still-running groups get a best-effort touch each pass so
    /// a slow sibling cannot age them out from under an active group.
    pub fn spawn_cleanup(self: &Arc<Self>) -> JoinHandle<()> {
        let store = Arc::clone(self);
        let interval = store.config.cleanup_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                for group_id in store.group_ids() {
                    if let Some(group) = store.get_group(&group_id)
                        && !group.status.is_terminal()
                    {
                        for member in &group.members {
                            store.try_touch_session(member);
                        }
                    }
                }
                store.evict_expired();
            }
        })
    }

    // === Parallel groups ===

    pub fn insert_group(&self, group: ParallelGroup) {
        self.groups.write().insert(group.id.clone(), group);
    }

    pub fn get_group(&self, id: &str) -> Option<ParallelGroup> {
        self.groups.read().get(id).cloned()
    }

    pub fn delete_group(&self, id: &str) -> bool {
        self.groups.write().remove(id).is_some()
    }

    pub fn update_group<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut ParallelGroup) -> Result<T>,
    ) -> Result<T> {
        let mut groups = self.groups.write();
        let group = groups
            .get_mut(id)
            .ok_or_else(|| EngineError::group_not_found(id))?;
        f(group)
    }

    pub fn group_ids(&self) -> Vec<String> {
        self.groups.read().keys().cloned().collect()
    }
}
