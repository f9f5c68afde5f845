//! Progress aggregation across sessions and parallel groups.
//!
//! Updates for one session are serialized through a per-key queue so
//! interleaved reports never produce torn state; every accepted update is
//! re-emitted on the event bus, where global, per-group, and per-session
//! subscribers each see their slice.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::Result;
use crate::events::{EngineEvent, EventBus};
use crate::session::{GroupStatus, SessionStore};

/// Step durations kept per session for pacing estimates.
const STEP_WINDOW_SIZE: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Started,
    InProgress,
    Completed,
    Failed,
    Waiting,
}

impl ProgressStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Started | Self::InProgress)
    }
}

/// A session's latest reported state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub session_id: String,
    pub status: ProgressStatus,
    pub current_step: u32,
    pub total_steps: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Unfinished dependencies, present while waiting.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub waiting_on: Vec<String>,
}

impl ProgressRecord {
    pub fn new(
        session_id: impl Into<String>,
        status: ProgressStatus,
        current_step: u32,
        total_steps: u32,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            status,
            current_step,
            total_steps,
            timestamp: Utc::now(),
            message: None,
            waiting_on: Vec::new(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_waiting_on(mut self, waiting_on: Vec<String>) -> Self {
        self.waiting_on = waiting_on;
        self
    }
}

/// Aggregated view over one parallel group.
#[derive(Debug, Clone)]
pub struct GroupProgress {
    pub group_id: String,
    pub sessions: HashMap<String, ProgressRecord>,
    pub started: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub waiting: usize,
    /// 0.0..=1.0 across all member sessions.
    pub overall: f64,
    pub estimated_remaining: Option<Duration>,
}

struct StepWindow {
    last_report: Instant,
    durations: VecDeque<Duration>,
}

/// Aggregates per-session progress into group-level summaries and detects
/// group completion and deadlock.
pub struct ProgressCoordinator {
    store: Arc<SessionStore>,
    bus: Arc<EventBus>,
    records: DashMap<String, ProgressRecord>,
    update_queues: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    step_windows: DashMap<String, StepWindow>,
    /// Groups whose completion event already fired.
    completed_groups: DashMap<String, ()>,
    cleanup_handles: DashMap<String, JoinHandle<()>>,
    retention: Duration,
    /// Invoked when a group's retention elapses, so sibling components
    /// (shared context, timers) release their state too.
    cleanup_hook: Option<Box<dyn Fn(&str) + Send + Sync>>,
}

impl ProgressCoordinator {
    pub fn new(store: Arc<SessionStore>, bus: Arc<EventBus>, retention: Duration) -> Self {
        Self {
            store,
            bus,
            records: DashMap::new(),
            update_queues: DashMap::new(),
            step_windows: DashMap::new(),
            completed_groups: DashMap::new(),
            cleanup_handles: DashMap::new(),
            retention,
            cleanup_hook: None,
        }
    }

    /// Wire a cross-component cleanup callback at construction time.
    pub fn with_cleanup_hook(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.cleanup_hook = Some(Box::new(hook));
        self
    }

    /// Record a progress update.
    ///
    /// Updates for the same session are applied strictly in arrival order;
    /// the update is then re-emitted for global, group, and session
    /// subscribers.
    pub async fn report_progress(self: &Arc<Self>, record: ProgressRecord) -> Result<()> {
        let session_id = record.session_id.clone();
        let queue = self
            .update_queues
            .entry(session_id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _serial = queue.lock().await;

        self.track_step_duration(&session_id);
        let terminal = record.status.is_terminal();
        self.records.insert(session_id.clone(), record.clone());

        let group_id = self
            .store
            .get_session(&session_id)
            .and_then(|s| s.parallel_group);

        self.bus.emit(EngineEvent::Progress {
            session_id,
            group_id: group_id.clone(),
            record,
        });

        if terminal && let Some(group_id) = group_id {
            self.check_group_completion(&group_id);
        }
        Ok(())
    }

    fn track_step_duration(&self, session_id: &str) {
        let now = Instant::now();
        let mut window = self
            .step_windows
            .entry(session_id.to_string())
            .or_insert_with(|| StepWindow {
                last_report: now,
                durations: VecDeque::new(),
            });
        let elapsed = now - window.last_report;
        window.last_report = now;
        if elapsed > Duration::ZERO {
            window.durations.push_back(elapsed);
            if window.durations.len() > STEP_WINDOW_SIZE {
                window.durations.pop_front();
            }
        }
    }

    /// Mean step duration over the rolling window.
    pub fn average_step_duration(&self, session_id: &str) -> Option<Duration> {
        let window = self.step_windows.get(session_id)?;
        if window.durations.is_empty() {
            return None;
        }
        let total: Duration = window.durations.iter().sum();
        Some(total / window.durations.len() as u32)
    }

    pub fn latest(&self, session_id: &str) -> Option<ProgressRecord> {
        self.records.get(session_id).map(|r| r.clone())
    }

    /// Aggregate progress for one group.
    pub fn group_progress(&self, group_id: &str) -> Result<GroupProgress> {
        let group = self
            .store
            .get_group(group_id)
            .ok_or_else(|| crate::error::EngineError::group_not_found(group_id))?;

        let mut progress = GroupProgress {
            group_id: group_id.to_string(),
            sessions: HashMap::new(),
            started: 0,
            in_progress: 0,
            completed: 0,
            failed: 0,
            waiting: 0,
            overall: 0.0,
            estimated_remaining: None,
        };

        let mut effective_steps = 0u64;
        let mut total_steps = 0u64;

        for member in &group.members {
            let Some(record) = self.latest(member) else {
                continue;
            };
            match record.status {
                ProgressStatus::Started => progress.started += 1,
                ProgressStatus::InProgress => progress.in_progress += 1,
                ProgressStatus::Completed => progress.completed += 1,
                ProgressStatus::Failed => progress.failed += 1,
                ProgressStatus::Waiting => progress.waiting += 1,
            }

            total_steps += u64::from(record.total_steps);
            // Completed sessions count their full total.
            effective_steps += if record.status == ProgressStatus::Completed {
                u64::from(record.total_steps)
            } else {
                u64::from(record.current_step.min(record.total_steps))
            };
            progress.sessions.insert(member.clone(), record);
        }

        if total_steps > 0 {
            progress.overall = effective_steps as f64 / total_steps as f64;
        }

        if progress.overall > 0.0
            && let Some(started_at) = group.metadata.started_at
        {
            let elapsed = (Utc::now() - started_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            let projected = elapsed.as_secs_f64() / progress.overall;
            progress.estimated_remaining = Some(Duration::from_secs_f64(
                (projected - elapsed.as_secs_f64()).max(0.0),
            ));
        }

        Ok(progress)
    }

    /// Advisory deadlock signal: every non-completed member is waiting and
    /// nothing runs. Distinct from a hard timeout.
    pub fn check_for_deadlock(&self, group_id: &str) -> Result<bool> {
        let group = self
            .store
            .get_group(group_id)
            .ok_or_else(|| crate::error::EngineError::group_not_found(group_id))?;

        let mut completed = 0usize;
        let mut waiting_sessions = Vec::new();
        let mut active = 0usize;

        for member in &group.members {
            match self.latest(member).map(|r| r.status) {
                Some(ProgressStatus::Completed) => completed += 1,
                Some(ProgressStatus::Waiting) => waiting_sessions.push(member.clone()),
                Some(s) if s.is_active() => active += 1,
                // Failed or never reported: open, but not waiting.
                _ => {}
            }
        }

        let deadlocked = active == 0
            && !waiting_sessions.is_empty()
            && completed + waiting_sessions.len() == group.members.len();

        if deadlocked {
            debug!(group_id, waiting = waiting_sessions.len(), "deadlock suspected");
            self.bus.emit(EngineEvent::DeadlockSuspected {
                group_id: group_id.to_string(),
                waiting_sessions,
            });
        }
        Ok(deadlocked)
    }

    /// Fire the group-completion event once completed+failed reaches the
    /// member count. Success means zero failures; the group moves to
    /// converging and deferred cleanup is scheduled either way.
    pub fn check_group_completion(self: &Arc<Self>, group_id: &str) {
        let Some(group) = self.store.get_group(group_id) else {
            return;
        };

        let mut completed = 0;
        let mut failed_sessions = Vec::new();
        for member in &group.members {
            match self.latest(member).map(|r| r.status) {
                Some(ProgressStatus::Completed) => completed += 1,
                Some(ProgressStatus::Failed) => failed_sessions.push(member.clone()),
                _ => {}
            }
        }

        if completed + failed_sessions.len() < group.members.len() {
            return;
        }
        // Fire once per group.
        if self.completed_groups.insert(group_id.to_string(), ()).is_some() {
            return;
        }

        let success = failed_sessions.is_empty();
        info!(group_id, success, failed = failed_sessions.len(), "group completed");

        if success {
            let _ = self
                .store
                .update_group(group_id, |g| g.transition(GroupStatus::Converging));
        }

        self.bus.emit(EngineEvent::GroupCompleted {
            group_id: group_id.to_string(),
            success,
            failed_sessions,
        });

        self.schedule_group_cleanup(group_id);
    }

    fn schedule_group_cleanup(self: &Arc<Self>, group_id: &str) {
        let coordinator = Arc::clone(self);
        let group_id = group_id.to_string();
        let retention = self.retention;
        let handle = tokio::spawn({
            let group_id = group_id.clone();
            async move {
                tokio::time::sleep(retention).await;
                coordinator.cleanup_group(&group_id);
            }
        });
        if let Some(previous) = self.cleanup_handles.insert(group_id, handle) {
            previous.abort();
        }
    }

    fn cleanup_group(&self, group_id: &str) {
        if let Some(group) = self.store.get_group(group_id) {
            for member in &group.members {
                self.records.remove(member);
                self.step_windows.remove(member);
                self.update_queues.remove(member);
            }
        }
        self.store.delete_group(group_id);
        self.completed_groups.remove(group_id);
        self.cleanup_handles.remove(group_id);
        if let Some(hook) = &self.cleanup_hook {
            hook(group_id);
        }
        debug!(group_id, "group retention elapsed, cleaned up");
    }

    /// Drop all tracked state for a session (used when a failed session is
    /// replaced by a retry).
    pub fn forget_session(&self, session_id: &str) {
        self.records.remove(session_id);
        self.step_windows.remove(session_id);
        self.update_queues.remove(session_id);
    }

    /// Abort every pending cleanup timer. Called on shutdown; required so
    /// no timer outlives the engine.
    pub fn shutdown(&self) {
        for entry in self.cleanup_handles.iter() {
            entry.value().abort();
        }
        self.cleanup_handles.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionStoreConfig;
    use crate::session::{ParallelGroup, SessionData};

    fn setup(members: &[&str]) -> (Arc<SessionStore>, Arc<EventBus>, Arc<ProgressCoordinator>) {
        let store = Arc::new(SessionStore::new(SessionStoreConfig::default()));
        let bus = Arc::new(EventBus::default());
        let coordinator = Arc::new(ProgressCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            Duration::from_secs(300),
        ));

        let ids: Vec<String> = members.iter().map(|m| m.to_string()).collect();
        for id in &ids {
            store
                .create_session(
                    SessionData::new("po", "p").with_group("g1"),
                    Some(id.clone()),
                )
                .unwrap();
        }
        store.insert_group(ParallelGroup::new("g1", ids));
        (store, bus, coordinator)
    }

    #[tokio::test]
    async fn test_progress_recorded_and_emitted() {
        let (_store, bus, coordinator) = setup(&["s1", "s2"]);
        let mut rx = bus.subscribe_session("s1");

        coordinator
            .report_progress(ProgressRecord::new("s1", ProgressStatus::InProgress, 2, 4))
            .await
            .unwrap();

        assert_eq!(coordinator.latest("s1").unwrap().current_step, 2);
        let event = rx.try_recv().unwrap();
        assert_eq!(event.session_id(), Some("s1"));
        assert_eq!(event.group_id(), Some("g1"));
    }

    #[tokio::test]
    async fn test_group_progress_weighs_completed_fully() {
        let (_store, _bus, coordinator) = setup(&["s1", "s2"]);

        coordinator
            .report_progress(ProgressRecord::new("s1", ProgressStatus::Completed, 2, 4))
            .await
            .unwrap();
        coordinator
            .report_progress(ProgressRecord::new("s2", ProgressStatus::InProgress, 1, 4))
            .await
            .unwrap();

        let progress = coordinator.group_progress("g1").unwrap();
        assert_eq!(progress.completed, 1);
        assert_eq!(progress.in_progress, 1);
        // (4 + 1) / 8
        assert!((progress.overall - 0.625).abs() < 1e-9);
        assert!(progress.estimated_remaining.is_some());
    }

    #[tokio::test]
    async fn test_deadlock_requires_all_waiting() {
        let (_store, _bus, coordinator) = setup(&["s1", "s2", "s3"]);

        coordinator
            .report_progress(
                ProgressRecord::new("s1", ProgressStatus::Waiting, 0, 4)
                    .with_waiting_on(vec!["s3".into()]),
            )
            .await
            .unwrap();
        coordinator
            .report_progress(ProgressRecord::new("s2", ProgressStatus::Waiting, 0, 4))
            .await
            .unwrap();
        coordinator
            .report_progress(ProgressRecord::new("s3", ProgressStatus::InProgress, 1, 4))
            .await
            .unwrap();

        assert!(!coordinator.check_for_deadlock("g1").unwrap());

        coordinator
            .report_progress(ProgressRecord::new("s3", ProgressStatus::Waiting, 1, 4))
            .await
            .unwrap();
        assert!(coordinator.check_for_deadlock("g1").unwrap());
    }

    #[tokio::test]
    async fn test_deadlock_ignores_completed_members() {
        let (_store, _bus, coordinator) = setup(&["s1", "s2"]);

        coordinator
            .report_progress(ProgressRecord::new("s1", ProgressStatus::Completed, 4, 4))
            .await
            .unwrap();
        coordinator
            .report_progress(ProgressRecord::new("s2", ProgressStatus::Waiting, 1, 4))
            .await
            .unwrap();

        assert!(coordinator.check_for_deadlock("g1").unwrap());
    }

    #[tokio::test]
    async fn test_group_completion_fires_once() {
        let (store, bus, coordinator) = setup(&["s1", "s2"]);
        let mut rx = bus.subscribe_group("g1");

        coordinator
            .report_progress(ProgressRecord::new("s1", ProgressStatus::Completed, 4, 4))
            .await
            .unwrap();
        coordinator
            .report_progress(ProgressRecord::new("s2", ProgressStatus::Completed, 4, 4))
            .await
            .unwrap();

        let mut completions = 0;
        while let Some(event) = rx.try_recv() {
            if matches!(event, EngineEvent::GroupCompleted { success: true, .. }) {
                completions += 1;
            }
        }
        assert_eq!(completions, 1);
        assert_eq!(
            store.get_group("g1").unwrap().status,
            GroupStatus::Converging
        );
        coordinator.shutdown();
    }

    #[tokio::test]
    async fn test_failed_member_means_unsuccessful_completion() {
        let (_store, bus, coordinator) = setup(&["s1", "s2"]);
        let mut rx = bus.subscribe_group("g1");

        coordinator
            .report_progress(ProgressRecord::new("s1", ProgressStatus::Completed, 4, 4))
            .await
            .unwrap();
        coordinator
            .report_progress(
                ProgressRecord::new("s2", ProgressStatus::Failed, 2, 4).with_message("boom"),
            )
            .await
            .unwrap();

        let completion = std::iter::from_fn(|| rx.try_recv())
            .find(|e| matches!(e, EngineEvent::GroupCompleted { .. }))
            .unwrap();
        if let EngineEvent::GroupCompleted {
            success,
            failed_sessions,
            ..
        } = completion
        {
            assert!(!success);
            assert_eq!(failed_sessions, vec!["s2".to_string()]);
        }
        coordinator.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_deferred_cleanup_after_retention() {
        let (store, _bus, coordinator) = setup(&["s1"]);

        coordinator
            .report_progress(ProgressRecord::new("s1", ProgressStatus::Completed, 4, 4))
            .await
            .unwrap();

        assert!(store.get_group("g1").is_some());
        tokio::time::sleep(Duration::from_secs(301)).await;
        assert!(store.get_group("g1").is_none());
        assert!(coordinator.latest("s1").is_none());
    }
}
