//! Session and parallel-group data model.
//!
//! Sessions move through an explicit finite-state machine; parallel groups
//! only ever move forward. Both transition tables live here so every
//! component enforces the same rules.

mod lock;
mod store;

pub use lock::{LockGuard, SessionLocks};
pub use store::{SessionData, SessionStore};

use std::collections::HashSet;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::convergence::ConvergenceOptions;
use crate::error::{EngineError, Result};

static SESSION_ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._-]{1,64}$").expect("valid pattern"));

/// Validate a caller-supplied session id.
pub fn validate_session_id(id: &str) -> Result<()> {
    if SESSION_ID_PATTERN.is_match(id) {
        Ok(())
    } else {
        Err(EngineError::invalid_session_id(id))
    }
}

/// Generate a fresh session id (UUIDs match the id pattern).
pub fn generate_session_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Pending,
    Running,
    /// Blocked on unfinished hard dependencies.
    Waiting,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn allowed_transitions(&self) -> &'static [SessionStatus] {
        use SessionStatus::*;
        match self {
            Pending => &[Running, Waiting, Failed],
            Running => &[Waiting, Completed, Failed],
            Waiting => &[Running, Failed],
            Completed => &[],
            Failed => &[],
        }
    }

    pub fn can_transition_to(&self, target: SessionStatus) -> bool {
        self.allowed_transitions().contains(&target)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// One recorded technique step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: u32,
    pub total_steps: u32,
    pub output: String,
    pub timestamp: DateTime<Utc>,
    /// Technique-specific fields, passed through opaquely.
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl StepRecord {
    pub fn new(step: u32, total_steps: u32, output: impl Into<String>) -> Self {
        Self {
            step,
            total_steps,
            output: output.into(),
            timestamp: Utc::now(),
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_extra(mut self, extra: serde_json::Map<String, serde_json::Value>) -> Self {
        self.extra = extra;
        self
    }

    /// Approximate payload size, used by the store's session-size cap.
    pub fn approx_bytes(&self) -> usize {
        self.output.len()
            + self
                .extra
                .iter()
                .map(|(k, v)| k.len() + v.to_string().len())
                .sum::<usize>()
    }
}

/// Parallel-execution bookkeeping attached to a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelMeta {
    pub plan_id: String,
    pub techniques: Vec<String>,
    /// True when the session has no hard dependencies inside its group.
    pub independent: bool,
}

/// A single technique workflow in flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub technique: String,
    pub problem: String,
    pub history: Vec<StepRecord>,
    pub insights: Vec<String>,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub parallel_group: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub parallel_meta: Option<ParallelMeta>,
}

impl Session {
    pub fn new(id: impl Into<String>, technique: impl Into<String>, problem: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            technique: technique.into(),
            problem: problem.into(),
            history: Vec::new(),
            insights: Vec::new(),
            status: SessionStatus::Pending,
            started_at: now,
            last_activity: now,
            ended_at: None,
            parallel_group: None,
            depends_on: Vec::new(),
            parallel_meta: None,
        }
    }

    /// Apply a status transition, enforcing the transition table.
    pub fn transition(&mut self, target: SessionStatus) -> Result<()> {
        if self.status == target {
            return Ok(());
        }
        if !self.status.can_transition_to(target) {
            return Err(EngineError::invalid_transition(self.status, target)
                .with_context("session_id", self.id.clone()));
        }
        self.status = target;
        self.last_activity = Utc::now();
        if target.is_terminal() {
            self.ended_at = Some(self.last_activity);
        }
        Ok(())
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    pub fn record_step(&mut self, record: StepRecord) {
        self.history.push(record);
        self.last_activity = Utc::now();
    }

    pub fn add_insight(&mut self, insight: impl Into<String>) {
        self.insights.push(insight.into());
    }

    /// Approximate size of the recorded history payload.
    pub fn approx_bytes(&self) -> usize {
        self.history.iter().map(StepRecord::approx_bytes).sum()
    }

    pub fn idle_since(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_activity
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    #[default]
    Active,
    Converging,
    Completed,
    Failed,
    PartialSuccess,
}

impl GroupStatus {
    /// Forward-only transition table.
    pub fn can_transition_to(&self, target: GroupStatus) -> bool {
        use GroupStatus::*;
        match self {
            Active => matches!(target, Converging | Completed | Failed | PartialSuccess),
            Converging => matches!(target, Completed | Failed | PartialSuccess),
            Completed | Failed | PartialSuccess => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::PartialSuccess)
    }
}

/// Aggregate metadata kept alongside a group.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupMetadata {
    pub total_steps: u32,
    pub techniques: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub estimated_completion: Option<DateTime<Utc>>,
}

/// A set of sessions executing concurrently toward one problem, destined
/// to converge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelGroup {
    pub id: String,
    pub members: Vec<String>,
    pub completed: HashSet<String>,
    pub status: GroupStatus,
    pub convergence: ConvergenceOptions,
    pub metadata: GroupMetadata,
}

impl ParallelGroup {
    pub fn new(id: impl Into<String>, members: Vec<String>) -> Self {
        Self {
            id: id.into(),
            members,
            completed: HashSet::new(),
            status: GroupStatus::Active,
            convergence: ConvergenceOptions::default(),
            metadata: GroupMetadata {
                started_at: Some(Utc::now()),
                ..GroupMetadata::default()
            },
        }
    }

    pub fn with_convergence(mut self, options: ConvergenceOptions) -> Self {
        self.convergence = options;
        self
    }

    pub fn is_member(&self, session_id: &str) -> bool {
        self.members.iter().any(|m| m == session_id)
    }

    /// Record a member completion. The completed set stays a subset of the
    /// member list.
    pub fn mark_completed(&mut self, session_id: &str) -> Result<()> {
        if !self.is_member(session_id) {
            return Err(EngineError::state(
                "NOT_A_MEMBER",
                format!("Session {} is not in group {}", session_id, self.id),
            ));
        }
        self.completed.insert(session_id.to_string());
        Ok(())
    }

    pub fn all_completed(&self) -> bool {
        self.completed.len() == self.members.len()
    }

    /// Apply a forward-only status transition.
    pub fn transition(&mut self, target: GroupStatus) -> Result<()> {
        if self.status == target {
            return Ok(());
        }
        if !self.status.can_transition_to(target) {
            return Err(EngineError::invalid_transition(
                format!("{:?}", self.status),
                format!("{:?}", target),
            )
            .with_context("group_id", self.id.clone()));
        }
        self.status = target;
        Ok(())
    }
}
