//! Multi-strategy recovery for parallel groups with failed members.
//!
//! A failed session is isolated, never thrown; this handler looks at the
//! group as a whole and picks exactly one way forward.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::PartialCompletionConfig;
use crate::graph::DependencyGraph;
use crate::progress::ProgressStatus;

/// One member's state at assessment time.
#[derive(Debug, Clone)]
pub struct MemberState {
    pub session_id: String,
    pub technique: String,
    pub status: Option<ProgressStatus>,
}

/// Snapshot of a group handed to the handler.
#[derive(Debug, Clone)]
pub struct GroupSnapshot {
    pub group_id: String,
    pub members: Vec<MemberState>,
}

/// The one strategy selected for a partially failed group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialStrategy {
    /// Enough completions and no critical failures: converge what exists.
    ProceedWithAvailable,
    /// A critical session failed and retry budget remains.
    RetryCriticalSessions,
    /// Too many failures, but at least one usable result remains.
    FallbackToSimplifiedConvergence,
    /// No viable path.
    AbortGroup,
}

/// Outcome of strategy selection, with caller-facing caveats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialRecovery {
    pub group_id: String,
    pub strategy: PartialStrategy,
    /// Sessions whose results can feed convergence.
    pub usable_sessions: Vec<String>,
    /// Sessions to retry (retry strategy only).
    pub retry_sessions: Vec<String>,
    /// Techniques whose results are missing from the synthesis.
    pub missing_techniques: Vec<String>,
    pub caveats: Vec<String>,
}

/// Selects a recovery strategy when a parallel group reports failures.
pub struct PartialCompletionHandler {
    config: PartialCompletionConfig,
    /// Retries already spent per group.
    retries_used: DashMap<String, u32>,
}

impl PartialCompletionHandler {
    pub fn new(config: PartialCompletionConfig) -> Self {
        Self {
            config,
            retries_used: DashMap::new(),
        }
    }

    /// Categorize members and select exactly one strategy.
    pub fn assess(&self, snapshot: &GroupSnapshot, graph: &DependencyGraph) -> PartialRecovery {
        let mut completed = Vec::new();
        let mut failed = Vec::new();
        let mut pending = Vec::new();

        for member in &snapshot.members {
            match member.status {
                Some(ProgressStatus::Completed) => completed.push(member),
                Some(ProgressStatus::Failed) => failed.push(member),
                _ => pending.push(member),
            }
        }

        // A failure is critical when it blocks more sessions than the
        // configured threshold.
        let critical: Vec<&&MemberState> = failed
            .iter()
            .filter(|m| {
                graph.dependents_of(&m.session_id).len()
                    > self.config.critical_dependents_threshold
            })
            .collect();

        let missing_techniques: Vec<String> = failed
            .iter()
            .chain(pending.iter())
            .map(|m| m.technique.clone())
            .collect();

        let member_count = snapshot.members.len().max(1);
        let completion_ratio = completed.len() as f64 / member_count as f64;
        let enough_completions = completion_ratio >= self.config.min_completion_ratio;
        let retries_used = self
            .retries_used
            .get(&snapshot.group_id)
            .map(|r| *r)
            .unwrap_or(0);

        let usable: Vec<String> = completed.iter().map(|m| m.session_id.clone()).collect();

        let recovery = if enough_completions && critical.is_empty() {
            PartialRecovery {
                group_id: snapshot.group_id.clone(),
                strategy: PartialStrategy::ProceedWithAvailable,
                caveats: self.proceed_caveats(&missing_techniques, completed.len(), member_count),
                usable_sessions: usable,
                retry_sessions: Vec::new(),
                missing_techniques,
            }
        } else if !critical.is_empty() && retries_used < self.config.retry_budget {
            self.retries_used
                .entry(snapshot.group_id.clone())
                .and_modify(|r| *r += 1)
                .or_insert(1);
            let retry_sessions: Vec<String> =
                critical.iter().map(|m| m.session_id.clone()).collect();
            PartialRecovery {
                group_id: snapshot.group_id.clone(),
                strategy: PartialStrategy::RetryCriticalSessions,
                caveats: vec![format!(
                    "Retrying {} critical session(s); attempt {} of {}",
                    retry_sessions.len(),
                    retries_used + 1,
                    self.config.retry_budget
                )],
                usable_sessions: usable,
                retry_sessions,
                missing_techniques,
            }
        } else if !completed.is_empty() {
            let mut caveats = vec![
                "Falling back to simplified convergence without conflict analysis".to_string(),
            ];
            caveats.extend(self.proceed_caveats(&missing_techniques, completed.len(), member_count));
            PartialRecovery {
                group_id: snapshot.group_id.clone(),
                strategy: PartialStrategy::FallbackToSimplifiedConvergence,
                caveats,
                usable_sessions: usable,
                retry_sessions: Vec::new(),
                missing_techniques,
            }
        } else {
            PartialRecovery {
                group_id: snapshot.group_id.clone(),
                strategy: PartialStrategy::AbortGroup,
                caveats: vec!["No usable results remain; the group cannot converge".to_string()],
                usable_sessions: Vec::new(),
                retry_sessions: Vec::new(),
                missing_techniques,
            }
        };

        info!(
            group_id = %snapshot.group_id,
            strategy = ?recovery.strategy,
            completed = completed.len(),
            failed = failed.len(),
            pending = pending.len(),
            "partial completion assessed"
        );
        recovery
    }

    fn proceed_caveats(
        &self,
        missing: &[String],
        completed: usize,
        members: usize,
    ) -> Vec<String> {
        let mut caveats = vec![format!(
            "Synthesis covers {} of {} perspectives",
            completed, members
        )];
        for technique in missing {
            caveats.push(format!("Results from '{}' are missing", technique));
        }
        caveats
    }

    /// Clear the retry budget for a group, e.g. after its retried sessions
    /// complete.
    pub fn reset_group(&self, group_id: &str) {
        self.retries_used.remove(group_id);
    }
}
