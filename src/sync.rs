//! Cross-session context sharing.
//!
//! Each parallel group owns one shared context; updates flow through a
//! per-group serialized queue and land immediately, batched behind a
//! debounce window, or only at explicit checkpoints.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::SyncConfig;
use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EventBus};

/// When shared-context updates become visible to the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStrategy {
    /// Apply and emit at once.
    #[default]
    Immediate,
    /// Queue; flush on size cap or debounce expiry.
    Batched,
    /// Queue; flush only on an explicit checkpoint call.
    Checkpoint,
}

/// A partial update contributed by one session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextUpdate {
    pub session_id: String,
    #[serde(default)]
    pub insights: Vec<String>,
    #[serde(default)]
    pub theme_weights: HashMap<String, f64>,
    #[serde(default)]
    pub metrics: HashMap<String, f64>,
}

impl ContextUpdate {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Self::default()
        }
    }

    pub fn with_insight(mut self, insight: impl Into<String>) -> Self {
        self.insights.push(insight.into());
        self
    }

    pub fn with_theme(mut self, theme: impl Into<String>, weight: f64) -> Self {
        self.theme_weights.insert(theme.into(), weight);
        self
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }
}

/// An insight attributed to its contributing session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextInsight {
    pub session_id: String,
    pub text: String,
}

/// Accumulated cross-session state for one group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedContext {
    pub group_id: String,
    pub insights: Vec<ContextInsight>,
    /// Additive: contributions to the same theme accumulate.
    pub theme_weights: HashMap<String, f64>,
    /// Last-write-wins scalars.
    pub metrics: HashMap<String, f64>,
    pub update_count: u64,
    pub last_update: DateTime<Utc>,
}

impl SharedContext {
    fn new(group_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            insights: Vec::new(),
            theme_weights: HashMap::new(),
            metrics: HashMap::new(),
            update_count: 0,
            last_update: Utc::now(),
        }
    }

    fn apply(&mut self, update: &ContextUpdate) {
        for insight in &update.insights {
            self.insights.push(ContextInsight {
                session_id: update.session_id.clone(),
                text: insight.clone(),
            });
        }
        for (theme, weight) in &update.theme_weights {
            *self.theme_weights.entry(theme.clone()).or_insert(0.0) += weight;
        }
        for (name, value) in &update.metrics {
            self.metrics.insert(name.clone(), *value);
        }
        self.update_count += 1;
        self.last_update = Utc::now();
    }

    /// Themes ranked by weight descending, name as tie-break.
    pub fn top_themes(&self, n: usize) -> Vec<(String, f64)> {
        let mut themes: Vec<(String, f64)> = self
            .theme_weights
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        themes.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        themes.truncate(n);
        themes
    }
}

/// Summary view returned to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSummary {
    pub group_id: String,
    pub top_themes: Vec<(String, f64)>,
    pub insight_count: usize,
    pub update_count: u64,
}

/// Shares context across a group's sessions under one of three update
/// strategies.
pub struct SessionSynchronizer {
    config: SyncConfig,
    bus: Arc<EventBus>,
    contexts: DashMap<String, SharedContext>,
    strategies: DashMap<String, SyncStrategy>,
    queues: DashMap<String, Vec<ContextUpdate>>,
    flush_timers: DashMap<String, JoinHandle<()>>,
    update_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl SessionSynchronizer {
    pub fn new(config: SyncConfig, bus: Arc<EventBus>) -> Self {
        Self {
            config,
            bus,
            contexts: DashMap::new(),
            strategies: DashMap::new(),
            queues: DashMap::new(),
            flush_timers: DashMap::new(),
            update_locks: DashMap::new(),
        }
    }

    /// Create the shared context for a group.
    pub fn init_shared_context(&self, group_id: &str, strategy: SyncStrategy) {
        self.contexts
            .insert(group_id.to_string(), SharedContext::new(group_id));
        self.strategies.insert(group_id.to_string(), strategy);
        debug!(group_id, ?strategy, "shared context initialized");
    }

    fn group_lock(&self, group_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.update_locks
            .entry(group_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Contribute a partial update, dispatched per the group's strategy.
    pub async fn update_shared_context(
        self: &Arc<Self>,
        group_id: &str,
        update: ContextUpdate,
    ) -> Result<()> {
        let strategy = self
            .strategies
            .get(group_id)
            .map(|s| *s)
            .ok_or_else(|| EngineError::group_not_found(group_id))?;

        let lock = self.group_lock(group_id);
        let _serial = lock.lock().await;

        match strategy {
            SyncStrategy::Immediate => {
                self.apply_updates(group_id, vec![update]);
            }
            SyncStrategy::Batched => {
                let queued = {
                    let mut queue = self.queues.entry(group_id.to_string()).or_default();
                    queue.push(update);
                    queue.len()
                };
                if queued >= self.config.batch_size_cap {
                    self.flush_locked(group_id);
                } else {
                    self.arm_flush_timer(group_id);
                }
            }
            SyncStrategy::Checkpoint => {
                self.queues.entry(group_id.to_string()).or_default().push(update);
            }
        }
        Ok(())
    }

    /// Explicitly flush a checkpoint group's queued updates.
    pub async fn checkpoint(self: &Arc<Self>, group_id: &str) -> Result<()> {
        if !self.contexts.contains_key(group_id) {
            return Err(EngineError::group_not_found(group_id));
        }
        let lock = self.group_lock(group_id);
        let _serial = lock.lock().await;
        self.flush_locked(group_id);
        Ok(())
    }

    /// Apply everything queued for a group. Caller holds the group lock.
    fn flush_locked(&self, group_id: &str) {
        if let Some((_, handle)) = self.flush_timers.remove(group_id) {
            handle.abort();
        }
        let Some((_, queued)) = self.queues.remove(group_id) else {
            return;
        };
        if queued.is_empty() {
            return;
        }
        // Merge the whole batch into one combined update before applying.
        let combined = merge_updates(&queued);
        self.apply_updates(group_id, combined);
    }

    fn apply_updates(&self, group_id: &str, updates: Vec<ContextUpdate>) {
        let Some(mut context) = self.contexts.get_mut(group_id) else {
            return;
        };
        let mut contributors = Vec::new();
        for update in &updates {
            if !contributors.contains(&update.session_id) {
                contributors.push(update.session_id.clone());
            }
            context.apply(update);
        }
        let update_count = context.update_count;
        drop(context);

        self.bus.emit(EngineEvent::ContextUpdated {
            group_id: group_id.to_string(),
            contributors,
            update_count,
        });
    }

    fn arm_flush_timer(self: &Arc<Self>, group_id: &str) {
        if self.flush_timers.contains_key(group_id) {
            return;
        }
        let synchronizer = Arc::clone(self);
        let id = group_id.to_string();
        let window = self.config.batch_window();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let lock = synchronizer.group_lock(&id);
            let _serial = lock.lock().await;
            synchronizer.flush_timers.remove(&id);
            synchronizer.flush_locked(&id);
        });
        self.flush_timers.insert(group_id.to_string(), handle);
    }

    pub fn get_context(&self, group_id: &str) -> Option<SharedContext> {
        self.contexts.get(group_id).map(|c| c.clone())
    }

    /// Top-N themes plus counters for one group.
    pub fn context_summary(&self, group_id: &str) -> Result<ContextSummary> {
        let context = self
            .contexts
            .get(group_id)
            .ok_or_else(|| EngineError::group_not_found(group_id))?;
        Ok(ContextSummary {
            group_id: group_id.to_string(),
            top_themes: context.top_themes(self.config.summary_themes),
            insight_count: context.insights.len(),
            update_count: context.update_count,
        })
    }

    /// Synthetic union of several groups' contexts, for nested groups.
    /// Insights concatenate, weights sum, metrics merge in argument order.
    pub fn merge_contexts(&self, group_ids: &[String]) -> SharedContext {
        let mut merged = SharedContext::new(group_ids.join("+"));
        for group_id in group_ids {
            let Some(context) = self.contexts.get(group_id) else {
                continue;
            };
            merged.insights.extend(context.insights.iter().cloned());
            for (theme, weight) in &context.theme_weights {
                *merged.theme_weights.entry(theme.clone()).or_insert(0.0) += weight;
            }
            for (name, value) in &context.metrics {
                merged.metrics.insert(name.clone(), *value);
            }
            merged.update_count += context.update_count;
        }
        merged
    }

    /// Drop a group's context, queue, and pending flush timer.
    pub fn teardown_group(&self, group_id: &str) {
        if let Some((_, handle)) = self.flush_timers.remove(group_id) {
            handle.abort();
        }
        self.queues.remove(group_id);
        self.contexts.remove(group_id);
        self.strategies.remove(group_id);
        self.update_locks.remove(group_id);
    }

    /// Abort every pending flush timer.
    pub fn shutdown(&self) {
        for entry in self.flush_timers.iter() {
            entry.value().abort();
        }
        self.flush_timers.clear();
    }
}

/// Collapse a batch into per-session combined updates, preserving arrival
/// order for metrics.
fn merge_updates(queued: &[ContextUpdate]) -> Vec<ContextUpdate> {
    let mut combined: Vec<ContextUpdate> = Vec::new();
    for update in queued {
        if let Some(existing) = combined
            .iter_mut()
            .find(|c| c.session_id == update.session_id)
        {
            existing.insights.extend(update.insights.iter().cloned());
            for (theme, weight) in &update.theme_weights {
                *existing.theme_weights.entry(theme.clone()).or_insert(0.0) += weight;
            }
            for (name, value) in &update.metrics {
                existing.metrics.insert(name.clone(), *value);
            }
        } else {
            combined.push(update.clone());
        }
    }
    combined
}
