//! Per-session execution, dependency-wait, and staleness timers.
//!
//! Every timer is a spawned task whose handle is aborted on state changes
//! and teardown; a leaked timer firing on a dead session is a correctness
//! bug, not a nuisance.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::TimeoutConfig;
use crate::events::{EngineEvent, EventBus};
use crate::progress::{ProgressCoordinator, ProgressRecord, ProgressStatus};

/// Fraction of the execution budget after which an early warning fires.
const WARNING_FRACTION: f64 = 0.8;
/// Cadence of the coarse warning sweep.
const WARNING_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

struct MonitorEntry {
    /// Execution budget; grows via `extend_timeout`.
    budget: Duration,
    /// Active time consumed before the current running stretch.
    consumed: Duration,
    /// Set while running; `None` while waiting on dependencies.
    active_since: Option<Instant>,
    last_progress: Instant,
    waiting: bool,
    blocked_on: Vec<String>,
    warned: bool,
    stale_notified: bool,
    exec_timer: Option<JoinHandle<()>>,
    dep_timer: Option<JoinHandle<()>>,
}

impl MonitorEntry {
    fn consumed_now(&self, now: Instant) -> Duration {
        match self.active_since {
            Some(since) => self.consumed + (now - since),
            None => self.consumed,
        }
    }

    fn abort_timers(&mut self) {
        if let Some(handle) = self.exec_timer.take() {
            handle.abort();
        }
        if let Some(handle) = self.dep_timer.take() {
            handle.abort();
        }
    }
}

/// Watches monitored sessions for execution overruns, dependency stalls,
/// and silent progress.
pub struct TimeoutMonitor {
    config: TimeoutConfig,
    coordinator: Arc<ProgressCoordinator>,
    bus: Arc<EventBus>,
    entries: Arc<DashMap<String, MonitorEntry>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl TimeoutMonitor {
    pub fn new(
        config: TimeoutConfig,
        coordinator: Arc<ProgressCoordinator>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            coordinator,
            bus,
            entries: Arc::new(DashMap::new()),
            background: Mutex::new(Vec::new()),
        }
    }

    /// Start the staleness check and the warning sweep. Idempotent callers
    /// should invoke this once, right after construction.
    pub fn spawn_background(self: &Arc<Self>) {
        let mut background = self.background.lock();

        let monitor = Arc::clone(self);
        background.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.config.staleness_check_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                monitor.staleness_pass();
            }
        }));

        let monitor = Arc::clone(self);
        background.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(WARNING_SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                monitor.warning_pass();
            }
        }));
    }

    /// Begin monitoring a session with the configured (or overridden)
    /// execution budget.
    pub fn start_monitoring(self: &Arc<Self>, session_id: &str, budget: Option<Duration>) {
        let budget = budget.unwrap_or_else(|| self.config.execution_timeout());
        let now = Instant::now();

        let mut entry = MonitorEntry {
            budget,
            consumed: Duration::ZERO,
            active_since: Some(now),
            last_progress: now,
            waiting: false,
            blocked_on: Vec::new(),
            warned: false,
            stale_notified: false,
            exec_timer: None,
            dep_timer: None,
        };
        entry.exec_timer = Some(self.spawn_execution_timer(session_id, budget));

        if let Some(mut previous) = self.entries.insert(session_id.to_string(), entry) {
            previous.abort_timers();
        }
        debug!(session_id, budget_ms = budget.as_millis() as u64, "monitoring started");
    }

    fn spawn_execution_timer(
        self: &Arc<Self>,
        session_id: &str,
        remaining: Duration,
    ) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(remaining).await;
            monitor.handle_execution_timeout(&session_id).await;
        })
    }

    async fn handle_execution_timeout(self: &Arc<Self>, session_id: &str) {
        let Some((_, mut entry)) = self.entries.remove(session_id) else {
            return;
        };
        // Entering waiting cancels this timer; if it fired anyway the
        // session had already resumed and the entry state wins.
        if entry.waiting {
            self.entries.insert(session_id.to_string(), entry);
            return;
        }
        if let Some(handle) = entry.dep_timer.take() {
            handle.abort();
        }
        entry.exec_timer.take();

        let elapsed = entry.consumed_now(Instant::now());
        let threshold = entry.budget;
        warn!(
            session_id,
            elapsed_ms = elapsed.as_millis() as u64,
            threshold_ms = threshold.as_millis() as u64,
            "execution timeout"
        );

        let (current, total) = self
            .coordinator
            .latest(session_id)
            .map(|r| (r.current_step, r.total_steps))
            .unwrap_or((0, 0));

        let record = ProgressRecord::new(session_id, ProgressStatus::Failed, current, total)
            .with_message(format!(
                "Execution timed out after {}ms (threshold {}ms)",
                elapsed.as_millis(),
                threshold.as_millis()
            ));
        if let Err(err) = self.coordinator.report_progress(record).await {
            warn!(session_id, error = %err, "failed to record timeout progress");
        }

        self.bus.emit(EngineEvent::ExecutionTimedOut {
            session_id: session_id.to_string(),
            elapsed_ms: elapsed.as_millis() as u64,
            threshold_ms: threshold.as_millis() as u64,
        });
    }

    /// Note fresh progress; re-arms the staleness advisory.
    pub fn record_progress(&self, session_id: &str) {
        if let Some(mut entry) = self.entries.get_mut(session_id) {
            entry.last_progress = Instant::now();
            entry.stale_notified = false;
        }
    }

    /// The session is now blocked on dependencies: the execution timer
    /// stops consuming budget and a dependency-wait timer starts.
    pub fn mark_waiting(self: &Arc<Self>, session_id: &str, blocked_on: Vec<String>) {
        let Some(mut entry) = self.entries.get_mut(session_id) else {
            return;
        };
        if entry.waiting {
            entry.blocked_on = blocked_on;
            return;
        }

        let now = Instant::now();
        entry.consumed = entry.consumed_now(now);
        entry.active_since = None;
        entry.waiting = true;
        entry.blocked_on = blocked_on.clone();
        if let Some(handle) = entry.exec_timer.take() {
            handle.abort();
        }

        let monitor = Arc::clone(self);
        let id = session_id.to_string();
        let wait_budget = self.config.dependency_timeout();
        entry.dep_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(wait_budget).await;
            monitor.handle_dependency_timeout(&id, wait_budget).await;
        }));
        debug!(session_id, "session waiting on dependencies");
    }

    async fn handle_dependency_timeout(self: &Arc<Self>, session_id: &str, waited: Duration) {
        let blocked_on = match self.entries.get_mut(session_id) {
            Some(mut entry) if entry.waiting => {
                entry.dep_timer.take();
                entry.blocked_on.clone()
            }
            _ => return,
        };

        warn!(session_id, waited_ms = waited.as_millis() as u64, "dependency wait timed out");
        // Advisory only: the caller may proceed without the blocker.
        self.bus.emit(EngineEvent::DependencyTimedOut {
            session_id: session_id.to_string(),
            waited_ms: waited.as_millis() as u64,
            blocked_on,
        });
    }

    /// The session resumed: the dependency timer stops and the execution
    /// timer restarts with whatever budget remains.
    pub fn mark_running(self: &Arc<Self>, session_id: &str) {
        let remaining = {
            let Some(mut entry) = self.entries.get_mut(session_id) else {
                return;
            };
            if !entry.waiting {
                return;
            }
            entry.waiting = false;
            entry.blocked_on.clear();
            entry.active_since = Some(Instant::now());
            if let Some(handle) = entry.dep_timer.take() {
                handle.abort();
            }
            entry.budget.saturating_sub(entry.consumed)
        };

        let timer = self.spawn_execution_timer(session_id, remaining);
        if let Some(mut entry) = self.entries.get_mut(session_id) {
            if let Some(previous) = entry.exec_timer.replace(timer) {
                previous.abort();
            }
        }
    }

    /// Grow the execution budget without resetting consumed time.
    pub fn extend_timeout(self: &Arc<Self>, session_id: &str, extra: Duration) {
        let respawn = {
            let Some(mut entry) = self.entries.get_mut(session_id) else {
                return;
            };
            entry.budget += extra;
            entry.warned = false;
            if entry.waiting {
                None
            } else {
                let remaining = entry
                    .budget
                    .saturating_sub(entry.consumed_now(Instant::now()));
                if let Some(previous) = entry.exec_timer.take() {
                    previous.abort();
                }
                Some(remaining)
            }
        };

        if let Some(remaining) = respawn {
            let timer = self.spawn_execution_timer(session_id, remaining);
            if let Some(mut entry) = self.entries.get_mut(session_id) {
                entry.exec_timer = Some(timer);
            }
            debug!(session_id, extra_ms = extra.as_millis() as u64, "timeout extended");
        }
    }

    /// Stop monitoring and cancel all timers for a session.
    pub fn stop_monitoring(&self, session_id: &str) {
        if let Some((_, mut entry)) = self.entries.remove(session_id) {
            entry.abort_timers();
            debug!(session_id, "monitoring stopped");
        }
    }

    pub fn is_monitoring(&self, session_id: &str) -> bool {
        self.entries.contains_key(session_id)
    }

    fn staleness_pass(&self) {
        let threshold = self.config.staleness_threshold();
        let now = Instant::now();

        for mut entry in self.entries.iter_mut() {
            if entry.waiting || entry.stale_notified {
                continue;
            }
            let idle = now - entry.last_progress;
            if idle >= threshold {
                entry.stale_notified = true;
                let session_id = entry.key().clone();
                debug!(session_id = %session_id, idle_ms = idle.as_millis() as u64, "progress stale");
                self.bus.emit(EngineEvent::ProgressStale {
                    session_id,
                    idle_ms: idle.as_millis() as u64,
                });
            }
        }
    }

    fn warning_pass(&self) {
        let now = Instant::now();
        for mut entry in self.entries.iter_mut() {
            if entry.waiting || entry.warned {
                continue;
            }
            let consumed = entry.consumed_now(now);
            if consumed.as_secs_f64() >= entry.budget.as_secs_f64() * WARNING_FRACTION {
                entry.warned = true;
                self.bus.emit(EngineEvent::TimeoutWarning {
                    session_id: entry.key().clone(),
                    elapsed_ms: consumed.as_millis() as u64,
                    budget_ms: entry.budget.as_millis() as u64,
                });
            }
        }
    }

    /// Cancel every timer and background task.
    pub fn shutdown(&self) {
        for handle in self.background.lock().drain(..) {
            handle.abort();
        }
        let ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.stop_monitoring(&id);
        }
    }
}
