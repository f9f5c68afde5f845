//! Execution context: the composition root and caller-facing facade.
//!
//! One explicit factory builds the component graph in dependency order and
//! wires cross-references at construction time. The context has a
//! process-wide lifetime in production; tests build fresh instances.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::convergence::{
    significant_tokens, ConvergenceEngine, ConvergenceOptions, ConvergenceOutcome,
    ParallelResult, CONVERGENCE_TECHNIQUE,
};
use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EventBus, EventReceiver};
use crate::graph::DependencyGraph;
use crate::partial::{GroupSnapshot, MemberState, PartialCompletionHandler, PartialRecovery, PartialStrategy};
use crate::persist::{ListOptions, SessionPersistence, SessionSnapshot};
use crate::planner::{
    hard_dependency_edges, ExecutionGraph, ExecutionMode, Plan, PlanGenerator, PlanRequest,
    PlanValidation, StaticTechniqueRegistry, TechniqueRegistry,
};
use crate::progress::{GroupProgress, ProgressCoordinator, ProgressRecord, ProgressStatus};
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::session::{
    GroupStatus, ParallelGroup, ParallelMeta, Session, SessionData, SessionStatus, SessionStore,
};
use crate::sync::{ContextSummary, ContextUpdate, SessionSynchronizer, SharedContext};
use crate::timeout::TimeoutMonitor;

/// One session slot inside a planned group.
#[derive(Debug, Clone)]
pub struct PlannedSession {
    pub session_id: String,
    pub technique: String,
}

/// A parallel group created at plan time.
#[derive(Debug, Clone)]
pub struct PlannedGroup {
    pub group_id: String,
    pub plan_id: String,
    pub sessions: Vec<PlannedSession>,
}

/// Result of the `plan` operation.
#[derive(Debug, Clone)]
pub struct PlanResponse {
    pub plan_ids: Vec<String>,
    pub mode: ExecutionMode,
    pub degraded: bool,
    pub groups: Vec<PlannedGroup>,
    pub execution_graph: ExecutionGraph,
    pub validation: PlanValidation,
}

/// One technique step reported by the caller.
#[derive(Debug, Clone, Default)]
pub struct StepRequest {
    pub plan_id: Option<String>,
    pub session_id: Option<String>,
    pub technique: String,
    pub current_step: u32,
    pub total_steps: u32,
    pub output: String,
    pub next_step_needed: bool,
    /// Insights distilled by the caller from this step.
    pub insights: Vec<String>,
    /// Source confidence, fed into convergence ranking.
    pub confidence: Option<f64>,
    /// Inline convergence inputs; otherwise gathered from completed groups.
    pub parallel_results: Option<Vec<ParallelResult>>,
    /// Technique-specific fields, stored opaquely.
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// What a step call produced.
#[derive(Debug, Clone)]
pub enum StepResponse {
    /// The step was recorded; more steps follow.
    Advanced {
        session_id: String,
        technique: String,
        current_step: u32,
        total_steps: u32,
        convergence: Option<ConvergenceOutcome>,
    },
    /// The session finished with this step.
    Completed {
        session_id: String,
        technique: String,
        group_id: Option<String>,
        /// Present when the session's group finished with failures.
        recovery: Option<PartialRecovery>,
        convergence: Option<ConvergenceOutcome>,
    },
    /// Hard dependencies are unfinished; the session is parked waiting.
    Waiting {
        session_id: String,
        blocked_on: Vec<String>,
    },
}

/// Builder for [`ExecutionContext`].
pub struct ExecutionContextBuilder {
    config: EngineConfig,
    registry: Option<Arc<dyn TechniqueRegistry>>,
    persistence: Option<Arc<dyn SessionPersistence>>,
}

impl ExecutionContextBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            registry: None,
            persistence: None,
        }
    }

    pub fn with_registry(mut self, registry: Arc<dyn TechniqueRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_persistence(mut self, persistence: Arc<dyn SessionPersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Build the full component graph in dependency order and start the
    /// background tasks.
    pub fn build(self) -> Result<Arc<ExecutionContext>> {
        self.config.validate()?;

        let bus = Arc::new(EventBus::default());
        let store = Arc::new(SessionStore::new(self.config.store.clone()));
        let synchronizer = Arc::new(SessionSynchronizer::new(
            self.config.sync.clone(),
            Arc::clone(&bus),
        ));
        let coordinator = Arc::new(
            ProgressCoordinator::new(
                Arc::clone(&store),
                Arc::clone(&bus),
                self.config.timeout.group_retention(),
            )
            .with_cleanup_hook({
                let synchronizer = Arc::clone(&synchronizer);
                move |group_id| synchronizer.teardown_group(group_id)
            }),
        );
        let monitor = Arc::new(TimeoutMonitor::new(
            self.config.timeout.clone(),
            Arc::clone(&coordinator),
            Arc::clone(&bus),
        ));
        let planner = PlanGenerator::new(self.config.planner.clone());
        let partial = PartialCompletionHandler::new(self.config.partial.clone());
        let convergence = ConvergenceEngine::new(self.config.convergence.clone());
        let retry = RetryExecutor::new(RetryPolicy::from_config(&self.config.retry));
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(StaticTechniqueRegistry::default()));

        let context = Arc::new(ExecutionContext {
            config: self.config,
            registry,
            bus,
            store,
            coordinator,
            monitor,
            synchronizer,
            planner,
            partial,
            convergence,
            retry,
            persistence: self.persistence,
            plans: DashMap::new(),
            plan_groups: DashMap::new(),
            plan_options: DashMap::new(),
            session_graph: RwLock::new(DependencyGraph::new()),
            background: Mutex::new(Vec::new()),
        });

        context.spawn_background();
        Ok(context)
    }
}

/// Facade over the whole orchestration engine.
pub struct ExecutionContext {
    config: EngineConfig,
    registry: Arc<dyn TechniqueRegistry>,
    bus: Arc<EventBus>,
    store: Arc<SessionStore>,
    coordinator: Arc<ProgressCoordinator>,
    monitor: Arc<TimeoutMonitor>,
    synchronizer: Arc<SessionSynchronizer>,
    planner: PlanGenerator,
    partial: PartialCompletionHandler,
    convergence: ConvergenceEngine,
    retry: RetryExecutor,
    persistence: Option<Arc<dyn SessionPersistence>>,
    plans: DashMap<String, Plan>,
    /// Parallel plan id -> group id.
    plan_groups: DashMap<String, String>,
    /// Convergence options per request, keyed by the convergence plan id.
    plan_options: DashMap<String, ConvergenceOptions>,
    /// Hard dependencies between sessions.
    session_graph: RwLock<DependencyGraph>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl ExecutionContext {
    pub fn builder(config: EngineConfig) -> ExecutionContextBuilder {
        ExecutionContextBuilder::new(config)
    }

    /// Build with the default registry and no persistence.
    pub fn new(config: EngineConfig) -> Result<Arc<Self>> {
        ExecutionContextBuilder::new(config).build()
    }

    fn spawn_background(self: &Arc<Self>) {
        let mut background = self.background.lock();
        background.push(self.store.spawn_cleanup());
        self.monitor.spawn_background();
        background.push(self.spawn_timeout_listener());
    }

    /// Execution timeouts arrive as synthesized progress; this listener
    /// folds them back into the store's session state.
    fn spawn_timeout_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let context = Arc::clone(self);
        let mut receiver = self.bus.subscribe();
        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                if let EngineEvent::ExecutionTimedOut { session_id, .. } = event {
                    let _ = context
                        .store
                        .update_session(&session_id, |session| {
                            if !session.status.is_terminal() {
                                session.transition(SessionStatus::Failed)?;
                            }
                            Ok(())
                        })
                        .await;
                    if let Some(group_id) = context
                        .store
                        .get_session(&session_id)
                        .and_then(|s| s.parallel_group)
                    {
                        context.maybe_assess_group(&group_id);
                    }
                }
            }
        })
    }

    // === Plan operation ===

    /// Validate and split a request into plans, creating the parallel
    /// groups and their member sessions.
    pub async fn plan(&self, request: PlanRequest) -> Result<PlanResponse> {
        let degrade = self.store.under_pressure();
        let generated = self
            .planner
            .generate(&request, self.registry.as_ref(), degrade)?;

        if degrade {
            warn!("session pressure: parallel execution degraded to sequential");
        }

        let mut groups = Vec::new();
        let mut technique_sessions: HashMap<String, String> = HashMap::new();

        for plan in &generated.plans {
            self.plans.insert(plan.id.clone(), plan.clone());
            if plan.is_convergence() {
                self.plan_options
                    .insert(plan.id.clone(), request.convergence.clone().unwrap_or_default());
            }
        }

        if generated.mode == ExecutionMode::Parallel {
            let estimate_secs = generated.validation.estimate.time_secs;
            for plan in generated.plans.iter().filter(|p| !p.is_convergence()) {
                let group = self.create_group_for_plan(
                    plan,
                    &request,
                    estimate_secs,
                    &mut technique_sessions,
                )?;
                groups.push(group);
            }
            self.wire_session_dependencies(&request.techniques, &technique_sessions)
                .await?;
        }

        info!(
            plans = generated.plans.len(),
            groups = groups.len(),
            mode = ?generated.mode,
            "plan created"
        );

        Ok(PlanResponse {
            plan_ids: generated.plans.iter().map(|p| p.id.clone()).collect(),
            mode: generated.mode,
            degraded: generated.degraded,
            groups,
            execution_graph: generated.execution_graph,
            validation: generated.validation,
        })
    }

    fn create_group_for_plan(
        &self,
        plan: &Plan,
        request: &PlanRequest,
        estimate_secs: f64,
        technique_sessions: &mut HashMap<String, String>,
    ) -> Result<PlannedGroup> {
        let group_id = format!("group-{}", Uuid::new_v4());
        let mut sessions = Vec::new();

        for technique in &plan.techniques {
            let session = self.store.create_session(
                SessionData::new(technique, &plan.problem)
                    .with_group(&group_id)
                    .with_parallel_meta(ParallelMeta {
                        plan_id: plan.id.clone(),
                        techniques: plan.techniques.clone(),
                        independent: true,
                    }),
                None,
            )?;
            technique_sessions.insert(technique.clone(), session.id.clone());
            sessions.push(PlannedSession {
                session_id: session.id,
                technique: technique.clone(),
            });
        }

        let mut group = ParallelGroup::new(
            &group_id,
            sessions.iter().map(|s| s.session_id.clone()).collect(),
        )
        .with_convergence(request.convergence.clone().unwrap_or_default());
        group.metadata.techniques = plan.techniques.clone();
        group.metadata.total_steps = plan.total_steps();
        group.metadata.estimated_completion =
            Some(Utc::now() + chrono::Duration::seconds(estimate_secs.ceil() as i64));
        self.store.insert_group(group);
        self.synchronizer
            .init_shared_context(&group_id, request.sync_strategy);
        self.plan_groups.insert(plan.id.clone(), group_id.clone());

        Ok(PlannedGroup {
            group_id,
            plan_id: plan.id.clone(),
            sessions,
        })
    }

    /// Translate hard technique dependencies into session dependencies and
    /// verify the scheduled subset stays acyclic.
    async fn wire_session_dependencies(
        &self,
        techniques: &[String],
        technique_sessions: &HashMap<String, String>,
    ) -> Result<()> {
        let edges = hard_dependency_edges(techniques);

        {
            let mut graph = self.session_graph.write();
            for session_id in technique_sessions.values() {
                graph.add_node(session_id.clone());
            }
            for (prereq, dependent) in &edges {
                if let (Some(from), Some(to)) = (
                    technique_sessions.get(prereq),
                    technique_sessions.get(dependent),
                ) {
                    graph.add_edge(from.clone(), to.clone());
                }
            }
        }

        for (prereq, dependent) in &edges {
            let (Some(from), Some(to)) = (
                technique_sessions.get(prereq),
                technique_sessions.get(dependent),
            ) else {
                continue;
            };
            let from = from.clone();
            self.store
                .update_session(to, move |session| {
                    session.depends_on.push(from);
                    if let Some(meta) = session.parallel_meta.as_mut() {
                        meta.independent = false;
                    }
                    Ok(())
                })
                .await?;
        }

        // The scheduled subset must be acyclic before anything runs.
        let ids: Vec<String> = technique_sessions.values().cloned().collect();
        let graph = self.session_graph.read();
        if graph.topological_order(&ids).is_none() {
            let cycle = graph
                .detect_cycles()
                .into_iter()
                .next()
                .unwrap_or_default();
            return Err(EngineError::circular_dependency(&cycle));
        }
        Ok(())
    }

    // === Step operation ===

    /// Record one technique step, gating on hard dependencies and driving
    /// convergence for the synthetic technique.
    pub async fn step(&self, request: StepRequest) -> Result<StepResponse> {
        if request.technique.is_empty() {
            return Err(EngineError::missing_parameter("technique"));
        }
        if request.current_step == 0 || request.current_step > request.total_steps {
            return Err(EngineError::validation(
                "INVALID_STEP",
                format!(
                    "Step {} of {} is out of range",
                    request.current_step, request.total_steps
                ),
            ));
        }
        // The registry owns step validity; convergence is exempt because
        // deepening passes run past its nominal step count.
        if request.technique != CONVERGENCE_TECHNIQUE
            && !self
                .registry
                .is_valid_step(&request.technique, request.current_step)
        {
            return Err(EngineError::validation(
                "INVALID_STEP",
                format!(
                    "Technique '{}' has no step {}",
                    request.technique, request.current_step
                ),
            ));
        }

        let session = self.resolve_session(&request).await?;

        if session.technique != request.technique {
            return Err(EngineError::workflow(
                "TECHNIQUE_MISMATCH",
                format!(
                    "Session {} runs '{}', not '{}'",
                    session.id, session.technique, request.technique
                ),
            ));
        }
        if session.status.is_terminal() {
            return Err(EngineError::workflow(
                "SESSION_FINISHED",
                format!("Session {} already {}", session.id, session.status),
            )
            .with_recovery(["Create a new session to continue this technique"]));
        }

        // Hard dependency gate: the session runs only once every
        // dependency has completed.
        let blockers = self.unfinished_dependencies(&session);
        if !blockers.is_empty() {
            return self.park_waiting(&session, &request, blockers).await;
        }
        self.activate(&session).await?;

        // Convergence runs through its own step machine.
        let convergence_outcome = if request.technique == CONVERGENCE_TECHNIQUE {
            Some(self.run_convergence_step(&session, &request)?)
        } else {
            None
        };

        let record = crate::session::StepRecord::new(
            request.current_step,
            request.total_steps,
            request.output.clone(),
        )
        .with_extra(request.extra.clone());
        let insights = request.insights.clone();
        self.store
            .update_session(&session.id, move |s| {
                s.record_step(record);
                for insight in insights {
                    s.add_insight(insight);
                }
                Ok(())
            })
            .await?;
        self.monitor.record_progress(&session.id);

        if let Some(group_id) = &session.parallel_group {
            self.contribute_context(group_id, &session.id, &request).await;
        }

        let completing = !request.next_step_needed || request.current_step >= request.total_steps;
        if completing {
            self.complete_session(&session, &request, convergence_outcome)
                .await
        } else {
            self.coordinator
                .report_progress(ProgressRecord::new(
                    &session.id,
                    ProgressStatus::InProgress,
                    request.current_step,
                    request.total_steps,
                ))
                .await?;
            Ok(StepResponse::Advanced {
                session_id: session.id,
                technique: request.technique,
                current_step: request.current_step,
                total_steps: request.total_steps,
                convergence: convergence_outcome,
            })
        }
    }

    async fn resolve_session(&self, request: &StepRequest) -> Result<Session> {
        if let Some(session_id) = &request.session_id {
            return self
                .store
                .get_session(session_id)
                .ok_or_else(|| EngineError::session_not_found(session_id));
        }
        let Some(plan_id) = &request.plan_id else {
            return Err(EngineError::missing_parameter("session_id or plan_id"));
        };
        if let Some(session) = self.store.find_by_plan(plan_id, &request.technique) {
            return Ok(session);
        }
        self.create_plan_session(plan_id, &request.technique).await
    }

    /// Lazily create the session behind a sequential plan's technique or a
    /// convergence plan.
    async fn create_plan_session(&self, plan_id: &str, technique: &str) -> Result<Session> {
        let plan = self
            .plans
            .get(plan_id)
            .map(|p| p.clone())
            .ok_or_else(|| EngineError::plan_not_found(plan_id))?;
        if !plan.techniques.iter().any(|t| t == technique) {
            return Err(EngineError::workflow(
                "TECHNIQUE_MISMATCH",
                format!("Plan {} does not include '{}'", plan_id, technique),
            ));
        }

        // A convergence session waits on every session of its upstream
        // plans that exists so far.
        let depends_on: Vec<String> = plan
            .depends_on
            .iter()
            .flat_map(|upstream| self.sessions_of_plan(upstream))
            .collect();

        let session = self.store.create_session(
            SessionData::new(technique, &plan.problem)
                .with_dependencies(depends_on.clone())
                .with_parallel_meta(ParallelMeta {
                    plan_id: plan.id.clone(),
                    techniques: plan.techniques.clone(),
                    independent: depends_on.is_empty(),
                }),
            None,
        )?;

        let mut graph = self.session_graph.write();
        graph.add_node(session.id.clone());
        for dependency in &depends_on {
            graph.add_edge(dependency.clone(), session.id.clone());
        }
        Ok(session)
    }

    fn sessions_of_plan(&self, plan_id: &str) -> Vec<String> {
        if let Some(group_id) = self.plan_groups.get(plan_id) {
            return self
                .store
                .get_group(group_id.value())
                .map(|g| g.members)
                .unwrap_or_default();
        }
        // Sequential plans have no group; scan by plan metadata.
        self.plans
            .get(plan_id)
            .map(|plan| {
                plan.techniques
                    .iter()
                    .filter_map(|t| self.store.find_by_plan(plan_id, t))
                    .map(|s| s.id)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Dependencies that still gate this session. A failed dependency will
    /// never complete; the partial-completion strategy decides what its
    /// absence means, so it does not block here.
    fn unfinished_dependencies(&self, session: &Session) -> Vec<String> {
        session
            .depends_on
            .iter()
            .filter(|dependency| {
                self.store
                    .get_session(dependency)
                    .map(|s| !s.status.is_terminal())
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    async fn park_waiting(
        &self,
        session: &Session,
        request: &StepRequest,
        blockers: Vec<String>,
    ) -> Result<StepResponse> {
        self.store
            .update_session(&session.id, |s| s.transition(SessionStatus::Waiting))
            .await?;
        if !self.monitor.is_monitoring(&session.id) {
            self.monitor.start_monitoring(&session.id, None);
        }
        self.monitor.mark_waiting(&session.id, blockers.clone());

        self.coordinator
            .report_progress(
                ProgressRecord::new(
                    &session.id,
                    ProgressStatus::Waiting,
                    request.current_step.saturating_sub(1),
                    request.total_steps,
                )
                .with_waiting_on(blockers.clone()),
            )
            .await?;

        debug!(session_id = %session.id, blockers = blockers.len(), "session parked waiting");
        Ok(StepResponse::Waiting {
            session_id: session.id.clone(),
            blocked_on: blockers,
        })
    }

    async fn activate(&self, session: &Session) -> Result<()> {
        match session.status {
            SessionStatus::Pending => {
                self.store
                    .update_session(&session.id, |s| s.transition(SessionStatus::Running))
                    .await?;
                self.monitor.start_monitoring(&session.id, None);
            }
            SessionStatus::Waiting => {
                self.store
                    .update_session(&session.id, |s| s.transition(SessionStatus::Running))
                    .await?;
                self.monitor.mark_running(&session.id);
            }
            SessionStatus::Running => {}
            // Terminal sessions were rejected before this point.
            SessionStatus::Completed | SessionStatus::Failed => {}
        }
        Ok(())
    }

    fn run_convergence_step(
        &self,
        session: &Session,
        request: &StepRequest,
    ) -> Result<ConvergenceOutcome> {
        let results = match &request.parallel_results {
            Some(results) if !results.is_empty() => results.clone(),
            _ => self.gather_parallel_results(session),
        };
        let mut options = session
            .parallel_meta
            .as_ref()
            .and_then(|meta| self.plan_options.get(&meta.plan_id).map(|o| o.clone()))
            .unwrap_or_default();

        // A fallback recovery marks upstream groups for simplified
        // convergence; honor it regardless of the requested options.
        if let Some(meta) = &session.parallel_meta
            && let Some(plan) = self.plans.get(&meta.plan_id).map(|p| p.clone())
        {
            let simplified = plan.depends_on.iter().any(|upstream| {
                self.plan_groups
                    .get(upstream)
                    .and_then(|group_id| self.store.get_group(group_id.value()))
                    .is_some_and(|group| group.convergence.simplified)
            });
            if simplified {
                options.simplified = true;
            }
        }

        self.convergence
            .execute_step(request.current_step, &results, &options)
    }

    /// Collect completed sessions' insights from the convergence plan's
    /// upstream groups.
    fn gather_parallel_results(&self, session: &Session) -> Vec<ParallelResult> {
        let Some(meta) = &session.parallel_meta else {
            return Vec::new();
        };
        let Some(plan) = self.plans.get(&meta.plan_id).map(|p| p.clone()) else {
            return Vec::new();
        };

        let mut results = Vec::new();
        for upstream in &plan.depends_on {
            for session_id in self.sessions_of_plan(upstream) {
                let Some(source) = self.store.get_session(&session_id) else {
                    continue;
                };
                if source.status != SessionStatus::Completed {
                    continue;
                }
                let confidence = self
                    .plan_groups
                    .get(upstream)
                    .and_then(|group_id| self.synchronizer.get_context(group_id.value()))
                    .and_then(|context| {
                        context
                            .metrics
                            .get(&format!("confidence_{}", session_id))
                            .copied()
                    })
                    .unwrap_or(0.5);
                results.push(ParallelResult::new(
                    source.technique.clone(),
                    source.insights.clone(),
                    confidence,
                ));
            }
        }
        results
    }

    async fn contribute_context(&self, group_id: &str, session_id: &str, request: &StepRequest) {
        let mut update = ContextUpdate::new(session_id);
        update.insights = request.insights.clone();
        for token in significant_tokens(&request.output) {
            *update.theme_weights.entry(token).or_insert(0.0) += 1.0;
        }
        if let Some(confidence) = request.confidence {
            update
                .metrics
                .insert(format!("confidence_{}", session_id), confidence);
        }
        // Sequential sessions have no shared context; that is not an error.
        if let Err(err) = self.synchronizer.update_shared_context(group_id, update).await
            && err.code != "GROUP_NOT_FOUND"
        {
            warn!(group_id, error = %err, "shared context update failed");
        }
    }

    async fn complete_session(
        &self,
        session: &Session,
        request: &StepRequest,
        convergence: Option<ConvergenceOutcome>,
    ) -> Result<StepResponse> {
        self.store
            .update_session(&session.id, |s| s.transition(SessionStatus::Completed))
            .await?;
        self.monitor.stop_monitoring(&session.id);

        if let Some(group_id) = &session.parallel_group {
            self.store
                .update_group(group_id, |group| group.mark_completed(&session.id))?;
        }

        self.coordinator
            .report_progress(ProgressRecord::new(
                &session.id,
                ProgressStatus::Completed,
                request.total_steps,
                request.total_steps,
            ))
            .await?;

        self.persist_session(&session.id).await;

        // Finishing the convergence session closes out its upstream groups.
        if session.technique == CONVERGENCE_TECHNIQUE
            && let Some(meta) = &session.parallel_meta
            && let Some(plan) = self.plans.get(&meta.plan_id).map(|p| p.clone())
        {
            for upstream in &plan.depends_on {
                if let Some(group_id) = self.plan_groups.get(upstream) {
                    let _ = self.store.update_group(group_id.value(), |group| {
                        if group.status == GroupStatus::Converging {
                            group.transition(GroupStatus::Completed)?;
                        }
                        Ok(())
                    });
                }
            }
        }

        let recovery = match &session.parallel_group {
            Some(group_id) => self.maybe_assess_group(group_id),
            None => None,
        };

        info!(session_id = %session.id, technique = %session.technique, "session completed");
        Ok(StepResponse::Completed {
            session_id: session.id.clone(),
            technique: session.technique.clone(),
            group_id: session.parallel_group.clone(),
            recovery,
            convergence,
        })
    }

    /// Write-through snapshot with retry; persistence trouble never fails
    /// the step that triggered it.
    async fn persist_session(&self, session_id: &str) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        let Some(session) = self.store.get_session(session_id) else {
            return;
        };
        let snapshot = SessionSnapshot::from_session(&session);
        let result = self
            .retry
            .execute("persist-session", || {
                let persistence = Arc::clone(persistence);
                let snapshot = snapshot.clone();
                async move { persistence.save(snapshot).await }
            })
            .await;
        if let Err(err) = result {
            warn!(session_id, error = %err, "session snapshot not persisted");
        }
    }

    // === Failure handling ===

    /// Capture an isolated session failure; siblings keep running. When the
    /// whole group has finished, the partial-completion strategy is
    /// returned.
    pub async fn fail_session(
        &self,
        session_id: &str,
        error: EngineError,
    ) -> Result<Option<PartialRecovery>> {
        let session = self
            .store
            .get_session(session_id)
            .ok_or_else(|| EngineError::session_not_found(session_id))?;
        if session.status.is_terminal() {
            return Err(EngineError::workflow(
                "SESSION_FINISHED",
                format!("Session {} already {}", session_id, session.status),
            ));
        }

        self.store
            .update_session(session_id, |s| s.transition(SessionStatus::Failed))
            .await?;
        self.monitor.stop_monitoring(session_id);

        self.bus.emit(EngineEvent::SessionFailed {
            session_id: session_id.to_string(),
            group_id: session.parallel_group.clone(),
            error: error.clone(),
        });
        self.coordinator
            .report_progress(
                ProgressRecord::new(session_id, ProgressStatus::Failed, 0, 0)
                    .with_message(error.message.clone()),
            )
            .await?;

        Ok(session
            .parallel_group
            .as_deref()
            .and_then(|group_id| self.maybe_assess_group(group_id)))
    }

    /// Assess a group once every member is terminal and at least one
    /// failed, then apply the selected strategy to the group status.
    fn maybe_assess_group(&self, group_id: &str) -> Option<PartialRecovery> {
        let group = self.store.get_group(group_id)?;
        if group.status.is_terminal() {
            return None;
        }

        let members: Vec<MemberState> = group
            .members
            .iter()
            .map(|member| MemberState {
                session_id: member.clone(),
                technique: self
                    .store
                    .get_session(member)
                    .map(|s| s.technique)
                    .unwrap_or_default(),
                status: self.coordinator.latest(member).map(|r| r.status),
            })
            .collect();

        let all_terminal = members
            .iter()
            .all(|m| m.status.is_some_and(|s| s.is_terminal()));
        let any_failed = members
            .iter()
            .any(|m| m.status == Some(ProgressStatus::Failed));
        if !all_terminal || !any_failed {
            return None;
        }

        let snapshot = GroupSnapshot {
            group_id: group_id.to_string(),
            members,
        };
        let recovery = {
            let graph = self.session_graph.read();
            self.partial.assess(&snapshot, &graph)
        };

        let target = match recovery.strategy {
            PartialStrategy::ProceedWithAvailable => Some(GroupStatus::PartialSuccess),
            PartialStrategy::FallbackToSimplifiedConvergence => Some(GroupStatus::PartialSuccess),
            PartialStrategy::AbortGroup => Some(GroupStatus::Failed),
            PartialStrategy::RetryCriticalSessions => None,
        };
        if let Some(target) = target {
            let _ = self.store.update_group(group_id, |g| g.transition(target));
        }
        if recovery.strategy == PartialStrategy::FallbackToSimplifiedConvergence {
            let _ = self.store.update_group(group_id, |g| {
                g.convergence.simplified = true;
                Ok(())
            });
        }
        Some(recovery)
    }

    /// Replace a failed session with a fresh one so the retry strategy can
    /// re-run it. Dependents are rewired to the replacement.
    pub async fn retry_failed_session(&self, session_id: &str) -> Result<Session> {
        let old = self
            .store
            .get_session(session_id)
            .ok_or_else(|| EngineError::session_not_found(session_id))?;
        if old.status != SessionStatus::Failed {
            return Err(EngineError::workflow(
                "NOT_FAILED",
                format!("Session {} is {}, only failed sessions retry", session_id, old.status),
            ));
        }

        let replacement = self.store.create_session(
            SessionData {
                technique: old.technique.clone(),
                problem: old.problem.clone(),
                parallel_group: old.parallel_group.clone(),
                depends_on: old.depends_on.clone(),
                parallel_meta: old.parallel_meta.clone(),
            },
            None,
        )?;

        if let Some(group_id) = &old.parallel_group {
            let new_id = replacement.id.clone();
            let old_id = old.id.clone();
            self.store.update_group(group_id, move |group| {
                for member in group.members.iter_mut() {
                    if *member == old_id {
                        *member = new_id.clone();
                    }
                }
                Ok(())
            })?;
        }

        // Dependents now wait on the replacement.
        let dependents: Vec<String> = {
            let graph = self.session_graph.read();
            graph.dependents_of(&old.id).to_vec()
        };
        {
            let mut graph = self.session_graph.write();
            graph.add_node(replacement.id.clone());
            for dependent in &dependents {
                graph.add_edge(replacement.id.clone(), dependent.clone());
            }
        }
        for dependent in &dependents {
            let old_id = old.id.clone();
            let new_id = replacement.id.clone();
            let _ = self
                .store
                .update_session(dependent, move |s| {
                    for dependency in s.depends_on.iter_mut() {
                        if *dependency == old_id {
                            *dependency = new_id.clone();
                        }
                    }
                    Ok(())
                })
                .await;
        }

        self.coordinator.forget_session(&old.id);
        self.store.delete_session(&old.id);
        info!(old = %old.id, new = %replacement.id, "failed session replaced for retry");
        Ok(replacement)
    }

    // === Queries, passthrough, lifecycle ===

    pub fn get_session(&self, session_id: &str) -> Option<Session> {
        self.store.get_session(session_id)
    }

    /// Refresh a session's activity timestamp under its lock.
    pub async fn touch_session(&self, session_id: &str) -> Result<()> {
        self.store.touch_session(session_id).await
    }

    pub fn delete_session(&self, session_id: &str) -> bool {
        self.monitor.stop_monitoring(session_id);
        self.coordinator.forget_session(session_id);
        self.store.delete_session(session_id)
    }

    pub fn get_plan(&self, plan_id: &str) -> Option<Plan> {
        self.plans.get(plan_id).map(|p| p.clone())
    }

    pub fn get_group(&self, group_id: &str) -> Option<ParallelGroup> {
        self.store.get_group(group_id)
    }

    pub fn group_progress(&self, group_id: &str) -> Result<GroupProgress> {
        self.coordinator.group_progress(group_id)
    }

    pub fn check_for_deadlock(&self, group_id: &str) -> Result<bool> {
        self.coordinator.check_for_deadlock(group_id)
    }

    pub fn context_summary(&self, group_id: &str) -> Result<ContextSummary> {
        self.synchronizer.context_summary(group_id)
    }

    pub fn merge_contexts(&self, group_ids: &[String]) -> SharedContext {
        self.synchronizer.merge_contexts(group_ids)
    }

    pub async fn checkpoint(&self, group_id: &str) -> Result<()> {
        self.synchronizer.checkpoint(group_id).await
    }

    pub fn extend_timeout(self: &Arc<Self>, session_id: &str, extra: Duration) {
        self.monitor.extend_timeout(session_id, extra);
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.bus.subscribe()
    }

    pub fn subscribe_session(&self, session_id: &str) -> EventReceiver {
        self.bus.subscribe_session(session_id)
    }

    pub fn subscribe_group(&self, group_id: &str) -> EventReceiver {
        self.bus.subscribe_group(group_id)
    }

    pub async fn list_snapshots(&self, options: &ListOptions) -> Result<Vec<SessionSnapshot>> {
        match &self.persistence {
            Some(persistence) => persistence.list(options).await,
            None => Ok(Vec::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Diagnostic lock state, surfaced for operators and tests.
    pub fn active_lock_count(&self) -> usize {
        self.store.locks().active_lock_count()
    }

    /// Stop every background task and timer and force-release all locks.
    /// The context is unusable afterwards.
    pub fn shutdown(&self) {
        for handle in self.background.lock().drain(..) {
            handle.abort();
        }
        self.monitor.shutdown();
        self.synchronizer.shutdown();
        self.coordinator.shutdown();
        self.store.locks().clear_all();
        info!("execution context shut down");
    }
}
