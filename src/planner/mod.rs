//! Plan generation: request validation, concurrency-safe grouping, and the
//! caller-facing execution graph.

mod execution_graph;
mod grouping;
mod validation;

pub use execution_graph::{ExecutionGraph, StepEdge, StepNode};
pub use grouping::{group_techniques, hard_dependency_edges};
pub use validation::{PlanValidation, ResourceEstimate, ValidationWarning};

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::config::PlannerConfig;
use crate::convergence::{ConvergenceOptions, CONVERGENCE_TECHNIQUE};
use crate::error::Result;
use crate::sync::SyncStrategy;

/// How a plan's techniques execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Sequential,
    Parallel,
}

/// Step metadata supplied by the external technique registry.
///
/// The engine never interprets technique content; it only needs step counts
/// and validity.
pub trait TechniqueRegistry: Send + Sync {
    fn step_count(&self, technique: &str) -> u32;

    fn is_valid_step(&self, technique: &str, step: u32) -> bool {
        step >= 1 && step <= self.step_count(technique)
    }

    fn step_label(&self, technique: &str, step: u32) -> String {
        format!("{} step {}", technique, step)
    }
}

/// Registry backed by a fixed table, with a fallback step count for
/// techniques it has never seen.
pub struct StaticTechniqueRegistry {
    counts: HashMap<String, u32>,
    default_steps: u32,
}

impl StaticTechniqueRegistry {
    pub fn new(counts: HashMap<String, u32>, default_steps: u32) -> Self {
        Self {
            counts,
            default_steps,
        }
    }
}

impl Default for StaticTechniqueRegistry {
    fn default() -> Self {
        let counts = [
            ("six_hats", 6),
            ("po", 4),
            ("random_entry", 3),
            ("scamper", 7),
            ("concept_extraction", 4),
            ("yes_and", 4),
            ("design_thinking", 5),
            ("triz", 4),
            ("disney_method", 3),
            ("nine_windows", 9),
            (CONVERGENCE_TECHNIQUE, 3),
        ]
        .into_iter()
        .map(|(name, count)| (name.to_string(), count))
        .collect();

        Self {
            counts,
            default_steps: 5,
        }
    }
}

impl TechniqueRegistry for StaticTechniqueRegistry {
    fn step_count(&self, technique: &str) -> u32 {
        self.counts
            .get(technique)
            .copied()
            .unwrap_or(self.default_steps)
    }
}

/// A planning request from the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRequest {
    pub problem: String,
    pub techniques: Vec<String>,
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default)]
    pub convergence: Option<ConvergenceOptions>,
    /// How members share context; immediate unless the caller says so.
    #[serde(default)]
    pub sync_strategy: SyncStrategy,
    /// Desired concurrency; clamped against the configured ceiling.
    #[serde(default)]
    pub requested_parallelism: Option<usize>,
}

impl PlanRequest {
    pub fn new(problem: impl Into<String>, techniques: Vec<String>, mode: ExecutionMode) -> Self {
        Self {
            problem: problem.into(),
            techniques,
            mode,
            convergence: None,
            sync_strategy: SyncStrategy::default(),
            requested_parallelism: None,
        }
    }
}

/// One step of a technique workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub number: u32,
    pub label: String,
}

/// The ordered workflow for one technique inside a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TechniqueWorkflow {
    pub technique: String,
    pub steps: Vec<WorkflowStep>,
}

/// A generated workflow for one concurrency-safe technique group.
/// Immutable once created except for status bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub problem: String,
    pub techniques: Vec<String>,
    pub workflows: Vec<TechniqueWorkflow>,
    pub mode: ExecutionMode,
    /// Plan ids that must complete before this plan starts.
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Plan {
    fn new(
        problem: &str,
        techniques: Vec<String>,
        mode: ExecutionMode,
        registry: &dyn TechniqueRegistry,
    ) -> Self {
        let workflows = techniques
            .iter()
            .map(|technique| TechniqueWorkflow {
                technique: technique.clone(),
                steps: (1..=registry.step_count(technique))
                    .map(|number| WorkflowStep {
                        number,
                        label: registry.step_label(technique, number),
                    })
                    .collect(),
            })
            .collect();

        Self {
            id: format!("plan-{}", Uuid::new_v4()),
            problem: problem.to_string(),
            techniques,
            workflows,
            mode,
            depends_on: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn total_steps(&self) -> u32 {
        self.workflows
            .iter()
            .map(|w| w.steps.len() as u32)
            .sum()
    }

    pub fn is_convergence(&self) -> bool {
        self.techniques
            .iter()
            .any(|t| t == CONVERGENCE_TECHNIQUE)
    }
}

/// Everything `PlanGenerator::generate` hands back to the caller.
#[derive(Debug, Clone)]
pub struct GeneratedPlan {
    pub plans: Vec<Plan>,
    pub execution_graph: ExecutionGraph,
    pub validation: PlanValidation,
    pub mode: ExecutionMode,
    /// True when resource pressure forced a parallel request sequential.
    pub degraded: bool,
}

/// Splits a multi-technique request into concurrency-safe groups and emits
/// the client-facing execution DAG.
pub struct PlanGenerator {
    config: PlannerConfig,
}

impl PlanGenerator {
    pub fn new(config: PlannerConfig) -> Self {
        Self { config }
    }

    /// Generate plans for a request.
    ///
    /// `degrade` forces sequential execution (resource pressure); the
    /// request itself is still validated as submitted.
    pub fn generate(
        &self,
        request: &PlanRequest,
        registry: &dyn TechniqueRegistry,
        degrade: bool,
    ) -> Result<GeneratedPlan> {
        let validation = validation::validate(request, &self.config)?;

        let mode = match request.mode {
            ExecutionMode::Parallel if degrade => {
                debug!("degrading parallel request to sequential under pressure");
                ExecutionMode::Sequential
            }
            mode => mode,
        };

        let max_parallelism = request
            .requested_parallelism
            .unwrap_or(self.config.max_parallelism)
            .min(self.config.max_parallelism);

        let mut plans = match mode {
            ExecutionMode::Sequential => vec![Plan::new(
                &request.problem,
                request.techniques.clone(),
                ExecutionMode::Sequential,
                registry,
            )],
            ExecutionMode::Parallel => {
                group_techniques(&request.techniques, max_parallelism)
                    .into_iter()
                    .map(|group| {
                        Plan::new(&request.problem, group, ExecutionMode::Parallel, registry)
                    })
                    .collect()
            }
        };

        // More than one technique overall: converge the results.
        if request.techniques.len() > 1 {
            let upstream: Vec<String> = plans.iter().map(|p| p.id.clone()).collect();
            let mut convergence = Plan::new(
                &request.problem,
                vec![CONVERGENCE_TECHNIQUE.to_string()],
                mode,
                registry,
            );
            convergence.depends_on = upstream;
            plans.push(convergence);
        }

        let execution_graph =
            execution_graph::build(&request.techniques, registry, max_parallelism);

        debug!(
            plans = plans.len(),
            mode = ?mode,
            techniques = request.techniques.len(),
            "generated plan set"
        );

        Ok(GeneratedPlan {
            plans,
            execution_graph,
            validation,
            mode,
            degraded: degrade && request.mode == ExecutionMode::Parallel,
        })
    }
}
