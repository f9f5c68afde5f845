//! End-to-end tests for the execution context facade.
//!
//! Covers the complete flow:
//! - plan creation with parallel groups and the execution graph
//! - step recording, dependency gating, and waiting responses
//! - convergence over completed parallel sessions
//! - partial-failure strategy selection
//! - persistence write-through and listing

use std::sync::Arc;

use confluence::{
    ConvergenceOutcome, EngineConfig, EngineError, ExecutionContext, ExecutionMode,
    InMemoryPersistence, ListOptions, PlanRequest, SessionStatus, SortBy, StepRequest,
    StepResponse, CONVERGENCE_TECHNIQUE,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .try_init();
}

fn parallel_request(techniques: &[&str]) -> PlanRequest {
    PlanRequest::new(
        "reduce churn in the first onboarding week",
        techniques.iter().map(|s| s.to_string()).collect(),
        ExecutionMode::Parallel,
    )
}

fn step(session_id: &str, technique: &str, current: u32, total: u32, more: bool) -> StepRequest {
    StepRequest {
        session_id: Some(session_id.to_string()),
        technique: technique.to_string(),
        current_step: current,
        total_steps: total,
        output: format!("{} step {} findings about onboarding friction", technique, current),
        next_step_needed: more,
        insights: vec![format!("{} insight {}", technique, current)],
        confidence: Some(0.7),
        ..StepRequest::default()
    }
}

// ============================================================================
// Plan Operation
// ============================================================================

mod plan_operation {
    use super::*;

    #[tokio::test]
    async fn test_parallel_plan_creates_groups_and_sessions() {
        init_tracing();
        let context = ExecutionContext::new(EngineConfig::default()).unwrap();

        let response = context
            .plan(parallel_request(&["six_hats", "scamper"]))
            .await
            .unwrap();

        assert_eq!(response.mode, ExecutionMode::Parallel);
        // One technique group plus the convergence plan.
        assert_eq!(response.plan_ids.len(), 2);
        assert_eq!(response.groups.len(), 1);
        assert_eq!(response.groups[0].sessions.len(), 2);
        assert!(!response.execution_graph.nodes.is_empty());

        for planned in &response.groups[0].sessions {
            let session = context.get_session(&planned.session_id).unwrap();
            assert_eq!(session.status, SessionStatus::Pending);
            assert_eq!(session.parallel_group.as_deref(), Some(response.groups[0].group_id.as_str()));
        }
        context.shutdown();
    }

    #[tokio::test]
    async fn test_parallel_plan_requires_two_techniques() {
        let context = ExecutionContext::new(EngineConfig::default()).unwrap();
        let err = context
            .plan(parallel_request(&["six_hats"]))
            .await
            .unwrap_err();
        assert_eq!(err.code, "TOO_FEW_TECHNIQUES");
        context.shutdown();
    }

    #[tokio::test]
    async fn test_dependent_techniques_split_across_groups() {
        let context = ExecutionContext::new(EngineConfig::default()).unwrap();

        let response = context
            .plan(parallel_request(&["random_entry", "concept_extraction"]))
            .await
            .unwrap();

        assert_eq!(response.groups.len(), 2);
        // The dependent session carries a hard dependency on the other.
        let dependent = response
            .groups
            .iter()
            .flat_map(|g| &g.sessions)
            .find(|s| s.technique == "concept_extraction")
            .unwrap();
        let session = context.get_session(&dependent.session_id).unwrap();
        assert_eq!(session.depends_on.len(), 1);
        context.shutdown();
    }

    #[tokio::test]
    async fn test_sequential_plan_defers_session_creation() {
        let context = ExecutionContext::new(EngineConfig::default()).unwrap();
        let mut request = parallel_request(&["po", "triz"]);
        request.mode = ExecutionMode::Sequential;

        let response = context.plan(request).await.unwrap();
        assert!(response.groups.is_empty());

        // First step creates the session lazily.
        let result = context
            .step(StepRequest {
                plan_id: Some(response.plan_ids[0].clone()),
                technique: "po".to_string(),
                current_step: 1,
                total_steps: 4,
                output: "provocation established".to_string(),
                next_step_needed: true,
                ..StepRequest::default()
            })
            .await
            .unwrap();
        assert!(matches!(result, StepResponse::Advanced { .. }));
        context.shutdown();
    }
}

// ============================================================================
// Step Operation & Dependency Gating
// ============================================================================

mod step_operation {
    use super::*;

    #[tokio::test]
    async fn test_full_session_walkthrough() {
        init_tracing();
        let context = ExecutionContext::new(EngineConfig::default()).unwrap();
        let response = context
            .plan(parallel_request(&["six_hats", "po"]))
            .await
            .unwrap();

        let hats = response.groups[0]
            .sessions
            .iter()
            .find(|s| s.technique == "six_hats")
            .unwrap();

        for n in 1..=6u32 {
            let result = context
                .step(step(&hats.session_id, "six_hats", n, 6, n < 6))
                .await
                .unwrap();
            if n < 6 {
                assert!(matches!(result, StepResponse::Advanced { .. }));
            } else {
                assert!(matches!(result, StepResponse::Completed { .. }));
            }
        }

        let session = context.get_session(&hats.session_id).unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.history.len(), 6);
        assert_eq!(session.insights.len(), 6);
        context.shutdown();
    }

    #[tokio::test]
    async fn test_dependency_gate_parks_session_waiting() {
        let context = ExecutionContext::new(EngineConfig::default()).unwrap();
        let response = context
            .plan(parallel_request(&["random_entry", "concept_extraction"]))
            .await
            .unwrap();

        let blocked = response
            .groups
            .iter()
            .flat_map(|g| &g.sessions)
            .find(|s| s.technique == "concept_extraction")
            .unwrap();
        let prerequisite = response
            .groups
            .iter()
            .flat_map(|g| &g.sessions)
            .find(|s| s.technique == "random_entry")
            .unwrap();

        let result = context
            .step(step(&blocked.session_id, "concept_extraction", 1, 4, true))
            .await
            .unwrap();
        let StepResponse::Waiting { blocked_on, .. } = result else {
            panic!("expected a waiting response");
        };
        assert_eq!(blocked_on, vec![prerequisite.session_id.clone()]);
        assert_eq!(
            context.get_session(&blocked.session_id).unwrap().status,
            SessionStatus::Waiting
        );

        // Complete the prerequisite, then the dependent proceeds.
        for n in 1..=3u32 {
            context
                .step(step(&prerequisite.session_id, "random_entry", n, 3, n < 3))
                .await
                .unwrap();
        }
        let result = context
            .step(step(&blocked.session_id, "concept_extraction", 1, 4, true))
            .await
            .unwrap();
        assert!(matches!(result, StepResponse::Advanced { .. }));
        context.shutdown();
    }

    #[tokio::test]
    async fn test_step_on_finished_session_is_workflow_error() {
        let context = ExecutionContext::new(EngineConfig::default()).unwrap();
        let response = context
            .plan(parallel_request(&["six_hats", "po"]))
            .await
            .unwrap();
        let po = response.groups[0]
            .sessions
            .iter()
            .find(|s| s.technique == "po")
            .unwrap();

        context
            .step(step(&po.session_id, "po", 4, 4, false))
            .await
            .unwrap();
        let err = context
            .step(step(&po.session_id, "po", 1, 4, true))
            .await
            .unwrap_err();
        assert_eq!(err.code, "SESSION_FINISHED");
        context.shutdown();
    }

    #[tokio::test]
    async fn test_technique_mismatch_rejected() {
        let context = ExecutionContext::new(EngineConfig::default()).unwrap();
        let response = context
            .plan(parallel_request(&["six_hats", "po"]))
            .await
            .unwrap();
        let po = response.groups[0]
            .sessions
            .iter()
            .find(|s| s.technique == "po")
            .unwrap();

        let err = context
            .step(step(&po.session_id, "six_hats", 1, 6, true))
            .await
            .unwrap_err();
        assert_eq!(err.code, "TECHNIQUE_MISMATCH");
        context.shutdown();
    }

    #[tokio::test]
    async fn test_out_of_range_step_rejected() {
        let context = ExecutionContext::new(EngineConfig::default()).unwrap();
        let err = context
            .step(StepRequest {
                session_id: Some("whatever".to_string()),
                technique: "po".to_string(),
                current_step: 5,
                total_steps: 4,
                ..StepRequest::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.code, "INVALID_STEP");
        context.shutdown();
    }
}

// ============================================================================
// Convergence Flow
// ============================================================================

mod convergence_flow {
    use super::*;

    async fn complete_group(context: &Arc<ExecutionContext>) -> (String, String) {
        let response = context
            .plan(parallel_request(&["six_hats", "po"]))
            .await
            .unwrap();

        for planned in &response.groups[0].sessions {
            let total = if planned.technique == "six_hats" { 6 } else { 4 };
            for n in 1..=total {
                context
                    .step(step(&planned.session_id, &planned.technique, n, total, n < total))
                    .await
                    .unwrap();
            }
        }

        let convergence_plan = response.plan_ids.last().unwrap().clone();
        (convergence_plan, response.groups[0].group_id.clone())
    }

    #[tokio::test]
    async fn test_convergence_gathers_group_results() {
        init_tracing();
        let context = ExecutionContext::new(EngineConfig::default()).unwrap();
        let (convergence_plan, _group) = complete_group(&context).await;

        let result = context
            .step(StepRequest {
                plan_id: Some(convergence_plan.clone()),
                technique: CONVERGENCE_TECHNIQUE.to_string(),
                current_step: 1,
                total_steps: 3,
                output: "collecting".to_string(),
                next_step_needed: true,
                ..StepRequest::default()
            })
            .await
            .unwrap();

        let StepResponse::Advanced { convergence, .. } = result else {
            panic!("expected an advanced response");
        };
        let Some(ConvergenceOutcome::Collected {
            by_technique,
            total_insights,
        }) = convergence
        else {
            panic!("expected a collection outcome");
        };
        assert_eq!(by_technique.len(), 2);
        assert_eq!(total_insights, 10);
        context.shutdown();
    }

    #[tokio::test]
    async fn test_convergence_synthesis_merges_unique_insights() {
        let context = ExecutionContext::new(EngineConfig::default()).unwrap();
        let (convergence_plan, _group) = complete_group(&context).await;

        let mut final_response = None;
        for n in 1..=3u32 {
            final_response = Some(
                context
                    .step(StepRequest {
                        plan_id: Some(convergence_plan.clone()),
                        technique: CONVERGENCE_TECHNIQUE.to_string(),
                        current_step: n,
                        total_steps: 3,
                        output: "synthesizing".to_string(),
                        next_step_needed: n < 3,
                        ..StepRequest::default()
                    })
                    .await
                    .unwrap(),
            );
        }

        let StepResponse::Completed { convergence, .. } = final_response.unwrap() else {
            panic!("expected completion");
        };
        let Some(ConvergenceOutcome::Synthesized(synthesis)) = convergence else {
            panic!("expected synthesis");
        };
        assert!(!synthesis.insights.is_empty());
        assert!(synthesis.insights.len() <= 5);
        context.shutdown();
    }

    #[tokio::test]
    async fn test_convergence_without_results_is_missing_parameter() {
        let context = ExecutionContext::new(EngineConfig::default()).unwrap();

        // A convergence-only sequential plan has no upstream results.
        let mut request = parallel_request(&[CONVERGENCE_TECHNIQUE]);
        request.mode = ExecutionMode::Sequential;
        let response = context.plan(request).await.unwrap();

        let err = context
            .step(StepRequest {
                plan_id: Some(response.plan_ids[0].clone()),
                technique: CONVERGENCE_TECHNIQUE.to_string(),
                current_step: 1,
                total_steps: 3,
                output: "nothing to merge".to_string(),
                next_step_needed: true,
                ..StepRequest::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.code, "MISSING_PARAMETER");
        context.shutdown();
    }

    #[tokio::test]
    async fn test_convergence_accepts_inline_results() {
        use confluence::ParallelResult;

        let context = ExecutionContext::new(EngineConfig::default()).unwrap();
        let mut request = parallel_request(&[CONVERGENCE_TECHNIQUE]);
        request.mode = ExecutionMode::Sequential;
        let response = context.plan(request).await.unwrap();

        let result = context
            .step(StepRequest {
                plan_id: Some(response.plan_ids[0].clone()),
                technique: CONVERGENCE_TECHNIQUE.to_string(),
                current_step: 1,
                total_steps: 3,
                output: "inline".to_string(),
                next_step_needed: true,
                parallel_results: Some(vec![
                    ParallelResult::new("po", vec!["a".to_string(), "b".to_string()], 0.5),
                    ParallelResult::new("triz", vec!["c".to_string(), "d".to_string()], 0.5),
                ]),
                ..StepRequest::default()
            })
            .await
            .unwrap();

        let StepResponse::Advanced { convergence, .. } = result else {
            panic!("expected advanced");
        };
        assert!(matches!(
            convergence,
            Some(ConvergenceOutcome::Collected {
                total_insights: 4,
                ..
            })
        ));
        context.shutdown();
    }
}

// ============================================================================
// Partial Failure & Recovery
// ============================================================================

mod partial_failure {
    use super::*;
    use confluence::{GroupStatus, PartialStrategy};

    #[tokio::test]
    async fn test_failed_sibling_is_isolated_and_assessed() {
        init_tracing();
        let context = ExecutionContext::new(EngineConfig::default()).unwrap();
        let response = context
            .plan(parallel_request(&["six_hats", "po"]))
            .await
            .unwrap();
        let group_id = response.groups[0].group_id.clone();
        let hats = response.groups[0]
            .sessions
            .iter()
            .find(|s| s.technique == "six_hats")
            .unwrap();
        let po = response.groups[0]
            .sessions
            .iter()
            .find(|s| s.technique == "po")
            .unwrap();

        // po fails; six_hats keeps going and completes.
        let recovery = context
            .fail_session(&po.session_id, EngineError::system("AGENT_DOWN", "worker lost"))
            .await
            .unwrap();
        assert!(recovery.is_none(), "group not finished yet");

        for n in 1..=6u32 {
            context
                .step(step(&hats.session_id, "six_hats", n, 6, n < 6))
                .await
                .unwrap();
        }

        // Completing the last sibling triggers assessment: one of two
        // members completed, that is at least the default ratio.
        let group = context.get_group(&group_id).unwrap();
        assert_eq!(group.status, GroupStatus::PartialSuccess);
        context.shutdown();
    }

    #[tokio::test]
    async fn test_all_failed_aborts_group() {
        let context = ExecutionContext::new(EngineConfig::default()).unwrap();
        let response = context
            .plan(parallel_request(&["six_hats", "po"]))
            .await
            .unwrap();
        let group_id = response.groups[0].group_id.clone();

        let mut last = None;
        for planned in &response.groups[0].sessions {
            last = context
                .fail_session(
                    &planned.session_id,
                    EngineError::system("AGENT_DOWN", "worker lost"),
                )
                .await
                .unwrap();
        }

        let recovery = last.unwrap();
        assert_eq!(recovery.strategy, PartialStrategy::AbortGroup);
        assert_eq!(
            context.get_group(&group_id).unwrap().status,
            GroupStatus::Failed
        );
        context.shutdown();
    }

    #[tokio::test]
    async fn test_retry_replaces_failed_session() {
        let context = ExecutionContext::new(EngineConfig::default()).unwrap();
        let response = context
            .plan(parallel_request(&["six_hats", "po"]))
            .await
            .unwrap();
        let po = response.groups[0]
            .sessions
            .iter()
            .find(|s| s.technique == "po")
            .unwrap();

        context
            .fail_session(&po.session_id, EngineError::system("AGENT_DOWN", "lost"))
            .await
            .unwrap();

        let replacement = context.retry_failed_session(&po.session_id).await.unwrap();
        assert_eq!(replacement.technique, "po");
        assert!(context.get_session(&po.session_id).is_none());

        let group = context
            .get_group(&response.groups[0].group_id)
            .unwrap();
        assert!(group.members.contains(&replacement.id));
        assert!(!group.members.contains(&po.session_id));
        context.shutdown();
    }
}

// ============================================================================
// Persistence Write-Through
// ============================================================================

mod persistence {
    use super::*;

    #[tokio::test]
    async fn test_completed_sessions_are_snapshotted_and_listable() {
        let persistence = Arc::new(InMemoryPersistence::new());
        let context = ExecutionContext::builder(EngineConfig::default())
            .with_persistence(persistence)
            .build()
            .unwrap();

        let response = context
            .plan(parallel_request(&["six_hats", "po"]))
            .await
            .unwrap();
        for planned in &response.groups[0].sessions {
            let total = if planned.technique == "six_hats" { 6 } else { 4 };
            for n in 1..=total {
                context
                    .step(step(&planned.session_id, &planned.technique, n, total, n < total))
                    .await
                    .unwrap();
            }
        }

        let snapshots = context
            .list_snapshots(&ListOptions {
                sort_by: SortBy::Technique,
                ..ListOptions::default()
            })
            .await
            .unwrap();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].technique, "po");
        assert_eq!(snapshots[1].technique, "six_hats");
        context.shutdown();
    }
}
