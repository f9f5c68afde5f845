//! Concurrency-facing integration tests.
//!
//! Exercises the pieces the facade composes under interleaved load:
//! - lock ordering across concurrent updaters
//! - progress aggregation and deadlock advisories through the engine
//! - timeout expiry folding back into session state
//! - shared-context accumulation from step traffic
//! - pressure-driven degradation of parallel plans

use std::sync::Arc;
use std::time::Duration;

use confluence::{
    EngineConfig, EngineEvent, ExecutionContext, ExecutionMode, PlanRequest, ProgressStatus,
    SessionStatus, StepRequest, StepResponse,
};

fn parallel_request(techniques: &[&str]) -> PlanRequest {
    PlanRequest::new(
        "cut support ticket volume in half",
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
        output: format!("{} step {} explored ticket deflection paths", technique, current),
        next_step_needed: more,
        insights: vec![format!("{} insight {}", technique, current)],
        confidence: Some(0.6),
        ..StepRequest::default()
    }
}

// ============================================================================
// Concurrent Step Traffic
// ============================================================================

#[tokio::test]
async fn test_concurrent_steps_from_both_sessions_interleave_safely() {
    let context = ExecutionContext::new(EngineConfig::default()).unwrap();
    let response = context
        .plan(parallel_request(&["six_hats", "scamper"]))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for planned in response.groups[0].sessions.clone() {
        let context = Arc::clone(&context);
        let total = if planned.technique == "six_hats" { 6 } else { 7 };
        handles.push(tokio::spawn(async move {
            for n in 1..=total {
                context
                    .step(step(&planned.session_id, &planned.technique, n, total, n < total))
                    .await
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    for planned in &response.groups[0].sessions {
        let session = context.get_session(&planned.session_id).unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
    }

    let progress = context
        .group_progress(&response.groups[0].group_id)
        .unwrap();
    assert_eq!(progress.completed, 2);
    assert!((progress.overall - 1.0).abs() < 1e-9);
    assert_eq!(context.active_lock_count(), 0);
    context.shutdown();
}

#[tokio::test]
async fn test_group_progress_midway() {
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
    for n in 1..=3u32 {
        context
            .step(step(&hats.session_id, "six_hats", n, 6, true))
            .await
            .unwrap();
    }

    let progress = context.group_progress(&group_id).unwrap();
    assert_eq!(progress.in_progress, 1);
    // 3 of 6 reported; po has not reported yet.
    assert!((progress.overall - 0.5).abs() < 1e-9);
    assert!(progress.estimated_remaining.is_some());
    context.shutdown();
}

// ============================================================================
// Deadlock Advisory
// ============================================================================

#[tokio::test]
async fn test_deadlock_advisory_through_engine() {
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

    let result = context
        .step(step(&blocked.session_id, "concept_extraction", 1, 4, true))
        .await
        .unwrap();
    assert!(matches!(result, StepResponse::Waiting { .. }));

    // The waiting session's own (single-member) group is all-waiting.
    let blocked_group = response
        .groups
        .iter()
        .find(|g| g.sessions.iter().any(|s| s.session_id == blocked.session_id))
        .unwrap();
    assert!(context.check_for_deadlock(&blocked_group.group_id).unwrap());

    // The other group has no reports at all: not a deadlock.
    let other_group = response
        .groups
        .iter()
        .find(|g| g.group_id != blocked_group.group_id)
        .unwrap();
    assert!(!context.check_for_deadlock(&other_group.group_id).unwrap());
    context.shutdown();
}

// ============================================================================
// Timeout Expiry Folds Into Session State
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_execution_timeout_fails_the_session() {
    let mut config = EngineConfig::default();
    config.timeout.execution_timeout_secs = 5;
    let context = ExecutionContext::new(config).unwrap();

    let response = context
        .plan(parallel_request(&["six_hats", "po"]))
        .await
        .unwrap();
    let hats = response.groups[0]
        .sessions
        .iter()
        .find(|s| s.technique == "six_hats")
        .unwrap();

    let mut events = context.subscribe_session(&hats.session_id);
    context
        .step(step(&hats.session_id, "six_hats", 1, 6, true))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(6)).await;
    // Let the timeout listener drain the event.
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }

    let session = context.get_session(&hats.session_id).unwrap();
    assert_eq!(session.status, SessionStatus::Failed);

    let mut saw_timeout = false;
    let mut saw_failed_progress = false;
    while let Some(event) = events.try_recv() {
        match event {
            EngineEvent::ExecutionTimedOut { .. } => saw_timeout = true,
            EngineEvent::Progress { record, .. } if record.status == ProgressStatus::Failed => {
                saw_failed_progress = true;
            }
            _ => {}
        }
    }
    assert!(saw_timeout);
    assert!(saw_failed_progress);
    context.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_timeout_warning_precedes_expiry() {
    let mut config = EngineConfig::default();
    config.timeout.execution_timeout_secs = 10;
    let context = ExecutionContext::new(config).unwrap();

    let response = context
        .plan(parallel_request(&["six_hats", "po"]))
        .await
        .unwrap();
    let hats = response.groups[0]
        .sessions
        .iter()
        .find(|s| s.technique == "six_hats")
        .unwrap();

    let mut events = context.subscribe_session(&hats.session_id);
    context
        .step(step(&hats.session_id, "six_hats", 1, 6, true))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(9)).await;
    let warned = std::iter::from_fn(|| events.try_recv())
        .any(|e| matches!(e, EngineEvent::TimeoutWarning { .. }));
    assert!(warned, "80% warning before expiry");
    assert_eq!(
        context.get_session(&hats.session_id).unwrap().status,
        SessionStatus::Running
    );
    context.shutdown();
}

// ============================================================================
// Shared Context From Step Traffic
// ============================================================================

#[tokio::test]
async fn test_steps_accumulate_shared_context() {
    let context = ExecutionContext::new(EngineConfig::default()).unwrap();
    let response = context
        .plan(parallel_request(&["six_hats", "po"]))
        .await
        .unwrap();
    let group_id = response.groups[0].group_id.clone();

    for planned in &response.groups[0].sessions {
        context
            .step(step(&planned.session_id, &planned.technique, 1, 6, true))
            .await
            .unwrap();
    }

    let summary = context.context_summary(&group_id).unwrap();
    assert_eq!(summary.update_count, 2);
    assert_eq!(summary.insight_count, 2);
    // Both outputs mention "ticket": weights from two sessions add up.
    let ticket = summary
        .top_themes
        .iter()
        .find(|(name, _)| name == "ticket");
    assert!(matches!(ticket, Some((_, weight)) if *weight >= 2.0));
    context.shutdown();
}

#[tokio::test]
async fn test_merge_contexts_across_groups() {
    let context = ExecutionContext::new(EngineConfig::default()).unwrap();
    let response = context
        .plan(parallel_request(&["random_entry", "concept_extraction"]))
        .await
        .unwrap();
    assert_eq!(response.groups.len(), 2);

    let independent = response
        .groups
        .iter()
        .flat_map(|g| &g.sessions)
        .find(|s| s.technique == "random_entry")
        .unwrap();
    context
        .step(step(&independent.session_id, "random_entry", 1, 3, true))
        .await
        .unwrap();

    let group_ids: Vec<String> = response.groups.iter().map(|g| g.group_id.clone()).collect();
    let merged = context.merge_contexts(&group_ids);
    assert_eq!(merged.insights.len(), 1);
    assert_eq!(merged.update_count, 1);
    context.shutdown();
}

// ============================================================================
// Pressure Degradation
// ============================================================================

#[tokio::test]
async fn test_pressure_degrades_parallel_to_sequential() {
    let mut config = EngineConfig::default();
    config.store.max_sessions = 10;
    config.store.pressure_threshold = 0.1;
    let context = ExecutionContext::new(config).unwrap();

    // Occupy the store past the pressure limit.
    let filler = context
        .plan(parallel_request(&["six_hats", "po"]))
        .await
        .unwrap();
    assert!(!filler.degraded, "first request sees no pressure");

    let response = context
        .plan(parallel_request(&["scamper", "triz"]))
        .await
        .unwrap();
    assert!(response.degraded);
    assert_eq!(response.mode, ExecutionMode::Sequential);
    assert!(response.groups.is_empty());
    context.shutdown();
}
