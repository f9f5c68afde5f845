//! In-process orchestration of parallel technique sessions.
//!
//! The engine plans multi-technique requests into concurrency-safe groups,
//! schedules them against a dependency graph, tracks progress and timeouts,
//! recovers from partial failures, shares context across sessions, and
//! converges completed results into one synthesis.

pub mod config;
pub mod convergence;
pub mod engine;
pub mod error;
pub mod events;
pub mod graph;
pub mod partial;
pub mod persist;
pub mod planner;
pub mod progress;
pub mod retry;
pub mod session;
pub mod sync;
pub mod timeout;

pub use config::EngineConfig;
pub use convergence::{
    ConvergenceEngine, ConvergenceOptions, ConvergenceOutcome, ConvergenceStrategy,
    ParallelResult, SynthesisResult, CONVERGENCE_TECHNIQUE,
};
pub use engine::{
    ExecutionContext, ExecutionContextBuilder, PlanResponse, PlannedGroup, PlannedSession,
    StepRequest, StepResponse,
};
pub use error::{EngineError, ErrorCategory, ErrorSeverity, Result};
pub use events::{EngineEvent, EventBus, EventReceiver};
pub use graph::DependencyGraph;
pub use partial::{PartialCompletionHandler, PartialRecovery, PartialStrategy};
pub use persist::{InMemoryPersistence, ListOptions, SessionPersistence, SessionSnapshot, SortBy, SortOrder};
pub use planner::{
    ExecutionGraph, ExecutionMode, Plan, PlanGenerator, PlanRequest, StaticTechniqueRegistry,
    TechniqueRegistry,
};
pub use progress::{GroupProgress, ProgressCoordinator, ProgressRecord, ProgressStatus};
pub use retry::{RetryExecutor, RetryPolicy};
pub use session::{
    GroupStatus, ParallelGroup, Session, SessionData, SessionLocks, SessionStatus, SessionStore,
    StepRecord,
};
pub use sync::{ContextSummary, ContextUpdate, SessionSynchronizer, SharedContext, SyncStrategy};
pub use timeout::TimeoutMonitor;
