//! Configuration types and loading.
//!
//! One `EngineConfig` with a sub-config per component, all serde-defaulted
//! so a partial TOML file (or none at all) yields a working engine.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub store: SessionStoreConfig,
    pub planner: PlannerConfig,
    pub timeout: TimeoutConfig,
    pub retry: RetryConfig,
    pub partial: PartialCompletionConfig,
    pub sync: SyncConfig,
    pub convergence: ConvergenceConfig,
}

impl EngineConfig {
    pub async fn load(dir: &Path) -> Result<Self> {
        let config_path = dir.join("config.toml");
        let config = if config_path.exists() {
            let content = fs::read_to_string(&config_path).await?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self, dir: &Path) -> Result<()> {
        self.validate()?;
        let config_path = dir.join("config.toml");
        let content = toml::to_string_pretty(self)
            .map_err(|e| EngineError::validation("TOML", e.to_string()))?;
        fs::write(&config_path, content).await?;
        Ok(())
    }

    /// Validate configuration values for consistency and safety.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.store.max_sessions == 0 {
            errors.push("store.max_sessions must be greater than 0");
        }
        if self.store.session_ttl_secs == 0 {
            errors.push("store.session_ttl_secs must be greater than 0");
        }
        if self.store.cleanup_interval_secs == 0 {
            errors.push("store.cleanup_interval_secs must be greater than 0");
        }
        if !(0.0..=1.0).contains(&self.store.pressure_threshold) {
            errors.push("store.pressure_threshold must be between 0.0 and 1.0");
        }

        if self.planner.max_parallelism < 2 {
            errors.push("planner.max_parallelism must be at least 2");
        }
        if self.planner.max_concurrent_calls == 0 {
            errors.push("planner.max_concurrent_calls must be greater than 0");
        }

        if self.timeout.execution_timeout_secs == 0 {
            errors.push("timeout.execution_timeout_secs must be greater than 0");
        }
        if self.timeout.dependency_timeout_secs == 0 {
            errors.push("timeout.dependency_timeout_secs must be greater than 0");
        }
        if self.timeout.staleness_check_interval_secs == 0 {
            errors.push("timeout.staleness_check_interval_secs must be greater than 0");
        }

        if self.retry.base_delay_ms == 0 {
            errors.push("retry.base_delay_ms must be greater than 0");
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            errors.push("retry.base_delay_ms must not exceed retry.max_delay_ms");
        }
        if self.retry.max_attempts == 0 {
            errors.push("retry.max_attempts must be greater than 0");
        }

        if !(0.0..=1.0).contains(&self.partial.min_completion_ratio) {
            errors.push("partial.min_completion_ratio must be between 0.0 and 1.0");
        }

        if self.sync.batch_size_cap == 0 {
            errors.push("sync.batch_size_cap must be greater than 0");
        }

        if !(0.0..=1.0).contains(&self.convergence.conflict_rate) {
            errors.push("convergence.conflict_rate must be between 0.0 and 1.0");
        }
        if self.convergence.max_themes == 0 {
            errors.push("convergence.max_themes must be greater than 0");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(EngineError::validation("CONFIG", errors.join("; ")))
        }
    }
}

/// Session registry limits and eviction policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionStoreConfig {
    /// Hard cap on live sessions.
    pub max_sessions: usize,
    /// Approximate per-session size cap (history payload bytes).
    pub max_session_bytes: usize,
    /// Idle sessions older than this are eligible for eviction.
    pub session_ttl_secs: u64,
    /// Background cleanup cadence.
    pub cleanup_interval_secs: u64,
    /// When enabled, crossing `pressure_threshold` of capacity triggers a
    /// proactive eviction sweep and lets parallel plans degrade to
    /// sequential execution.
    pub memory_monitoring: bool,
    pub pressure_threshold: f64,
}

impl Default for SessionStoreConfig {
    fn default() -> Self {
        Self {
            max_sessions: 100,
            max_session_bytes: 1024 * 1024,
            session_ttl_secs: 3600,
            cleanup_interval_secs: 300,
            memory_monitoring: true,
            pressure_threshold: 0.8,
        }
    }
}

impl SessionStoreConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn pressure_limit(&self) -> usize {
        ((self.max_sessions as f64) * self.pressure_threshold).floor() as usize
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Largest concurrent group one plan may spawn.
    pub max_parallelism: usize,
    /// Ceiling on in-flight step calls across one request.
    pub max_concurrent_calls: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_parallelism: 5,
            max_concurrent_calls: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Execution budget per session.
    pub execution_timeout_secs: u64,
    /// How long a session may wait on unfinished dependencies.
    pub dependency_timeout_secs: u64,
    /// Elapsed time since last progress before a staleness advisory.
    pub staleness_threshold_secs: u64,
    /// Cadence of the staleness check.
    pub staleness_check_interval_secs: u64,
    /// How long completed groups linger before deferred cleanup.
    pub group_retention_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            execution_timeout_secs: 300,
            dependency_timeout_secs: 120,
            staleness_threshold_secs: 60,
            staleness_check_interval_secs: 30,
            group_retention_secs: 300,
        }
    }
}

impl TimeoutConfig {
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }

    pub fn dependency_timeout(&self) -> Duration {
        Duration::from_secs(self.dependency_timeout_secs)
    }

    pub fn staleness_threshold(&self) -> Duration {
        Duration::from_secs(self.staleness_threshold_secs)
    }

    pub fn staleness_check_interval(&self) -> Duration {
        Duration::from_secs(self.staleness_check_interval_secs)
    }

    pub fn group_retention(&self) -> Duration {
        Duration::from_secs(self.group_retention_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PartialCompletionConfig {
    /// A failed session is critical once more than this many sessions
    /// depend on it.
    pub critical_dependents_threshold: usize,
    /// Fraction of members that must have completed before proceeding
    /// without the failures.
    pub min_completion_ratio: f64,
    /// Group-level retries of critical sessions before falling back.
    pub retry_budget: u32,
}

impl Default for PartialCompletionConfig {
    fn default() -> Self {
        Self {
            critical_dependents_threshold: 2,
            min_completion_ratio: 0.5,
            retry_budget: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Queued batched updates are flushed once this many accumulate.
    pub batch_size_cap: usize,
    /// Debounce window for batched updates.
    pub batch_window_ms: u64,
    /// Theme count returned by context summaries.
    pub summary_themes: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size_cap: 10,
            batch_window_ms: 500,
            summary_themes: 5,
        }
    }
}

impl SyncConfig {
    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvergenceConfig {
    /// Estimated fraction of sources expected to conflict.
    pub conflict_rate: f64,
    /// Themes extracted during the analysis step.
    pub max_themes: usize,
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            conflict_rate: 0.10,
            max_themes: 5,
        }
    }
}
