//! Plan request validation and resource estimation.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::{ExecutionMode, PlanRequest};
use crate::config::PlannerConfig;
use crate::error::{EngineError, Result};

/// Technique pairs where one benefits from the other completing first.
/// Soft ordering only: co-scheduling them is allowed but warned about.
const DEPENDENT_PAIRS: &[(&str, &str)] = &[
    ("design_thinking", "scamper"),
    ("random_entry", "po"),
    ("triz", "nine_windows"),
];

/// Static per-technique cost table: (memory MiB, wall-clock seconds).
fn technique_cost(technique: &str) -> (f64, f64) {
    match technique {
        "six_hats" => (48.0, 180.0),
        "po" => (32.0, 120.0),
        "random_entry" => (24.0, 90.0),
        "scamper" => (64.0, 210.0),
        "concept_extraction" => (40.0, 120.0),
        "yes_and" => (32.0, 120.0),
        "design_thinking" => (56.0, 180.0),
        "triz" => (48.0, 150.0),
        "disney_method" => (32.0, 100.0),
        "nine_windows" => (96.0, 270.0),
        _ => (64.0, 150.0),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationWarning {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceEstimate {
    pub memory_mb: f64,
    pub time_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanValidation {
    pub warnings: Vec<ValidationWarning>,
    pub estimate: ResourceEstimate,
}

/// Validate a plan request. Hard violations error; everything else is a
/// warning attached to the result.
pub fn validate(request: &PlanRequest, config: &PlannerConfig) -> Result<PlanValidation> {
    if request.techniques.is_empty() {
        return Err(EngineError::missing_parameter("techniques"));
    }

    if request.mode == ExecutionMode::Parallel && request.techniques.len() < 2 {
        return Err(EngineError::validation(
            "TOO_FEW_TECHNIQUES",
            "Parallel mode requires at least 2 techniques",
        )
        .with_recovery(["Add another technique or switch to sequential mode"]));
    }

    if request.techniques.len() > config.max_concurrent_calls {
        return Err(EngineError::validation(
            "TOO_MANY_TECHNIQUES",
            format!(
                "{} techniques exceed the {}-call ceiling for one request",
                request.techniques.len(),
                config.max_concurrent_calls
            ),
        )
        .with_recovery(["Split the techniques across multiple plan requests"]));
    }

    if let Some(requested) = request.requested_parallelism
        && requested > config.max_parallelism
    {
        return Err(EngineError::validation(
            "PARALLELISM_CEILING",
            format!(
                "Requested parallelism {} exceeds the ceiling of {}",
                requested, config.max_parallelism
            ),
        )
        .with_recovery([format!(
            "Request at most {} concurrent sessions",
            config.max_parallelism
        )]));
    }

    let mut warnings = Vec::new();

    // Duplicates are allowed but usually a caller mistake.
    let mut seen = HashSet::new();
    for technique in &request.techniques {
        if !seen.insert(technique.as_str()) {
            warnings.push(ValidationWarning {
                code: "DUPLICATE_TECHNIQUE".into(),
                message: format!("Technique '{}' appears more than once", technique),
                recommendation: None,
            });
        }
    }

    // Known orderings: warn, never reject.
    for (first, second) in DEPENDENT_PAIRS {
        if seen.contains(first) && seen.contains(second) {
            warnings.push(ValidationWarning {
                code: "DEPENDENT_TECHNIQUES".into(),
                message: format!("'{}' benefits from '{}' completing first", second, first),
                recommendation: Some(format!(
                    "Schedule '{}' before '{}' or keep them in separate groups",
                    first, second
                )),
            });
        }
    }

    Ok(PlanValidation {
        estimate: estimate(request, config),
        warnings,
    })
}

fn estimate(request: &PlanRequest, config: &PlannerConfig) -> ResourceEstimate {
    let memory_mb: f64 = request
        .techniques
        .iter()
        .map(|t| technique_cost(t).0)
        .sum();
    let sequential_secs: f64 = request
        .techniques
        .iter()
        .map(|t| technique_cost(t).1)
        .sum();

    let time_secs = match request.mode {
        ExecutionMode::Sequential => sequential_secs,
        ExecutionMode::Parallel => {
            // Parallel speedup follows √group-size, not linear scaling.
            let group_size = request
                .techniques
                .len()
                .min(config.max_parallelism)
                .max(1) as f64;
            sequential_secs / group_size.sqrt()
        }
    };

    ResourceEstimate {
        memory_mb,
        time_secs,
    }
}
