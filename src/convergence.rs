//! Multi-step synthesis of completed parallel sessions' outputs.
//!
//! A small step-indexed machine over the synthetic convergence technique:
//! collect, analyze, synthesize, then open-ended deepening for any step
//! beyond the third.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ConvergenceConfig;
use crate::error::{EngineError, Result};

/// Name of the synthetic technique that merges a group's results.
pub const CONVERGENCE_TECHNIQUE: &str = "convergence";

/// Cap on insights kept by merge-style synthesis.
const MAX_MERGED_INSIGHTS: usize = 5;
/// Tokens this short carry no thematic signal.
const MIN_TOKEN_LEN: usize = 4;

/// Frequent English words excluded from theme extraction.
const STOP_WORDS: &[&str] = &[
    "about", "after", "again", "against", "because", "before", "being", "between", "could",
    "doing", "during", "every", "might", "other", "should", "their", "there", "these", "those",
    "through", "under", "where", "which", "while", "would",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergenceStrategy {
    /// Deduplicate and keep the strongest insights across all sources.
    #[default]
    Merge,
    /// Rank sources by confidence and keep the top source's leading
    /// insights.
    Select,
    /// First source leads; a sample of the rest supports.
    Hierarchical,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvergenceOptions {
    pub strategy: ConvergenceStrategy,
    /// Set by the partial-completion fallback: skip conflict analysis.
    pub simplified: bool,
}

/// One completed source feeding convergence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelResult {
    pub technique: String,
    pub insights: Vec<String>,
    /// Source confidence used by the select strategy.
    pub confidence: f64,
}

impl ParallelResult {
    pub fn new(technique: impl Into<String>, insights: Vec<String>, confidence: f64) -> Self {
        Self {
            technique: technique.into(),
            insights,
            confidence,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Theme {
    pub name: String,
    pub frequency: usize,
}

/// Final synthesis produced by step 3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisResult {
    pub strategy: ConvergenceStrategy,
    pub insights: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub supporting: Vec<String>,
}

/// What each convergence step produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum ConvergenceOutcome {
    /// Step 1: insights bucketed by source technique.
    Collected {
        by_technique: Vec<(String, Vec<String>)>,
        total_insights: usize,
    },
    /// Step 2: dominant themes and the conflict estimate.
    Analyzed {
        themes: Vec<Theme>,
        estimated_conflicts: usize,
    },
    /// Step 3: strategy-specific synthesis.
    Synthesized(SynthesisResult),
    /// Any step beyond 3 deepens the existing synthesis.
    Deepened { step: u32, focus: String },
}

/// Step-indexed convergence machine.
pub struct ConvergenceEngine {
    config: ConvergenceConfig,
}

impl ConvergenceEngine {
    pub fn new(config: ConvergenceConfig) -> Self {
        Self { config }
    }

    /// Execute one convergence step over the supplied parallel results.
    ///
    /// Fails with a missing-parameter error when no results exist; steps
    /// start at 1.
    pub fn execute_step(
        &self,
        step: u32,
        results: &[ParallelResult],
        options: &ConvergenceOptions,
    ) -> Result<ConvergenceOutcome> {
        if results.is_empty() {
            return Err(EngineError::missing_parameter("parallel_results")
                .with_recovery([
                    "Complete at least one parallel session before converging",
                    "Or supply results inline with the convergence step",
                ]));
        }
        if step == 0 {
            return Err(EngineError::validation(
                "INVALID_STEP",
                "Convergence steps start at 1",
            ));
        }

        debug!(step, sources = results.len(), "convergence step");
        match step {
            1 => Ok(self.collect(results)),
            2 => Ok(self.analyze(results, options)),
            3 => Ok(ConvergenceOutcome::Synthesized(
                self.synthesize(results, options),
            )),
            deeper => Ok(ConvergenceOutcome::Deepened {
                step: deeper,
                focus: format!(
                    "Re-examine the synthesis across {} sources for second-order implications",
                    results.len()
                ),
            }),
        }
    }

    fn collect(&self, results: &[ParallelResult]) -> ConvergenceOutcome {
        let by_technique: Vec<(String, Vec<String>)> = results
            .iter()
            .map(|r| (r.technique.clone(), r.insights.clone()))
            .collect();
        let total_insights = results.iter().map(|r| r.insights.len()).sum();
        ConvergenceOutcome::Collected {
            by_technique,
            total_insights,
        }
    }

    fn analyze(
        &self,
        results: &[ParallelResult],
        options: &ConvergenceOptions,
    ) -> ConvergenceOutcome {
        let themes = extract_themes(results, self.config.max_themes);
        let estimated_conflicts = if options.simplified {
            0
        } else {
            (results.len() as f64 * self.config.conflict_rate).ceil() as usize
        };
        ConvergenceOutcome::Analyzed {
            themes,
            estimated_conflicts,
        }
    }

    fn synthesize(
        &self,
        results: &[ParallelResult],
        options: &ConvergenceOptions,
    ) -> SynthesisResult {
        match options.strategy {
            ConvergenceStrategy::Merge => {
                let mut seen = Vec::new();
                let mut insights = Vec::new();
                for result in results {
                    for insight in &result.insights {
                        let key = insight.trim().to_lowercase();
                        if !seen.contains(&key) {
                            seen.push(key);
                            insights.push(insight.clone());
                        }
                        if insights.len() >= MAX_MERGED_INSIGHTS {
                            break;
                        }
                    }
                    if insights.len() >= MAX_MERGED_INSIGHTS {
                        break;
                    }
                }
                SynthesisResult {
                    strategy: ConvergenceStrategy::Merge,
                    insights,
                    primary: None,
                    supporting: Vec::new(),
                }
            }
            ConvergenceStrategy::Select => {
                let mut ranked: Vec<&ParallelResult> = results.iter().collect();
                ranked.sort_by(|a, b| {
                    b.confidence
                        .partial_cmp(&a.confidence)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| a.technique.cmp(&b.technique))
                });
                let top = ranked[0];
                SynthesisResult {
                    strategy: ConvergenceStrategy::Select,
                    insights: top
                        .insights
                        .iter()
                        .take(MAX_MERGED_INSIGHTS)
                        .cloned()
                        .collect(),
                    primary: None,
                    supporting: Vec::new(),
                }
            }
            ConvergenceStrategy::Hierarchical => {
                let primary = results[0].insights.first().cloned();
                let supporting: Vec<String> = results
                    .iter()
                    .skip(1)
                    .filter_map(|r| r.insights.first().cloned())
                    .collect();
                let mut insights = Vec::new();
                insights.extend(primary.clone());
                insights.extend(supporting.iter().cloned());
                SynthesisResult {
                    strategy: ConvergenceStrategy::Hierarchical,
                    insights,
                    primary,
                    supporting,
                }
            }
        }
    }
}

/// Lowercased tokens of `text` that carry thematic signal: longer than
/// `MIN_TOKEN_LEN` and not a stop word.
pub(crate) fn significant_tokens(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .map(str::to_lowercase)
        .filter(|token| token.len() > MIN_TOKEN_LEN && !STOP_WORDS.contains(&token.as_str()))
        .collect()
}

/// Rank the most frequent significant tokens across all insights.
fn extract_themes(results: &[ParallelResult], max_themes: usize) -> Vec<Theme> {
    let mut frequencies: HashMap<String, usize> = HashMap::new();

    for result in results {
        for insight in &result.insights {
            for token in significant_tokens(insight) {
                *frequencies.entry(token).or_insert(0) += 1;
            }
        }
    }

    let mut themes: Vec<Theme> = frequencies
        .into_iter()
        .map(|(name, frequency)| Theme { name, frequency })
        .collect();
    themes.sort_by(|a, b| {
        b.frequency
            .cmp(&a.frequency)
            .then_with(|| a.name.cmp(&b.name))
    });
    themes.truncate(max_themes);
    themes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> ConvergenceEngine {
        ConvergenceEngine::new(ConvergenceConfig::default())
    }

    fn two_sources() -> Vec<ParallelResult> {
        vec![
            ParallelResult::new(
                "six_hats",
                vec![
                    "simplify the onboarding journey".to_string(),
                    "automate account verification".to_string(),
                ],
                0.6,
            ),
            ParallelResult::new(
                "scamper",
                vec![
                    "combine signup and profile setup".to_string(),
                    "eliminate redundant confirmation".to_string(),
                ],
                0.9,
            ),
        ]
    }

    #[test]
    fn test_zero_results_is_missing_parameter() {
        let err = engine()
            .execute_step(1, &[], &ConvergenceOptions::default())
            .unwrap_err();
        assert_eq!(err.code, "MISSING_PARAMETER");
    }

    #[test]
    fn test_step_one_buckets_by_technique() {
        let outcome = engine()
            .execute_step(1, &two_sources(), &ConvergenceOptions::default())
            .unwrap();

        let ConvergenceOutcome::Collected {
            by_technique,
            total_insights,
        } = outcome
        else {
            panic!("expected collection outcome");
        };
        assert_eq!(by_technique.len(), 2);
        assert_eq!(total_insights, 4);
        assert_eq!(by_technique[0].0, "six_hats");
    }

    #[test]
    fn test_step_two_extracts_themes_and_conflicts() {
        let results = vec![
            ParallelResult::new(
                "po",
                vec!["friction slows onboarding friction".to_string()],
                0.5,
            ),
            ParallelResult::new("triz", vec!["reduce onboarding friction".to_string()], 0.5),
        ];

        let outcome = engine()
            .execute_step(2, &results, &ConvergenceOptions::default())
            .unwrap();
        let ConvergenceOutcome::Analyzed {
            themes,
            estimated_conflicts,
        } = outcome
        else {
            panic!("expected analysis outcome");
        };

        assert_eq!(themes[0].name, "friction");
        assert_eq!(themes[0].frequency, 3);
        // ceil(2 sources * 0.10)
        assert_eq!(estimated_conflicts, 1);
    }

    #[test]
    fn test_simplified_analysis_skips_conflicts() {
        let options = ConvergenceOptions {
            simplified: true,
            ..ConvergenceOptions::default()
        };
        let outcome = engine().execute_step(2, &two_sources(), &options).unwrap();
        let ConvergenceOutcome::Analyzed {
            estimated_conflicts,
            ..
        } = outcome
        else {
            panic!("expected analysis outcome");
        };
        assert_eq!(estimated_conflicts, 0);
    }

    #[test]
    fn test_merge_keeps_all_unique_insights() {
        let outcome = engine()
            .execute_step(3, &two_sources(), &ConvergenceOptions::default())
            .unwrap();
        let ConvergenceOutcome::Synthesized(synthesis) = outcome else {
            panic!("expected synthesis outcome");
        };
        assert_eq!(synthesis.insights.len(), 4);
    }

    #[test]
    fn test_merge_deduplicates_and_caps() {
        let results = vec![
            ParallelResult::new(
                "po",
                vec![
                    "Same idea".to_string(),
                    "same idea ".to_string(),
                    "a".to_string(),
                    "b".to_string(),
                    "c".to_string(),
                    "d".to_string(),
                ],
                0.5,
            ),
            ParallelResult::new("triz", vec!["e".to_string()], 0.5),
        ];

        let ConvergenceOutcome::Synthesized(synthesis) = engine()
            .execute_step(3, &results, &ConvergenceOptions::default())
            .unwrap()
        else {
            panic!("expected synthesis outcome");
        };
        assert_eq!(synthesis.insights.len(), 5);
        assert_eq!(synthesis.insights[0], "Same idea");
        assert!(!synthesis.insights.contains(&"e".to_string()));
    }

    #[test]
    fn test_select_takes_highest_confidence_source() {
        let options = ConvergenceOptions {
            strategy: ConvergenceStrategy::Select,
            simplified: false,
        };
        let ConvergenceOutcome::Synthesized(synthesis) = engine()
            .execute_step(3, &two_sources(), &options)
            .unwrap()
        else {
            panic!("expected synthesis outcome");
        };

        // scamper has confidence 0.9.
        assert!(synthesis.insights[0].starts_with("combine"));
    }

    #[test]
    fn test_hierarchical_marks_primary_and_supporting() {
        let options = ConvergenceOptions {
            strategy: ConvergenceStrategy::Hierarchical,
            simplified: false,
        };
        let ConvergenceOutcome::Synthesized(synthesis) = engine()
            .execute_step(3, &two_sources(), &options)
            .unwrap()
        else {
            panic!("expected synthesis outcome");
        };

        assert_eq!(
            synthesis.primary.as_deref(),
            Some("simplify the onboarding journey")
        );
        assert_eq!(synthesis.supporting.len(), 1);
    }

    #[test]
    fn test_deep_steps_keep_deepening() {
        let outcome = engine()
            .execute_step(7, &two_sources(), &ConvergenceOptions::default())
            .unwrap();
        assert!(matches!(
            outcome,
            ConvergenceOutcome::Deepened { step: 7, .. }
        ));
    }
}
