//! Caller-facing execution DAG over technique steps.
//!
//! Nodes are individual technique steps; edges come from a per-technique
//! pattern table plus cross-technique hard dependencies. The graph also
//! reports the critical path and an achievable parallelism figure.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::TechniqueRegistry;
use super::grouping::hard_dependency_edges;

/// Error-handling policy advertised to the caller.
const ERROR_POLICY: &str = "continue on non-critical failure";

/// How one technique's steps depend on each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepPattern {
    /// Every step is independent.
    Parallel,
    /// Strict chain, each step gates the next.
    Sequential,
    /// First step gates a parallel middle, last step joins.
    DivergeConverge,
}

fn step_pattern(technique: &str) -> StepPattern {
    match technique {
        "six_hats" | "scamper" | "nine_windows" => StepPattern::Parallel,
        "concept_extraction" | "triz" => StepPattern::DivergeConverge,
        _ => StepPattern::Sequential,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepNode {
    pub id: String,
    pub technique: String,
    pub step: u32,
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepEdge {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionGraph {
    pub nodes: Vec<StepNode>,
    pub edges: Vec<StepEdge>,
    /// Widest set of steps that can run at once.
    pub max_parallelism: usize,
    /// Longest dependency chain, as node ids.
    pub critical_path: Vec<String>,
    pub strategy: String,
    pub error_policy: String,
}

fn node_id(technique: &str, step: u32) -> String {
    format!("{}-{}", technique, step)
}

/// Build the execution graph for a technique set.
pub fn build(
    techniques: &[String],
    registry: &dyn TechniqueRegistry,
    parallelism_ceiling: usize,
) -> ExecutionGraph {
    let mut nodes = Vec::new();
    let mut edges = Vec::new();

    for technique in techniques {
        let count = registry.step_count(technique);
        for step in 1..=count {
            nodes.push(StepNode {
                id: node_id(technique, step),
                technique: technique.clone(),
                step,
                label: registry.step_label(technique, step),
            });
        }

        match step_pattern(technique) {
            StepPattern::Parallel => {}
            StepPattern::Sequential => {
                for step in 1..count {
                    edges.push(StepEdge {
                        from: node_id(technique, step),
                        to: node_id(technique, step + 1),
                    });
                }
            }
            StepPattern::DivergeConverge if count >= 3 => {
                for step in 2..count {
                    edges.push(StepEdge {
                        from: node_id(technique, 1),
                        to: node_id(technique, step),
                    });
                    edges.push(StepEdge {
                        from: node_id(technique, step),
                        to: node_id(technique, count),
                    });
                }
            }
            StepPattern::DivergeConverge => {
                // Too few steps to fan out; degrade to a chain.
                for step in 1..count {
                    edges.push(StepEdge {
                        from: node_id(technique, step),
                        to: node_id(technique, step + 1),
                    });
                }
            }
        }
    }

    // A hard technique dependency gates the dependent's first step behind
    // the prerequisite's last.
    for (prereq, dependent) in hard_dependency_edges(techniques) {
        edges.push(StepEdge {
            from: node_id(&prereq, registry.step_count(&prereq)),
            to: node_id(&dependent, 1),
        });
    }

    let (critical_path, max_width) = analyze(&nodes, &edges);

    let strategy = if edges.is_empty() {
        format!(
            "All {} steps are independent; run up to {} concurrently",
            nodes.len(),
            max_width.min(parallelism_ceiling)
        )
    } else {
        format!(
            "Run independent steps concurrently (width {}), honoring {} ordering edges",
            max_width.min(parallelism_ceiling),
            edges.len()
        )
    };

    ExecutionGraph {
        nodes,
        edges,
        max_parallelism: max_width.min(parallelism_ceiling),
        critical_path,
        strategy,
        error_policy: ERROR_POLICY.to_string(),
    }
}

/// Longest chain (critical path) and widest level of the step DAG.
///
/// DFS from every zero-dependency node; the graph is acyclic by
/// construction so memoized depth is safe.
fn analyze(nodes: &[StepNode], edges: &[StepEdge]) -> (Vec<String>, usize) {
    let mut outgoing: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut in_degree: HashMap<&str, usize> = nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
    for edge in edges {
        outgoing
            .entry(edge.from.as_str())
            .or_default()
            .push(edge.to.as_str());
        *in_degree.entry(edge.to.as_str()).or_default() += 1;
    }

    fn longest<'a>(
        node: &'a str,
        outgoing: &HashMap<&'a str, Vec<&'a str>>,
        memo: &mut HashMap<&'a str, Vec<&'a str>>,
    ) -> Vec<&'a str> {
        if let Some(path) = memo.get(node) {
            return path.clone();
        }
        let mut best: Vec<&str> = Vec::new();
        for next in outgoing.get(node).into_iter().flatten() {
            let path = longest(*next, outgoing, memo);
            if path.len() > best.len() {
                best = path;
            }
        }
        let mut path = vec![node];
        path.extend(best);
        memo.insert(node, path.clone());
        path
    }

    let mut memo = HashMap::new();
    let mut critical: Vec<&str> = Vec::new();
    for node in nodes {
        if in_degree[node.id.as_str()] == 0 {
            let path = longest(node.id.as_str(), &outgoing, &mut memo);
            if path.len() > critical.len() {
                critical = path;
            }
        }
    }

    // Width = the largest set of nodes sharing a depth level.
    let mut level: HashMap<&str, usize> = HashMap::new();
    let mut remaining: Vec<&StepNode> = nodes.iter().collect();
    while !remaining.is_empty() {
        let before = remaining.len();
        remaining.retain(|node| {
            let deps_ready = edges
                .iter()
                .filter(|e| e.to == node.id)
                .all(|e| level.contains_key(e.from.as_str()));
            if deps_ready {
                let depth = edges
                    .iter()
                    .filter(|e| e.to == node.id)
                    .map(|e| level[e.from.as_str()] + 1)
                    .max()
                    .unwrap_or(0);
                level.insert(node.id.as_str(), depth);
                false
            } else {
                true
            }
        });
        if remaining.len() == before {
            break;
        }
    }

    let mut width_per_level: HashMap<usize, usize> = HashMap::new();
    for depth in level.values() {
        *width_per_level.entry(*depth).or_default() += 1;
    }
    let max_width = width_per_level.values().copied().max().unwrap_or(0);

    (
        critical.into_iter().map(String::from).collect(),
        max_width,
    )
}
