//! Concurrency-safe technique grouping.
//!
//! Deterministic greedy clustering: the next ungrouped technique seeds a
//! group, then the remaining ungrouped techniques are scanned in reverse
//! order and admitted when pairwise-compatible with every current member.

/// Technique pairs where the second must fully complete after the first;
/// they can never share a concurrent group.
const HARD_DEPENDENCIES: &[(&str, &str)] = &[
    ("random_entry", "concept_extraction"),
    ("po", "yes_and"),
];

/// Techniques that interfere with each other and never co-schedule.
const MUTUALLY_EXCLUSIVE: &[(&str, &str)] = &[("six_hats", "disney_method")];

/// Whether `a` and `b` may run in the same concurrent group.
pub fn compatible(a: &str, b: &str) -> bool {
    if a == b {
        // The same technique twice in one group buys nothing.
        return false;
    }
    let hard = HARD_DEPENDENCIES
        .iter()
        .any(|(x, y)| (x == &a && y == &b) || (x == &b && y == &a));
    let exclusive = MUTUALLY_EXCLUSIVE
        .iter()
        .any(|(x, y)| (x == &a && y == &b) || (x == &b && y == &a));
    !hard && !exclusive
}

/// Hard-dependency edges among `techniques`, as (prerequisite, dependent).
pub fn hard_dependency_edges(techniques: &[String]) -> Vec<(String, String)> {
    HARD_DEPENDENCIES
        .iter()
        .filter(|(first, second)| {
            techniques.iter().any(|t| t == first) && techniques.iter().any(|t| t == second)
        })
        .map(|(first, second)| (first.to_string(), second.to_string()))
        .collect()
}

/// Split `techniques` into concurrency-safe groups of at most
/// `max_parallelism` members. Deterministic for a given input order.
pub fn group_techniques(techniques: &[String], max_parallelism: usize) -> Vec<Vec<String>> {
    let mut ungrouped: Vec<String> = techniques.to_vec();
    let mut groups = Vec::new();

    while !ungrouped.is_empty() {
        let mut group = vec![ungrouped.remove(0)];

        // Reverse scan keeps the clustering greedy but reproducible.
        let mut index = ungrouped.len();
        while index > 0 && group.len() < max_parallelism {
            index -= 1;
            let candidate = &ungrouped[index];
            if group.iter().all(|member| compatible(member, candidate)) {
                group.push(ungrouped.remove(index));
            }
        }

        groups.push(group);
    }

    groups
}
