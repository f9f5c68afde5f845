//! Directed dependency graph over technique/session identifiers.
//!
//! An edge `from -> to` records that `to` depends on `from` completing
//! first. Cycle enumeration uses three-state DFS coloring; scheduling uses
//! Kahn's algorithm restricted to a caller-supplied id subset.

use std::collections::{HashMap, HashSet, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    Unvisited,
    OnStack,
    Done,
}

/// Dependency graph with a reverse index for dependent lookups.
#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    /// Insertion-ordered node list; keeps traversals deterministic.
    order: Vec<String>,
    /// prerequisite -> nodes that depend on it.
    dependents: HashMap<String, Vec<String>>,
    /// node -> its prerequisites.
    dependencies: HashMap<String, Vec<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, id: impl Into<String>) {
        let id = id.into();
        if !self.dependencies.contains_key(&id) {
            self.order.push(id.clone());
            self.dependencies.insert(id.clone(), Vec::new());
            self.dependents.insert(id, Vec::new());
        }
    }

    /// Record that `to` depends on `from` completing first.
    pub fn add_edge(&mut self, from: impl Into<String>, to: impl Into<String>) {
        let from = from.into();
        let to = to.into();
        self.add_node(from.clone());
        self.add_node(to.clone());

        let deps = self.dependencies.get_mut(&to).expect("node just added");
        if !deps.contains(&from) {
            deps.push(from.clone());
            self.dependents
                .get_mut(&from)
                .expect("node just added")
                .push(to);
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.dependencies.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Prerequisites of `id`, in edge-insertion order.
    pub fn dependencies_of(&self, id: &str) -> &[String] {
        self.dependencies.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Nodes that depend on `id`, via the reverse index.
    pub fn dependents_of(&self, id: &str) -> &[String] {
        self.dependents.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Enumerate dependency cycles.
    ///
    /// DFS with three-state coloring; every back edge into an on-stack node
    /// emits the current stack slice from that node forward as one cycle.
    /// O(V+E).
    pub fn detect_cycles(&self) -> Vec<Vec<String>> {
        let mut colors: HashMap<&str, Color> = self
            .order
            .iter()
            .map(|id| (id.as_str(), Color::Unvisited))
            .collect();
        let mut path: Vec<&str> = Vec::new();
        let mut cycles = Vec::new();

        for id in &self.order {
            if colors[id.as_str()] == Color::Unvisited {
                self.visit(id, &mut colors, &mut path, &mut cycles);
            }
        }

        cycles
    }

    fn visit<'a>(
        &'a self,
        node: &'a str,
        colors: &mut HashMap<&'a str, Color>,
        path: &mut Vec<&'a str>,
        cycles: &mut Vec<Vec<String>>,
    ) {
        colors.insert(node, Color::OnStack);
        path.push(node);

        for next in self.dependents_of(node) {
            match colors[next.as_str()] {
                Color::Unvisited => self.visit(next, colors, path, cycles),
                Color::OnStack => {
                    // Back edge: the slice from `next` to the stack top is
                    // one cycle.
                    if let Some(start) = path.iter().position(|&n| n == next.as_str()) {
                        cycles.push(path[start..].iter().map(|s| s.to_string()).collect());
                    }
                }
                Color::Done => {}
            }
        }

        path.pop();
        colors.insert(node, Color::Done);
    }

    /// Kahn's algorithm restricted to `ids`.
    ///
    /// The queue is seeded in input order so output stays deterministic.
    /// Returns `None` when a cycle prevents emitting every id; that is the
    /// cycle signal, not an error.
    pub fn topological_order(&self, ids: &[String]) -> Option<Vec<String>> {
        let subset: HashSet<&str> = ids.iter().map(String::as_str).collect();

        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        for id in ids {
            let degree = self
                .dependencies_of(id)
                .iter()
                .filter(|dep| subset.contains(dep.as_str()))
                .count();
            in_degree.insert(id.as_str(), degree);
        }

        let mut queue: VecDeque<&str> = ids
            .iter()
            .filter(|id| in_degree.get(id.as_str()) == Some(&0))
            .map(String::as_str)
            .collect();

        let mut result = Vec::with_capacity(ids.len());
        while let Some(node) = queue.pop_front() {
            result.push(node.to_string());
            for next in self.dependents_of(node) {
                if let Some(degree) = in_degree.get_mut(next.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(next);
                    }
                }
            }
        }

        (result.len() == ids.len()).then_some(result)
    }
}
