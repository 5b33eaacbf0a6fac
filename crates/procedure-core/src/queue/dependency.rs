//! Dependency graph of the procedures held by one queue.
//!
//! Design:
//! - Forward edges: procedure -> procedures it depends on (waits for)
//! - Reverse edges: procedure -> procedures that depend on it (waiting)
//! - Invariant: edges and reverse_edges must be kept in sync
//! - The graph only guards against cycles; readiness itself is driven by the
//!   finished signal of each dependency.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

use crate::domain::ProcedureId;

/// Dependency graph for cycle detection among queued procedures.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    /// Forward edges: procedure -> procedures it depends on
    edges: HashMap<ProcedureId, HashSet<ProcedureId>>,

    /// Reverse edges: procedure -> procedures waiting for it
    reverse_edges: HashMap<ProcedureId, HashSet<ProcedureId>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    Gray,
    Black,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// `procedure` depends on `depends_on`.
    pub fn add_dependency(&mut self, procedure: ProcedureId, depends_on: ProcedureId) {
        self.edges.entry(procedure).or_default().insert(depends_on);
        self.reverse_edges
            .entry(depends_on)
            .or_default()
            .insert(procedure);
    }

    pub fn remove_dependency(&mut self, procedure: ProcedureId, depends_on: ProcedureId) {
        if let Entry::Occupied(mut e) = self.edges.entry(procedure) {
            e.get_mut().remove(&depends_on);
            if e.get().is_empty() {
                e.remove_entry();
            }
        }
        if let Entry::Occupied(mut e) = self.reverse_edges.entry(depends_on) {
            e.get_mut().remove(&procedure);
            if e.get().is_empty() {
                e.remove_entry();
            }
        }
    }

    /// Drop every edge touching `procedure` (it finished).
    pub fn remove_procedure(&mut self, procedure: ProcedureId) {
        for dependency in self.dependencies(procedure) {
            self.remove_dependency(procedure, dependency);
        }
        for waiting in self.waiting_on(procedure) {
            self.remove_dependency(waiting, procedure);
        }
    }

    /// Procedures waiting for `procedure`.
    pub fn waiting_on(&self, procedure: ProcedureId) -> Vec<ProcedureId> {
        self.reverse_edges
            .get(&procedure)
            .map(|waiting| waiting.iter().copied().collect())
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub fn has_dependencies(&self, procedure: ProcedureId) -> bool {
        self.edges
            .get(&procedure)
            .is_some_and(|deps| !deps.is_empty())
    }

    pub fn dependencies(&self, procedure: ProcedureId) -> Vec<ProcedureId> {
        self.edges
            .get(&procedure)
            .map(|deps| deps.iter().copied().collect())
            .unwrap_or_default()
    }

    /// First cycle reachable from `start`, as a path ending where it began.
    pub fn cycle_from(&self, start: ProcedureId) -> Option<Vec<ProcedureId>> {
        let mut colors = HashMap::new();
        let mut path = Vec::new();
        self.visit(start, &mut colors, &mut path)
    }

    /// First cycle anywhere in the graph.
    #[cfg(test)]
    pub fn detect_cycle(&self) -> Option<Vec<ProcedureId>> {
        let mut colors = HashMap::new();
        for &start in self.edges.keys() {
            if colors.contains_key(&start) {
                continue;
            }
            let mut path = Vec::new();
            if let Some(cycle) = self.visit(start, &mut colors, &mut path) {
                return Some(cycle);
            }
        }
        None
    }

    /// Depth-first search: a gray node met again closes a cycle.
    fn visit(
        &self,
        node: ProcedureId,
        colors: &mut HashMap<ProcedureId, Color>,
        path: &mut Vec<ProcedureId>,
    ) -> Option<Vec<ProcedureId>> {
        colors.insert(node, Color::Gray);
        path.push(node);

        for dependency in self.dependencies(node) {
            match colors.get(&dependency) {
                Some(Color::Gray) => {
                    let start = path.iter().position(|id| *id == dependency)?;
                    let mut cycle = path[start..].to_vec();
                    cycle.push(dependency);
                    return Some(cycle);
                }
                Some(Color::Black) => {}
                None => {
                    if let Some(cycle) = self.visit(dependency, colors, path) {
                        return Some(cycle);
                    }
                }
            }
        }

        colors.insert(node, Color::Black);
        path.pop();
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids<const N: usize>() -> [ProcedureId; N] {
        std::array::from_fn(|_| ProcedureId::generate())
    }

    #[test]
    fn add_dependency_creates_both_edges() {
        let mut graph = DependencyGraph::new();
        let [a, b] = ids();

        graph.add_dependency(b, a); // B depends on A

        assert!(graph.has_dependencies(b));
        assert!(!graph.has_dependencies(a));
        assert_eq!(graph.dependencies(b), vec![a]);
        assert_eq!(graph.waiting_on(a), vec![b]);
    }

    #[test]
    fn remove_procedure_clears_edges_in_both_directions() {
        let mut graph = DependencyGraph::new();
        let [a, b, c] = ids();

        graph.add_dependency(b, a);
        graph.add_dependency(c, b);
        graph.remove_procedure(b);

        assert!(!graph.has_dependencies(b));
        assert!(!graph.has_dependencies(c));
        assert!(graph.waiting_on(a).is_empty());
    }

    #[test]
    fn detects_simple_cycle() {
        let mut graph = DependencyGraph::new();
        let [a, b] = ids();

        graph.add_dependency(a, b);
        graph.add_dependency(b, a);

        let cycle = graph.cycle_from(a).unwrap();
        assert_eq!(cycle, vec![a, b, a]);
    }

    #[test]
    fn detects_cycle_not_through_start() {
        let mut graph = DependencyGraph::new();
        let [a, b, c, d] = ids();

        // A <- B <- C <- D <- B
        graph.add_dependency(b, a);
        graph.add_dependency(c, b);
        graph.add_dependency(d, c);
        graph.add_dependency(b, d);

        let cycle = graph.detect_cycle().unwrap();
        assert_eq!(cycle.first(), cycle.last());
        assert_eq!(cycle.len(), 4);
    }

    #[test]
    fn diamond_is_not_a_cycle() {
        let mut graph = DependencyGraph::new();
        let [a, b, c, d] = ids();

        graph.add_dependency(b, a);
        graph.add_dependency(c, a);
        graph.add_dependency(d, b);
        graph.add_dependency(d, c);

        assert!(graph.detect_cycle().is_none());
        assert!(graph.cycle_from(d).is_none());
    }
}
