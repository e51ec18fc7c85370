//! Dependency graph between base and derived tables.
//!
//! Edges point from a table to the tables that read from it, so walking outgoing
//! edges answers "who must be rebuilt when this changes". The graph is built once
//! from configuration and is read-only afterwards; construction fails on cycles.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use petgraph::algo::{kosaraju_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::Serialize;

use crate::error::{MirrorError, MirrorResult};

/// Transitive dependents of a table, as a tree rooted at that table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependentTree {
    /// Table at this node.
    pub table: String,
    /// Tables reading directly from `table`, each with its own dependents.
    pub dependents: Vec<DependentTree>,
}

impl DependentTree {
    /// All tables in the tree except the root, deduplicated and sorted.
    pub fn flatten(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        let mut stack: Vec<&DependentTree> = self.dependents.iter().collect();
        while let Some(node) = stack.pop() {
            out.insert(node.table.clone());
            stack.extend(node.dependents.iter());
        }
        out
    }
}

/// Static `derived table -> [tables it reads from]` relation.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    graph: DiGraph<String, ()>,
    index: BTreeMap<String, NodeIndex>,
}

impl DependencyGraph {
    /// Builds the graph from `(derived, depends_on)` pairs.
    ///
    /// Every table mentioned on either side becomes a node.
    ///
    /// # Errors
    ///
    /// `CycleDetected` if the edges are not acyclic (including self-dependencies).
    pub fn new<I, S, D>(edges: I) -> MirrorResult<Self>
    where
        I: IntoIterator<Item = (S, D)>,
        S: Into<String>,
        D: IntoIterator,
        D::Item: Into<String>,
    {
        let mut graph = Self {
            graph: DiGraph::new(),
            index: BTreeMap::new(),
        };
        for (derived, depends_on) in edges {
            let derived = graph.add_node(derived.into());
            for dependency in depends_on {
                let dependency = graph.add_node(dependency.into());
                if graph.graph.find_edge(dependency, derived).is_none() {
                    graph.graph.add_edge(dependency, derived, ());
                }
            }
        }
        graph.check_acyclic()?;
        Ok(graph)
    }

    fn add_node(&mut self, table: String) -> NodeIndex {
        if let Some(&idx) = self.index.get(&table) {
            return idx;
        }
        let idx = self.graph.add_node(table.clone());
        self.index.insert(table, idx);
        idx
    }

    fn check_acyclic(&self) -> MirrorResult<()> {
        if toposort(&self.graph, None).is_ok() {
            return Ok(());
        }
        // Report the smallest strongly connected component that forms a loop.
        let mut cycles: Vec<Vec<String>> = kosaraju_scc(&self.graph)
            .into_iter()
            .filter(|component| {
                component.len() > 1
                    || component
                        .first()
                        .is_some_and(|&idx| self.graph.find_edge(idx, idx).is_some())
            })
            .map(|component| {
                let mut names: Vec<String> = component
                    .into_iter()
                    .map(|idx| self.graph[idx].clone())
                    .collect();
                names.sort();
                names
            })
            .collect();
        cycles.sort_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));
        let mut cycle = cycles.into_iter().next().unwrap_or_default();
        if let Some(first) = cycle.first().cloned() {
            cycle.push(first);
        }
        Err(MirrorError::CycleDetected { cycle })
    }

    /// Number of tables known to the graph.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether the graph has no tables.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// All tables, sorted by name.
    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.index.keys().map(String::as_str)
    }

    /// Whether `table` is computed from other tables.
    pub fn is_derived(&self, table: &str) -> bool {
        self.index.get(table).is_some_and(|&idx| {
            self.graph
                .neighbors_directed(idx, Direction::Incoming)
                .next()
                .is_some()
        })
    }

    fn neighbors(&self, table: &str, direction: Direction) -> Vec<String> {
        let Some(&idx) = self.index.get(table) else {
            return Vec::new();
        };
        let mut out: Vec<String> = self
            .graph
            .neighbors_directed(idx, direction)
            .map(|n| self.graph[n].clone())
            .collect();
        out.sort();
        out.dedup();
        out
    }

    /// Tables `table` reads from, sorted by name.
    pub fn dependencies(&self, table: &str) -> Vec<String> {
        self.neighbors(table, Direction::Incoming)
    }

    /// Tables that read directly from `table`, sorted by name.
    pub fn direct_dependents(&self, table: &str) -> Vec<String> {
        self.neighbors(table, Direction::Outgoing)
    }

    /// Every table that transitively reads from `table`, as a tree.
    pub fn recursive_dependents(&self, table: &str) -> DependentTree {
        DependentTree {
            table: table.to_string(),
            dependents: self
                .direct_dependents(table)
                .iter()
                .map(|child| self.recursive_dependents(child))
                .collect(),
        }
    }

    /// `changed` plus all transitive dependents, in rebuild order.
    ///
    /// A table never precedes one of its own dependencies. Within a rank (tables
    /// whose in-closure dependencies are all already placed) tables are ordered by
    /// name, so the same input always yields the same list; checkpoint resumption
    /// is positional and depends on that.
    pub fn stale_closure<I, S>(&self, changed: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut closure: BTreeSet<String> = BTreeSet::new();
        let mut queue: VecDeque<String> = changed
            .into_iter()
            .map(|table| table.as_ref().to_string())
            .collect();
        while let Some(table) = queue.pop_front() {
            if closure.insert(table.clone()) {
                queue.extend(self.direct_dependents(&table));
            }
        }

        let mut pending: BTreeMap<String, usize> = closure
            .iter()
            .map(|table| {
                let in_closure = self
                    .dependencies(table)
                    .iter()
                    .filter(|dep| closure.contains(*dep))
                    .count();
                (table.clone(), in_closure)
            })
            .collect();

        let mut ordered = Vec::with_capacity(pending.len());
        while !pending.is_empty() {
            let rank: Vec<String> = pending
                .iter()
                .filter(|(_, &remaining)| remaining == 0)
                .map(|(table, _)| table.clone())
                .collect();
            if rank.is_empty() {
                // Unreachable for graphs built through `new`, which rejects cycles.
                break;
            }
            for table in &rank {
                pending.remove(table);
                for dependent in self.direct_dependents(table) {
                    if let Some(remaining) = pending.get_mut(&dependent) {
                        *remaining = remaining.saturating_sub(1);
                    }
                }
            }
            ordered.extend(rank);
        }
        ordered
    }
}
