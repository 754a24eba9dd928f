//! Dependency resolution: table graph -> ordered waves
//!
//! A wave is a set of tables none of which depends on another table of the
//! same or a later wave. Waves run strictly in order; tables inside a wave
//! may run concurrently.
//!
//! ```text
//! customers   orders          wave 0   (no unresolved dependencies)
//!      ▲        ▲
//!      └──┬─────┘
//!    order_items              wave 1
//! ```
//!
//! Resolution is Kahn's algorithm taken one layer at a time: every table
//! whose dependencies are all resolved forms the next wave. Inside a wave,
//! tables are ordered by name (case-insensitive) so plans are reproducible.
//!
//! When no table is ready but some remain, the remainder contains a cycle.
//! [`BreakPolicy::FailFast`] reports every table that lies on a cycle;
//! [`BreakPolicy::BreakArbitrary`] removes one edge and carries on.

use crate::error::CyclicDependencyError;
use crate::graph::{Edge, TableGraph};
use lakeslice_checkpoint::EdgeRecord;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// What to do when the graph contains a cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakPolicy {
    /// Refuse to plan; the run fails with [`CyclicDependencyError`]
    #[default]
    FailFast,
    /// Drop the edge whose referenced table has the fewest unresolved
    /// dependents (ties by name), record it, and continue
    BreakArbitrary,
}

/// Tables that may run concurrently, in name order.
pub type Wave = Vec<String>;

/// Output of [`DependencyResolver::resolve`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WavePlan {
    pub waves: Vec<Wave>,
    /// Edges removed to break cycles; not honored for ordering in this run
    pub broken_edges: Vec<Edge>,
}

impl WavePlan {
    pub fn table_count(&self) -> usize {
        self.waves.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.waves.is_empty()
    }

    /// Index of the wave containing `table` (case-insensitive).
    pub fn wave_of(&self, table: &str) -> Option<usize> {
        self.waves
            .iter()
            .position(|wave| wave.iter().any(|t| t.eq_ignore_ascii_case(table)))
    }

    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.waves.iter().flatten().map(String::as_str)
    }

    /// The plan in the shape the checkpoint stores it.
    pub fn to_checkpoint_plan(&self) -> (Vec<Vec<String>>, Vec<EdgeRecord>) {
        let broken = self
            .broken_edges
            .iter()
            .map(|e| EdgeRecord {
                from: e.from.clone(),
                to: e.to.clone(),
            })
            .collect();
        (self.waves.clone(), broken)
    }
}

/// Turns a [`TableGraph`] into a [`WavePlan`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DependencyResolver {
    policy: BreakPolicy,
}

impl DependencyResolver {
    pub fn new(policy: BreakPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> BreakPolicy {
        self.policy
    }

    pub fn resolve(&self, graph: &TableGraph) -> Result<WavePlan, CyclicDependencyError> {
        // table -> tables it still waits on
        let mut pending: BTreeMap<String, BTreeSet<String>> = graph
            .table_names()
            .into_iter()
            .map(|name| (name.to_string(), BTreeSet::new()))
            .collect();
        for edge in graph.edges() {
            if let Some(deps) = pending.get_mut(&edge.from) {
                deps.insert(edge.to);
            }
        }

        let mut plan = WavePlan::default();
        while !pending.is_empty() {
            let mut ready: Vec<String> = pending
                .iter()
                .filter(|(_, deps)| deps.is_empty())
                .map(|(name, _)| name.clone())
                .collect();

            if ready.is_empty() {
                let members = cycle_members(&pending);
                match self.policy {
                    BreakPolicy::FailFast => {
                        return Err(CyclicDependencyError { tables: members });
                    }
                    BreakPolicy::BreakArbitrary => {
                        let Some(edge) = edge_to_break(&pending) else {
                            return Err(CyclicDependencyError { tables: members });
                        };
                        warn!(
                            from = %edge.from,
                            to = %edge.to,
                            cycle = ?members,
                            "Breaking dependency cycle; edge ignored for ordering"
                        );
                        if let Some(deps) = pending.get_mut(&edge.from) {
                            deps.remove(&edge.to);
                        }
                        plan.broken_edges.push(edge);
                        continue;
                    }
                }
            }

            ready.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));
            for name in &ready {
                pending.remove(name);
            }
            for deps in pending.values_mut() {
                for name in &ready {
                    deps.remove(name);
                }
            }
            debug!(wave = plan.waves.len(), tables = ?ready, "Resolved wave");
            plan.waves.push(ready);
        }

        Ok(plan)
    }
}

fn sort_key(name: &str) -> (String, &str) {
    (name.to_lowercase(), name)
}

/// Whether `target` is reachable from `start` through unresolved edges.
fn reaches(pending: &BTreeMap<String, BTreeSet<String>>, start: &str, target: &str) -> bool {
    let mut seen = BTreeSet::new();
    let mut stack: Vec<&str> = pending
        .get(start)
        .map(|deps| deps.iter().map(String::as_str).collect())
        .unwrap_or_default();
    while let Some(current) = stack.pop() {
        if current == target {
            return true;
        }
        if seen.insert(current) {
            if let Some(deps) = pending.get(current) {
                stack.extend(deps.iter().map(String::as_str));
            }
        }
    }
    false
}

/// Tables that lie on at least one cycle, sorted by name. Tables that merely
/// depend on a cycle are not members.
fn cycle_members(pending: &BTreeMap<String, BTreeSet<String>>) -> Vec<String> {
    let mut members: Vec<String> = pending
        .keys()
        .filter(|name| reaches(pending, name, name))
        .cloned()
        .collect();
    members.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));
    members
}

/// Among edges lying on a cycle, the one whose referenced table has the
/// fewest unresolved dependents; ties by (referenced, referencing) name.
fn edge_to_break(pending: &BTreeMap<String, BTreeSet<String>>) -> Option<Edge> {
    let dependents_of = |table: &str| pending.values().filter(|deps| deps.contains(table)).count();

    let mut best: Option<(usize, (String, &str), (String, &str), Edge)> = None;
    for (from, deps) in pending {
        for to in deps {
            if !reaches(pending, to, from) {
                continue;
            }
            let candidate = (
                dependents_of(to),
                sort_key(to),
                sort_key(from),
                Edge::new(from.clone(), to.clone()),
            );
            let better = best.as_ref().map_or(true, |current| {
                (candidate.0, &candidate.1, &candidate.2) < (current.0, &current.1, &current.2)
            });
            if better {
                best = Some(candidate);
            }
        }
    }

    best.map(|(_, _, _, edge)| edge)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::TableDescriptor;

    fn graph(tables: &[(&str, &[&str])]) -> TableGraph {
        TableGraph::new(tables.iter().map(|(name, refs)| {
            refs.iter().fold(TableDescriptor::new(*name), |t, r| {
                t.with_foreign_key(format!("{r}_id"), *r, "id")
            })
        }))
        .unwrap()
    }

    #[test]
    fn test_shop_waves() {
        let g = graph(&[
            ("orders", &[]),
            ("customers", &[]),
            ("order_items", &["orders", "customers"]),
        ]);
        let plan = DependencyResolver::default().resolve(&g).unwrap();
        assert_eq!(
            plan.waves,
            vec![vec!["customers", "orders"], vec!["order_items"]]
        );
        assert!(plan.broken_edges.is_empty());
        assert_eq!(plan.wave_of("ORDER_ITEMS"), Some(1));
    }

    #[test]
    fn test_isolated_table_is_wave_zero() {
        let g = graph(&[("a", &[]), ("b", &["a"]), ("lonely", &[])]);
        let plan = DependencyResolver::default().resolve(&g).unwrap();
        assert_eq!(plan.waves[0], vec!["a", "lonely"]);
    }

    #[test]
    fn test_tie_break_ignores_case() {
        let g = graph(&[("beta", &[]), ("Alpha", &[]), ("gamma", &[])]);
        let plan = DependencyResolver::default().resolve(&g).unwrap();
        assert_eq!(plan.waves, vec![vec!["Alpha", "beta", "gamma"]]);
    }

    #[test]
    fn test_chain_gives_one_table_per_wave() {
        let g = graph(&[("c", &["b"]), ("b", &["a"]), ("a", &[])]);
        let plan = DependencyResolver::default().resolve(&g).unwrap();
        assert_eq!(plan.waves, vec![vec!["a"], vec!["b"], vec!["c"]]);
    }

    #[test]
    fn test_empty_graph() {
        let plan = DependencyResolver::default()
            .resolve(&TableGraph::default())
            .unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn test_fail_fast_names_cycle_members_only() {
        let g = graph(&[("a", &["b"]), ("b", &["a"]), ("c", &["a"]), ("d", &[])]);
        let err = DependencyResolver::new(BreakPolicy::FailFast)
            .resolve(&g)
            .unwrap_err();
        assert_eq!(err.tables, vec!["a", "b"]);
    }

    #[test]
    fn test_break_arbitrary_prefers_least_referenced_table() {
        // a <-> b, and c also references a: cutting a->b (b has one
        // dependent) is preferred over b->a (a has two).
        let g = graph(&[("a", &["b"]), ("b", &["a"]), ("c", &["a"])]);
        let plan = DependencyResolver::new(BreakPolicy::BreakArbitrary)
            .resolve(&g)
            .unwrap();
        assert_eq!(plan.broken_edges, vec![Edge::new("a", "b")]);
        assert_eq!(plan.waves, vec![vec!["a"], vec!["b", "c"]]);
    }

    #[test]
    fn test_break_arbitrary_two_cycles() {
        let g = graph(&[("a", &["b"]), ("b", &["a"]), ("x", &["y"]), ("y", &["x"])]);
        let plan = DependencyResolver::new(BreakPolicy::BreakArbitrary)
            .resolve(&g)
            .unwrap();
        assert_eq!(plan.broken_edges.len(), 2);
        assert_eq!(plan.table_count(), 4);
    }

    #[test]
    fn test_checkpoint_plan_shape() {
        let g = graph(&[("a", &["b"]), ("b", &["a"])]);
        let plan = DependencyResolver::new(BreakPolicy::BreakArbitrary)
            .resolve(&g)
            .unwrap();
        let (waves, broken) = plan.to_checkpoint_plan();
        assert_eq!(waves.len(), 2);
        assert_eq!(broken.len(), 1);
    }
}
