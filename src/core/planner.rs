//! GT-006: Plan generation: deterministic topological order over enabled modules.
//!
//! Kahn's algorithm with declaration-order tie-breaking: the lowest-declared
//! ready module is always placed next. Destroy plans are the forward order
//! reversed.

use super::error::{Error, Result};
use super::resolver::Graph;
use super::types::*;
use std::collections::BTreeSet;

/// Subset selection by module id. Empty selects everything.
#[derive(Debug, Clone, Default)]
pub struct ModuleFilter {
    ids: Vec<String>,
}

impl ModuleFilter {
    pub fn new(ids: Vec<String>) -> Self {
        Self { ids }
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn selects(&self, id: &str) -> bool {
        self.ids.is_empty() || self.ids.iter().any(|i| i == id)
    }
}

/// Generate an execution plan for an action.
pub fn plan(
    graph: &Graph,
    modules: &[Module],
    action: Action,
    direction: Direction,
    filter: &ModuleFilter,
) -> Result<ExecutionPlan> {
    for id in &filter.ids {
        if graph.index_of(id).is_none() {
            return Err(Error::UnknownModule(id.clone()));
        }
    }

    check_disabled_dependencies(graph, modules)?;

    let included: Vec<bool> = modules
        .iter()
        .map(|m| m.enabled && filter.selects(&m.id))
        .collect();
    let order = forward_order(graph, modules, &included)?;

    let ordered = match direction {
        Direction::Forward => order,
        Direction::Reverse => order.into_iter().rev().collect(),
    };

    let mut position = vec![None; modules.len()];
    for (pos, &i) in ordered.iter().enumerate() {
        position[i] = Some(pos);
    }

    let mut steps: Vec<PlanStep> = Vec::with_capacity(ordered.len());
    for &i in &ordered {
        let predecessors = match direction {
            Direction::Forward => graph.dependencies(i),
            Direction::Reverse => graph.dependents(i),
        };
        let waits_on: Vec<usize> = predecessors.iter().filter_map(|&p| position[p]).collect();
        let depth = waits_on
            .iter()
            .map(|&pos| steps[pos].depth + 1)
            .max()
            .unwrap_or(0);
        steps.push(PlanStep {
            index: i,
            module: modules[i].id.clone(),
            depth,
            waits_on,
        });
    }

    Ok(ExecutionPlan {
        action,
        direction,
        steps,
    })
}

/// An enabled module may not depend on a disabled one.
fn check_disabled_dependencies(graph: &Graph, modules: &[Module]) -> Result<()> {
    for (i, module) in modules.iter().enumerate() {
        if !module.enabled {
            continue;
        }
        for &d in graph.dependencies(i) {
            if !modules[d].enabled {
                return Err(Error::DisabledDependency {
                    module: module.id.clone(),
                    dependency: modules[d].id.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Kahn's algorithm over the included nodes. Edges from excluded
/// dependencies are ignored (those modules are assumed in place).
fn forward_order(graph: &Graph, modules: &[Module], included: &[bool]) -> Result<Vec<usize>> {
    let mut in_degree = vec![0usize; graph.len()];
    for i in 0..graph.len() {
        if included[i] {
            in_degree[i] = graph.dependencies(i).iter().filter(|&&d| included[d]).count();
        }
    }

    // Keyed by (declaration index, graph index) so ties break on declaration order.
    let mut ready: BTreeSet<(usize, usize)> = (0..graph.len())
        .filter(|&i| included[i] && in_degree[i] == 0)
        .map(|i| (modules[i].declaration_index, i))
        .collect();

    let mut order = Vec::new();
    while let Some((_, current)) = ready.pop_first() {
        order.push(current);
        for &next in graph.dependents(current) {
            if !included[next] {
                continue;
            }
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.insert((modules[next].declaration_index, next));
            }
        }
    }

    let expected = included.iter().filter(|&&inc| inc).count();
    if order.len() != expected {
        let members = (0..graph.len())
            .filter(|&i| included[i] && !order.contains(&i))
            .map(|i| graph.id(i).to_string())
            .collect();
        return Err(Error::CyclicDependency(members));
    }

    Ok(order)
}
