//! GT-005: Template resolution and dependency graph construction.
//!
//! Resolves `{{env.name}}`, `{{env.<param>}}`, `{{namespace}}` and
//! `{{module.id}}` templates in parameter values at load time.
//! `{{output <module>::<key>}}` references are checked for shape but kept
//! verbatim; they are substituted at run time from the source module's
//! deployed outputs. Builds the module
//! dependency graph and rejects cycles with a depth-first traversal that
//! tracks recursion-stack membership.

use super::error::{Error, Result};
use super::types::*;
use indexmap::IndexMap;
use std::collections::HashMap;

/// Outputs looked up at run time: module id, then output key.
pub type ModuleOutputs = HashMap<String, IndexMap<String, String>>;

/// A `{{output <module>::<key>}}` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRef {
    pub module: String,
    pub key: String,
}

fn parse_output_ref(key: &str) -> Option<std::result::Result<OutputRef, String>> {
    let rest = key.strip_prefix("output ")?.trim();
    Some(match rest.split_once("::") {
        Some((module, key)) if !module.trim().is_empty() && !key.trim().is_empty() => Ok(OutputRef {
            module: module.trim().to_string(),
            key: key.trim().to_string(),
        }),
        _ => Err(format!("malformed output reference '{}': expected <module>::<key>", rest)),
    })
}

/// Values available to parameter templates.
pub struct TemplateContext<'a> {
    pub environment: &'a Environment,
    pub namespace: &'a str,
    pub module_id: &'a str,
}

/// Resolve all template variables in a string.
pub fn resolve_template(template: &str, ctx: &TemplateContext) -> std::result::Result<String, String> {
    let mut result = template.to_string();
    let mut start = 0;

    while let Some(open) = result[start..].find("{{") {
        let open = start + open;
        let close = result[open..]
            .find("}}")
            .ok_or_else(|| format!("unclosed template at position {}", open))?;
        let close = open + close + 2;
        let key = result[open + 2..close - 2].trim();

        if let Some(output) = parse_output_ref(key) {
            output?;
            start = close;
            continue;
        }

        let value = match key {
            "namespace" => ctx.namespace.to_string(),
            "module.id" => ctx.module_id.to_string(),
            "env.name" => ctx.environment.name().to_string(),
            _ => match key.strip_prefix("env.") {
                Some(param) => ctx
                    .environment
                    .param(param)
                    .map(str::to_string)
                    .ok_or_else(|| {
                        format!(
                            "unknown param '{}' for environment '{}'",
                            param,
                            ctx.environment.name()
                        )
                    })?,
                None => return Err(format!("unknown template variable: {}", key)),
            },
        };

        result.replace_range(open..close, &value);
        start = open + value.len();
    }

    Ok(result)
}

/// Well-formed output references in a param value, in order of appearance.
pub fn output_refs(value: &str) -> Vec<OutputRef> {
    let mut refs = Vec::new();
    let mut rest = value;
    while let Some(open) = rest.find("{{") {
        let Some(close) = rest[open..].find("}}") else {
            break;
        };
        if let Some(Ok(r)) = parse_output_ref(rest[open + 2..open + close].trim()) {
            refs.push(r);
        }
        rest = &rest[open + close + 2..];
    }
    refs
}

/// Output references across every set param of a module.
pub fn module_output_refs(module: &Module) -> Vec<OutputRef> {
    module.set_params().flat_map(|(_, value)| output_refs(value)).collect()
}

/// Substitute output references from looked-up outputs. Other text is untouched.
pub fn resolve_output_refs(value: &str, outputs: &ModuleOutputs) -> std::result::Result<String, String> {
    let mut result = value.to_string();
    let mut start = 0;

    while let Some(open) = result[start..].find("{{") {
        let open = start + open;
        let Some(close) = result[open..].find("}}") else {
            break;
        };
        let close = open + close + 2;
        let output = match parse_output_ref(result[open + 2..close - 2].trim()) {
            Some(r) => r?,
            None => {
                start = close;
                continue;
            }
        };
        let value = outputs
            .get(&output.module)
            .and_then(|o| o.get(&output.key))
            .cloned()
            .ok_or_else(|| format!("module '{}' has no output '{}'", output.module, output.key))?;

        result.replace_range(open..close, &value);
        start = open + value.len();
    }

    Ok(result)
}

/// Directed graph over loaded modules; edges run from dependency to dependent.
#[derive(Debug, Clone)]
pub struct Graph {
    ids: Vec<String>,
    dependencies: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
}

impl Graph {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn id(&self, index: usize) -> &str {
        &self.ids[index]
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.ids.iter().position(|i| i == id)
    }

    /// Direct dependencies, in declaration order.
    pub fn dependencies(&self, index: usize) -> &[usize] {
        &self.dependencies[index]
    }

    /// Direct dependents, in declaration order of the dependent.
    pub fn dependents(&self, index: usize) -> &[usize] {
        &self.dependents[index]
    }
}

/// Build the dependency graph, failing on unknown ids or cycles.
pub fn build(modules: &[Module]) -> Result<Graph> {
    let index: HashMap<&str, usize> = modules
        .iter()
        .enumerate()
        .map(|(i, m)| (m.id.as_str(), i))
        .collect();

    let mut dependencies = vec![Vec::new(); modules.len()];
    let mut dependents = vec![Vec::new(); modules.len()];

    for (i, module) in modules.iter().enumerate() {
        for dep in &module.depends_on {
            let d = *index.get(dep.as_str()).ok_or_else(|| Error::MissingDependency {
                module: module.id.clone(),
                dependency: dep.clone(),
            })?;
            if !dependencies[i].contains(&d) {
                dependencies[i].push(d);
                dependents[d].push(i);
            }
        }
    }

    if let Some(cycle) = find_cycle(&dependencies) {
        return Err(Error::CyclicDependency(
            cycle.into_iter().map(|i| modules[i].id.clone()).collect(),
        ));
    }

    Ok(Graph {
        ids: modules.iter().map(|m| m.id.clone()).collect(),
        dependencies,
        dependents,
    })
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

/// Depth-first search in declaration order. Returns the members of the first
/// cycle found, starting at the node that was re-entered.
fn find_cycle(dependencies: &[Vec<usize>]) -> Option<Vec<usize>> {
    let mut marks = vec![Mark::Unvisited; dependencies.len()];
    let mut stack = Vec::new();

    for root in 0..dependencies.len() {
        if marks[root] == Mark::Unvisited {
            if let Some(cycle) = visit(root, dependencies, &mut marks, &mut stack) {
                return Some(cycle);
            }
        }
    }
    None
}

fn visit(
    node: usize,
    dependencies: &[Vec<usize>],
    marks: &mut [Mark],
    stack: &mut Vec<usize>,
) -> Option<Vec<usize>> {
    marks[node] = Mark::OnStack;
    stack.push(node);

    for &next in &dependencies[node] {
        match marks[next] {
            Mark::OnStack => {
                let pos = stack.iter().position(|&n| n == next).unwrap_or(0);
                return Some(stack[pos..].to_vec());
            }
            Mark::Unvisited => {
                if let Some(cycle) = visit(next, dependencies, marks, stack) {
                    return Some(cycle);
                }
            }
            Mark::Done => {}
        }
    }

    stack.pop();
    marks[node] = Mark::Done;
    None
}
