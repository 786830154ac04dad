//! DAG builder, cycle detection, and parallel wave computation.
//!
//! Uses `petgraph` to model step dependencies as a directed graph. Topological
//! sort verifies acyclicity and depth-based grouping produces the execution
//! waves shown by `stepwise workflow show`. A separate depth-first search
//! reports the exact cycle path for validation messages.

use std::collections::{HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use stepwise_types::workflow::StepDefinition;

use super::definition::DefinitionError;

// ---------------------------------------------------------------------------
// Execution plan (wave computation)
// ---------------------------------------------------------------------------

/// Group workflow steps into waves of mutually independent steps.
///
/// Every step in wave `n` depends only on steps in waves `< n`. Index 0 holds
/// the steps with no dependencies, which are the ones enqueued first.
pub fn build_execution_plan(
    steps: &[StepDefinition],
) -> Result<Vec<Vec<&StepDefinition>>, DefinitionError> {
    if steps.is_empty() {
        return Ok(vec![]);
    }

    let graph = build_graph(steps)?;

    let sorted = toposort(&graph, None).map_err(|cycle| {
        DefinitionError::CycleDetected(format!(
            "cycle detected involving step '{}'",
            graph[cycle.node_id()]
        ))
    })?;

    let id_to_step: HashMap<&str, &StepDefinition> =
        steps.iter().map(|s| (s.id.as_str(), s)).collect();

    // Root steps have depth 0; everything else sits one past its deepest dependency.
    let mut depths: HashMap<&str, usize> = HashMap::new();
    for node_idx in sorted {
        let step_id = graph[node_idx];
        let depth = id_to_step[step_id]
            .dependencies
            .iter()
            .map(|dep| depths.get(dep.as_str()).copied().unwrap_or(0) + 1)
            .max()
            .unwrap_or(0);
        depths.insert(step_id, depth);
    }

    let max_depth = depths.values().copied().max().unwrap_or(0);
    let mut waves: Vec<Vec<&StepDefinition>> = vec![vec![]; max_depth + 1];
    for step in steps {
        waves[depths[step.id.as_str()]].push(step);
    }

    Ok(waves)
}

/// Edge from dependency to dependant for every declared dependency.
fn build_graph(steps: &[StepDefinition]) -> Result<DiGraph<&str, ()>, DefinitionError> {
    let mut graph = DiGraph::<&str, ()>::new();
    let nodes: HashMap<&str, _> = steps
        .iter()
        .map(|s| (s.id.as_str(), graph.add_node(s.id.as_str())))
        .collect();

    for step in steps {
        let to = nodes[step.id.as_str()];
        for dep in &step.dependencies {
            let from = nodes.get(dep.as_str()).ok_or_else(|| DefinitionError::UnknownDependency {
                step: step.id.clone(),
                dependency: dep.clone(),
            })?;
            graph.add_edge(*from, to, ());
        }
    }

    Ok(graph)
}

// ---------------------------------------------------------------------------
// Cycle path (depth-first)
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Find one dependency cycle and return it as a closed path, e.g. `[a, b, a]`.
///
/// Self-dependencies and unknown dependencies are reported separately by
/// validation and are ignored here.
pub fn find_cycle(steps: &[StepDefinition]) -> Option<Vec<String>> {
    let deps: HashMap<&str, &[String]> = steps
        .iter()
        .map(|s| (s.id.as_str(), s.dependencies.as_slice()))
        .collect();
    let mut marks: HashMap<&str, Mark> = HashMap::new();
    let mut path: Vec<&str> = Vec::new();

    steps
        .iter()
        .find_map(|step| visit(step.id.as_str(), &deps, &mut marks, &mut path))
}

fn visit<'a>(
    id: &'a str,
    deps: &HashMap<&'a str, &'a [String]>,
    marks: &mut HashMap<&'a str, Mark>,
    path: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    match marks.get(id) {
        Some(Mark::Done) => return None,
        Some(Mark::Visiting) => {
            let start = path.iter().position(|p| *p == id)?;
            let mut cycle: Vec<String> = path[start..].iter().map(|s| s.to_string()).collect();
            cycle.push(id.to_string());
            return Some(cycle);
        }
        None => {}
    }
    let &edges = deps.get(id)?;

    marks.insert(id, Mark::Visiting);
    path.push(id);
    for dep in edges {
        if dep == id {
            continue;
        }
        if let Some(cycle) = visit(dep.as_str(), deps, marks, path) {
            return Some(cycle);
        }
    }
    path.pop();
    marks.insert(id, Mark::Done);
    None
}

// ---------------------------------------------------------------------------
// Reachability
// ---------------------------------------------------------------------------

/// Every step that directly or transitively depends on `step_id`.
pub fn transitive_dependants(step_id: &str, steps: &[StepDefinition]) -> HashSet<String> {
    let mut dependants: HashSet<String> = HashSet::new();
    let mut stack = vec![step_id.to_string()];

    while let Some(current) = stack.pop() {
        for step in steps {
            if step.dependencies.iter().any(|d| *d == current) && dependants.insert(step.id.clone())
            {
                stack.push(step.id.clone());
            }
        }
    }

    dependants
}

/// Steps with neither dependencies nor dependants.
pub fn isolated_steps(steps: &[StepDefinition]) -> Vec<&str> {
    let referenced: HashSet<&str> = steps
        .iter()
        .flat_map(|s| s.dependencies.iter().map(String::as_str))
        .collect();
    steps
        .iter()
        .filter(|s| s.dependencies.is_empty() && !referenced.contains(s.id.as_str()))
        .map(|s| s.id.as_str())
        .collect()
}

#[cfg(test)]
pub(crate) mod test_support {
    use stepwise_types::workflow::{StepConfig, StepDefinition, StepType};

    /// A notification step with the given id and dependencies.
    pub fn step(id: &str, deps: &[&str]) -> StepDefinition {
        StepDefinition {
            id: id.to_string(),
            name: id.to_uppercase(),
            step_type: StepType::Notification,
            config: StepConfig::Notification {
                channel: "email".to_string(),
                recipients: vec!["ops@example.com".to_string()],
                message: format!("{id} done"),
            },
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            retry_policy: None,
            timeout_ms: None,
            priority: None,
            queue: None,
        }
    }
}
