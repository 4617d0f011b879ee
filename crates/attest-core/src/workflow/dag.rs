//! DAG validation and parallel layer computation.
//!
//! Uses `petgraph` to model `depends_on` edges as a directed graph.
//! Topological sort detects cycles (the error names a participating step),
//! and depth-based grouping produces execution layers where every step in a
//! layer can run concurrently.

use std::collections::HashMap;

use attest_types::workflow::StepDefinition;
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;

use super::definition::WorkflowError;

/// Group steps into execution layers.
///
/// Each layer contains steps whose dependencies are all satisfied by earlier
/// layers. The algorithm:
///
/// 1. Build a `DiGraph` with step ids as nodes and `depends_on` edges.
/// 2. Run `petgraph::algo::toposort` to verify acyclicity.
/// 3. Compute each node's depth (max dependency depth + 1).
/// 4. Group step ids by depth; layer 0 executes first.
///
/// Ids within a layer are sorted for deterministic scheduling.
pub fn build_execution_layers(
    steps: &HashMap<String, StepDefinition>,
) -> Result<Vec<Vec<String>>, WorkflowError> {
    if steps.is_empty() {
        return Ok(vec![]);
    }

    let graph = build_graph(steps)?;

    let sorted = toposort(&graph, None).map_err(|cycle| {
        WorkflowError::CycleDetected(graph[cycle.node_id()].clone())
    })?;

    // Depth per node: roots are 0, everything else is max(dep depth) + 1.
    let mut depths: HashMap<&str, usize> = HashMap::new();
    for &node in &sorted {
        let step_id = graph[node].as_str();
        let step = &steps[step_id];
        let depth = step
            .depends_on
            .iter()
            .map(|dep| depths.get(dep.as_str()).copied().unwrap_or(0) + 1)
            .max()
            .unwrap_or(0);
        depths.insert(step_id, depth);
    }

    let max_depth = depths.values().copied().max().unwrap_or(0);
    let mut layers: Vec<Vec<String>> = vec![vec![]; max_depth + 1];
    for (step_id, depth) in &depths {
        layers[*depth].push((*step_id).to_string());
    }
    for layer in &mut layers {
        layer.sort();
    }

    Ok(layers)
}

/// Validate that steps form a DAG: every dependency exists, no cycles.
pub fn validate_dag(steps: &HashMap<String, StepDefinition>) -> Result<(), WorkflowError> {
    if steps.is_empty() {
        return Ok(());
    }

    let graph = build_graph(steps)?;
    toposort(&graph, None)
        .map(|_| ())
        .map_err(|cycle| WorkflowError::CycleDetected(graph[cycle.node_id()].clone()))
}

fn build_graph(
    steps: &HashMap<String, StepDefinition>,
) -> Result<DiGraph<String, ()>, WorkflowError> {
    let mut graph = DiGraph::<String, ()>::new();
    let mut indices = HashMap::new();

    let mut ids: Vec<&String> = steps.keys().collect();
    ids.sort();
    for id in &ids {
        indices.insert(id.as_str(), graph.add_node((*id).clone()));
    }

    for id in &ids {
        let step = &steps[id.as_str()];
        for dep in &step.depends_on {
            let from = indices.get(dep.as_str()).ok_or_else(|| {
                WorkflowError::UnknownDependency {
                    step: (*id).clone(),
                    dependency: dep.clone(),
                }
            })?;
            graph.add_edge(*from, indices[id.as_str()], ());
        }
    }

    Ok(graph)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
