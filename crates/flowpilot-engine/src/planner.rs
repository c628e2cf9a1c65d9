//! Execution planning
//!
//! Builds the dependency DAG for a workflow, rejects cycles, and derives
//! the level structure the coordinator walks: level N contains every step
//! whose dependencies are all satisfied by levels < N, so steps within a
//! level are independent and may run concurrently.

use flowpilot_core::error::{ValidationError, WorkflowError};
use flowpilot_core::step::Step;
use petgraph::graph::{Graph, NodeIndex};
use petgraph::Direction;
use std::collections::HashMap;

/// Ordered levels of step ids; steps within a level are independent
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub levels: Vec<Vec<String>>,
}

impl ExecutionPlan {
    pub fn step_count(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }
}

/// Derive the execution plan from the steps' dependency edges
pub fn build_plan(steps: &[Step]) -> Result<ExecutionPlan, WorkflowError> {
    let mut graph: Graph<String, ()> = Graph::new();
    let mut nodes: HashMap<&str, NodeIndex> = HashMap::new();

    for step in steps {
        let node = graph.add_node(step.id.clone());
        nodes.insert(step.id.as_str(), node);
    }
    for step in steps {
        for dependency in &step.dependencies {
            let from = nodes.get(dependency.as_str()).ok_or_else(|| {
                WorkflowError::Validation(ValidationError::UnknownDependency {
                    step: step.id.clone(),
                    dependency: dependency.clone(),
                })
            })?;
            let to = nodes[step.id.as_str()];
            graph.add_edge(*from, to, ());
        }
    }

    if petgraph::algo::is_cyclic_directed(&graph) {
        return Err(WorkflowError::Validation(ValidationError::CircularDependency(
            "workflow dependency graph contains a cycle".to_string(),
        )));
    }

    // strip zero-in-degree waves; document order is kept within a level
    let mut in_degree: HashMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|node| {
            (
                node,
                graph.neighbors_directed(node, Direction::Incoming).count(),
            )
        })
        .collect();

    let mut remaining: Vec<NodeIndex> = steps
        .iter()
        .map(|step| nodes[step.id.as_str()])
        .collect();
    let mut levels = Vec::new();

    while !remaining.is_empty() {
        let ready: Vec<NodeIndex> = remaining
            .iter()
            .copied()
            .filter(|node| in_degree[node] == 0)
            .collect();
        if ready.is_empty() {
            // unreachable after the cycle check, but fail loudly
            return Err(WorkflowError::Validation(ValidationError::CircularDependency(
                "no dispatchable step remains".to_string(),
            )));
        }
        for node in &ready {
            for dependent in graph.neighbors_directed(*node, Direction::Outgoing) {
                if let Some(degree) = in_degree.get_mut(&dependent) {
                    *degree = degree.saturating_sub(1);
                }
            }
        }
        remaining.retain(|node| !ready.contains(node));
        levels.push(ready.iter().map(|node| graph[*node].clone()).collect());
    }

    Ok(ExecutionPlan { levels })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn steps(spec: &[(&str, &[&str])]) -> Vec<Step> {
        spec.iter()
            .map(|(id, deps)| {
                serde_json::from_value(json!({
                    "id": id,
                    "name": id,
                    "type": "delay",
                    "duration": 1,
                    "dependencies": deps
                }))
                .unwrap()
            })
            .collect()
    }

    #[test]
    fn test_levels_follow_dependencies() {
        let plan = build_plan(&steps(&[
            ("a", &[]),
            ("b", &[]),
            ("c", &["a", "b"]),
            ("d", &["c"]),
        ]))
        .unwrap();
        assert_eq!(plan.levels, vec![
            vec!["a".to_string(), "b".to_string()],
            vec!["c".to_string()],
            vec!["d".to_string()],
        ]);
        assert_eq!(plan.step_count(), 4);
    }

    #[test]
    fn test_cycle_rejected() {
        let err = build_plan(&steps(&[("a", &["b"]), ("b", &["a"])])).unwrap_err();
        assert_eq!(err.code(), "CIRCULAR_DEPENDENCY");
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let err = build_plan(&steps(&[("a", &["ghost"])])).unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(_)));
    }

    #[test]
    fn test_diamond() {
        let plan = build_plan(&steps(&[
            ("root", &[]),
            ("left", &["root"]),
            ("right", &["root"]),
            ("join", &["left", "right"]),
        ]))
        .unwrap();
        assert_eq!(plan.levels.len(), 3);
        assert_eq!(plan.levels[1], vec!["left".to_string(), "right".to_string()]);
    }
}
