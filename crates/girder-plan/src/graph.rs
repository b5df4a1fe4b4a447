// Task graph validation: unique ids, resolvable dependencies, no cycles.

use girder_types::{GirderError, Result, TaskGraph, TaskNode};
use std::collections::{HashMap, HashSet};

/// Validate a parsed graph. Failure is a hard error with a descriptive
/// reason, never a silently empty graph.
pub fn validate_graph(graph: &TaskGraph) -> Result<()> {
    if graph.nodes.is_empty() {
        return Err(GirderError::InvalidInput(
            "plan produced an empty task graph".to_string(),
        ));
    }

    let mut ids = HashSet::new();
    for node in &graph.nodes {
        if !ids.insert(node.task_id.as_str()) {
            return Err(GirderError::InvalidInput(format!(
                "duplicate task id '{}'",
                node.task_id
            )));
        }
    }

    for node in &graph.nodes {
        for dep in &node.dependencies {
            if !ids.contains(dep.as_str()) {
                return Err(GirderError::InvalidInput(format!(
                    "task '{}' depends on unknown task '{}'",
                    node.task_id, dep
                )));
            }
        }
    }

    if let Some(path) = detect_cycle(&graph.nodes) {
        return Err(GirderError::InvalidInput(format!(
            "cycle in task graph: {}",
            path.join(" -> ")
        )));
    }

    Ok(())
}

/// DFS cycle detection over the dependency edges. Returns the offending
/// path when a cycle exists.
pub fn detect_cycle(nodes: &[TaskNode]) -> Option<Vec<String>> {
    let by_id: HashMap<&str, &TaskNode> =
        nodes.iter().map(|n| (n.task_id.as_str(), n)).collect();

    let mut visited = HashSet::new();
    for node in nodes {
        let mut path = Vec::new();
        if dfs_cycle(&node.task_id, &by_id, &mut visited, &mut path) {
            return Some(path);
        }
    }
    None
}

fn dfs_cycle(
    task_id: &str,
    by_id: &HashMap<&str, &TaskNode>,
    visited: &mut HashSet<String>,
    path: &mut Vec<String>,
) -> bool {
    if path.iter().any(|p| p == task_id) {
        path.push(task_id.to_string());
        return true;
    }
    if visited.contains(task_id) {
        return false;
    }
    visited.insert(task_id.to_string());
    path.push(task_id.to_string());

    if let Some(node) = by_id.get(task_id) {
        for dep in &node.dependencies {
            if dfs_cycle(dep, by_id, visited, path) {
                return true;
            }
        }
    }

    path.pop();
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use girder_types::TaskType;

    fn node(id: &str, deps: &[&str]) -> TaskNode {
        let mut n = TaskNode::new(id, TaskType::CreateFile);
        n.dependencies = deps.iter().map(|d| d.to_string()).collect();
        n
    }

    fn graph(nodes: Vec<TaskNode>) -> TaskGraph {
        TaskGraph {
            nodes,
            metadata: Default::default(),
        }
    }

    #[test]
    fn valid_chain_passes() {
        let g = graph(vec![node("a", &[]), node("b", &["a"]), node("c", &["b"])]);
        assert!(validate_graph(&g).is_ok());
    }

    #[test]
    fn empty_graph_is_rejected() {
        let err = validate_graph(&graph(vec![])).unwrap_err();
        assert!(err.to_string().contains("empty"));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let err = validate_graph(&graph(vec![node("a", &["ghost"])])).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let err = validate_graph(&graph(vec![node("a", &[]), node("a", &[])])).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn cycle_is_reported_with_path() {
        let g = graph(vec![node("a", &["c"]), node("b", &["a"]), node("c", &["b"])]);
        let err = validate_graph(&g).unwrap_err();
        assert!(err.to_string().contains("cycle"));
        assert!(detect_cycle(&g.nodes).is_some());
    }
}
