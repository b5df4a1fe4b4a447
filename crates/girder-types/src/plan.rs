use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

// ============================================================================
// Task graph
// ============================================================================

/// Kind of work a task node represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    CreateFile,
    CreateDirectory,
    GenerateModule,
    CreateSchema,
    CreateTest,
    RunAcceptance,
    SetupRepo,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::CreateFile => "create_file",
            TaskType::CreateDirectory => "create_directory",
            TaskType::GenerateModule => "generate_module",
            TaskType::CreateSchema => "create_schema",
            TaskType::CreateTest => "create_test",
            TaskType::RunAcceptance => "run_acceptance",
            TaskType::SetupRepo => "setup_repo",
        }
    }
}

/// A single unit of work in the build plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskNode {
    pub task_id: String,
    pub task_type: TaskType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acceptance_criteria: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
    /// When set, the node must not run concurrently with any other node.
    #[serde(default)]
    pub requires_exclusive: bool,
}

impl TaskNode {
    pub fn new(task_id: impl Into<String>, task_type: TaskType) -> Self {
        Self {
            task_id: task_id.into(),
            task_type,
            file: None,
            directory: None,
            anchor: None,
            content: None,
            acceptance_criteria: None,
            dependencies: Vec::new(),
            metadata: HashMap::new(),
            requires_exclusive: false,
        }
    }

    /// The workspace-relative path this node will produce, if any.
    pub fn target_path(&self) -> Option<&str> {
        self.file.as_deref().or(self.directory.as_deref())
    }
}

/// The complete build plan as a DAG of task nodes. Node order is the
/// author's order; edges live in each node's `dependencies`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskGraph {
    pub nodes: Vec<TaskNode>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl TaskGraph {
    pub fn node(&self, task_id: &str) -> Option<&TaskNode> {
        self.nodes.iter().find(|n| n.task_id == task_id)
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }
}

// ============================================================================
// Plans
// ============================================================================

/// The compiled expansion of a spec. Immutable; replanning produces a new
/// version linked to its predecessor via `original_plan_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub spec_id: String,
    /// Monotonically increasing per spec, starting at 1.
    pub version: u32,
    pub graph: TaskGraph,
    /// Estimated execution risk in `[0, 1]`.
    pub risk_score: f64,
    pub summary: String,
    #[serde(default)]
    pub diff_preview: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_plan_id: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_graph_round_trips_through_json() {
        let mut node = TaskNode::new("create_dir_hello", TaskType::CreateDirectory);
        node.directory = Some("hello".into());
        let mut dependent = TaskNode::new("create_file_hello_main", TaskType::CreateFile);
        dependent.file = Some("hello/main.txt".into());
        dependent.dependencies = vec!["create_dir_hello".into()];

        let graph = TaskGraph {
            nodes: vec![node, dependent],
            metadata: HashMap::new(),
        };

        let json = serde_json::to_string(&graph).unwrap();
        let back: TaskGraph = serde_json::from_str(&json).unwrap();
        assert_eq!(graph, back);
    }

    #[test]
    fn target_path_prefers_file() {
        let mut node = TaskNode::new("t", TaskType::CreateFile);
        node.file = Some("a.txt".into());
        node.directory = Some("a".into());
        assert_eq!(node.target_path(), Some("a.txt"));
    }
}
