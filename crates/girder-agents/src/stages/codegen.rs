// Codegen stage: materializes a task node into workspace files.

use crate::context::AgentContext;
use crate::contract::{Agent, AgentInputs, AgentOutcome, AgentOutputs, AgentRole};
use crate::stages::{write_dir_artifact, write_file_artifact};
use async_trait::async_trait;
use girder_types::{
    ArtifactType, FailureSignal, FailureType, Severity, TaskNode, TaskType,
};
use std::collections::HashMap;

pub struct CodegenAgent;

#[async_trait]
impl Agent for CodegenAgent {
    fn role(&self) -> AgentRole {
        AgentRole::Codegen
    }

    async fn execute(
        &self,
        _action: &str,
        inputs: AgentInputs,
        ctx: &AgentContext,
    ) -> AgentOutcome {
        let Some(node) = inputs.node else {
            return AgentOutcome::Failure(planning_defect("codegen", "no task node supplied"));
        };
        let step_id = inputs.step_id.as_deref().unwrap_or(node.task_id.as_str());

        match node.task_type {
            TaskType::CreateDirectory | TaskType::SetupRepo => {
                let Some(dir) = node.target_path() else {
                    return AgentOutcome::Failure(planning_defect(
                        &node.task_id,
                        "directory node has no target path",
                    ));
                };
                match write_dir_artifact(ctx, step_id, dir) {
                    Ok(artifact) => {
                        let mut outputs = AgentOutputs::default();
                        // A repo setup seeds a marker file so the workspace
                        // is visibly initialized.
                        if node.task_type == TaskType::SetupRepo {
                            let readme = format!("{}/README.md", dir.trim_end_matches('/'));
                            match write_file_artifact(
                                ctx,
                                step_id,
                                ArtifactType::Code,
                                &readme,
                                "# generated workspace\n",
                            ) {
                                Ok(seed) => outputs.artifacts.push(seed),
                                Err(e) => {
                                    return AgentOutcome::Failure(io_failure(&node.task_id, &e))
                                }
                            }
                        }
                        outputs.artifacts.insert(0, artifact);
                        AgentOutcome::Success(outputs)
                    }
                    Err(e) => AgentOutcome::Failure(io_failure(&node.task_id, &e)),
                }
            }
            TaskType::CreateFile
            | TaskType::CreateSchema
            | TaskType::GenerateModule
            | TaskType::CreateTest => {
                let Some(file) = node.file.clone() else {
                    return AgentOutcome::Failure(planning_defect(
                        &node.task_id,
                        "file node has no target path",
                    ));
                };
                let content = effective_content(&node);
                match write_file_artifact(ctx, step_id, ArtifactType::Code, &file, &content) {
                    Ok(artifact) => AgentOutcome::Success(AgentOutputs {
                        artifacts: vec![artifact],
                        ..AgentOutputs::default()
                    }),
                    Err(e) => AgentOutcome::Failure(io_failure(&node.task_id, &e)),
                }
            }
            TaskType::RunAcceptance => {
                // Acceptance is evaluator-only; codegen has nothing to emit.
                AgentOutcome::Success(AgentOutputs::default())
            }
        }
    }
}

fn effective_content(node: &TaskNode) -> String {
    if let Some(content) = &node.content {
        if !content.is_empty() {
            return content.clone();
        }
    }
    match node.task_type {
        TaskType::CreateSchema => "{\n  \"type\": \"object\"\n}\n".to_string(),
        TaskType::GenerateModule => {
            let name = node
                .metadata
                .get("module_name")
                .and_then(|v| v.as_str())
                .unwrap_or(node.task_id.as_str());
            format!("# module {}\n\ngenerated outline\n", name)
        }
        TaskType::CreateTest => node
            .acceptance_criteria
            .clone()
            .unwrap_or_else(|| "unspecified criterion".to_string()),
        _ => format!("generated by {}\n", node.task_id),
    }
}

fn planning_defect(source: &str, message: &str) -> FailureSignal {
    FailureSignal {
        failure_type: FailureType::Runtime,
        source: source.to_string(),
        message: message.to_string(),
        severity: Severity::Medium,
        can_retry: false,
        requires_replan: true,
        evidence: HashMap::new(),
        confidence: 1.0,
    }
}

fn io_failure(source: &str, err: &std::io::Error) -> FailureSignal {
    FailureSignal {
        failure_type: FailureType::Infra,
        source: source.to_string(),
        message: format!("workspace write failed: {}", err),
        severity: Severity::Medium,
        can_retry: true,
        requires_replan: false,
        evidence: HashMap::new(),
        confidence: 1.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use girder_types::TenantId;
    use tempfile::tempdir;

    fn ctx(dir: &tempfile::TempDir) -> AgentContext {
        AgentContext::new(
            TenantId::new("acme"),
            "bld_test".into(),
            dir.path().to_path_buf(),
        )
    }

    #[tokio::test]
    async fn creates_file_with_node_content() {
        let dir = tempdir().unwrap();
        let mut node = TaskNode::new("create_file_hello_main", TaskType::CreateFile);
        node.file = Some("hello/main.txt".into());
        node.content = Some("hello world\n".into());

        let outcome = CodegenAgent
            .execute(
                "generate",
                AgentInputs {
                    node: Some(node),
                    step_id: Some("step_1".into()),
                    ..AgentInputs::default()
                },
                &ctx(&dir),
            )
            .await;

        match outcome {
            AgentOutcome::Success(outputs) => {
                assert_eq!(outputs.artifacts.len(), 1);
                let artifact = &outputs.artifacts[0];
                assert_eq!(artifact.path, "hello/main.txt");
                assert!(artifact.bytes_written > 0);
                let written =
                    std::fs::read_to_string(dir.path().join("hello/main.txt")).unwrap();
                assert_eq!(written, "hello world\n");
            }
            AgentOutcome::Failure(signal) => panic!("unexpected failure: {}", signal.message),
        }
    }

    #[tokio::test]
    async fn setup_repo_seeds_a_marker_file() {
        let dir = tempdir().unwrap();
        let mut node = TaskNode::new("setup_repo", TaskType::SetupRepo);
        node.directory = Some("site".into());

        let outcome = CodegenAgent
            .execute(
                "generate",
                AgentInputs {
                    node: Some(node),
                    ..AgentInputs::default()
                },
                &ctx(&dir),
            )
            .await;

        match outcome {
            AgentOutcome::Success(outputs) => {
                assert_eq!(outputs.artifacts.len(), 2);
                assert!(dir.path().join("site/README.md").exists());
            }
            AgentOutcome::Failure(signal) => panic!("unexpected failure: {}", signal.message),
        }
    }

    #[tokio::test]
    async fn pathless_node_requires_replan() {
        let dir = tempdir().unwrap();
        let node = TaskNode::new("broken", TaskType::CreateFile);

        let outcome = CodegenAgent
            .execute(
                "generate",
                AgentInputs {
                    node: Some(node),
                    ..AgentInputs::default()
                },
                &ctx(&dir),
            )
            .await;

        match outcome {
            AgentOutcome::Failure(signal) => {
                assert!(signal.requires_replan);
                assert!(!signal.can_retry);
            }
            AgentOutcome::Success(_) => panic!("expected failure"),
        }
    }
}
