// Evaluator stage: judges artifacts against acceptance criteria.
//
// Always returns a report on success, passed or not; the orchestrator uses
// `report.passed` as the gate for devops/reviewer.

use crate::context::AgentContext;
use crate::contract::{Agent, AgentInputs, AgentOutcome, AgentOutputs, AgentRole};
use crate::stages::verify_artifact;
use async_trait::async_trait;
use girder_types::{CriterionResult, EvaluationReport, TaskType};

pub struct EvaluatorAgent;

#[async_trait]
impl Agent for EvaluatorAgent {
    fn role(&self) -> AgentRole {
        AgentRole::Evaluator
    }

    async fn execute(
        &self,
        _action: &str,
        inputs: AgentInputs,
        ctx: &AgentContext,
    ) -> AgentOutcome {
        let is_acceptance = inputs
            .node
            .as_ref()
            .map(|n| n.task_type == TaskType::RunAcceptance)
            .unwrap_or(false);

        let criteria_results = if is_acceptance {
            self.evaluate_acceptance(&inputs, ctx)
        } else {
            self.evaluate_step(&inputs, ctx)
        };

        let report = EvaluationReport::from_criteria(&ctx.build_id, criteria_results);
        let mut outputs = AgentOutputs {
            report: Some(report.clone()),
            ..AgentOutputs::default()
        };

        // Whole-plan acceptance produces the report itself as the step's
        // artifact; per-step evaluation judges the step's own outputs.
        if is_acceptance {
            let body = serde_json::to_string_pretty(&report).unwrap_or_else(|_| "{}".to_string());
            match crate::stages::write_file_artifact(
                ctx,
                inputs.step_id.as_deref().unwrap_or("run_acceptance"),
                girder_types::ArtifactType::Report,
                "reports/acceptance.json",
                &body,
            ) {
                Ok(artifact) => outputs.artifacts.push(artifact),
                Err(e) => {
                    tracing::warn!(error = %e, "acceptance report artifact not written");
                }
            }
        }

        AgentOutcome::Success(outputs)
    }
}

impl EvaluatorAgent {
    /// Per-step evaluation: the node's own criterion when it has one, plus
    /// the implicit "produced a verified artifact" criterion.
    fn evaluate_step(&self, inputs: &AgentInputs, ctx: &AgentContext) -> Vec<CriterionResult> {
        let mut results = Vec::new();

        let artifacts_ok = !inputs.artifacts.is_empty()
            && inputs
                .artifacts
                .iter()
                .all(|a| verify_artifact(&ctx.workspace, a));
        let node_id = inputs
            .node
            .as_ref()
            .map(|n| n.task_id.clone())
            .unwrap_or_else(|| "step".to_string());

        results.push(CriterionResult {
            id: format!("{}_artifact", node_id),
            passed: artifacts_ok,
            reason: if artifacts_ok {
                "artifact exists and matches its declared shape".to_string()
            } else {
                "missing or empty artifact".to_string()
            },
        });

        if let Some(criterion) = inputs
            .node
            .as_ref()
            .and_then(|n| n.acceptance_criteria.clone())
        {
            // A step-level criterion holds when the artifact that is
            // supposed to encode it verified.
            results.push(CriterionResult {
                id: node_id,
                passed: artifacts_ok,
                reason: criterion,
            });
        }

        results
    }

    /// Whole-plan acceptance: every criterion must be encoded by some
    /// verified artifact whose content mentions it.
    fn evaluate_acceptance(&self, inputs: &AgentInputs, ctx: &AgentContext) -> Vec<CriterionResult> {
        let criteria: Vec<String> = inputs
            .extra
            .get("criteria")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        if criteria.is_empty() {
            return vec![CriterionResult {
                id: "acceptance".to_string(),
                passed: true,
                reason: "no acceptance criteria declared".to_string(),
            }];
        }

        criteria
            .into_iter()
            .map(|criterion| {
                let satisfied = inputs.artifacts.iter().any(|artifact| {
                    verify_artifact(&ctx.workspace, artifact)
                        && std::fs::read_to_string(ctx.workspace.join(&artifact.path))
                            .map(|content| content.contains(&criterion))
                            .unwrap_or(false)
                });
                CriterionResult {
                    id: girder_plan_criterion_id(&criterion),
                    passed: satisfied,
                    reason: criterion,
                }
            })
            .collect()
    }
}

// Criterion ids here must agree with the parser's test node ids.
fn girder_plan_criterion_id(criterion: &str) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(criterion.trim().as_bytes());
    format!(
        "test_{:02x}{:02x}{:02x}{:02x}",
        digest[0], digest[1], digest[2], digest[3]
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::write_file_artifact;
    use girder_types::{ArtifactType, TaskNode, TenantId};
    use serde_json::json;
    use tempfile::tempdir;

    fn ctx(dir: &tempfile::TempDir) -> AgentContext {
        AgentContext::new(
            TenantId::new("acme"),
            "bld_test".into(),
            dir.path().to_path_buf(),
        )
    }

    #[tokio::test]
    async fn verified_artifact_passes_step_evaluation() {
        let dir = tempdir().unwrap();
        let ctx = ctx(&dir);
        let artifact =
            write_file_artifact(&ctx, "step_1", ArtifactType::Code, "a.txt", "content").unwrap();

        let mut node = TaskNode::new("create_file_a", girder_types::TaskType::CreateFile);
        node.file = Some("a.txt".into());

        let outcome = EvaluatorAgent
            .execute(
                "evaluate",
                AgentInputs {
                    node: Some(node),
                    artifacts: vec![artifact],
                    ..AgentInputs::default()
                },
                &ctx,
            )
            .await;

        match outcome {
            AgentOutcome::Success(outputs) => {
                let report = outputs.report.unwrap();
                assert!(report.passed);
                assert_eq!(report.overall_score, 100.0);
            }
            AgentOutcome::Failure(signal) => panic!("unexpected failure: {}", signal.message),
        }
    }

    #[tokio::test]
    async fn missing_artifact_fails_the_report() {
        let dir = tempdir().unwrap();
        let outcome = EvaluatorAgent
            .execute("evaluate", AgentInputs::default(), &ctx(&dir))
            .await;
        match outcome {
            AgentOutcome::Success(outputs) => {
                let report = outputs.report.unwrap();
                assert!(!report.passed);
            }
            AgentOutcome::Failure(signal) => panic!("unexpected failure: {}", signal.message),
        }
    }

    #[tokio::test]
    async fn acceptance_matches_criteria_to_artifact_content() {
        let dir = tempdir().unwrap();
        let ctx = ctx(&dir);
        let criterion = "the index page loads";
        let artifact = write_file_artifact(
            &ctx,
            "step_t",
            ArtifactType::Code,
            "tests/t1.txt",
            criterion,
        )
        .unwrap();

        let mut node = TaskNode::new("run_acceptance", girder_types::TaskType::RunAcceptance);
        node.dependencies = vec!["t1".into()];
        let mut inputs = AgentInputs {
            node: Some(node),
            artifacts: vec![artifact],
            ..AgentInputs::default()
        };
        inputs
            .extra
            .insert("criteria".into(), json!([criterion, "unmet criterion text"]));

        let outcome = EvaluatorAgent.execute("evaluate", inputs, &ctx).await;
        match outcome {
            AgentOutcome::Success(outputs) => {
                let report = outputs.report.unwrap();
                assert_eq!(report.criteria_results.len(), 2);
                assert!(report.criteria_results[0].passed);
                assert!(!report.criteria_results[1].passed);
                assert_eq!(report.overall_score, 50.0);
                assert!(!report.passed);
            }
            AgentOutcome::Failure(signal) => panic!("unexpected failure: {}", signal.message),
        }
    }
}
