// Devops stage: packages verified artifacts into a deploy manifest and
// reports whether the build output is bootable.

use crate::context::AgentContext;
use crate::contract::{Agent, AgentInputs, AgentOutcome, AgentOutputs, AgentRole};
use crate::stages::{verify_artifact, write_file_artifact};
use async_trait::async_trait;
use girder_types::ArtifactType;
use serde_json::json;

pub struct DevopsAgent;

#[async_trait]
impl Agent for DevopsAgent {
    fn role(&self) -> AgentRole {
        AgentRole::Devops
    }

    async fn execute(
        &self,
        _action: &str,
        inputs: AgentInputs,
        ctx: &AgentContext,
    ) -> AgentOutcome {
        let all_verified = inputs
            .artifacts
            .iter()
            .all(|a| verify_artifact(&ctx.workspace, a));

        let manifest = json!({
            "build_id": ctx.build_id,
            "artifacts": inputs
                .artifacts
                .iter()
                .map(|a| json!({
                    "path": a.path,
                    "hash": a.content_hash,
                    "bytes": a.bytes_written,
                }))
                .collect::<Vec<_>>(),
            "bootable": all_verified,
        });
        let body = match serde_json::to_string_pretty(&manifest) {
            Ok(body) => body,
            Err(_) => manifest.to_string(),
        };

        let step_id = inputs.step_id.as_deref().unwrap_or("devops");
        match write_file_artifact(
            ctx,
            step_id,
            ArtifactType::Devops,
            "deploy/manifest.json",
            &body,
        ) {
            Ok(artifact) => AgentOutcome::Success(AgentOutputs {
                artifacts: vec![artifact],
                bootable: Some(all_verified),
                ..AgentOutputs::default()
            }),
            Err(e) => AgentOutcome::Failure(girder_types::FailureSignal {
                failure_type: girder_types::FailureType::Infra,
                source: "devops".to_string(),
                message: format!("manifest write failed: {}", e),
                severity: girder_types::Severity::Medium,
                can_retry: true,
                requires_replan: false,
                evidence: Default::default(),
                confidence: 1.0,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::write_file_artifact;
    use girder_types::TenantId;
    use tempfile::tempdir;

    #[tokio::test]
    async fn manifest_lists_artifacts_and_sets_bootable() {
        let dir = tempdir().unwrap();
        let ctx = AgentContext::new(
            TenantId::new("acme"),
            "bld_test".into(),
            dir.path().to_path_buf(),
        );
        let artifact =
            write_file_artifact(&ctx, "step_1", ArtifactType::Code, "a.txt", "content").unwrap();

        let outcome = DevopsAgent
            .execute(
                "package",
                AgentInputs {
                    artifacts: vec![artifact],
                    step_id: Some("step_1".into()),
                    ..AgentInputs::default()
                },
                &ctx,
            )
            .await;

        match outcome {
            AgentOutcome::Success(outputs) => {
                assert_eq!(outputs.bootable, Some(true));
                let manifest =
                    std::fs::read_to_string(dir.path().join("deploy/manifest.json")).unwrap();
                assert!(manifest.contains("a.txt"));
            }
            AgentOutcome::Failure(signal) => panic!("unexpected failure: {}", signal.message),
        }
    }
}
