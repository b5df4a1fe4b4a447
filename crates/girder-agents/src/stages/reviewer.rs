// Reviewer stage: closes out a build with a release summary and rollback
// notes.

use crate::context::AgentContext;
use crate::contract::{Agent, AgentInputs, AgentOutcome, AgentOutputs, AgentRole};
use crate::stages::write_file_artifact;
use async_trait::async_trait;
use girder_types::ArtifactType;

pub struct ReviewerAgent;

#[async_trait]
impl Agent for ReviewerAgent {
    fn role(&self) -> AgentRole {
        AgentRole::Reviewer
    }

    async fn execute(
        &self,
        _action: &str,
        inputs: AgentInputs,
        ctx: &AgentContext,
    ) -> AgentOutcome {
        let mut summary = format!("# Release summary for {}\n\n## Artifacts\n", ctx.build_id);
        for artifact in &inputs.artifacts {
            summary.push_str(&format!(
                "- {} ({} bytes, {})\n",
                artifact.path,
                artifact.bytes_written,
                &artifact.content_hash[..12.min(artifact.content_hash.len())]
            ));
        }
        summary.push_str(
            "\n## Rollback\nDelete the build workspace directory; the registry record is \
             retained as history.\n",
        );

        match write_file_artifact(
            ctx,
            inputs.step_id.as_deref().unwrap_or("reviewer"),
            ArtifactType::Report,
            "reports/release.md",
            &summary,
        ) {
            Ok(artifact) => AgentOutcome::Success(AgentOutputs {
                artifacts: vec![artifact],
                notes: Some(summary),
                ..AgentOutputs::default()
            }),
            Err(e) => AgentOutcome::Failure(girder_types::FailureSignal {
                failure_type: girder_types::FailureType::Infra,
                source: "reviewer".to_string(),
                message: format!("release summary write failed: {}", e),
                severity: girder_types::Severity::Medium,
                can_retry: true,
                requires_replan: false,
                evidence: Default::default(),
                confidence: 1.0,
            }),
        }
    }
}
