// Designer stage: expands the architect's brief into design notes that
// ride along with each plan version.

use crate::context::AgentContext;
use crate::contract::{Agent, AgentInputs, AgentOutcome, AgentOutputs, AgentRole};
use crate::stages::write_file_artifact;
use async_trait::async_trait;
use girder_types::ArtifactType;

pub struct DesignerAgent;

#[async_trait]
impl Agent for DesignerAgent {
    fn role(&self) -> AgentRole {
        AgentRole::Designer
    }

    async fn execute(
        &self,
        _action: &str,
        inputs: AgentInputs,
        ctx: &AgentContext,
    ) -> AgentOutcome {
        let version = inputs
            .extra
            .get("plan_version")
            .and_then(|v| v.as_u64())
            .unwrap_or(1);
        let recommendations: Vec<String> = inputs
            .extra
            .get("recommendations")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        let mut notes = format!("# Design notes, plan v{}\n", version);
        if recommendations.is_empty() {
            notes.push_str("\nInitial layout derived from the requirements brief.\n");
        } else {
            notes.push_str("\n## Applied recommendations\n");
            for rec in &recommendations {
                notes.push_str(&format!("- {}\n", rec));
            }
        }

        let path = format!("reports/design_v{}.md", version);
        match write_file_artifact(
            ctx,
            inputs.step_id.as_deref().unwrap_or("designer"),
            ArtifactType::Report,
            &path,
            &notes,
        ) {
            Ok(artifact) => AgentOutcome::Success(AgentOutputs {
                artifacts: vec![artifact],
                notes: Some(notes),
                ..AgentOutputs::default()
            }),
            Err(e) => AgentOutcome::Failure(girder_types::FailureSignal {
                failure_type: girder_types::FailureType::Infra,
                source: "designer".to_string(),
                message: format!("design notes write failed: {}", e),
                severity: girder_types::Severity::Medium,
                can_retry: true,
                requires_replan: false,
                evidence: Default::default(),
                confidence: 1.0,
            }),
        }
    }
}
