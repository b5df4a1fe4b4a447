// Architect stage: turns the spec into a requirements brief consumed by
// the designer and by replans.

use crate::context::AgentContext;
use crate::contract::{Agent, AgentInputs, AgentOutcome, AgentOutputs, AgentRole};
use crate::stages::write_file_artifact;
use async_trait::async_trait;
use girder_types::ArtifactType;

pub struct ArchitectAgent;

#[async_trait]
impl Agent for ArchitectAgent {
    fn role(&self) -> AgentRole {
        AgentRole::Architect
    }

    async fn execute(
        &self,
        _action: &str,
        inputs: AgentInputs,
        ctx: &AgentContext,
    ) -> AgentOutcome {
        let (title, goal) = inputs
            .spec
            .as_ref()
            .map(|s| (s.title.clone(), s.plan_input()))
            .unwrap_or_else(|| ("untitled".to_string(), String::new()));
        let delta_goal = inputs
            .extra
            .get("delta_goal")
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        let mut brief = format!("# Requirements: {}\n\n{}\n", title, goal.trim());
        if !delta_goal.is_empty() {
            brief.push_str(&format!("\n## Revision goal\n{}\n", delta_goal));
        }

        match write_file_artifact(
            ctx,
            inputs.step_id.as_deref().unwrap_or("architect"),
            ArtifactType::Report,
            "reports/requirements.md",
            &brief,
        ) {
            Ok(artifact) => AgentOutcome::Success(AgentOutputs {
                artifacts: vec![artifact],
                notes: Some(brief),
                ..AgentOutputs::default()
            }),
            Err(e) => AgentOutcome::Failure(girder_types::FailureSignal {
                failure_type: girder_types::FailureType::Infra,
                source: "architect".to_string(),
                message: format!("brief write failed: {}", e),
                severity: girder_types::Severity::Medium,
                can_retry: true,
                requires_replan: false,
                evidence: Default::default(),
                confidence: 1.0,
            }),
        }
    }
}
