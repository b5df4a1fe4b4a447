// The capability contract shared by every pipeline stage.
//
// Agents never throw: they return typed outcomes, and anything that panics
// inside one is converted into an `unknown` failure signal by the dispatch
// wrapper. Retries belong to the orchestrator, not to agents.

use crate::context::AgentContext;
use async_trait::async_trait;
use girder_types::{
    Artifact, EvaluationReport, FailureSignal, FailureType, Severity, Spec, TaskNode,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Architect,
    Designer,
    Security,
    Codegen,
    Evaluator,
    AutoFixer,
    Devops,
    Reviewer,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Architect => "architect",
            AgentRole::Designer => "designer",
            AgentRole::Security => "security",
            AgentRole::Codegen => "codegen",
            AgentRole::Evaluator => "evaluator",
            AgentRole::AutoFixer => "auto_fixer",
            AgentRole::Devops => "devops",
            AgentRole::Reviewer => "reviewer",
        }
    }
}

/// Inputs handed to a stage. Prior-stage artifacts are immutable; stages
/// only ever add to the set.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentInputs {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<TaskNode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spec: Option<Spec>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub artifacts: Vec<Artifact>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<FailureSignal>,
    #[serde(skip_serializing_if = "HashMap::is_empty", default)]
    pub extra: HashMap<String, Value>,
}

#[derive(Debug, Clone, Default)]
pub struct AgentOutputs {
    pub artifacts: Vec<Artifact>,
    pub report: Option<EvaluationReport>,
    pub notes: Option<String>,
    pub bootable: Option<bool>,
}

#[derive(Debug, Clone)]
pub enum AgentOutcome {
    Success(AgentOutputs),
    Failure(FailureSignal),
}

impl AgentOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, AgentOutcome::Success(_))
    }
}

/// Observability record attached to the run context for every invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpan {
    pub agent_role: AgentRole,
    pub action: String,
    pub inputs_hash: String,
    pub output_hash: String,
    pub elapsed_ms: u64,
}

#[async_trait]
pub trait Agent: Send + Sync {
    fn role(&self) -> AgentRole;

    async fn execute(
        &self,
        action: &str,
        inputs: AgentInputs,
        ctx: &AgentContext,
    ) -> AgentOutcome;
}

/// Dispatch table keyed by role, plus the deadline / panic / span wrapper
/// every invocation goes through.
pub struct AgentSet {
    agents: HashMap<AgentRole, Arc<dyn Agent>>,
}

impl AgentSet {
    /// The production wiring of all eight stages.
    pub fn production() -> Self {
        use crate::stages::*;
        let mut set = Self {
            agents: HashMap::new(),
        };
        set.install(Arc::new(ArchitectAgent));
        set.install(Arc::new(DesignerAgent));
        set.install(Arc::new(SecurityAgent));
        set.install(Arc::new(CodegenAgent));
        set.install(Arc::new(EvaluatorAgent));
        set.install(Arc::new(AutoFixerAgent));
        set.install(Arc::new(DevopsAgent));
        set.install(Arc::new(ReviewerAgent));
        set
    }

    pub fn empty() -> Self {
        Self {
            agents: HashMap::new(),
        }
    }

    /// Register or replace the agent for a role. Tests use this to swap in
    /// scripted stages.
    pub fn install(&mut self, agent: Arc<dyn Agent>) {
        self.agents.insert(agent.role(), agent);
    }

    /// Invoke one stage: deadline-bounded, panic-isolated, span-recorded.
    pub async fn invoke(
        &self,
        role: AgentRole,
        action: &str,
        inputs: AgentInputs,
        ctx: &AgentContext,
    ) -> (AgentOutcome, AgentSpan) {
        let inputs_hash = short_hash(
            serde_json::to_string(&inputs)
                .unwrap_or_default()
                .as_bytes(),
        );
        let started = std::time::Instant::now();

        let outcome = match self.agents.get(&role) {
            Some(agent) => {
                let agent = Arc::clone(agent);
                let action_owned = action.to_string();
                let ctx_clone = ctx.clone();
                let handle = tokio::spawn(async move {
                    agent.execute(&action_owned, inputs, &ctx_clone).await
                });
                match tokio::time::timeout(ctx.total_deadline, handle).await {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(join_err)) => {
                        tracing::error!(
                            role = role.as_str(),
                            action,
                            error = %join_err,
                            "agent crashed; converting to failure signal"
                        );
                        AgentOutcome::Failure(crashed_signal(role, &join_err.to_string()))
                    }
                    Err(_) => AgentOutcome::Failure(deadline_signal(role, ctx)),
                }
            }
            None => AgentOutcome::Failure(FailureSignal {
                failure_type: FailureType::Runtime,
                source: role.as_str().to_string(),
                message: format!("no agent installed for role {}", role.as_str()),
                severity: Severity::High,
                can_retry: false,
                requires_replan: false,
                evidence: HashMap::new(),
                confidence: 1.0,
            }),
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        if started.elapsed() > ctx.model_deadline {
            tracing::warn!(
                role = role.as_str(),
                action,
                elapsed_ms,
                "agent exceeded soft deadline"
            );
        }

        let output_hash = match &outcome {
            AgentOutcome::Success(outputs) => short_hash(
                outputs
                    .artifacts
                    .iter()
                    .map(|a| a.content_hash.as_str())
                    .collect::<Vec<_>>()
                    .join(",")
                    .as_bytes(),
            ),
            AgentOutcome::Failure(signal) => short_hash(signal.message.as_bytes()),
        };

        let span = AgentSpan {
            agent_role: role,
            action: action.to_string(),
            inputs_hash,
            output_hash,
            elapsed_ms,
        };
        (outcome, span)
    }
}

fn deadline_signal(role: AgentRole, ctx: &AgentContext) -> FailureSignal {
    FailureSignal {
        failure_type: FailureType::Transient,
        source: role.as_str().to_string(),
        message: format!(
            "agent deadline of {:?} exceeded",
            ctx.total_deadline
        ),
        severity: Severity::Medium,
        can_retry: true,
        requires_replan: false,
        evidence: HashMap::new(),
        confidence: 1.0,
    }
}

fn crashed_signal(role: AgentRole, detail: &str) -> FailureSignal {
    let mut evidence = HashMap::new();
    evidence.insert("join_error".to_string(), Value::String(detail.to_string()));
    FailureSignal {
        failure_type: FailureType::Unknown,
        source: role.as_str().to_string(),
        message: "agent crashed during execution".to_string(),
        severity: Severity::High,
        can_retry: true,
        requires_replan: false,
        evidence,
        confidence: 0.0,
    }
}

pub fn short_hash(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest
        .iter()
        .take(8)
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use girder_types::TenantId;
    use tempfile::tempdir;

    struct PanickingAgent;

    #[async_trait]
    impl Agent for PanickingAgent {
        fn role(&self) -> AgentRole {
            AgentRole::Codegen
        }

        async fn execute(&self, _: &str, _: AgentInputs, _: &AgentContext) -> AgentOutcome {
            panic!("simulated agent crash");
        }
    }

    struct SlowAgent;

    #[async_trait]
    impl Agent for SlowAgent {
        fn role(&self) -> AgentRole {
            AgentRole::Codegen
        }

        async fn execute(&self, _: &str, _: AgentInputs, _: &AgentContext) -> AgentOutcome {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            AgentOutcome::Success(AgentOutputs::default())
        }
    }

    fn ctx(dir: &tempfile::TempDir) -> AgentContext {
        AgentContext::new(
            TenantId::new("acme"),
            "bld_test".into(),
            dir.path().to_path_buf(),
        )
    }

    #[tokio::test]
    async fn agent_panic_becomes_unknown_high_signal() {
        let dir = tempdir().unwrap();
        let mut set = AgentSet::empty();
        set.install(Arc::new(PanickingAgent));

        let (outcome, span) = set
            .invoke(AgentRole::Codegen, "generate", AgentInputs::default(), &ctx(&dir))
            .await;
        match outcome {
            AgentOutcome::Failure(signal) => {
                assert_eq!(signal.failure_type, FailureType::Unknown);
                assert_eq!(signal.severity, Severity::High);
            }
            AgentOutcome::Success(_) => panic!("expected failure"),
        }
        assert_eq!(span.agent_role, AgentRole::Codegen);
    }

    #[tokio::test]
    async fn deadline_overrun_becomes_transient_signal() {
        let dir = tempdir().unwrap();
        let mut set = AgentSet::empty();
        set.install(Arc::new(SlowAgent));

        let mut context = ctx(&dir);
        context.total_deadline = std::time::Duration::from_millis(50);

        let (outcome, _) = set
            .invoke(AgentRole::Codegen, "generate", AgentInputs::default(), &context)
            .await;
        match outcome {
            AgentOutcome::Failure(signal) => {
                assert_eq!(signal.failure_type, FailureType::Transient);
                assert!(signal.can_retry);
            }
            AgentOutcome::Success(_) => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn missing_role_is_a_non_retryable_failure() {
        let dir = tempdir().unwrap();
        let set = AgentSet::empty();
        let (outcome, _) = set
            .invoke(AgentRole::Reviewer, "finalize", AgentInputs::default(), &ctx(&dir))
            .await;
        match outcome {
            AgentOutcome::Failure(signal) => assert!(!signal.can_retry),
            AgentOutcome::Success(_) => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn spans_hash_inputs_deterministically() {
        let dir = tempdir().unwrap();
        let set = AgentSet::empty();
        let (_, a) = set
            .invoke(AgentRole::Codegen, "generate", AgentInputs::default(), &ctx(&dir))
            .await;
        let (_, b) = set
            .invoke(AgentRole::Codegen, "generate", AgentInputs::default(), &ctx(&dir))
            .await;
        assert_eq!(a.inputs_hash, b.inputs_hash);
    }
}
