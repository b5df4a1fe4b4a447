// Build execution engine. Drives every step of a plan to a terminal state
// while respecting dependencies, retry budgets, and approval gates.

use crate::autofix::{select_strategy, FixDecision};
use crate::context::RunContext;
use crate::locks::PathLockManager;
use girder_agents::stages::{verify_artifact, write_file_artifact};
use girder_agents::{
    action_for, full_build_postlude, full_build_prelude, stages_for, AgentContext, AgentInputs,
    AgentOutcome, AgentRole, AgentSet,
};
use girder_classify::{extract_backoff_hint, BackoffPolicy, FailureClassifier};
use girder_plan::{PlanCompiler, ReplanRequest};
use girder_registry::{BuildPatch, BuildRegistry, QuotaManager};
use girder_types::{
    new_fix_id, ApprovalGate, Artifact, ArtifactType, AutoFixOutcome, AutoFixRun, BuildStatus,
    EvaluationReport, FailureSignal, FailureType, GirderError, Result, Severity, Step, StepStatus,
    TaskNode, TaskType, TenantId,
};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Concurrent steps per build; 1 means strictly serial execution.
    pub max_parallel_steps: usize,
    pub backoff: BackoffPolicy,
    /// Multiplier applied to retry sleeps. Tests shrink it to keep retry
    /// scenarios fast; production leaves it at 1.
    pub backoff_scale: f64,
    /// Replan ceiling applied when the caller does not set one.
    pub default_max_iterations: u32,
    /// Flat spend recorded against the tenant's LLM budget per agent
    /// invocation.
    pub llm_cost_per_invocation: f64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_parallel_steps: 1,
            backoff: BackoffPolicy::default(),
            backoff_scale: 1.0,
            default_max_iterations: 3,
            llm_cost_per_invocation: 0.01,
        }
    }
}

/// How a `run` call ended: the build reached a terminal state, or it is
/// suspended behind a pending approval gate.
#[derive(Debug)]
pub enum BuildOutcome {
    Completed(BuildStatus),
    Suspended { gate_id: String },
}

/// A gate entry held by the engine until a human decides it.
pub struct GateEntry {
    pub gate: ApprovalGate,
    pub tenant: TenantId,
    /// Replacement content proposed by the auto-fixer, applied on approval.
    pub proposed_content: Option<String>,
    /// Task the gate suspends.
    pub task_id: String,
}

enum StepResolution {
    Retry,
    Replanned,
    StepFailed,
    BuildFailed(String),
    Suspended(String),
}

struct StageRun {
    task_id: String,
    artifacts: Vec<Artifact>,
    reports: Vec<EvaluationReport>,
    spans: Vec<girder_agents::AgentSpan>,
    failure: Option<(String, Option<FailureSignal>)>,
}

/// The orchestrator proper. One instance serves every build; per-build
/// state lives in the `RunContext` handed to [`BuildRunner::run`].
pub struct BuildRunner {
    pub registry: Arc<BuildRegistry>,
    pub quotas: Arc<QuotaManager>,
    pub agents: Arc<AgentSet>,
    pub classifier: FailureClassifier,
    pub compiler: PlanCompiler,
    pub locks: Arc<PathLockManager>,
    pub gates: Arc<StdMutex<HashMap<String, GateEntry>>>,
    pub artifact_index: Arc<StdMutex<HashMap<String, Vec<Artifact>>>>,
    pub workspace_root: PathBuf,
    pub config: OrchestratorConfig,
}

impl BuildRunner {
    pub fn new(
        registry: Arc<BuildRegistry>,
        quotas: Arc<QuotaManager>,
        agents: Arc<AgentSet>,
        workspace_root: PathBuf,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            registry,
            quotas,
            agents,
            classifier: FailureClassifier::new(),
            compiler: PlanCompiler::new(),
            locks: Arc::new(PathLockManager::new()),
            gates: Arc::new(StdMutex::new(HashMap::new())),
            artifact_index: Arc::new(StdMutex::new(HashMap::new())),
            workspace_root,
            config,
        }
    }

    fn agent_context(&self, ctx: &RunContext, cancel: &CancellationToken) -> AgentContext {
        AgentContext::new(
            ctx.build.tenant_id.clone(),
            ctx.build.build_id.clone(),
            self.workspace_root.join(&ctx.build.build_id),
        )
        .with_cancel(cancel.clone())
    }

    /// Execute the build to a terminal state or a suspension point.
    pub async fn run(
        &self,
        ctx: &mut RunContext,
        cancel: CancellationToken,
    ) -> Result<BuildOutcome> {
        let tenant = ctx.build.tenant_id.clone();
        let build_id = ctx.build.build_id.clone();

        self.registry
            .update(&build_id, &tenant, BuildPatch::status(BuildStatus::Running))?;
        ctx.build.status = BuildStatus::Running;
        self.log(ctx, &format!("build started (plan v{})", ctx.plan.version));

        if ctx.build.steps.is_empty() {
            if let Some(resolution) = self.run_prelude(ctx, &cancel).await? {
                return self.resolve_terminal(ctx, resolution).await;
            }
            self.ensure_steps(ctx)?;
        } else {
            // Resuming (after an approval, a retry, or a crash): steps left
            // running by the previous pass are orphans and restart.
            for step in ctx.build.steps.iter_mut() {
                if step.status == StepStatus::Running {
                    step.status = StepStatus::Pending;
                    step.started_at = None;
                }
            }
            self.persist_steps(ctx)?;
        }

        self.run_loop(ctx, cancel).await
    }

    async fn run_loop(
        &self,
        ctx: &mut RunContext,
        cancel: CancellationToken,
    ) -> Result<BuildOutcome> {
        loop {
            if cancel.is_cancelled() {
                return self.finalize(ctx, BuildStatus::Canceled, None).await;
            }

            let runnable = self.runnable_tasks(ctx);
            if runnable.is_empty() {
                let all_done = ctx
                    .build
                    .steps
                    .iter()
                    .all(|s| s.status == StepStatus::Succeeded);
                if all_done {
                    if let Some(resolution) = self.run_postlude(ctx, &cancel).await? {
                        if matches!(resolution, StepResolution::Replanned) {
                            // A replan during close-out can add nodes; go
                            // back to scheduling under the new plan.
                            continue;
                        }
                        return self.resolve_terminal(ctx, resolution).await;
                    }
                    return self.finalize(ctx, BuildStatus::Succeeded, None).await;
                }
                // Nothing runnable and not everything succeeded: a failed
                // step has starved the remainder of the DAG.
                return self
                    .finalize(
                        ctx,
                        BuildStatus::Failed,
                        Some("one or more steps failed".to_string()),
                    )
                    .await;
            }

            let batch = self.pick_batch(ctx, &runnable);
            let runs = self.execute_batch(ctx, &batch, &cancel).await?;

            for run in runs {
                ctx.spans.extend(run.spans);
                ctx.reports.extend(run.reports.clone());

                match run.failure {
                    None => self.complete_step(ctx, &run.task_id, run.artifacts)?,
                    Some((logs, signal)) => {
                        // Failed-step artifacts are not merged; only the
                        // failure log artifact is recorded below.
                        match self
                            .handle_step_failure(ctx, &run.task_id, &logs, signal, &cancel)
                            .await?
                        {
                            StepResolution::Retry | StepResolution::Replanned => {}
                            StepResolution::StepFailed => {
                                self.mark_step_failed(ctx, &run.task_id)?;
                            }
                            StepResolution::BuildFailed(reason) => {
                                return self.finalize(ctx, BuildStatus::Failed, Some(reason)).await;
                            }
                            StepResolution::Suspended(gate_id) => {
                                self.persist_steps(ctx)?;
                                self.log(ctx, &format!("suspended on approval gate {}", gate_id));
                                return Ok(BuildOutcome::Suspended { gate_id });
                            }
                        }
                    }
                }
            }
        }
    }

    // ========================================================================
    // Scheduling
    // ========================================================================

    fn runnable_tasks(&self, ctx: &RunContext) -> Vec<TaskNode> {
        let succeeded: HashSet<&str> = ctx
            .build
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Succeeded)
            .map(|s| s.name.as_str())
            .collect();
        let pending: HashSet<&str> = ctx
            .build
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Pending)
            .map(|s| s.name.as_str())
            .collect();

        ctx.plan
            .graph
            .nodes
            .iter()
            .filter(|node| {
                pending.contains(node.task_id.as_str())
                    && node
                        .dependencies
                        .iter()
                        .all(|dep| succeeded.contains(dep.as_str()))
            })
            .cloned()
            .collect()
    }

    fn pick_batch(&self, _ctx: &RunContext, runnable: &[TaskNode]) -> Vec<TaskNode> {
        if self.config.max_parallel_steps <= 1 {
            return runnable.iter().take(1).cloned().collect();
        }
        if runnable
            .first()
            .map(|n| n.requires_exclusive)
            .unwrap_or(false)
        {
            return runnable.iter().take(1).cloned().collect();
        }
        runnable
            .iter()
            .filter(|n| !n.requires_exclusive)
            .take(self.config.max_parallel_steps)
            .cloned()
            .collect()
    }

    async fn execute_batch(
        &self,
        ctx: &mut RunContext,
        batch: &[TaskNode],
        cancel: &CancellationToken,
    ) -> Result<Vec<StageRun>> {
        // Attempt accounting happens at schedule time, serially.
        for node in batch {
            ctx.retry_state.record_attempt(&node.task_id);
            self.mark_step_running(ctx, &node.task_id);
        }
        self.persist_steps(ctx)?;

        if batch.len() == 1 {
            let node = &batch[0];
            let run = self.run_step_stages(ctx, node, cancel).await;
            return Ok(vec![run]);
        }

        let mut join_set: JoinSet<StageRun> = JoinSet::new();
        for node in batch {
            let node = node.clone();
            let agents = Arc::clone(&self.agents);
            let locks = Arc::clone(&self.locks);
            let quotas = Arc::clone(&self.quotas);
            let agent_ctx = self.agent_context(ctx, cancel);
            let context_artifacts = ctx.artifacts.clone();
            let override_content = ctx.effective_content(&node.task_id).cloned();
            let plan_criteria = plan_criteria(&ctx.plan.graph.nodes);
            let cost = self.config.llm_cost_per_invocation;
            join_set.spawn(async move {
                run_stages(
                    agents,
                    locks,
                    quotas,
                    agent_ctx,
                    node,
                    override_content,
                    context_artifacts,
                    plan_criteria,
                    cost,
                )
                .await
            });
        }

        let mut runs = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(run) => runs.push(run),
                Err(e) => tracing::error!(error = %e, "step task join failed"),
            }
        }
        Ok(runs)
    }

    async fn run_step_stages(
        &self,
        ctx: &RunContext,
        node: &TaskNode,
        cancel: &CancellationToken,
    ) -> StageRun {
        run_stages(
            Arc::clone(&self.agents),
            Arc::clone(&self.locks),
            Arc::clone(&self.quotas),
            self.agent_context(ctx, cancel),
            node.clone(),
            ctx.effective_content(&node.task_id).cloned(),
            ctx.artifacts.clone(),
            plan_criteria(&ctx.plan.graph.nodes),
            self.config.llm_cost_per_invocation,
        )
        .await
    }

    // ========================================================================
    // Step completion and failure handling
    // ========================================================================

    fn complete_step(&self, ctx: &mut RunContext, task_id: &str, artifacts: Vec<Artifact>) -> Result<()> {
        let now = chrono::Utc::now();
        let (artifact_ref, sha256) = artifacts
            .first()
            .map(|a| (Some(a.id.clone()), Some(a.content_hash.clone())))
            .unwrap_or((None, None));
        let lines_changed: u64 = artifacts.iter().map(|a| a.bytes_written / 40 + 1).sum();

        if let Some(step) = ctx.build.steps.iter_mut().find(|s| s.name == task_id) {
            step.status = StepStatus::Succeeded;
            step.ended_at = Some(now);
            if let Some(started) = step.started_at {
                step.elapsed_ms = (now - started).num_milliseconds().max(0) as u64;
            }
            step.artifact_ref = artifact_ref;
            step.sha256 = sha256;
            step.lines_changed = lines_changed;
            step.anchor_matched = ctx
                .plan
                .graph
                .node(task_id)
                .and_then(|n| n.anchor.as_ref())
                .is_some();
            step.error = None;
        }

        self.index_artifacts(&ctx.build.build_id, &artifacts);
        ctx.add_artifacts(artifacts);
        self.persist_steps(ctx)?;
        self.log(ctx, &format!("step {} succeeded", task_id));
        Ok(())
    }

    async fn handle_step_failure(
        &self,
        ctx: &mut RunContext,
        task_id: &str,
        logs: &str,
        agent_signal: Option<FailureSignal>,
        cancel: &CancellationToken,
    ) -> Result<StepResolution> {
        // 1. The failure output itself becomes a logs artifact.
        let agent_ctx = self.agent_context(ctx, cancel);
        let attempt = ctx.retry_state.step_attempts(task_id);
        let log_path = format!("logs/{}/attempt_{}.log", task_id, attempt);
        if let Ok(artifact) =
            write_file_artifact(&agent_ctx, task_id, ArtifactType::Logs, &log_path, logs)
        {
            self.index_artifacts(&ctx.build.build_id, std::slice::from_ref(&artifact));
            ctx.artifacts.push(artifact);
        }

        // 2. Classify from the raw output. When the pattern tables come up
        // empty but the failing stage returned a more specific typed
        // signal, the stage's signal wins.
        let classified =
            self.classifier
                .classify(task_id, logs, &ctx.artifacts, &ctx.failure_signals);
        let signal = match agent_signal {
            Some(stage_signal)
                if classified.failure_type == FailureType::Unknown
                    && !classified.requires_replan
                    && stage_signal.failure_type != FailureType::Unknown =>
            {
                stage_signal
            }
            _ => classified,
        };
        let prior = ctx.failure_signals.clone();
        ctx.failure_signals.push(signal.clone());
        self.log(
            ctx,
            &format!(
                "step {} failed: {} ({})",
                task_id,
                signal.message,
                signal.failure_type.as_str()
            ),
        );

        // 3 + 4. Record the consideration, then pick a strategy.
        let hint = extract_backoff_hint(logs);
        let decision = select_strategy(
            &signal,
            &prior,
            &ctx.retry_state,
            task_id,
            hint,
            &self.config.backoff,
        );
        let fix_run = AutoFixRun {
            id: new_fix_id(),
            build_id: ctx.build.build_id.clone(),
            step_id: task_id.to_string(),
            signal_type: signal.failure_type.as_str().to_string(),
            attempt: ctx.retry_state.step_attempts(task_id) + 1,
            strategy: decision.strategy_name.clone(),
            outcome: decision.outcome,
            backoff_seconds: decision.backoff_seconds,
            created_at: chrono::Utc::now(),
        };
        self.log(
            ctx,
            &format!(
                "auto-fix {}: strategy={} outcome={:?}",
                fix_run.attempt, fix_run.strategy, fix_run.outcome
            ),
        );
        ctx.auto_fix_runs.push(fix_run);
        ctx.retry_state.last_backoff_seconds = decision.backoff_seconds;
        self.persist_steps(ctx)?;

        // 5. Dispatch on the chosen outcome.
        match decision.outcome {
            AutoFixOutcome::Retried => {
                let sleep_secs = decision.backoff_seconds * self.config.backoff_scale;
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(std::time::Duration::from_secs_f64(sleep_secs)) => {}
                }
                self.reset_step(ctx, task_id);
                Ok(StepResolution::Retry)
            }
            AutoFixOutcome::PatchApplied => {
                match self.generate_fix(ctx, task_id, &signal, cancel).await {
                    Some((artifacts, amended)) => {
                        self.index_artifacts(&ctx.build.build_id, &artifacts);
                        ctx.add_artifacts(artifacts);
                        if let Some(content) = amended {
                            ctx.content_overrides.insert(task_id.to_string(), content);
                        }
                        self.reset_step(ctx, task_id);
                        Ok(StepResolution::Retry)
                    }
                    None => {
                        self.log(ctx, &format!("fix generation failed for step {}", task_id));
                        self.give_up(ctx, &signal)
                    }
                }
            }
            AutoFixOutcome::Replanned => {
                let request = decision.re_plan_request.clone().unwrap_or_else(|| ReplanRequest {
                    delta_goal: format!("revise plan after failure in step {}", task_id),
                    recommendations: Vec::new(),
                    failed_task_ids: vec![task_id.to_string()],
                });
                self.replan(ctx, request, cancel).await
            }
            AutoFixOutcome::Escalated => {
                let gate_id = self.escalate(ctx, task_id, &signal, &decision, cancel).await?;
                Ok(StepResolution::Suspended(gate_id))
            }
            AutoFixOutcome::GaveUp => self.give_up(ctx, &signal),
        }
    }

    fn give_up(&self, ctx: &mut RunContext, signal: &FailureSignal) -> Result<StepResolution> {
        let exhausted = ctx.retry_state.total_attempts >= ctx.retry_state.max_total_attempts;
        let critical = signal.severity == Severity::Critical;
        if exhausted || critical {
            let reason = if critical {
                format!("unrecoverable failure: {}", signal.message)
            } else {
                "total attempt budget exhausted".to_string()
            };
            return Ok(StepResolution::BuildFailed(reason));
        }
        Ok(StepResolution::StepFailed)
    }

    async fn generate_fix(
        &self,
        ctx: &RunContext,
        task_id: &str,
        signal: &FailureSignal,
        cancel: &CancellationToken,
    ) -> Option<(Vec<Artifact>, Option<String>)> {
        // Synthetic steps (security review, final packaging) have no plan
        // node; the fixer falls back to a generic regeneration for them.
        let node = ctx.plan.graph.node(task_id).cloned();
        let inputs = AgentInputs {
            node,
            step_id: Some(task_id.to_string()),
            signal: Some(signal.clone()),
            ..AgentInputs::default()
        };
        let agent_ctx = self.agent_context(ctx, cancel);
        self.record_llm_spend(&ctx.build.tenant_id);
        let (outcome, _span) = self
            .agents
            .invoke(AgentRole::AutoFixer, action_for(AgentRole::AutoFixer), inputs, &agent_ctx)
            .await;
        match outcome {
            AgentOutcome::Success(outputs) => Some((outputs.artifacts, outputs.notes)),
            AgentOutcome::Failure(_) => None,
        }
    }

    async fn replan(
        &self,
        ctx: &mut RunContext,
        request: ReplanRequest,
        cancel: &CancellationToken,
    ) -> Result<StepResolution> {
        if ctx.iteration >= ctx.build.max_iterations {
            return Ok(StepResolution::BuildFailed(format!(
                "replan limit of {} iterations exceeded",
                ctx.build.max_iterations
            )));
        }

        // Architect and designer rerun on the delta goal before the new
        // plan version is compiled.
        let agent_ctx = self.agent_context(ctx, cancel);
        let mut architect_inputs = AgentInputs {
            spec: Some(ctx.spec.clone()),
            ..AgentInputs::default()
        };
        architect_inputs
            .extra
            .insert("delta_goal".into(), Value::String(request.delta_goal.clone()));
        self.record_llm_spend(&ctx.build.tenant_id);
        let (architect_outcome, span) = self
            .agents
            .invoke(
                AgentRole::Architect,
                action_for(AgentRole::Architect),
                architect_inputs,
                &agent_ctx,
            )
            .await;
        ctx.spans.push(span);
        if let AgentOutcome::Success(outputs) = architect_outcome {
            self.index_artifacts(&ctx.build.build_id, &outputs.artifacts);
            ctx.add_artifacts(outputs.artifacts);
        }

        let mut designer_inputs = AgentInputs::default();
        designer_inputs.extra.insert(
            "plan_version".into(),
            Value::from(u64::from(ctx.plan.version) + 1),
        );
        designer_inputs.extra.insert(
            "recommendations".into(),
            Value::Array(
                request
                    .recommendations
                    .iter()
                    .map(|r| Value::String(r.clone()))
                    .collect(),
            ),
        );
        self.record_llm_spend(&ctx.build.tenant_id);
        let (designer_outcome, span) = self
            .agents
            .invoke(
                AgentRole::Designer,
                action_for(AgentRole::Designer),
                designer_inputs,
                &agent_ctx,
            )
            .await;
        ctx.spans.push(span);
        if let AgentOutcome::Success(outputs) = designer_outcome {
            self.index_artifacts(&ctx.build.build_id, &outputs.artifacts);
            ctx.add_artifacts(outputs.artifacts);
        }

        let new_plan = self.compiler.replan(&ctx.spec, &ctx.plan, &request)?;
        self.log(
            ctx,
            &format!("replanned: v{} -> v{}", ctx.plan.version, new_plan.version),
        );

        ctx.plan = new_plan;
        ctx.iteration += 1;
        ctx.build.iteration = ctx.iteration;
        ctx.build.plan_id = ctx.plan.id.clone();
        // Failed steps get a clean slate under the new plan version; their
        // content overrides are stale by definition.
        for task_id in &request.failed_task_ids {
            ctx.content_overrides.remove(task_id);
        }

        // Steps for nodes that survived keep their succeeded status;
        // everything else restarts from pending.
        let node_ids: HashSet<&str> = ctx
            .plan
            .graph
            .nodes
            .iter()
            .map(|n| n.task_id.as_str())
            .collect();
        ctx.build.steps.retain(|s| node_ids.contains(s.name.as_str()));
        for step in ctx.build.steps.iter_mut() {
            if step.status != StepStatus::Succeeded {
                step.status = StepStatus::Pending;
                step.started_at = None;
                step.ended_at = None;
                step.error = None;
            }
        }
        let existing: HashSet<String> =
            ctx.build.steps.iter().map(|s| s.name.clone()).collect();
        let build_id = ctx.build.build_id.clone();
        for node in &ctx.plan.graph.nodes {
            if !existing.contains(&node.task_id) {
                ctx.build.steps.push(Step::new(&build_id, &node.task_id));
            }
        }

        self.registry.update(
            &ctx.build.build_id,
            &ctx.build.tenant_id,
            BuildPatch {
                plan_id: Some(ctx.plan.id.clone()),
                iteration: Some(ctx.iteration),
                steps: Some(ctx.build.steps.clone()),
                retry_state: Some(ctx.retry_state.clone()),
                ..BuildPatch::default()
            },
        )?;
        Ok(StepResolution::Replanned)
    }

    async fn escalate(
        &self,
        ctx: &mut RunContext,
        task_id: &str,
        signal: &FailureSignal,
        decision: &FixDecision,
        cancel: &CancellationToken,
    ) -> Result<String> {
        // Propose a fix for the human to approve; best effort.
        let proposed = self
            .generate_fix(ctx, task_id, signal, cancel)
            .await
            .and_then(|(_, amended)| amended);

        let step_id = ctx
            .build
            .steps
            .iter()
            .find(|s| s.name == task_id)
            .map(|s| s.step_id.clone())
            .unwrap_or_else(|| task_id.to_string());
        let mut gate = ApprovalGate::pending(&ctx.build.build_id, &step_id, "auto_fix_escalation");
        gate.metadata.insert(
            "failure_signal".into(),
            serde_json::to_value(signal).unwrap_or(Value::Null),
        );
        gate.metadata
            .insert("strategy".into(), Value::String(decision.strategy_name.clone()));
        if let Some(content) = &proposed {
            gate.metadata
                .insert("proposed_content".into(), Value::String(content.clone()));
        }
        let gate_id = gate.id.clone();

        self.log(
            ctx,
            &format!("escalated step {}: approval gate {} pending", task_id, gate_id),
        );
        if let Ok(mut gates) = self.gates.lock() {
            gates.insert(
                gate_id.clone(),
                GateEntry {
                    gate,
                    tenant: ctx.build.tenant_id.clone(),
                    proposed_content: proposed,
                    task_id: task_id.to_string(),
                },
            );
        }
        Ok(gate_id)
    }

    // ========================================================================
    // Prelude / postlude stages
    // ========================================================================

    /// The full-build stages ahead of the per-step core, in the order the
    /// stage table declares them: architect, designer, security.
    async fn run_prelude(
        &self,
        ctx: &mut RunContext,
        cancel: &CancellationToken,
    ) -> Result<Option<StepResolution>> {
        let agent_ctx = self.agent_context(ctx, cancel);

        for role in full_build_prelude() {
            match role {
                AgentRole::Architect => {
                    let architect_inputs = AgentInputs {
                        spec: Some(ctx.spec.clone()),
                        ..AgentInputs::default()
                    };
                    self.record_llm_spend(&ctx.build.tenant_id);
                    let (outcome, span) = self
                        .agents
                        .invoke(
                            AgentRole::Architect,
                            action_for(AgentRole::Architect),
                            architect_inputs,
                            &agent_ctx,
                        )
                        .await;
                    ctx.spans.push(span);
                    if let AgentOutcome::Success(outputs) = outcome {
                        self.index_artifacts(&ctx.build.build_id, &outputs.artifacts);
                        ctx.add_artifacts(outputs.artifacts);
                    }
                }
                AgentRole::Designer => {
                    let mut designer_inputs = AgentInputs::default();
                    designer_inputs.extra.insert(
                        "plan_version".into(),
                        Value::from(u64::from(ctx.plan.version)),
                    );
                    self.record_llm_spend(&ctx.build.tenant_id);
                    let (outcome, span) = self
                        .agents
                        .invoke(
                            AgentRole::Designer,
                            action_for(AgentRole::Designer),
                            designer_inputs,
                            &agent_ctx,
                        )
                        .await;
                    ctx.spans.push(span);
                    if let AgentOutcome::Success(outputs) = outcome {
                        self.index_artifacts(&ctx.build.build_id, &outputs.artifacts);
                        ctx.add_artifacts(outputs.artifacts);
                    }
                }
                AgentRole::Security => {
                    if let Some(resolution) = self.security_sweep(ctx, cancel).await? {
                        return Ok(Some(resolution));
                    }
                }
                _ => {}
            }
        }
        Ok(None)
    }

    /// Review every plan node before execution. A failed review routes
    /// through the normal failure machinery attached to a synthetic review
    /// step: a retry re-reviews the same node, a replan restarts the sweep
    /// over the new plan version, anything else resolves the build.
    async fn security_sweep(
        &self,
        ctx: &mut RunContext,
        cancel: &CancellationToken,
    ) -> Result<Option<StepResolution>> {
        let agent_ctx = self.agent_context(ctx, cancel);

        let mut index = 0;
        'nodes: while index < ctx.plan.graph.nodes.len() {
            let node = ctx.plan.graph.nodes[index].clone();
            loop {
                if cancel.is_cancelled() {
                    // The canceling update owns the terminal status;
                    // finalize defers to it.
                    return Ok(None);
                }

                let inputs = AgentInputs {
                    node: Some(node.clone()),
                    ..AgentInputs::default()
                };
                self.record_llm_spend(&ctx.build.tenant_id);
                let (outcome, span) = self
                    .agents
                    .invoke(
                        AgentRole::Security,
                        action_for(AgentRole::Security),
                        inputs,
                        &agent_ctx,
                    )
                    .await;
                ctx.spans.push(span);

                match outcome {
                    AgentOutcome::Success(_) => break,
                    AgentOutcome::Failure(signal) => {
                        let resolution = self
                            .handle_step_failure(
                                ctx,
                                "security_review",
                                &format!(
                                    "security review blocked {}: {}",
                                    node.task_id, signal.message
                                ),
                                Some(signal),
                                cancel,
                            )
                            .await?;
                        match resolution {
                            StepResolution::Retry => {
                                ctx.retry_state.record_attempt("security_review");
                                // Re-review the node that failed.
                                continue;
                            }
                            StepResolution::Replanned => {
                                index = 0;
                                continue 'nodes;
                            }
                            other => return Ok(Some(other)),
                        }
                    }
                }
            }
            index += 1;
        }
        Ok(None)
    }

    /// The full-build stages after every step has succeeded, in stage
    /// table order: devops packaging, then the reviewer close-out.
    async fn run_postlude(
        &self,
        ctx: &mut RunContext,
        cancel: &CancellationToken,
    ) -> Result<Option<StepResolution>> {
        let agent_ctx = self.agent_context(ctx, cancel);

        for role in full_build_postlude() {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            match role {
                AgentRole::Devops => {
                    if let Some(resolution) = self.package_release(ctx, cancel).await? {
                        return Ok(Some(resolution));
                    }
                }
                AgentRole::Reviewer => {
                    let reviewer_inputs = AgentInputs {
                        artifacts: ctx.artifacts.clone(),
                        step_id: Some("release_review".to_string()),
                        ..AgentInputs::default()
                    };
                    self.record_llm_spend(&ctx.build.tenant_id);
                    let (outcome, span) = self
                        .agents
                        .invoke(
                            AgentRole::Reviewer,
                            action_for(AgentRole::Reviewer),
                            reviewer_inputs,
                            &agent_ctx,
                        )
                        .await;
                    ctx.spans.push(span);
                    if let AgentOutcome::Success(outputs) = outcome {
                        self.index_artifacts(&ctx.build.build_id, &outputs.artifacts);
                        ctx.add_artifacts(outputs.artifacts);
                    }
                }
                _ => {}
            }
        }
        Ok(None)
    }

    /// Final devops packaging, re-executed through the normal failure
    /// machinery until it succeeds or resolves terminally. Re-executions
    /// consume the synthetic step's attempt budget, so a persistently
    /// failing packager escalates instead of looping.
    async fn package_release(
        &self,
        ctx: &mut RunContext,
        cancel: &CancellationToken,
    ) -> Result<Option<StepResolution>> {
        let agent_ctx = self.agent_context(ctx, cancel);

        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }

            let devops_inputs = AgentInputs {
                artifacts: ctx.artifacts.clone(),
                step_id: Some("final_package".to_string()),
                ..AgentInputs::default()
            };
            self.record_llm_spend(&ctx.build.tenant_id);
            let (outcome, span) = self
                .agents
                .invoke(
                    AgentRole::Devops,
                    action_for(AgentRole::Devops),
                    devops_inputs,
                    &agent_ctx,
                )
                .await;
            ctx.spans.push(span);

            match outcome {
                AgentOutcome::Success(outputs) => {
                    if let Some(bootable) = outputs.bootable {
                        ctx.build.bootable = Some(bootable);
                        self.registry.update(
                            &ctx.build.build_id,
                            &ctx.build.tenant_id,
                            BuildPatch {
                                bootable: Some(bootable),
                                ..BuildPatch::default()
                            },
                        )?;
                    }
                    self.index_artifacts(&ctx.build.build_id, &outputs.artifacts);
                    ctx.add_artifacts(outputs.artifacts);
                    return Ok(None);
                }
                AgentOutcome::Failure(signal) => {
                    let resolution = self
                        .handle_step_failure(
                            ctx,
                            "final_package",
                            &format!("devops packaging failed: {}", signal.message),
                            Some(signal),
                            cancel,
                        )
                        .await?;
                    match resolution {
                        StepResolution::Retry => {
                            ctx.retry_state.record_attempt("final_package");
                            continue;
                        }
                        StepResolution::Replanned => {
                            return Ok(Some(StepResolution::Replanned));
                        }
                        StepResolution::StepFailed => {
                            return Ok(Some(StepResolution::BuildFailed(
                                "packaging failed after exhausting auto-fix options".to_string(),
                            )));
                        }
                        other => return Ok(Some(other)),
                    }
                }
            }
        }
    }

    // ========================================================================
    // Bookkeeping
    // ========================================================================

    fn ensure_steps(&self, ctx: &mut RunContext) -> Result<()> {
        let build_id = ctx.build.build_id.clone();
        let existing: HashSet<String> =
            ctx.build.steps.iter().map(|s| s.name.clone()).collect();
        for node in &ctx.plan.graph.nodes {
            if !existing.contains(&node.task_id) {
                ctx.build.steps.push(Step::new(&build_id, &node.task_id));
            }
        }
        // Steps found running at (re)entry were orphaned by a previous
        // process; reset them so the scheduler picks them up again.
        for step in ctx.build.steps.iter_mut() {
            if step.status == StepStatus::Running {
                step.status = StepStatus::Pending;
            }
        }
        self.persist_steps(ctx)
    }

    fn mark_step_running(&self, ctx: &mut RunContext, task_id: &str) {
        if let Some(step) = ctx.build.steps.iter_mut().find(|s| s.name == task_id) {
            step.status = StepStatus::Running;
            step.started_at = Some(chrono::Utc::now());
        }
    }

    fn reset_step(&self, ctx: &mut RunContext, task_id: &str) {
        if let Some(step) = ctx.build.steps.iter_mut().find(|s| s.name == task_id) {
            step.status = StepStatus::Pending;
            step.started_at = None;
        }
    }

    fn mark_step_failed(&self, ctx: &mut RunContext, task_id: &str) -> Result<()> {
        let error = ctx
            .failure_signals
            .last()
            .map(|s| s.message.clone())
            .unwrap_or_else(|| "step failed".to_string());
        if let Some(step) = ctx.build.steps.iter_mut().find(|s| s.name == task_id) {
            step.status = StepStatus::Failed;
            step.ended_at = Some(chrono::Utc::now());
            step.error = Some(error);
        }
        self.skip_dependents(ctx, task_id);
        self.persist_steps(ctx)
    }

    /// Transitively skip steps that can no longer run.
    fn skip_dependents(&self, ctx: &mut RunContext, failed_task: &str) {
        let mut dead: HashSet<String> = HashSet::new();
        dead.insert(failed_task.to_string());
        loop {
            let mut grew = false;
            for node in &ctx.plan.graph.nodes {
                if dead.contains(&node.task_id) {
                    continue;
                }
                if node.dependencies.iter().any(|d| dead.contains(d)) {
                    dead.insert(node.task_id.clone());
                    grew = true;
                }
            }
            if !grew {
                break;
            }
        }
        for step in ctx.build.steps.iter_mut() {
            if step.name != failed_task
                && dead.contains(&step.name)
                && step.status == StepStatus::Pending
            {
                step.status = StepStatus::Skipped;
                step.error = Some(format!("blocked by failed step {}", failed_task));
            }
        }
    }

    fn persist_steps(&self, ctx: &RunContext) -> Result<()> {
        self.registry.update(
            &ctx.build.build_id,
            &ctx.build.tenant_id,
            BuildPatch {
                steps: Some(ctx.build.steps.clone()),
                retry_state: Some(ctx.retry_state.clone()),
                ..BuildPatch::default()
            },
        )
    }

    async fn finalize(
        &self,
        ctx: &mut RunContext,
        status: BuildStatus,
        error: Option<String>,
    ) -> Result<BuildOutcome> {
        // A cancellation that raced a success/failure wins: terminal
        // status is write-once and the canceling update may already be in.
        let current = self
            .registry
            .get(&ctx.build.build_id, &ctx.build.tenant_id)
            .map(|b| b.status);
        let status = match current {
            Some(existing) if existing.is_terminal() => existing,
            _ => {
                self.registry.update(
                    &ctx.build.build_id,
                    &ctx.build.tenant_id,
                    BuildPatch {
                        status: Some(status),
                        error: Some(error.clone()),
                        steps: Some(ctx.build.steps.clone()),
                        retry_state: Some(ctx.retry_state.clone()),
                        ..BuildPatch::default()
                    },
                )?;
                status
            }
        };
        ctx.build.status = status;
        ctx.build.error = error;
        self.log(ctx, &format!("build finished: {:?}", status));
        Ok(BuildOutcome::Completed(status))
    }

    async fn resolve_terminal(
        &self,
        ctx: &mut RunContext,
        resolution: StepResolution,
    ) -> Result<BuildOutcome> {
        match resolution {
            StepResolution::BuildFailed(reason) => {
                self.finalize(ctx, BuildStatus::Failed, Some(reason)).await
            }
            StepResolution::Suspended(gate_id) => Ok(BuildOutcome::Suspended { gate_id }),
            StepResolution::StepFailed => {
                self.finalize(
                    ctx,
                    BuildStatus::Failed,
                    Some("pre-flight review failed".to_string()),
                )
                .await
            }
            StepResolution::Retry | StepResolution::Replanned => {
                Err(GirderError::internal())
            }
        }
    }

    fn index_artifacts(&self, build_id: &str, artifacts: &[Artifact]) {
        if artifacts.is_empty() {
            return;
        }
        if let Ok(mut index) = self.artifact_index.lock() {
            index
                .entry(build_id.to_string())
                .or_default()
                .extend(artifacts.iter().cloned());
        }
    }

    pub fn artifacts_for(&self, build_id: &str) -> Vec<Artifact> {
        self.artifact_index
            .lock()
            .map(|index| index.get(build_id).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    fn record_llm_spend(&self, tenant: &TenantId) {
        if let Err(e) = self
            .quotas
            .increment_llm_spend(tenant, self.config.llm_cost_per_invocation)
        {
            tracing::warn!(tenant = %tenant, error = %e, "llm spend not recorded");
        }
    }

    fn log(&self, ctx: &RunContext, line: &str) {
        if let Err(e) = self
            .registry
            .append_log(&ctx.build.build_id, &ctx.build.tenant_id, line)
        {
            tracing::warn!(build = %ctx.build.build_id, error = %e, "log append failed");
        }
    }
}

/// All acceptance criteria declared anywhere in the plan, for whole-plan
/// evaluation.
fn plan_criteria(nodes: &[TaskNode]) -> Vec<String> {
    nodes
        .iter()
        .filter_map(|n| n.acceptance_criteria.clone())
        .collect()
}

/// The stage pipeline for one step, free of `&mut RunContext` so batches
/// can run concurrently. Returns everything the serial merge needs.
#[allow(clippy::too_many_arguments)]
async fn run_stages(
    agents: Arc<AgentSet>,
    locks: Arc<PathLockManager>,
    quotas: Arc<QuotaManager>,
    agent_ctx: AgentContext,
    node: TaskNode,
    override_content: Option<String>,
    context_artifacts: Vec<Artifact>,
    plan_criteria: Vec<String>,
    llm_cost: f64,
) -> StageRun {
    let task_id = node.task_id.clone();
    let mut effective_node = node.clone();
    if let Some(content) = override_content {
        effective_node.content = Some(content);
    }

    let mut step_artifacts: Vec<Artifact> = Vec::new();
    let mut reports: Vec<EvaluationReport> = Vec::new();
    let mut spans = Vec::new();

    // Writers to the same path serialize per tenant across builds.
    let _path_guard = match effective_node.target_path() {
        Some(path) => Some(
            locks
                .write_lock(agent_ctx.tenant_id.key(), path)
                .await,
        ),
        None => None,
    };

    for role in stages_for(node.task_type) {
        if agent_ctx.cancel.is_cancelled() {
            return StageRun {
                task_id,
                artifacts: step_artifacts,
                reports,
                spans,
                failure: Some(("canceled before stage dispatch".to_string(), None)),
            };
        }

        let mut inputs = AgentInputs {
            node: Some(effective_node.clone()),
            step_id: Some(task_id.clone()),
            ..AgentInputs::default()
        };
        inputs.artifacts = match role {
            // Devops packages everything produced so far; other stages see
            // this step's own outputs.
            AgentRole::Devops => {
                let mut all = context_artifacts.clone();
                all.extend(step_artifacts.clone());
                all
            }
            AgentRole::Evaluator if node.task_type == TaskType::RunAcceptance => {
                context_artifacts.clone()
            }
            _ => step_artifacts.clone(),
        };
        if node.task_type == TaskType::RunAcceptance {
            inputs.extra.insert(
                "criteria".into(),
                Value::Array(plan_criteria.iter().map(|c| Value::String(c.clone())).collect()),
            );
        }

        if let Err(e) = quotas.increment_llm_spend(&agent_ctx.tenant_id, llm_cost) {
            tracing::warn!(tenant = %agent_ctx.tenant_id, error = %e, "llm spend not recorded");
        }
        let (outcome, span) = agents.invoke(*role, action_for(*role), inputs, &agent_ctx).await;
        spans.push(span);

        match outcome {
            AgentOutcome::Success(outputs) => {
                step_artifacts.extend(outputs.artifacts);
                if let Some(report) = outputs.report {
                    let passed = report.passed;
                    let reasons: Vec<String> = report
                        .criteria_results
                        .iter()
                        .filter(|c| !c.passed)
                        .map(|c| c.reason.clone())
                        .collect();
                    reports.push(report);
                    if !passed {
                        return StageRun {
                            task_id,
                            artifacts: step_artifacts,
                            reports,
                            spans,
                            failure: Some((
                                format!("evaluation failed: {}", reasons.join("; ")),
                                None,
                            )),
                        };
                    }
                }
            }
            AgentOutcome::Failure(signal) => {
                let logs = json!({
                    "stage": role.as_str(),
                    "message": signal.message,
                    "evidence": signal.evidence,
                })
                .to_string();
                return StageRun {
                    task_id,
                    artifacts: step_artifacts,
                    reports,
                    spans,
                    failure: Some((logs, Some(signal))),
                };
            }
        }
    }

    // Post-stage artifact verification backs the step-success invariant.
    let unverified: Vec<&Artifact> = step_artifacts
        .iter()
        .filter(|a| !verify_artifact(&agent_ctx.workspace, a))
        .collect();
    if step_artifacts.is_empty() || !unverified.is_empty() {
        return StageRun {
            task_id,
            artifacts: step_artifacts.clone(),
            reports,
            spans,
            failure: Some(("artifact verification failed: missing or empty output".to_string(), None)),
        };
    }

    StageRun {
        task_id,
        artifacts: step_artifacts,
        reports,
        spans,
        failure: None,
    }
}
