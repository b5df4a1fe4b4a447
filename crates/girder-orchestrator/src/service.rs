// Tenant-scoped programmatic surface. The HTTP layer (out of scope) maps
// 1:1 onto these operations.

use crate::context::RunContext;
use crate::engine::{BuildOutcome, BuildRunner, OrchestratorConfig};
use girder_agents::AgentSet;
use girder_classify::FailureClassifier;
use girder_plan::PlanCompiler;
use girder_registry::{BuildPatch, BuildRegistry, QuotaManager};
use girder_types::{
    ApprovalGate, Artifact, Build, BuildStatus, FailureSignal, GateStatus, GirderError, Plan,
    Result, Spec, SpecMode, TenantId,
};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex as TokioMutex, Semaphore};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Directory holding the build and quota journals.
    pub data_dir: PathBuf,
    /// Root under which per-build workspace directories are created.
    pub workspace_root: PathBuf,
    /// Global bound on concurrently executing builds.
    pub max_concurrent_builds: usize,
    pub orchestrator: OrchestratorConfig,
}

impl ServiceConfig {
    pub fn at(base: impl Into<PathBuf>) -> Self {
        let base = base.into();
        Self {
            data_dir: base.join("data"),
            workspace_root: base.join("workspaces"),
            max_concurrent_builds: 8,
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

/// `GetBuild` response: the record plus its artifacts and recent logs.
#[derive(Debug, Clone)]
pub struct BuildView {
    pub build: Build,
    pub artifacts: Vec<Artifact>,
    pub logs_tail: Vec<String>,
}

struct SuspendedRun {
    ctx: RunContext,
    cancel: CancellationToken,
}

pub struct GirderService {
    config: ServiceConfig,
    registry: Arc<BuildRegistry>,
    quotas: Arc<QuotaManager>,
    runner: Arc<BuildRunner>,
    compiler: PlanCompiler,
    classifier: FailureClassifier,
    specs: StdMutex<HashMap<(String, String), Spec>>,
    plans: StdMutex<HashMap<(String, String), Plan>>,
    latest_plan: StdMutex<HashMap<(String, String), String>>,
    suspended: Arc<TokioMutex<HashMap<String, SuspendedRun>>>,
    cancel_tokens: Arc<StdMutex<HashMap<String, CancellationToken>>>,
    /// Specs whose preview slot has already been released.
    released_previews: Arc<StdMutex<HashSet<String>>>,
    workers: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl GirderService {
    pub fn open(config: ServiceConfig) -> Result<Arc<Self>> {
        Self::open_with_agents(config, AgentSet::production())
    }

    /// Open with a custom agent set; tests inject scripted stages here.
    pub fn open_with_agents(config: ServiceConfig, agents: AgentSet) -> Result<Arc<Self>> {
        let registry = Arc::new(BuildRegistry::open(config.data_dir.join("builds.jsonl"))?);
        let quotas = Arc::new(QuotaManager::open(config.data_dir.join("quotas.jsonl"))?);
        std::fs::create_dir_all(&config.workspace_root)?;

        let runner = Arc::new(BuildRunner::new(
            Arc::clone(&registry),
            Arc::clone(&quotas),
            Arc::new(agents),
            config.workspace_root.clone(),
            config.orchestrator.clone(),
        ));

        let shutdown = CancellationToken::new();
        let _ticker = quotas.spawn_reset_ticker(shutdown.clone());

        Ok(Arc::new(Self {
            workers: Arc::new(Semaphore::new(config.max_concurrent_builds.max(1))),
            config,
            registry,
            quotas,
            runner,
            compiler: PlanCompiler::new(),
            classifier: FailureClassifier::new(),
            specs: StdMutex::new(HashMap::new()),
            plans: StdMutex::new(HashMap::new()),
            latest_plan: StdMutex::new(HashMap::new()),
            suspended: Arc::new(TokioMutex::new(HashMap::new())),
            cancel_tokens: Arc::new(StdMutex::new(HashMap::new())),
            released_previews: Arc::new(StdMutex::new(HashSet::new())),
            shutdown,
        }))
    }

    pub fn registry(&self) -> &Arc<BuildRegistry> {
        &self.registry
    }

    pub fn quotas(&self) -> &Arc<QuotaManager> {
        &self.quotas
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    // ========================================================================
    // Spec + plan operations
    // ========================================================================

    pub fn create_spec(
        &self,
        tenant: &TenantId,
        title: &str,
        mode: SpecMode,
        description: &str,
        guided_input: Option<Value>,
    ) -> Result<String> {
        if title.trim().is_empty() {
            return Err(GirderError::InvalidInput("spec title is empty".into()));
        }
        if description.trim().is_empty() && guided_input.is_none() {
            return Err(GirderError::InvalidInput(
                "spec needs a description or guided input".into(),
            ));
        }

        // A guided spec allocates a live preview; admission happens before
        // any state mutation.
        if mode == SpecMode::Guided {
            self.quotas.increment_preview(tenant, 1)?;
        }

        let mut spec = Spec::new(tenant.clone(), title.to_string(), mode, description.to_string());
        spec.guided_input = guided_input;
        let spec_id = spec.id.clone();
        if let Ok(mut specs) = self.specs.lock() {
            specs.insert((tenant.key().to_string(), spec_id.clone()), spec);
        }
        Ok(spec_id)
    }

    pub fn generate_plan(&self, tenant: &TenantId, spec_id: &str) -> Result<(String, u32, f64)> {
        let spec = self.spec_for(tenant, spec_id)?;
        let plan = self.compiler.compile(&spec)?;
        let (plan_id, version, risk) = (plan.id.clone(), plan.version, plan.risk_score);
        if let Ok(mut plans) = self.plans.lock() {
            plans.insert((tenant.key().to_string(), plan_id.clone()), plan);
        }
        if let Ok(mut latest) = self.latest_plan.lock() {
            latest.insert((tenant.key().to_string(), spec_id.to_string()), plan_id.clone());
        }
        Ok((plan_id, version, risk))
    }

    // ========================================================================
    // Build operations
    // ========================================================================

    pub async fn start_build(
        self: &Arc<Self>,
        tenant: &TenantId,
        spec_id: &str,
        plan_id: Option<&str>,
        idempotency_key: &str,
        max_iterations: Option<u32>,
    ) -> Result<String> {
        if idempotency_key.trim().is_empty() {
            return Err(GirderError::InvalidInput("idempotency key is empty".into()));
        }
        let spec = self.spec_for(tenant, spec_id)?;
        let plan = match plan_id {
            Some(plan_id) => self.plan_for(tenant, plan_id)?,
            None => {
                let latest = self
                    .latest_plan
                    .lock()
                    .ok()
                    .and_then(|m| m.get(&(tenant.key().to_string(), spec_id.to_string())).cloned())
                    .ok_or_else(|| {
                        GirderError::NotFound(format!("no plan for spec {}", spec_id))
                    })?;
                self.plan_for(tenant, &latest)?
            }
        };

        let build = Build::new(
            tenant.clone(),
            spec_id.to_string(),
            plan.id.clone(),
            idempotency_key.to_string(),
            max_iterations.unwrap_or(self.config.orchestrator.default_max_iterations),
        );
        let fresh_id = build.build_id.clone();
        let build_id = self.registry.register(build.clone())?;
        if build_id != fresh_id {
            // Idempotent duplicate: the prior execution stands alone.
            return Ok(build_id);
        }

        let ctx = RunContext::new(build, spec, plan);
        self.spawn_execution(ctx);
        Ok(build_id)
    }

    pub fn get_build(&self, tenant: &TenantId, build_id: &str) -> Result<BuildView> {
        let build = self
            .registry
            .get(build_id, tenant)
            .ok_or_else(|| GirderError::NotFound(format!("build {}", build_id)))?;
        let artifacts = self.runner.artifacts_for(build_id);
        let logs_tail: Vec<String> = build
            .logs
            .iter()
            .rev()
            .take(20)
            .rev()
            .cloned()
            .collect();
        Ok(BuildView {
            build,
            artifacts,
            logs_tail,
        })
    }

    pub fn list_builds(&self, tenant: &TenantId, limit: usize) -> Vec<Build> {
        self.registry.list(tenant, limit)
    }

    pub async fn cancel(&self, tenant: &TenantId, build_id: &str) -> Result<()> {
        let build = self
            .registry
            .get(build_id, tenant)
            .ok_or_else(|| GirderError::NotFound(format!("build {}", build_id)))?;
        if build.status.is_terminal() {
            return Err(GirderError::Terminal(format!(
                "build {} is already {:?}",
                build_id, build.status
            )));
        }

        self.registry
            .update(build_id, tenant, BuildPatch::status(BuildStatus::Canceled))?;
        if let Some(token) = self
            .cancel_tokens
            .lock()
            .ok()
            .and_then(|m| m.get(build_id).cloned())
        {
            token.cancel();
        }
        // Drop any suspension waiting on a gate for this build.
        let mut suspended = self.suspended.lock().await;
        suspended.retain(|_, run| run.ctx.build.build_id != build_id);
        drop(suspended);

        self.release_preview(&build.spec_id, tenant);
        Ok(())
    }

    pub async fn retry(self: &Arc<Self>, tenant: &TenantId, build_id: &str) -> Result<String> {
        let build = self
            .registry
            .get(build_id, tenant)
            .ok_or_else(|| GirderError::NotFound(format!("build {}", build_id)))?;
        if !build.status.is_terminal() {
            return Err(GirderError::Terminal(format!(
                "build {} is still {:?}",
                build_id, build.status
            )));
        }

        // Terminal statuses are write-once, so a retry is a fresh build
        // record chained off the old idempotency key.
        let retry_key = format!("{}#retry-{}", build.idempotency_key, build.iteration);
        self.start_build(
            tenant,
            &build.spec_id,
            Some(&build.plan_id),
            &retry_key,
            Some(build.max_iterations),
        )
        .await
    }

    // ========================================================================
    // Approval gates
    // ========================================================================

    pub async fn approve(
        self: &Arc<Self>,
        tenant: &TenantId,
        gate_id: &str,
        decided_by: &str,
    ) -> Result<()> {
        let (task_id, proposed) = self.decide_gate(tenant, gate_id, GateStatus::Approved, decided_by)?;

        let run = {
            let mut suspended = self.suspended.lock().await;
            suspended.remove(gate_id)
        };
        if let Some(mut run) = run {
            // Apply the proposed fix and grant the step a fresh budget
            // before resuming.
            if let Some(content) = proposed {
                run.ctx.content_overrides.insert(task_id.clone(), content);
            }
            run.ctx.retry_state.per_step_attempts.remove(&task_id);
            self.resume_execution(run);
        }
        Ok(())
    }

    pub async fn reject(
        self: &Arc<Self>,
        tenant: &TenantId,
        gate_id: &str,
        decided_by: &str,
    ) -> Result<()> {
        let _ = self.decide_gate(tenant, gate_id, GateStatus::Rejected, decided_by)?;

        let run = {
            let mut suspended = self.suspended.lock().await;
            suspended.remove(gate_id)
        };
        if let Some(run) = run {
            let build_id = run.ctx.build.build_id.clone();
            self.registry.update(
                &build_id,
                tenant,
                BuildPatch {
                    status: Some(BuildStatus::Failed),
                    error: Some(Some("approval gate rejected".to_string())),
                    ..BuildPatch::default()
                },
            )?;
            self.release_preview(&run.ctx.spec.id, tenant);
        }
        Ok(())
    }

    pub fn gate_for_build(&self, tenant: &TenantId, build_id: &str) -> Option<ApprovalGate> {
        let gates = self.runner.gates.lock().ok()?;
        gates
            .values()
            .find(|entry| entry.gate.build_id == build_id && entry.tenant.key() == tenant.key())
            .map(|entry| entry.gate.clone())
    }

    fn decide_gate(
        &self,
        tenant: &TenantId,
        gate_id: &str,
        status: GateStatus,
        decided_by: &str,
    ) -> Result<(String, Option<String>)> {
        let mut gates = self
            .runner
            .gates
            .lock()
            .map_err(|_| GirderError::internal())?;
        let entry = gates
            .get_mut(gate_id)
            .filter(|entry| entry.tenant.key() == tenant.key())
            .ok_or_else(|| GirderError::NotFound(format!("gate {}", gate_id)))?;
        if entry.gate.status != GateStatus::Pending {
            return Err(GirderError::Terminal(format!(
                "gate {} is not pending",
                gate_id
            )));
        }
        entry.gate.status = status;
        entry.gate.decided_by = Some(decided_by.to_string());
        entry.gate.decided_at = Some(chrono::Utc::now());
        Ok((entry.task_id.clone(), entry.proposed_content.clone()))
    }

    // ========================================================================
    // Classification passthrough
    // ========================================================================

    pub fn classify_failure(
        &self,
        step_name: &str,
        logs: &str,
        artifacts: &[Artifact],
        prior_signals: &[FailureSignal],
    ) -> FailureSignal {
        self.classifier
            .classify(step_name, logs, artifacts, prior_signals)
    }

    // ========================================================================
    // Execution plumbing
    // ========================================================================

    fn spawn_execution(self: &Arc<Self>, ctx: RunContext) {
        let cancel = CancellationToken::new();
        if let Ok(mut tokens) = self.cancel_tokens.lock() {
            tokens.insert(ctx.build.build_id.clone(), cancel.clone());
        }
        self.spawn_run(ctx, cancel);
    }

    fn resume_execution(self: &Arc<Self>, run: SuspendedRun) {
        self.spawn_run(run.ctx, run.cancel);
    }

    fn spawn_run(self: &Arc<Self>, mut ctx: RunContext, cancel: CancellationToken) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let permit = match service.workers.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let tenant = ctx.build.tenant_id.clone();
            let build_id = ctx.build.build_id.clone();
            let spec_id = ctx.spec.id.clone();

            let outcome = service.runner.run(&mut ctx, cancel.clone()).await;
            drop(permit);

            match outcome {
                Ok(BuildOutcome::Completed(status)) => {
                    if status.is_terminal() {
                        service.release_preview(&spec_id, &tenant);
                        if let Ok(mut tokens) = service.cancel_tokens.lock() {
                            tokens.remove(&build_id);
                        }
                    }
                }
                Ok(BuildOutcome::Suspended { gate_id }) => {
                    let mut suspended = service.suspended.lock().await;
                    suspended.insert(gate_id, SuspendedRun { ctx, cancel });
                }
                Err(e) => {
                    // Journal write failures are fatal to the build and
                    // surfaced on the record itself.
                    tracing::error!(build = %build_id, error = %e, "build run aborted");
                    let _ = service.registry.update(
                        &build_id,
                        &tenant,
                        BuildPatch {
                            status: Some(BuildStatus::Failed),
                            error: Some(Some(format!("orchestrator error: {}", e))),
                            ..BuildPatch::default()
                        },
                    );
                    service.release_preview(&spec_id, &tenant);
                }
            }
        });
    }

    /// Release the preview slot a guided spec acquired, exactly once per
    /// spec, at the first terminal transition of any of its builds.
    // TODO: decide whether a retry of a failed guided build should
    // re-acquire the preview slot instead of running without one.
    fn release_preview(&self, spec_id: &str, tenant: &TenantId) {
        let guided = self
            .specs
            .lock()
            .ok()
            .and_then(|specs| {
                specs
                    .get(&(tenant.key().to_string(), spec_id.to_string()))
                    .map(|s| s.mode == SpecMode::Guided)
            })
            .unwrap_or(false);
        if !guided {
            return;
        }
        let first_release = self
            .released_previews
            .lock()
            .map(|mut set| set.insert(spec_id.to_string()))
            .unwrap_or(false);
        if first_release {
            if let Err(e) = self.quotas.increment_preview(tenant, -1) {
                tracing::warn!(tenant = %tenant, error = %e, "preview release failed");
            }
        }
    }

    /// Poll until the build is terminal or parked behind a pending gate.
    /// Intended for tests and the CLI; the service itself is event-driven.
    pub async fn wait_build_settled(
        &self,
        tenant: &TenantId,
        build_id: &str,
        timeout: std::time::Duration,
    ) -> Result<Build> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(build) = self.registry.get(build_id, tenant) {
                if build.status.is_terminal() {
                    return Ok(build);
                }
                let gated = {
                    let suspended = self.suspended.lock().await;
                    suspended.values().any(|run| run.ctx.build.build_id == build_id)
                };
                if gated {
                    return Ok(build);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(GirderError::DeadlineExceeded(format!(
                    "build {} did not settle",
                    build_id
                )));
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    fn spec_for(&self, tenant: &TenantId, spec_id: &str) -> Result<Spec> {
        self.specs
            .lock()
            .ok()
            .and_then(|specs| specs.get(&(tenant.key().to_string(), spec_id.to_string())).cloned())
            .ok_or_else(|| GirderError::NotFound(format!("spec {}", spec_id)))
    }

    fn plan_for(&self, tenant: &TenantId, plan_id: &str) -> Result<Plan> {
        self.plans
            .lock()
            .ok()
            .and_then(|plans| plans.get(&(tenant.key().to_string(), plan_id.to_string())).cloned())
            .ok_or_else(|| GirderError::NotFound(format!("plan {}", plan_id)))
    }
}

impl Drop for GirderService {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
