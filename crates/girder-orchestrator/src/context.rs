use girder_agents::AgentSpan;
use girder_types::{
    Artifact, AutoFixRun, Build, EvaluationReport, FailureSignal, Plan, RetryState, Spec,
};
use std::collections::HashMap;

/// Per-build state carried in memory for the duration of one execution.
/// Everything here is task-local; the registry is the durable view.
pub struct RunContext {
    pub build: Build,
    pub spec: Spec,
    pub plan: Plan,
    /// Replan counter, mirrored onto the build record.
    pub iteration: u32,
    /// Accumulated immutable outputs, across all steps and plan versions.
    pub artifacts: Vec<Artifact>,
    /// Accumulated evaluation reports.
    pub reports: Vec<EvaluationReport>,
    /// Observability spans for every agent invocation.
    pub spans: Vec<AgentSpan>,
    pub retry_state: RetryState,
    /// Classified failure history, oldest first.
    pub failure_signals: Vec<FailureSignal>,
    /// Auto-fix attempt records, committed to the registry log.
    pub auto_fix_runs: Vec<AutoFixRun>,
    /// Replacement content applied by `patch_applied`, keyed by task id.
    pub content_overrides: HashMap<String, String>,
}

impl RunContext {
    pub fn new(build: Build, spec: Spec, plan: Plan) -> Self {
        let iteration = build.iteration;
        let retry_state = build.retry_state.clone();
        Self {
            build,
            spec,
            plan,
            iteration,
            artifacts: Vec::new(),
            reports: Vec::new(),
            spans: Vec::new(),
            retry_state,
            failure_signals: Vec::new(),
            auto_fix_runs: Vec::new(),
            content_overrides: HashMap::new(),
        }
    }

    pub fn add_artifacts(&mut self, artifacts: impl IntoIterator<Item = Artifact>) {
        self.artifacts.extend(artifacts);
    }

    /// The node content codegen should use: the latest applied patch wins
    /// over the plan's original content.
    pub fn effective_content(&self, task_id: &str) -> Option<&String> {
        self.content_overrides.get(task_id)
    }
}
