use girder_types::TenantId;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Soft per-invocation budget; overruns are logged.
pub const DEFAULT_MODEL_DEADLINE: Duration = Duration::from_secs(30);

/// Hard per-invocation budget; overruns become `transient` failures.
pub const DEFAULT_TOTAL_DEADLINE: Duration = Duration::from_secs(90);

/// Execution context handed to every agent invocation. Cloned per step;
/// agents observe the cancellation token at their suspension points.
#[derive(Clone)]
pub struct AgentContext {
    pub tenant_id: TenantId,
    pub build_id: String,
    /// Per-build workspace directory all artifact paths are relative to.
    pub workspace: PathBuf,
    pub cancel: CancellationToken,
    pub model_deadline: Duration,
    pub total_deadline: Duration,
}

impl AgentContext {
    pub fn new(tenant_id: TenantId, build_id: String, workspace: PathBuf) -> Self {
        Self {
            tenant_id,
            build_id,
            workspace,
            cancel: CancellationToken::new(),
            model_deadline: DEFAULT_MODEL_DEADLINE,
            total_deadline: DEFAULT_TOTAL_DEADLINE,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}
