use crate::tenant::TenantId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};

/// Capacity of the per-build log ring buffer.
pub const LOG_RING_CAPACITY: usize = 100;

// ============================================================================
// Build
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl BuildStatus {
    /// Terminal statuses are write-once.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildStatus::Succeeded | BuildStatus::Failed | BuildStatus::Canceled
        )
    }
}

/// Retry accounting carried by a build across its whole execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryState {
    pub total_attempts: u32,
    pub max_total_attempts: u32,
    #[serde(default)]
    pub per_step_attempts: HashMap<String, u32>,
    pub max_per_step_attempts: u32,
    #[serde(default)]
    pub last_backoff_seconds: f64,
}

impl Default for RetryState {
    fn default() -> Self {
        Self {
            total_attempts: 0,
            max_total_attempts: 6,
            per_step_attempts: HashMap::new(),
            max_per_step_attempts: 3,
            last_backoff_seconds: 0.0,
        }
    }
}

impl RetryState {
    pub fn step_attempts(&self, step_id: &str) -> u32 {
        self.per_step_attempts.get(step_id).copied().unwrap_or(0)
    }

    pub fn record_attempt(&mut self, step_id: &str) {
        self.total_attempts += 1;
        *self
            .per_step_attempts
            .entry(step_id.to_string())
            .or_insert(0) += 1;
    }
}

/// One execution of a plan, owned by a tenant. Two builds with the same
/// `(tenant_id, idempotency_key)` resolve to the same record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub build_id: String,
    pub tenant_id: TenantId,
    pub spec_id: String,
    pub plan_id: String,
    pub idempotency_key: String,
    pub status: BuildStatus,
    /// Replan counter; starts at 1 and increases with every new plan version.
    pub iteration: u32,
    pub max_iterations: u32,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub retry_state: RetryState,
    #[serde(default)]
    pub steps: Vec<Step>,
    /// Ring buffer of the most recent log lines (see [`LOG_RING_CAPACITY`]).
    #[serde(default)]
    pub logs: VecDeque<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set by the devops stage after post-build verification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootable: Option<bool>,
}

impl Build {
    pub fn new(
        tenant_id: TenantId,
        spec_id: String,
        plan_id: String,
        idempotency_key: String,
        max_iterations: u32,
    ) -> Self {
        let now = chrono::Utc::now();
        Self {
            build_id: crate::id::new_build_id(),
            tenant_id,
            spec_id,
            plan_id,
            idempotency_key,
            status: BuildStatus::Queued,
            iteration: 1,
            max_iterations,
            started_at: now,
            updated_at: now,
            created_at: now,
            retry_state: RetryState::default(),
            steps: Vec::new(),
            logs: VecDeque::with_capacity(LOG_RING_CAPACITY),
            error: None,
            bootable: None,
        }
    }

    pub fn push_log(&mut self, line: String) {
        if self.logs.len() == LOG_RING_CAPACITY {
            self.logs.pop_front();
        }
        self.logs.push_back(line);
    }

    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.step_id == step_id)
    }
}

// ============================================================================
// Steps
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Succeeded | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

/// Execution record for one task node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub step_id: String,
    pub build_id: String,
    /// The task id of the node this step executes.
    pub name: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default)]
    pub lines_changed: u64,
    #[serde(default)]
    pub anchor_matched: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Step {
    pub fn new(build_id: &str, name: &str) -> Self {
        Self {
            step_id: crate::id::new_step_id(),
            build_id: build_id.to_string(),
            name: name.to_string(),
            status: StepStatus::Pending,
            started_at: None,
            ended_at: None,
            elapsed_ms: 0,
            artifact_ref: None,
            sha256: None,
            lines_changed: 0,
            anchor_matched: false,
            error: None,
        }
    }
}

// ============================================================================
// Artifacts
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    Code,
    Logs,
    Devops,
    Fix,
    Report,
}

/// An immutable output of a step, addressed by content hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub build_id: String,
    pub step_id: String,
    #[serde(rename = "type")]
    pub artifact_type: ArtifactType,
    pub path: String,
    pub content_hash: String,
    pub bytes_written: u64,
    pub created: chrono::DateTime<chrono::Utc>,
}

// ============================================================================
// Evaluation
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriterionResult {
    pub id: String,
    pub passed: bool,
    pub reason: String,
}

/// Structured judgment of artifacts against acceptance criteria.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub build_id: String,
    pub criteria_results: Vec<CriterionResult>,
    /// Aggregate score in `[0, 100]`; the pass threshold is 80.
    pub overall_score: f64,
    pub passed: bool,
}

impl EvaluationReport {
    pub const PASS_THRESHOLD: f64 = 80.0;

    pub fn from_criteria(build_id: &str, criteria_results: Vec<CriterionResult>) -> Self {
        let total = criteria_results.len();
        let passed_count = criteria_results.iter().filter(|c| c.passed).count();
        let overall_score = if total == 0 {
            100.0
        } else {
            passed_count as f64 / total as f64 * 100.0
        };
        Self {
            build_id: build_id.to_string(),
            criteria_results,
            overall_score,
            passed: overall_score >= Self::PASS_THRESHOLD,
        }
    }
}

// ============================================================================
// Auto-fix + approval gates
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoFixOutcome {
    Retried,
    PatchApplied,
    Replanned,
    Escalated,
    GaveUp,
}

/// One invocation of the auto-fixer, recorded per attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoFixRun {
    pub id: String,
    pub build_id: String,
    pub step_id: String,
    pub signal_type: String,
    pub attempt: u32,
    pub strategy: String,
    pub outcome: AutoFixOutcome,
    #[serde(default)]
    pub backoff_seconds: f64,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    Pending,
    Approved,
    Rejected,
}

/// A pause point requiring a human decision before the build can progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalGate {
    pub id: String,
    pub build_id: String,
    pub step_id: String,
    pub gate_type: String,
    pub status: GateStatus,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<chrono::DateTime<chrono::Utc>>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl ApprovalGate {
    pub fn pending(build_id: &str, step_id: &str, gate_type: &str) -> Self {
        Self {
            id: crate::id::new_gate_id(),
            build_id: build_id.to_string(),
            step_id: step_id.to_string(),
            gate_type: gate_type.to_string(),
            status: GateStatus::Pending,
            metadata: HashMap::new(),
            decided_by: None,
            decided_at: None,
            created_at: chrono::Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_ring_discards_oldest() {
        let mut build = Build::new(
            TenantId::new("acme"),
            "spec_x".into(),
            "plan_x".into(),
            "key".into(),
            3,
        );
        for i in 0..(LOG_RING_CAPACITY + 5) {
            build.push_log(format!("line {}", i));
        }
        assert_eq!(build.logs.len(), LOG_RING_CAPACITY);
        assert_eq!(build.logs.front().map(String::as_str), Some("line 5"));
    }

    #[test]
    fn evaluation_passes_at_eighty() {
        let criteria = vec![
            CriterionResult {
                id: "a".into(),
                passed: true,
                reason: "ok".into(),
            },
            CriterionResult {
                id: "b".into(),
                passed: true,
                reason: "ok".into(),
            },
            CriterionResult {
                id: "c".into(),
                passed: true,
                reason: "ok".into(),
            },
            CriterionResult {
                id: "d".into(),
                passed: true,
                reason: "ok".into(),
            },
            CriterionResult {
                id: "e".into(),
                passed: false,
                reason: "missing".into(),
            },
        ];
        let report = EvaluationReport::from_criteria("bld_1", criteria);
        assert_eq!(report.overall_score, 80.0);
        assert!(report.passed);
    }

    #[test]
    fn retry_state_counts_per_step() {
        let mut rs = RetryState::default();
        rs.record_attempt("s1");
        rs.record_attempt("s1");
        rs.record_attempt("s2");
        assert_eq!(rs.total_attempts, 3);
        assert_eq!(rs.step_attempts("s1"), 2);
        assert_eq!(rs.step_attempts("missing"), 0);
    }
}
