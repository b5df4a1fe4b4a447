use crate::tenant::TenantId;
use serde::{Deserialize, Serialize};

/// The three quota dimensions enforced per tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaDimension {
    ActivePreviews,
    SnapshotRate,
    LlmBudget,
}

impl QuotaDimension {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaDimension::ActivePreviews => "active_previews",
            QuotaDimension::SnapshotRate => "snapshot_rate",
            QuotaDimension::LlmBudget => "llm_budget",
        }
    }
}

/// Per-tenant quota configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantQuota {
    pub tenant_id: TenantId,
    pub active_previews_limit: u32,
    pub snapshot_rate_per_minute: u32,
    pub llm_monthly_budget_usd: f64,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl TenantQuota {
    pub fn defaults_for(tenant_id: TenantId) -> Self {
        let now = chrono::Utc::now();
        Self {
            tenant_id,
            active_previews_limit: 5,
            snapshot_rate_per_minute: 10,
            llm_monthly_budget_usd: 100.0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Current usage counters. Snapshot counters reset every 60 s, LLM spend
/// every 30 days; resets are idempotent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantUsage {
    pub tenant_id: TenantId,
    #[serde(default)]
    pub active_previews: u32,
    #[serde(default)]
    pub snapshots_this_minute: u32,
    #[serde(default)]
    pub llm_spent_this_month: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_snapshot_reset: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_llm_reset: Option<chrono::DateTime<chrono::Utc>>,
}

impl TenantUsage {
    pub fn empty(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            active_previews: 0,
            snapshots_this_minute: 0,
            llm_spent_this_month: 0.0,
            last_snapshot_reset: None,
            last_llm_reset: None,
        }
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum QuotaDecision {
    Allowed,
    Denied {
        dimension: QuotaDimension,
        current: f64,
        limit: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        estimated_cost: Option<f64>,
    },
}

impl QuotaDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, QuotaDecision::Allowed)
    }
}

/// Audit row written for every quota change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaAudit {
    pub tenant_id: TenantId,
    pub dimension: QuotaDimension,
    pub old_value: f64,
    pub new_value: f64,
    pub changed_by: String,
    pub changed_at: chrono::DateTime<chrono::Utc>,
}
