// Tenant quota manager: admission control and usage accounting across
// active previews, snapshot rate, and monthly LLM spend.

use girder_types::{
    GirderError, QuotaAudit, QuotaDecision, QuotaDimension, Result, TenantId, TenantQuota,
    TenantUsage,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

pub const QUOTA_JOURNAL_SCHEMA_VERSION: u32 = 1;

const SNAPSHOT_WINDOW_SECS: i64 = 60;
const LLM_BUDGET_WINDOW_DAYS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum QuotaRecordKind {
    Quota,
    Usage,
    Audit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct QuotaJournalRecord {
    v: u32,
    ts: chrono::DateTime<chrono::Utc>,
    kind: QuotaRecordKind,
    tenant_id: String,
    fields: Value,
}

struct QuotaInner {
    quotas: HashMap<String, TenantQuota>,
    usage: HashMap<String, TenantUsage>,
    audits: Vec<QuotaAudit>,
    journal_path: PathBuf,
    journal: File,
}

impl QuotaInner {
    fn append(&mut self, kind: QuotaRecordKind, tenant_id: &str, fields: Value) -> Result<()> {
        let record = QuotaJournalRecord {
            v: QUOTA_JOURNAL_SCHEMA_VERSION,
            ts: chrono::Utc::now(),
            kind,
            tenant_id: tenant_id.to_string(),
            fields,
        };
        let line = serde_json::to_string(&record)?;
        writeln!(self.journal, "{}", line).map_err(|e| {
            GirderError::Journal(format!("append to {:?}: {}", self.journal_path, e))
        })?;
        Ok(())
    }

    fn usage_mut(&mut self, tenant: &TenantId) -> &mut TenantUsage {
        self.usage
            .entry(tenant.key().to_string())
            .or_insert_with(|| TenantUsage::empty(tenant.clone()))
    }

    fn quota_for(&self, tenant: &TenantId) -> TenantQuota {
        self.quotas
            .get(tenant.key())
            .cloned()
            .unwrap_or_else(|| TenantQuota::defaults_for(tenant.clone()))
    }

    fn persist_usage(&mut self, tenant_key: &str) -> Result<()> {
        if let Some(usage) = self.usage.get(tenant_key) {
            let fields = serde_json::to_value(usage)?;
            self.append(QuotaRecordKind::Usage, tenant_key, fields)?;
        }
        Ok(())
    }
}

/// Per-tenant admission control. The lock is held only for the
/// check-and-increment critical section; persistence rides the same
/// journal pattern as the build registry.
pub struct QuotaManager {
    inner: Mutex<QuotaInner>,
}

impl QuotaManager {
    pub fn open(journal_path: impl AsRef<Path>) -> Result<Self> {
        let journal_path = journal_path.as_ref().to_path_buf();
        if let Some(parent) = journal_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut quotas = HashMap::new();
        let mut usage = HashMap::new();
        let mut audits = Vec::new();
        if journal_path.exists() {
            let reader = BufReader::new(File::open(&journal_path)?);
            for (line_no, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let record: QuotaJournalRecord = match serde_json::from_str(&line) {
                    Ok(record) => record,
                    Err(e) => {
                        tracing::warn!(
                            journal = %journal_path.display(),
                            line = line_no + 1,
                            error = %e,
                            "skipping corrupt quota journal line"
                        );
                        continue;
                    }
                };
                if record.v != QUOTA_JOURNAL_SCHEMA_VERSION {
                    return Err(GirderError::Journal(format!(
                        "unknown quota journal schema version {} at {}:{}",
                        record.v,
                        journal_path.display(),
                        line_no + 1
                    )));
                }
                match record.kind {
                    QuotaRecordKind::Quota => {
                        if let Ok(quota) = serde_json::from_value::<TenantQuota>(record.fields) {
                            quotas.insert(record.tenant_id, quota);
                        }
                    }
                    QuotaRecordKind::Usage => {
                        if let Ok(u) = serde_json::from_value::<TenantUsage>(record.fields) {
                            usage.insert(record.tenant_id, u);
                        }
                    }
                    QuotaRecordKind::Audit => {
                        if let Ok(audit) = serde_json::from_value::<QuotaAudit>(record.fields) {
                            audits.push(audit);
                        }
                    }
                }
            }
        }

        let journal = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&journal_path)?;

        Ok(Self {
            inner: Mutex::new(QuotaInner {
                quotas,
                usage,
                audits,
                journal_path,
                journal,
            }),
        })
    }

    pub fn check_preview_quota(&self, tenant: &TenantId) -> QuotaDecision {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(_) => return QuotaDecision::Allowed,
        };
        let quota = inner.quota_for(tenant);
        let usage = inner.usage_mut(tenant);
        if usage.active_previews >= quota.active_previews_limit {
            QuotaDecision::Denied {
                dimension: QuotaDimension::ActivePreviews,
                current: usage.active_previews as f64,
                limit: quota.active_previews_limit as f64,
                estimated_cost: None,
            }
        } else {
            QuotaDecision::Allowed
        }
    }

    pub fn check_snapshot_quota(&self, tenant: &TenantId) -> QuotaDecision {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(_) => return QuotaDecision::Allowed,
        };
        let quota = inner.quota_for(tenant);
        let usage = inner.usage_mut(tenant);
        if usage.snapshots_this_minute >= quota.snapshot_rate_per_minute {
            QuotaDecision::Denied {
                dimension: QuotaDimension::SnapshotRate,
                current: usage.snapshots_this_minute as f64,
                limit: quota.snapshot_rate_per_minute as f64,
                estimated_cost: None,
            }
        } else {
            QuotaDecision::Allowed
        }
    }

    pub fn check_llm_quota(&self, tenant: &TenantId, estimated_cost: f64) -> QuotaDecision {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(_) => return QuotaDecision::Allowed,
        };
        let quota = inner.quota_for(tenant);
        let usage = inner.usage_mut(tenant);
        if usage.llm_spent_this_month + estimated_cost > quota.llm_monthly_budget_usd {
            QuotaDecision::Denied {
                dimension: QuotaDimension::LlmBudget,
                current: usage.llm_spent_this_month,
                limit: quota.llm_monthly_budget_usd,
                estimated_cost: Some(estimated_cost),
            }
        } else {
            QuotaDecision::Allowed
        }
    }

    /// Acquire one preview slot. Check and increment happen under one lock
    /// hold, so concurrent callers cannot race past the limit.
    pub fn increment_preview(&self, tenant: &TenantId, delta: i64) -> Result<()> {
        let mut inner = self.lock()?;
        let quota = inner.quota_for(tenant);
        let tenant_key = tenant.key().to_string();
        let usage = inner.usage_mut(tenant);
        if delta > 0 {
            let next = usage.active_previews as i64 + delta;
            if next > quota.active_previews_limit as i64 {
                return Err(GirderError::QuotaExceeded {
                    dimension: QuotaDimension::ActivePreviews,
                    current: usage.active_previews as f64,
                    limit: quota.active_previews_limit as f64,
                });
            }
            usage.active_previews = next as u32;
        } else {
            usage.active_previews = usage.active_previews.saturating_sub((-delta) as u32);
        }
        inner.persist_usage(&tenant_key)
    }

    pub fn increment_snapshot(&self, tenant: &TenantId) -> Result<()> {
        let mut inner = self.lock()?;
        let quota = inner.quota_for(tenant);
        let tenant_key = tenant.key().to_string();
        let usage = inner.usage_mut(tenant);
        if usage.snapshots_this_minute >= quota.snapshot_rate_per_minute {
            return Err(GirderError::QuotaExceeded {
                dimension: QuotaDimension::SnapshotRate,
                current: usage.snapshots_this_minute as f64,
                limit: quota.snapshot_rate_per_minute as f64,
            });
        }
        usage.snapshots_this_minute += 1;
        if usage.last_snapshot_reset.is_none() {
            usage.last_snapshot_reset = Some(chrono::Utc::now());
        }
        inner.persist_usage(&tenant_key)
    }

    pub fn increment_llm_spend(&self, tenant: &TenantId, cost: f64) -> Result<()> {
        let mut inner = self.lock()?;
        let quota = inner.quota_for(tenant);
        let tenant_key = tenant.key().to_string();
        let usage = inner.usage_mut(tenant);
        if usage.llm_spent_this_month + cost > quota.llm_monthly_budget_usd {
            return Err(GirderError::QuotaExceeded {
                dimension: QuotaDimension::LlmBudget,
                current: usage.llm_spent_this_month,
                limit: quota.llm_monthly_budget_usd,
            });
        }
        usage.llm_spent_this_month += cost;
        if usage.last_llm_reset.is_none() {
            usage.last_llm_reset = Some(chrono::Utc::now());
        }
        inner.persist_usage(&tenant_key)
    }

    /// Change one quota dimension; the change is journaled and audited.
    pub fn update_quota(
        &self,
        tenant: &TenantId,
        dimension: QuotaDimension,
        new_value: f64,
        changed_by: &str,
    ) -> Result<()> {
        if new_value < 0.0 {
            return Err(GirderError::InvalidInput(format!(
                "quota value must be non-negative, got {}",
                new_value
            )));
        }
        let mut inner = self.lock()?;
        let mut quota = inner.quota_for(tenant);
        let old_value = match dimension {
            QuotaDimension::ActivePreviews => {
                let old = quota.active_previews_limit as f64;
                quota.active_previews_limit = new_value as u32;
                old
            }
            QuotaDimension::SnapshotRate => {
                let old = quota.snapshot_rate_per_minute as f64;
                quota.snapshot_rate_per_minute = new_value as u32;
                old
            }
            QuotaDimension::LlmBudget => {
                let old = quota.llm_monthly_budget_usd;
                quota.llm_monthly_budget_usd = new_value;
                old
            }
        };
        quota.updated_at = chrono::Utc::now();

        let audit = QuotaAudit {
            tenant_id: tenant.clone(),
            dimension,
            old_value,
            new_value,
            changed_by: changed_by.to_string(),
            changed_at: chrono::Utc::now(),
        };

        let tenant_key = tenant.key().to_string();
        let quota_fields = serde_json::to_value(&quota)?;
        let audit_fields = serde_json::to_value(&audit)?;
        inner.append(QuotaRecordKind::Quota, &tenant_key, quota_fields)?;
        inner.append(QuotaRecordKind::Audit, &tenant_key, audit_fields)?;
        inner.quotas.insert(tenant_key, quota);
        inner.audits.push(audit);
        Ok(())
    }

    pub fn audit_log(&self, tenant: &TenantId) -> Vec<QuotaAudit> {
        match self.inner.lock() {
            Ok(inner) => inner
                .audits
                .iter()
                .filter(|a| a.tenant_id.key() == tenant.key())
                .cloned()
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn usage_for(&self, tenant: &TenantId) -> TenantUsage {
        match self.inner.lock() {
            Ok(mut inner) => inner.usage_mut(tenant).clone(),
            Err(_) => TenantUsage::empty(tenant.clone()),
        }
    }

    /// Evaluate reset markers for every tenant. Idempotent; called by the
    /// 1 Hz ticker and safe to call at any time.
    pub fn reset_periodic(&self, now: chrono::DateTime<chrono::Utc>) {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(_) => return,
        };
        let mut touched = Vec::new();
        for (tenant_key, usage) in inner.usage.iter_mut() {
            let snapshot_due = usage
                .last_snapshot_reset
                .map(|last| (now - last).num_seconds() >= SNAPSHOT_WINDOW_SECS)
                .unwrap_or(false);
            if snapshot_due && usage.snapshots_this_minute > 0 {
                usage.snapshots_this_minute = 0;
                usage.last_snapshot_reset = Some(now);
                touched.push(tenant_key.clone());
            }

            let llm_due = usage
                .last_llm_reset
                .map(|last| (now - last).num_days() >= LLM_BUDGET_WINDOW_DAYS)
                .unwrap_or(false);
            if llm_due && usage.llm_spent_this_month > 0.0 {
                usage.llm_spent_this_month = 0.0;
                usage.last_llm_reset = Some(now);
                if !touched.contains(tenant_key) {
                    touched.push(tenant_key.clone());
                }
            }
        }
        for tenant_key in touched {
            if let Err(e) = inner.persist_usage(&tenant_key) {
                tracing::warn!(tenant = %tenant_key, error = %e, "failed to persist quota reset");
            }
        }
    }

    /// Spawn the background reset ticker. Stops when `cancel` fires.
    pub fn spawn_reset_ticker(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => manager.reset_periodic(chrono::Utc::now()),
                }
            }
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, QuotaInner>> {
        self.inner.lock().map_err(|_| GirderError::internal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn manager(dir: &tempfile::TempDir) -> QuotaManager {
        QuotaManager::open(dir.path().join("quotas.jsonl")).unwrap()
    }

    #[test]
    fn preview_quota_denies_at_limit() {
        let dir = tempdir().unwrap();
        let quotas = manager(&dir);
        let tenant = TenantId::new("acme");
        quotas
            .update_quota(&tenant, QuotaDimension::ActivePreviews, 1.0, "test")
            .unwrap();

        quotas.increment_preview(&tenant, 1).unwrap();
        match quotas.check_preview_quota(&tenant) {
            QuotaDecision::Denied { current, limit, .. } => {
                assert_eq!(current, 1.0);
                assert_eq!(limit, 1.0);
            }
            QuotaDecision::Allowed => panic!("expected denial"),
        }
        let err = quotas.increment_preview(&tenant, 1).unwrap_err();
        assert_eq!(err.code(), "rate_limit_exceeded");

        // Releasing the slot re-admits.
        quotas.increment_preview(&tenant, -1).unwrap();
        assert!(quotas.check_preview_quota(&tenant).is_allowed());
    }

    #[test]
    fn llm_quota_denies_as_payment_required() {
        let dir = tempdir().unwrap();
        let quotas = manager(&dir);
        let tenant = TenantId::new("acme");
        quotas
            .update_quota(&tenant, QuotaDimension::LlmBudget, 10.0, "test")
            .unwrap();

        quotas.increment_llm_spend(&tenant, 9.0).unwrap();
        assert!(!quotas.check_llm_quota(&tenant, 2.0).is_allowed());
        let err = quotas.increment_llm_spend(&tenant, 2.0).unwrap_err();
        assert_eq!(err.code(), "payment_required");
    }

    #[test]
    fn snapshot_counter_resets_after_window() {
        let dir = tempdir().unwrap();
        let quotas = manager(&dir);
        let tenant = TenantId::new("acme");

        for _ in 0..3 {
            quotas.increment_snapshot(&tenant).unwrap();
        }
        assert_eq!(quotas.usage_for(&tenant).snapshots_this_minute, 3);

        // Not yet due: nothing changes.
        quotas.reset_periodic(chrono::Utc::now());
        assert_eq!(quotas.usage_for(&tenant).snapshots_this_minute, 3);

        let later = chrono::Utc::now() + chrono::Duration::seconds(SNAPSHOT_WINDOW_SECS + 1);
        quotas.reset_periodic(later);
        assert_eq!(quotas.usage_for(&tenant).snapshots_this_minute, 0);

        // Idempotent: a second pass at the same instant is a no-op.
        quotas.reset_periodic(later);
        assert_eq!(quotas.usage_for(&tenant).snapshots_this_minute, 0);
    }

    #[test]
    fn quota_updates_are_audited_and_survive_restart() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("quotas.jsonl");
        let tenant = TenantId::new("acme");

        {
            let quotas = QuotaManager::open(&path).unwrap();
            quotas
                .update_quota(&tenant, QuotaDimension::ActivePreviews, 2.0, "ops@acme")
                .unwrap();
            quotas.increment_preview(&tenant, 1).unwrap();
        }

        let reopened = QuotaManager::open(&path).unwrap();
        assert_eq!(reopened.usage_for(&tenant).active_previews, 1);
        let audits = reopened.audit_log(&tenant);
        assert_eq!(audits.len(), 1);
        assert_eq!(audits[0].changed_by, "ops@acme");
        assert_eq!(audits[0].new_value, 2.0);
    }
}
