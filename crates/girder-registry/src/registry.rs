// Build registry: RAM-authoritative, tenant-isolated, journal-backed.

use crate::journal::{Journal, JournalKind, JournalRecord};
use girder_types::{
    Build, BuildStatus, GirderError, Result, RetryState, Step, TenantId,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

/// Partial update applied by [`BuildRegistry::update`]. Absent fields are
/// left untouched; `updated_at` is stamped on every call.
#[derive(Debug, Default, Clone)]
pub struct BuildPatch {
    pub status: Option<BuildStatus>,
    pub plan_id: Option<String>,
    pub iteration: Option<u32>,
    pub retry_state: Option<RetryState>,
    pub steps: Option<Vec<Step>>,
    pub error: Option<Option<String>>,
    pub bootable: Option<bool>,
}

impl BuildPatch {
    pub fn status(status: BuildStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

struct RegistryInner {
    /// Keyed by (tenant canonical key, build_id).
    builds: HashMap<(String, String), Build>,
    /// Keyed by (tenant canonical key, idempotency_key).
    idempotency: HashMap<(String, String), String>,
    journal: Journal,
}

/// Single source of truth for builds, steps, and logs.
///
/// All mutations go through the writer lock; the journal append happens
/// under the same lock, before the in-memory change, so a post-crash replay
/// is never older than the last acknowledged write. Reads clone a snapshot.
pub struct BuildRegistry {
    inner: RwLock<RegistryInner>,
}

impl BuildRegistry {
    /// Open the registry, replaying any existing journal at `journal_path`.
    pub fn open(journal_path: impl AsRef<Path>) -> Result<Self> {
        let replayed = Journal::replay(&journal_path)?;
        let journal = Journal::open(&journal_path)?;

        let mut builds = HashMap::new();
        let mut idempotency = HashMap::new();
        for (key, record) in replayed {
            let build: Build = match serde_json::from_value(record.fields) {
                Ok(build) => build,
                Err(e) => {
                    tracing::warn!(
                        tenant = %key.tenant_id,
                        build = %key.build_id,
                        error = %e,
                        "dropping unreadable build snapshot during replay"
                    );
                    continue;
                }
            };
            idempotency.insert(
                (key.tenant_id.clone(), build.idempotency_key.clone()),
                build.build_id.clone(),
            );
            builds.insert((key.tenant_id, key.build_id), build);
        }
        tracing::info!(builds = builds.len(), "build registry restored");

        Ok(Self {
            inner: RwLock::new(RegistryInner {
                builds,
                idempotency,
                journal,
            }),
        })
    }

    /// Insert a fresh build in `queued` state. Idempotent: a second call
    /// with the same `(tenant, idempotency_key)` returns the prior build id
    /// without touching the journal.
    pub fn register(&self, build: Build) -> Result<String> {
        let mut inner = self.write_lock()?;
        let tenant_key = build.tenant_id.key().to_string();
        let idem_key = (tenant_key.clone(), build.idempotency_key.clone());

        if let Some(existing) = inner.idempotency.get(&idem_key) {
            return Ok(existing.clone());
        }

        let build_id = build.build_id.clone();
        let record = JournalRecord::new(
            JournalKind::Register,
            &tenant_key,
            &build_id,
            serde_json::to_value(&build)?,
        );
        inner.journal.append(&record)?;

        inner.idempotency.insert(idem_key, build_id.clone());
        inner.builds.insert((tenant_key, build_id.clone()), build);
        Ok(build_id)
    }

    /// Apply a partial update. A tenant mismatch fails with `not_found`,
    /// never `forbidden`. Terminal statuses are write-once.
    pub fn update(&self, build_id: &str, tenant_id: &TenantId, patch: BuildPatch) -> Result<()> {
        let mut inner = self.write_lock()?;
        let key = (tenant_id.key().to_string(), build_id.to_string());
        let current = inner
            .builds
            .get(&key)
            .ok_or_else(|| GirderError::NotFound(format!("build {}", build_id)))?;

        let mut next = current.clone();
        if let Some(status) = patch.status {
            if next.status.is_terminal() && status != next.status {
                return Err(GirderError::Terminal(format!(
                    "build {} is already {:?}",
                    build_id, next.status
                )));
            }
            next.status = status;
        }
        if let Some(plan_id) = patch.plan_id {
            next.plan_id = plan_id;
        }
        if let Some(iteration) = patch.iteration {
            next.iteration = iteration;
        }
        if let Some(retry_state) = patch.retry_state {
            next.retry_state = retry_state;
        }
        if let Some(steps) = patch.steps {
            next.steps = steps;
        }
        if let Some(error) = patch.error {
            next.error = error;
        }
        if let Some(bootable) = patch.bootable {
            next.bootable = Some(bootable);
        }
        next.updated_at = chrono::Utc::now();

        let record = JournalRecord::new(
            JournalKind::Update,
            &key.0,
            build_id,
            serde_json::to_value(&next)?,
        );
        inner.journal.append(&record)?;
        inner.builds.insert(key, next);
        Ok(())
    }

    /// Append a line to the build's bounded log ring.
    pub fn append_log(&self, build_id: &str, tenant_id: &TenantId, line: &str) -> Result<()> {
        let mut inner = self.write_lock()?;
        let key = (tenant_id.key().to_string(), build_id.to_string());
        let current = inner
            .builds
            .get(&key)
            .ok_or_else(|| GirderError::NotFound(format!("build {}", build_id)))?;

        let mut next = current.clone();
        let stamped = format!("[{}] {}", chrono::Utc::now().format("%H:%M:%S"), line);
        next.push_log(stamped);
        next.updated_at = chrono::Utc::now();

        let record = JournalRecord::new(
            JournalKind::Log,
            &key.0,
            build_id,
            serde_json::to_value(&next)?,
        );
        inner.journal.append(&record)?;
        inner.builds.insert(key, next);
        Ok(())
    }

    /// Tenant-scoped read; `None` on tenant mismatch.
    pub fn get(&self, build_id: &str, tenant_id: &TenantId) -> Option<Build> {
        let inner = self.inner.read().ok()?;
        inner
            .builds
            .get(&(tenant_id.key().to_string(), build_id.to_string()))
            .cloned()
    }

    /// Newest-first listing for one tenant, `limit` clamped to `[1, 100]`.
    pub fn list(&self, tenant_id: &TenantId, limit: usize) -> Vec<Build> {
        let limit = limit.clamp(1, 100);
        let inner = match self.inner.read() {
            Ok(inner) => inner,
            Err(_) => return Vec::new(),
        };
        let mut builds: Vec<Build> = inner
            .builds
            .iter()
            .filter(|((tenant, _), _)| tenant == tenant_id.key())
            .map(|(_, build)| build.clone())
            .collect();
        builds.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        builds.truncate(limit);
        builds
    }

    fn write_lock(&self) -> Result<std::sync::RwLockWriteGuard<'_, RegistryInner>> {
        self.inner.write().map_err(|_| GirderError::internal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn build_for(tenant: &str, idem: &str) -> Build {
        Build::new(
            TenantId::new(tenant),
            "spec_1".into(),
            "plan_1".into(),
            idem.into(),
            3,
        )
    }

    #[test]
    fn register_is_idempotent_on_tenant_and_key() {
        let dir = tempdir().unwrap();
        let registry = BuildRegistry::open(dir.path().join("builds.jsonl")).unwrap();

        let first = registry.register(build_for("acme", "k1")).unwrap();
        let second = registry.register(build_for("acme", "k1")).unwrap();
        assert_eq!(first, second);

        // Same key under a different tenant is a different build.
        let other = registry.register(build_for("globex", "k1")).unwrap();
        assert_ne!(first, other);
    }

    #[test]
    fn update_with_wrong_tenant_is_not_found() {
        let dir = tempdir().unwrap();
        let registry = BuildRegistry::open(dir.path().join("builds.jsonl")).unwrap();
        let build_id = registry.register(build_for("acme", "k1")).unwrap();

        let err = registry
            .update(
                &build_id,
                &TenantId::new("globex"),
                BuildPatch::status(BuildStatus::Running),
            )
            .unwrap_err();
        assert!(matches!(err, GirderError::NotFound(_)));
    }

    #[test]
    fn terminal_status_is_write_once() {
        let dir = tempdir().unwrap();
        let registry = BuildRegistry::open(dir.path().join("builds.jsonl")).unwrap();
        let tenant = TenantId::new("acme");
        let build_id = registry.register(build_for("acme", "k1")).unwrap();

        registry
            .update(&build_id, &tenant, BuildPatch::status(BuildStatus::Failed))
            .unwrap();
        let err = registry
            .update(
                &build_id,
                &tenant,
                BuildPatch::status(BuildStatus::Succeeded),
            )
            .unwrap_err();
        assert!(matches!(err, GirderError::Terminal(_)));

        // Re-applying the same terminal status is a safe no-op mutation.
        registry
            .update(&build_id, &tenant, BuildPatch::status(BuildStatus::Failed))
            .unwrap();
    }

    #[test]
    fn get_is_tenant_scoped() {
        let dir = tempdir().unwrap();
        let registry = BuildRegistry::open(dir.path().join("builds.jsonl")).unwrap();
        let build_id = registry.register(build_for("acme", "k1")).unwrap();

        assert!(registry.get(&build_id, &TenantId::new("acme")).is_some());
        assert!(registry.get(&build_id, &TenantId::new("globex")).is_none());
    }

    #[test]
    fn list_is_newest_first_and_clamped() {
        let dir = tempdir().unwrap();
        let registry = BuildRegistry::open(dir.path().join("builds.jsonl")).unwrap();
        let tenant = TenantId::new("acme");

        let mut ids = Vec::new();
        for i in 0..5 {
            let mut build = build_for("acme", &format!("k{}", i));
            build.created_at = chrono::Utc::now() + chrono::Duration::seconds(i);
            ids.push(registry.register(build).unwrap());
        }

        let listed = registry.list(&tenant, 0); // clamps to 1
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].build_id, ids[4]);

        let listed = registry.list(&tenant, 3);
        assert_eq!(listed.len(), 3);
        assert_eq!(listed[0].build_id, ids[4]);
        assert_eq!(listed[2].build_id, ids[2]);
    }

    #[test]
    fn replay_reconstructs_pre_crash_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("builds.jsonl");
        let tenant = TenantId::new("acme");

        let build_id = {
            let registry = BuildRegistry::open(&path).unwrap();
            let build_id = registry.register(build_for("acme", "k1")).unwrap();
            registry
                .update(&build_id, &tenant, BuildPatch::status(BuildStatus::Running))
                .unwrap();
            registry.append_log(&build_id, &tenant, "step 1 started").unwrap();
            build_id
            // registry dropped here: simulated crash
        };

        let reopened = BuildRegistry::open(&path).unwrap();
        let build = reopened.get(&build_id, &tenant).unwrap();
        assert_eq!(build.status, BuildStatus::Running);
        assert_eq!(build.logs.len(), 1);
        assert!(build.logs[0].contains("step 1 started"));

        // Idempotency survives the crash too.
        let again = reopened.register(build_for("acme", "k1")).unwrap();
        assert_eq!(again, build_id);
    }
}
