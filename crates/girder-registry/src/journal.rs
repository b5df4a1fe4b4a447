// Append-only JSONL journal backing the build registry.
//
// One JSON record per line; runtime never rewrites existing bytes. Each
// record embeds a full snapshot of the build in `fields`, so replay only
// needs the newest record per (tenant_id, build_id) key.

use girder_types::{GirderError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// Bump when the record shape changes; replay refuses unknown versions.
pub const JOURNAL_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalKind {
    Register,
    Update,
    Log,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JournalKey {
    pub tenant_id: String,
    pub build_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalRecord {
    pub v: u32,
    pub ts: chrono::DateTime<chrono::Utc>,
    pub kind: JournalKind,
    pub key: JournalKey,
    /// Full snapshot of the record after the mutation.
    pub fields: Value,
}

impl JournalRecord {
    pub fn new(kind: JournalKind, tenant_id: &str, build_id: &str, fields: Value) -> Self {
        Self {
            v: JOURNAL_SCHEMA_VERSION,
            ts: chrono::Utc::now(),
            kind,
            key: JournalKey {
                tenant_id: tenant_id.to_string(),
                build_id: build_id.to_string(),
            },
            fields,
        }
    }
}

/// Writer half of the journal. Callers must hold the registry writer lock
/// across the append and the corresponding in-memory mutation.
pub struct Journal {
    path: PathBuf,
    file: File,
}

impl Journal {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record. Failure here is fatal to the guarded mutation.
    pub fn append(&mut self, record: &JournalRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;
        writeln!(self.file, "{}", line)
            .map_err(|e| GirderError::Journal(format!("append to {:?}: {}", self.path, e)))?;
        self.file
            .flush()
            .map_err(|e| GirderError::Journal(format!("flush {:?}: {}", self.path, e)))?;
        Ok(())
    }

    /// Replay the journal at `path`, keeping only the newest record per key.
    ///
    /// A corrupt line is skipped with a warning; a record declaring an
    /// unknown schema version aborts the whole replay.
    pub fn replay(path: impl AsRef<Path>) -> Result<HashMap<JournalKey, JournalRecord>> {
        let path = path.as_ref();
        let mut latest: HashMap<JournalKey, JournalRecord> = HashMap::new();
        if !path.exists() {
            return Ok(latest);
        }

        let reader = BufReader::new(File::open(path)?);
        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: JournalRecord = match serde_json::from_str(&line) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(
                        journal = %path.display(),
                        line = line_no + 1,
                        error = %e,
                        "skipping corrupt journal line"
                    );
                    continue;
                }
            };
            if record.v != JOURNAL_SCHEMA_VERSION {
                return Err(GirderError::Journal(format!(
                    "unknown journal schema version {} at {}:{}",
                    record.v,
                    path.display(),
                    line_no + 1
                )));
            }
            match latest.get(&record.key) {
                Some(existing) if existing.ts > record.ts => {}
                _ => {
                    latest.insert(record.key.clone(), record);
                }
            }
        }
        Ok(latest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn replay_keeps_newest_record_per_key() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("builds.jsonl");
        let mut journal = Journal::open(&path).unwrap();

        journal
            .append(&JournalRecord::new(
                JournalKind::Register,
                "acme",
                "bld_1",
                json!({"status": "queued"}),
            ))
            .unwrap();
        journal
            .append(&JournalRecord::new(
                JournalKind::Update,
                "acme",
                "bld_1",
                json!({"status": "running"}),
            ))
            .unwrap();
        journal
            .append(&JournalRecord::new(
                JournalKind::Register,
                "acme",
                "bld_2",
                json!({"status": "queued"}),
            ))
            .unwrap();

        let latest = Journal::replay(&path).unwrap();
        assert_eq!(latest.len(), 2);
        let key = JournalKey {
            tenant_id: "acme".into(),
            build_id: "bld_1".into(),
        };
        assert_eq!(latest[&key].fields["status"], "running");
    }

    #[test]
    fn replay_skips_corrupt_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("builds.jsonl");
        let mut journal = Journal::open(&path).unwrap();
        journal
            .append(&JournalRecord::new(
                JournalKind::Register,
                "acme",
                "bld_1",
                json!({"status": "queued"}),
            ))
            .unwrap();
        // Simulate a torn write.
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            writeln!(file, "{{\"v\":1,\"truncated").unwrap();
        }

        let latest = Journal::replay(&path).unwrap();
        assert_eq!(latest.len(), 1);
    }

    #[test]
    fn replay_refuses_unknown_schema_version() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("builds.jsonl");
        let mut record = JournalRecord::new(JournalKind::Register, "acme", "bld_1", json!({}));
        record.v = 99;
        std::fs::write(&path, format!("{}\n", serde_json::to_string(&record).unwrap())).unwrap();

        let err = Journal::replay(&path).unwrap_err();
        assert!(matches!(err, GirderError::Journal(_)));
    }

    #[test]
    fn replay_of_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let latest = Journal::replay(dir.path().join("absent.jsonl")).unwrap();
        assert!(latest.is_empty());
    }
}
