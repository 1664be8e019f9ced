use crate::error::{ConfigError, Result};
use crate::model::{BackupExecutionLog, ProgressLogEntry};
use chrono::Utc;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

/// Hybrid store for per-backup execution logs: active entries live in
/// memory keyed by backup id (or job id until a snapshot materializes) and
/// are appended to a newline-delimited JSON file on persist.
pub struct LogStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, BackupExecutionLog>>,
}

impl LogStore {
    /// Opens the store and loads every previously persisted record.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut entries = HashMap::new();

        match std::fs::read_to_string(&path) {
            Ok(content) => {
                for line in content.lines() {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<BackupExecutionLog>(line) {
                        // Last record per key wins; re-persists overwrite.
                        Ok(log) => {
                            entries.insert(log.backup_id.clone(), log);
                        }
                        Err(e) => warn!("Skipping malformed backup log record: {}", e),
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(
                    ConfigError::LoadFailed(format!("{}: {}", path.display(), e)).into(),
                )
            }
        }

        debug!(
            path = %path.display(),
            loaded = entries.len(),
            "Loaded persisted backup logs"
        );

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub async fn get_or_create(&self, backup_id: &str, job_id: Uuid) -> BackupExecutionLog {
        let mut entries = self.entries.lock().await;
        entries
            .entry(backup_id.to_string())
            .or_insert_with(|| {
                let now = Utc::now();
                BackupExecutionLog {
                    backup_id: backup_id.to_string(),
                    job_id,
                    created_at: now,
                    updated_at: now,
                    warnings: Vec::new(),
                    errors: Vec::new(),
                    progress: Vec::new(),
                }
            })
            .clone()
    }

    pub async fn get(&self, backup_id: &str) -> Option<BackupExecutionLog> {
        self.entries.lock().await.get(backup_id).cloned()
    }

    pub async fn add_warning(&self, backup_id: &str, message: &str) {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(backup_id) {
            Some(log) => {
                log.warnings.push(message.to_string());
                log.updated_at = Utc::now();
            }
            None => warn!(backup_id = backup_id, "Warning for unknown backup log dropped"),
        }
    }

    pub async fn add_error(&self, backup_id: &str, message: &str) {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(backup_id) {
            Some(log) => {
                log.errors.push(message.to_string());
                log.updated_at = Utc::now();
            }
            None => warn!(backup_id = backup_id, "Error for unknown backup log dropped"),
        }
    }

    pub async fn add_progress_entry(&self, backup_id: &str, entry: ProgressLogEntry) {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(backup_id) {
            Some(log) => {
                log.progress.push(entry);
                log.updated_at = Utc::now();
            }
            None => warn!(backup_id = backup_id, "Progress for unknown backup log dropped"),
        }
    }

    /// Re-keys an entry from the job id to the engine-reported snapshot id.
    pub async fn assign_backup_id(&self, old_key: &str, backup_id: &str) {
        let mut entries = self.entries.lock().await;
        if let Some(mut log) = entries.remove(old_key) {
            log.backup_id = backup_id.to_string();
            log.updated_at = Utc::now();
            entries.insert(backup_id.to_string(), log);
        }
    }

    /// Appends the entry as one JSON line. Persistence failures are the
    /// caller's to log; they never change a job's outward status.
    pub async fn persist(&self, backup_id: &str) -> Result<()> {
        let entry = {
            let entries = self.entries.lock().await;
            entries.get(backup_id).cloned()
        };

        let Some(entry) = entry else {
            warn!(backup_id = backup_id, "Nothing to persist for unknown backup log");
            return Ok(());
        };

        let line = serde_json::to_string(&entry)
            .map_err(|e| ConfigError::ParseFailed(e.to_string()))?;

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| ConfigError::LoadFailed(format!("{}: {}", self.path.display(), e)))?;
        writeln!(file, "{}", line)
            .map_err(|e| ConfigError::LoadFailed(format!("{}: {}", self.path.display(), e)))?;

        debug!(backup_id = backup_id, "Backup log persisted");
        Ok(())
    }

    /// Drops every in-memory entry; test support only.
    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn progress_entry(percent: f64) -> ProgressLogEntry {
        ProgressLogEntry {
            timestamp: Utc::now(),
            message: format!("{:.0}% done", percent),
            percent_done: percent,
            current_file: None,
            files_done: 10,
            bytes_done: 1024,
        }
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = LogStore::open(dir.path().join("logs.ndjson")).expect("Failed to open");

        let job_id = Uuid::new_v4();
        let first = store.get_or_create("key1", job_id).await;
        let second = store.get_or_create("key1", Uuid::new_v4()).await;

        // The second call returns the existing entry, original job id intact.
        assert_eq!(second.job_id, job_id);
        assert_eq!(first.created_at, second.created_at);
    }

    #[tokio::test]
    async fn test_mutations_update_timestamp() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = LogStore::open(dir.path().join("logs.ndjson")).expect("Failed to open");

        let created = store.get_or_create("key1", Uuid::new_v4()).await;
        store.add_warning("key1", "slow share").await;
        store.add_error("key1", "read failed").await;
        store.add_progress_entry("key1", progress_entry(50.0)).await;

        let log = store.get("key1").await.expect("Entry should exist");
        assert_eq!(log.warnings, vec!["slow share".to_string()]);
        assert_eq!(log.errors, vec!["read failed".to_string()]);
        assert_eq!(log.progress.len(), 1);
        assert!(log.updated_at >= created.updated_at);
    }

    #[tokio::test]
    async fn test_assign_backup_id_rekeys() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = LogStore::open(dir.path().join("logs.ndjson")).expect("Failed to open");

        let job_id = Uuid::new_v4();
        store.get_or_create(&job_id.to_string(), job_id).await;
        store.add_warning(&job_id.to_string(), "w1").await;

        store.assign_backup_id(&job_id.to_string(), "snap42").await;

        assert!(store.get(&job_id.to_string()).await.is_none());
        let log = store.get("snap42").await.expect("Rekeyed entry should exist");
        assert_eq!(log.backup_id, "snap42");
        assert_eq!(log.warnings, vec!["w1".to_string()]);
    }

    #[tokio::test]
    async fn test_clear_drops_in_memory_entries() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = LogStore::open(dir.path().join("logs.ndjson")).expect("Failed to open");

        store.get_or_create("key1", Uuid::new_v4()).await;
        store.clear().await;
        assert!(store.get("key1").await.is_none());
    }

    #[tokio::test]
    async fn test_persist_and_reload() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("logs.ndjson");

        let job_id = Uuid::new_v4();
        {
            let store = LogStore::open(&path).expect("Failed to open");
            store.get_or_create("snap1", job_id).await;
            store.add_progress_entry("snap1", progress_entry(100.0)).await;
            store.persist("snap1").await.expect("Failed to persist");

            store.get_or_create("snap2", Uuid::new_v4()).await;
            store.persist("snap2").await.expect("Failed to persist");
        }

        let reloaded = LogStore::open(&path).expect("Failed to reopen");
        let log = reloaded.get("snap1").await.expect("snap1 should be loaded");
        assert_eq!(log.job_id, job_id);
        assert_eq!(log.progress.len(), 1);
        assert!(reloaded.get("snap2").await.is_some());
    }

    #[tokio::test]
    async fn test_reload_last_record_wins() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("logs.ndjson");

        {
            let store = LogStore::open(&path).expect("Failed to open");
            store.get_or_create("snap1", Uuid::new_v4()).await;
            store.persist("snap1").await.expect("Failed to persist");
            store.add_warning("snap1", "late warning").await;
            store.persist("snap1").await.expect("Failed to persist");
        }

        let reloaded = LogStore::open(&path).expect("Failed to reopen");
        let log = reloaded.get("snap1").await.expect("snap1 should be loaded");
        assert_eq!(log.warnings, vec!["late warning".to_string()]);
    }
}
