use crate::config::{Catalog, LocalConfig};
use crate::credentials::CredentialStore;
use crate::db;
use crate::engine::events::StatusEvent;
use crate::engine::{BackupObserver, BackupRequest, EngineClient};
use crate::error::{AppError, BackupError, CredentialError, Result, StorageError};
use crate::jobs::{JobRegistry, CANCELLED_MESSAGE};
use crate::logstore::LogStore;
use crate::model::{
    Backup, BackupJob, Device, IncludeExcludeRules, JobProgress, JobStatus, JobType,
    ProgressLogEntry, Share, ThresholdLevel,
};
use crate::protocol::ProtocolRegistry;
use crate::storage::StorageMonitor;
use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Executes one backup job end-to-end: wake, mount, capacity gate,
/// repository init, streaming engine run, log capture, unmount, and a
/// single deterministic finalization on every exit path.
pub struct Orchestrator {
    catalog: Arc<Catalog>,
    registry: Arc<JobRegistry>,
    engine: Arc<EngineClient>,
    protocols: Arc<ProtocolRegistry>,
    storage: Arc<StorageMonitor>,
    logs: Arc<LogStore>,
    credentials: Arc<CredentialStore>,
    repository_base: PathBuf,
    wake_wait: Duration,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        catalog: Arc<Catalog>,
        registry: Arc<JobRegistry>,
        engine: Arc<EngineClient>,
        protocols: Arc<ProtocolRegistry>,
        storage: Arc<StorageMonitor>,
        logs: Arc<LogStore>,
        credentials: Arc<CredentialStore>,
        config: &LocalConfig,
    ) -> Self {
        Self {
            catalog,
            registry,
            engine,
            protocols,
            storage,
            logs,
            credentials,
            repository_base: config.engine.repository_base_path.clone(),
            wake_wait: Duration::from_secs(config.wake.wait_seconds),
        }
    }

    /// Backs up every enabled share of a device sequentially. Per-share
    /// failures degrade the final status instead of aborting the loop.
    pub async fn execute_device_backup(
        &self,
        device_id: Uuid,
        job_type: JobType,
    ) -> Result<BackupJob> {
        let device = self
            .catalog
            .get_device(device_id)?
            .ok_or(BackupError::DeviceNotFound(device_id))?;
        let shares = self.catalog.enabled_shares(&device)?;
        if shares.is_empty() {
            return Err(BackupError::NoEnabledShares(device.name.clone()).into());
        }

        let job = BackupJob::new(device_id, None, job_type);
        let cancel = CancellationToken::new();
        self.registry.track(job.clone(), cancel.clone()).await?;

        info!(
            job_id = %job.id,
            device = %device.name,
            shares = shares.len(),
            job_type = %job_type,
            "Starting device backup"
        );

        let total = shares.len();
        let mut last_snapshot: Option<String> = None;
        let mut succeeded = 0usize;
        let mut failures: Vec<String> = Vec::new();
        let mut cancelled = false;

        for share in &shares {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            match self.run_share(&job, &device, share, &cancel).await {
                Ok(backup) => {
                    succeeded += 1;
                    last_snapshot = Some(backup.id);
                }
                Err(e) if e.is_cancelled() || cancel.is_cancelled() => {
                    cancelled = true;
                    break;
                }
                Err(e) => {
                    error!(
                        job_id = %job.id,
                        share = %share.name,
                        "Share backup failed: {}",
                        e
                    );
                    failures.push(format!("Share '{}' failed: {}", share.name, e));
                }
            }
        }

        let (status, message) = if cancelled {
            (JobStatus::Cancelled, Some(CANCELLED_MESSAGE.to_string()))
        } else if failures.is_empty() {
            (JobStatus::Completed, None)
        } else if succeeded == 0 {
            (JobStatus::Failed, Some(failures.join("\n")))
        } else {
            let mut lines = failures;
            lines.push(format!(
                "Partially completed: {}/{} shares backed up",
                succeeded, total
            ));
            (JobStatus::PartiallyCompleted, Some(lines.join("\n")))
        };

        let finalized = self
            .registry
            .untrack(job.id, status, message, last_snapshot)
            .await?
            .ok_or(BackupError::JobNotFound(job.id))?;

        info!(job_id = %finalized.id, status = %finalized.status, "Device backup finished");
        Ok(finalized)
    }

    /// Backs up a single share. Validation failures surface before the job
    /// is tracked; afterwards every exit path finalizes exactly once.
    pub async fn execute_share_backup(
        &self,
        device_id: Uuid,
        share_id: Uuid,
        job_type: JobType,
    ) -> Result<BackupJob> {
        let device = self
            .catalog
            .get_device(device_id)?
            .ok_or(BackupError::DeviceNotFound(device_id))?;
        let (_, share) = self
            .catalog
            .get_share(share_id)?
            .ok_or(BackupError::ShareNotFound(share_id))?;
        if share.device_id != device_id {
            return Err(BackupError::ShareMismatch {
                share_id,
                device_id,
            }
            .into());
        }
        if !share.enabled {
            return Err(BackupError::ShareDisabled(share.name.clone()).into());
        }

        let job = BackupJob::new(device_id, Some(share_id), job_type);
        let cancel = CancellationToken::new();
        self.registry.track(job.clone(), cancel.clone()).await?;

        info!(
            job_id = %job.id,
            device = %device.name,
            share = %share.name,
            job_type = %job_type,
            "Starting share backup"
        );

        let result = self.run_share(&job, &device, &share, &cancel).await;

        let (status, message, snapshot) = match result {
            Ok(backup) => (JobStatus::Completed, None, Some(backup.id)),
            Err(e) if e.is_cancelled() || cancel.is_cancelled() => {
                (JobStatus::Cancelled, Some(CANCELLED_MESSAGE.to_string()), None)
            }
            Err(e) => (JobStatus::Failed, Some(failure_message(&e)), None),
        };

        let finalized = self
            .registry
            .untrack(job.id, status, message, snapshot)
            .await?
            .ok_or(BackupError::JobNotFound(job.id))?;

        info!(job_id = %finalized.id, status = %finalized.status, "Share backup finished");
        Ok(finalized)
    }

    /// Re-dispatches a failed job against the same target.
    pub async fn retry_failed_job(&self, job_id: Uuid) -> Result<BackupJob> {
        let prior = match self.registry.get(job_id).await {
            Some(job) => job,
            None => db::get_job(self.registry.pool(), job_id)
                .await?
                .ok_or(BackupError::JobNotFound(job_id))?,
        };

        if prior.status != JobStatus::Failed {
            return Err(BackupError::JobNotRetryable {
                job_id,
                status: prior.status.to_string(),
            }
            .into());
        }

        info!(prior_job_id = %job_id, "Retrying failed job");
        match prior.share_id {
            Some(share_id) => {
                self.execute_share_backup(prior.device_id, share_id, JobType::Retry)
                    .await
            }
            None => {
                self.execute_device_backup(prior.device_id, JobType::Retry)
                    .await
            }
        }
    }

    /// The per-share execution sequence. The mount is always released, and
    /// the execution log always persisted, whatever the outcome.
    async fn run_share(
        &self,
        job: &BackupJob,
        device: &Device,
        share: &Share,
        cancel: &CancellationToken,
    ) -> Result<Backup> {
        let log_key = job.id.to_string();
        self.logs.get_or_create(&log_key, job.id).await;

        let result = self
            .run_share_inner(job, device, share, &log_key, cancel)
            .await;

        match result {
            Ok(backup) => {
                let entry = ProgressLogEntry {
                    timestamp: Utc::now(),
                    message: "Backup completed".to_string(),
                    percent_done: 100.0,
                    current_file: None,
                    files_done: backup.files_new
                        + backup.files_changed
                        + backup.files_unmodified,
                    bytes_done: backup.bytes_processed,
                };
                self.logs.add_progress_entry(&log_key, entry).await;
                self.logs.assign_backup_id(&log_key, &backup.id).await;
                if let Err(e) = self.logs.persist(&backup.id).await {
                    warn!(backup_id = %backup.id, "Failed to persist backup log: {}", e);
                }
                Ok(backup)
            }
            Err(e) => {
                self.logs.add_error(&log_key, &e.to_string()).await;
                let persist_key = job.backup_id.clone().unwrap_or_else(|| log_key.clone());
                if persist_key != log_key {
                    self.logs.assign_backup_id(&log_key, &persist_key).await;
                }
                if let Err(persist_err) = self.logs.persist(&persist_key).await {
                    warn!(job_id = %job.id, "Failed to persist backup log: {}", persist_err);
                }
                Err(e)
            }
        }
    }

    /// Wake, mount, the mounted sequence, and the unconditional unmount.
    async fn run_share_inner(
        &self,
        job: &BackupJob,
        device: &Device,
        share: &Share,
        log_key: &str,
        cancel: &CancellationToken,
    ) -> Result<Backup> {
        ensure_not_cancelled(cancel)?;
        let driver = self.protocols.get(device.protocol)?;

        if device.wake_on_lan && device.wake_mac.is_some() && driver.supports_wol() {
            // Wake failures are logged and the backup still attempted; the
            // device may already be awake.
            if let Err(e) = driver.wake(device).await {
                warn!(device = %device.name, "Wake-on-LAN failed: {}", e);
            }
            tokio::select! {
                _ = tokio::time::sleep(self.wake_wait) => {}
                _ = cancel.cancelled() => return Err(BackupError::Cancelled.into()),
            }
        }

        ensure_not_cancelled(cancel)?;
        let device_password = self.credentials.decrypt(&device.password)?;
        let mount_path = driver.mount(device, share, &device_password).await?;

        let result = self
            .run_mounted(job, device, share, &mount_path, log_key, cancel)
            .await;

        // Unmount failure downgrades to a warning; the job outcome stands.
        if let Err(e) = driver.unmount(&mount_path).await {
            warn!(
                share = %share.name,
                mount = %mount_path.display(),
                "Unmount failed: {}",
                e
            );
        }

        result
    }

    async fn run_mounted(
        &self,
        job: &BackupJob,
        device: &Device,
        share: &Share,
        mount_path: &std::path::Path,
        log_key: &str,
        cancel: &CancellationToken,
    ) -> Result<Backup> {
        ensure_not_cancelled(cancel)?;

        let rules =
            IncludeExcludeRules::effective(share.rules.as_ref(), device.rules.as_ref());
        let repo_path = self
            .repository_base
            .join(device.id.to_string())
            .join(share.id.to_string());

        let status = self.storage.status_for(&repo_path)?;
        match status.level {
            ThresholdLevel::Exhausted => {
                return Err(StorageError::Exhausted(status.message).into());
            }
            ThresholdLevel::Critical => {
                warn!(repo = %repo_path.display(), "{}", status.message);
                self.logs.add_warning(log_key, &status.message).await;
            }
            _ => {}
        }

        ensure_not_cancelled(cancel)?;
        let repo_password = self.resolve_repository_password(device, share).await?;

        if !self
            .engine
            .repository_exists(&repo_path, &repo_password)
            .await?
        {
            debug!(repo = %repo_path.display(), "Initializing new repository");
            self.engine.init(&repo_path, &repo_password).await?;
        }

        let request = BackupRequest {
            repo_path: &repo_path,
            password: &repo_password,
            device,
            share,
            mount_path,
            rules: &rules,
            job_id: job.id,
        };

        self.registry
            .set_command_line(job.id, self.engine.backup_command_line(&request))
            .await?;

        ensure_not_cancelled(cancel)?;
        let observer = RunObserver {
            registry: self.registry.clone(),
            logs: self.logs.clone(),
            job_id: job.id,
            device_id: device.id,
            share_id: share.id,
            log_key: log_key.to_string(),
        };

        self.engine.create_backup(&request, &observer, cancel).await
    }

    /// Repository password for a share: the share's own when set, otherwise
    /// a PBKDF2 key derived from the device password and a per-share salt
    /// that is created and persisted on first use.
    async fn resolve_repository_password(
        &self,
        device: &Device,
        share: &Share,
    ) -> Result<String> {
        if let Some(encrypted) = &share.repository_password {
            if !encrypted.is_empty() {
                return self.credentials.decrypt(encrypted);
            }
        }

        let device_password = self.credentials.decrypt(&device.password)?;
        if device_password.is_empty() {
            return Err(CredentialError::InvalidKey(format!(
                "device '{}' has no password to derive a repository key from",
                device.name
            ))
            .into());
        }

        let salt = match share.key_salt.as_deref() {
            Some(salt) if !salt.is_empty() => salt.to_string(),
            _ => CredentialStore::generate_salt(),
        };

        let derived = self
            .credentials
            .derive_repository_key(&device_password, &salt)?;

        let mut updated = share.clone();
        updated.key_salt = Some(salt);
        updated.repository_password = Some(self.credentials.encrypt(&derived)?);
        updated.updated_at = Utc::now();
        self.catalog.save_share(
            device,
            &updated,
            &format!("persist derived repository key for '{}'", share.name),
        )?;

        Ok(derived)
    }
}

fn ensure_not_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(BackupError::Cancelled.into());
    }
    Ok(())
}

fn failure_message(error: &AppError) -> String {
    match error {
        AppError::Storage(StorageError::Exhausted(msg)) => {
            format!("Backup cannot proceed: {}", msg)
        }
        other => other.to_string(),
    }
}

/// Forwards live engine events into the registry and the execution log.
struct RunObserver {
    registry: Arc<JobRegistry>,
    logs: Arc<LogStore>,
    job_id: Uuid,
    device_id: Uuid,
    share_id: Uuid,
    log_key: String,
}

#[async_trait]
impl BackupObserver for RunObserver {
    async fn on_progress(&self, status: &StatusEvent) {
        let percent = (status.percent_done * 100.0).clamp(0.0, 100.0);
        let progress = JobProgress {
            job_id: self.job_id,
            device_id: self.device_id,
            share_id: Some(self.share_id),
            percent_done: percent,
            files_done: status.files_done,
            bytes_done: status.bytes_done,
            current_file: status.current_files.first().cloned(),
            timestamp: Utc::now(),
        };

        // Log entries follow the throttled stream, not the raw firehose.
        if self.registry.emit_progress(progress).await {
            let entry = ProgressLogEntry {
                timestamp: Utc::now(),
                message: format!("{:.1}% complete", percent),
                percent_done: percent,
                current_file: status.current_files.first().cloned(),
                files_done: status.files_done,
                bytes_done: status.bytes_done,
            };
            self.logs.add_progress_entry(&self.log_key, entry).await;
        }
    }

    async fn on_warning(&self, message: &str) {
        warn!(job_id = %self.job_id, "Engine warning: {}", message);
        self.logs.add_warning(&self.log_key, message).await;
    }

    async fn on_error(&self, message: &str) {
        error!(job_id = %self.job_id, "Engine error: {}", message);
        self.logs.add_error(&self.log_key, message).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::local::JobsConfig;
    use crate::model::Protocol;
    use crate::storage::StorageThresholds;
    use tempfile::TempDir;

    struct Fixture {
        orchestrator: Orchestrator,
        catalog: Arc<Catalog>,
        registry: Arc<JobRegistry>,
        credentials: Arc<CredentialStore>,
        _dir: TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().expect("Failed to create temp dir");

        let catalog =
            Arc::new(Catalog::open(dir.path().join("config")).expect("Failed to open catalog"));
        let pool = db::create_pool(std::path::Path::new(":memory:"))
            .await
            .expect("Failed to create pool");
        db::run_migrations(&pool)
            .await
            .expect("Failed to run migrations");
        let registry = Arc::new(JobRegistry::new(pool, &JobsConfig::default()));
        let engine = Arc::new(EngineClient::with_binary(
            dir.path().join("missing-engine"),
        ));
        let protocols = Arc::new(ProtocolRegistry::with_defaults(dir.path().join("mnt")));
        let storage = Arc::new(StorageMonitor::new(StorageThresholds {
            warning_percent: 80.0,
            critical_percent: 90.0,
            exhausted_percent: 95.0,
            minimum_free_bytes: 0,
        }));
        let logs =
            Arc::new(LogStore::open(dir.path().join("logs.ndjson")).expect("Failed to open logs"));
        let credentials = Arc::new(
            CredentialStore::from_key(&[9u8; 32], 1000).expect("Failed to create credentials"),
        );

        let config: LocalConfig = serde_yaml::from_str(&format!(
            "service:\n  log_file: {}\n",
            dir.path().join("svc.log").display()
        ))
        .expect("Failed to parse config");

        let orchestrator = Orchestrator::new(
            catalog.clone(),
            registry.clone(),
            engine,
            protocols,
            storage,
            logs,
            credentials.clone(),
            &config,
        );

        Fixture {
            orchestrator,
            catalog,
            registry,
            credentials,
            _dir: dir,
        }
    }

    fn create_test_device(credentials: &CredentialStore, name: &str) -> Device {
        Device {
            id: Uuid::new_v4(),
            name: name.to_string(),
            protocol: Protocol::Smb,
            host: "nas.local".to_string(),
            port: Some(445),
            username: "backup".to_string(),
            password: credentials.encrypt("p").expect("Failed to encrypt"),
            wake_on_lan: false,
            wake_mac: None,
            schedule: None,
            retention: None,
            rules: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn create_test_share(device: &Device, name: &str, enabled: bool) -> Share {
        Share {
            id: Uuid::new_v4(),
            device_id: device.id,
            name: name.to_string(),
            remote_path: "/data".to_string(),
            enabled,
            schedule: None,
            retention: None,
            rules: None,
            repository_password: None,
            key_salt: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_unknown_device_fails_before_tracking() {
        let f = fixture().await;
        let result = f
            .orchestrator
            .execute_share_backup(Uuid::new_v4(), Uuid::new_v4(), JobType::Manual)
            .await;

        assert!(matches!(
            result,
            Err(AppError::Backup(BackupError::DeviceNotFound(_)))
        ));
        assert!(f.registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_disabled_share_rejected() {
        let f = fixture().await;

        let device = create_test_device(&f.credentials, "nas1");
        f.catalog
            .save_device(&device, "add")
            .expect("Failed to save device");
        let share = create_test_share(&device, "scratch", false);
        f.catalog
            .save_share(&device, &share, "add")
            .expect("Failed to save share");

        let result = f
            .orchestrator
            .execute_share_backup(device.id, share.id, JobType::Manual)
            .await;
        assert!(matches!(
            result,
            Err(AppError::Backup(BackupError::ShareDisabled(_)))
        ));
        assert!(f.registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_share_mismatch_rejected() {
        let f = fixture().await;

        let device = create_test_device(&f.credentials, "nas1");
        let other = create_test_device(&f.credentials, "nas2");
        f.catalog
            .save_device(&device, "add")
            .expect("Failed to save device");
        f.catalog
            .save_device(&other, "add")
            .expect("Failed to save device");
        let share = create_test_share(&device, "photos", true);
        f.catalog
            .save_share(&device, &share, "add")
            .expect("Failed to save share");

        let result = f
            .orchestrator
            .execute_share_backup(other.id, share.id, JobType::Manual)
            .await;
        assert!(matches!(
            result,
            Err(AppError::Backup(BackupError::ShareMismatch { .. }))
        ));
    }

    #[tokio::test]
    async fn test_device_without_enabled_shares_rejected() {
        let f = fixture().await;

        let device = create_test_device(&f.credentials, "nas1");
        f.catalog
            .save_device(&device, "add")
            .expect("Failed to save device");
        let share = create_test_share(&device, "scratch", false);
        f.catalog
            .save_share(&device, &share, "add")
            .expect("Failed to save share");

        let result = f
            .orchestrator
            .execute_device_backup(device.id, JobType::Scheduled)
            .await;
        assert!(matches!(
            result,
            Err(AppError::Backup(BackupError::NoEnabledShares(_)))
        ));
    }

    #[tokio::test]
    async fn test_retry_requires_failed_status() {
        let f = fixture().await;

        let mut job = BackupJob::new(Uuid::new_v4(), None, JobType::Manual);
        job.status = JobStatus::Completed;
        job.completed_at = Some(Utc::now());
        db::save_job(f.registry.pool(), &job)
            .await
            .expect("Failed to save job");

        let result = f.orchestrator.retry_failed_job(job.id).await;
        assert!(matches!(
            result,
            Err(AppError::Backup(BackupError::JobNotRetryable { .. }))
        ));

        let result = f.orchestrator.retry_failed_job(Uuid::new_v4()).await;
        assert!(matches!(
            result,
            Err(AppError::Backup(BackupError::JobNotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_repository_password_derivation_persists_salt() {
        let f = fixture().await;

        let device = create_test_device(&f.credentials, "nas1");
        f.catalog
            .save_device(&device, "add")
            .expect("Failed to save device");
        let share = create_test_share(&device, "photos", true);
        f.catalog
            .save_share(&device, &share, "add")
            .expect("Failed to save share");

        let first = f
            .orchestrator
            .resolve_repository_password(&device, &share)
            .await
            .expect("Failed to derive password");

        let (_, persisted) = f
            .catalog
            .get_share(share.id)
            .expect("Failed to get share")
            .expect("Share should exist");
        assert!(persisted.key_salt.is_some());
        assert!(persisted.repository_password.is_some());

        // A second resolution takes the stored-password branch and agrees.
        let second = f
            .orchestrator
            .resolve_repository_password(&device, &persisted)
            .await
            .expect("Failed to resolve password");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_share_repository_password_used_verbatim() {
        let f = fixture().await;

        let device = create_test_device(&f.credentials, "nas1");
        let mut share = create_test_share(&device, "photos", true);
        share.repository_password =
            Some(f.credentials.encrypt("explicit-pass").expect("encrypt"));

        let resolved = f
            .orchestrator
            .resolve_repository_password(&device, &share)
            .await
            .expect("Failed to resolve password");
        assert_eq!(resolved, "explicit-pass");
    }
}
