use crate::engine::events::{
    parse_event_line, parse_nodes, parse_snapshots, BackupEvent, SnapshotRecord, StatusEvent,
    SummaryEvent,
};
use crate::error::{EngineError, Result};
use crate::model::{Backup, BackupStatus, Device, IncludeExcludeRules, Share};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader, ReadBuf};
use tokio::process::{Child, ChildStdout, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

pub use crate::engine::events::StatsRecord as EngineStats;

/// Exit code the engine uses for "no repository at this location".
const REPOSITORY_MISSING_EXIT_CODE: i32 = 10;

/// How long to wait for a killed child before giving up on the reap.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Receives live events from a streaming backup.
#[async_trait]
pub trait BackupObserver: Send + Sync {
    async fn on_progress(&self, status: &StatusEvent);
    async fn on_warning(&self, message: &str);
    async fn on_error(&self, message: &str);
}

/// Everything `create_backup` needs to drive one engine run.
pub struct BackupRequest<'a> {
    pub repo_path: &'a Path,
    pub password: &'a str,
    pub device: &'a Device,
    pub share: &'a Share,
    pub mount_path: &'a Path,
    pub rules: &'a IncludeExcludeRules,
    pub job_id: Uuid,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub kind: String,
    pub size: u64,
    pub mtime: Option<DateTime<Utc>>,
}

/// Typed, cancellable operations over the external deduplicating engine.
///
/// Every invocation passes the repository via `RESTIC_REPOSITORY` and the
/// password via `RESTIC_PASSWORD`; secrets never appear on the command line.
pub struct EngineClient {
    binary_path: PathBuf,
}

impl EngineClient {
    /// Resolves `binary` from an explicit path or from PATH.
    pub fn new(binary: &str) -> Result<Self> {
        let path = Path::new(binary);
        if path.components().count() > 1 || path.exists() {
            return Ok(Self::with_binary(path.to_path_buf()));
        }

        match which::which(binary) {
            Ok(resolved) => {
                debug!("Found engine binary at: {}", resolved.display());
                Ok(Self::with_binary(resolved))
            }
            Err(_) => Err(EngineError::BinaryNotFound(format!(
                "'{}' not found in PATH. Please install the backup engine: https://restic.net/",
                binary
            ))
            .into()),
        }
    }

    pub fn with_binary(binary_path: PathBuf) -> Self {
        Self { binary_path }
    }

    fn base_command(&self, repo_path: &Path, password: &str) -> Command {
        let mut cmd = Command::new(&self.binary_path);
        cmd.env("RESTIC_REPOSITORY", repo_path);
        cmd.env("RESTIC_PASSWORD", password);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd
    }

    async fn run(&self, mut cmd: Command) -> Result<std::process::Output> {
        cmd.output().await.map_err(|e| {
            EngineError::CommandFailed(format!(
                "failed to execute {}: {}",
                self.binary_path.display(),
                e
            ))
            .into()
        })
    }

    /// Probes for a repository by listing its most recent snapshot.
    pub async fn repository_exists(&self, repo_path: &Path, password: &str) -> Result<bool> {
        let mut cmd = self.base_command(repo_path, password);
        cmd.arg("snapshots").arg("--json").arg("--latest").arg("1");

        let output = self.run(cmd).await?;
        if output.status.success() {
            return Ok(true);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_missing_repository(output.status.code(), &stderr) {
            return Ok(false);
        }
        Err(EngineError::CommandFailed(format!(
            "repository probe failed: {}",
            stderr.trim()
        ))
        .into())
    }

    /// Creates the repository; already-initialized repositories are fine.
    pub async fn init(&self, repo_path: &Path, password: &str) -> Result<()> {
        tokio::fs::create_dir_all(repo_path)
            .await
            .map_err(|e| EngineError::InitFailed(format!("{}: {}", repo_path.display(), e)))?;

        let mut cmd = self.base_command(repo_path, password);
        cmd.arg("init").arg("--json");

        let output = self.run(cmd).await?;
        if output.status.success() {
            debug!(repo = %repo_path.display(), "Repository initialized");
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("already initialized") || stderr.contains("already exists") {
            debug!(repo = %repo_path.display(), "Repository already initialized");
            return Ok(());
        }
        Err(EngineError::InitFailed(stderr.trim().to_string()).into())
    }

    /// Streams one backup run, forwarding events to the observer and
    /// honouring cancellation by killing and reaping the child.
    pub async fn create_backup(
        &self,
        request: &BackupRequest<'_>,
        observer: &dyn BackupObserver,
        cancel: &CancellationToken,
    ) -> Result<Backup> {
        let args = backup_args(request);
        let mut cmd = self.base_command(request.repo_path, request.password);
        cmd.args(&args);
        cmd.kill_on_drop(true);

        debug!(
            share = %request.share.name,
            mount = %request.mount_path.display(),
            "Executing engine backup command"
        );

        let mut child = cmd.spawn().map_err(|e| {
            EngineError::BackupFailed(format!(
                "failed to execute {}: {}",
                self.binary_path.display(),
                e
            ))
        })?;

        let stderr_handle = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(mut stderr) = stderr_handle {
                let _ = stderr.read_to_string(&mut buf).await;
            }
            buf
        });

        let stdout = child.stdout.take().ok_or_else(|| {
            EngineError::BackupFailed("failed to capture engine stdout".to_string())
        })?;
        let mut lines = BufReader::new(stdout).lines();

        let mut summary: Option<SummaryEvent> = None;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    warn!(share = %request.share.name, "Backup cancelled, killing engine process");
                    let _ = child.start_kill();
                    let _ = tokio::time::timeout(KILL_GRACE, child.wait()).await;
                    stderr_task.abort();
                    return Err(EngineError::Cancelled.into());
                }
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => match parse_event_line(&line) {
                            Some(BackupEvent::Status(status)) => observer.on_progress(&status).await,
                            Some(BackupEvent::Summary(s)) => summary = Some(s),
                            Some(BackupEvent::Warning(text)) => observer.on_warning(&text).await,
                            Some(BackupEvent::Error(text)) => observer.on_error(&text).await,
                            None => {}
                        },
                        Ok(None) => break,
                        Err(e) => {
                            let _ = child.start_kill();
                            let _ = tokio::time::timeout(KILL_GRACE, child.wait()).await;
                            stderr_task.abort();
                            return Err(EngineError::BackupFailed(format!(
                                "failed to read engine output: {}",
                                e
                            ))
                            .into());
                        }
                    }
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| EngineError::BackupFailed(e.to_string()))?;
        let stderr_output = stderr_task.await.unwrap_or_default();

        // The child may have exited non-zero because we killed it.
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled.into());
        }

        if !status.success() {
            if is_missing_repository(status.code(), &stderr_output) {
                return Err(EngineError::RepositoryMissing(
                    request.repo_path.display().to_string(),
                )
                .into());
            }
            return Err(
                EngineError::BackupFailed(extract_error_message(&stderr_output)).into(),
            );
        }

        let summary = summary.ok_or_else(|| {
            EngineError::ParseFailed("no summary message in engine output".to_string())
        })?;
        let snapshot_id = summary.snapshot_id.clone().ok_or_else(|| {
            EngineError::ParseFailed("no snapshot_id in summary".to_string())
        })?;

        let mut paths = BTreeMap::new();
        paths.insert(
            request.share.name.clone(),
            request.mount_path.display().to_string(),
        );

        Ok(Backup {
            id: snapshot_id,
            device_id: request.device.id,
            share_id: request.share.id,
            device_name: request.device.name.clone(),
            share_name: request.share.name.clone(),
            timestamp: Utc::now(),
            status: BackupStatus::Success,
            paths,
            files_new: summary.files_new.unwrap_or(0),
            files_changed: summary.files_changed.unwrap_or(0),
            files_unmodified: summary.files_unmodified.unwrap_or(0),
            dirs_new: summary.dirs_new.unwrap_or(0),
            dirs_changed: summary.dirs_changed.unwrap_or(0),
            dirs_unmodified: summary.dirs_unmodified.unwrap_or(0),
            bytes_added: summary.data_added.unwrap_or(0),
            bytes_processed: summary.total_bytes_processed.unwrap_or(0),
            duration_seconds: summary.total_duration.unwrap_or(0.0),
            error_message: None,
            created_by_job_id: Some(request.job_id),
        })
    }

    pub async fn list_backups(&self, repo_path: &Path, password: &str) -> Result<Vec<Backup>> {
        let records = self.snapshot_records(repo_path, password).await?;
        Ok(records.iter().filter_map(snapshot_to_backup).collect())
    }

    pub async fn get_backup(
        &self,
        backup_id: &str,
        repo_path: &Path,
        password: &str,
    ) -> Result<Backup> {
        self.list_backups(repo_path, password)
            .await?
            .into_iter()
            .find(|b| b.id == backup_id || b.id.starts_with(backup_id))
            .ok_or_else(|| {
                EngineError::CommandFailed(format!("snapshot {} not found", backup_id)).into()
            })
    }

    /// Backup record plus the raw snapshot metadata and repository stats.
    pub async fn get_backup_detail_complete(
        &self,
        backup_id: &str,
        repo_path: &Path,
        password: &str,
    ) -> Result<(Backup, SnapshotRecord, EngineStats)> {
        let records = self.snapshot_records(repo_path, password).await?;
        let record = records
            .into_iter()
            .find(|r| r.id == backup_id || r.id.starts_with(backup_id))
            .ok_or_else(|| {
                EngineError::CommandFailed(format!("snapshot {} not found", backup_id))
            })?;
        let backup = snapshot_to_backup(&record).ok_or_else(|| {
            EngineError::ParseFailed(format!(
                "snapshot {} carries no ownership tags",
                record.id
            ))
        })?;
        let stats = self.stats(backup_id, repo_path, password).await?;
        Ok((backup, record, stats))
    }

    pub async fn browse(
        &self,
        backup_id: &str,
        path: &str,
        repo_path: &Path,
        password: &str,
    ) -> Result<Vec<FileEntry>> {
        let mut cmd = self.base_command(repo_path, password);
        cmd.arg("ls").arg(backup_id).arg(path).arg("--json");

        let output = self.run(cmd).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_missing_repository(output.status.code(), &stderr) {
                return Err(
                    EngineError::RepositoryMissing(repo_path.display().to_string()).into(),
                );
            }
            return Err(EngineError::CommandFailed(stderr.trim().to_string()).into());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_nodes(&stdout)
            .into_iter()
            .map(|node| FileEntry {
                name: node.name,
                path: node.path,
                kind: node.kind,
                size: node.size,
                mtime: node.mtime,
            })
            .collect())
    }

    /// Streams one file out of a snapshot. The engine process lives until
    /// the returned stream is fully consumed or dropped.
    pub async fn dump_file_stream(
        &self,
        backup_id: &str,
        file_path: &str,
        repo_path: &Path,
        password: &str,
    ) -> Result<DumpStream> {
        let mut cmd = self.base_command(repo_path, password);
        cmd.arg("dump").arg(backup_id).arg(file_path);
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            EngineError::CommandFailed(format!(
                "failed to execute {}: {}",
                self.binary_path.display(),
                e
            ))
        })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            EngineError::CommandFailed("failed to capture engine stdout".to_string())
        })?;

        Ok(DumpStream { _child: child, stdout })
    }

    /// Restores a snapshot (optionally restricted to `include_paths`) into
    /// `target_path`. The target must be absolute; the restore-root policy
    /// is enforced by the caller via [`crate::engine::resolve_restore_target`].
    pub async fn restore(
        &self,
        backup_id: &str,
        target_path: &Path,
        include_paths: &[String],
        repo_path: &Path,
        password: &str,
    ) -> Result<()> {
        if !target_path.is_absolute() {
            return Err(EngineError::InvalidRestoreTarget(format!(
                "target must be an absolute path: {}",
                target_path.display()
            ))
            .into());
        }

        let mut cmd = self.base_command(repo_path, password);
        cmd.arg("restore").arg(backup_id).arg("--target").arg(target_path);
        for include in include_paths {
            cmd.arg("--include").arg(include);
        }

        let output = self.run(cmd).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_missing_repository(output.status.code(), &stderr) {
                return Err(
                    EngineError::RepositoryMissing(repo_path.display().to_string()).into(),
                );
            }
            return Err(EngineError::RestoreFailed(stderr.trim().to_string()).into());
        }
        Ok(())
    }

    pub async fn stats(
        &self,
        backup_id: &str,
        repo_path: &Path,
        password: &str,
    ) -> Result<EngineStats> {
        let mut cmd = self.base_command(repo_path, password);
        cmd.arg("stats").arg(backup_id).arg("--json");

        let output = self.run(cmd).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::CommandFailed(stderr.trim().to_string()).into());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        serde_json::from_str(stdout.trim())
            .map_err(|e| EngineError::ParseFailed(format!("stats output: {}", e)).into())
    }

    /// The backup command line with the password redacted, for job records.
    pub fn backup_command_line(&self, request: &BackupRequest<'_>) -> String {
        format!(
            "RESTIC_REPOSITORY={} RESTIC_PASSWORD=*** {} {}",
            request.repo_path.display(),
            self.binary_path.display(),
            backup_args(request).join(" ")
        )
    }

    async fn snapshot_records(
        &self,
        repo_path: &Path,
        password: &str,
    ) -> Result<Vec<SnapshotRecord>> {
        let mut cmd = self.base_command(repo_path, password);
        cmd.arg("snapshots").arg("--json");

        let output = self.run(cmd).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_missing_repository(output.status.code(), &stderr) {
                return Err(
                    EngineError::RepositoryMissing(repo_path.display().to_string()).into(),
                );
            }
            return Err(EngineError::CommandFailed(stderr.trim().to_string()).into());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_snapshots(&stdout)
            .map_err(|e| EngineError::ParseFailed(format!("snapshots output: {}", e)).into())
    }
}

/// Read side of `dump`; dropping it kills and reaps the engine process.
pub struct DumpStream {
    _child: Child,
    stdout: ChildStdout,
}

impl AsyncRead for DumpStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stdout).poll_read(cx, buf)
    }
}

fn backup_args(request: &BackupRequest<'_>) -> Vec<String> {
    let mut args = vec![
        "backup".to_string(),
        request.mount_path.display().to_string(),
        "--json".to_string(),
    ];

    for pattern in &request.rules.exclude_patterns {
        args.push("--exclude".to_string());
        args.push(pattern.clone());
    }
    for pattern in &request.rules.exclude_regex {
        args.push("--exclude-re".to_string());
        args.push(pattern.clone());
    }
    for pattern in &request.rules.include_only_regex {
        args.push("--include-re".to_string());
        args.push(pattern.clone());
    }
    for marker in &request.rules.exclude_if_present {
        args.push("--exclude-if-present".to_string());
        args.push(marker.clone());
    }

    for tag in backup_tags(request) {
        args.push("--tag".to_string());
        args.push(tag);
    }

    args
}

/// Ownership tags so snapshots can be attributed without the config store.
fn backup_tags(request: &BackupRequest<'_>) -> Vec<String> {
    vec![
        format!("device_id={}", request.device.id),
        format!("share_id={}", request.share.id),
        format!("device_name={}", request.device.name),
        format!("share_name={}", request.share.name),
        format!("job_id={}", request.job_id),
    ]
}

/// Rebuilds a [`Backup`] from snapshot tags; snapshots without ownership
/// tags (made outside this service) yield `None`.
fn snapshot_to_backup(record: &SnapshotRecord) -> Option<Backup> {
    let tags: HashMap<&str, &str> = record
        .tags
        .iter()
        .filter_map(|tag| tag.split_once('='))
        .collect();

    let device_id: Uuid = tags.get("device_id")?.parse().ok()?;
    let share_id: Uuid = tags.get("share_id")?.parse().ok()?;
    let device_name = tags.get("device_name").unwrap_or(&"").to_string();
    let share_name = tags.get("share_name").unwrap_or(&"").to_string();
    let created_by_job_id = tags.get("job_id").and_then(|id| id.parse().ok());

    let mut paths = BTreeMap::new();
    if let Some(path) = record.paths.first() {
        paths.insert(share_name.clone(), path.clone());
    }

    let summary = record.summary.clone().unwrap_or_default();

    Some(Backup {
        id: record.id.clone(),
        device_id,
        share_id,
        device_name,
        share_name,
        timestamp: record.time,
        status: BackupStatus::Success,
        paths,
        files_new: summary.files_new.unwrap_or(0),
        files_changed: summary.files_changed.unwrap_or(0),
        files_unmodified: summary.files_unmodified.unwrap_or(0),
        dirs_new: summary.dirs_new.unwrap_or(0),
        dirs_changed: summary.dirs_changed.unwrap_or(0),
        dirs_unmodified: summary.dirs_unmodified.unwrap_or(0),
        bytes_added: summary.data_added.unwrap_or(0),
        bytes_processed: summary.total_bytes_processed.unwrap_or(0),
        duration_seconds: summary.total_duration.unwrap_or(0.0),
        error_message: None,
        created_by_job_id,
    })
}

fn is_missing_repository(exit_code: Option<i32>, stderr: &str) -> bool {
    if exit_code == Some(REPOSITORY_MISSING_EXIT_CODE) {
        return true;
    }
    let stderr = stderr.to_ascii_lowercase();
    stderr.contains("cannot open config file")
        || stderr.contains("unable to open config file")
        || stderr.contains("is there a repository at the following location")
}

fn extract_error_message(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        "Backup failed with no error message".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn create_test_device() -> Device {
        Device {
            id: Uuid::new_v4(),
            name: "nas1".to_string(),
            protocol: crate::model::Protocol::Smb,
            host: "nas.local".to_string(),
            port: Some(445),
            username: "backup".to_string(),
            password: "encrypted".to_string(),
            wake_on_lan: false,
            wake_mac: None,
            schedule: None,
            retention: None,
            rules: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn create_test_share(device: &Device) -> Share {
        Share {
            id: Uuid::new_v4(),
            device_id: device.id,
            name: "photos".to_string(),
            remote_path: "/volume1/photos".to_string(),
            enabled: true,
            schedule: None,
            retention: None,
            rules: None,
            repository_password: None,
            key_salt: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_backup_args_forward_rules() {
        let device = create_test_device();
        let share = create_test_share(&device);
        let rules = IncludeExcludeRules {
            exclude_patterns: vec!["*.tmp".to_string()],
            exclude_regex: vec![r"\.cache$".to_string()],
            include_only_regex: vec![r"^/photos".to_string()],
            exclude_if_present: vec![".nobackup".to_string()],
        };
        let request = BackupRequest {
            repo_path: Path::new("/repos/d/s"),
            password: "secret",
            device: &device,
            share: &share,
            mount_path: Path::new("/mnt/nas.local-volume1_photos"),
            rules: &rules,
            job_id: Uuid::new_v4(),
        };

        let args = backup_args(&request);
        assert_eq!(args[0], "backup");
        assert_eq!(args[1], "/mnt/nas.local-volume1_photos");
        assert!(args.contains(&"--json".to_string()));

        let joined = args.join(" ");
        assert!(joined.contains("--exclude *.tmp"));
        assert!(joined.contains(r"--exclude-re \.cache$"));
        assert!(joined.contains("--include-re ^/photos"));
        assert!(joined.contains("--exclude-if-present .nobackup"));
        assert!(joined.contains(&format!("--tag device_id={}", device.id)));
        assert!(joined.contains(&format!("--tag job_id={}", request.job_id)));
    }

    #[test]
    fn test_command_line_redacts_password() {
        let device = create_test_device();
        let share = create_test_share(&device);
        let rules = IncludeExcludeRules::default();
        let request = BackupRequest {
            repo_path: Path::new("/repos/d/s"),
            password: "super-secret",
            device: &device,
            share: &share,
            mount_path: Path::new("/mnt/data"),
            rules: &rules,
            job_id: Uuid::new_v4(),
        };

        let client = EngineClient::with_binary(PathBuf::from("/usr/bin/restic"));
        let line = client.backup_command_line(&request);

        assert!(line.contains("RESTIC_REPOSITORY=/repos/d/s"));
        assert!(line.contains("RESTIC_PASSWORD=***"));
        assert!(!line.contains("super-secret"));
    }

    #[test]
    fn test_missing_repository_detection() {
        assert!(is_missing_repository(Some(10), ""));
        assert!(is_missing_repository(
            Some(1),
            "Fatal: unable to open config file: <config/> does not exist"
        ));
        assert!(is_missing_repository(
            Some(1),
            "Is there a repository at the following location?"
        ));
        assert!(!is_missing_repository(Some(1), "Fatal: wrong password"));
        assert!(!is_missing_repository(None, ""));
    }

    #[test]
    fn test_snapshot_to_backup_reads_ownership_tags() {
        let device_id = Uuid::new_v4();
        let share_id = Uuid::new_v4();
        let job_id = Uuid::new_v4();

        let record = SnapshotRecord {
            id: "abc123def".to_string(),
            time: Utc.with_ymd_and_hms(2026, 7, 1, 2, 0, 0).unwrap(),
            paths: vec!["/mnt/nas.local-data".to_string()],
            tags: vec![
                format!("device_id={}", device_id),
                format!("share_id={}", share_id),
                "device_name=nas1".to_string(),
                "share_name=photos".to_string(),
                format!("job_id={}", job_id),
            ],
            summary: Some(SummaryEvent {
                files_new: Some(12),
                data_added: Some(4096),
                total_duration: Some(3.5),
                ..Default::default()
            }),
        };

        let backup = snapshot_to_backup(&record).expect("Tags should reconstruct a backup");
        assert_eq!(backup.device_id, device_id);
        assert_eq!(backup.share_id, share_id);
        assert_eq!(backup.share_name, "photos");
        assert_eq!(backup.files_new, 12);
        assert_eq!(backup.bytes_added, 4096);
        assert_eq!(backup.created_by_job_id, Some(job_id));
        assert_eq!(
            backup.paths.get("photos"),
            Some(&"/mnt/nas.local-data".to_string())
        );
    }

    #[test]
    fn test_foreign_snapshot_is_skipped() {
        let record = SnapshotRecord {
            id: "abc".to_string(),
            time: Utc::now(),
            paths: vec![],
            tags: vec!["manual".to_string()],
            summary: None,
        };
        assert!(snapshot_to_backup(&record).is_none());
    }

    #[test]
    fn test_extract_error_message_fallback() {
        assert_eq!(
            extract_error_message(""),
            "Backup failed with no error message"
        );
        assert_eq!(extract_error_message("boom\n"), "boom");
    }
}
