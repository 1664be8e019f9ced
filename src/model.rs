use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Transport used to reach a device's shares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Smb,
    Ssh,
    Rsync,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Smb => write!(f, "smb"),
            Protocol::Ssh => write!(f, "ssh"),
            Protocol::Rsync => write!(f, "rsync"),
        }
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "smb" => Ok(Protocol::Smb),
            "ssh" => Ok(Protocol::Ssh),
            "rsync" => Ok(Protocol::Rsync),
            other => Err(format!("unknown protocol: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: Uuid,
    pub name: String,
    pub protocol: Protocol,
    pub host: String,
    pub port: Option<u16>,
    pub username: String,
    /// Encrypted with the credential store; never stored in the clear.
    pub password: String,
    #[serde(default)]
    pub wake_on_lan: bool,
    pub wake_mac: Option<String>,
    pub schedule: Option<Schedule>,
    pub retention: Option<RetentionPolicy>,
    pub rules: Option<IncludeExcludeRules>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Share {
    pub id: Uuid,
    pub device_id: Uuid,
    pub name: String,
    /// Path on the remote device, e.g. `/volume1/photos` or an SMB share name.
    pub remote_path: String,
    pub enabled: bool,
    pub schedule: Option<Schedule>,
    pub retention: Option<RetentionPolicy>,
    pub rules: Option<IncludeExcludeRules>,
    /// Encrypted repository password; derived from the device password when absent.
    pub repository_password: Option<String>,
    /// Base64 of the 32-byte salt used for repository key derivation.
    pub key_salt: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Cron expression (seconds resolution) with an optional local-clock window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub cron: String,
    pub window_start: Option<NaiveTime>,
    pub window_end: Option<NaiveTime>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub keep_latest: u32,
    pub keep_daily: u32,
    pub keep_weekly: u32,
    pub keep_monthly: u32,
    pub keep_yearly: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncludeExcludeRules {
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    #[serde(default)]
    pub exclude_regex: Vec<String>,
    #[serde(default)]
    pub include_only_regex: Vec<String>,
    /// Filenames whose presence skips the containing directory.
    #[serde(default)]
    pub exclude_if_present: Vec<String>,
}

impl IncludeExcludeRules {
    pub fn is_empty(&self) -> bool {
        self.exclude_patterns.is_empty()
            && self.exclude_regex.is_empty()
            && self.include_only_regex.is_empty()
            && self.exclude_if_present.is_empty()
    }

    /// Effective rules for a run: share rules win over device rules.
    pub fn effective(share: Option<&Self>, device: Option<&Self>) -> Self {
        share.or(device).cloned().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Manual,
    Scheduled,
    Retry,
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobType::Manual => write!(f, "manual"),
            JobType::Scheduled => write!(f, "scheduled"),
            JobType::Retry => write!(f, "retry"),
        }
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(JobType::Manual),
            "scheduled" => Ok(JobType::Scheduled),
            "retry" => Ok(JobType::Retry),
            other => Err(format!("unknown job type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
    PartiallyCompleted,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Running)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
            JobStatus::PartiallyCompleted => write!(f, "partially_completed"),
        }
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            "partially_completed" => Ok(JobStatus::PartiallyCompleted),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

/// In-memory unit of work tracked by the job registry and persisted
/// through the job sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupJob {
    pub id: Uuid,
    pub device_id: Uuid,
    /// Absent for device-level jobs covering all enabled shares.
    pub share_id: Option<Uuid>,
    pub job_type: JobType,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub files_processed: i64,
    pub bytes_transferred: i64,
    /// Snapshot id reported by the engine. For device-level jobs this is the
    /// last successful share's snapshot; the full set lives in the log store.
    pub backup_id: Option<String>,
    /// Engine command line with secrets redacted.
    pub command_line: Option<String>,
}

impl BackupJob {
    pub fn new(device_id: Uuid, share_id: Option<Uuid>, job_type: JobType) -> Self {
        Self {
            id: Uuid::new_v4(),
            device_id,
            share_id,
            job_type,
            status: JobStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            error_message: None,
            files_processed: 0,
            bytes_transferred: 0,
            backup_id: None,
            command_line: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == JobStatus::Running
    }

    pub fn append_error(&mut self, line: &str) {
        match &mut self.error_message {
            Some(existing) => {
                existing.push('\n');
                existing.push_str(line);
            }
            None => self.error_message = Some(line.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    Success,
    Partial,
    Failed,
}

/// Snapshot record as reported by the engine, joined to its job by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backup {
    pub id: String,
    pub device_id: Uuid,
    pub share_id: Uuid,
    pub device_name: String,
    pub share_name: String,
    pub timestamp: DateTime<Utc>,
    pub status: BackupStatus,
    /// Share name -> absolute path at backup time.
    pub paths: BTreeMap<String, String>,
    pub files_new: i64,
    pub files_changed: i64,
    pub files_unmodified: i64,
    pub dirs_new: i64,
    pub dirs_changed: i64,
    pub dirs_unmodified: i64,
    pub bytes_added: i64,
    pub bytes_processed: i64,
    pub duration_seconds: f64,
    pub error_message: Option<String>,
    pub created_by_job_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressLogEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub percent_done: f64,
    pub current_file: Option<String>,
    pub files_done: i64,
    pub bytes_done: i64,
}

/// Per-backup execution log, append-only within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupExecutionLog {
    /// Snapshot id, or the job id when no snapshot materialized.
    pub backup_id: String,
    pub job_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub progress: Vec<ProgressLogEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdLevel {
    Normal,
    Warning,
    Critical,
    Exhausted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageStatus {
    pub path: String,
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub used_percentage: f64,
    pub level: ThresholdLevel,
    pub message: String,
}

/// Throttled progress event fanned out to subscribers by the job registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobProgress {
    pub job_id: Uuid,
    pub device_id: Uuid,
    pub share_id: Option<Uuid>,
    pub percent_done: f64,
    pub files_done: i64,
    pub bytes_done: i64,
    pub current_file: Option<String>,
    pub timestamp: DateTime<Utc>,
}
