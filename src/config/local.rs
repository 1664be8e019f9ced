use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    pub service: ServiceConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub restore: RestoreConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub wake: WakeConfig,
    #[serde(default)]
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub log_file: String,
    #[serde(default = "default_config_root")]
    pub config_root: PathBuf,
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_mount_base")]
    pub mount_base: PathBuf,
    #[serde(default = "default_backup_log_path")]
    pub backup_log_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_engine_binary")]
    pub binary_path: String,
    #[serde(default = "default_repository_base")]
    pub repository_base_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreConfig {
    #[serde(default = "default_restore_root")]
    pub root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_warning_percent")]
    pub warning_percent: f64,
    #[serde(default = "default_critical_percent")]
    pub critical_percent: f64,
    #[serde(default = "default_exhausted_percent")]
    pub exhausted_percent: f64,
    #[serde(default = "default_minimum_free_bytes")]
    pub minimum_free_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    #[serde(default = "default_completed_job_ttl_secs")]
    pub completed_job_ttl_secs: u64,
    #[serde(default = "default_progress_interval_ms")]
    pub progress_broadcast_interval_ms: u64,
    #[serde(default = "default_progress_percent_threshold")]
    pub progress_percent_threshold: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WakeConfig {
    #[serde(default = "default_wake_wait_seconds")]
    pub wait_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default = "default_master_key_file")]
    pub master_key_file: PathBuf,
    #[serde(default = "default_pbkdf2_iterations")]
    pub pbkdf2_iterations: u32,
}

fn default_config_root() -> PathBuf {
    PathBuf::from("./config")
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./backhaul.db")
}

fn default_mount_base() -> PathBuf {
    PathBuf::from("./mnt")
}

fn default_backup_log_path() -> PathBuf {
    PathBuf::from("./backup_logs.ndjson")
}

fn default_engine_binary() -> String {
    "restic".to_string()
}

fn default_repository_base() -> PathBuf {
    PathBuf::from("./repositories")
}

fn default_restore_root() -> PathBuf {
    PathBuf::from("./restores")
}

fn default_warning_percent() -> f64 {
    80.0
}

fn default_critical_percent() -> f64 {
    90.0
}

fn default_exhausted_percent() -> f64 {
    95.0
}

fn default_minimum_free_bytes() -> u64 {
    1024 * 1024 * 1024
}

fn default_completed_job_ttl_secs() -> u64 {
    3600
}

fn default_progress_interval_ms() -> u64 {
    500
}

fn default_progress_percent_threshold() -> f64 {
    1.0
}

fn default_wake_wait_seconds() -> u64 {
    30
}

fn default_master_key_file() -> PathBuf {
    PathBuf::from("./master.key")
}

fn default_pbkdf2_iterations() -> u32 {
    150_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary_path: default_engine_binary(),
            repository_base_path: default_repository_base(),
        }
    }
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            root: default_restore_root(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            warning_percent: default_warning_percent(),
            critical_percent: default_critical_percent(),
            exhausted_percent: default_exhausted_percent(),
            minimum_free_bytes: default_minimum_free_bytes(),
        }
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            completed_job_ttl_secs: default_completed_job_ttl_secs(),
            progress_broadcast_interval_ms: default_progress_interval_ms(),
            progress_percent_threshold: default_progress_percent_threshold(),
        }
    }
}

impl Default for WakeConfig {
    fn default() -> Self {
        Self {
            wait_seconds: default_wake_wait_seconds(),
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            master_key_file: default_master_key_file(),
            pbkdf2_iterations: default_pbkdf2_iterations(),
        }
    }
}

impl LocalConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::LoadFailed(format!("Failed to read config file: {}", e)))?;

        let config: LocalConfig = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseFailed(format!("Failed to parse YAML: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.service.log_file.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "service.log_file cannot be empty".to_string(),
            )
            .into());
        }

        if self.engine.binary_path.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "engine.binary_path cannot be empty".to_string(),
            )
            .into());
        }

        if self.storage.warning_percent >= self.storage.critical_percent
            || self.storage.critical_percent >= self.storage.exhausted_percent
        {
            return Err(ConfigError::ValidationFailed(
                "storage thresholds must be strictly increasing".to_string(),
            )
            .into());
        }

        if self.security.pbkdf2_iterations == 0 {
            return Err(ConfigError::ValidationFailed(
                "security.pbkdf2_iterations must be positive".to_string(),
            )
            .into());
        }

        Ok(())
    }
}
