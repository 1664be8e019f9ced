use std::fmt;
use uuid::Uuid;

#[derive(Debug)]
pub enum AppError {
    Config(ConfigError),
    Store(StoreError),
    Database(DatabaseError),
    Credential(CredentialError),
    Protocol(ProtocolError),
    Storage(StorageError),
    Engine(EngineError),
    Backup(BackupError),
    Scheduler(SchedulerError),
}

impl AppError {
    /// Cancellation is terminal control flow, never reclassified as failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            AppError::Backup(BackupError::Cancelled) | AppError::Engine(EngineError::Cancelled)
        )
    }
}

#[derive(Debug)]
#[allow(clippy::enum_variant_names)]
pub enum ConfigError {
    LoadFailed(String),
    ParseFailed(String),
    ValidationFailed(String),
}

/// Errors from the declarative config store (typed key/value over files).
#[derive(Debug)]
pub enum StoreError {
    InvalidName(String),
    ReadFailed(String),
    WriteFailed(String),
    ParseFailed(String),
}

#[derive(Debug)]
#[allow(clippy::enum_variant_names)]
pub enum DatabaseError {
    ConnectionFailed(sqlx::Error),
    QueryFailed(sqlx::Error),
    MigrationFailed(sqlx::Error),
}

#[derive(Debug)]
pub enum CredentialError {
    InvalidKey(String),
    EncryptFailed(String),
    DecryptFailed(String),
}

#[derive(Debug)]
pub enum ProtocolError {
    UnsupportedProtocol(String),
    ConnectionFailed(String),
    MountFailed(String),
    UnmountFailed(String),
    WakeFailed(String),
    InvalidMac(String),
}

#[derive(Debug)]
pub enum StorageError {
    Exhausted(String),
    Unavailable(String),
}

#[derive(Debug)]
pub enum EngineError {
    BinaryNotFound(String),
    RepositoryMissing(String),
    InitFailed(String),
    BackupFailed(String),
    CommandFailed(String),
    ParseFailed(String),
    RestoreFailed(String),
    InvalidRestoreTarget(String),
    Cancelled,
}

/// Validation and control-flow errors produced by the orchestrator.
#[derive(Debug)]
pub enum BackupError {
    DeviceNotFound(Uuid),
    ShareNotFound(Uuid),
    ShareMismatch { share_id: Uuid, device_id: Uuid },
    ShareDisabled(String),
    NoEnabledShares(String),
    JobNotFound(Uuid),
    JobNotRetryable { job_id: Uuid, status: String },
    Cancelled,
}

#[derive(Debug)]
pub enum SchedulerError {
    InvalidCronExpression(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Config(e) => write!(f, "Configuration error: {}", e),
            AppError::Store(e) => write!(f, "Config store error: {}", e),
            AppError::Database(e) => write!(f, "Database error: {}", e),
            AppError::Credential(e) => write!(f, "Credential error: {}", e),
            AppError::Protocol(e) => write!(f, "Protocol error: {}", e),
            AppError::Storage(e) => write!(f, "Storage error: {}", e),
            AppError::Engine(e) => write!(f, "Engine error: {}", e),
            AppError::Backup(e) => write!(f, "Backup error: {}", e),
            AppError::Scheduler(e) => write!(f, "Scheduler error: {}", e),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::LoadFailed(msg) => write!(f, "Failed to load configuration: {}", msg),
            ConfigError::ParseFailed(msg) => write!(f, "Failed to parse configuration: {}", msg),
            ConfigError::ValidationFailed(msg) => {
                write!(f, "Configuration validation failed: {}", msg)
            }
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::InvalidName(msg) => write!(f, "Invalid name: {}", msg),
            StoreError::ReadFailed(msg) => write!(f, "Failed to read entry: {}", msg),
            StoreError::WriteFailed(msg) => write!(f, "Failed to write entry: {}", msg),
            StoreError::ParseFailed(msg) => write!(f, "Failed to parse entry: {}", msg),
        }
    }
}

impl fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatabaseError::ConnectionFailed(e) => write!(f, "Database connection failed: {}", e),
            DatabaseError::QueryFailed(e) => write!(f, "Database query failed: {}", e),
            DatabaseError::MigrationFailed(e) => write!(f, "Database migration failed: {}", e),
        }
    }
}

impl fmt::Display for CredentialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialError::InvalidKey(msg) => write!(f, "Invalid master key: {}", msg),
            CredentialError::EncryptFailed(msg) => write!(f, "Encryption failed: {}", msg),
            CredentialError::DecryptFailed(msg) => write!(f, "Decryption failed: {}", msg),
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::UnsupportedProtocol(name) => {
                write!(f, "No driver registered for protocol: {}", name)
            }
            ProtocolError::ConnectionFailed(msg) => write!(f, "Connection test failed: {}", msg),
            ProtocolError::MountFailed(msg) => write!(f, "Mount failed: {}", msg),
            ProtocolError::UnmountFailed(msg) => write!(f, "Unmount failed: {}", msg),
            ProtocolError::WakeFailed(msg) => write!(f, "Wake-on-LAN failed: {}", msg),
            ProtocolError::InvalidMac(mac) => write!(f, "Invalid MAC address: {}", mac),
        }
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Exhausted(msg) => write!(f, "Storage exhausted: {}", msg),
            StorageError::Unavailable(msg) => write!(f, "Storage unavailable: {}", msg),
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::BinaryNotFound(msg) => write!(f, "Engine binary not found: {}", msg),
            EngineError::RepositoryMissing(path) => write!(f, "No repository at: {}", path),
            EngineError::InitFailed(msg) => write!(f, "Repository init failed: {}", msg),
            EngineError::BackupFailed(msg) => write!(f, "Backup execution failed: {}", msg),
            EngineError::CommandFailed(msg) => write!(f, "Engine command failed: {}", msg),
            EngineError::ParseFailed(msg) => write!(f, "Failed to parse engine output: {}", msg),
            EngineError::RestoreFailed(msg) => write!(f, "Restore failed: {}", msg),
            EngineError::InvalidRestoreTarget(msg) => write!(f, "Invalid restore target: {}", msg),
            EngineError::Cancelled => write!(f, "Engine operation cancelled"),
        }
    }
}

impl fmt::Display for BackupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupError::DeviceNotFound(id) => write!(f, "Device not found: {}", id),
            BackupError::ShareNotFound(id) => write!(f, "Share not found: {}", id),
            BackupError::ShareMismatch { share_id, device_id } => {
                write!(f, "Share {} does not belong to device {}", share_id, device_id)
            }
            BackupError::ShareDisabled(name) => write!(f, "Share '{}' is disabled", name),
            BackupError::NoEnabledShares(name) => {
                write!(f, "Device '{}' has no enabled shares", name)
            }
            BackupError::JobNotFound(id) => write!(f, "Job not found: {}", id),
            BackupError::JobNotRetryable { job_id, status } => {
                write!(f, "Job {} is not retryable (status: {})", job_id, status)
            }
            BackupError::Cancelled => write!(f, "Backup cancelled by user"),
        }
    }
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerError::InvalidCronExpression(msg) => {
                write!(f, "Invalid cron expression: {}", msg)
            }
        }
    }
}

impl std::error::Error for AppError {}
impl std::error::Error for ConfigError {}
impl std::error::Error for StoreError {}
impl std::error::Error for DatabaseError {}
impl std::error::Error for CredentialError {}
impl std::error::Error for ProtocolError {}
impl std::error::Error for StorageError {}
impl std::error::Error for EngineError {}
impl std::error::Error for BackupError {}
impl std::error::Error for SchedulerError {}

impl From<ConfigError> for AppError {
    fn from(err: ConfigError) -> Self {
        AppError::Config(err)
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        AppError::Store(err)
    }
}

impl From<DatabaseError> for AppError {
    fn from(err: DatabaseError) -> Self {
        AppError::Database(err)
    }
}

impl From<CredentialError> for AppError {
    fn from(err: CredentialError) -> Self {
        AppError::Credential(err)
    }
}

impl From<ProtocolError> for AppError {
    fn from(err: ProtocolError) -> Self {
        AppError::Protocol(err)
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        AppError::Storage(err)
    }
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        AppError::Engine(err)
    }
}

impl From<BackupError> for AppError {
    fn from(err: BackupError) -> Self {
        AppError::Backup(err)
    }
}

impl From<SchedulerError> for AppError {
    fn from(err: SchedulerError) -> Self {
        AppError::Scheduler(err)
    }
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        DatabaseError::QueryFailed(err)
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Database(DatabaseError::QueryFailed(err))
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::LoadFailed(err.to_string())
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigError::ParseFailed(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
