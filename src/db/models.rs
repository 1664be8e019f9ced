use crate::error::{DatabaseError, Result};
use crate::model::BackupJob;
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

/// Row shape of the `jobs` table. Identifiers and enums are stored as TEXT
/// so the table stays greppable with the sqlite CLI.
#[derive(Debug, Clone, FromRow)]
pub struct JobRecord {
    pub id: String,
    pub device_id: String,
    pub share_id: Option<String>,
    pub job_type: String,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub files_processed: i64,
    pub bytes_transferred: i64,
    pub backup_id: Option<String>,
    pub command_line: Option<String>,
}

impl JobRecord {
    pub fn from_job(job: &BackupJob) -> Self {
        Self {
            id: job.id.to_string(),
            device_id: job.device_id.to_string(),
            share_id: job.share_id.map(|id| id.to_string()),
            job_type: job.job_type.to_string(),
            status: job.status.to_string(),
            started_at: job.started_at,
            completed_at: job.completed_at,
            error_message: job.error_message.clone(),
            files_processed: job.files_processed,
            bytes_transferred: job.bytes_transferred,
            backup_id: job.backup_id.clone(),
            command_line: job.command_line.clone(),
        }
    }

    pub fn into_job(self) -> Result<BackupJob> {
        Ok(BackupJob {
            id: parse_column("id", &self.id)?,
            device_id: parse_column("device_id", &self.device_id)?,
            share_id: match &self.share_id {
                Some(id) => Some(parse_column("share_id", id)?),
                None => None,
            },
            job_type: self
                .job_type
                .parse()
                .map_err(|e: String| decode_error("job_type", e))?,
            status: self
                .status
                .parse()
                .map_err(|e: String| decode_error("status", e))?,
            started_at: self.started_at,
            completed_at: self.completed_at,
            error_message: self.error_message,
            files_processed: self.files_processed,
            bytes_transferred: self.bytes_transferred,
            backup_id: self.backup_id,
            command_line: self.command_line,
        })
    }
}

fn parse_column(column: &str, value: &str) -> Result<Uuid> {
    value
        .parse()
        .map_err(|e: uuid::Error| decode_error(column, e.to_string()))
}

fn decode_error(column: &str, message: String) -> crate::error::AppError {
    DatabaseError::QueryFailed(sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: message.into(),
    })
    .into()
}
