use crate::db::models::JobRecord;
use crate::error::{DatabaseError, Result};
use crate::model::BackupJob;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

/// Opens the job sink database, creating the file on first start.
/// One connection: the service is the single writer to its state directory.
pub async fn create_pool(database_path: &Path) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(database_path)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(options)
        .await
        .map_err(DatabaseError::ConnectionFailed)?;

    Ok(pool)
}

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| DatabaseError::MigrationFailed(sqlx::Error::Migrate(Box::new(e))))?;
    Ok(())
}

/// Upserts a job row. A row that has reached `cancelled` is terminal and is
/// never overwritten by a non-cancelled status.
pub async fn save_job(pool: &SqlitePool, job: &BackupJob) -> Result<()> {
    let record = JobRecord::from_job(job);

    sqlx::query(
        r#"
        INSERT INTO jobs (
            id, device_id, share_id, job_type, status, started_at, completed_at,
            error_message, files_processed, bytes_transferred, backup_id, command_line
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        ON CONFLICT (id) DO UPDATE SET
            status = excluded.status,
            completed_at = excluded.completed_at,
            error_message = excluded.error_message,
            files_processed = excluded.files_processed,
            bytes_transferred = excluded.bytes_transferred,
            backup_id = excluded.backup_id,
            command_line = excluded.command_line
        WHERE jobs.status <> 'cancelled' OR excluded.status = 'cancelled'
        "#,
    )
    .bind(&record.id)
    .bind(&record.device_id)
    .bind(&record.share_id)
    .bind(&record.job_type)
    .bind(&record.status)
    .bind(record.started_at)
    .bind(record.completed_at)
    .bind(&record.error_message)
    .bind(record.files_processed)
    .bind(record.bytes_transferred)
    .bind(&record.backup_id)
    .bind(&record.command_line)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_job(pool: &SqlitePool, job_id: Uuid) -> Result<Option<BackupJob>> {
    let record = sqlx::query_as::<_, JobRecord>("SELECT * FROM jobs WHERE id = $1")
        .bind(job_id.to_string())
        .fetch_optional(pool)
        .await?;

    record.map(JobRecord::into_job).transpose()
}

pub async fn list_jobs(pool: &SqlitePool, limit: i64) -> Result<Vec<BackupJob>> {
    let records = sqlx::query_as::<_, JobRecord>(
        r#"
        SELECT * FROM jobs
        ORDER BY started_at DESC
        LIMIT $1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    records.into_iter().map(JobRecord::into_job).collect()
}

pub async fn delete_job(pool: &SqlitePool, job_id: Uuid) -> Result<bool> {
    let result = sqlx::query("DELETE FROM jobs WHERE id = $1")
        .bind(job_id.to_string())
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Most recent scheduled job for a target, used to coalesce misfires that
/// accumulated while the service was down.
pub async fn latest_scheduled_job(
    pool: &SqlitePool,
    device_id: Uuid,
    share_id: Option<Uuid>,
) -> Result<Option<BackupJob>> {
    let record = sqlx::query_as::<_, JobRecord>(
        r#"
        SELECT * FROM jobs
        WHERE device_id = $1
          AND (($2 IS NULL AND share_id IS NULL) OR share_id = $2)
          AND job_type = 'scheduled'
        ORDER BY started_at DESC
        LIMIT 1
        "#,
    )
    .bind(device_id.to_string())
    .bind(share_id.map(|id| id.to_string()))
    .fetch_optional(pool)
    .await?;

    record.map(JobRecord::into_job).transpose()
}
