use crate::config::local::JobsConfig;
use crate::db;
use crate::error::Result;
use crate::model::{BackupJob, JobProgress, JobStatus};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Canonical message carried by every externally cancelled job.
pub const CANCELLED_MESSAGE: &str = "Backup cancelled by user";

const PROGRESS_CHANNEL_CAPACITY: usize = 256;

struct ThrottleState {
    last_percent: f64,
    last_emitted_at: Instant,
}

/// The three maps move together; one mutex keeps them consistent.
#[derive(Default)]
struct RegistryState {
    active: HashMap<Uuid, BackupJob>,
    cancel_handles: HashMap<Uuid, CancellationToken>,
    completed: HashMap<Uuid, (BackupJob, DateTime<Utc>)>,
    throttle: HashMap<Uuid, ThrottleState>,
}

impl RegistryState {
    fn sweep_expired(&mut self) {
        let now = Utc::now();
        self.completed.retain(|_, (_, expires_at)| *expires_at > now);
    }
}

/// Single source of truth for job state, cancellation and progress fan-out.
///
/// Jobs are written through to the job sink on track, cancel and
/// finalization so an external observer always sees the current row;
/// in-flight progress only touches memory and the broadcast channel.
pub struct JobRegistry {
    state: Mutex<RegistryState>,
    pool: SqlitePool,
    progress_tx: broadcast::Sender<JobProgress>,
    completed_ttl: ChronoDuration,
    percent_threshold: f64,
    broadcast_interval: Duration,
}

impl JobRegistry {
    pub fn new(pool: SqlitePool, config: &JobsConfig) -> Self {
        let (progress_tx, _) = broadcast::channel(PROGRESS_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(RegistryState::default()),
            pool,
            progress_tx,
            completed_ttl: ChronoDuration::seconds(config.completed_job_ttl_secs as i64),
            percent_threshold: config.progress_percent_threshold,
            broadcast_interval: Duration::from_millis(config.progress_broadcast_interval_ms),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobProgress> {
        self.progress_tx.subscribe()
    }

    /// Starts tracking a running job and emits its initial 0% event.
    pub async fn track(&self, job: BackupJob, cancel: CancellationToken) -> Result<()> {
        let initial = JobProgress {
            job_id: job.id,
            device_id: job.device_id,
            share_id: job.share_id,
            percent_done: 0.0,
            files_done: 0,
            bytes_done: 0,
            current_file: None,
            timestamp: Utc::now(),
        };

        {
            let mut state = self.state.lock().await;
            state.cancel_handles.insert(job.id, cancel);
            state.throttle.insert(
                job.id,
                ThrottleState {
                    last_percent: 0.0,
                    last_emitted_at: Instant::now(),
                },
            );
            state.active.insert(job.id, job.clone());
        }

        db::save_job(&self.pool, &job).await?;
        let _ = self.progress_tx.send(initial);

        info!(job_id = %job.id, device_id = %job.device_id, "Job tracked");
        Ok(())
    }

    /// Finalizes and untracks a job in one atomic step. The proposed status
    /// is applied unless an external cancel already made the job Cancelled;
    /// `completed_at` is set exactly once. The final row is written through
    /// and the job parked in the completed ring for the configured TTL.
    pub async fn untrack(
        &self,
        job_id: Uuid,
        status: JobStatus,
        error_message: Option<String>,
        backup_id: Option<String>,
    ) -> Result<Option<BackupJob>> {
        let finalized = {
            let mut state = self.state.lock().await;

            let Some(mut job) = state.active.remove(&job_id) else {
                warn!(job_id = %job_id, "Untrack for unknown job ignored");
                return Ok(None);
            };
            state.cancel_handles.remove(&job_id);
            state.throttle.remove(&job_id);

            // External cancel wins over natural finalization.
            if job.status != JobStatus::Cancelled {
                job.status = status;
                job.error_message = error_message;
            }
            if job.completed_at.is_none() {
                job.completed_at = Some(Utc::now());
            }
            if backup_id.is_some() {
                job.backup_id = backup_id;
            }

            if job.status.is_terminal() {
                let expires_at = Utc::now() + self.completed_ttl;
                state.completed.insert(job_id, (job.clone(), expires_at));
            }
            job
        };

        db::save_job(&self.pool, &finalized).await?;
        info!(job_id = %job_id, status = %finalized.status, "Job untracked");
        Ok(Some(finalized))
    }

    /// Cancels an active job: fires the token, marks the job Cancelled with
    /// the canonical message and writes through immediately. Idempotent and
    /// a no-op after natural finalization.
    pub async fn cancel(&self, job_id: Uuid) -> Result<bool> {
        let (job, token) = {
            let mut state = self.state.lock().await;

            let updated = match state.active.get_mut(&job_id) {
                None => {
                    debug!(job_id = %job_id, "Cancel for inactive job is a no-op");
                    return Ok(false);
                }
                Some(job) if job.status == JobStatus::Cancelled => return Ok(false),
                Some(job) => {
                    job.status = JobStatus::Cancelled;
                    job.completed_at = Some(Utc::now());
                    job.error_message = Some(CANCELLED_MESSAGE.to_string());
                    job.clone()
                }
            };

            (updated, state.cancel_handles.get(&job_id).cloned())
        };

        if let Some(token) = token {
            token.cancel();
        }
        db::save_job(&self.pool, &job).await?;

        info!(job_id = %job_id, "Job cancelled");
        Ok(true)
    }

    /// Active job or unexpired completed job; absent after TTL expiry.
    pub async fn get(&self, job_id: Uuid) -> Option<BackupJob> {
        let mut state = self.state.lock().await;
        state.sweep_expired();

        state
            .active
            .get(&job_id)
            .cloned()
            .or_else(|| state.completed.get(&job_id).map(|(job, _)| job.clone()))
    }

    pub async fn list(&self) -> Vec<BackupJob> {
        let mut state = self.state.lock().await;
        state.sweep_expired();

        state
            .active
            .values()
            .cloned()
            .chain(state.completed.values().map(|(job, _)| job.clone()))
            .collect()
    }

    /// Whether a fire for this target must be suppressed: a share target
    /// collides with a job on the same share or a device-level job; a
    /// device target collides with any job on the device.
    pub async fn has_active_job_for(&self, device_id: Uuid, share_id: Option<Uuid>) -> bool {
        let state = self.state.lock().await;
        state.active.values().any(|job| {
            job.device_id == device_id
                && match share_id {
                    None => true,
                    Some(share_id) => {
                        job.share_id.is_none() || job.share_id == Some(share_id)
                    }
                }
        })
    }

    /// Records the redacted command line on the running job.
    pub async fn set_command_line(&self, job_id: Uuid, command_line: String) -> Result<()> {
        let job = {
            let mut state = self.state.lock().await;
            let Some(job) = state.active.get_mut(&job_id) else {
                return Ok(());
            };
            job.command_line = Some(command_line);
            job.clone()
        };
        db::save_job(&self.pool, &job).await
    }

    /// Applies a progress event: updates the job's counters, then emits to
    /// subscribers iff it passes throttling (first event per job always
    /// emits; afterwards |Δpercent| >= threshold or Δt >= interval).
    /// Returns whether the event was emitted.
    pub async fn emit_progress(&self, progress: JobProgress) -> bool {
        let emit = {
            let mut state = self.state.lock().await;

            if let Some(job) = state.active.get_mut(&progress.job_id) {
                job.files_processed = progress.files_done;
                job.bytes_transferred = progress.bytes_done;
            }

            let now = Instant::now();
            let emit = match state.throttle.get(&progress.job_id) {
                None => true,
                Some(throttle) => {
                    (progress.percent_done - throttle.last_percent).abs()
                        >= self.percent_threshold
                        || now.duration_since(throttle.last_emitted_at)
                            >= self.broadcast_interval
                }
            };

            if emit {
                state.throttle.insert(
                    progress.job_id,
                    ThrottleState {
                        last_percent: progress.percent_done,
                        last_emitted_at: now,
                    },
                );
            }
            emit
        };

        if emit {
            let _ = self.progress_tx.send(progress);
        }
        emit
    }

    /// Cancels every active job; shutdown path.
    pub async fn cancel_all(&self) -> Result<usize> {
        let ids: Vec<Uuid> = {
            let state = self.state.lock().await;
            state.active.keys().copied().collect()
        };
        let mut cancelled = 0;
        for id in &ids {
            if self.cancel(*id).await? {
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }
}
