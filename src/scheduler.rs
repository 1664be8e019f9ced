pub mod missed;
pub mod triggers;

use crate::config::Catalog;
use crate::db;
use crate::error::Result;
use crate::jobs::JobRegistry;
use crate::model::{Device, JobType, Schedule, Share};
use crate::orchestrator::Orchestrator;
use chrono::Utc;
use missed::needs_catch_up;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use triggers::{next_run_after, Trigger, TriggerKey};
use uuid::Uuid;

/// Seconds-resolution cron needs a sub-minute tick.
const SCHEDULER_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Turns declarative schedules into timely orchestrator calls.
///
/// The trigger set is derived from configuration: `reconcile` diffs the
/// installed triggers against devices and shares, share-schedule winning
/// over the device fallback. Triggers need no persistence of their own;
/// startup reconstructs them and coalesces any downtime misfires into at
/// most one catch-up run per target.
pub struct Scheduler {
    catalog: Arc<Catalog>,
    registry: Arc<JobRegistry>,
    orchestrator: Arc<Orchestrator>,
    triggers: Mutex<HashMap<TriggerKey, Trigger>>,
}

impl Scheduler {
    pub fn new(
        catalog: Arc<Catalog>,
        registry: Arc<JobRegistry>,
        orchestrator: Arc<Orchestrator>,
    ) -> Self {
        Self {
            catalog,
            registry,
            orchestrator,
            triggers: Mutex::new(HashMap::new()),
        }
    }

    /// Reconciles, coalesces misfires, then ticks until shutdown.
    pub async fn start(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        info!("Scheduler started");

        self.reconcile().await?;
        self.run_catch_up().await;

        let mut tick = interval(SCHEDULER_TICK_INTERVAL);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.check_triggers().await {
                        error!("Error checking triggers: {}", e);
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }

        info!("Scheduler stopped");
        Ok(())
    }

    /// Installs (or replaces) the share-level trigger for a share.
    pub async fn schedule_share_backup(
        &self,
        device: &Device,
        share: &Share,
        schedule: &Schedule,
    ) -> Result<()> {
        let trigger = Trigger::new(
            TriggerKey::Share(share.id),
            device.id,
            Some(share.id),
            schedule.clone(),
            Utc::now(),
        )?;
        self.triggers
            .lock()
            .await
            .insert(TriggerKey::Share(share.id), trigger);
        info!(device = %device.name, share = %share.name, "Share trigger scheduled");
        Ok(())
    }

    /// Installs (or replaces) the device-level fallback trigger.
    pub async fn schedule_device_backup(
        &self,
        device: &Device,
        schedule: &Schedule,
    ) -> Result<()> {
        let trigger = Trigger::new(
            TriggerKey::Device(device.id),
            device.id,
            None,
            schedule.clone(),
            Utc::now(),
        )?;
        self.triggers
            .lock()
            .await
            .insert(TriggerKey::Device(device.id), trigger);
        info!(device = %device.name, "Device trigger scheduled");
        Ok(())
    }

    pub async fn unschedule_share_backup(&self, share_id: Uuid) {
        self.triggers
            .lock()
            .await
            .remove(&TriggerKey::Share(share_id));
    }

    pub async fn unschedule_device_backup(&self, device_id: Uuid) {
        self.triggers
            .lock()
            .await
            .remove(&TriggerKey::Device(device_id));
    }

    /// Diffs desired triggers (from configuration) against the installed
    /// set. Afterwards the set exactly mirrors enabled configuration; an
    /// unchanged trigger keeps its computed next-run instant.
    pub async fn reconcile(&self) -> Result<()> {
        let mut desired: HashMap<TriggerKey, (Uuid, Option<Uuid>, Schedule)> = HashMap::new();

        for device in self.catalog.list_devices()? {
            let shares = self.catalog.list_shares(&device)?;
            let mut fallback_needed = false;

            for share in shares.iter().filter(|s| s.enabled) {
                if let Some(schedule) = &share.schedule {
                    desired.insert(
                        TriggerKey::Share(share.id),
                        (device.id, Some(share.id), schedule.clone()),
                    );
                    if device.schedule.is_some() {
                        info!(
                            device = %device.name,
                            share = %share.name,
                            "Share covered by its own schedule; device fallback does not apply"
                        );
                    }
                } else if device.schedule.is_some() {
                    fallback_needed = true;
                }
            }

            if fallback_needed {
                if let Some(schedule) = &device.schedule {
                    desired.insert(
                        TriggerKey::Device(device.id),
                        (device.id, None, schedule.clone()),
                    );
                }
            }
        }

        let now = Utc::now();
        let mut triggers = self.triggers.lock().await;

        let stale: Vec<TriggerKey> = triggers
            .keys()
            .filter(|key| !desired.contains_key(key))
            .copied()
            .collect();
        for key in stale {
            triggers.remove(&key);
            info!(?key, "Trigger removed during reconcile");
        }

        for (key, (device_id, share_id, schedule)) in desired {
            match triggers.get(&key) {
                Some(existing) if existing.schedule == schedule => {}
                _ => {
                    let trigger = Trigger::new(key, device_id, share_id, schedule, now)?;
                    info!(?key, next_run = ?trigger.next_run, "Trigger installed during reconcile");
                    triggers.insert(key, trigger);
                }
            }
        }

        info!(count = triggers.len(), "Reconcile complete");
        Ok(())
    }

    /// Bypasses the schedule and launches a Manual job now. Returns false
    /// when a job for the target is already running.
    pub async fn trigger_immediate_backup(
        &self,
        device_id: Uuid,
        share_id: Option<Uuid>,
    ) -> Result<bool> {
        if self.registry.has_active_job_for(device_id, share_id).await {
            info!(
                device_id = %device_id,
                share_id = ?share_id,
                reason = "AlreadyRunning",
                "Immediate backup suppressed"
            );
            return Ok(false);
        }

        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            let result = match share_id {
                Some(share_id) => {
                    orchestrator
                        .execute_share_backup(device_id, share_id, JobType::Manual)
                        .await
                }
                None => {
                    orchestrator
                        .execute_device_backup(device_id, JobType::Manual)
                        .await
                }
            };
            if let Err(e) = result {
                error!(device_id = %device_id, "Manual backup failed: {}", e);
            }
        });
        Ok(true)
    }

    pub async fn cancel_job(&self, job_id: Uuid) -> Result<bool> {
        self.registry.cancel(job_id).await
    }

    pub async fn trigger_count(&self) -> usize {
        self.triggers.lock().await.len()
    }

    pub async fn installed_keys(&self) -> Vec<TriggerKey> {
        self.triggers.lock().await.keys().copied().collect()
    }

    async fn check_triggers(&self) -> Result<()> {
        let now = Utc::now();

        let due: Vec<Trigger> = {
            let mut triggers = self.triggers.lock().await;
            let mut due = Vec::new();
            for trigger in triggers.values_mut() {
                if trigger.is_due(now) {
                    due.push(trigger.clone());
                    trigger.next_run = next_run_after(&trigger.schedule, now)?;
                }
            }
            due
        };

        for trigger in due {
            debug!(key = ?trigger.key, "Trigger due, firing");
            self.fire(&trigger).await;
        }

        Ok(())
    }

    /// One atomic enqueue per fire; concurrent fires for the same target
    /// are suppressed with an AlreadyRunning skip.
    async fn fire(&self, trigger: &Trigger) {
        if self
            .registry
            .has_active_job_for(trigger.device_id, trigger.share_id)
            .await
        {
            info!(
                key = ?trigger.key,
                reason = "AlreadyRunning",
                "Fire suppressed"
            );
            return;
        }

        match trigger.key {
            TriggerKey::Share(share_id) => {
                let orchestrator = self.orchestrator.clone();
                let device_id = trigger.device_id;
                tokio::spawn(async move {
                    if let Err(e) = orchestrator
                        .execute_share_backup(device_id, share_id, JobType::Scheduled)
                        .await
                    {
                        error!(share_id = %share_id, "Scheduled backup failed: {}", e);
                    }
                });
            }
            TriggerKey::Device(device_id) => {
                self.fire_device_trigger(device_id).await;
            }
        }
    }

    /// A device trigger only covers enabled shares without a schedule of
    /// their own. When that is every enabled share, one device-level job
    /// runs; otherwise the uncovered shares run sequentially as share jobs.
    async fn fire_device_trigger(&self, device_id: Uuid) {
        let uncovered = match self.uncovered_shares(device_id) {
            Ok(Some(uncovered)) => uncovered,
            Ok(None) => {
                debug!(device_id = %device_id, "Stale device trigger skipped");
                return;
            }
            Err(e) => {
                error!(device_id = %device_id, "Failed to resolve device trigger: {}", e);
                return;
            }
        };

        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            match uncovered {
                DeviceFire::WholeDevice => {
                    if let Err(e) = orchestrator
                        .execute_device_backup(device_id, JobType::Scheduled)
                        .await
                    {
                        error!(device_id = %device_id, "Scheduled device backup failed: {}", e);
                    }
                }
                DeviceFire::Shares(share_ids) => {
                    for share_id in share_ids {
                        if let Err(e) = orchestrator
                            .execute_share_backup(device_id, share_id, JobType::Scheduled)
                            .await
                        {
                            error!(share_id = %share_id, "Scheduled backup failed: {}", e);
                        }
                    }
                }
            }
        });
    }

    fn uncovered_shares(&self, device_id: Uuid) -> Result<Option<DeviceFire>> {
        let Some(device) = self.catalog.get_device(device_id)? else {
            return Ok(None);
        };
        let enabled = self.catalog.enabled_shares(&device)?;
        if enabled.is_empty() {
            return Ok(None);
        }

        let uncovered: Vec<Uuid> = enabled
            .iter()
            .filter(|share| share.schedule.is_none())
            .map(|share| share.id)
            .collect();

        if uncovered.is_empty() {
            Ok(None)
        } else if uncovered.len() == enabled.len() {
            Ok(Some(DeviceFire::WholeDevice))
        } else {
            Ok(Some(DeviceFire::Shares(uncovered)))
        }
    }

    /// At most one catch-up run per target for fires missed during
    /// downtime, keyed off the job sink's last scheduled run per target.
    /// Runs once at startup, after the initial reconcile.
    pub async fn run_catch_up(&self) {
        let snapshot: Vec<Trigger> = {
            let triggers = self.triggers.lock().await;
            triggers.values().cloned().collect()
        };
        let now = Utc::now();

        for trigger in snapshot {
            let last_run = match db::latest_scheduled_job(
                self.registry.pool(),
                trigger.device_id,
                trigger.share_id,
            )
            .await
            {
                Ok(job) => job.map(|j| j.started_at),
                Err(e) => {
                    warn!(key = ?trigger.key, "Failed to read job history: {}", e);
                    continue;
                }
            };

            match needs_catch_up(&trigger.schedule, trigger.device_id, last_run, now) {
                Ok(true) => {
                    info!(key = ?trigger.key, "Launching coalesced catch-up run");
                    self.fire(&trigger).await;
                }
                Ok(false) => {}
                Err(e) => warn!(key = ?trigger.key, "Catch-up evaluation failed: {}", e),
            }
        }
    }
}

enum DeviceFire {
    WholeDevice,
    Shares(Vec<Uuid>),
}
