use backhaul::config::{Catalog, LocalConfig};
use backhaul::credentials::CredentialStore;
use backhaul::db;
use backhaul::engine::EngineClient;
use backhaul::jobs::JobRegistry;
use backhaul::logstore::LogStore;
use backhaul::model::{
    BackupJob, Device, JobStatus, JobType, Protocol, Schedule, Share,
};
use backhaul::orchestrator::Orchestrator;
use backhaul::protocol::ProtocolRegistry;
use backhaul::scheduler::Scheduler;
use backhaul::storage::{StorageMonitor, StorageThresholds};
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

struct Fixture {
    scheduler: Arc<Scheduler>,
    registry: Arc<JobRegistry>,
    catalog: Arc<Catalog>,
    credentials: Arc<CredentialStore>,
    _dir: TempDir,
}

async fn fixture() -> Fixture {
    let dir = TempDir::new().expect("Failed to create temp dir");

    let catalog =
        Arc::new(Catalog::open(dir.path().join("config")).expect("Failed to open catalog"));
    let pool = db::create_pool(&dir.path().join("jobs.db"))
        .await
        .expect("Failed to create pool");
    db::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");

    let config: LocalConfig = serde_yaml::from_str(&format!(
        "service:\n  log_file: {}\nwake:\n  wait_seconds: 1\n",
        dir.path().join("svc.log").display()
    ))
    .expect("Failed to parse config");

    let registry = Arc::new(JobRegistry::new(pool, &config.jobs));
    let credentials =
        Arc::new(CredentialStore::from_key(&[5u8; 32], 1000).expect("Failed to create store"));

    let orchestrator = Arc::new(Orchestrator::new(
        catalog.clone(),
        registry.clone(),
        Arc::new(EngineClient::with_binary(dir.path().join("missing-engine"))),
        Arc::new(ProtocolRegistry::with_defaults(dir.path().join("mnt"))),
        Arc::new(StorageMonitor::new(StorageThresholds {
            warning_percent: 99.0,
            critical_percent: 100.5,
            exhausted_percent: 101.0,
            minimum_free_bytes: 0,
        })),
        Arc::new(LogStore::open(dir.path().join("logs.ndjson")).expect("Failed to open logs")),
        credentials.clone(),
        &config,
    ));

    let scheduler = Arc::new(Scheduler::new(
        catalog.clone(),
        registry.clone(),
        orchestrator,
    ));

    Fixture {
        scheduler,
        registry,
        catalog,
        credentials,
        _dir: dir,
    }
}

fn every_five_minutes() -> Schedule {
    Schedule {
        cron: "*/5 * * * *".to_string(),
        window_start: None,
        window_end: None,
    }
}

fn create_test_device(f: &Fixture, name: &str) -> Device {
    let device = Device {
        id: Uuid::new_v4(),
        name: name.to_string(),
        protocol: Protocol::Smb,
        host: "nas.local".to_string(),
        port: None,
        username: "u".to_string(),
        password: f.credentials.encrypt("p").expect("Failed to encrypt"),
        wake_on_lan: false,
        wake_mac: None,
        schedule: None,
        retention: None,
        rules: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    f.catalog
        .save_device(&device, "add test device")
        .expect("Failed to save device");
    device
}

fn create_test_share(f: &Fixture, device: &Device, name: &str, schedule: Option<Schedule>) -> Share {
    let share = Share {
        id: Uuid::new_v4(),
        device_id: device.id,
        name: name.to_string(),
        remote_path: format!("/data/{}", name),
        enabled: true,
        schedule,
        retention: None,
        rules: None,
        repository_password: None,
        key_salt: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    f.catalog
        .save_share(device, &share, "add test share")
        .expect("Failed to save share");
    share
}

async fn scheduled_job_count(f: &Fixture) -> usize {
    db::list_jobs(f.registry.pool(), 100)
        .await
        .expect("Failed to list jobs")
        .into_iter()
        .filter(|j| j.job_type == JobType::Scheduled)
        .count()
}

#[tokio::test]
async fn test_startup_coalesces_missed_runs_into_one_catch_up() {
    let f = fixture().await;
    let device = create_test_device(&f, "nas1");
    let share = create_test_share(&f, &device, "data", Some(every_five_minutes()));

    // Seventeen minutes of downtime: three */5 instants were missed.
    let mut last = BackupJob::new(device.id, Some(share.id), JobType::Scheduled);
    last.started_at = Utc::now() - ChronoDuration::minutes(17);
    last.status = JobStatus::Completed;
    last.completed_at = Some(last.started_at + ChronoDuration::minutes(1));
    db::save_job(f.registry.pool(), &last)
        .await
        .expect("Failed to seed job history");

    f.scheduler.reconcile().await.expect("Failed to reconcile");
    f.scheduler.run_catch_up().await;

    // Exactly one catch-up job materializes, not three.
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if scheduled_job_count(&f).await >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("Catch-up job should appear");

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(scheduled_job_count(&f).await, 2);
}

#[tokio::test]
async fn test_no_catch_up_without_history() {
    let f = fixture().await;
    let device = create_test_device(&f, "nas1");
    create_test_share(&f, &device, "data", Some(every_five_minutes()));

    f.scheduler.reconcile().await.expect("Failed to reconcile");
    f.scheduler.run_catch_up().await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(scheduled_job_count(&f).await, 0);
}

#[tokio::test]
async fn test_immediate_backup_suppressed_while_target_running() {
    let f = fixture().await;
    let device = create_test_device(&f, "nas1");
    let share = create_test_share(&f, &device, "data", None);

    // Simulate a running job against the share.
    let running = BackupJob::new(device.id, Some(share.id), JobType::Manual);
    f.registry
        .track(running.clone(), CancellationToken::new())
        .await
        .expect("Failed to track");

    let launched = f
        .scheduler
        .trigger_immediate_backup(device.id, Some(share.id))
        .await
        .expect("Failed to trigger");
    assert!(!launched, "fire must be suppressed while the target runs");

    // A device-level trigger is suppressed too.
    let launched = f
        .scheduler
        .trigger_immediate_backup(device.id, None)
        .await
        .expect("Failed to trigger");
    assert!(!launched);

    f.registry
        .untrack(running.id, JobStatus::Completed, None, None)
        .await
        .expect("Failed to untrack");

    // With the target idle the manual trigger launches.
    let launched = f
        .scheduler
        .trigger_immediate_backup(device.id, Some(share.id))
        .await
        .expect("Failed to trigger");
    assert!(launched);
}

#[tokio::test]
async fn test_cancel_job_delegates_to_registry() {
    let f = fixture().await;

    let job = BackupJob::new(Uuid::new_v4(), None, JobType::Manual);
    f.registry
        .track(job.clone(), CancellationToken::new())
        .await
        .expect("Failed to track");

    assert!(f
        .scheduler
        .cancel_job(job.id)
        .await
        .expect("Failed to cancel"));
    let fetched = f.registry.get(job.id).await.expect("Job should exist");
    assert_eq!(fetched.status, JobStatus::Cancelled);
}
