use backhaul::config::{Catalog, LocalConfig};
use backhaul::credentials::CredentialStore;
use backhaul::db;
use backhaul::engine::EngineClient;
use backhaul::error::{self, ConfigError};
use backhaul::jobs::JobRegistry;
use backhaul::logstore::LogStore;
use backhaul::model::JobType;
use backhaul::orchestrator::Orchestrator;
use backhaul::protocol::ProtocolRegistry;
use backhaul::scheduler::Scheduler;
use backhaul::storage::{StorageMonitor, StorageThresholds};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "backhaul")]
#[command(about = "Backup orchestration service for a fleet of networked devices", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Run one device-level backup and exit.
    #[arg(long, value_name = "DEVICE_ID")]
    backup_device: Option<Uuid>,

    /// Run one share-level backup and exit.
    #[arg(long, value_name = "SHARE_ID")]
    backup_share: Option<Uuid>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = run(args).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> error::Result<()> {
    let config = LocalConfig::from_file(&args.config)?;

    setup_logging(&config)?;

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    info!("========================================");
    info!("  backhaul - Backup Orchestration");
    info!("========================================");
    info!("Hostname: {}", hostname);
    info!("Config store: {}", config.service.config_root.display());
    info!("Job database: {}", config.service.database_path.display());
    info!("Engine binary: {}", config.engine.binary_path);
    info!(
        "Repository base: {}",
        config.engine.repository_base_path.display()
    );
    info!("Restore root: {}", config.restore.root.display());
    info!("========================================");

    for dir in [
        &config.engine.repository_base_path,
        &config.restore.root,
        &config.service.mount_base,
    ] {
        std::fs::create_dir_all(dir).map_err(|e| {
            ConfigError::ValidationFailed(format!("cannot create {}: {}", dir.display(), e))
        })?;
    }

    info!("Opening job database...");
    let pool = db::create_pool(&config.service.database_path).await?;
    db::run_migrations(&pool).await?;
    debug!("Database migrations completed");

    info!("Loading configuration catalog...");
    let catalog = Arc::new(Catalog::open(&config.service.config_root)?);
    let devices = catalog.list_devices()?;
    debug!("Loaded {} devices", devices.len());

    let credentials = Arc::new(CredentialStore::open(
        &config.security.master_key_file,
        config.security.pbkdf2_iterations,
    )?);
    let logs = Arc::new(LogStore::open(&config.service.backup_log_path)?);
    let storage = Arc::new(StorageMonitor::new(StorageThresholds::from(&config.storage)));
    let protocols = Arc::new(ProtocolRegistry::with_defaults(&config.service.mount_base));
    let engine = Arc::new(EngineClient::new(&config.engine.binary_path)?);
    let registry = Arc::new(JobRegistry::new(pool, &config.jobs));

    let orchestrator = Arc::new(Orchestrator::new(
        catalog.clone(),
        registry.clone(),
        engine,
        protocols.clone(),
        storage,
        logs,
        credentials,
        &config,
    ));

    if args.backup_share.is_some() || args.backup_device.is_some() {
        let result = run_one_shot(&args, &catalog, &orchestrator).await;
        protocols.unmount_all().await;
        return result;
    }

    info!("========================================");
    info!("Starting scheduler");
    info!("========================================");

    let scheduler = Arc::new(Scheduler::new(
        catalog,
        registry.clone(),
        orchestrator,
    ));
    let shutdown = CancellationToken::new();

    let scheduler_handle = {
        let scheduler = scheduler.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = scheduler.start(shutdown).await {
                error!("Scheduler error: {}", e);
            }
        })
    };

    tokio::select! {
        _ = scheduler_handle => {
            info!("Scheduler task completed");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutting down...");
    shutdown.cancel();
    match registry.cancel_all().await {
        Ok(cancelled) if cancelled > 0 => info!("Cancelled {} running jobs", cancelled),
        Ok(_) => {}
        Err(e) => error!("Failed to cancel running jobs: {}", e),
    }
    protocols.unmount_all().await;
    info!("Shutdown complete");
    Ok(())
}

async fn run_one_shot(
    args: &Args,
    catalog: &Catalog,
    orchestrator: &Orchestrator,
) -> error::Result<()> {
    info!("========================================");
    info!("One-shot Backup Mode");
    info!("========================================");

    let job = if let Some(share_id) = args.backup_share {
        let (device, share) = catalog.get_share(share_id)?.ok_or_else(|| {
            ConfigError::ValidationFailed(format!("share {} not found", share_id))
        })?;
        info!("Target: {}/{}", device.name, share.name);
        orchestrator
            .execute_share_backup(device.id, share.id, JobType::Manual)
            .await?
    } else {
        let device_id = args.backup_device.ok_or_else(|| {
            ConfigError::ValidationFailed("--backup-device or --backup-share required".to_string())
        })?;
        orchestrator
            .execute_device_backup(device_id, JobType::Manual)
            .await?
    };

    info!("========================================");
    info!("Backup Results");
    info!("========================================");
    info!("Job ID: {}", job.id);
    info!("Status: {}", job.status);
    info!("Files processed: {}", job.files_processed);
    info!(
        "Data transferred: {} MB",
        job.bytes_transferred / 1024 / 1024
    );
    info!("Snapshot ID: {}", job.backup_id.as_deref().unwrap_or("-"));
    if let Some(message) = &job.error_message {
        info!("Errors: {}", message);
    }
    info!("========================================");

    Ok(())
}

fn setup_logging(config: &LocalConfig) -> error::Result<()> {
    let file_appender = tracing_appender::rolling::daily(
        std::path::Path::new(&config.service.log_file)
            .parent()
            .expect("Log file must have a parent directory"),
        std::path::Path::new(&config.service.log_file)
            .file_name()
            .expect("Log file must have a filename"),
    );

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|e| ConfigError::ValidationFailed(format!("Invalid log filter: {}", e)))?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(file_appender))
        .with(fmt::layer().with_writer(std::io::stdout))
        .init();

    Ok(())
}
