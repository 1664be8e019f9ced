use crate::config::local::StorageConfig;
use crate::error::{Result, StorageError};
use crate::model::{StorageStatus, ThresholdLevel};
use std::path::{Path, PathBuf};
use sysinfo::Disks;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct StorageThresholds {
    pub warning_percent: f64,
    pub critical_percent: f64,
    pub exhausted_percent: f64,
    pub minimum_free_bytes: u64,
}

impl From<&StorageConfig> for StorageThresholds {
    fn from(config: &StorageConfig) -> Self {
        Self {
            warning_percent: config.warning_percent,
            critical_percent: config.critical_percent,
            exhausted_percent: config.exhausted_percent,
            minimum_free_bytes: config.minimum_free_bytes,
        }
    }
}

/// Maps a filesystem path to the capacity of the volume containing it.
pub struct StorageMonitor {
    thresholds: StorageThresholds,
}

impl StorageMonitor {
    pub fn new(thresholds: StorageThresholds) -> Self {
        Self { thresholds }
    }

    /// Capacity status of the volume containing `path`. The path itself may
    /// not exist yet (repositories are created lazily); the nearest existing
    /// ancestor anchors the lookup.
    pub fn status_for(&self, path: &Path) -> Result<StorageStatus> {
        let anchor = nearest_existing_ancestor(path);
        let anchor = std::fs::canonicalize(&anchor).unwrap_or(anchor);

        let disks = Disks::new_with_refreshed_list();
        let disk = disks
            .list()
            .iter()
            .filter(|disk| anchor.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .ok_or_else(|| {
                StorageError::Unavailable(format!(
                    "no volume found containing {}",
                    path.display()
                ))
            })?;

        let total = disk.total_space();
        let available = disk.available_space();
        debug!(
            path = %path.display(),
            volume = %disk.mount_point().display(),
            total_bytes = total,
            available_bytes = available,
            "Resolved storage volume"
        );

        Ok(self.evaluate(path, total, available))
    }

    /// True iff the volume can take `estimated_bytes` and still keep the
    /// configured minimum free space, and is not already exhausted.
    pub fn has_sufficient_space(&self, path: &Path, estimated_bytes: u64) -> Result<bool> {
        let status = self.status_for(path)?;
        Ok(status.level != ThresholdLevel::Exhausted
            && status.available_bytes >= estimated_bytes + self.thresholds.minimum_free_bytes)
    }

    fn evaluate(&self, path: &Path, total_bytes: u64, available_bytes: u64) -> StorageStatus {
        let used_bytes = total_bytes.saturating_sub(available_bytes);
        let used_percentage = if total_bytes == 0 {
            100.0
        } else {
            used_bytes as f64 / total_bytes as f64 * 100.0
        };

        let level = if used_percentage >= self.thresholds.exhausted_percent {
            ThresholdLevel::Exhausted
        } else if used_percentage >= self.thresholds.critical_percent {
            ThresholdLevel::Critical
        } else if used_percentage >= self.thresholds.warning_percent {
            ThresholdLevel::Warning
        } else {
            ThresholdLevel::Normal
        };

        let message = match level {
            ThresholdLevel::Normal => format!("Storage usage at {:.1}%", used_percentage),
            ThresholdLevel::Warning => {
                format!("Storage usage at {:.1}% - approaching capacity", used_percentage)
            }
            ThresholdLevel::Critical => format!(
                "Storage usage at {:.1}% - backups may fail soon",
                used_percentage
            ),
            ThresholdLevel::Exhausted => format!(
                "Storage usage at {:.1}% - no further backups can be stored",
                used_percentage
            ),
        };

        StorageStatus {
            path: path.display().to_string(),
            total_bytes,
            used_bytes,
            available_bytes,
            used_percentage,
            level,
            message,
        }
    }
}

fn nearest_existing_ancestor(path: &Path) -> PathBuf {
    let mut current = path.to_path_buf();
    while !current.exists() {
        match current.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => current = parent.to_path_buf(),
            _ => return PathBuf::from("."),
        }
    }
    current
}
