use crate::error::{ProtocolError, Result};
use crate::model::{Device, Protocol, Share};
use crate::protocol::mount::{MountKey, MountTable};
use crate::protocol::{mount_point_name, probe_tcp, ProtocolDriver};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tracing::debug;

const RSYNC_DEFAULT_PORT: u16 = 873;

/// "Mounts" an rsync module by syncing it into a local staging directory;
/// the staging directory is the mount path handed to the engine.
pub struct RsyncDriver {
    mount_base: PathBuf,
    table: Arc<MountTable>,
}

impl RsyncDriver {
    pub fn new(mount_base: PathBuf, table: Arc<MountTable>) -> Self {
        Self { mount_base, table }
    }

    async fn perform_mount(
        &self,
        device: &Device,
        share: &Share,
        password: &str,
    ) -> Result<PathBuf> {
        let staging = self
            .mount_base
            .join(mount_point_name(&device.host, &share.remote_path));
        tokio::fs::create_dir_all(&staging)
            .await
            .map_err(|e| ProtocolError::MountFailed(format!("{}: {}", staging.display(), e)))?;

        let source = if device.username.is_empty() {
            format!(
                "rsync://{}:{}/{}/",
                device.host,
                device.port.unwrap_or(RSYNC_DEFAULT_PORT),
                share.remote_path.trim_matches('/')
            )
        } else {
            format!(
                "rsync://{}@{}:{}/{}/",
                device.username,
                device.host,
                device.port.unwrap_or(RSYNC_DEFAULT_PORT),
                share.remote_path.trim_matches('/')
            )
        };

        debug!(source = %source, staging = %staging.display(), "Syncing rsync module");

        let mut command = Command::new("rsync");
        command.arg("-a").arg(&source).arg(&staging);
        if !password.is_empty() {
            command.env("RSYNC_PASSWORD", password);
        }

        let output = match command.output().await {
            Ok(output) => output,
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&staging).await;
                return Err(ProtocolError::MountFailed(format!(
                    "failed to execute rsync: {}",
                    e
                ))
                .into());
            }
        };

        if !output.status.success() {
            let _ = tokio::fs::remove_dir_all(&staging).await;
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProtocolError::MountFailed(format!(
                "rsync failed for {}: {}",
                source,
                stderr.trim()
            ))
            .into());
        }

        Ok(staging)
    }

    async fn perform_unmount(mount_path: &Path) -> Result<()> {
        tokio::fs::remove_dir_all(mount_path)
            .await
            .map_err(|e| {
                ProtocolError::UnmountFailed(format!("{}: {}", mount_path.display(), e)).into()
            })
    }
}

#[async_trait]
impl ProtocolDriver for RsyncDriver {
    fn name(&self) -> &'static str {
        "rsync"
    }

    fn supports_wol(&self) -> bool {
        true
    }

    fn requires_auth(&self) -> bool {
        false
    }

    async fn test_connection(&self, device: &Device) -> Result<()> {
        probe_tcp(&device.host, device.port.unwrap_or(RSYNC_DEFAULT_PORT)).await
    }

    async fn mount(&self, device: &Device, share: &Share, password: &str) -> Result<PathBuf> {
        let key = MountKey::new(&device.host, &share.remote_path);
        self.table
            .mount(key, Protocol::Rsync, || {
                self.perform_mount(device, share, password)
            })
            .await
    }

    async fn unmount(&self, mount_path: &Path) -> Result<()> {
        self.table
            .release(mount_path, |path| async move {
                Self::perform_unmount(&path).await
            })
            .await
    }

    async fn teardown(&self, mount_path: &Path) -> Result<()> {
        Self::perform_unmount(mount_path).await
    }
}
