use crate::error::{ProtocolError, Result};
use crate::model::{Device, Protocol, Share};
use crate::protocol::mount::{MountKey, MountTable};
use crate::protocol::{mount_point_name, probe_tcp, ProtocolDriver};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tracing::debug;

const SMB_DEFAULT_PORT: u16 = 445;

/// Mounts SMB shares with `mount.cifs`, passing credentials through a
/// short-lived 0600 credentials file rather than the command line.
pub struct SmbDriver {
    mount_base: PathBuf,
    table: Arc<MountTable>,
}

impl SmbDriver {
    pub fn new(mount_base: PathBuf, table: Arc<MountTable>) -> Self {
        Self { mount_base, table }
    }

    async fn perform_mount(
        &self,
        device: &Device,
        share: &Share,
        password: &str,
    ) -> Result<PathBuf> {
        let mount_point = self
            .mount_base
            .join(mount_point_name(&device.host, &share.remote_path));
        tokio::fs::create_dir_all(&mount_point)
            .await
            .map_err(|e| ProtocolError::MountFailed(format!("{}: {}", mount_point.display(), e)))?;

        let creds_path = self
            .mount_base
            .join(format!(".creds-{}", mount_point_name(&device.host, &share.remote_path)));
        let creds = format!("username={}\npassword={}\n", device.username, password);
        if let Err(e) = tokio::fs::write(&creds_path, creds).await {
            let _ = tokio::fs::remove_dir(&mount_point).await;
            return Err(ProtocolError::MountFailed(format!(
                "failed to write credentials file: {}",
                e
            ))
            .into());
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = tokio::fs::set_permissions(
                &creds_path,
                std::fs::Permissions::from_mode(0o600),
            )
            .await;
        }

        let source = format!(
            "//{}/{}",
            device.host,
            share.remote_path.trim_start_matches('/')
        );
        let options = format!(
            "credentials={},ro,port={}",
            creds_path.display(),
            device.port.unwrap_or(SMB_DEFAULT_PORT)
        );

        debug!(source = %source, mount_point = %mount_point.display(), "Mounting SMB share");

        let output = Command::new("mount")
            .arg("-t")
            .arg("cifs")
            .arg(&source)
            .arg(&mount_point)
            .arg("-o")
            .arg(&options)
            .output()
            .await;

        // cifs reads the credentials file during the mount call only.
        let _ = tokio::fs::remove_file(&creds_path).await;

        let output = match output {
            Ok(output) => output,
            Err(e) => {
                let _ = tokio::fs::remove_dir(&mount_point).await;
                return Err(ProtocolError::MountFailed(format!(
                    "failed to execute mount: {}",
                    e
                ))
                .into());
            }
        };

        if !output.status.success() {
            let _ = tokio::fs::remove_dir(&mount_point).await;
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProtocolError::MountFailed(format!(
                "mount.cifs failed for {}: {}",
                source,
                stderr.trim()
            ))
            .into());
        }

        Ok(mount_point)
    }

    async fn perform_unmount(mount_path: &Path) -> Result<()> {
        let output = Command::new("umount")
            .arg(mount_path)
            .output()
            .await
            .map_err(|e| ProtocolError::UnmountFailed(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProtocolError::UnmountFailed(format!(
                "{}: {}",
                mount_path.display(),
                stderr.trim()
            ))
            .into());
        }

        let _ = tokio::fs::remove_dir(mount_path).await;
        Ok(())
    }
}

#[async_trait]
impl ProtocolDriver for SmbDriver {
    fn name(&self) -> &'static str {
        "smb"
    }

    fn supports_wol(&self) -> bool {
        true
    }

    fn requires_auth(&self) -> bool {
        true
    }

    async fn test_connection(&self, device: &Device) -> Result<()> {
        probe_tcp(&device.host, device.port.unwrap_or(SMB_DEFAULT_PORT)).await
    }

    async fn mount(&self, device: &Device, share: &Share, password: &str) -> Result<PathBuf> {
        let key = MountKey::new(&device.host, &share.remote_path);
        self.table
            .mount(key, Protocol::Smb, || {
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
