use crate::error::{ProtocolError, Result};
use crate::model::{Device, Protocol, Share};
use crate::protocol::mount::{MountKey, MountTable};
use crate::protocol::{mount_point_name, probe_tcp, ProtocolDriver};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

const SSH_DEFAULT_PORT: u16 = 22;

/// Mounts remote directories over SFTP with `sshfs`; the password goes in
/// over stdin, never through argv.
pub struct SshDriver {
    mount_base: PathBuf,
    table: Arc<MountTable>,
}

impl SshDriver {
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

        let source = format!("{}@{}:{}", device.username, device.host, share.remote_path);

        debug!(source = %source, mount_point = %mount_point.display(), "Mounting SSH share");

        let mut child = match Command::new("sshfs")
            .arg(&source)
            .arg(&mount_point)
            .arg("-p")
            .arg(device.port.unwrap_or(SSH_DEFAULT_PORT).to_string())
            .arg("-o")
            .arg("password_stdin,ro,StrictHostKeyChecking=accept-new")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                let _ = tokio::fs::remove_dir(&mount_point).await;
                return Err(ProtocolError::MountFailed(format!(
                    "failed to execute sshfs: {}",
                    e
                ))
                .into());
            }
        };

        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(format!("{}\n", password).as_bytes()).await;
        }

        let output = match child.wait_with_output().await {
            Ok(output) => output,
            Err(e) => {
                let _ = tokio::fs::remove_dir(&mount_point).await;
                return Err(ProtocolError::MountFailed(e.to_string()).into());
            }
        };

        if !output.status.success() {
            let _ = tokio::fs::remove_dir(&mount_point).await;
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProtocolError::MountFailed(format!(
                "sshfs failed for {}: {}",
                source,
                stderr.trim()
            ))
            .into());
        }

        Ok(mount_point)
    }

    async fn perform_unmount(mount_path: &Path) -> Result<()> {
        let output = Command::new("fusermount")
            .arg("-u")
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
impl ProtocolDriver for SshDriver {
    fn name(&self) -> &'static str {
        "ssh"
    }

    fn supports_wol(&self) -> bool {
        true
    }

    fn requires_auth(&self) -> bool {
        true
    }

    async fn test_connection(&self, device: &Device) -> Result<()> {
        probe_tcp(&device.host, device.port.unwrap_or(SSH_DEFAULT_PORT)).await
    }

    async fn mount(&self, device: &Device, share: &Share, password: &str) -> Result<PathBuf> {
        let key = MountKey::new(&device.host, &share.remote_path);
        self.table
            .mount(key, Protocol::Ssh, || {
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
