pub mod mount;
pub mod rsync;
pub mod smb;
pub mod ssh;
pub mod wol;

use crate::error::{ProtocolError, Result};
use crate::model::{Device, Protocol, Share};
use async_trait::async_trait;
use mount::MountTable;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{info, warn};

const CONNECT_TIMEOUT_SECONDS: u64 = 10;

/// One transport implementation (SMB, SSH, rsync).
///
/// `mount` returns a local path the engine can read; repeated mounts of the
/// same (host, share) share one kernel mount via the mount table, and
/// `unmount` only tears down when the last user releases it.
#[async_trait]
pub trait ProtocolDriver: Send + Sync {
    fn name(&self) -> &'static str;
    fn supports_wol(&self) -> bool;
    fn requires_auth(&self) -> bool;

    async fn test_connection(&self, device: &Device) -> Result<()>;

    async fn mount(&self, device: &Device, share: &Share, password: &str) -> Result<PathBuf>;

    async fn unmount(&self, mount_path: &Path) -> Result<()>;

    /// Raw teardown ignoring reference counts; service-stop path only.
    async fn teardown(&self, mount_path: &Path) -> Result<()>;

    async fn wake(&self, device: &Device) -> Result<()> {
        if !self.supports_wol() {
            return Err(ProtocolError::WakeFailed(format!(
                "protocol '{}' does not support Wake-on-LAN",
                self.name()
            ))
            .into());
        }
        let mac = device.wake_mac.as_deref().ok_or_else(|| {
            ProtocolError::WakeFailed(format!("device '{}' has no MAC configured", device.name))
        })?;
        wol::wake(mac).await?;
        info!(device = %device.name, mac = mac, "Sent Wake-on-LAN magic packet");
        Ok(())
    }
}

/// Dispatch table from protocol tag to driver, populated at service start.
pub struct ProtocolRegistry {
    drivers: HashMap<Protocol, Arc<dyn ProtocolDriver>>,
    mount_table: Arc<MountTable>,
}

impl ProtocolRegistry {
    pub fn new(mount_table: Arc<MountTable>) -> Self {
        Self {
            drivers: HashMap::new(),
            mount_table,
        }
    }

    /// Registry with the built-in SMB, SSH and rsync drivers sharing one
    /// process-wide mount table.
    pub fn with_defaults<P: AsRef<Path>>(mount_base: P) -> Self {
        let mount_base = mount_base.as_ref().to_path_buf();
        let table = Arc::new(MountTable::new());

        let mut registry = Self::new(table.clone());
        registry.register(
            Protocol::Smb,
            Arc::new(smb::SmbDriver::new(mount_base.clone(), table.clone())),
        );
        registry.register(
            Protocol::Ssh,
            Arc::new(ssh::SshDriver::new(mount_base.clone(), table.clone())),
        );
        registry.register(
            Protocol::Rsync,
            Arc::new(rsync::RsyncDriver::new(mount_base, table)),
        );
        registry
    }

    pub fn register(&mut self, protocol: Protocol, driver: Arc<dyn ProtocolDriver>) {
        self.drivers.insert(protocol, driver);
    }

    pub fn get(&self, protocol: Protocol) -> Result<Arc<dyn ProtocolDriver>> {
        self.drivers
            .get(&protocol)
            .cloned()
            .ok_or_else(|| ProtocolError::UnsupportedProtocol(protocol.to_string()).into())
    }

    pub fn mount_table(&self) -> &Arc<MountTable> {
        &self.mount_table
    }

    /// Tears down every live mount regardless of reference counts.
    pub async fn unmount_all(&self) {
        for (protocol, path) in self.mount_table.drain().await {
            let Ok(driver) = self.get(protocol) else {
                continue;
            };
            if let Err(e) = driver.teardown(&path).await {
                warn!(path = %path.display(), "Failed to tear down mount: {}", e);
            }
        }
    }
}

/// TCP reachability probe used by the drivers' connection tests.
pub(crate) async fn probe_tcp(host: &str, port: u16) -> Result<()> {
    let attempt = tokio::time::timeout(
        Duration::from_secs(CONNECT_TIMEOUT_SECONDS),
        TcpStream::connect((host, port)),
    )
    .await;

    match attempt {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => {
            Err(ProtocolError::ConnectionFailed(format!("{}:{}: {}", host, port, e)).into())
        }
        Err(_) => Err(ProtocolError::ConnectionFailed(format!(
            "{}:{}: connection timed out",
            host, port
        ))
        .into()),
    }
}

/// Stable mount point directory name for a (host, share path) pair.
pub(crate) fn mount_point_name(host: &str, share_path: &str) -> String {
    let sanitized: String = share_path
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    format!("{}-{}", host, sanitized.trim_matches('_'))
}
