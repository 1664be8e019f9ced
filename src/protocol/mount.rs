use crate::error::Result;
use crate::model::Protocol;
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

/// Identity of a kernel mount: two shares pointing at the same remote
/// directory share one mount.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MountKey {
    pub host: String,
    pub share_path: String,
}

impl MountKey {
    pub fn new(host: &str, share_path: &str) -> Self {
        Self {
            host: host.to_string(),
            share_path: share_path.to_string(),
        }
    }
}

struct MountEntry {
    path: PathBuf,
    protocol: Protocol,
    refcount: usize,
}

/// Process-wide reference-counted mount table shared by all drivers.
///
/// Constructed at service start; `drain` at service stop hands every live
/// mount back for teardown. The lock is held across the actual mount and
/// unmount operations so concurrent calls for the same key cannot race.
#[derive(Default)]
pub struct MountTable {
    entries: Mutex<HashMap<MountKey, MountEntry>>,
}

impl MountTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the existing mount path for `key`, or runs `mount_fn` to
    /// create one. The new entry is only recorded when `mount_fn` succeeds.
    pub async fn mount<F, Fut>(
        &self,
        key: MountKey,
        protocol: Protocol,
        mount_fn: F,
    ) -> Result<PathBuf>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<PathBuf>>,
    {
        let mut entries = self.entries.lock().await;

        if let Some(entry) = entries.get_mut(&key) {
            entry.refcount += 1;
            debug!(
                host = %key.host,
                share = %key.share_path,
                refcount = entry.refcount,
                "Reusing existing mount"
            );
            return Ok(entry.path.clone());
        }

        let path = mount_fn().await?;
        entries.insert(
            key,
            MountEntry {
                path: path.clone(),
                protocol,
                refcount: 1,
            },
        );
        Ok(path)
    }

    /// Releases one reference to the mount at `mount_path`; the last
    /// release runs `unmount_fn` and removes the entry.
    pub async fn release<F, Fut>(&self, mount_path: &Path, unmount_fn: F) -> Result<()>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut entries = self.entries.lock().await;

        let Some(key) = entries
            .iter()
            .find(|(_, entry)| entry.path == mount_path)
            .map(|(key, _)| key.clone())
        else {
            debug!(path = %mount_path.display(), "Release of unknown mount path ignored");
            return Ok(());
        };

        let entry = entries.get_mut(&key).expect("entry exists");
        entry.refcount -= 1;
        if entry.refcount > 0 {
            debug!(
                host = %key.host,
                share = %key.share_path,
                refcount = entry.refcount,
                "Mount still referenced"
            );
            return Ok(());
        }

        let path = entries.remove(&key).expect("entry exists").path;
        unmount_fn(path).await
    }

    /// Empties the table, returning every live mount for teardown.
    pub async fn drain(&self) -> Vec<(Protocol, PathBuf)> {
        let mut entries = self.entries.lock().await;
        entries
            .drain()
            .map(|(_, entry)| (entry.protocol, entry.path))
            .collect()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    pub async fn refcount(&self, key: &MountKey) -> usize {
        self.entries
            .lock()
            .await
            .get(key)
            .map(|e| e.refcount)
            .unwrap_or(0)
    }
}
