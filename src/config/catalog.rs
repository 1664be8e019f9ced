use crate::config::store::ConfigStore;
use crate::error::{Result, StoreError};
use crate::model::{Device, Share};
use std::path::Path;
use tracing::debug;
use uuid::Uuid;

/// Devices-and-shares view over the config store.
///
/// Uniqueness of device names and of share names within a device falls out
/// of the storage layout (`devices/{name}.yaml`,
/// `shares/{device}/{name}.yaml`). Cancelling jobs and removing repositories
/// on delete is the caller's concern; the catalog only mutates configuration.
pub struct Catalog {
    store: ConfigStore,
}

impl Catalog {
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        Ok(Self {
            store: ConfigStore::open(root)?,
        })
    }

    pub fn list_devices(&self) -> Result<Vec<Device>> {
        let mut devices = Vec::new();
        for name in self.store.list(&["devices"])? {
            if let Some(device) = self.store.get::<Device>(&["devices", &name])? {
                devices.push(device);
            }
        }
        Ok(devices)
    }

    pub fn get_device(&self, id: Uuid) -> Result<Option<Device>> {
        Ok(self.list_devices()?.into_iter().find(|d| d.id == id))
    }

    pub fn get_device_by_name(&self, name: &str) -> Result<Option<Device>> {
        self.store.get(&["devices", name])
    }

    pub fn save_device(&self, device: &Device, message: &str) -> Result<()> {
        if let Some(existing) = self.get_device_by_name(&device.name)? {
            if existing.id != device.id {
                return Err(StoreError::InvalidName(format!(
                    "device name '{}' is already taken",
                    device.name
                ))
                .into());
            }
        }
        self.store.put(&["devices", &device.name], device, message)
    }

    /// Removes the device and all of its shares from configuration.
    pub fn delete_device(&self, id: Uuid) -> Result<Option<Device>> {
        let Some(device) = self.get_device(id)? else {
            return Ok(None);
        };

        self.store.delete_tree(
            &["shares", &device.name],
            &format!("cascade delete shares of device '{}'", device.name),
        )?;
        self.store.delete(
            &["devices", &device.name],
            &format!("delete device '{}'", device.name),
        )?;
        debug!(device_id = %id, device_name = %device.name, "Device deleted from catalog");
        Ok(Some(device))
    }

    pub fn list_shares(&self, device: &Device) -> Result<Vec<Share>> {
        let mut shares = Vec::new();
        for name in self.store.list(&["shares", &device.name])? {
            if let Some(share) = self.store.get::<Share>(&["shares", &device.name, &name])? {
                shares.push(share);
            }
        }
        Ok(shares)
    }

    pub fn enabled_shares(&self, device: &Device) -> Result<Vec<Share>> {
        Ok(self
            .list_shares(device)?
            .into_iter()
            .filter(|s| s.enabled)
            .collect())
    }

    pub fn get_share(&self, id: Uuid) -> Result<Option<(Device, Share)>> {
        for device in self.list_devices()? {
            for share in self.list_shares(&device)? {
                if share.id == id {
                    return Ok(Some((device, share)));
                }
            }
        }
        Ok(None)
    }

    pub fn save_share(&self, device: &Device, share: &Share, message: &str) -> Result<()> {
        if share.device_id != device.id {
            return Err(StoreError::InvalidName(format!(
                "share '{}' does not belong to device '{}'",
                share.name, device.name
            ))
            .into());
        }
        self.store
            .put(&["shares", &device.name, &share.name], share, message)
    }

    pub fn delete_share(&self, id: Uuid) -> Result<Option<(Device, Share)>> {
        let Some((device, share)) = self.get_share(id)? else {
            return Ok(None);
        };
        self.store.delete(
            &["shares", &device.name, &share.name],
            &format!("delete share '{}/{}'", device.name, share.name),
        )?;
        Ok(Some((device, share)))
    }

}
