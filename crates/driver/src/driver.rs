//! Driver object
//!
//! Owns the registry of attached devices and the tunables and log handle
//! they share. Device ids come from a fixed pool of 255 and are reused once
//! a device has been removed.

use crate::config::{DeviceSettings, DriverSettings};
use crate::device::{UsbDevice, lock};
use crate::lower::DeviceStack;
use crate::pnp::{PnpMinor, PnpState};
use crate::power::{NullPowerManager, PowerManager};
use common::{Error, LogLevelHandle, Result};
use protocol::NtStatus;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Highest device id; the id is part of the symbolic name
pub const MAX_DEVICES: u32 = 255;

pub struct Driver {
    tunables: Arc<DriverSettings>,
    power_manager: Arc<dyn PowerManager>,
    log: LogLevelHandle,
    /// Attached devices by id
    devices: Mutex<BTreeMap<u32, Arc<UsbDevice>>>,
}

impl Driver {
    pub fn new(tunables: DriverSettings, log: LogLevelHandle) -> Self {
        Self::with_power_manager(tunables, log, Arc::new(NullPowerManager))
    }

    pub fn with_power_manager(
        tunables: DriverSettings,
        log: LogLevelHandle,
        power_manager: Arc<dyn PowerManager>,
    ) -> Self {
        Self {
            tunables: Arc::new(tunables),
            power_manager,
            log,
            devices: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn tunables(&self) -> &DriverSettings {
        &self.tunables
    }

    pub fn log_handle(&self) -> &LogLevelHandle {
        &self.log
    }

    /// Creates a device record on top of `stack`, taking the smallest free id
    pub fn add_device(&self, settings: DeviceSettings, stack: DeviceStack) -> Result<Arc<UsbDevice>> {
        let mut devices = lock(&self.devices);
        let id = (1..=MAX_DEVICES)
            .find(|id| !devices.contains_key(id))
            .ok_or_else(|| {
                Error::InsufficientResources(format!("all {} device ids in use", MAX_DEVICES))
            })?;

        let device = UsbDevice::new(
            id,
            Arc::new(settings),
            self.tunables.clone(),
            stack,
            self.power_manager.clone(),
            self.log.clone(),
        );
        devices.insert(id, device.clone());
        Ok(device)
    }

    pub fn device(&self, id: u32) -> Option<Arc<UsbDevice>> {
        lock(&self.devices).get(&id).cloned()
    }

    pub fn devices(&self) -> Vec<Arc<UsbDevice>> {
        lock(&self.devices).values().cloned().collect()
    }

    /// Runs the remove request against a device and drops it from the list
    /// once its remove lock has drained
    pub async fn remove_device(&self, id: u32) -> Result<NtStatus> {
        let device = self
            .device(id)
            .ok_or_else(|| Error::InvalidParameter(format!("no device {}", id)))?;

        let status = device.dispatch_pnp(PnpMinor::Remove).await;
        if device.pnp_state() != PnpState::Removed {
            warn!("{}: remove failed: {}", device.name(), status);
            return Ok(status);
        }
        lock(&self.devices).remove(&id);
        info!("{}: released id {}", device.name(), id);
        Ok(status)
    }
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("devices", &lock(&self.devices).len())
            .field("log", &self.log)
            .finish()
    }
}
