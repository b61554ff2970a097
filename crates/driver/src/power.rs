//! Power state handling
//!
//! Device power transitions are orthogonal to the PnP state. Lowering power
//! is applied and reported before the request goes down the stack; raising
//! it is applied only once the lower stack has accepted it. System power
//! requests are passed down and, when this device may own power policy,
//! followed by a self-initiated device request for the mapped D-state.

use crate::device::{UsbDevice, lock};
use protocol::NtStatus;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum DevicePowerState {
    #[default]
    D0,
    D1,
    D2,
    D3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum SystemPowerState {
    #[default]
    Working,
    Sleeping1,
    Sleeping2,
    Sleeping3,
    Hibernate,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerRequest {
    QueryDevice(DevicePowerState),
    QuerySystem(SystemPowerState),
    SetDevice(DevicePowerState),
    SetSystem(SystemPowerState),
}

/// Capabilities reported by the bus driver for a device
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceCapabilities {
    pub surprise_removal_ok: bool,
    /// Deepest device state usable in each system state
    pub device_state: HashMap<SystemPowerState, DevicePowerState>,
}

impl DeviceCapabilities {
    pub fn device_state_for(&self, system: SystemPowerState) -> DevicePowerState {
        self.device_state.get(&system).copied().unwrap_or(match system {
            SystemPowerState::Working => DevicePowerState::D0,
            _ => DevicePowerState::D3,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PowerState {
    pub system: SystemPowerState,
    pub device: DevicePowerState,
}

/// The platform power subsystem; told about every device state change
pub trait PowerManager: Send + Sync {
    fn set_power_state(&self, device_id: u32, state: DevicePowerState);
}

#[derive(Debug, Default)]
pub struct NullPowerManager;

impl PowerManager for NullPowerManager {
    fn set_power_state(&self, _device_id: u32, _state: DevicePowerState) {}
}

/// Keeps every reported state change in order
#[derive(Debug, Default)]
pub struct RecordingPowerManager {
    events: Mutex<Vec<(u32, DevicePowerState)>>,
}

impl RecordingPowerManager {
    pub fn events(&self) -> Vec<(u32, DevicePowerState)> {
        lock(&self.events).clone()
    }
}

impl PowerManager for RecordingPowerManager {
    fn set_power_state(&self, device_id: u32, state: DevicePowerState) {
        lock(&self.events).push((device_id, state));
    }
}

impl UsbDevice {
    pub fn power_state(&self) -> PowerState {
        *lock(&self.power)
    }

    /// Handles a power request sent to this device
    pub fn dispatch_power(&self, request: PowerRequest) -> NtStatus {
        let _guard = match self.acquire() {
            Ok(guard) => guard,
            Err(e) => return e.nt_status(),
        };

        match request {
            PowerRequest::SetDevice(state) => self.set_device_power(state),
            PowerRequest::SetSystem(state) => self.set_system_power(state),
            PowerRequest::QueryDevice(_) | PowerRequest::QuerySystem(_) => {
                debug!("{}: {:?}", self.name(), request);
                self.next_device().forward_power(request)
            }
        }
    }

    fn set_device_power(&self, state: DevicePowerState) -> NtStatus {
        let current = lock(&self.power).device;
        if state == current {
            return self.next_device().forward_power(PowerRequest::SetDevice(state));
        }

        if state > current {
            // Lower power: apply first, then pass down.
            lock(&self.power).device = state;
            self.power_manager.set_power_state(self.id(), state);
            debug!("{}: power down {:?} -> {:?}", self.name(), current, state);
            return self.next_device().forward_power(PowerRequest::SetDevice(state));
        }

        let status = self.next_device().forward_power(PowerRequest::SetDevice(state));
        if status.is_success() {
            lock(&self.power).device = state;
            self.power_manager.set_power_state(self.id(), state);
            debug!("{}: power up {:?} -> {:?}", self.name(), current, state);
        } else {
            warn!("{}: power up to {:?} failed: {}", self.name(), state, status);
        }
        status
    }

    fn set_system_power(&self, state: SystemPowerState) -> NtStatus {
        let status = self.next_device().forward_power(PowerRequest::SetSystem(state));
        if !status.is_success() {
            return status;
        }
        lock(&self.power).system = state;
        info!("{}: system power {:?}", self.name(), state);

        if self.settings.may_own_power_policy() {
            let target = lock(&self.capabilities).device_state_for(state);
            self.set_device_power(target);
        } else {
            debug!(
                "{}: not power policy owner, no device request for {:?}",
                self.name(),
                state
            );
        }
        status
    }

    /// Brings the device to D0 on start
    pub(crate) fn power_up(&self) {
        if self.set_device_power(DevicePowerState::D0) != NtStatus::SUCCESS {
            warn!("{}: could not enter D0", self.name());
        }
    }
}
