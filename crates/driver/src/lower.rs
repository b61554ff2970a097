//! The device objects below this driver in the stack

use crate::pnp::PnpMinor;
use crate::power::{DeviceCapabilities, PowerRequest};
use common::UsbBus;
use protocol::NtStatus;
use std::sync::Arc;

/// A lower device object: accepts URBs and the PnP and power requests this
/// driver passes down
pub trait LowerDevice: UsbBus {
    fn forward_pnp(&self, minor: PnpMinor) -> NtStatus {
        let _ = minor;
        NtStatus::SUCCESS
    }

    fn forward_power(&self, request: PowerRequest) -> NtStatus {
        let _ = request;
        NtStatus::SUCCESS
    }

    /// Capabilities as reported by the bus driver
    fn capabilities(&self) -> DeviceCapabilities {
        DeviceCapabilities::default()
    }
}

/// The two lower objects a device can talk to
#[derive(Clone)]
pub struct DeviceStack {
    /// The device object directly below this one
    pub next: Arc<dyn LowerDevice>,
    /// The bus driver's object at the bottom of the stack
    pub physical: Arc<dyn LowerDevice>,
}

impl DeviceStack {
    /// A stack where both objects are the same bus
    pub fn direct(bus: Arc<dyn LowerDevice>) -> Self {
        Self {
            next: bus.clone(),
            physical: bus,
        }
    }
}
