//! A real USB device on this machine as the lower bus
//!
//! rusb calls block, so the device handle lives on a dedicated thread and
//! URBs reach it through the bus bridge. The driver side never blocks.

mod transfers;
mod worker;

pub use transfers::{HostPipe, POLL_INTERVAL, map_rusb_error};
pub use worker::HostWorker;

use crate::lower::LowerDevice;
use anyhow::{Context as _, Result, anyhow};
use common::{BusBridge, Submission, UsbBus, create_bus_bridge};
use rusb::{Context, UsbContext};
use std::fmt;
use std::sync::Mutex;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// A USB device visible to the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostDeviceInfo {
    pub bus_number: u8,
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub class: u8,
    pub num_configurations: u8,
}

impl fmt::Display for HostDeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Bus {:03} Device {:03}: ID {:04x}:{:04x} class {:#04x} ({} configuration{})",
            self.bus_number,
            self.address,
            self.vendor_id,
            self.product_id,
            self.class,
            self.num_configurations,
            if self.num_configurations == 1 { "" } else { "s" }
        )
    }
}

/// Lists the devices libusb can see. Devices whose descriptor cannot be
/// read are skipped.
pub fn list_devices() -> Result<Vec<HostDeviceInfo>> {
    let context = Context::new().context("Failed to create USB context")?;
    let devices = context.devices().context("Failed to enumerate USB devices")?;

    let mut found = Vec::new();
    for device in devices.iter() {
        match device.device_descriptor() {
            Ok(desc) => found.push(HostDeviceInfo {
                bus_number: device.bus_number(),
                address: device.address(),
                vendor_id: desc.vendor_id(),
                product_id: desc.product_id(),
                class: desc.class_code(),
                num_configurations: desc.num_configurations(),
            }),
            Err(e) => warn!(
                "Skipping device {}:{}: {}",
                device.bus_number(),
                device.address(),
                e
            ),
        }
    }
    Ok(found)
}

/// Lower bus backed by an opened host device
pub struct HostBus {
    bridge: BusBridge,
    name: String,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl HostBus {
    /// Opens the first device matching `vendor_id:product_id` and starts its
    /// bus thread
    pub fn open(vendor_id: u16, product_id: u16) -> Result<Self> {
        let context = Context::new().context("Failed to create USB context")?;
        let mut handle = context
            .open_device_with_vid_pid(vendor_id, product_id)
            .ok_or_else(|| anyhow!("No accessible device {:04x}:{:04x}", vendor_id, product_id))?;
        if let Err(e) = handle.set_auto_detach_kernel_driver(false) {
            // Not supported on every platform; the worker detaches per interface
            debug!("Auto-detach unavailable: {}", e);
        }

        let name = format!("host-{:04x}:{:04x}", vendor_id, product_id);
        let (bridge, bus_worker) = create_bus_bridge();
        let worker = HostWorker::new(handle, bus_worker);
        let thread = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker.run())
            .context("Failed to spawn host bus thread")?;

        info!("Opened host device {:04x}:{:04x}", vendor_id, product_id);
        Ok(Self {
            bridge,
            name,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Stops the bus thread and waits for it to release the device
    pub async fn shutdown(&self) -> Result<()> {
        self.bridge
            .shutdown()
            .await
            .context("Host bus thread already gone")?;
        let thread = crate::device::lock(&self.thread).take();
        if let Some(thread) = thread {
            tokio::task::spawn_blocking(move || thread.join())
                .await
                .context("Join task failed")?
                .map_err(|_| anyhow!("Host bus thread panicked"))?;
        }
        Ok(())
    }
}

impl UsbBus for HostBus {
    fn submit(&self, submission: Submission) {
        self.bridge.submit(submission);
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl LowerDevice for HostBus {}

impl fmt::Debug for HostBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBus").field("name", &self.name).finish()
    }
}
