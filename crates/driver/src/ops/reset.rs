use crate::device::UsbDevice;
use common::{Error, Result, Urb, UrbFunction};
use tracing::{info, warn};

/// Reset-type bit: reset the upstream port
pub const RESET_TYPE_RESET_PORT: u32 = 1 << 0;
/// Reset-type bit: cycle the upstream port (simulated unplug/replug)
pub const RESET_TYPE_CYCLE_PORT: u32 = 1 << 1;

impl UsbDevice {
    /// Port reset followed by a port cycle
    pub async fn reset_device(&self, timeout_ms: u32) -> Result<()> {
        self.reset_device_ex(RESET_TYPE_RESET_PORT | RESET_TYPE_CYCLE_PORT, timeout_ms)
            .await
    }

    pub async fn reset_device_ex(&self, reset_type: u32, timeout_ms: u32) -> Result<()> {
        if reset_type & (RESET_TYPE_RESET_PORT | RESET_TYPE_CYCLE_PORT) == 0 {
            return Err(Error::InvalidParameter(format!(
                "invalid reset type {:#x}",
                reset_type
            )));
        }

        if reset_type & RESET_TYPE_RESET_PORT != 0 {
            if let Err(e) = self
                .call_usbd(Urb::new(UrbFunction::ResetPort), timeout_ms)
                .await
            {
                warn!("{}: port reset failed: {}", self.name(), e);
                return Err(e);
            }
            info!("{}: port reset", self.name());
        }
        if reset_type & RESET_TYPE_CYCLE_PORT != 0 {
            if let Err(e) = self
                .call_usbd(Urb::new(UrbFunction::CyclePort), timeout_ms)
                .await
            {
                warn!("{}: port cycle failed: {}", self.name(), e);
                return Err(e);
            }
            info!("{}: port cycled", self.name());
        }
        Ok(())
    }
}
