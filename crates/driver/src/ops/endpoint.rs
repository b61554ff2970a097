use crate::device::UsbDevice;
use crate::pipes::PipeRecord;
use common::{Error, Result, Urb, UrbFunction};
use tracing::debug;

impl UsbDevice {
    /// Pipe record for an endpoint address in the current table
    pub(crate) fn pipe(&self, endpoint: u32) -> Result<PipeRecord> {
        let config = self.configuration();
        if !config.is_configured() {
            return Err(Error::DeviceNotConfigured);
        }
        let address = u8::try_from(endpoint)
            .map_err(|_| Error::InvalidParameter(format!("invalid endpoint {:#x}", endpoint)))?;
        config
            .find_pipe(address)
            .map(|(_, pipe)| pipe.clone())
            .ok_or_else(|| {
                Error::InvalidParameter(format!("no pipe for endpoint {:#04x}", address))
            })
    }

    /// Cancels every transfer pending on an endpoint
    pub async fn abort_endpoint(&self, endpoint: u32, timeout_ms: u32) -> Result<()> {
        let pipe = self.pipe(endpoint)?;
        debug!("{}: abort endpoint {:#04x}", self.name(), pipe.address);
        self.call_usbd(Urb::new(UrbFunction::AbortPipe(pipe.handle)), timeout_ms)
            .await
            .map(|_| ())
    }

    /// Clears the halt condition of an endpoint
    pub async fn reset_endpoint(&self, endpoint: u32, timeout_ms: u32) -> Result<()> {
        let pipe = self.pipe(endpoint)?;
        debug!("{}: reset endpoint {:#04x}", self.name(), pipe.address);
        self.call_usbd(Urb::new(UrbFunction::ResetPipe(pipe.handle)), timeout_ms)
            .await
            .map(|_| ())
    }
}
