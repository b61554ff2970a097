use super::setup;
use crate::device::UsbDevice;
use common::{Error, Mdl, Result};
use protocol::{Direction, Recipient, RequestKind, VendorParams};
use tracing::debug;

impl UsbDevice {
    /// Vendor or class control request. The timeout is not clamped; zero
    /// waits indefinitely.
    ///
    /// Vendor requests with a recipient outside the standard four are sent
    /// with the value in the reserved recipient bits of bmRequestType.
    /// Returns the bytes received for reads and 0 for writes.
    pub async fn vendor_class_request(
        &self,
        params: &VendorParams,
        direction: Direction,
        buffer: &Mdl,
        timeout_ms: u32,
    ) -> Result<usize> {
        let kind = match RequestKind::from_raw(params.kind) {
            Some(RequestKind::Standard) | None => {
                return Err(Error::InvalidParameter(format!(
                    "invalid request type {}",
                    params.kind
                )));
            }
            Some(kind) => kind,
        };
        let recipient_bits = match Recipient::from_raw(params.recipient) {
            Some(recipient) => recipient.bits(),
            None if kind == RequestKind::Vendor && params.recipient <= 0x1F => {
                debug!(
                    "{}: reserved recipient {:#04x}",
                    self.name(),
                    params.recipient
                );
                params.recipient as u8
            }
            None => {
                return Err(Error::InvalidParameter(format!(
                    "invalid recipient {}",
                    params.recipient
                )));
            }
        };

        debug!(
            "{}: {:?} request {:#04x} value {:#06x} index {:#06x}, {} bytes {:?}, timeout {}",
            self.name(),
            kind,
            params.request,
            params.value,
            params.index,
            buffer.len(),
            direction,
            timeout_ms
        );
        let setup = setup(
            direction,
            kind,
            recipient_bits,
            params.request as u8,
            params.value as u16,
            params.index as u16,
            buffer.len(),
        );
        let transferred = self.control_transfer(setup, buffer, timeout_ms, None).await?;
        Ok(if direction.is_in() { transferred } else { 0 })
    }
}
