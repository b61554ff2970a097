//! Device operations behind the buffered control codes
//!
//! Each operation validates its arguments against the current pipe table,
//! builds the URB for the lower stack and waits for it through the USBD
//! call adapter.

mod configuration;
mod descriptor;
mod endpoint;
mod feature;
mod interface;
mod property;
mod reset;
mod vendor;

pub use reset::{RESET_TYPE_CYCLE_PORT, RESET_TYPE_RESET_PORT};

use crate::device::UsbDevice;
use common::{ControlTransfer, Mdl, Result, SetupPacket, Urb, UrbFunction};
use protocol::{Direction, RequestKind, request_type};

/// Longest data stage a setup packet can describe
const MAX_CONTROL_LEN: usize = u16::MAX as usize;

pub(crate) fn setup(
    direction: Direction,
    kind: RequestKind,
    recipient_bits: u8,
    request: u8,
    value: u16,
    index: u16,
    length: usize,
) -> SetupPacket {
    SetupPacket {
        request_type: request_type(direction, kind, recipient_bits),
        request,
        value,
        index,
        length: length.min(MAX_CONTROL_LEN) as u16,
    }
}

impl UsbDevice {
    /// Runs a control transfer and returns the data-stage byte count.
    /// `clamp_ms = None` leaves the timeout unclamped.
    pub(crate) async fn control_transfer(
        &self,
        setup: SetupPacket,
        buffer: &Mdl,
        timeout_ms: u32,
        clamp_ms: Option<u32>,
    ) -> Result<usize> {
        let buffer = buffer.partial(0, buffer.len().min(MAX_CONTROL_LEN))?;
        let urb = Urb::new(UrbFunction::Control(ControlTransfer {
            setup,
            buffer,
            transferred: 0,
        }));
        let urb = self.call_usbd_ex(urb, timeout_ms, clamp_ms).await?;
        Ok(urb.transferred())
    }

    /// Control transfer clamped to the configured maximum timeout
    pub(crate) async fn standard_request(
        &self,
        setup: SetupPacket,
        buffer: &Mdl,
        timeout_ms: u32,
    ) -> Result<usize> {
        self.control_transfer(
            setup,
            buffer,
            timeout_ms,
            Some(self.tunables.max_control_timeout_ms),
        )
        .await
    }
}
