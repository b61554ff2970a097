use super::setup;
use crate::device::UsbDevice;
use common::{Error, Mdl, Result};
use protocol::usb::standard_request;
use protocol::{Direction, Recipient, RequestKind};
use tracing::debug;

impl UsbDevice {
    pub async fn set_feature(
        &self,
        recipient: u32,
        feature: u32,
        index: u32,
        timeout_ms: u32,
    ) -> Result<()> {
        self.feature_request(standard_request::SET_FEATURE, recipient, feature, index, timeout_ms)
            .await
    }

    pub async fn clear_feature(
        &self,
        recipient: u32,
        feature: u32,
        index: u32,
        timeout_ms: u32,
    ) -> Result<()> {
        self.feature_request(
            standard_request::CLEAR_FEATURE,
            recipient,
            feature,
            index,
            timeout_ms,
        )
        .await
    }

    async fn feature_request(
        &self,
        request: u8,
        recipient: u32,
        feature: u32,
        index: u32,
        timeout_ms: u32,
    ) -> Result<()> {
        let recipient = Recipient::from_raw(recipient)
            .ok_or_else(|| Error::InvalidParameter(format!("invalid recipient {}", recipient)))?;
        if !self.configuration().is_configured() && recipient != Recipient::Device {
            return Err(Error::InvalidParameter(
                "feature request to a non-device recipient while unconfigured".into(),
            ));
        }
        let index = if recipient == Recipient::Other { 0 } else { index as u16 };

        debug!(
            "{}: {} feature {} on {:?} index {}",
            self.name(),
            if request == standard_request::SET_FEATURE { "set" } else { "clear" },
            feature,
            recipient,
            index
        );
        let setup = setup(
            Direction::Out,
            RequestKind::Standard,
            recipient.bits(),
            request,
            feature as u16,
            index,
            0,
        );
        self.standard_request(setup, &Mdl::empty(), timeout_ms)
            .await
            .map(|_| ())
    }

    /// Standard GET_STATUS; writes the two status bytes to `output`
    pub async fn get_status(
        &self,
        recipient: u32,
        index: u32,
        output: &Mdl,
        timeout_ms: u32,
    ) -> Result<usize> {
        let recipient = Recipient::from_raw(recipient)
            .ok_or_else(|| Error::InvalidParameter(format!("invalid recipient {}", recipient)))?;
        if !self.configuration().is_configured() && recipient != Recipient::Device {
            return Err(Error::InvalidParameter(
                "status request to a non-device recipient while unconfigured".into(),
            ));
        }
        let setup = setup(
            Direction::In,
            RequestKind::Standard,
            recipient.bits(),
            standard_request::GET_STATUS,
            0,
            index as u16,
            2,
        );
        self.standard_request(setup, &output.partial(0, 2)?, timeout_ms)
            .await
    }
}
