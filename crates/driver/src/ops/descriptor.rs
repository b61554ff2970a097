use super::setup;
use crate::device::{UsbDevice, lock};
use common::{Error, Mdl, Result, TransferBuffer};
use protocol::usb::{descriptor_type, standard_request};
use protocol::{
    ConfigurationDescriptor, DEVICE_DESCRIPTOR_LEN, DeviceDescriptor, Direction, Recipient,
    RequestKind,
};
use tracing::{debug, warn};

const CONFIG_HEADER_LEN: usize = 9;

fn descriptor_recipient(recipient: u32) -> Result<Recipient> {
    match Recipient::from_raw(recipient) {
        Some(Recipient::Other) | None => Err(Error::InvalidParameter(format!(
            "invalid descriptor recipient {}",
            recipient
        ))),
        Some(r) => Ok(r),
    }
}

impl UsbDevice {
    /// Reads a standard descriptor into `buffer`; returns the byte count.
    ///
    /// The device descriptor (index 0, language 0) is served from the cache
    /// once it has been read.
    pub async fn get_descriptor(
        &self,
        descriptor_type: u8,
        index: u8,
        language_id: u16,
        recipient: u32,
        buffer: &Mdl,
        timeout_ms: u32,
    ) -> Result<usize> {
        let recipient = descriptor_recipient(recipient)?;
        let device_request = descriptor_type == descriptor_type::DEVICE
            && index == 0
            && language_id == 0
            && recipient == Recipient::Device;

        if device_request {
            if let Some(cached) = *lock(&self.device_descriptor) {
                debug!("{}: device descriptor from cache", self.name());
                return Ok(buffer.write(0, &cached));
            }
        }

        debug!(
            "{}: get descriptor type {:#04x} index {} language {:#06x} ({} bytes)",
            self.name(),
            descriptor_type,
            index,
            language_id,
            buffer.len()
        );
        let setup = setup(
            Direction::In,
            RequestKind::Standard,
            recipient.bits(),
            standard_request::GET_DESCRIPTOR,
            ((descriptor_type as u16) << 8) | index as u16,
            language_id,
            buffer.len(),
        );
        let received = self.standard_request(setup, buffer, timeout_ms).await?;

        if device_request && buffer.len() >= DEVICE_DESCRIPTOR_LEN {
            if received < DEVICE_DESCRIPTOR_LEN {
                warn!(
                    "{}: device descriptor is only {} bytes",
                    self.name(),
                    received
                );
                return Err(Error::BadDevice(format!(
                    "device descriptor is {} bytes",
                    received
                )));
            }
            let mut cached = [0u8; DEVICE_DESCRIPTOR_LEN];
            cached.copy_from_slice(&buffer.partial(0, DEVICE_DESCRIPTOR_LEN)?.read());
            *lock(&self.device_descriptor) = Some(cached);
        }
        Ok(received)
    }

    pub async fn set_descriptor(
        &self,
        descriptor_type: u8,
        index: u8,
        language_id: u16,
        recipient: u32,
        data: &[u8],
        timeout_ms: u32,
    ) -> Result<usize> {
        let recipient = descriptor_recipient(recipient)?;
        let buffer = TransferBuffer::from_vec(data.to_vec()).whole();
        let setup = setup(
            Direction::Out,
            RequestKind::Standard,
            recipient.bits(),
            standard_request::SET_DESCRIPTOR,
            ((descriptor_type as u16) << 8) | index as u16,
            language_id,
            data.len(),
        );
        self.standard_request(setup, &buffer, timeout_ms).await
    }

    /// The device descriptor, cached after the first read
    pub async fn device_descriptor(&self, timeout_ms: u32) -> Result<DeviceDescriptor> {
        let buffer = TransferBuffer::new(DEVICE_DESCRIPTOR_LEN);
        self.get_descriptor(
            descriptor_type::DEVICE,
            0,
            0,
            0,
            &buffer.whole(),
            timeout_ms,
        )
        .await?;
        Ok(DeviceDescriptor::parse(&buffer.to_vec())?)
    }

    /// Raw configuration descriptor at `index`
    pub(crate) async fn configuration_descriptor(
        &self,
        index: u8,
        timeout_ms: u32,
    ) -> Result<Vec<u8>> {
        let header = TransferBuffer::new(CONFIG_HEADER_LEN);
        let n = self
            .get_descriptor(
                descriptor_type::CONFIGURATION,
                index,
                0,
                0,
                &header.whole(),
                timeout_ms,
            )
            .await?;
        if n < CONFIG_HEADER_LEN {
            return Err(Error::BadDevice(format!(
                "configuration descriptor {} header is {} bytes",
                index, n
            )));
        }
        let total = ConfigurationDescriptor::total_length(&header.to_vec())?;

        let full = TransferBuffer::new(total);
        let n = self
            .get_descriptor(
                descriptor_type::CONFIGURATION,
                index,
                0,
                0,
                &full.whole(),
                timeout_ms,
            )
            .await?;
        let mut raw = full.to_vec();
        raw.truncate(n);
        Ok(raw)
    }

    /// Finds the configuration whose bConfigurationValue is `value`
    pub(crate) async fn find_configuration(
        &self,
        value: u8,
        timeout_ms: u32,
    ) -> Result<(Vec<u8>, ConfigurationDescriptor)> {
        let device = self.device_descriptor(timeout_ms).await?;
        for index in 0..device.num_configurations {
            let raw = self.configuration_descriptor(index, timeout_ms).await?;
            let parsed = ConfigurationDescriptor::parse(&raw)?;
            if parsed.value == value {
                return Ok((raw, parsed));
            }
        }
        Err(Error::InvalidParameter(format!(
            "configuration {} not found",
            value
        )))
    }
}
