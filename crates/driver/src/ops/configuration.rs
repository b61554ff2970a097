use super::setup;
use crate::config::InitialConfig;
use crate::device::UsbDevice;
use crate::pipes::{ActiveConfiguration, OwnerId};
use common::{
    ConfigurationHandle, Error, InterfaceInformation, Mdl, PipeInformation, Result,
    TransferBuffer, Urb, UrbFunction,
};
use protocol::usb::standard_request;
use protocol::{ConfigurationDescriptor, Direction, InterfaceDescriptor, Recipient, RequestKind};
use tracing::{debug, info, warn};

impl UsbDevice {
    /// Pipe requests for one interface alternate setting
    pub(crate) fn interface_request(&self, interface: &InterfaceDescriptor) -> InterfaceInformation {
        InterfaceInformation {
            number: interface.number,
            alternate_setting: interface.alternate_setting,
            pipes: interface
                .endpoints
                .iter()
                .map(|ep| PipeInformation {
                    address: ep.address,
                    max_transfer_size: self.tunables.default_max_transfer_size,
                    ..PipeInformation::default()
                })
                .collect(),
        }
    }

    /// Selects the configuration with bConfigurationValue `value`, or
    /// unconfigures the device when `value` is 0.
    ///
    /// Alternate setting 0 of every interface is selected and the pipe
    /// table is rebuilt from the completion. Interface claims do not carry
    /// over; selecting while another handle holds a claim is refused.
    pub async fn set_configuration(
        &self,
        owner: Option<OwnerId>,
        value: u8,
        timeout_ms: u32,
    ) -> Result<()> {
        let current = self.configuration();
        if current.value == value && value != 0 {
            debug!("{}: configuration {} already active", self.name(), value);
            return Ok(());
        }
        if let Some(slot) = current
            .interfaces
            .iter()
            .find(|slot| slot.owner.is_some() && slot.owner != owner)
        {
            return Err(Error::DeviceBusy(format!(
                "interface {} is claimed by another handle",
                slot.number
            )));
        }

        if value == 0 {
            let urb = Urb::new(UrbFunction::SelectConfiguration {
                configuration: None,
                interfaces: Vec::new(),
                handle: ConfigurationHandle::default(),
            });
            let urb = self.call_usbd(urb, timeout_ms).await?;
            let UrbFunction::SelectConfiguration { handle, .. } = urb.function else {
                return Err(Error::BadDevice("select configuration changed function".into()));
            };
            self.pipes.replace(ActiveConfiguration::unconfigured(handle));
            info!("{}: unconfigured", self.name());
            return Ok(());
        }

        let (raw, descriptor) = self.find_configuration(value, timeout_ms).await?;
        let interfaces: Vec<InterfaceInformation> = descriptor
            .interfaces
            .iter()
            .filter(|i| i.alternate_setting == 0)
            .map(|i| self.interface_request(i))
            .collect();

        let urb = Urb::new(UrbFunction::SelectConfiguration {
            configuration: Some(raw),
            interfaces,
            handle: ConfigurationHandle::default(),
        });
        let urb = self.call_usbd(urb, timeout_ms).await?;
        let UrbFunction::SelectConfiguration {
            handle, interfaces, ..
        } = urb.function
        else {
            return Err(Error::BadDevice("select configuration changed function".into()));
        };

        self.pipes
            .replace(ActiveConfiguration::selected(descriptor, handle, &interfaces));
        info!(
            "{}: configuration {} selected, {} interface(s)",
            self.name(),
            value,
            interfaces.len()
        );
        Ok(())
    }

    /// Asks the device for its current configuration value
    pub async fn query_configuration(&self, timeout_ms: u32) -> Result<u8> {
        let buffer = TransferBuffer::new(1);
        let n = self.get_configuration(&buffer.whole(), timeout_ms).await?;
        if n < 1 {
            return Err(Error::BadDevice("empty configuration reply".into()));
        }
        Ok(buffer.to_vec()[0])
    }

    /// Standard GET_CONFIGURATION into `output`
    pub async fn get_configuration(&self, output: &Mdl, timeout_ms: u32) -> Result<usize> {
        let setup = setup(
            Direction::In,
            RequestKind::Standard,
            Recipient::Device.bits(),
            standard_request::GET_CONFIGURATION,
            0,
            0,
            1,
        );
        self.standard_request(setup, &output.partial(0, 1)?, timeout_ms)
            .await
    }

    /// Configuration value the driver selected, without bus I/O
    pub fn get_cached_configuration(&self, output: &Mdl) -> Result<usize> {
        Ok(output.write(0, &[self.configuration().value]))
    }

    /// Applies the start-up configuration policy. Returns the value
    /// selected, or 0 when the device was left unconfigured.
    pub(crate) async fn apply_initial_configuration(&self) -> Result<u8> {
        let timeout = self.tunables.default_timeout_ms;
        let value = match self.settings.initial_config() {
            InitialConfig::None => return Ok(0),
            InitialConfig::Value(value) => value,
            InitialConfig::Active => match self.query_configuration(timeout).await? {
                0 => self.first_configuration_value(timeout).await?,
                active => active,
            },
        };
        self.set_configuration(None, value, timeout).await?;
        Ok(value)
    }

    async fn first_configuration_value(&self, timeout_ms: u32) -> Result<u8> {
        let raw = self.configuration_descriptor(0, timeout_ms).await?;
        Ok(ConfigurationDescriptor::parse(&raw)?.value)
    }

    /// Configures the device on first use by a transfer
    pub(crate) async fn ensure_configured(&self) -> Result<()> {
        if self.configuration().is_configured() {
            return Ok(());
        }
        if !self.is_filter() {
            match self.apply_initial_configuration().await {
                Ok(0) => {}
                Ok(value) => debug!("{}: auto-configured {}", self.name(), value),
                Err(e) => warn!("{}: auto-configuration failed: {}", self.name(), e),
            }
        }
        if self.configuration().is_configured() {
            Ok(())
        } else {
            Err(Error::DeviceNotConfigured)
        }
    }
}
