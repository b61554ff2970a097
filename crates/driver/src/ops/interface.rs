use super::setup;
use crate::device::UsbDevice;
use crate::pipes::OwnerId;
use common::{Error, Mdl, Result, Urb, UrbFunction};
use protocol::usb::standard_request;
use protocol::{Direction, Recipient, RequestKind};
use tracing::{debug, info};

impl UsbDevice {
    /// Switches `interface` to `alternate_setting`
    pub async fn set_interface(
        &self,
        owner: Option<OwnerId>,
        interface: u8,
        alternate_setting: u8,
        timeout_ms: u32,
    ) -> Result<()> {
        let current = self.configuration();
        if !current.is_configured() {
            return Err(Error::DeviceNotConfigured);
        }
        let slot = current
            .interface(interface)
            .filter(|slot| slot.valid)
            .ok_or_else(|| Error::InvalidParameter(format!("invalid interface {}", interface)))?;
        if slot.owner.is_some() && slot.owner != owner {
            return Err(Error::DeviceBusy(format!(
                "interface {} is claimed by another handle",
                interface
            )));
        }
        let descriptor = current
            .descriptor
            .as_ref()
            .and_then(|d| d.find_interface(interface, alternate_setting))
            .ok_or_else(|| {
                Error::InvalidParameter(format!(
                    "interface {} has no alternate setting {}",
                    interface, alternate_setting
                ))
            })?;

        let urb = Urb::new(UrbFunction::SelectInterface {
            configuration: current.handle,
            interface: self.interface_request(descriptor),
        });
        let urb = self.call_usbd(urb, timeout_ms).await?;
        let UrbFunction::SelectInterface {
            configuration,
            interface: selected,
        } = urb.function
        else {
            return Err(Error::BadDevice("select interface changed function".into()));
        };

        self.pipes.update(|table| {
            if table.handle != configuration {
                return Err(Error::DeviceBusy(
                    "configuration changed during interface selection".into(),
                ));
            }
            *table = table.with_interface(&selected);
            Ok(())
        })?;
        info!(
            "{}: interface {} alternate setting {} selected",
            self.name(),
            interface,
            alternate_setting
        );
        Ok(())
    }

    /// Standard GET_INTERFACE into `output`
    pub async fn get_interface(&self, interface: u8, output: &Mdl, timeout_ms: u32) -> Result<usize> {
        if !self.configuration().is_configured() {
            return Err(Error::DeviceNotConfigured);
        }
        let setup = setup(
            Direction::In,
            RequestKind::Standard,
            Recipient::Interface.bits(),
            standard_request::GET_INTERFACE,
            0,
            interface as u16,
            1,
        );
        self.standard_request(setup, &output.partial(0, 1)?, timeout_ms)
            .await
    }

    pub fn claim_interface(&self, owner: OwnerId, interface: u8) -> Result<()> {
        self.pipes.claim(owner, interface)?;
        debug!("{}: interface {} claimed by {:?}", self.name(), interface, owner);
        Ok(())
    }

    pub fn release_interface(&self, owner: OwnerId, interface: u8) -> Result<()> {
        self.pipes.release(owner, interface)?;
        debug!("{}: interface {} released by {:?}", self.name(), interface, owner);
        Ok(())
    }

    /// Releases every interface `owner` holds; returns how many
    pub fn release_all_interfaces(&self, owner: OwnerId) -> usize {
        self.pipes.release_all(owner)
    }
}
