//! Default control pipe of the simulated device

use super::{ControlRecord, Inner, UsbResult, in_data};
use crate::device::lock;
use common::{ControlTransfer, SetupPacket};
use protocol::usb::{descriptor_type, standard_request};
use protocol::{UsbdStatus, encode_name};
use tracing::trace;

const FEATURE_ENDPOINT_HALT: u16 = 0;

fn string_descriptor(text: &str) -> Vec<u8> {
    // encode_name appends a NUL, which string descriptors do not carry
    let mut utf16 = encode_name(text);
    utf16.truncate(utf16.len().saturating_sub(2));
    let mut raw = Vec::with_capacity(utf16.len() + 2);
    raw.push((utf16.len() + 2).min(u8::MAX as usize) as u8);
    raw.push(descriptor_type::STRING);
    raw.extend_from_slice(&utf16);
    raw
}

impl Inner {
    pub(super) fn control(&self, transfer: &mut ControlTransfer) -> UsbResult<()> {
        let setup = transfer.setup;
        let window = (setup.length as usize).min(transfer.buffer.len());
        let data_in = setup.direction().is_in();

        lock(&self.controls).push(ControlRecord {
            setup,
            data: if data_in {
                Vec::new()
            } else {
                transfer.buffer.read()[..window].to_vec()
            },
        });
        trace!("{}: control {:?}", self.name, setup);

        let reply = if setup.request_type & 0x60 == 0 {
            self.standard(&setup, window)?
        } else if data_in {
            in_data(0, 0, window)
        } else {
            transfer.transferred = window;
            return Ok(());
        };

        if data_in {
            let len = reply.len().min(window);
            transfer.transferred = transfer.buffer.write(0, &reply[..len]);
        } else {
            transfer.transferred = window;
        }
        Ok(())
    }

    fn standard(&self, setup: &SetupPacket, window: usize) -> UsbResult<Vec<u8>> {
        let recipient = setup.request_type & 0x1F;
        match setup.request {
            standard_request::GET_DESCRIPTOR => self.descriptor(setup),
            standard_request::SET_DESCRIPTOR => Ok(vec![0; window]),
            standard_request::GET_CONFIGURATION => Ok(vec![lock(&self.state).configuration]),
            standard_request::GET_INTERFACE => {
                let state = lock(&self.state);
                if state.configuration == 0 {
                    return Err(UsbdStatus::STALL_PID);
                }
                state
                    .alternate_settings
                    .get(&(setup.index as u8))
                    .map(|alt| vec![*alt])
                    .ok_or(UsbdStatus::STALL_PID)
            }
            standard_request::GET_STATUS => {
                let halted = recipient == 2 && lock(&self.state).halted.contains(&(setup.index as u8));
                Ok(vec![u8::from(halted), 0])
            }
            standard_request::SET_FEATURE | standard_request::CLEAR_FEATURE => {
                if recipient == 2 && setup.value == FEATURE_ENDPOINT_HALT {
                    let mut state = lock(&self.state);
                    if setup.request == standard_request::SET_FEATURE {
                        state.halted.insert(setup.index as u8);
                    } else {
                        state.halted.remove(&(setup.index as u8));
                    }
                }
                Ok(Vec::new())
            }
            _ => Err(UsbdStatus::STALL_PID),
        }
    }

    fn descriptor(&self, setup: &SetupPacket) -> UsbResult<Vec<u8>> {
        let index = (setup.value & 0xFF) as usize;
        match (setup.value >> 8) as u8 {
            descriptor_type::DEVICE => Ok(self.device_descriptor.to_bytes().to_vec()),
            descriptor_type::CONFIGURATION => self
                .configurations
                .get(index)
                .map(|config| config.to_bytes())
                .ok_or(UsbdStatus::STALL_PID),
            descriptor_type::STRING if index == 0 => Ok(vec![4, descriptor_type::STRING, 0x09, 0x04]),
            descriptor_type::STRING => self
                .strings
                .get(index - 1)
                .map(|text| string_descriptor(text))
                .ok_or(UsbdStatus::STALL_PID),
            _ => Err(UsbdStatus::STALL_PID),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_descriptor_layout() {
        let raw = string_descriptor("Ab");
        assert_eq!(raw, vec![6, descriptor_type::STRING, b'A', 0, b'b', 0]);
    }
}
