//! Standard descriptor parsing and construction
//!
//! Configuration descriptors are walked as a flat list of
//! length-prefixed records; interface records open a new interface and the
//! endpoint records that follow belong to it. Class-specific records are
//! skipped.

use crate::error::{ProtocolError, Result};
use crate::usb::{DEVICE_DESCRIPTOR_LEN, Direction, PipeType, descriptor_type};
use serde::{Deserialize, Serialize};

const CONFIG_HEADER_LEN: usize = 9;
const INTERFACE_LEN: usize = 9;
const ENDPOINT_LEN: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub usb_version: u16,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub max_packet_size0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_version: u16,
    pub manufacturer_index: u8,
    pub product_index: u8,
    pub serial_index: u8,
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < DEVICE_DESCRIPTOR_LEN {
            return Err(ProtocolError::BufferTooSmall {
                needed: DEVICE_DESCRIPTOR_LEN,
                available: raw.len(),
            });
        }
        if raw[1] != descriptor_type::DEVICE {
            return Err(ProtocolError::InvalidDescriptor(format!(
                "expected device descriptor, found type {:#04x}",
                raw[1]
            )));
        }
        Ok(Self {
            usb_version: u16::from_le_bytes([raw[2], raw[3]]),
            class: raw[4],
            subclass: raw[5],
            protocol: raw[6],
            max_packet_size0: raw[7],
            vendor_id: u16::from_le_bytes([raw[8], raw[9]]),
            product_id: u16::from_le_bytes([raw[10], raw[11]]),
            device_version: u16::from_le_bytes([raw[12], raw[13]]),
            manufacturer_index: raw[14],
            product_index: raw[15],
            serial_index: raw[16],
            num_configurations: raw[17],
        })
    }

    pub fn to_bytes(&self) -> [u8; DEVICE_DESCRIPTOR_LEN] {
        let usb = self.usb_version.to_le_bytes();
        let vid = self.vendor_id.to_le_bytes();
        let pid = self.product_id.to_le_bytes();
        let bcd = self.device_version.to_le_bytes();
        [
            DEVICE_DESCRIPTOR_LEN as u8,
            descriptor_type::DEVICE,
            usb[0],
            usb[1],
            self.class,
            self.subclass,
            self.protocol,
            self.max_packet_size0,
            vid[0],
            vid[1],
            pid[0],
            pid[1],
            bcd[0],
            bcd[1],
            self.manufacturer_index,
            self.product_index,
            self.serial_index,
            self.num_configurations,
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    pub address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

impl EndpointDescriptor {
    pub fn new(address: u8, pipe_type: PipeType, max_packet_size: u16) -> Self {
        Self {
            address,
            attributes: pipe_type.attributes(),
            max_packet_size,
            interval: if pipe_type == PipeType::Bulk { 0 } else { 1 },
        }
    }

    pub fn pipe_type(&self) -> PipeType {
        PipeType::from_attributes(self.attributes)
    }

    pub fn direction(&self) -> Direction {
        Direction::of_endpoint(self.address)
    }

    /// Bytes per packet; high-bandwidth multiplier bits excluded
    pub fn packet_size(&self) -> u16 {
        self.max_packet_size & 0x07FF
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceDescriptor {
    pub number: u8,
    pub alternate_setting: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub endpoints: Vec<EndpointDescriptor>,
}

impl InterfaceDescriptor {
    pub fn new(number: u8, alternate_setting: u8) -> Self {
        Self {
            number,
            alternate_setting,
            class: 0xFF,
            subclass: 0,
            protocol: 0,
            endpoints: Vec::new(),
        }
    }

    pub fn endpoint(mut self, endpoint: EndpointDescriptor) -> Self {
        self.endpoints.push(endpoint);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationDescriptor {
    pub value: u8,
    pub attributes: u8,
    pub max_power: u8,
    /// Every alternate setting of every interface, in descriptor order
    pub interfaces: Vec<InterfaceDescriptor>,
}

impl ConfigurationDescriptor {
    pub fn new(value: u8) -> Self {
        Self {
            value,
            attributes: 0x80,
            max_power: 50,
            interfaces: Vec::new(),
        }
    }

    pub fn interface(mut self, interface: InterfaceDescriptor) -> Self {
        self.interfaces.push(interface);
        self
    }

    /// Reads wTotalLength from a configuration descriptor header
    pub fn total_length(header: &[u8]) -> Result<usize> {
        if header.len() < 4 || header[1] != descriptor_type::CONFIGURATION {
            return Err(ProtocolError::InvalidDescriptor(
                "not a configuration descriptor header".into(),
            ));
        }
        Ok(u16::from_le_bytes([header[2], header[3]]) as usize)
    }

    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < CONFIG_HEADER_LEN {
            return Err(ProtocolError::BufferTooSmall {
                needed: CONFIG_HEADER_LEN,
                available: raw.len(),
            });
        }
        let total = Self::total_length(raw)?;
        if total > raw.len() {
            return Err(ProtocolError::BufferTooSmall {
                needed: total,
                available: raw.len(),
            });
        }

        let mut config = Self {
            value: raw[5],
            attributes: raw[7],
            max_power: raw[8],
            interfaces: Vec::new(),
        };

        let mut pos = raw[0] as usize;
        while pos + 2 <= total {
            let len = raw[pos] as usize;
            if len < 2 || pos + len > total {
                return Err(ProtocolError::InvalidDescriptor(format!(
                    "record of length {} at offset {}",
                    len, pos
                )));
            }
            let record = &raw[pos..pos + len];
            match record[1] {
                descriptor_type::INTERFACE if len >= INTERFACE_LEN => {
                    config.interfaces.push(InterfaceDescriptor {
                        number: record[2],
                        alternate_setting: record[3],
                        class: record[5],
                        subclass: record[6],
                        protocol: record[7],
                        endpoints: Vec::new(),
                    });
                }
                descriptor_type::ENDPOINT if len >= ENDPOINT_LEN => {
                    let Some(current) = config.interfaces.last_mut() else {
                        return Err(ProtocolError::InvalidDescriptor(
                            "endpoint before any interface".into(),
                        ));
                    };
                    current.endpoints.push(EndpointDescriptor {
                        address: record[2],
                        attributes: record[3],
                        max_packet_size: u16::from_le_bytes([record[4], record[5]]),
                        interval: record[6],
                    });
                }
                _ => {}
            }
            pos += len;
        }

        Ok(config)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; CONFIG_HEADER_LEN];
        for iface in &self.interfaces {
            out.extend_from_slice(&[
                INTERFACE_LEN as u8,
                descriptor_type::INTERFACE,
                iface.number,
                iface.alternate_setting,
                iface.endpoints.len() as u8,
                iface.class,
                iface.subclass,
                iface.protocol,
                0,
            ]);
            for ep in &iface.endpoints {
                let mps = ep.max_packet_size.to_le_bytes();
                out.extend_from_slice(&[
                    ENDPOINT_LEN as u8,
                    descriptor_type::ENDPOINT,
                    ep.address,
                    ep.attributes,
                    mps[0],
                    mps[1],
                    ep.interval,
                ]);
            }
        }
        let total = (out.len() as u16).to_le_bytes();
        out[..CONFIG_HEADER_LEN].copy_from_slice(&[
            CONFIG_HEADER_LEN as u8,
            descriptor_type::CONFIGURATION,
            total[0],
            total[1],
            self.num_interfaces(),
            self.value,
            0,
            self.attributes,
            self.max_power,
        ]);
        out
    }

    /// Number of distinct interface numbers
    pub fn num_interfaces(&self) -> u8 {
        self.interface_numbers().len() as u8
    }

    /// Distinct interface numbers in ascending order
    pub fn interface_numbers(&self) -> Vec<u8> {
        let mut numbers: Vec<u8> = self.interfaces.iter().map(|i| i.number).collect();
        numbers.sort_unstable();
        numbers.dedup();
        numbers
    }

    pub fn find_interface(&self, number: u8, alternate_setting: u8) -> Option<&InterfaceDescriptor> {
        self.interfaces
            .iter()
            .find(|i| i.number == number && i.alternate_setting == alternate_setting)
    }
}
