//! Fixed-size request header
//!
//! Every request starts with a 24-byte little-endian header: a timeout in
//! milliseconds followed by five 32-bit slots whose meaning depends on the
//! control code. Buffered operations may carry extra input after the header
//! (vendor write data, descriptor data, registry value names).

use crate::error::{ProtocolError, Result};
use crate::ioctl::IoctlCode;
use crate::usb::TransferFlags;
use crate::version::DriverVersion;
use byteorder::{LittleEndian, ReadBytesExt};
use bytes::{BufMut, Bytes, BytesMut};
use std::io::Cursor;

/// Size of the request header
pub const REQUEST_HEADER_LEN: usize = 24;

/// Ceiling for buffered input and output
pub const MAX_BUFFERED_LEN: usize = 64 * 1024;

const SLOTS: usize = 5;

/// Endpoint operation parameters (transfers, reset, abort)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EndpointParams {
    pub endpoint: u32,
    pub packet_size: u32,
    /// Zero selects the pipe's own maximum
    pub max_transfer_size: u32,
    pub transfer_flags: TransferFlags,
    pub iso_start_frame_latency: u32,
}

/// Vendor or class control request parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VendorParams {
    pub kind: u32,
    pub recipient: u32,
    pub request: u32,
    pub value: u32,
    pub index: u32,
}

/// Descriptor request parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DescriptorParams {
    pub descriptor_type: u32,
    pub index: u32,
    pub language_id: u32,
    pub recipient: u32,
}

/// Operation-specific interpretation of the header slots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Params {
    None,
    Configuration { configuration: u32 },
    Interface { interface: u32, altsetting: u32 },
    Endpoint(EndpointParams),
    Vendor(VendorParams),
    Feature { recipient: u32, feature: u32, index: u32 },
    Status { recipient: u32, index: u32 },
    Descriptor(DescriptorParams),
    Debug { level: u32 },
    DeviceProperty { property: u32 },
    RegistryKey {
        key_type: u32,
        name_offset: u32,
        value_offset: u32,
        value_length: u32,
    },
    ResetDevice { reset_type: u32 },
}

/// A decoded request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub timeout: u32,
    pub params: Params,
    /// Input bytes following the header
    pub tail: Bytes,
}

impl Request {
    pub fn new(timeout: u32, params: Params) -> Self {
        Self {
            timeout,
            params,
            tail: Bytes::new(),
        }
    }

    pub fn with_tail(mut self, tail: impl Into<Bytes>) -> Self {
        self.tail = tail.into();
        self
    }

    /// Decodes the input buffer of a request with the given code
    pub fn decode(code: IoctlCode, input: &[u8]) -> Result<Self> {
        if input.len() < REQUEST_HEADER_LEN {
            return Err(ProtocolError::BufferTooSmall {
                needed: REQUEST_HEADER_LEN,
                available: input.len(),
            });
        }

        let mut cursor = Cursor::new(input);
        let timeout = read_u32(&mut cursor)?;
        let mut s = [0u32; SLOTS];
        for slot in s.iter_mut() {
            *slot = read_u32(&mut cursor)?;
        }

        let params = match code {
            IoctlCode::SetConfiguration => Params::Configuration { configuration: s[0] },
            IoctlCode::GetConfiguration
            | IoctlCode::GetCachedConfiguration
            | IoctlCode::GetVersion
            | IoctlCode::ResetDevice => Params::None,
            IoctlCode::SetInterface
            | IoctlCode::GetInterface
            | IoctlCode::ClaimInterface
            | IoctlCode::ReleaseInterface => Params::Interface {
                interface: s[0],
                altsetting: s[1],
            },
            IoctlCode::SetFeature | IoctlCode::ClearFeature => Params::Feature {
                recipient: s[0],
                feature: s[1],
                index: s[2],
            },
            IoctlCode::GetStatus => Params::Status {
                recipient: s[0],
                index: s[1],
            },
            IoctlCode::SetDescriptor | IoctlCode::GetDescriptor => {
                Params::Descriptor(DescriptorParams {
                    descriptor_type: s[0],
                    index: s[1],
                    language_id: s[2],
                    recipient: s[3],
                })
            }
            IoctlCode::InterruptOrBulkWrite
            | IoctlCode::InterruptOrBulkRead
            | IoctlCode::IsochronousWrite
            | IoctlCode::IsochronousRead
            | IoctlCode::ResetEndpoint
            | IoctlCode::AbortEndpoint => Params::Endpoint(EndpointParams {
                endpoint: s[0],
                packet_size: s[1],
                max_transfer_size: s[2],
                transfer_flags: TransferFlags(s[3]),
                iso_start_frame_latency: s[4],
            }),
            IoctlCode::VendorWrite | IoctlCode::VendorRead => Params::Vendor(VendorParams {
                kind: s[0],
                recipient: s[1],
                request: s[2],
                value: s[3],
                index: s[4],
            }),
            IoctlCode::SetDebugLevel => Params::Debug { level: s[0] },
            IoctlCode::GetDeviceProperty => Params::DeviceProperty { property: s[0] },
            IoctlCode::GetCustomRegProperty => Params::RegistryKey {
                key_type: s[0],
                name_offset: s[1],
                value_offset: s[2],
                value_length: s[3],
            },
            IoctlCode::ResetDeviceEx => Params::ResetDevice { reset_type: s[0] },
        };

        Ok(Self {
            timeout,
            params,
            tail: Bytes::copy_from_slice(&input[REQUEST_HEADER_LEN..]),
        })
    }

    /// Encodes the header followed by the tail
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(REQUEST_HEADER_LEN + self.tail.len());
        buf.put_u32_le(self.timeout);
        for slot in self.slots() {
            buf.put_u32_le(slot);
        }
        buf.put_slice(&self.tail);
        buf.freeze()
    }

    fn slots(&self) -> [u32; SLOTS] {
        match self.params {
            Params::None => [0; SLOTS],
            Params::Configuration { configuration } => [configuration, 0, 0, 0, 0],
            Params::Interface {
                interface,
                altsetting,
            } => [interface, altsetting, 0, 0, 0],
            Params::Endpoint(p) => [
                p.endpoint,
                p.packet_size,
                p.max_transfer_size,
                p.transfer_flags.0,
                p.iso_start_frame_latency,
            ],
            Params::Vendor(p) => [p.kind, p.recipient, p.request, p.value, p.index],
            Params::Feature {
                recipient,
                feature,
                index,
            } => [recipient, feature, index, 0, 0],
            Params::Status { recipient, index } => [recipient, index, 0, 0, 0],
            Params::Descriptor(p) => [p.descriptor_type, p.index, p.language_id, p.recipient, 0],
            Params::Debug { level } => [level, 0, 0, 0, 0],
            Params::DeviceProperty { property } => [property, 0, 0, 0, 0],
            Params::RegistryKey {
                key_type,
                name_offset,
                value_offset,
                value_length,
            } => [key_type, name_offset, value_offset, value_length, 0],
            Params::ResetDevice { reset_type } => [reset_type, 0, 0, 0, 0],
        }
    }

    /// Reads a NUL-terminated UTF-16LE name at `offset` bytes into the full
    /// input buffer (header included)
    pub fn name_at(&self, offset: u32) -> Result<String> {
        let offset = offset as usize;
        let len = REQUEST_HEADER_LEN + self.tail.len();
        if offset < REQUEST_HEADER_LEN || offset >= len {
            return Err(ProtocolError::InvalidOffset { offset, len });
        }
        let raw = &self.tail[offset - REQUEST_HEADER_LEN..];
        let units: Vec<u16> = raw
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .take_while(|&u| u != 0)
            .collect();
        String::from_utf16(&units).map_err(|_| ProtocolError::InvalidName)
    }
}

fn read_u32(cursor: &mut Cursor<&[u8]>) -> Result<u32> {
    let available = cursor.get_ref().len();
    cursor
        .read_u32::<LittleEndian>()
        .map_err(|_| ProtocolError::BufferTooSmall {
            needed: REQUEST_HEADER_LEN,
            available,
        })
}

/// Encodes a NUL-terminated UTF-16LE name
pub fn encode_name(name: &str) -> Vec<u8> {
    name.encode_utf16()
        .chain(std::iter::once(0))
        .flat_map(u16::to_le_bytes)
        .collect()
}

/// Version reply: a request header with the version in its slots
pub fn encode_version_reply(version: &DriverVersion) -> Bytes {
    let mut buf = BytesMut::with_capacity(REQUEST_HEADER_LEN);
    buf.put_u32_le(0);
    buf.put_u32_le(version.major);
    buf.put_u32_le(version.minor);
    buf.put_u32_le(version.micro);
    buf.put_u32_le(version.nano);
    buf.put_u32_le(version.mod_value);
    buf.freeze()
}

pub fn decode_version_reply(reply: &[u8]) -> Result<DriverVersion> {
    if reply.len() < REQUEST_HEADER_LEN {
        return Err(ProtocolError::BufferTooSmall {
            needed: REQUEST_HEADER_LEN,
            available: reply.len(),
        });
    }
    let mut cursor = Cursor::new(&reply[4..]);
    Ok(DriverVersion {
        major: read_u32(&mut cursor)?,
        minor: read_u32(&mut cursor)?,
        micro: read_u32(&mut cursor)?,
        nano: read_u32(&mut cursor)?,
        mod_value: read_u32(&mut cursor)?,
    })
}
