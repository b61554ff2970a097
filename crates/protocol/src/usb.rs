//! USB constants and small enumerations shared by every layer

use serde::{Deserialize, Serialize};

/// Standard descriptor types
pub mod descriptor_type {
    pub const DEVICE: u8 = 0x01;
    pub const CONFIGURATION: u8 = 0x02;
    pub const STRING: u8 = 0x03;
    pub const INTERFACE: u8 = 0x04;
    pub const ENDPOINT: u8 = 0x05;
}

/// Standard request codes (bRequest)
pub mod standard_request {
    pub const GET_STATUS: u8 = 0x00;
    pub const CLEAR_FEATURE: u8 = 0x01;
    pub const SET_FEATURE: u8 = 0x03;
    pub const GET_DESCRIPTOR: u8 = 0x06;
    pub const SET_DESCRIPTOR: u8 = 0x07;
    pub const GET_CONFIGURATION: u8 = 0x08;
    pub const SET_CONFIGURATION: u8 = 0x09;
    pub const GET_INTERFACE: u8 = 0x0A;
    pub const SET_INTERFACE: u8 = 0x0B;
}

/// Endpoint address bit selecting the IN direction
pub const ENDPOINT_DIR_IN: u8 = 0x80;

/// Size of a standard device descriptor
pub const DEVICE_DESCRIPTOR_LEN: usize = 18;

/// Request recipient (bmRequestType bits 0..4)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Recipient {
    Device,
    Interface,
    Endpoint,
    Other,
}

impl Recipient {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Device),
            1 => Some(Self::Interface),
            2 => Some(Self::Endpoint),
            3 => Some(Self::Other),
            _ => None,
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            Self::Device => 0,
            Self::Interface => 1,
            Self::Endpoint => 2,
            Self::Other => 3,
        }
    }
}

/// Request type (bmRequestType bits 5..6)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestKind {
    Standard,
    Class,
    Vendor,
}

impl RequestKind {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Standard),
            1 => Some(Self::Class),
            2 => Some(Self::Vendor),
            _ => None,
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            Self::Standard => 0x00,
            Self::Class => 0x20,
            Self::Vendor => 0x40,
        }
    }
}

/// Data stage direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Out,
    In,
}

impl Direction {
    pub fn of_endpoint(address: u8) -> Self {
        if address & ENDPOINT_DIR_IN != 0 {
            Self::In
        } else {
            Self::Out
        }
    }

    pub fn is_in(self) -> bool {
        self == Self::In
    }
}

/// Endpoint transfer type (bmAttributes bits 0..1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipeType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl PipeType {
    pub fn from_attributes(attributes: u8) -> Self {
        match attributes & 0x03 {
            0 => Self::Control,
            1 => Self::Isochronous,
            2 => Self::Bulk,
            _ => Self::Interrupt,
        }
    }

    pub fn attributes(self) -> u8 {
        match self {
            Self::Control => 0,
            Self::Isochronous => 1,
            Self::Bulk => 2,
            Self::Interrupt => 3,
        }
    }

    pub fn is_bulk_or_interrupt(self) -> bool {
        matches!(self, Self::Bulk | Self::Interrupt)
    }
}

/// Per-request transfer flags supplied by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TransferFlags(pub u32);

impl TransferFlags {
    /// A short packet terminates the transfer with an error
    pub const SHORT_NOT_OK: Self = Self(1 << 0);
    /// Isochronous transfer starts at an explicit frame instead of ASAP
    pub const ISO_SET_START_FRAME: Self = Self(1 << 30);
    /// Add the request's latency to the explicit start frame
    pub const ISO_ADD_LATENCY: Self = Self(1 << 31);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for TransferFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Builds bmRequestType from its three components
pub fn request_type(direction: Direction, kind: RequestKind, recipient_bits: u8) -> u8 {
    let dir = if direction.is_in() { ENDPOINT_DIR_IN } else { 0 };
    dir | kind.bits() | (recipient_bits & 0x1F)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_direction() {
        assert_eq!(Direction::of_endpoint(0x81), Direction::In);
        assert_eq!(Direction::of_endpoint(0x02), Direction::Out);
    }

    #[test]
    fn test_pipe_type_from_attributes() {
        assert_eq!(PipeType::from_attributes(0x02), PipeType::Bulk);
        assert_eq!(PipeType::from_attributes(0x03), PipeType::Interrupt);
        // synchronisation bits are ignored
        assert_eq!(PipeType::from_attributes(0x0D), PipeType::Isochronous);
    }

    #[test]
    fn test_request_type() {
        assert_eq!(
            request_type(Direction::In, RequestKind::Vendor, Recipient::Interface.bits()),
            0xC1
        );
        assert_eq!(
            request_type(Direction::Out, RequestKind::Standard, Recipient::Device.bits()),
            0x00
        );
        assert_eq!(request_type(Direction::Out, RequestKind::Vendor, 0x1F), 0x5F);
    }

    #[test]
    fn test_transfer_flags() {
        let flags = TransferFlags::ISO_SET_START_FRAME | TransferFlags::ISO_ADD_LATENCY;
        assert!(flags.contains(TransferFlags::ISO_ADD_LATENCY));
        assert!(!flags.contains(TransferFlags::SHORT_NOT_OK));
        assert!(!Recipient::from_raw(7).is_some());
    }
}
