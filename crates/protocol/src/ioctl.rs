//! Device control codes
//!
//! Every operation the driver exposes is selected by a 32-bit control code
//! built the same way the platform builds them: device type, required
//! access, function number and buffering method packed into one word.

use serde::{Deserialize, Serialize};

/// Device type for devices that do not fit a predefined class
pub const FILE_DEVICE_UNKNOWN: u32 = 0x0000_0022;

/// How the data buffer of a request is presented to the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferMethod {
    /// Input and output copied through a system buffer
    Buffered = 0,
    /// Output buffer mapped for device reads from the client (writes to the device)
    InDirect = 1,
    /// Output buffer mapped for device writes into the client (reads from the device)
    OutDirect = 2,
    Neither = 3,
}

/// Packs a control code
pub const fn ctl_code(device_type: u32, function: u32, method: TransferMethod, access: u32) -> u32 {
    (device_type << 16) | (access << 14) | (function << 2) | method as u32
}

const fn code(function: u32, method: TransferMethod) -> u32 {
    ctl_code(FILE_DEVICE_UNKNOWN, function, method, 0)
}

/// The closed set of operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IoctlCode {
    SetConfiguration,
    GetConfiguration,
    SetInterface,
    GetInterface,
    SetFeature,
    ClearFeature,
    GetStatus,
    SetDescriptor,
    GetDescriptor,
    InterruptOrBulkWrite,
    InterruptOrBulkRead,
    VendorWrite,
    VendorRead,
    ResetEndpoint,
    AbortEndpoint,
    ResetDevice,
    SetDebugLevel,
    GetVersion,
    IsochronousWrite,
    IsochronousRead,
    ClaimInterface,
    ReleaseInterface,
    GetDeviceProperty,
    GetCustomRegProperty,
    GetCachedConfiguration,
    ResetDeviceEx,
}

impl IoctlCode {
    pub const ALL: [IoctlCode; 26] = [
        Self::SetConfiguration,
        Self::GetConfiguration,
        Self::SetInterface,
        Self::GetInterface,
        Self::SetFeature,
        Self::ClearFeature,
        Self::GetStatus,
        Self::SetDescriptor,
        Self::GetDescriptor,
        Self::InterruptOrBulkWrite,
        Self::InterruptOrBulkRead,
        Self::VendorWrite,
        Self::VendorRead,
        Self::ResetEndpoint,
        Self::AbortEndpoint,
        Self::ResetDevice,
        Self::SetDebugLevel,
        Self::GetVersion,
        Self::IsochronousWrite,
        Self::IsochronousRead,
        Self::ClaimInterface,
        Self::ReleaseInterface,
        Self::GetDeviceProperty,
        Self::GetCustomRegProperty,
        Self::GetCachedConfiguration,
        Self::ResetDeviceEx,
    ];

    pub const fn function(self) -> u32 {
        match self {
            Self::SetConfiguration => 0x801,
            Self::GetConfiguration => 0x802,
            Self::SetInterface => 0x803,
            Self::GetInterface => 0x804,
            Self::SetFeature => 0x805,
            Self::ClearFeature => 0x806,
            Self::GetStatus => 0x807,
            Self::SetDescriptor => 0x808,
            Self::GetDescriptor => 0x809,
            Self::InterruptOrBulkWrite => 0x80A,
            Self::InterruptOrBulkRead => 0x80B,
            Self::VendorWrite => 0x80C,
            Self::VendorRead => 0x80D,
            Self::ResetEndpoint => 0x80E,
            Self::AbortEndpoint => 0x80F,
            Self::ResetDevice => 0x810,
            Self::SetDebugLevel => 0x811,
            Self::GetVersion => 0x812,
            Self::IsochronousWrite => 0x813,
            Self::IsochronousRead => 0x814,
            Self::ClaimInterface => 0x815,
            Self::ReleaseInterface => 0x816,
            Self::GetDeviceProperty => 0x900,
            Self::GetCustomRegProperty => 0x901,
            Self::GetCachedConfiguration => 0x902,
            Self::ResetDeviceEx => 0x903,
        }
    }

    pub const fn method(self) -> TransferMethod {
        match self {
            Self::InterruptOrBulkWrite | Self::IsochronousWrite => TransferMethod::InDirect,
            Self::InterruptOrBulkRead | Self::IsochronousRead => TransferMethod::OutDirect,
            _ => TransferMethod::Buffered,
        }
    }

    pub const fn code(self) -> u32 {
        code(self.function(), self.method())
    }

    pub fn from_code(raw: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.code() == raw)
    }

    /// Data moves through a separately mapped client buffer
    pub fn is_direct_transfer(self) -> bool {
        matches!(
            self,
            Self::InterruptOrBulkWrite
                | Self::InterruptOrBulkRead
                | Self::IsochronousWrite
                | Self::IsochronousRead
        )
    }

    pub fn is_read(self) -> bool {
        matches!(self, Self::InterruptOrBulkRead | Self::IsochronousRead)
    }

    pub fn is_isochronous(self) -> bool {
        matches!(self, Self::IsochronousRead | Self::IsochronousWrite)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_codes() {
        assert_eq!(IoctlCode::SetConfiguration.code(), 0x0022_2004);
        assert_eq!(IoctlCode::InterruptOrBulkWrite.code(), 0x0022_2029);
        assert_eq!(IoctlCode::InterruptOrBulkRead.code(), 0x0022_202E);
        assert_eq!(IoctlCode::GetVersion.code(), 0x0022_2048);
    }

    #[test]
    fn test_codes_are_unique_and_decode() {
        for op in IoctlCode::ALL {
            assert_eq!(IoctlCode::from_code(op.code()), Some(op));
        }
        assert_eq!(IoctlCode::from_code(0x0022_0000), None);
    }
}
