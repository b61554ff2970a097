//! Completion status code spaces
//!
//! Two independent status values travel with every completed request: the
//! outer completion status ([`NtStatus`]) and, for URB-carrying requests, the
//! USB-level status embedded in the URB itself ([`UsbdStatus`]). A request can
//! complete successfully on the outside while the URB reports a bus failure,
//! so callers inspect both.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Outer completion status of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NtStatus(pub u32);

impl NtStatus {
    pub const SUCCESS: Self = Self(0x0000_0000);
    pub const TIMEOUT: Self = Self(0x0000_0102);
    pub const PENDING: Self = Self(0x0000_0103);
    pub const DEVICE_BUSY: Self = Self(0x8000_0011);
    pub const NO_MORE_ENTRIES: Self = Self(0x8000_001A);
    pub const UNSUCCESSFUL: Self = Self(0xC000_0001);
    pub const INVALID_PARAMETER: Self = Self(0xC000_000D);
    pub const NO_MEMORY: Self = Self(0xC000_0017);
    pub const BUFFER_TOO_SMALL: Self = Self(0xC000_0023);
    pub const DELETE_PENDING: Self = Self(0xC000_0056);
    pub const INSUFFICIENT_RESOURCES: Self = Self(0xC000_009A);
    pub const DEVICE_NOT_CONNECTED: Self = Self(0xC000_009D);
    pub const NOT_SUPPORTED: Self = Self(0xC000_00BB);
    pub const BAD_DEVICE_TYPE: Self = Self(0xC000_00CB);
    pub const CANCELLED: Self = Self(0xC000_0120);
    pub const INVALID_DEVICE_STATE: Self = Self(0xC000_0184);

    /// Success and informational codes have the severity bit clear
    pub fn is_success(self) -> bool {
        (self.0 as i32) >= 0
    }

    pub fn name(self) -> Option<&'static str> {
        let name = match self {
            Self::SUCCESS => "STATUS_SUCCESS",
            Self::TIMEOUT => "STATUS_TIMEOUT",
            Self::PENDING => "STATUS_PENDING",
            Self::DEVICE_BUSY => "STATUS_DEVICE_BUSY",
            Self::NO_MORE_ENTRIES => "STATUS_NO_MORE_ENTRIES",
            Self::UNSUCCESSFUL => "STATUS_UNSUCCESSFUL",
            Self::INVALID_PARAMETER => "STATUS_INVALID_PARAMETER",
            Self::NO_MEMORY => "STATUS_NO_MEMORY",
            Self::BUFFER_TOO_SMALL => "STATUS_BUFFER_TOO_SMALL",
            Self::DELETE_PENDING => "STATUS_DELETE_PENDING",
            Self::INSUFFICIENT_RESOURCES => "STATUS_INSUFFICIENT_RESOURCES",
            Self::DEVICE_NOT_CONNECTED => "STATUS_DEVICE_NOT_CONNECTED",
            Self::NOT_SUPPORTED => "STATUS_NOT_SUPPORTED",
            Self::BAD_DEVICE_TYPE => "STATUS_BAD_DEVICE_TYPE",
            Self::CANCELLED => "STATUS_CANCELLED",
            Self::INVALID_DEVICE_STATE => "STATUS_INVALID_DEVICE_STATE",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for NtStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} ({:#010x})", name, self.0),
            None => write!(f, "{:#010x}", self.0),
        }
    }
}

/// USB-level status carried inside a URB
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UsbdStatus(pub u32);

impl UsbdStatus {
    pub const SUCCESS: Self = Self(0x0000_0000);
    pub const PENDING: Self = Self(0x4000_0000);
    pub const INVALID_URB_FUNCTION: Self = Self(0x8000_0200);
    pub const INVALID_PARAMETER: Self = Self(0x8000_0300);
    pub const ERROR_BUSY: Self = Self(0x8000_0400);
    pub const INVALID_PIPE_HANDLE: Self = Self(0x8000_0600);
    pub const CRC: Self = Self(0xC000_0001);
    pub const STALL_PID: Self = Self(0xC000_0004);
    pub const DEV_NOT_RESPONDING: Self = Self(0xC000_0005);
    pub const DATA_OVERRUN: Self = Self(0xC000_0008);
    pub const DATA_UNDERRUN: Self = Self(0xC000_0009);
    pub const BUFFER_OVERRUN: Self = Self(0xC000_000C);
    pub const ENDPOINT_HALTED: Self = Self(0xC000_0030);
    pub const NOT_SUPPORTED: Self = Self(0xC000_0E00);
    pub const TIMEOUT: Self = Self(0xC000_6000);
    pub const DEVICE_GONE: Self = Self(0xC000_7000);
    pub const CANCELED: Self = Self(0xC001_0000);

    pub fn is_success(self) -> bool {
        (self.0 as i32) >= 0
    }

    /// Outer status a bus driver reports alongside this URB status
    pub fn to_nt_status(self) -> NtStatus {
        match self {
            s if s.is_success() => NtStatus::SUCCESS,
            Self::CANCELED => NtStatus::CANCELLED,
            Self::TIMEOUT => NtStatus::TIMEOUT,
            Self::DEVICE_GONE => NtStatus::DEVICE_NOT_CONNECTED,
            Self::INVALID_PARAMETER | Self::INVALID_PIPE_HANDLE | Self::INVALID_URB_FUNCTION => {
                NtStatus::INVALID_PARAMETER
            }
            Self::NOT_SUPPORTED => NtStatus::NOT_SUPPORTED,
            Self::ERROR_BUSY => NtStatus::DEVICE_BUSY,
            _ => NtStatus::UNSUCCESSFUL,
        }
    }
}

impl fmt::Display for UsbdStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "USBD {:#010x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity() {
        assert!(NtStatus::SUCCESS.is_success());
        assert!(NtStatus::PENDING.is_success());
        assert!(!NtStatus::DEVICE_BUSY.is_success());
        assert!(!NtStatus::CANCELLED.is_success());
        assert!(UsbdStatus::PENDING.is_success());
        assert!(!UsbdStatus::STALL_PID.is_success());
    }

    #[test]
    fn test_usbd_to_nt() {
        assert_eq!(UsbdStatus::SUCCESS.to_nt_status(), NtStatus::SUCCESS);
        assert_eq!(UsbdStatus::CANCELED.to_nt_status(), NtStatus::CANCELLED);
        assert_eq!(UsbdStatus::STALL_PID.to_nt_status(), NtStatus::UNSUCCESSFUL);
    }

    #[test]
    fn test_display() {
        let text = NtStatus::INVALID_PARAMETER.to_string();
        assert!(text.contains("STATUS_INVALID_PARAMETER"));
        assert!(text.contains("0xc000000d"));
        assert_eq!(NtStatus(0x1234).to_string(), "0x00001234");
    }
}
