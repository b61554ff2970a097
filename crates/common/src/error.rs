//! Common error types
//!
//! One variant per failure class a request can end with. Every variant maps
//! to the completion status the client observes through [`Error::nt_status`].

use protocol::{NtStatus, ProtocolError, UsbdStatus};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Device not configured")]
    DeviceNotConfigured,

    #[error("Device not started")]
    DeviceNotStarted,

    #[error("Device busy: {0}")]
    DeviceBusy(String),

    #[error("Delete pending")]
    DeletePending,

    #[error("Operation timed out")]
    Timeout,

    #[error("Request cancelled")]
    Cancelled,

    /// The lower stack failed the request; both codes kept as reported
    #[error("Transport failure: {status}, {urb_status}")]
    Transport {
        status: NtStatus,
        urb_status: UsbdStatus,
    },

    /// Allocation failure while building a request batch
    #[error("Insufficient resources: {0}")]
    InsufficientResources(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Buffer too small: needed {needed}, got {available}")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("No more entries")]
    NoMoreEntries,

    #[error("Bad device: {0}")]
    BadDevice(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl Error {
    /// Builds a transport error from a completed request, or `None` when
    /// both codes report success
    pub fn from_completion(status: NtStatus, urb_status: UsbdStatus) -> Option<Self> {
        if status.is_success() && urb_status.is_success() {
            return None;
        }
        match (status, urb_status) {
            (NtStatus::CANCELLED, _) | (_, UsbdStatus::CANCELED) => Some(Error::Cancelled),
            _ => Some(Error::Transport { status, urb_status }),
        }
    }

    /// Completion status placed in the client-visible result
    pub fn nt_status(&self) -> NtStatus {
        match self {
            Error::InvalidParameter(_) | Error::Protocol(_) | Error::Config(_) => {
                NtStatus::INVALID_PARAMETER
            }
            Error::DeviceNotConfigured => NtStatus::INVALID_DEVICE_STATE,
            Error::DeviceNotStarted => NtStatus::DEVICE_NOT_CONNECTED,
            Error::DeviceBusy(_) => NtStatus::DEVICE_BUSY,
            Error::DeletePending => NtStatus::DELETE_PENDING,
            Error::Timeout => NtStatus::TIMEOUT,
            Error::Cancelled => NtStatus::CANCELLED,
            Error::Transport { status, urb_status } => {
                if status.is_success() {
                    urb_status.to_nt_status()
                } else {
                    *status
                }
            }
            Error::InsufficientResources(_) => NtStatus::INSUFFICIENT_RESOURCES,
            Error::NotSupported(_) => NtStatus::NOT_SUPPORTED,
            Error::BufferTooSmall { .. } => NtStatus::BUFFER_TOO_SMALL,
            Error::NoMoreEntries => NtStatus::NO_MORE_ENTRIES,
            Error::BadDevice(_) => NtStatus::BAD_DEVICE_TYPE,
            Error::Channel(_) => NtStatus::UNSUCCESSFUL,
        }
    }

    /// USB-level status, when the lower stack supplied one
    pub fn urb_status(&self) -> Option<UsbdStatus> {
        match self {
            Error::Transport { urb_status, .. } => Some(*urb_status),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
