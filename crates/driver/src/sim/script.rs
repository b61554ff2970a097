//! Scripted behaviour and observations of the simulated device

use common::PipeHandle;
use protocol::UsbdStatus;
use std::time::Duration;

/// How the simulated device answers one submission on an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Reply {
    /// Time before the device answers
    pub delay: Duration,
    /// Most bytes moved; a smaller window than requested makes a short transfer
    pub limit: Option<usize>,
    /// Fails the URB with this status instead of moving data
    pub status: Option<UsbdStatus>,
}

impl Reply {
    pub fn after(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn short(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    pub fn fail(status: UsbdStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// One bulk, interrupt or isochronous URB as the device saw it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRecord {
    pub endpoint: u8,
    pub pipe: PipeHandle,
    /// Offset of the URB's window in the client buffer
    pub offset: usize,
    pub requested: usize,
    pub transferred: usize,
    pub status: UsbdStatus,
    /// Frame the URB was scheduled in, for isochronous URBs
    pub start_frame: Option<u32>,
}

impl TransferRecord {
    pub fn was_cancelled(&self) -> bool {
        self.status == UsbdStatus::CANCELED
    }
}

/// Bytes an IN endpoint produces for the window at `offset` of the client
/// buffer. Depends only on the position so reordered completions can be
/// checked against the layout they should produce.
pub fn in_data(endpoint: u8, offset: usize, len: usize) -> Vec<u8> {
    (offset..offset + len)
        .map(|pos| (pos as u32).wrapping_mul(7).wrapping_add(pos as u32 >> 8) as u8 ^ endpoint)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_data_depends_on_position() {
        let whole = in_data(0x81, 0, 1024);
        assert_eq!(&whole[512..], in_data(0x81, 512, 512).as_slice());
        assert_ne!(in_data(0x81, 0, 64), in_data(0x82, 0, 64));
    }

    #[test]
    fn test_reply_builders() {
        let reply = Reply::short(100).delayed(Duration::from_millis(3));
        assert_eq!(reply.limit, Some(100));
        assert_eq!(reply.delay, Duration::from_millis(3));
        assert_eq!(Reply::fail(UsbdStatus::STALL_PID).status, Some(UsbdStatus::STALL_PID));
    }
}
