//! Client requests and their completions

use crate::pipes::OwnerId;
use bytes::Bytes;
use common::{Error, TransferBuffer};
use protocol::{IoctlCode, NtStatus, UsbdStatus};
use tokio_util::sync::CancellationToken;

/// One device I/O control request from a client handle.
///
/// `input` is the request header plus any trailing input. `buffer` is the
/// output buffer for buffered operations and the data buffer for direct
/// transfers (source for writes, destination for reads).
#[derive(Debug, Clone)]
pub struct IoRequest {
    pub code: u32,
    pub owner: OwnerId,
    pub input: Bytes,
    pub buffer: TransferBuffer,
    /// Cancelled when the client abandons the request
    pub cancel: CancellationToken,
}

impl IoRequest {
    pub fn new(
        code: IoctlCode,
        owner: OwnerId,
        input: impl Into<Bytes>,
        buffer: TransferBuffer,
    ) -> Self {
        Self::raw(code.code(), owner, input, buffer)
    }

    /// Request with an arbitrary control code
    pub fn raw(code: u32, owner: OwnerId, input: impl Into<Bytes>, buffer: TransferBuffer) -> Self {
        Self {
            code,
            owner,
            input: input.into(),
            buffer,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Final status of a request as the client sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoCompletion {
    pub status: NtStatus,
    /// Bytes returned or transferred
    pub information: usize,
    /// USB status of a failed bus operation
    pub urb_status: Option<UsbdStatus>,
}

impl IoCompletion {
    pub fn success(information: usize) -> Self {
        Self {
            status: NtStatus::SUCCESS,
            information,
            urb_status: None,
        }
    }

    pub fn from_error(err: &Error, information: usize) -> Self {
        Self {
            status: err.nt_status(),
            information,
            urb_status: err.urb_status(),
        }
    }

    pub fn from_result(result: &common::Result<usize>) -> Self {
        match result {
            Ok(n) => Self::success(*n),
            Err(e) => Self::from_error(e, 0),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}
