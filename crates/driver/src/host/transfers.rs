//! URB execution against a real device through rusb
//!
//! Every call here blocks the bus thread. Data transfers are issued in
//! short slices of [`POLL_INTERVAL`] so a cancelled URB is noticed within
//! one slice instead of holding the thread until the device answers.
//!
//! A slice that runs out after moving some bytes comes back from rusb as
//! `Ok(n)`, not as a timeout. Only a count that is not a whole number of
//! packets (or zero) ends a transfer early.

use common::{ControlTransfer, DataTransfer, PipeHandle, UrbFlags};
use protocol::{PipeType, UsbdStatus};
use rusb::{Context, DeviceHandle};
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Longest single blocking call on a data pipe
pub const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Timeout for control transfers; the driver above enforces its own limit
const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

pub(super) type UsbResult<T> = std::result::Result<T, UsbdStatus>;

/// An open pipe on the host device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostPipe {
    pub address: u8,
    pub interface: u8,
    pub pipe_type: PipeType,
    pub packet_size: u16,
}

pub(super) type PipeMap = HashMap<PipeHandle, HostPipe>;

/// Maps a rusb failure onto the USB status a host controller would report
pub fn map_rusb_error(err: rusb::Error) -> UsbdStatus {
    match err {
        rusb::Error::Timeout => UsbdStatus::TIMEOUT,
        rusb::Error::Pipe => UsbdStatus::STALL_PID,
        rusb::Error::NoDevice => UsbdStatus::DEVICE_GONE,
        rusb::Error::NotFound => UsbdStatus::INVALID_PIPE_HANDLE,
        rusb::Error::Busy => UsbdStatus::ERROR_BUSY,
        rusb::Error::Overflow => UsbdStatus::DATA_OVERRUN,
        rusb::Error::Interrupted => UsbdStatus::CANCELED,
        rusb::Error::InvalidParam => UsbdStatus::INVALID_PARAMETER,
        rusb::Error::NotSupported => UsbdStatus::NOT_SUPPORTED,
        _ => UsbdStatus::DEV_NOT_RESPONDING,
    }
}

pub(super) fn control(handle: &DeviceHandle<Context>, transfer: &mut ControlTransfer) -> UsbResult<()> {
    let setup = transfer.setup;
    let len = (setup.length as usize).min(transfer.buffer.len());
    debug!(
        "Control transfer: request_type={:#x}, request={:#x}, value={:#x}, index={:#x}, len={}",
        setup.request_type, setup.request, setup.value, setup.index, len
    );

    if setup.direction().is_in() {
        let mut data = vec![0u8; len];
        let n = handle
            .read_control(
                setup.request_type,
                setup.request,
                setup.value,
                setup.index,
                &mut data,
                CONTROL_TIMEOUT,
            )
            .map_err(map_rusb_error)?;
        transfer.transferred = transfer.buffer.write(0, &data[..n]);
    } else {
        let data = transfer.buffer.read();
        transfer.transferred = handle
            .write_control(
                setup.request_type,
                setup.request,
                setup.value,
                setup.index,
                &data[..len],
                CONTROL_TIMEOUT,
            )
            .map_err(map_rusb_error)?;
    }
    Ok(())
}

/// Runs one blocking call slice by slice until it completes or the URB is
/// cancelled
fn poll<T>(
    cancel: &CancellationToken,
    mut call: impl FnMut(Duration) -> Result<T, rusb::Error>,
) -> UsbResult<T> {
    loop {
        match call(POLL_INTERVAL) {
            Ok(value) => return Ok(value),
            Err(rusb::Error::Timeout) if !cancel.is_cancelled() => continue,
            Err(rusb::Error::Timeout) => return Err(UsbdStatus::CANCELED),
            Err(e) => return Err(map_rusb_error(e)),
        }
    }
}

/// Moves up to `len` bytes, one slice at a time, resuming at the offset
/// reached so far. Returns the bytes moved and how the transfer ended.
fn stream(
    cancel: &CancellationToken,
    len: usize,
    packet_size: usize,
    mut call: impl FnMut(usize, Duration) -> Result<usize, rusb::Error>,
) -> (usize, UsbResult<()>) {
    let mut done = 0;
    while done < len {
        let n = match poll(cancel, |t| call(done, t)) {
            Ok(n) => n.min(len - done),
            Err(status) => return (done, Err(status)),
        };
        done += n;
        if n == 0 || packet_size == 0 || n % packet_size != 0 {
            break;
        }
        if done < len && cancel.is_cancelled() {
            return (done, Err(UsbdStatus::CANCELED));
        }
    }
    (done, Ok(()))
}

pub(super) fn data(
    handle: &DeviceHandle<Context>,
    pipes: &PipeMap,
    transfer: &mut DataTransfer,
    cancel: &CancellationToken,
) -> UsbResult<()> {
    let pipe = pipes
        .get(&transfer.pipe)
        .copied()
        .ok_or(UsbdStatus::INVALID_PIPE_HANDLE)?;
    let endpoint = pipe.address;
    let packet_size = pipe.packet_size as usize;
    let len = transfer.buffer.len();

    if transfer.flags.direction().is_in() {
        let mut data = vec![0u8; len];
        let (n, result) = match pipe.pipe_type {
            PipeType::Interrupt => stream(cancel, len, packet_size, |at, t| {
                handle.read_interrupt(endpoint, &mut data[at..], t)
            }),
            _ => stream(cancel, len, packet_size, |at, t| {
                handle.read_bulk(endpoint, &mut data[at..], t)
            }),
        };
        transfer.transferred = transfer.buffer.write(0, &data[..n]);
        result?;
        if n < len && !transfer.flags.contains(UrbFlags::SHORT_TRANSFER_OK) {
            debug!("Short read on endpoint {:#04x}: {} of {}", endpoint, n, len);
            return Err(UsbdStatus::DATA_UNDERRUN);
        }
    } else {
        let data = transfer.buffer.read();
        let (n, result) = match pipe.pipe_type {
            PipeType::Interrupt => stream(cancel, len, packet_size, |at, t| {
                handle.write_interrupt(endpoint, &data[at..], t)
            }),
            _ => stream(cancel, len, packet_size, |at, t| {
                handle.write_bulk(endpoint, &data[at..], t)
            }),
        };
        transfer.transferred = n;
        result?;
    }
    Ok(())
}

pub(super) fn reset_pipe(
    handle: &mut DeviceHandle<Context>,
    pipes: &PipeMap,
    pipe: PipeHandle,
) -> UsbResult<()> {
    let pipe = pipes.get(&pipe).ok_or(UsbdStatus::INVALID_PIPE_HANDLE)?;
    handle.clear_halt(pipe.address).map_err(|e| {
        warn!("Failed to clear halt on {:#04x}: {}", pipe.address, e);
        map_rusb_error(e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_rusb_error() {
        assert_eq!(map_rusb_error(rusb::Error::Timeout), UsbdStatus::TIMEOUT);
        assert_eq!(map_rusb_error(rusb::Error::Pipe), UsbdStatus::STALL_PID);
        assert_eq!(map_rusb_error(rusb::Error::NoDevice), UsbdStatus::DEVICE_GONE);
        assert_eq!(map_rusb_error(rusb::Error::Other), UsbdStatus::DEV_NOT_RESPONDING);
    }

    #[test]
    fn test_poll_stops_once_cancelled() {
        let cancel = CancellationToken::new();
        let mut calls = 0;
        let result: UsbResult<usize> = poll(&cancel, |_| {
            calls += 1;
            if calls == 3 {
                cancel.cancel();
            }
            Err(rusb::Error::Timeout)
        });
        assert_eq!(result, Err(UsbdStatus::CANCELED));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_poll_passes_through_success() {
        let cancel = CancellationToken::new();
        let result = poll(&cancel, |_| Ok(64usize));
        assert_eq!(result, Ok(64));
    }

    #[test]
    fn test_stream_resumes_after_partial_slice() {
        let cancel = CancellationToken::new();
        let mut offsets = Vec::new();
        let (n, result) = stream(&cancel, 16384, 64, |at, _| {
            offsets.push(at);
            // A slice ran out after four packets, then the rest arrives
            Ok(if at == 0 { 256 } else { 16384 - at })
        });
        assert_eq!(result, Ok(()));
        assert_eq!(n, 16384);
        assert_eq!(offsets, vec![0, 256]);
    }

    #[test]
    fn test_stream_ends_on_short_packet() {
        let cancel = CancellationToken::new();
        let mut calls = 0;
        let (n, result) = stream(&cancel, 4096, 512, |at, _| {
            calls += 1;
            Ok(if at == 0 { 1024 } else { 100 })
        });
        assert_eq!(result, Ok(()));
        assert_eq!(n, 1124);
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_stream_ends_on_zero_length_packet() {
        let cancel = CancellationToken::new();
        let (n, result) = stream(&cancel, 4096, 512, |at, _| Ok(if at == 0 { 512 } else { 0 }));
        assert_eq!(result, Ok(()));
        assert_eq!(n, 512);
    }

    #[test]
    fn test_stream_keeps_count_when_cancelled() {
        let cancel = CancellationToken::new();
        let (n, result) = stream(&cancel, 4096, 64, |at, _| {
            if at == 0 {
                Ok(128)
            } else {
                cancel.cancel();
                Err(rusb::Error::Timeout)
            }
        });
        assert_eq!(result, Err(UsbdStatus::CANCELED));
        assert_eq!(n, 128);
    }

    #[test]
    fn test_stream_passes_through_errors() {
        let cancel = CancellationToken::new();
        let (n, result) = stream(&cancel, 4096, 64, |at, _| {
            if at == 0 { Ok(64) } else { Err(rusb::Error::Pipe) }
        });
        assert_eq!(result, Err(UsbdStatus::STALL_PID));
        assert_eq!(n, 64);
    }
}
