//! Transfer engine
//!
//! A bulk, interrupt or isochronous transfer runs down one of two paths.
//! Transfers that fit in one URB go through the single-shot path, which
//! also re-arms its URB in place when a packet-aligned completion leaves
//! bytes outstanding. Larger transfers are split into chunks that are all
//! submitted together and reassembled when the last one completes.

mod plan;
mod single;
mod split;

pub use plan::{
    Chunk, MAX_ISO_PACKETS, chunk_count, chunk_limit, max_transfer_size, plan_chunks,
};

use crate::device::UsbDevice;
use crate::irp::IoCompletion;
use crate::pipes::PipeRecord;
use crate::remove_lock::RemoveLockGuard;
use common::{
    DataTransfer, Error, IsoTransfer, Mdl, Result, TransferBuffer, Urb, UrbFlags, UrbFunction,
    urb::iso_packets,
};
use protocol::{Direction, PipeType, TransferFlags};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Busy-wait iterations on a held endpoint before yielding the thread
const SPIN_LIMIT: u32 = 64;

static SEQUENCE: AtomicU32 = AtomicU32::new(0);

fn next_sequence() -> u32 {
    SEQUENCE.fetch_add(1, Ordering::SeqCst).wrapping_add(1)
}

/// Per-endpoint ordering state.
///
/// `pending` is held only while a URB for the endpoint is being handed to
/// the bus. `last_started` is the sequence of the newest transfer started
/// on the endpoint; a continuation of any older transfer gives up.
#[derive(Debug, Default)]
pub struct EndpointState {
    pending: AtomicBool,
    last_started: AtomicU32,
}

impl EndpointState {
    fn try_enter(&self) -> bool {
        self.pending
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Waits out another thread's hand-off. The holder only ever runs a
    /// non-blocking `UsbBus::submit`, so after a short spin the thread yields.
    fn enter(&self) {
        let mut spins = 0u32;
        while !self.try_enter() {
            if spins < SPIN_LIMIT {
                spins += 1;
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
    }

    fn leave(&self) {
        self.pending.store(false, Ordering::Release);
    }

    pub fn last_started(&self) -> u32 {
        self.last_started.load(Ordering::SeqCst)
    }

    /// Marks `sequence` as the newest transfer on the endpoint
    fn begin(&self, sequence: u32) {
        self.enter();
        self.last_started.store(sequence, Ordering::SeqCst);
        self.leave();
    }
}

/// Split-transfer counters, observable for diagnostics
#[derive(Debug, Default)]
pub struct TransferStats {
    pub(crate) splits_started: AtomicUsize,
    pub(crate) splits_finalized: AtomicUsize,
    pub(crate) sub_requests_created: AtomicUsize,
    pub(crate) sub_requests_freed: AtomicUsize,
    pub(crate) stale_continuations: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferStatsSnapshot {
    pub splits_started: usize,
    pub splits_finalized: usize,
    pub sub_requests_created: usize,
    pub sub_requests_freed: usize,
    pub stale_continuations: usize,
}

impl TransferStats {
    pub fn snapshot(&self) -> TransferStatsSnapshot {
        TransferStatsSnapshot {
            splits_started: self.splits_started.load(Ordering::SeqCst),
            splits_finalized: self.splits_finalized.load(Ordering::SeqCst),
            sub_requests_created: self.sub_requests_created.load(Ordering::SeqCst),
            sub_requests_freed: self.sub_requests_freed.load(Ordering::SeqCst),
            stale_continuations: self.stale_continuations.load(Ordering::SeqCst),
        }
    }
}

/// Receives the completion of a started transfer
pub type PendingTransfer = oneshot::Receiver<IoCompletion>;

/// A validated transfer ready for the bus
#[derive(Debug, Clone)]
pub(crate) struct Transfer {
    pub pipe: PipeRecord,
    /// Isochronous packet size
    pub packet_size: usize,
    pub max_transfer: usize,
    pub flags: TransferFlags,
    pub latency: u32,
    pub buffer: TransferBuffer,
    pub cancel: CancellationToken,
}

impl Transfer {
    fn direction(&self) -> Direction {
        self.pipe.direction()
    }

    fn len(&self) -> usize {
        self.buffer.len()
    }

    fn is_iso(&self) -> bool {
        self.pipe.pipe_type == PipeType::Isochronous
    }

    fn label(&self) -> &'static str {
        match (self.pipe.pipe_type, self.direction()) {
            (PipeType::Control, Direction::In) => "ctrl-read",
            (PipeType::Control, Direction::Out) => "ctrl-write",
            (PipeType::Isochronous, Direction::In) => "iso-read",
            (PipeType::Isochronous, Direction::Out) => "iso-write",
            (PipeType::Bulk, Direction::In) => "bulk-read",
            (PipeType::Bulk, Direction::Out) => "bulk-write",
            (PipeType::Interrupt, Direction::In) => "int-read",
            (PipeType::Interrupt, Direction::Out) => "int-write",
        }
    }

    /// Bytes one URB of this transfer may carry
    fn chunk_limit(&self) -> usize {
        chunk_limit(self.pipe.pipe_type, self.max_transfer, self.packet_size)
    }

    fn urb_flags(&self, start_frame: Option<u32>) -> UrbFlags {
        let mut flags = UrbFlags::default();
        if self.direction().is_in() {
            flags.insert(UrbFlags::DIRECTION_IN);
        }
        if !self.flags.contains(TransferFlags::SHORT_NOT_OK) {
            flags.insert(UrbFlags::SHORT_TRANSFER_OK);
        }
        if self.is_iso() && start_frame.is_none() {
            flags.insert(UrbFlags::START_ISO_TRANSFER_ASAP);
        }
        flags
    }

    /// URB moving the bytes of `window`
    fn urb(&self, window: Mdl, start_frame: Option<u32>) -> Urb {
        let flags = self.urb_flags(start_frame);
        if self.is_iso() {
            Urb::new(UrbFunction::Isochronous(IsoTransfer {
                pipe: self.pipe.handle,
                endpoint: self.pipe.address,
                flags,
                start_frame: start_frame.unwrap_or(0),
                packets: iso_packets(window.len(), self.packet_size),
                buffer: window,
                error_count: 0,
                transferred: 0,
            }))
        } else {
            Urb::new(UrbFunction::BulkOrInterrupt(DataTransfer {
                pipe: self.pipe.handle,
                endpoint: self.pipe.address,
                flags,
                buffer: window,
                transferred: 0,
            }))
        }
    }
}

impl UsbDevice {
    pub fn transfer_stats(&self) -> TransferStatsSnapshot {
        self.stats.snapshot()
    }

    /// Starts a validated transfer. The remove lock hold travels with the
    /// transfer and is released once its completion has been delivered.
    pub(crate) async fn submit_transfer(
        self: &Arc<Self>,
        transfer: Transfer,
        guard: RemoveLockGuard,
    ) -> Result<PendingTransfer> {
        let sequence = next_sequence();
        debug!(
            "[{} #{}] EP{:02X}h length={}, packet size={}, max transfer={}",
            transfer.label(),
            sequence,
            transfer.pipe.address,
            transfer.len(),
            transfer.packet_size,
            transfer.max_transfer
        );

        if transfer.len() > transfer.chunk_limit() {
            split::start(self, transfer, sequence, guard).await
        } else {
            single::start(self, transfer, sequence, guard).await
        }
    }

    /// Frame an isochronous transfer starts at, or `None` for "as soon as
    /// possible"
    pub(crate) async fn iso_start_frame(&self, flags: TransferFlags, latency: u32) -> Result<Option<u32>> {
        if !flags.contains(TransferFlags::ISO_SET_START_FRAME) {
            return Ok(None);
        }
        let urb = self
            .call_usbd(
                Urb::new(UrbFunction::GetCurrentFrameNumber { frame: 0 }),
                self.tunables.default_timeout_ms,
            )
            .await?;
        let UrbFunction::GetCurrentFrameNumber { frame } = urb.function else {
            return Err(Error::BadDevice("frame number request changed function".into()));
        };
        let latency = if flags.contains(TransferFlags::ISO_ADD_LATENCY) {
            latency
        } else {
            0
        };
        Ok(Some(frame.wrapping_add(latency)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_enter_waits_for_holder() {
        let endpoint = Arc::new(EndpointState::default());
        assert!(endpoint.try_enter());

        let waiter = {
            let endpoint = endpoint.clone();
            std::thread::spawn(move || {
                endpoint.begin(7);
                endpoint.last_started()
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(endpoint.last_started(), 0);
        endpoint.leave();

        assert_eq!(waiter.join().unwrap(), 7);
        assert!(endpoint.try_enter());
    }
}
