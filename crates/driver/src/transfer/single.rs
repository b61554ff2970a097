//! Single-URB transfers with in-place continuation
//!
//! The URB covers as much of the buffer as one URB may carry. When it
//! completes successfully with a non-zero, packet-aligned byte count and
//! bytes remain, the same URB is pointed at the rest of the buffer and
//! resubmitted from the completion handler. That only happens while this
//! transfer is still the newest one started on the endpoint and no other
//! submission holds the endpoint's pending flag; otherwise the transfer
//! finishes with what it has.

use super::{EndpointState, PendingTransfer, Transfer};
use crate::device::UsbDevice;
use crate::irp::IoCompletion;
use crate::remove_lock::RemoveLockGuard;
use common::{Completion, Error, Result, Submission, Urb, UrbFunction};
use protocol::{NtStatus, PipeType, UsbdStatus};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::sync::oneshot;
use tracing::{debug, error};

struct SingleShot {
    device: Arc<UsbDevice>,
    endpoint: Arc<EndpointState>,
    transfer: Transfer,
    sequence: u32,
    /// Bytes completed by earlier passes
    done: usize,
    reply: oneshot::Sender<IoCompletion>,
    _guard: RemoveLockGuard,
}

pub(super) async fn start(
    device: &Arc<UsbDevice>,
    transfer: Transfer,
    sequence: u32,
    guard: RemoveLockGuard,
) -> Result<PendingTransfer> {
    let start_frame = if transfer.is_iso() {
        device.iso_start_frame(transfer.flags, transfer.latency).await?
    } else {
        None
    };

    let first = transfer.len().min(transfer.chunk_limit());
    let window = transfer.buffer.whole().partial(0, first)?;
    let urb = transfer.urb(window, start_frame);

    let endpoint = device.endpoint(transfer.pipe.address);
    let (reply, rx) = oneshot::channel();
    let context = SingleShot {
        device: device.clone(),
        endpoint: endpoint.clone(),
        transfer,
        sequence,
        done: 0,
        reply,
        _guard: guard,
    };

    endpoint.enter();
    endpoint.last_started.store(sequence, Ordering::SeqCst);
    context.submit(urb);
    endpoint.leave();
    Ok(rx)
}

impl SingleShot {
    fn submit(self, urb: Urb) {
        let target = self.device.target().clone();
        let cancel = self.transfer.cancel.clone();
        target.submit(Submission::new(
            urb,
            cancel,
            Completion::new(move |urb, status| self.complete(urb, status)),
        ));
    }

    fn complete(mut self, urb: Urb, status: NtStatus) {
        self.device.touch();
        let urb_status = urb.status;
        let ok = status.is_success() && urb_status.is_success();
        let transmitted = urb.transferred();
        self.done += transmitted;

        let total = self.transfer.len();
        let remaining = total.saturating_sub(self.done);
        let packet = self.transfer.pipe.max_packet_size as usize;

        debug!(
            "sequence {}: {} bytes transmitted, max packet size={}, remaining={}",
            self.sequence, transmitted, packet, remaining
        );

        if ok
            && self.transfer.pipe.pipe_type != PipeType::Isochronous
            && transmitted > 0
            && packet > 0
            && transmitted % packet == 0
            && remaining > 0
        {
            match self.rearm(urb, remaining) {
                Ok(()) => return,
                Err(this) => self = this,
            }
        }

        let completion = if ok {
            IoCompletion::success(self.done)
        } else {
            let err = Error::from_completion(status, urb_status)
                .unwrap_or(Error::Transport {
                    status: NtStatus::UNSUCCESSFUL,
                    urb_status: UsbdStatus::SUCCESS,
                });
            if err == Error::Cancelled {
                debug!("sequence {}: cancelled", self.sequence);
            } else {
                error!(
                    "sequence {}: transfer failed: status {}, urb status {}",
                    self.sequence, status, urb_status
                );
            }
            IoCompletion::from_error(&err, self.done)
        };
        self.finish(completion);
    }

    /// Points the URB at the next window and resubmits it. Hands the
    /// context back when the continuation is not allowed.
    fn rearm(self, mut urb: Urb, remaining: usize) -> std::result::Result<(), Self> {
        let endpoint = self.endpoint.clone();
        if !endpoint.try_enter() {
            debug!("sequence {}: resend aborted, pending conflict", self.sequence);
            return Err(self);
        }
        if endpoint.last_started() != self.sequence {
            debug!("sequence {}: resend aborted, newer transfer pending", self.sequence);
            self.device
                .stats
                .stale_continuations
                .fetch_add(1, Ordering::SeqCst);
            endpoint.leave();
            return Err(self);
        }

        let next = remaining.min(self.transfer.chunk_limit());
        let window = match self.transfer.buffer.whole().partial(self.done, next) {
            Ok(window) => window,
            Err(e) => {
                error!("sequence {}: cannot map continuation: {}", self.sequence, e);
                endpoint.leave();
                return Err(self);
            }
        };
        if let UrbFunction::BulkOrInterrupt(data) = &mut urb.function {
            data.buffer = window;
            data.transferred = 0;
        }
        urb.status = UsbdStatus::SUCCESS;

        self.submit(urb);
        endpoint.leave();
        Ok(())
    }

    fn finish(self, completion: IoCompletion) {
        debug!(
            "sequence {}: complete, status {}, {} bytes",
            self.sequence, completion.status, completion.information
        );
        let _ = self.reply.send(completion);
    }
}
