//! Split transfers
//!
//! The buffer is cut into chunks, one sub-request per chunk, and every
//! sub-request is submitted before any completion is awaited. Each
//! sub-request sits on an outstanding list until its completion removes
//! it; whichever completion empties the list finalizes the transfer.
//!
//! A sub-request is shared between its completion and any canceller by a
//! reference count. Cancellers take a reference while holding the list
//! lock, cancel outside it and drop the reference afterwards; the side that
//! drops the count to zero frees the sub-request.
//!
//! Read chunks may land out of order and a short chunk leaves a gap before
//! the chunks after it. At finalization the received bytes of every chunk
//! are moved down, in chunk order, so the buffer prefix reads as one
//! contiguous transfer. A short or failed chunk also cancels every later
//! chunk still outstanding.

use super::{Chunk, PendingTransfer, Transfer, chunk_count, plan_chunks};
use crate::device::{UsbDevice, lock};
use crate::irp::IoCompletion;
use crate::remove_lock::RemoveLockGuard;
use common::{Completion, Error, Result, Submission, Urb};
use protocol::{Direction, NtStatus};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

struct SubRequest {
    index: usize,
    chunk: Chunk,
    refs: AtomicUsize,
    cancel: CancellationToken,
    /// Cancelled because an earlier chunk ended short or failed
    induced: AtomicBool,
}

#[derive(Debug, Clone)]
struct ChunkResult {
    transferred: usize,
    error: Option<Error>,
    induced: bool,
}

#[derive(Default)]
struct SplitState {
    outstanding: Vec<Arc<SubRequest>>,
    results: Vec<Option<ChunkResult>>,
}

struct SplitTransfer {
    device: Arc<UsbDevice>,
    transfer: Transfer,
    sequence: u32,
    chunks: Vec<Chunk>,
    state: Mutex<SplitState>,
    /// Bytes reported by completions so far
    total: AtomicUsize,
    reply: Mutex<Option<oneshot::Sender<IoCompletion>>>,
    guard: Mutex<Option<RemoveLockGuard>>,
    finalized: CancellationToken,
}

pub(super) async fn start(
    device: &Arc<UsbDevice>,
    transfer: Transfer,
    sequence: u32,
    guard: RemoveLockGuard,
) -> Result<PendingTransfer> {
    let limit = transfer.chunk_limit();
    let count = chunk_count(transfer.len(), limit);
    let quota = device.tunables.max_split_requests;
    if count > quota {
        return Err(Error::InsufficientResources(format!(
            "{} sub-requests exceed the limit of {}",
            count, quota
        )));
    }
    let chunks = plan_chunks(transfer.len(), limit);

    let base_frame = if transfer.is_iso() {
        device.iso_start_frame(transfer.flags, transfer.latency).await?
    } else {
        None
    };

    let mut outstanding = Vec::new();
    outstanding
        .try_reserve_exact(chunks.len())
        .map_err(|e| Error::InsufficientResources(format!("sub-request list: {}", e)))?;
    let mut urbs = Vec::new();
    urbs.try_reserve_exact(chunks.len())
        .map_err(|e| Error::InsufficientResources(format!("sub-request URBs: {}", e)))?;

    // Anything built so far is dropped if a window cannot be mapped.
    let whole = transfer.buffer.whole();
    for (index, chunk) in chunks.iter().enumerate() {
        let window = whole.partial(chunk.offset, chunk.len).map_err(|e| {
            Error::InsufficientResources(format!("partial buffer for chunk {}: {}", index, e))
        })?;
        let start_frame = base_frame.map(|frame| {
            let packets_before = chunk.offset / transfer.packet_size.max(1);
            frame.wrapping_add(packets_before as u32)
        });
        urbs.push(transfer.urb(window, start_frame));
        outstanding.push(Arc::new(SubRequest {
            index,
            chunk: *chunk,
            refs: AtomicUsize::new(1),
            cancel: CancellationToken::new(),
            induced: AtomicBool::new(false),
        }));
    }

    // The cancellation state observed here decides whether anything is
    // submitted at all.
    if transfer.cancel.is_cancelled() {
        debug!("[{} #{}] cancelled before submission", transfer.label(), sequence);
        return Err(Error::Cancelled);
    }

    device.endpoint(transfer.pipe.address).begin(sequence);
    device
        .stats
        .sub_requests_created
        .fetch_add(chunks.len(), Ordering::SeqCst);
    device.stats.splits_started.fetch_add(1, Ordering::SeqCst);

    let (reply, rx) = oneshot::channel();
    let subs = outstanding.clone();
    let split = Arc::new(SplitTransfer {
        device: device.clone(),
        sequence,
        state: Mutex::new(SplitState {
            outstanding,
            results: vec![None; chunks.len()],
        }),
        chunks,
        total: AtomicUsize::new(0),
        reply: Mutex::new(Some(reply)),
        guard: Mutex::new(Some(guard)),
        finalized: CancellationToken::new(),
        transfer,
    });

    debug!(
        "[{} #{}] split into {} sub-requests of up to {} bytes",
        split.transfer.label(),
        sequence,
        split.chunks.len(),
        limit
    );

    let watcher = split.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = watcher.transfer.cancel.cancelled() => watcher.cancel_outstanding(),
            _ = watcher.finalized.cancelled() => {}
        }
    });

    // Every constructed sub-request goes down, cancelled or not.
    for (sub, urb) in subs.into_iter().zip(urbs) {
        split.submit(sub, urb);
    }
    Ok(rx)
}

impl SplitTransfer {
    fn submit(self: &Arc<Self>, sub: Arc<SubRequest>, urb: Urb) {
        let split = self.clone();
        let cancel = sub.cancel.clone();
        self.device.target().submit(Submission::new(
            urb,
            cancel,
            Completion::new(move |urb, status| split.on_complete(&sub, urb, status)),
        ));
    }

    fn on_complete(self: &Arc<Self>, sub: &Arc<SubRequest>, urb: Urb, status: NtStatus) {
        self.device.touch();
        let transferred = urb.transferred().min(sub.chunk.len);
        let error = Error::from_completion(status, urb.status);
        self.total.fetch_add(transferred, Ordering::SeqCst);

        trace!(
            "[#{}] sub-request {} done: {} of {} bytes, status {}, urb status {}",
            self.sequence,
            sub.index,
            transferred,
            sub.chunk.len,
            status,
            urb.status
        );

        let cuts_later = !self.transfer.is_iso()
            && sub.index + 1 < self.chunks.len()
            && (error.is_some() || transferred < sub.chunk.len);

        let (to_cancel, last) = {
            let mut state = lock(&self.state);
            state.outstanding.retain(|s| !Arc::ptr_eq(s, sub));
            state.results[sub.index] = Some(ChunkResult {
                transferred,
                error,
                induced: sub.induced.load(Ordering::SeqCst),
            });

            let mut to_cancel = Vec::new();
            if cuts_later {
                for later in state.outstanding.iter().filter(|s| s.index > sub.index) {
                    later.refs.fetch_add(1, Ordering::SeqCst);
                    later.induced.store(true, Ordering::SeqCst);
                    to_cancel.push(later.clone());
                }
            }
            (to_cancel, state.outstanding.is_empty())
        };

        if !to_cancel.is_empty() {
            debug!(
                "[#{}] chunk {} ended short, cancelling {} later chunk(s)",
                self.sequence,
                sub.index,
                to_cancel.len()
            );
        }
        for later in &to_cancel {
            later.cancel.cancel();
            self.release(later);
        }

        self.release(sub);
        if last {
            self.finalize();
        }
    }

    /// Cancels every outstanding sub-request after the client cancelled
    fn cancel_outstanding(&self) {
        let pending: Vec<Arc<SubRequest>> = {
            let state = lock(&self.state);
            state
                .outstanding
                .iter()
                .map(|sub| {
                    sub.refs.fetch_add(1, Ordering::SeqCst);
                    sub.clone()
                })
                .collect()
        };
        debug!(
            "[#{}] cancel: {} sub-request(s) outstanding",
            self.sequence,
            pending.len()
        );
        for sub in &pending {
            sub.cancel.cancel();
            self.release(sub);
        }
    }

    fn release(&self, sub: &SubRequest) {
        if sub.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            trace!("[#{}] sub-request {} freed", self.sequence, sub.index);
            self.device
                .stats
                .sub_requests_freed
                .fetch_add(1, Ordering::SeqCst);
        }
    }

    fn finalize(&self) {
        let results = std::mem::take(&mut lock(&self.state).results);
        let Some(reply) = lock(&self.reply).take() else {
            error!("[#{}] split transfer finalized twice", self.sequence);
            return;
        };

        let compact = self.transfer.direction() == Direction::In && !self.transfer.is_iso();
        let mut cursor = 0usize;
        let mut failure: Option<Error> = None;

        for (chunk, result) in self.chunks.iter().zip(results) {
            let Some(result) = result else {
                warn!("[#{}] chunk at {} never completed", self.sequence, chunk.offset);
                continue;
            };
            if let Some(err) = result.error {
                if !result.induced && failure.is_none() {
                    failure = Some(err);
                }
            }
            let n = result.transferred;
            if compact && n > 0 && chunk.offset != cursor {
                let src = chunk.offset..chunk.offset + n;
                if let Err(e) = self.transfer.buffer.copy_within(src, cursor) {
                    error!("[#{}] compaction failed: {}", self.sequence, e);
                }
            }
            cursor += n;
        }

        let total = self.total.load(Ordering::SeqCst);
        debug_assert_eq!(total, cursor);
        let completion = if self.transfer.cancel.is_cancelled() {
            IoCompletion::from_error(&Error::Cancelled, total)
        } else if let Some(err) = failure {
            IoCompletion::from_error(&err, total)
        } else {
            IoCompletion::success(total)
        };

        debug!(
            "[{} #{}] split complete: status {}, {} of {} bytes",
            self.transfer.label(),
            self.sequence,
            completion.status,
            total,
            self.transfer.len()
        );

        self.device
            .stats
            .splits_finalized
            .fetch_add(1, Ordering::SeqCst);
        let _ = reply.send(completion);
        drop(lock(&self.guard).take());
        self.finalized.cancel();
    }
}
