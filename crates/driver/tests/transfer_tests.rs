//! Transfer Engine Integration Tests
//!
//! Bulk, interrupt and isochronous transfers driven through the control-code
//! path against the simulated device.
//!
//! # Test Scenarios
//! - Split transfers reassemble in buffer order whatever the completion order
//! - Short chunks are compacted and cut off the chunks after them
//! - Client cancellation of a split transfer, before and after submission
//! - Sub-request quota enforced before chunks are planned
//! - Single-URB continuation and its stale-sequence guard
//! - Request validation before anything reaches the bus
//! - Isochronous start frames and halted endpoints
//!
//! Run with: `cargo test -p driver --test transfer_tests`

mod support;

use common::TransferBuffer;
use common::test_utils::with_timeout;
use driver::{DeviceSettings, DriverSettings};
use driver::sim::{Reply, in_data};
use driver::transfer::plan_chunks;
use proptest::prelude::*;
use protocol::{IoctlCode, NtStatus, Params, TransferFlags, UsbdStatus};
use rand::Rng;
use std::time::Duration;
use support::*;
use tokio_util::sync::CancellationToken;

const BULK_URB: &str = "BULK_OR_INTERRUPT_TRANSFER";

// ============================================================================
// Split transfers
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_split_read_reassembles_in_order() {
    let rig = Rig::started().await;
    let owner = rig.open();

    let (request, buffer) = bulk_read(owner, 40000, 16384);
    let completion = with_timeout(rig.ioctl(request)).await;

    assert_eq!(completion.status, NtStatus::SUCCESS);
    assert_eq!(completion.information, 40000);
    assert_eq!(buffer.to_vec(), in_data(BULK_IN, 0, 40000));

    let mut windows: Vec<(usize, usize)> = rig
        .bus
        .transfers()
        .iter()
        .map(|t| (t.offset, t.requested))
        .collect();
    windows.sort();
    assert_eq!(windows, vec![(0, 16384), (16384, 16384), (32768, 7232)]);

    let stats = rig.device.transfer_stats();
    assert_eq!(stats.splits_started, 1);
    assert_eq!(stats.splits_finalized, 1);
    assert_eq!(stats.sub_requests_created, 3);
    assert_eq!(stats.sub_requests_freed, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_split_read_random_completion_order() {
    let rig = Rig::started().await;
    let owner = rig.open();

    let replies: Vec<Reply> = {
        let mut rng = rand::rng();
        (0..32)
            .map(|_| Reply::after(Duration::from_millis(rng.random_range(0..20))))
            .collect()
    };
    rig.bus.script_all(BULK_IN, replies);

    let (request, buffer) = bulk_read(owner, 32 * 1024, 1024);
    let completion = with_timeout(rig.ioctl(request)).await;

    assert_eq!(completion.status, NtStatus::SUCCESS);
    assert_eq!(completion.information, 32 * 1024);
    assert_eq!(buffer.to_vec(), in_data(BULK_IN, 0, 32 * 1024));
    assert_eq!(rig.bus.urb_count(BULK_URB), 32);
    assert_eq!(rig.device.transfer_stats().sub_requests_freed, 32);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_split_write_reaches_device_in_order() {
    let rig = Rig::started().await;
    let owner = rig.open();

    let data = common::test_utils::pattern(10000, 3);
    let completion = with_timeout(rig.ioctl(bulk_write(owner, data.clone(), 4096))).await;

    assert_eq!(completion.status, NtStatus::SUCCESS);
    assert_eq!(completion.information, 10000);
    assert_eq!(rig.bus.written(BULK_OUT), data);
    assert_eq!(rig.bus.urb_count(BULK_URB), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_short_chunk_compacted_at_finalize() {
    let rig = Rig::started().await;
    let owner = rig.open();

    // The short chunk completes last, after every later chunk has landed.
    rig.bus
        .script(BULK_IN, Reply::short(1000).delayed(Duration::from_millis(200)));

    let (request, buffer) = bulk_read(owner, 16384, 4096);
    let completion = with_timeout(rig.ioctl(request)).await;

    assert_eq!(completion.status, NtStatus::SUCCESS);
    assert_eq!(completion.information, 13288);

    let mut expected = in_data(BULK_IN, 0, 1000);
    expected.extend(in_data(BULK_IN, 4096, 12288));
    assert_eq!(&buffer.to_vec()[..13288], expected.as_slice());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_short_chunk_cancels_later_chunks() {
    let rig = Rig::started().await;
    let owner = rig.open();

    rig.bus.script(BULK_IN, Reply::short(1000));
    rig.bus.script_all(
        BULK_IN,
        (0..3).map(|_| Reply::after(Duration::from_millis(500))),
    );

    let (request, buffer) = bulk_read(owner, 16384, 4096);
    let completion = with_timeout(rig.ioctl(request)).await;

    // Cancelling the tail is the engine's doing, not a failure
    assert_eq!(completion.status, NtStatus::SUCCESS);
    assert_eq!(completion.information, 1000);
    assert_eq!(&buffer.to_vec()[..1000], in_data(BULK_IN, 0, 1000).as_slice());

    let cancelled = rig
        .bus
        .transfers()
        .iter()
        .filter(|t| t.was_cancelled())
        .count();
    assert_eq!(cancelled, 3);

    let stats = rig.device.transfer_stats();
    assert_eq!(stats.sub_requests_created, 4);
    assert_eq!(stats.sub_requests_freed, 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_short_not_ok_chunk_fails_transfer() {
    let rig = Rig::started().await;
    let owner = rig.open();

    rig.bus.script(BULK_IN, Reply::short(1000));
    rig.bus.script_all(
        BULK_IN,
        (0..3).map(|_| Reply::after(Duration::from_millis(300))),
    );

    let buffer = TransferBuffer::new(16384);
    let request = transfer(
        IoctlCode::InterruptOrBulkRead,
        owner,
        short_not_ok(endpoint_params(BULK_IN, 4096)),
        buffer,
    );
    let completion = with_timeout(rig.ioctl(request)).await;

    assert_eq!(completion.status, NtStatus::UNSUCCESSFUL);
    assert_eq!(completion.urb_status, Some(UsbdStatus::DATA_UNDERRUN));
    assert_eq!(completion.information, 1000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_split_cancel_by_client() {
    let rig = Rig::started().await;
    let owner = rig.open();
    rig.bus.hold(BULK_IN);

    let cancel = CancellationToken::new();
    let (request, _buffer) = bulk_read(owner, 16384, 4096);
    let request = request.with_cancel(cancel.clone());

    let device = rig.device.clone();
    let task = tokio::spawn(async move { device.dispatch_ioctl(request).await });

    let bus = rig.bus.clone();
    with_timeout(wait_until(|| bus.inflight() == 4)).await;
    cancel.cancel();

    let completion = with_timeout(task).await.unwrap();
    assert_eq!(completion.status, NtStatus::CANCELLED);
    assert_eq!(completion.information, 0);
    assert_eq!(rig.bus.inflight(), 0);

    let stats = rig.device.transfer_stats();
    assert_eq!(stats.sub_requests_created, 4);
    assert_eq!(stats.sub_requests_freed, 4);
    assert_eq!(stats.splits_finalized, 1);
    with_timeout(wait_until(|| rig.device.remove_lock_usage() == 1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_split_cancelled_before_submission() {
    let rig = Rig::started().await;
    let owner = rig.open();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let (request, _buffer) = bulk_read(owner, 16384, 4096);
    let completion = with_timeout(rig.ioctl(request.with_cancel(cancel))).await;

    assert_eq!(completion.status, NtStatus::CANCELLED);
    assert_eq!(completion.information, 0);
    assert_eq!(rig.bus.urb_count(BULK_URB), 0);
    assert_eq!(rig.device.transfer_stats().splits_started, 0);
    assert_eq!(rig.device.remove_lock_usage(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_split_quota_rejects_before_submission() {
    let tunables = DriverSettings {
        max_split_requests: 2,
        ..DriverSettings::default()
    };
    let rig = Rig::started_with(DeviceSettings::default(), tunables).await;
    let owner = rig.open();

    let (request, _buffer) = bulk_read(owner, 16384, 4096);
    let completion = with_timeout(rig.ioctl(request)).await;

    assert_eq!(completion.status, NtStatus::INSUFFICIENT_RESOURCES);
    assert_eq!(rig.bus.urb_count(BULK_URB), 0);
    assert_eq!(rig.device.transfer_stats().splits_started, 0);
    assert_eq!(rig.device.remove_lock_usage(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_split_quota_checked_before_planning() {
    let rig = Rig::started().await;
    let owner = rig.open();

    // One-byte chunks over the largest allowed buffer
    let request = bulk_write(owner, vec![0; 16 * 1024 * 1024], 1);
    let completion = with_timeout(rig.ioctl(request)).await;

    assert_eq!(completion.status, NtStatus::INSUFFICIENT_RESOURCES);
    assert_eq!(rig.bus.urb_count(BULK_URB), 0);
    let stats = rig.device.transfer_stats();
    assert_eq!(stats.splits_started, 0);
    assert_eq!(stats.sub_requests_created, 0);
    assert_eq!(rig.device.remove_lock_usage(), 1);
}

// ============================================================================
// Single-URB transfers
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_aligned_short_read_continues() {
    let rig = Rig::started().await;
    let owner = rig.open();
    rig.bus.script(BULK_IN, Reply::short(512));

    let (request, buffer) = bulk_read(owner, 2048, 0);
    let completion = with_timeout(rig.ioctl(request)).await;

    assert_eq!(completion.status, NtStatus::SUCCESS);
    assert_eq!(completion.information, 2048);
    assert_eq!(buffer.to_vec(), in_data(BULK_IN, 0, 2048));

    let records = rig.bus.transfers();
    assert_eq!(records.len(), 2);
    assert_eq!((records[0].offset, records[0].transferred), (0, 512));
    assert_eq!((records[1].offset, records[1].requested), (512, 1536));
    assert_eq!(rig.device.transfer_stats().splits_started, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unaligned_short_read_finishes() {
    let rig = Rig::started().await;
    let owner = rig.open();
    rig.bus.script(BULK_IN, Reply::short(100));

    let (request, _buffer) = bulk_read(owner, 2048, 0);
    let completion = with_timeout(rig.ioctl(request)).await;

    assert_eq!(completion.status, NtStatus::SUCCESS);
    assert_eq!(completion.information, 100);
    assert_eq!(rig.bus.urb_count(BULK_URB), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_continuation_yields_to_newer_transfer() {
    let rig = Rig::started().await;
    let owner = rig.open();
    rig.bus
        .script(BULK_IN, Reply::short(512).delayed(Duration::from_millis(100)));

    let (first, _first_buffer) = bulk_read(owner, 2048, 0);
    let device = rig.device.clone();
    let older = tokio::spawn(async move { device.dispatch_ioctl(first).await });

    let bus = rig.bus.clone();
    with_timeout(wait_until(|| bus.inflight() == 1)).await;

    let (second, _second_buffer) = bulk_read(owner, 512, 0);
    let newer = with_timeout(rig.ioctl(second)).await;
    assert_eq!(newer.status, NtStatus::SUCCESS);
    assert_eq!(newer.information, 512);

    let older = with_timeout(older).await.unwrap();
    assert_eq!(older.status, NtStatus::SUCCESS);
    assert_eq!(older.information, 512);
    assert_eq!(rig.device.transfer_stats().stale_continuations, 1);
    assert_eq!(rig.bus.urb_count(BULK_URB), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_interrupt_read() {
    let rig = Rig::started().await;
    let owner = rig.open();

    let buffer = TransferBuffer::new(64);
    let request = transfer(
        IoctlCode::InterruptOrBulkRead,
        owner,
        endpoint_params(INT_IN, 0),
        buffer.clone(),
    );
    let completion = with_timeout(rig.ioctl(request)).await;

    assert_eq!(completion.status, NtStatus::SUCCESS);
    assert_eq!(buffer.to_vec(), in_data(INT_IN, 0, 64));
}

// ============================================================================
// Validation
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unaligned_read_length() {
    let rig = Rig::started().await;
    let owner = rig.open();
    let (request, _buffer) = bulk_read(owner, 1000, 0);
    let completion = with_timeout(rig.ioctl(request)).await;
    assert_eq!(completion.status, NtStatus::SUCCESS);
    assert_eq!(completion.information, 1000);

    let tunables = DriverSettings {
        strict_read_length: true,
        ..DriverSettings::default()
    };
    let strict = Rig::started_with(DeviceSettings::default(), tunables).await;
    let owner = strict.open();
    let (request, _buffer) = bulk_read(owner, 1000, 0);
    let completion = with_timeout(strict.ioctl(request)).await;
    assert_eq!(completion.status, NtStatus::INVALID_PARAMETER);
    assert_eq!(strict.bus.urb_count(BULK_URB), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pipe_mismatch_rejected() {
    let rig = Rig::started().await;
    let owner = rig.open();

    // Read code on an OUT endpoint
    let request = transfer(
        IoctlCode::InterruptOrBulkRead,
        owner,
        endpoint_params(BULK_OUT, 0),
        TransferBuffer::new(512),
    );
    assert_eq!(
        with_timeout(rig.ioctl(request)).await.status,
        NtStatus::INVALID_PARAMETER
    );

    // Isochronous code on a bulk endpoint
    let request = transfer(
        IoctlCode::IsochronousRead,
        owner,
        endpoint_params(BULK_IN, 0),
        TransferBuffer::new(512),
    );
    assert_eq!(
        with_timeout(rig.ioctl(request)).await.status,
        NtStatus::INVALID_PARAMETER
    );

    // Endpoint not in the current alternate setting
    let request = transfer(
        IoctlCode::IsochronousRead,
        owner,
        endpoint_params(ISO_IN, 0),
        TransferBuffer::new(192),
    );
    assert_eq!(
        with_timeout(rig.ioctl(request)).await.status,
        NtStatus::INVALID_PARAMETER
    );

    assert_eq!(rig.bus.transfers().len(), 0);
    assert_eq!(rig.device.remove_lock_usage(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_empty_read_and_oversized_transfer_rejected() {
    let tunables = DriverSettings {
        max_transfer_length: 4096,
        ..DriverSettings::default()
    };
    let rig = Rig::started_with(DeviceSettings::default(), tunables).await;
    let owner = rig.open();

    let (request, _) = bulk_read(owner, 0, 0);
    assert_eq!(
        with_timeout(rig.ioctl(request)).await.status,
        NtStatus::INVALID_PARAMETER
    );

    let request = bulk_write(owner, vec![0; 8192], 0);
    assert_eq!(
        with_timeout(rig.ioctl(request)).await.status,
        NtStatus::INVALID_PARAMETER
    );
    assert_eq!(rig.bus.urb_count(BULK_URB), 0);
    assert_eq!(rig.device.remove_lock_usage(), 1);
}

// ============================================================================
// Isochronous transfers
// ============================================================================

async fn select_iso_setting(rig: &Rig, owner: driver::OwnerId) {
    let (request, _) = buffered(
        IoctlCode::SetInterface,
        owner,
        Params::Interface {
            interface: 0,
            altsetting: 1,
        },
        0,
    );
    assert_eq!(with_timeout(rig.ioctl(request)).await.status, NtStatus::SUCCESS);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_iso_split_start_frames() {
    let rig = Rig::started().await;
    let owner = rig.open();
    select_iso_setting(&rig, owner).await;
    rig.bus.set_frame(5000);

    // 300 packets of 192 bytes: 255 in the first URB, 45 in the second
    let mut params = endpoint_params(ISO_IN, 0);
    params.transfer_flags = TransferFlags::ISO_SET_START_FRAME | TransferFlags::ISO_ADD_LATENCY;
    params.iso_start_frame_latency = 8;
    let buffer = TransferBuffer::new(57600);
    let request = transfer(IoctlCode::IsochronousRead, owner, params, buffer.clone());
    let completion = with_timeout(rig.ioctl(request)).await;

    assert_eq!(completion.status, NtStatus::SUCCESS);
    assert_eq!(completion.information, 57600);
    assert_eq!(buffer.to_vec(), in_data(ISO_IN, 0, 57600));

    let mut records = rig.bus.transfers();
    records.sort_by_key(|r| r.offset);
    let frames: Vec<(usize, Option<u32>)> =
        records.iter().map(|r| (r.requested, r.start_frame)).collect();
    assert_eq!(frames, vec![(48960, Some(5008)), (8640, Some(5263))]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_iso_read_as_soon_as_possible() {
    let rig = Rig::started().await;
    let owner = rig.open();
    select_iso_setting(&rig, owner).await;

    let request = transfer(
        IoctlCode::IsochronousRead,
        owner,
        endpoint_params(ISO_IN, 0),
        TransferBuffer::new(1920),
    );
    let completion = with_timeout(rig.ioctl(request)).await;

    assert_eq!(completion.status, NtStatus::SUCCESS);
    assert_eq!(rig.bus.urb_count("GET_CURRENT_FRAME_NUMBER"), 0);
    assert_eq!(rig.bus.transfers()[0].start_frame, Some(1000));
}

// ============================================================================
// Endpoint state
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stall_halts_until_reset() {
    let rig = Rig::started().await;
    let owner = rig.open();
    rig.bus.script(BULK_IN, Reply::fail(UsbdStatus::STALL_PID));

    let (request, _) = bulk_read(owner, 512, 0);
    let stalled = with_timeout(rig.ioctl(request)).await;
    assert_eq!(stalled.status, NtStatus::UNSUCCESSFUL);
    assert_eq!(stalled.urb_status, Some(UsbdStatus::STALL_PID));
    assert!(rig.bus.is_halted(BULK_IN));

    let (request, _) = bulk_read(owner, 512, 0);
    let halted = with_timeout(rig.ioctl(request)).await;
    assert_eq!(halted.urb_status, Some(UsbdStatus::ENDPOINT_HALTED));

    let (reset, _) = buffered(
        IoctlCode::ResetEndpoint,
        owner,
        Params::Endpoint(endpoint_params(BULK_IN, 0)),
        0,
    );
    assert_eq!(with_timeout(rig.ioctl(reset)).await.status, NtStatus::SUCCESS);
    assert!(!rig.bus.is_halted(BULK_IN));

    let (request, _) = bulk_read(owner, 512, 0);
    let recovered = with_timeout(rig.ioctl(request)).await;
    assert_eq!(recovered.status, NtStatus::SUCCESS);
    assert_eq!(recovered.information, 512);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_abort_endpoint_cancels_pending_read() {
    let rig = Rig::started().await;
    let owner = rig.open();
    rig.bus.hold(BULK_IN);

    let (request, _) = bulk_read(owner, 512, 0);
    let device = rig.device.clone();
    let pending = tokio::spawn(async move { device.dispatch_ioctl(request).await });

    let bus = rig.bus.clone();
    with_timeout(wait_until(|| bus.inflight() == 1)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (abort, _) = buffered(
        IoctlCode::AbortEndpoint,
        owner,
        Params::Endpoint(endpoint_params(BULK_IN, 0)),
        0,
    );
    assert_eq!(with_timeout(rig.ioctl(abort)).await.status, NtStatus::SUCCESS);

    let completion = with_timeout(pending).await.unwrap();
    assert_eq!(completion.status, NtStatus::CANCELLED);
    assert_eq!(rig.bus.inflight(), 0);
}

// ============================================================================
// Chunk planning
// ============================================================================

proptest! {
    #[test]
    fn test_plan_chunks_covers_buffer(total in 0usize..200_000, limit in 1usize..70_000) {
        let chunks = plan_chunks(total, limit);
        prop_assert_eq!(chunks.len(), total.div_ceil(limit));

        let mut cursor = 0;
        for chunk in &chunks {
            prop_assert_eq!(chunk.offset, cursor);
            prop_assert!(chunk.len > 0 && chunk.len <= limit);
            cursor += chunk.len;
        }
        prop_assert_eq!(cursor, total);
    }
}
