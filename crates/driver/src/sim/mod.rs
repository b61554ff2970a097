//! Simulated USB device
//!
//! An in-memory device that executes URBs on tokio tasks, so completions
//! arrive from other tasks in whatever order the scripted delays produce.
//! Tests script per-endpoint replies, hold an endpoint closed to keep URBs
//! in flight, and inspect the transfer log afterwards.

mod control;
mod script;

pub use script::{Reply, TransferRecord, in_data};

use crate::config::SimulationSettings;
use crate::device::lock;
use crate::lower::LowerDevice;
use crate::pnp::PnpMinor;
use crate::power::{DeviceCapabilities, PowerRequest};
use common::{
    ConfigurationHandle, DataTransfer, InterfaceInformation, IsoTransfer, PipeHandle, SetupPacket,
    Submission, Urb, UrbFlags, UrbFunction, UsbBus,
};
use protocol::{ConfigurationDescriptor, DeviceDescriptor, NtStatus, PipeType, UsbdStatus};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

type UsbResult<T> = std::result::Result<T, UsbdStatus>;

/// A control request as the device received it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRecord {
    pub setup: SetupPacket,
    /// Data stage of OUT requests
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
struct OpenPipe {
    address: u8,
    interface: u8,
    pipe_type: PipeType,
}

#[derive(Debug, Default)]
struct DeviceState {
    configuration: u8,
    handle: ConfigurationHandle,
    alternate_settings: HashMap<u8, u8>,
    pipes: HashMap<PipeHandle, OpenPipe>,
    halted: HashSet<u8>,
}

struct Inner {
    name: String,
    runtime: Option<Handle>,
    device_descriptor: DeviceDescriptor,
    configurations: Vec<ConfigurationDescriptor>,
    strings: Vec<String>,
    state: Mutex<DeviceState>,
    next_handle: AtomicU64,
    scripts: Mutex<HashMap<u8, VecDeque<Reply>>>,
    gates: Mutex<HashMap<u8, watch::Sender<bool>>>,
    aborts: Mutex<HashMap<PipeHandle, CancellationToken>>,
    inflight: AtomicUsize,
    frame: AtomicU32,
    urbs: Mutex<Vec<&'static str>>,
    transfers: Mutex<Vec<TransferRecord>>,
    written: Mutex<HashMap<u8, Vec<(usize, Vec<u8>)>>>,
    controls: Mutex<Vec<ControlRecord>>,
    pnp: Mutex<Vec<PnpMinor>>,
    power: Mutex<Vec<PowerRequest>>,
    start_status: Mutex<NtStatus>,
    capabilities: Mutex<DeviceCapabilities>,
}

/// Simulated device; clones share the same device
#[derive(Clone)]
pub struct SimulatedBus {
    inner: Arc<Inner>,
}

impl SimulatedBus {
    pub fn new(device_descriptor: DeviceDescriptor, configurations: Vec<ConfigurationDescriptor>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: format!(
                    "sim-{:04x}:{:04x}",
                    device_descriptor.vendor_id, device_descriptor.product_id
                ),
                runtime: Handle::try_current().ok(),
                device_descriptor,
                configurations,
                strings: Vec::new(),
                state: Mutex::new(DeviceState::default()),
                next_handle: AtomicU64::new(1),
                scripts: Mutex::new(HashMap::new()),
                gates: Mutex::new(HashMap::new()),
                aborts: Mutex::new(HashMap::new()),
                inflight: AtomicUsize::new(0),
                frame: AtomicU32::new(1000),
                urbs: Mutex::new(Vec::new()),
                transfers: Mutex::new(Vec::new()),
                written: Mutex::new(HashMap::new()),
                controls: Mutex::new(Vec::new()),
                pnp: Mutex::new(Vec::new()),
                power: Mutex::new(Vec::new()),
                start_status: Mutex::new(NtStatus::SUCCESS),
                capabilities: Mutex::new(DeviceCapabilities::default()),
            }),
        }
    }

    /// Device laid out by the `[simulation]` section
    pub fn from_settings(settings: &SimulationSettings) -> anyhow::Result<Self> {
        Ok(Self::new(
            settings.device_descriptor(),
            vec![settings.configuration()?],
        ))
    }

    /// String descriptors served for indices 1..
    pub fn with_strings(mut self, strings: Vec<String>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.strings = strings;
        }
        self
    }

    /// Queues a reply for the next submission on `endpoint` (0 for control)
    pub fn script(&self, endpoint: u8, reply: Reply) {
        lock(&self.inner.scripts)
            .entry(endpoint)
            .or_default()
            .push_back(reply);
    }

    pub fn script_all(&self, endpoint: u8, replies: impl IntoIterator<Item = Reply>) {
        lock(&self.inner.scripts)
            .entry(endpoint)
            .or_default()
            .extend(replies);
    }

    /// Keeps every URB on `endpoint` pending until [`release`](Self::release)
    pub fn hold(&self, endpoint: u8) {
        self.inner.gate(endpoint).send_replace(true);
    }

    pub fn release(&self, endpoint: u8) {
        self.inner.gate(endpoint).send_replace(false);
    }

    /// URBs accepted and not yet completed
    pub fn inflight(&self) -> usize {
        self.inner.inflight.load(Ordering::SeqCst)
    }

    /// Names of every URB submitted, in submission order
    pub fn urbs(&self) -> Vec<&'static str> {
        lock(&self.inner.urbs).clone()
    }

    pub fn urb_count(&self, name: &str) -> usize {
        lock(&self.inner.urbs).iter().filter(|n| **n == name).count()
    }

    /// Data transfers in completion order
    pub fn transfers(&self) -> Vec<TransferRecord> {
        lock(&self.inner.transfers).clone()
    }

    pub fn control_requests(&self) -> Vec<ControlRecord> {
        lock(&self.inner.controls).clone()
    }

    /// Bytes written to an OUT endpoint, laid out by client buffer offset
    pub fn written(&self, endpoint: u8) -> Vec<u8> {
        let mut chunks = lock(&self.inner.written)
            .get(&endpoint)
            .cloned()
            .unwrap_or_default();
        chunks.sort_by_key(|(offset, _)| *offset);
        chunks.into_iter().flat_map(|(_, data)| data).collect()
    }

    pub fn set_frame(&self, frame: u32) {
        self.inner.frame.store(frame, Ordering::SeqCst);
    }

    pub fn configuration(&self) -> u8 {
        lock(&self.inner.state).configuration
    }

    pub fn is_halted(&self, endpoint: u8) -> bool {
        lock(&self.inner.state).halted.contains(&endpoint)
    }

    pub fn pnp_requests(&self) -> Vec<PnpMinor> {
        lock(&self.inner.pnp).clone()
    }

    pub fn power_requests(&self) -> Vec<PowerRequest> {
        lock(&self.inner.power).clone()
    }

    /// Status the device answers a start request with
    pub fn set_start_status(&self, status: NtStatus) {
        *lock(&self.inner.start_status) = status;
    }

    pub fn set_capabilities(&self, capabilities: DeviceCapabilities) {
        *lock(&self.inner.capabilities) = capabilities;
    }
}

impl UsbBus for SimulatedBus {
    fn submit(&self, submission: Submission) {
        let inner = self.inner.clone();
        lock(&inner.urbs).push(submission.urb.name());

        let endpoint = match &submission.urb.function {
            UrbFunction::Control(_) => Some(0),
            UrbFunction::BulkOrInterrupt(t) => Some(t.endpoint),
            UrbFunction::Isochronous(t) => Some(t.endpoint),
            _ => None,
        };
        let reply = endpoint
            .and_then(|ep| lock(&inner.scripts).get_mut(&ep)?.pop_front())
            .unwrap_or_default();

        let Some(runtime) = inner.runtime.clone().or_else(|| Handle::try_current().ok()) else {
            submission.finish(UsbdStatus::DEVICE_GONE, NtStatus::DEVICE_NOT_CONNECTED);
            return;
        };

        inner.inflight.fetch_add(1, Ordering::SeqCst);
        runtime.spawn(async move {
            let Submission {
                mut urb,
                cancel,
                completion,
            } = submission;
            let result = inner.execute(&mut urb, endpoint, reply, &cancel).await;
            let status = match result {
                Ok(()) => {
                    urb.status = UsbdStatus::SUCCESS;
                    NtStatus::SUCCESS
                }
                Err(status) => {
                    urb.status = status;
                    if status == UsbdStatus::CANCELED {
                        NtStatus::CANCELLED
                    } else {
                        NtStatus::UNSUCCESSFUL
                    }
                }
            };
            trace!("{}: {} -> {} / {}", inner.name, urb.name(), status, urb.status);
            inner.inflight.fetch_sub(1, Ordering::SeqCst);
            completion.complete(urb, status);
        });
    }

    fn name(&self) -> &str {
        &self.inner.name
    }
}

impl LowerDevice for SimulatedBus {
    fn forward_pnp(&self, minor: PnpMinor) -> NtStatus {
        lock(&self.inner.pnp).push(minor);
        match minor {
            PnpMinor::Start => *lock(&self.inner.start_status),
            _ => NtStatus::SUCCESS,
        }
    }

    fn forward_power(&self, request: PowerRequest) -> NtStatus {
        lock(&self.inner.power).push(request);
        NtStatus::SUCCESS
    }

    fn capabilities(&self) -> DeviceCapabilities {
        lock(&self.inner.capabilities).clone()
    }
}

impl std::fmt::Debug for SimulatedBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedBus")
            .field("name", &self.inner.name)
            .field("inflight", &self.inflight())
            .finish()
    }
}

impl Inner {
    fn gate(&self, endpoint: u8) -> watch::Sender<bool> {
        lock(&self.gates)
            .entry(endpoint)
            .or_insert_with(|| watch::Sender::new(false))
            .clone()
    }

    fn abort_token(&self, pipe: PipeHandle) -> CancellationToken {
        lock(&self.aborts).entry(pipe).or_default().clone()
    }

    fn next_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    /// Waits out the hold gate and the scripted delay
    async fn wait(
        &self,
        endpoint: u8,
        reply: &Reply,
        cancel: &CancellationToken,
        abort: &CancellationToken,
    ) -> UsbResult<()> {
        let mut gate = self.gate(endpoint).subscribe();
        let ready = async {
            let _ = gate.wait_for(|held| !*held).await;
            tokio::time::sleep(reply.delay).await;
        };
        tokio::select! {
            _ = ready => Ok(()),
            _ = cancel.cancelled() => Err(UsbdStatus::CANCELED),
            _ = abort.cancelled() => Err(UsbdStatus::CANCELED),
        }
    }

    async fn execute(
        &self,
        urb: &mut Urb,
        endpoint: Option<u8>,
        reply: Reply,
        cancel: &CancellationToken,
    ) -> UsbResult<()> {
        let name = urb.name();
        match &mut urb.function {
            UrbFunction::SelectConfiguration {
                configuration,
                interfaces,
                handle,
            } => self.select_configuration(configuration.as_deref(), interfaces, handle),
            UrbFunction::SelectInterface {
                configuration,
                interface,
            } => self.select_interface(*configuration, interface),
            UrbFunction::Control(transfer) => {
                self.wait(0, &reply, cancel, &CancellationToken::new()).await?;
                if let Some(status) = reply.status {
                    return Err(status);
                }
                self.control(transfer)
            }
            UrbFunction::BulkOrInterrupt(transfer) => {
                let ep = endpoint.unwrap_or(transfer.endpoint);
                let result = self.data(transfer, &reply, cancel).await;
                self.record(ep, transfer.pipe, &transfer.buffer, transfer.transferred, &result, None);
                result
            }
            UrbFunction::Isochronous(transfer) => {
                let ep = endpoint.unwrap_or(transfer.endpoint);
                let result = self.isochronous(transfer, &reply, cancel).await;
                let frame = Some(transfer.start_frame);
                self.record(ep, transfer.pipe, &transfer.buffer, transfer.transferred, &result, frame);
                result
            }
            UrbFunction::AbortPipe(pipe) => {
                self.open_pipe(*pipe)?;
                if let Some(token) = lock(&self.aborts).remove(pipe) {
                    token.cancel();
                }
                debug!("{}: aborted pipe {:?}", self.name, pipe);
                Ok(())
            }
            UrbFunction::ResetPipe(pipe) => {
                let open = self.open_pipe(*pipe)?;
                lock(&self.state).halted.remove(&open.address);
                Ok(())
            }
            UrbFunction::GetCurrentFrameNumber { frame } => {
                *frame = self.frame.load(Ordering::SeqCst);
                Ok(())
            }
            UrbFunction::ResetPort | UrbFunction::CyclePort => {
                debug!("{}: {}", self.name, name);
                Ok(())
            }
        }
    }

    fn open_pipe(&self, pipe: PipeHandle) -> UsbResult<OpenPipe> {
        lock(&self.state)
            .pipes
            .get(&pipe)
            .copied()
            .ok_or(UsbdStatus::INVALID_PIPE_HANDLE)
    }

    fn record(
        &self,
        endpoint: u8,
        pipe: PipeHandle,
        buffer: &common::Mdl,
        transferred: usize,
        result: &UsbResult<()>,
        start_frame: Option<u32>,
    ) {
        lock(&self.transfers).push(TransferRecord {
            endpoint,
            pipe,
            offset: buffer.offset(),
            requested: buffer.len(),
            transferred,
            status: result.as_ref().err().copied().unwrap_or(UsbdStatus::SUCCESS),
            start_frame,
        });
    }

    /// Moves up to the reply's limit between the buffer window and the endpoint
    fn move_data(&self, endpoint: u8, buffer: &common::Mdl, limit: Option<usize>) -> usize {
        let len = limit.map_or(buffer.len(), |limit| limit.min(buffer.len()));
        if protocol::Direction::of_endpoint(endpoint).is_in() {
            buffer.write(0, &in_data(endpoint, buffer.offset(), len))
        } else {
            let data = buffer.read()[..len].to_vec();
            lock(&self.written)
                .entry(endpoint)
                .or_default()
                .push((buffer.offset(), data));
            len
        }
    }

    async fn data(
        &self,
        transfer: &mut DataTransfer,
        reply: &Reply,
        cancel: &CancellationToken,
    ) -> UsbResult<()> {
        let open = self.open_pipe(transfer.pipe)?;
        if lock(&self.state).halted.contains(&open.address) {
            return Err(UsbdStatus::ENDPOINT_HALTED);
        }
        let abort = self.abort_token(transfer.pipe);
        self.wait(open.address, reply, cancel, &abort).await?;

        if let Some(status) = reply.status {
            if status == UsbdStatus::STALL_PID {
                lock(&self.state).halted.insert(open.address);
            }
            return Err(status);
        }

        transfer.transferred = self.move_data(open.address, &transfer.buffer, reply.limit);
        let short = transfer.transferred < transfer.buffer.len();
        if short
            && transfer.flags.direction().is_in()
            && !transfer.flags.contains(UrbFlags::SHORT_TRANSFER_OK)
        {
            return Err(UsbdStatus::DATA_UNDERRUN);
        }
        Ok(())
    }

    async fn isochronous(
        &self,
        transfer: &mut IsoTransfer,
        reply: &Reply,
        cancel: &CancellationToken,
    ) -> UsbResult<()> {
        let open = self.open_pipe(transfer.pipe)?;
        if open.pipe_type != PipeType::Isochronous {
            return Err(UsbdStatus::INVALID_PARAMETER);
        }
        let packets = transfer.packets.len() as u32;
        if transfer.flags.contains(UrbFlags::START_ISO_TRANSFER_ASAP) {
            transfer.start_frame = self.frame.fetch_add(packets, Ordering::SeqCst);
        } else {
            self.frame.fetch_max(transfer.start_frame.wrapping_add(packets), Ordering::SeqCst);
        }

        let abort = self.abort_token(transfer.pipe);
        self.wait(open.address, reply, cancel, &abort).await?;
        if let Some(status) = reply.status {
            transfer.error_count = packets;
            for packet in transfer.packets.iter_mut() {
                packet.status = status;
            }
            return Err(status);
        }

        transfer.transferred = self.move_data(open.address, &transfer.buffer, reply.limit);
        Ok(())
    }

    fn fill_pipes(
        &self,
        state: &mut DeviceState,
        descriptor: &ConfigurationDescriptor,
        info: &mut InterfaceInformation,
    ) -> UsbResult<()> {
        let interface = descriptor
            .find_interface(info.number, info.alternate_setting)
            .ok_or(UsbdStatus::INVALID_PARAMETER)?;

        state.pipes.retain(|_, pipe| pipe.interface != info.number);
        let requested: HashMap<u8, u32> = info
            .pipes
            .iter()
            .map(|p| (p.address, p.max_transfer_size))
            .collect();
        info.pipes = interface
            .endpoints
            .iter()
            .map(|ep| {
                let handle = PipeHandle(self.next_handle());
                state.pipes.insert(
                    handle,
                    OpenPipe {
                        address: ep.address,
                        interface: info.number,
                        pipe_type: ep.pipe_type(),
                    },
                );
                common::PipeInformation {
                    address: ep.address,
                    pipe_type: Some(ep.pipe_type()),
                    max_packet_size: ep.max_packet_size,
                    interval: ep.interval,
                    max_transfer_size: requested.get(&ep.address).copied().unwrap_or(0),
                    handle,
                }
            })
            .collect();
        state.alternate_settings.insert(info.number, info.alternate_setting);
        Ok(())
    }

    fn select_configuration(
        &self,
        raw: Option<&[u8]>,
        interfaces: &mut [InterfaceInformation],
        handle: &mut ConfigurationHandle,
    ) -> UsbResult<()> {
        let mut state = lock(&self.state);
        let Some(raw) = raw else {
            *state = DeviceState {
                handle: ConfigurationHandle(self.next_handle()),
                ..DeviceState::default()
            };
            *handle = state.handle;
            return Ok(());
        };

        let requested =
            ConfigurationDescriptor::parse(raw).map_err(|_| UsbdStatus::INVALID_PARAMETER)?;
        let descriptor = self
            .configurations
            .iter()
            .find(|c| c.value == requested.value)
            .ok_or(UsbdStatus::INVALID_PARAMETER)?;

        let mut next = DeviceState {
            configuration: descriptor.value,
            handle: ConfigurationHandle(self.next_handle()),
            ..DeviceState::default()
        };
        for info in interfaces.iter_mut() {
            self.fill_pipes(&mut next, descriptor, info)?;
        }
        next.halted = std::mem::take(&mut state.halted);
        *handle = next.handle;
        *state = next;
        debug!("{}: configuration {} selected", self.name, descriptor.value);
        Ok(())
    }

    fn select_interface(
        &self,
        configuration: ConfigurationHandle,
        interface: &mut InterfaceInformation,
    ) -> UsbResult<()> {
        let mut state = lock(&self.state);
        if state.configuration == 0 || state.handle != configuration {
            return Err(UsbdStatus::INVALID_PARAMETER);
        }
        let descriptor = self
            .configurations
            .iter()
            .find(|c| c.value == state.configuration)
            .ok_or(UsbdStatus::INVALID_PARAMETER)?;
        self.fill_pipes(&mut state, descriptor, interface)?;
        debug!(
            "{}: interface {} alternate setting {}",
            self.name, interface.number, interface.alternate_setting
        );
        Ok(())
    }
}
