//! Host bus thread
//!
//! Owns the rusb device handle and executes submissions one at a time in
//! arrival order. Runs until a shutdown command arrives or the driver side
//! of the bridge goes away.

use super::transfers::{self, HostPipe, PipeMap, UsbResult, map_rusb_error};
use common::{
    BusCommand, BusWorker, ConfigurationHandle, InterfaceInformation, PipeHandle, PipeInformation,
    Submission, UrbFunction,
};
use protocol::{ConfigurationDescriptor, NtStatus, UsbdStatus};
use rusb::{Context, DeviceHandle};
use tracing::{debug, error, info, warn};

pub struct HostWorker {
    handle: DeviceHandle<Context>,
    worker: BusWorker,
    pipes: PipeMap,
    claimed: Vec<u8>,
    next_handle: u64,
}

impl HostWorker {
    pub fn new(handle: DeviceHandle<Context>, worker: BusWorker) -> Self {
        Self {
            handle,
            worker,
            pipes: PipeMap::new(),
            claimed: Vec::new(),
            next_handle: 1,
        }
    }

    pub fn run(mut self) {
        info!("Host bus thread started");
        loop {
            match self.worker.recv_command() {
                Ok(BusCommand::Submit(submission)) => self.handle_submission(submission),
                Ok(BusCommand::Shutdown) => {
                    info!("Host bus thread shutting down");
                    break;
                }
                Err(e) => {
                    debug!("Bus bridge closed: {}", e);
                    break;
                }
            }
        }
        self.release_interfaces();
        info!("Host bus thread stopped");
    }

    fn handle_submission(&mut self, submission: Submission) {
        let Submission {
            mut urb,
            cancel,
            completion,
        } = submission;

        let result = if cancel.is_cancelled() {
            Err(UsbdStatus::CANCELED)
        } else {
            let name = urb.name();
            // A panic in rusb must not take the thread and every queued URB with it.
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                self.execute(&mut urb.function, &cancel)
            }))
            .unwrap_or_else(|e| {
                error!("Panic while executing {}: {:?}", name, e);
                Err(UsbdStatus::DEV_NOT_RESPONDING)
            })
        };

        let status = match result {
            Ok(()) => NtStatus::SUCCESS,
            Err(UsbdStatus::CANCELED) => NtStatus::CANCELLED,
            Err(UsbdStatus::NOT_SUPPORTED) => NtStatus::NOT_SUPPORTED,
            Err(UsbdStatus::DEVICE_GONE) => NtStatus::DEVICE_NOT_CONNECTED,
            Err(_) => NtStatus::UNSUCCESSFUL,
        };
        urb.status = result.err().unwrap_or(UsbdStatus::SUCCESS);
        completion.complete(urb, status);
    }

    fn execute(
        &mut self,
        function: &mut UrbFunction,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> UsbResult<()> {
        match function {
            UrbFunction::SelectConfiguration {
                configuration,
                interfaces,
                handle,
            } => self.select_configuration(configuration.as_deref(), interfaces, handle),
            UrbFunction::SelectInterface { interface, .. } => self.select_interface(interface),
            UrbFunction::Control(transfer) => transfers::control(&self.handle, transfer),
            UrbFunction::BulkOrInterrupt(transfer) => {
                transfers::data(&self.handle, &self.pipes, transfer, cancel)
            }
            UrbFunction::ResetPipe(pipe) => {
                transfers::reset_pipe(&mut self.handle, &self.pipes, *pipe)
            }
            UrbFunction::AbortPipe(pipe) => {
                // Submissions run one at a time, so nothing is queued on the pipe.
                if self.pipes.contains_key(pipe) {
                    Ok(())
                } else {
                    Err(UsbdStatus::INVALID_PIPE_HANDLE)
                }
            }
            UrbFunction::ResetPort | UrbFunction::CyclePort => {
                self.handle.reset().map_err(map_rusb_error)?;
                self.pipes.clear();
                self.claimed.clear();
                Ok(())
            }
            UrbFunction::Isochronous(_) | UrbFunction::GetCurrentFrameNumber { .. } => {
                Err(UsbdStatus::NOT_SUPPORTED)
            }
        }
    }

    fn claim(&mut self, interface: u8) -> UsbResult<()> {
        if self.claimed.contains(&interface) {
            return Ok(());
        }
        match self.handle.kernel_driver_active(interface) {
            Ok(true) => {
                debug!("Detaching kernel driver from interface {}", interface);
                if let Err(e) = self.handle.detach_kernel_driver(interface) {
                    warn!("Failed to detach kernel driver from interface {}: {}", interface, e);
                }
            }
            Ok(false) => {}
            Err(e) => debug!("Could not check kernel driver on interface {}: {}", interface, e),
        }
        self.handle.claim_interface(interface).map_err(|e| {
            warn!("Failed to claim interface {}: {}", interface, e);
            map_rusb_error(e)
        })?;
        self.claimed.push(interface);
        Ok(())
    }

    fn release_interfaces(&mut self) {
        for interface in std::mem::take(&mut self.claimed) {
            if let Err(e) = self.handle.release_interface(interface) {
                warn!("Failed to release interface {}: {}", interface, e);
            }
            if let Err(e) = self.handle.attach_kernel_driver(interface) {
                debug!("Could not reattach kernel driver to interface {}: {}", interface, e);
            }
        }
    }

    /// Fills the pipe entries of `info` from the active configuration
    fn open_pipes(
        &mut self,
        descriptor: &ConfigurationDescriptor,
        info: &mut InterfaceInformation,
    ) -> UsbResult<()> {
        let interface = descriptor
            .find_interface(info.number, info.alternate_setting)
            .ok_or(UsbdStatus::INVALID_PARAMETER)?;
        self.pipes.retain(|_, pipe| pipe.interface != info.number);

        let requested: Vec<(u8, u32)> = info
            .pipes
            .iter()
            .map(|p| (p.address, p.max_transfer_size))
            .collect();
        let mut pipes = Vec::with_capacity(interface.endpoints.len());
        for ep in &interface.endpoints {
            let handle = PipeHandle(self.next_handle);
            self.next_handle += 1;
            self.pipes.insert(
                handle,
                HostPipe {
                    address: ep.address,
                    interface: info.number,
                    pipe_type: ep.pipe_type(),
                    packet_size: ep.packet_size(),
                },
            );
            pipes.push(PipeInformation {
                address: ep.address,
                pipe_type: Some(ep.pipe_type()),
                max_packet_size: ep.max_packet_size,
                interval: ep.interval,
                max_transfer_size: requested
                    .iter()
                    .find(|(address, _)| *address == ep.address)
                    .map_or(0, |(_, size)| *size),
                handle,
            });
        }
        info.pipes = pipes;
        Ok(())
    }

    fn select_configuration(
        &mut self,
        raw: Option<&[u8]>,
        interfaces: &mut [InterfaceInformation],
        handle: &mut ConfigurationHandle,
    ) -> UsbResult<()> {
        self.release_interfaces();
        self.pipes.clear();

        let Some(raw) = raw else {
            // bConfigurationValue 0 puts the device in the address state
            self.handle
                .set_active_configuration(0)
                .map_err(map_rusb_error)?;
            *handle = ConfigurationHandle(0);
            return Ok(());
        };

        let descriptor =
            ConfigurationDescriptor::parse(raw).map_err(|_| UsbdStatus::INVALID_PARAMETER)?;
        match self.handle.active_configuration() {
            Ok(active) if active == descriptor.value => {}
            _ => self
                .handle
                .set_active_configuration(descriptor.value)
                .map_err(map_rusb_error)?,
        }

        for info in interfaces.iter_mut() {
            self.claim(info.number)?;
            self.open_pipes(&descriptor, info)?;
        }
        *handle = ConfigurationHandle(u64::from(descriptor.value));
        info!("Host device configuration {} selected", descriptor.value);
        Ok(())
    }

    fn select_interface(&mut self, info: &mut InterfaceInformation) -> UsbResult<()> {
        let config = self
            .handle
            .device()
            .active_config_descriptor()
            .map_err(map_rusb_error)?;
        let descriptor = ConfigurationDescriptor::parse(&raw_configuration(&config))
            .map_err(|_| UsbdStatus::INVALID_PARAMETER)?;

        self.claim(info.number)?;
        self.handle
            .set_alternate_setting(info.number, info.alternate_setting)
            .map_err(map_rusb_error)?;
        self.open_pipes(&descriptor, info)
    }
}

/// Rebuilds the descriptor table walk the driver understands from rusb's
/// parsed configuration
fn raw_configuration(config: &rusb::ConfigDescriptor) -> Vec<u8> {
    let mut built = ConfigurationDescriptor::new(config.number());
    for interface in config.interfaces() {
        for alt in interface.descriptors() {
            let mut desc =
                protocol::InterfaceDescriptor::new(alt.interface_number(), alt.setting_number());
            for ep in alt.endpoint_descriptors() {
                let mut endpoint = protocol::EndpointDescriptor::new(
                    ep.address(),
                    protocol::PipeType::from_attributes(ep.transfer_type() as u8),
                    ep.max_packet_size(),
                );
                endpoint.interval = ep.interval();
                desc = desc.endpoint(endpoint);
            }
            built = built.interface(desc);
        }
    }
    built.to_bytes()
}
