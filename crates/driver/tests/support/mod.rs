//! Shared fixtures for the driver integration tests
//!
//! A device attached on the simulated bus, plus helpers to build client
//! requests and wait on simulated device state.

#![allow(dead_code)]

use common::test_utils::{bulk_device_config, mock_device_descriptor};
use common::{LogLevelHandle, TransferBuffer};
use driver::sim::SimulatedBus;
use driver::{
    DeviceSettings, DeviceStack, Driver, DriverSettings, IoCompletion, IoRequest, OwnerId,
    PnpMinor, UsbDevice,
};
use protocol::{EndpointParams, IoctlCode, NtStatus, Params, Request, TransferFlags};
use std::sync::Arc;
use std::time::Duration;

pub const BULK_IN: u8 = 0x81;
pub const BULK_OUT: u8 = 0x02;
pub const ISO_IN: u8 = 0x83;
pub const INT_IN: u8 = 0x84;

pub struct Rig {
    pub driver: Driver,
    pub bus: Arc<SimulatedBus>,
    pub device: Arc<UsbDevice>,
}

impl Rig {
    /// Device attached but not started
    pub fn attached(settings: DeviceSettings, tunables: DriverSettings) -> Self {
        let bus = SimulatedBus::new(
            mock_device_descriptor(0x1234, 0x5678),
            vec![bulk_device_config()],
        );
        Self::on_bus(bus, settings, tunables)
    }

    pub fn on_bus(bus: SimulatedBus, settings: DeviceSettings, tunables: DriverSettings) -> Self {
        let bus = Arc::new(bus);
        let driver = Driver::new(tunables, LogLevelHandle::detached(3));
        let device = driver
            .add_device(settings, DeviceStack::direct(bus.clone()))
            .expect("device id available");
        Self {
            driver,
            bus,
            device,
        }
    }

    /// Function-mode device, started and configured
    pub async fn started() -> Self {
        Self::started_with(DeviceSettings::default(), DriverSettings::default()).await
    }

    pub async fn started_with(settings: DeviceSettings, tunables: DriverSettings) -> Self {
        let rig = Self::attached(settings, tunables);
        assert_eq!(rig.device.dispatch_pnp(PnpMinor::Start).await, NtStatus::SUCCESS);
        rig
    }

    pub fn open(&self) -> OwnerId {
        self.device.open().expect("device open")
    }

    pub async fn ioctl(&self, request: IoRequest) -> IoCompletion {
        self.device.dispatch_ioctl(request).await
    }
}

/// Buffered request with an output buffer of `output_len` bytes
pub fn buffered(
    code: IoctlCode,
    owner: OwnerId,
    params: Params,
    output_len: usize,
) -> (IoRequest, TransferBuffer) {
    let output = TransferBuffer::new(output_len);
    let request = IoRequest::new(code, owner, Request::new(1000, params).encode(), output.clone());
    (request, output)
}

pub fn endpoint_params(endpoint: u8, max_transfer_size: u32) -> EndpointParams {
    EndpointParams {
        endpoint: u32::from(endpoint),
        max_transfer_size,
        ..EndpointParams::default()
    }
}

/// Direct transfer request over `buffer`
pub fn transfer(
    code: IoctlCode,
    owner: OwnerId,
    params: EndpointParams,
    buffer: TransferBuffer,
) -> IoRequest {
    IoRequest::new(code, owner, Request::new(0, Params::Endpoint(params)).encode(), buffer)
}

pub fn bulk_read(
    owner: OwnerId,
    len: usize,
    max_transfer_size: u32,
) -> (IoRequest, TransferBuffer) {
    let buffer = TransferBuffer::new(len);
    let request = transfer(
        IoctlCode::InterruptOrBulkRead,
        owner,
        endpoint_params(BULK_IN, max_transfer_size),
        buffer.clone(),
    );
    (request, buffer)
}

pub fn bulk_write(owner: OwnerId, data: Vec<u8>, max_transfer_size: u32) -> IoRequest {
    transfer(
        IoctlCode::InterruptOrBulkWrite,
        owner,
        endpoint_params(BULK_OUT, max_transfer_size),
        TransferBuffer::from_vec(data),
    )
}

pub fn short_not_ok(mut params: EndpointParams) -> EndpointParams {
    params.transfer_flags = TransferFlags::SHORT_NOT_OK;
    params
}

/// Polls `condition` until it holds
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    while !condition() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}
