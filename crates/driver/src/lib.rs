//! libusb0 driver core
//!
//! The device side of a generic USB driver: client handles send device I/O
//! control requests, the driver turns them into URBs for the lower USB
//! stack and completes the requests when the stack answers. The same device
//! record serves as a function driver that owns the device or as a filter
//! sitting above another function driver.
//!
//! The lower stack is a [`common::UsbBus`]. Two are provided: a scriptable
//! in-memory device ([`sim::SimulatedBus`]) and a real device opened through
//! libusb ([`host::HostBus`]).

pub mod config;
pub mod device;
pub mod driver;
pub mod host;
pub mod internal_ioctl;
pub mod ioctl;
pub mod irp;
pub mod lower;
pub mod ops;
pub mod pipes;
pub mod pnp;
pub mod power;
pub mod remove_lock;
pub mod sim;
pub mod transfer;
pub mod usbd;

pub use config::{DeviceSettings, DriverConfig, DriverSettings, SimulationSettings};
pub use device::UsbDevice;
pub use driver::Driver;
pub use irp::{IoCompletion, IoRequest};
pub use lower::{DeviceStack, LowerDevice};
pub use pipes::OwnerId;
pub use pnp::{PnpMinor, PnpState};
pub use power::{DevicePowerState, PowerRequest, SystemPowerState};
