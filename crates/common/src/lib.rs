//! Shared contract between the driver core and its bus backends
//!
//! The URB and buffer model, the [`UsbBus`] trait every backend implements,
//! the channel bridge for backends that block, error handling and logging.

pub mod buffer;
pub mod bus;
pub mod channel;
pub mod error;
pub mod logging;
pub mod test_utils;
pub mod urb;

pub use buffer::{Mdl, TransferBuffer};
pub use bus::{Completion, Submission, UsbBus};
pub use channel::{BusBridge, BusCommand, BusWorker, create_bus_bridge};
pub use error::{Error, Result};
pub use logging::{LogLevelHandle, setup_logging};
pub use urb::{
    ConfigurationHandle, ControlTransfer, DataTransfer, InterfaceInformation, IsoPacket,
    IsoTransfer, PipeHandle, PipeInformation, SetupPacket, Urb, UrbFlags, UrbFunction,
};
