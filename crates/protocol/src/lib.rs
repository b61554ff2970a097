//! Client-visible request surface of the libusb0 driver
//!
//! This crate defines what a user-mode library sends to the driver and what
//! comes back: control codes, the fixed request header, transfer flags,
//! the completion status spaces, the compiled-in driver version and the
//! standard USB descriptors the driver parses.
//!
//! # Example
//!
//! ```
//! use protocol::{IoctlCode, Params, Request};
//!
//! let request = Request::new(1000, Params::Configuration { configuration: 1 });
//! let raw = request.encode();
//!
//! let decoded = Request::decode(IoctlCode::SetConfiguration, &raw).unwrap();
//! assert_eq!(decoded.params, Params::Configuration { configuration: 1 });
//! ```

pub mod descriptor;
pub mod error;
pub mod ioctl;
pub mod request;
pub mod status;
pub mod usb;
pub mod version;

pub use descriptor::{
    ConfigurationDescriptor, DeviceDescriptor, EndpointDescriptor, InterfaceDescriptor,
};
pub use error::{ProtocolError, Result};
pub use ioctl::{IoctlCode, TransferMethod, ctl_code};
pub use request::{
    DescriptorParams, EndpointParams, MAX_BUFFERED_LEN, Params, REQUEST_HEADER_LEN, Request,
    VendorParams, decode_version_reply, encode_name, encode_version_reply,
};
pub use status::{NtStatus, UsbdStatus};
pub use usb::{
    DEVICE_DESCRIPTOR_LEN, Direction, ENDPOINT_DIR_IN, PipeType, Recipient, RequestKind,
    TransferFlags, request_type,
};
pub use version::{DRIVER_VERSION, DriverVersion};
