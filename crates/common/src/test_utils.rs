//! Test utilities shared across crates
//!
//! Descriptor fixtures, deterministic data patterns and a timeout wrapper
//! for async tests.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{bulk_device_config, pattern};
//!
//! let config = bulk_device_config();
//! assert_eq!(config.value, 1);
//! assert_eq!(pattern(4, 0x81), pattern(4, 0x81));
//! ```

use protocol::{
    ConfigurationDescriptor, DeviceDescriptor, EndpointDescriptor, InterfaceDescriptor, PipeType,
};
use std::future::Future;
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Run a future with the default test timeout
///
/// # Panics
/// Panics if the future does not complete within the timeout
pub async fn with_timeout<F, T>(future: F) -> T
where
    F: Future<Output = T>,
{
    tokio::time::timeout(DEFAULT_TEST_TIMEOUT, future)
        .await
        .expect("test timed out")
}

/// Deterministic byte pattern; `seed` separates streams
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(31).wrapping_add(seed as u32 * 7) as u8)
        .collect()
}

pub fn mock_device_descriptor(vendor_id: u16, product_id: u16) -> DeviceDescriptor {
    DeviceDescriptor {
        usb_version: 0x0200,
        class: 0xFF,
        subclass: 0,
        protocol: 0,
        max_packet_size0: 64,
        vendor_id,
        product_id,
        device_version: 0x0100,
        manufacturer_index: 1,
        product_index: 2,
        serial_index: 0,
        num_configurations: 1,
    }
}

/// Configuration 1: interface 0 with bulk IN 0x81 and bulk OUT 0x02
/// (512-byte packets); alternate setting 1 adds isochronous IN 0x83
/// (192-byte packets); interface 1 with interrupt IN 0x84 (64-byte packets).
pub fn bulk_device_config() -> ConfigurationDescriptor {
    ConfigurationDescriptor::new(1)
        .interface(
            InterfaceDescriptor::new(0, 0)
                .endpoint(EndpointDescriptor::new(0x81, PipeType::Bulk, 512))
                .endpoint(EndpointDescriptor::new(0x02, PipeType::Bulk, 512)),
        )
        .interface(
            InterfaceDescriptor::new(0, 1)
                .endpoint(EndpointDescriptor::new(0x81, PipeType::Bulk, 512))
                .endpoint(EndpointDescriptor::new(0x02, PipeType::Bulk, 512))
                .endpoint(EndpointDescriptor::new(0x83, PipeType::Isochronous, 192)),
        )
        .interface(
            InterfaceDescriptor::new(1, 0)
                .endpoint(EndpointDescriptor::new(0x84, PipeType::Interrupt, 64)),
        )
}
