use crate::device::UsbDevice;
use common::{Error, Mdl, Result};
use protocol::encode_name;
use tracing::debug;

/// Copies a property value into `output`. A missing value is not an
/// error: the query succeeds with no data.
fn copy_value(value: Option<&str>, output: &Mdl) -> Result<usize> {
    let Some(value) = value else {
        return Ok(0);
    };
    let encoded = encode_name(value);
    if encoded.len() > output.len() {
        return Err(Error::BufferTooSmall {
            needed: encoded.len(),
            available: output.len(),
        });
    }
    Ok(output.write(0, &encoded))
}

impl UsbDevice {
    /// Device property by platform property id, as UTF-16LE with a
    /// terminating NUL
    pub fn get_device_property(&self, property: u32, output: &Mdl) -> Result<usize> {
        let value = self.settings.property(property);
        debug!(
            "{}: device property {} {}",
            self.name(),
            property,
            if value.is_some() { "found" } else { "not set" }
        );
        copy_value(value, output)
    }

    /// Named custom value from the device's registry key
    pub fn get_custom_property(&self, name: &str, output: &Mdl) -> Result<usize> {
        let value = self.settings.custom_value(name);
        debug!(
            "{}: custom property {:?} {}",
            self.name(),
            name,
            if value.is_some() { "found" } else { "not set" }
        );
        copy_value(value, output)
    }
}
