//! Driver version reported to clients

use serde::{Deserialize, Serialize};

/// Four-part driver version plus the reply format marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DriverVersion {
    pub major: u32,
    pub minor: u32,
    pub micro: u32,
    pub nano: u32,
    /// Reply format marker; 1 for replies from this driver family
    pub mod_value: u32,
}

/// Compiled-in version returned by every version query
pub const DRIVER_VERSION: DriverVersion = DriverVersion {
    major: 1,
    minor: 2,
    micro: 7,
    nano: 3,
    mod_value: 1,
};

impl DriverVersion {
    pub fn as_tuple(&self) -> (u32, u32, u32, u32) {
        (self.major, self.minor, self.micro, self.nano)
    }
}

impl std::fmt::Display for DriverVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}.{}", self.major, self.minor, self.micro, self.nano)
    }
}
