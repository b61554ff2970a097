//! Driver configuration management
//!
//! Three sections: `[driver]` holds the global tunables, `[device]` the
//! per-device snapshot normally read from the device's registry key, and
//! `[simulation]` the layout of the simulated device used by the CLI.

use anyhow::{Context, Result, anyhow};
use protocol::{
    ConfigurationDescriptor, DeviceDescriptor, EndpointDescriptor, InterfaceDescriptor, PipeType,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Platform ceiling for one transfer request handed to the bus
pub const MAX_READ_WRITE: u32 = 0x10000;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DriverConfig {
    #[serde(default)]
    pub driver: DriverSettings,
    #[serde(default)]
    pub device: DeviceSettings,
    #[serde(default)]
    pub simulation: SimulationSettings,
}

/// Global tunables shared by every device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverSettings {
    #[serde(default = "DriverSettings::default_log_level")]
    pub log_level: String,
    /// Timeout for internal requests that carry no client timeout
    #[serde(default = "DriverSettings::default_timeout")]
    pub default_timeout_ms: u32,
    /// Upper bound for client-supplied timeouts on clamped requests
    #[serde(default = "DriverSettings::default_timeout")]
    pub max_control_timeout_ms: u32,
    /// Largest direct transfer buffer accepted
    #[serde(default = "DriverSettings::default_max_transfer_length")]
    pub max_transfer_length: usize,
    /// Maximum transfer size requested for every pipe on selection
    #[serde(default = "DriverSettings::default_max_transfer_size")]
    pub default_max_transfer_size: u32,
    /// Reject reads whose length is not a multiple of the packet size
    #[serde(default)]
    pub strict_read_length: bool,
    /// Most sub-requests one split transfer may allocate
    #[serde(default = "DriverSettings::default_max_split_requests")]
    pub max_split_requests: usize,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            default_timeout_ms: Self::default_timeout(),
            max_control_timeout_ms: Self::default_timeout(),
            max_transfer_length: Self::default_max_transfer_length(),
            default_max_transfer_size: Self::default_max_transfer_size(),
            strict_read_length: false,
            max_split_requests: Self::default_max_split_requests(),
        }
    }
}

impl DriverSettings {
    fn default_log_level() -> String {
        "info".to_string()
    }

    fn default_timeout() -> u32 {
        5000
    }

    fn default_max_transfer_length() -> usize {
        16 * 1024 * 1024
    }

    fn default_max_transfer_size() -> u32 {
        MAX_READ_WRITE
    }

    fn default_max_split_requests() -> usize {
        1024
    }
}

/// Configuration applied when the device starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitialConfig {
    /// Leave the device unconfigured
    None,
    /// Select whatever configuration the device reports as active
    Active,
    Value(u8),
}

/// A device property served by the property query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProperty {
    pub id: u32,
    pub value: String,
}

/// A named value under the device key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomValue {
    pub name: String,
    pub value: String,
}

/// Per-device snapshot, immutable once the device is attached
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// Attached above an existing function driver
    #[serde(default)]
    pub is_filter: bool,
    #[serde(default = "DeviceSettings::default_true")]
    pub surprise_removal_ok: bool,
    /// -1 selects the active configuration, 0 none, otherwise the value
    #[serde(default = "DeviceSettings::default_initial_configuration")]
    pub initial_configuration: i32,
    #[serde(default)]
    pub device_interface_guid: Option<String>,
    /// Services attached to the same device stack
    #[serde(default)]
    pub stack_services: Vec<String>,
    /// Services that bar this driver from owning power policy
    #[serde(default)]
    pub incompatible_filters: Vec<String>,
    #[serde(default)]
    pub properties: Vec<DeviceProperty>,
    #[serde(default)]
    pub custom_values: Vec<CustomValue>,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            is_filter: false,
            surprise_removal_ok: true,
            initial_configuration: Self::default_initial_configuration(),
            device_interface_guid: None,
            stack_services: Vec::new(),
            incompatible_filters: Vec::new(),
            properties: Vec::new(),
            custom_values: Vec::new(),
        }
    }
}

impl DeviceSettings {
    fn default_true() -> bool {
        true
    }

    fn default_initial_configuration() -> i32 {
        -1
    }

    pub fn initial_config(&self) -> InitialConfig {
        match self.initial_configuration {
            0 => InitialConfig::None,
            v if v < 0 => InitialConfig::Active,
            v => InitialConfig::Value(v.min(u8::MAX as i32) as u8),
        }
    }

    /// False when an incompatible service shares the stack
    pub fn may_own_power_policy(&self) -> bool {
        !self.stack_services.iter().any(|service| {
            self.incompatible_filters
                .iter()
                .any(|bad| bad.eq_ignore_ascii_case(service))
        })
    }

    pub fn property(&self, id: u32) -> Option<&str> {
        self.properties
            .iter()
            .find(|p| p.id == id)
            .map(|p| p.value.as_str())
    }

    pub fn custom_value(&self, name: &str) -> Option<&str> {
        self.custom_values
            .iter()
            .find(|v| v.name.eq_ignore_ascii_case(name))
            .map(|v| v.value.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimEndpoint {
    pub address: u8,
    /// control, isochronous, bulk or interrupt
    pub kind: String,
    pub max_packet_size: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimInterface {
    pub number: u8,
    #[serde(default)]
    pub alternate_setting: u8,
    #[serde(default)]
    pub endpoints: Vec<SimEndpoint>,
}

/// Layout of the simulated device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationSettings {
    #[serde(default = "SimulationSettings::default_vendor_id")]
    pub vendor_id: u16,
    #[serde(default = "SimulationSettings::default_product_id")]
    pub product_id: u16,
    #[serde(default = "SimulationSettings::default_configuration_value")]
    pub configuration_value: u8,
    #[serde(default = "SimulationSettings::default_interfaces")]
    pub interfaces: Vec<SimInterface>,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            vendor_id: Self::default_vendor_id(),
            product_id: Self::default_product_id(),
            configuration_value: Self::default_configuration_value(),
            interfaces: Self::default_interfaces(),
        }
    }
}

impl SimulationSettings {
    fn default_vendor_id() -> u16 {
        0x1234
    }

    fn default_product_id() -> u16 {
        0x5678
    }

    fn default_configuration_value() -> u8 {
        1
    }

    fn default_interfaces() -> Vec<SimInterface> {
        vec![SimInterface {
            number: 0,
            alternate_setting: 0,
            endpoints: vec![
                SimEndpoint {
                    address: 0x81,
                    kind: "bulk".to_string(),
                    max_packet_size: 512,
                },
                SimEndpoint {
                    address: 0x02,
                    kind: "bulk".to_string(),
                    max_packet_size: 512,
                },
            ],
        }]
    }

    pub fn device_descriptor(&self) -> DeviceDescriptor {
        DeviceDescriptor {
            usb_version: 0x0200,
            class: 0xFF,
            subclass: 0,
            protocol: 0,
            max_packet_size0: 64,
            vendor_id: self.vendor_id,
            product_id: self.product_id,
            device_version: 0x0100,
            manufacturer_index: 0,
            product_index: 0,
            serial_index: 0,
            num_configurations: 1,
        }
    }

    pub fn configuration(&self) -> Result<ConfigurationDescriptor> {
        let mut config = ConfigurationDescriptor::new(self.configuration_value);
        for iface in &self.interfaces {
            let mut desc = InterfaceDescriptor::new(iface.number, iface.alternate_setting);
            for ep in &iface.endpoints {
                desc = desc.endpoint(EndpointDescriptor::new(
                    ep.address,
                    parse_pipe_type(&ep.kind)?,
                    ep.max_packet_size,
                ));
            }
            config = config.interface(desc);
        }
        Ok(config)
    }
}

fn parse_pipe_type(kind: &str) -> Result<PipeType> {
    match kind.to_ascii_lowercase().as_str() {
        "control" => Ok(PipeType::Control),
        "isochronous" | "iso" => Ok(PipeType::Isochronous),
        "bulk" => Ok(PipeType::Bulk),
        "interrupt" => Ok(PipeType::Interrupt),
        other => Err(anyhow!(
            "Invalid endpoint kind '{}', must be one of: control, isochronous, bulk, interrupt",
            other
        )),
    }
}

impl DriverConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p,
            None => Some(Self::default_path())
                .filter(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?,
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Parse and validate configuration text
    pub fn parse(content: &str) -> Result<Self> {
        let config: DriverConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("libusb0").join("driver.toml")
        } else {
            PathBuf::from(".config/libusb0/driver.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["off", "trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.driver.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.driver.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.driver.default_timeout_ms == 0 || self.driver.max_control_timeout_ms == 0 {
            return Err(anyhow!("Timeouts must be greater than zero"));
        }

        if self.driver.max_transfer_length == 0 || self.driver.default_max_transfer_size == 0 {
            return Err(anyhow!("Transfer limits must be greater than zero"));
        }

        if self.driver.max_split_requests == 0 {
            return Err(anyhow!("max_split_requests must be greater than zero"));
        }

        if self.device.initial_configuration > u8::MAX as i32 {
            return Err(anyhow!(
                "Invalid initial configuration {}",
                self.device.initial_configuration
            ));
        }

        if let Some(guid) = &self.device.device_interface_guid {
            Self::validate_guid(guid)?;
        }

        for iface in &self.simulation.interfaces {
            for ep in &iface.endpoints {
                parse_pipe_type(&ep.kind)?;
                if ep.address & 0x0F == 0 {
                    return Err(anyhow!(
                        "Endpoint address {:#04x} is reserved for the default pipe",
                        ep.address
                    ));
                }
            }
        }

        Ok(())
    }

    /// Validate a device interface GUID ({8-4-4-4-12} hex, braces optional)
    fn validate_guid(guid: &str) -> Result<()> {
        let inner = guid.trim_start_matches('{').trim_end_matches('}');
        let groups: Vec<&str> = inner.split('-').collect();
        let lengths = [8, 4, 4, 4, 12];
        let valid = groups.len() == lengths.len()
            && groups
                .iter()
                .zip(lengths)
                .all(|(g, len)| g.len() == len && g.chars().all(|c| c.is_ascii_hexdigit()));
        if !valid {
            return Err(anyhow!(
                "Invalid device interface GUID '{}', expected {{xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx}}",
                guid
            ));
        }
        Ok(())
    }
}

/// Load a configuration file, expanding `~` in the path
pub fn load_config(path: &str) -> Result<DriverConfig> {
    let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
    DriverConfig::load(Some(path_buf))
}
