//! Integration tests for configuration parsing
//!
//! Tests the driver configuration file, including:
//! - `[driver]` tunables with defaults for omitted keys
//! - `[device]` registry snapshot: mode, properties, custom values
//! - `[simulation]` device layouts
//! - Saving, loading and tilde expansion
//! - Invalid configuration handling

use driver::config::{DriverConfig, InitialConfig, MAX_READ_WRITE, load_config};
use driver::sim::SimulatedBus;
use protocol::PipeType;

mod driver_section {
    use super::*;

    const FULL_DRIVER_CONFIG: &str = r#"
[driver]
log_level = "debug"
default_timeout_ms = 2000
max_control_timeout_ms = 1000
max_transfer_length = 1048576
default_max_transfer_size = 4096
strict_read_length = true
max_split_requests = 16
"#;

    #[test]
    fn test_parse_empty_config() {
        let config = DriverConfig::parse("").unwrap();
        assert_eq!(config.driver.log_level, "info");
        assert_eq!(config.driver.default_timeout_ms, 5000);
        assert_eq!(config.driver.max_control_timeout_ms, 5000);
        assert_eq!(config.driver.max_transfer_length, 16 * 1024 * 1024);
        assert_eq!(config.driver.default_max_transfer_size, MAX_READ_WRITE);
        assert_eq!(config.driver.max_split_requests, 1024);
        assert!(!config.device.is_filter);
    }

    #[test]
    fn test_parse_full_driver_section() {
        let config = DriverConfig::parse(FULL_DRIVER_CONFIG).unwrap();
        assert_eq!(config.driver.log_level, "debug");
        assert_eq!(config.driver.default_timeout_ms, 2000);
        assert_eq!(config.driver.max_control_timeout_ms, 1000);
        assert_eq!(config.driver.max_transfer_length, 1_048_576);
        assert_eq!(config.driver.default_max_transfer_size, 4096);
        assert!(config.driver.strict_read_length);
        assert_eq!(config.driver.max_split_requests, 16);
    }

    #[test]
    fn test_invalid_log_level() {
        let result = DriverConfig::parse("[driver]\nlog_level = \"verbose\"\n");
        assert!(result.is_err());
        let message = format!("{:#}", result.unwrap_err());
        assert!(message.contains("verbose"));
    }

    #[test]
    fn test_zero_limits_rejected() {
        for line in [
            "default_timeout_ms = 0",
            "max_control_timeout_ms = 0",
            "max_transfer_length = 0",
            "default_max_transfer_size = 0",
            "max_split_requests = 0",
        ] {
            let content = format!("[driver]\n{}\n", line);
            assert!(DriverConfig::parse(&content).is_err(), "{} accepted", line);
        }
    }

    #[test]
    fn test_wrong_value_type() {
        assert!(DriverConfig::parse("[driver]\nmax_split_requests = \"many\"\n").is_err());
    }
}

mod device_section {
    use super::*;

    const FILTER_DEVICE_CONFIG: &str = r#"
[device]
is_filter = true
surprise_removal_ok = false
initial_configuration = 0
device_interface_guid = "{20343A29-6DA1-4DB8-8A3C-16E774057BF5}"
stack_services = ["usbccgp", "HidUsb"]
incompatible_filters = ["hidusb"]

[[device.properties]]
id = 12
value = "USB Widget"

[[device.custom_values]]
name = "SurpriseRemovalOK"
value = "1"
"#;

    #[test]
    fn test_parse_filter_device() {
        let config = DriverConfig::parse(FILTER_DEVICE_CONFIG).unwrap();
        let device = &config.device;
        assert!(device.is_filter);
        assert!(!device.surprise_removal_ok);
        assert_eq!(device.initial_config(), InitialConfig::None);
        assert_eq!(
            device.device_interface_guid.as_deref(),
            Some("{20343A29-6DA1-4DB8-8A3C-16E774057BF5}")
        );
        assert!(!device.may_own_power_policy());
        assert_eq!(device.property(12), Some("USB Widget"));
        assert_eq!(device.property(13), None);
        assert_eq!(device.custom_value("surpriseremovalok"), Some("1"));
    }

    #[test]
    fn test_initial_configuration_values() {
        let active = DriverConfig::parse("[device]\ninitial_configuration = -1\n").unwrap();
        assert_eq!(active.device.initial_config(), InitialConfig::Active);

        let fixed = DriverConfig::parse("[device]\ninitial_configuration = 3\n").unwrap();
        assert_eq!(fixed.device.initial_config(), InitialConfig::Value(3));

        assert!(DriverConfig::parse("[device]\ninitial_configuration = 300\n").is_err());
    }

    #[test]
    fn test_invalid_interface_guid() {
        let content = "[device]\ndevice_interface_guid = \"not-a-guid\"\n";
        assert!(DriverConfig::parse(content).is_err());
    }
}

mod simulation_section {
    use super::*;

    const ISO_SIMULATION_CONFIG: &str = r#"
[simulation]
vendor_id = 0x04b4
product_id = 0x1004
configuration_value = 2

[[simulation.interfaces]]
number = 0

[[simulation.interfaces.endpoints]]
address = 0x81
kind = "bulk"
max_packet_size = 512

[[simulation.interfaces]]
number = 1
alternate_setting = 1

[[simulation.interfaces.endpoints]]
address = 0x83
kind = "iso"
max_packet_size = 1024
"#;

    #[test]
    fn test_default_layout_has_bulk_pair() {
        let config = DriverConfig::default();
        let layout = config.simulation.configuration().unwrap();
        let endpoints = &layout.interfaces[0].endpoints;
        assert_eq!(endpoints.len(), 2);
        assert!(endpoints.iter().all(|ep| ep.pipe_type() == PipeType::Bulk));
    }

    #[test]
    fn test_parse_simulation_layout() {
        let config = DriverConfig::parse(ISO_SIMULATION_CONFIG).unwrap();
        let descriptor = config.simulation.device_descriptor();
        assert_eq!(descriptor.vendor_id, 0x04b4);
        assert_eq!(descriptor.product_id, 0x1004);

        let layout = config.simulation.configuration().unwrap();
        assert_eq!(layout.value, 2);
        let iso = layout.find_interface(1, 1).unwrap();
        assert_eq!(iso.endpoints[0].pipe_type(), PipeType::Isochronous);
        assert_eq!(iso.endpoints[0].max_packet_size, 1024);
    }

    #[tokio::test]
    async fn test_bus_from_settings() {
        let config = DriverConfig::parse(ISO_SIMULATION_CONFIG).unwrap();
        let bus = SimulatedBus::from_settings(&config.simulation).unwrap();
        assert_eq!(bus.configuration(), 0);
        assert!(bus.urbs().is_empty());
    }

    #[test]
    fn test_invalid_endpoint_kind() {
        let content = r#"
[[simulation.interfaces]]
number = 0

[[simulation.interfaces.endpoints]]
address = 0x81
kind = "streaming"
max_packet_size = 512
"#;
        assert!(DriverConfig::parse(content).is_err());
    }

    #[test]
    fn test_default_pipe_address_rejected() {
        let content = r#"
[[simulation.interfaces]]
number = 0

[[simulation.interfaces.endpoints]]
address = 0x80
kind = "bulk"
max_packet_size = 64
"#;
        assert!(DriverConfig::parse(content).is_err());
    }
}

mod files {
    use super::*;
    use std::fs;

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("driver.toml");

        let mut config = DriverConfig::default();
        config.driver.max_split_requests = 8;
        config.device.is_filter = true;
        config.simulation.vendor_id = 0xbeef;
        config.save(&path).unwrap();
        assert!(path.exists());

        let loaded = DriverConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.driver.max_split_requests, 8);
        assert!(loaded.device.is_filter);
        assert_eq!(loaded.simulation.vendor_id, 0xbeef);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(DriverConfig::load(Some(dir.path().join("absent.toml"))).is_err());
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("driver.toml");
        fs::write(&path, "[driver]\nlog_level = \"chatty\"\n").unwrap();

        let err = DriverConfig::load(Some(path)).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse config file"));
    }

    #[test]
    fn test_load_config_plain_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("driver.toml");
        fs::write(&path, "[driver]\nlog_level = \"warn\"\n").unwrap();

        let config = load_config(path.to_str().unwrap()).unwrap();
        assert_eq!(config.driver.log_level, "warn");
    }

    #[test]
    fn test_default_path_location() {
        let path = DriverConfig::default_path();
        assert!(path.ends_with("libusb0/driver.toml"));
    }
}
