//! libusb0-sim
//!
//! Drives the driver core from the command line. `simulate` attaches a
//! device on the in-memory bus and pushes a write and a read through the
//! full control-code path; `list` and `probe` talk to real devices through
//! libusb.

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use common::{TransferBuffer, setup_logging};
use driver::config::DriverConfig;
use driver::host::{self, HostBus};
use driver::sim::{SimulatedBus, in_data};
use driver::{DeviceStack, Driver, IoCompletion, IoRequest, OwnerId, PnpMinor, UsbDevice};
use protocol::{
    DescriptorParams, EndpointParams, IoctlCode, Params, Request, decode_version_reply,
    usb::descriptor_type,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "libusb0-sim")]
#[command(author, version, about = "Exercise the libusb0 driver core")]
#[command(long_about = "
Runs the libusb0 driver core in user space against a simulated device or a
real device opened through libusb.

EXAMPLES:
    # Split a 40000 byte read and write on the simulated bulk pipes
    libusb0-sim simulate --length 40000

    # Force small chunks to exercise the split path
    libusb0-sim simulate --length 100000 --max-transfer-size 4096

    # List host devices
    libusb0-sim list

    # Read the device descriptor of a host device through the driver
    libusb0-sim probe 1234:5678

CONFIGURATION:
    The configuration is read from the path given with --config, then
    ~/.config/libusb0/driver.toml, then built-in defaults.
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write and read back through the simulated device
    Simulate {
        /// Bytes to write and read
        #[arg(short = 'n', long, default_value_t = 40000)]
        length: usize,

        /// IN endpoint address
        #[arg(long, default_value = "0x81", value_parser = parse_u8)]
        read_endpoint: u8,

        /// OUT endpoint address
        #[arg(long, default_value = "0x02", value_parser = parse_u8)]
        write_endpoint: u8,

        /// Per-request chunk size; 0 uses the configured default
        #[arg(long, default_value_t = 0)]
        max_transfer_size: u32,

        /// Request timeout in milliseconds; 0 uses the configured default
        #[arg(long, default_value_t = 0)]
        timeout: u32,
    },

    /// List USB devices on this host
    List,

    /// Attach the driver to a host device and read its device descriptor
    Probe {
        /// Device as VID:PID in hex
        #[arg(value_parser = parse_vid_pid)]
        device: (u16, u16),
    },
}

fn parse_u8(s: &str) -> std::result::Result<u8, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid endpoint address '{}': {}", s, e))
}

fn parse_vid_pid(s: &str) -> std::result::Result<(u16, u16), String> {
    let (vid, pid) = s
        .split_once(':')
        .ok_or_else(|| format!("expected VID:PID, got '{}'", s))?;
    let vid = u16::from_str_radix(vid, 16).map_err(|e| format!("invalid vendor id: {}", e))?;
    let pid = u16::from_str_radix(pid, 16).map_err(|e| format!("invalid product id: {}", e))?;
    Ok((vid, pid))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = DriverConfig::default();
        let path = DriverConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = match args.config {
        Some(ref path) => {
            DriverConfig::load(Some(path.clone())).context("Failed to load configuration")?
        }
        None => DriverConfig::load_or_default(),
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.driver.log_level);
    let log = setup_logging(log_level).context("Failed to setup logging")?;

    info!("libusb0-sim v{}", env!("CARGO_PKG_VERSION"));

    match args.command {
        None | Some(Command::List) => list_devices(),
        Some(Command::Simulate {
            length,
            read_endpoint,
            write_endpoint,
            max_transfer_size,
            timeout,
        }) => {
            let driver = Driver::new(config.driver.clone(), log);
            let bus = Arc::new(SimulatedBus::from_settings(&config.simulation)?);
            let device = driver
                .add_device(config.device.clone(), DeviceStack::direct(bus.clone()))
                .context("Failed to attach simulated device")?;
            let plan = SimulatePlan {
                length,
                read_endpoint,
                write_endpoint,
                max_transfer_size,
                timeout,
                configuration: u32::from(config.simulation.configuration_value),
            };
            let result = simulate(&device, &bus, &plan).await;
            detach(&driver, &device).await;
            result
        }
        Some(Command::Probe { device: (vid, pid) }) => {
            let driver = Driver::new(config.driver.clone(), log);
            let bus = Arc::new(HostBus::open(vid, pid)?);
            let device = driver
                .add_device(config.device.clone(), DeviceStack::direct(bus.clone()))
                .context("Failed to attach host device")?;
            let result = probe(&device).await;
            detach(&driver, &device).await;
            if let Err(e) = bus.shutdown().await {
                warn!("Host bus shutdown: {:#}", e);
            }
            result
        }
    }
}

fn list_devices() -> Result<()> {
    let devices = host::list_devices()?;
    if devices.is_empty() {
        println!("No USB devices found.");
    } else {
        println!("Found {} USB device(s):\n", devices.len());
        for device in devices {
            println!("  {}", device);
        }
    }
    Ok(())
}

struct SimulatePlan {
    length: usize,
    read_endpoint: u8,
    write_endpoint: u8,
    max_transfer_size: u32,
    timeout: u32,
    configuration: u32,
}

async fn start(device: &Arc<UsbDevice>) -> Result<OwnerId> {
    let status = device.dispatch_pnp(PnpMinor::Start).await;
    if !status.is_success() {
        bail!("Device start failed: {}", status);
    }
    device.open().context("Failed to open device")
}

async fn call(
    device: &Arc<UsbDevice>,
    code: IoctlCode,
    owner: OwnerId,
    request: Request,
    buffer: TransferBuffer,
) -> Result<IoCompletion> {
    let completion = device
        .dispatch_ioctl(IoRequest::new(code, owner, request.encode(), buffer))
        .await;
    if !completion.is_success() {
        bail!(
            "{:?} failed: {}{}",
            code,
            completion.status,
            completion
                .urb_status
                .map(|s| format!(" (usb {})", s))
                .unwrap_or_default()
        );
    }
    Ok(completion)
}

async fn simulate(device: &Arc<UsbDevice>, bus: &SimulatedBus, plan: &SimulatePlan) -> Result<()> {
    let owner = start(device).await?;

    let reply = TransferBuffer::new(protocol::REQUEST_HEADER_LEN);
    call(
        device,
        IoctlCode::GetVersion,
        owner,
        Request::new(0, Params::None),
        reply.clone(),
    )
    .await?;
    let version = decode_version_reply(&reply.to_vec()).map_err(|e| anyhow!(e))?;
    println!("Driver version {}", version);

    call(
        device,
        IoctlCode::SetConfiguration,
        owner,
        Request::new(plan.timeout, Params::Configuration {
            configuration: plan.configuration,
        }),
        TransferBuffer::new(0),
    )
    .await?;

    let endpoint = |address: u8| {
        Params::Endpoint(EndpointParams {
            endpoint: u32::from(address),
            max_transfer_size: plan.max_transfer_size,
            ..EndpointParams::default()
        })
    };

    let payload: Vec<u8> = (0..plan.length).map(|i| (i % 251) as u8).collect();
    let started = Instant::now();
    let written = call(
        device,
        IoctlCode::InterruptOrBulkWrite,
        owner,
        Request::new(plan.timeout, endpoint(plan.write_endpoint)),
        TransferBuffer::from_vec(payload.clone()),
    )
    .await?;
    println!(
        "Wrote {} bytes to {:#04x} in {:?}",
        written.information,
        plan.write_endpoint,
        started.elapsed()
    );
    if bus.written(plan.write_endpoint) != payload {
        bail!("Device received different bytes than were written");
    }

    let data = TransferBuffer::new(plan.length);
    let started = Instant::now();
    let read = call(
        device,
        IoctlCode::InterruptOrBulkRead,
        owner,
        Request::new(plan.timeout, endpoint(plan.read_endpoint)),
        data.clone(),
    )
    .await?;
    println!(
        "Read {} bytes from {:#04x} in {:?}",
        read.information,
        plan.read_endpoint,
        started.elapsed()
    );
    if data.to_vec()[..read.information] != in_data(plan.read_endpoint, 0, read.information)[..] {
        bail!("Read data does not match the device pattern");
    }

    let stats = device.transfer_stats();
    println!(
        "URBs submitted: {}, split requests: {}, sub-requests: {}",
        bus.transfers().len(),
        stats.splits_started,
        stats.sub_requests_created
    );

    device.close(owner);
    Ok(())
}

async fn probe(device: &Arc<UsbDevice>) -> Result<()> {
    let owner = start(device).await?;

    let reply = TransferBuffer::new(protocol::DEVICE_DESCRIPTOR_LEN);
    let completion = call(
        device,
        IoctlCode::GetDescriptor,
        owner,
        Request::new(
            0,
            Params::Descriptor(DescriptorParams {
                descriptor_type: u32::from(descriptor_type::DEVICE),
                ..DescriptorParams::default()
            }),
        ),
        reply.clone(),
    )
    .await?;
    let raw = reply.to_vec();
    let descriptor = protocol::DeviceDescriptor::parse(&raw[..completion.information])
        .map_err(|e| anyhow!(e))?;
    println!("{:#?}", descriptor);

    device.close(owner);
    Ok(())
}

async fn detach(driver: &Driver, device: &Arc<UsbDevice>) {
    match driver.remove_device(device.id()).await {
        Ok(status) if status.is_success() => {}
        Ok(status) => warn!("Remove returned {}", status),
        Err(e) => warn!("Remove failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoint_address() {
        assert_eq!(parse_u8("0x81"), Ok(0x81));
        assert_eq!(parse_u8("2"), Ok(2));
        assert!(parse_u8("0x1ff").is_err());
    }

    #[test]
    fn test_parse_vid_pid() {
        assert_eq!(parse_vid_pid("1234:abcd"), Ok((0x1234, 0xabcd)));
        assert!(parse_vid_pid("1234").is_err());
        assert!(parse_vid_pid("xyz:0001").is_err());
    }

    #[test]
    fn test_cli_parses_simulate() {
        let args = Args::parse_from(["libusb0-sim", "simulate", "-n", "512"]);
        match args.command {
            Some(Command::Simulate { length, read_endpoint, .. }) => {
                assert_eq!(length, 512);
                assert_eq!(read_endpoint, 0x81);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
