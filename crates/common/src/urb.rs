//! USB request blocks
//!
//! A [`Urb`] describes one bus operation submitted to the USB stack below
//! the driver. The bus fills in the output fields (pipe handles, byte
//! counts, packet results) and the embedded [`UsbdStatus`] before
//! completing it.

use crate::buffer::Mdl;
use protocol::{Direction, PipeType, UsbdStatus};

/// Opaque handle the bus assigns to an open pipe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PipeHandle(pub u64);

/// Opaque handle the bus assigns to a selected configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ConfigurationHandle(pub u64);

/// Transfer flags understood by the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct UrbFlags(pub u32);

impl UrbFlags {
    pub const DIRECTION_IN: Self = Self(1 << 0);
    pub const SHORT_TRANSFER_OK: Self = Self(1 << 1);
    pub const START_ISO_TRANSFER_ASAP: Self = Self(1 << 2);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn direction(self) -> Direction {
        if self.contains(Self::DIRECTION_IN) {
            Direction::In
        } else {
            Direction::Out
        }
    }
}

/// Pipe entry of a select-configuration or select-interface request.
/// `max_transfer_size` is an input; the rest is filled by the bus.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PipeInformation {
    pub address: u8,
    pub pipe_type: Option<PipeType>,
    pub max_packet_size: u16,
    pub interval: u8,
    pub max_transfer_size: u32,
    pub handle: PipeHandle,
}

/// Interface entry of a select-configuration or select-interface request
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InterfaceInformation {
    pub number: u8,
    pub alternate_setting: u8,
    pub pipes: Vec<PipeInformation>,
}

/// Setup stage of a control transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub fn direction(&self) -> Direction {
        Direction::of_endpoint(self.request_type)
    }
}

#[derive(Debug, Clone)]
pub struct ControlTransfer {
    pub setup: SetupPacket,
    pub buffer: Mdl,
    /// Bytes moved in the data stage
    pub transferred: usize,
}

#[derive(Debug, Clone)]
pub struct DataTransfer {
    pub pipe: PipeHandle,
    pub endpoint: u8,
    pub flags: UrbFlags,
    pub buffer: Mdl,
    pub transferred: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoPacket {
    pub offset: u32,
    pub length: u32,
    pub status: UsbdStatus,
}

#[derive(Debug, Clone)]
pub struct IsoTransfer {
    pub pipe: PipeHandle,
    pub endpoint: u8,
    pub flags: UrbFlags,
    /// Ignored when `START_ISO_TRANSFER_ASAP` is set
    pub start_frame: u32,
    pub buffer: Mdl,
    pub packets: Vec<IsoPacket>,
    pub error_count: u32,
    pub transferred: usize,
}

#[derive(Debug, Clone)]
pub enum UrbFunction {
    /// `configuration` is the raw configuration descriptor; `None` unconfigures
    SelectConfiguration {
        configuration: Option<Vec<u8>>,
        interfaces: Vec<InterfaceInformation>,
        handle: ConfigurationHandle,
    },
    SelectInterface {
        configuration: ConfigurationHandle,
        interface: InterfaceInformation,
    },
    Control(ControlTransfer),
    BulkOrInterrupt(DataTransfer),
    Isochronous(IsoTransfer),
    AbortPipe(PipeHandle),
    ResetPipe(PipeHandle),
    GetCurrentFrameNumber { frame: u32 },
    ResetPort,
    CyclePort,
}

#[derive(Debug, Clone)]
pub struct Urb {
    pub function: UrbFunction,
    pub status: UsbdStatus,
}

impl Urb {
    pub fn new(function: UrbFunction) -> Self {
        Self {
            function,
            status: UsbdStatus::SUCCESS,
        }
    }

    /// Data-stage bytes reported by the bus
    pub fn transferred(&self) -> usize {
        match &self.function {
            UrbFunction::Control(c) => c.transferred,
            UrbFunction::BulkOrInterrupt(t) => t.transferred,
            UrbFunction::Isochronous(t) => t.transferred,
            _ => 0,
        }
    }

    /// Pipe this URB operates on, if any
    pub fn pipe(&self) -> Option<PipeHandle> {
        match &self.function {
            UrbFunction::BulkOrInterrupt(t) => Some(t.pipe),
            UrbFunction::Isochronous(t) => Some(t.pipe),
            UrbFunction::AbortPipe(p) | UrbFunction::ResetPipe(p) => Some(*p),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match &self.function {
            UrbFunction::SelectConfiguration { .. } => "SELECT_CONFIGURATION",
            UrbFunction::SelectInterface { .. } => "SELECT_INTERFACE",
            UrbFunction::Control(_) => "CONTROL_TRANSFER",
            UrbFunction::BulkOrInterrupt(_) => "BULK_OR_INTERRUPT_TRANSFER",
            UrbFunction::Isochronous(_) => "ISOCH_TRANSFER",
            UrbFunction::AbortPipe(_) => "ABORT_PIPE",
            UrbFunction::ResetPipe(_) => "RESET_PIPE",
            UrbFunction::GetCurrentFrameNumber { .. } => "GET_CURRENT_FRAME_NUMBER",
            UrbFunction::ResetPort => "RESET_PORT",
            UrbFunction::CyclePort => "CYCLE_PORT",
        }
    }
}

/// Packet layout for an isochronous chunk: `offset = i * packet_size`,
/// the last packet taking whatever remains
pub fn iso_packets(length: usize, packet_size: usize) -> Vec<IsoPacket> {
    if packet_size == 0 {
        return Vec::new();
    }
    (0..length.div_ceil(packet_size))
        .map(|i| {
            let offset = i * packet_size;
            IsoPacket {
                offset: offset as u32,
                length: packet_size.min(length - offset) as u32,
                status: UsbdStatus::SUCCESS,
            }
        })
        .collect()
}
