//! Interface and pipe table
//!
//! The table describing the selected configuration is immutable once built.
//! Every change (configuration selected, alternate setting switched,
//! interface claimed) produces a new table that replaces the old one in a
//! single pointer swap, so a reader holding a snapshot never sees a
//! half-rebuilt table.

use common::{ConfigurationHandle, Error, InterfaceInformation, PipeHandle, Result};
use protocol::{ConfigurationDescriptor, Direction, PipeType};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::warn;

/// Identity of an open handle to the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId(pub u64);

impl OwnerId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeRecord {
    pub address: u8,
    pub handle: PipeHandle,
    pub pipe_type: PipeType,
    pub max_packet_size: u16,
    pub max_transfer_size: u32,
    pub interval: u8,
}

impl PipeRecord {
    pub fn direction(&self) -> Direction {
        Direction::of_endpoint(self.address)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceSlot {
    pub number: u8,
    pub alternate_setting: u8,
    pub valid: bool,
    pub owner: Option<OwnerId>,
    pub pipes: Vec<PipeRecord>,
}

impl InterfaceSlot {
    fn from_information(info: &InterfaceInformation) -> Self {
        Self {
            number: info.number,
            alternate_setting: info.alternate_setting,
            valid: true,
            owner: None,
            pipes: info
                .pipes
                .iter()
                .map(|p| PipeRecord {
                    address: p.address,
                    handle: p.handle,
                    pipe_type: p.pipe_type.unwrap_or(PipeType::Bulk),
                    max_packet_size: p.max_packet_size,
                    max_transfer_size: p.max_transfer_size,
                    interval: p.interval,
                })
                .collect(),
        }
    }
}

/// Snapshot of the selected configuration
#[derive(Debug, Clone, Default)]
pub struct ActiveConfiguration {
    /// 0 while unconfigured
    pub value: u8,
    pub handle: ConfigurationHandle,
    pub descriptor: Option<Arc<ConfigurationDescriptor>>,
    pub interfaces: Vec<InterfaceSlot>,
}

impl ActiveConfiguration {
    /// Table for a freshly selected configuration
    pub fn selected(
        descriptor: ConfigurationDescriptor,
        handle: ConfigurationHandle,
        interfaces: &[InterfaceInformation],
    ) -> Self {
        let config = Self {
            value: descriptor.value,
            handle,
            descriptor: Some(Arc::new(descriptor)),
            interfaces: interfaces.iter().map(InterfaceSlot::from_information).collect(),
        };
        config.warn_duplicate_addresses();
        config
    }

    pub fn unconfigured(handle: ConfigurationHandle) -> Self {
        Self {
            handle,
            ..Self::default()
        }
    }

    pub fn is_configured(&self) -> bool {
        self.value != 0
    }

    pub fn interface(&self, number: u8) -> Option<&InterfaceSlot> {
        self.interfaces.iter().find(|i| i.number == number)
    }

    fn interface_mut(&mut self, number: u8) -> Option<&mut InterfaceSlot> {
        self.interfaces.iter_mut().find(|i| i.number == number)
    }

    /// Linear scan of every valid interface for an endpoint address
    pub fn find_pipe(&self, address: u8) -> Option<(&InterfaceSlot, &PipeRecord)> {
        self.interfaces
            .iter()
            .filter(|i| i.valid)
            .find_map(|i| i.pipes.iter().find(|p| p.address == address).map(|p| (i, p)))
    }

    /// Interface owning a pipe handle
    pub fn interface_of_handle(&self, handle: PipeHandle) -> Option<&InterfaceSlot> {
        self.interfaces
            .iter()
            .filter(|i| i.valid)
            .find(|i| i.pipes.iter().any(|p| p.handle == handle))
    }

    pub fn any_claimed(&self) -> bool {
        self.interfaces.iter().any(|i| i.owner.is_some())
    }

    /// Replaces one interface after an alternate-setting switch, keeping its claim
    pub fn with_interface(&self, info: &InterfaceInformation) -> Self {
        let mut next = self.clone();
        let owner = self.interface(info.number).and_then(|i| i.owner);
        let mut slot = InterfaceSlot::from_information(info);
        slot.owner = owner;
        match next.interface_mut(info.number) {
            Some(existing) => *existing = slot,
            None => next.interfaces.push(slot),
        }
        next.warn_duplicate_addresses();
        next
    }

    fn warn_duplicate_addresses(&self) {
        let mut seen: Vec<(u8, u8)> = Vec::new();
        for iface in self.interfaces.iter().filter(|i| i.valid) {
            for pipe in &iface.pipes {
                if let Some((_, other)) = seen.iter().find(|(a, _)| *a == pipe.address) {
                    warn!(
                        "Endpoint {:#04x} appears in interfaces {} and {}",
                        pipe.address, other, iface.number
                    );
                } else {
                    seen.push((pipe.address, iface.number));
                }
            }
        }
    }
}

/// Copy-on-write holder for the current table
#[derive(Debug, Default)]
pub struct PipeTable {
    current: RwLock<Arc<ActiveConfiguration>>,
}

impl PipeTable {
    pub fn snapshot(&self) -> Arc<ActiveConfiguration> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn replace(&self, next: ActiveConfiguration) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
    }

    /// Applies `f` to a copy of the table and swaps it in when `f` succeeds
    pub fn update<R>(&self, f: impl FnOnce(&mut ActiveConfiguration) -> Result<R>) -> Result<R> {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = ActiveConfiguration::clone(&guard);
        let result = f(&mut next)?;
        *guard = Arc::new(next);
        Ok(result)
    }

    pub fn claim(&self, owner: OwnerId, interface: u8) -> Result<()> {
        self.update(|config| {
            if !config.is_configured() {
                return Err(Error::DeviceNotConfigured);
            }
            let slot = config
                .interface_mut(interface)
                .filter(|s| s.valid)
                .ok_or_else(|| Error::InvalidParameter(format!("invalid interface {}", interface)))?;
            match slot.owner {
                Some(current) if current == owner => Ok(()),
                Some(_) => Err(Error::DeviceBusy(format!(
                    "interface {} is already claimed",
                    interface
                ))),
                None => {
                    slot.owner = Some(owner);
                    Ok(())
                }
            }
        })
    }

    pub fn release(&self, owner: OwnerId, interface: u8) -> Result<()> {
        self.update(|config| {
            if !config.is_configured() {
                return Err(Error::DeviceNotConfigured);
            }
            let slot = config
                .interface_mut(interface)
                .filter(|s| s.valid)
                .ok_or_else(|| Error::InvalidParameter(format!("invalid interface {}", interface)))?;
            match slot.owner {
                Some(current) if current == owner => {
                    slot.owner = None;
                    Ok(())
                }
                Some(_) => Err(Error::DeviceBusy(format!(
                    "interface {} is claimed by another handle",
                    interface
                ))),
                None => Err(Error::InvalidParameter(format!(
                    "interface {} is not claimed",
                    interface
                ))),
            }
        })
    }

    /// Drops every claim held by `owner`; returns how many were released
    pub fn release_all(&self, owner: OwnerId) -> usize {
        self.update(|config| {
            let mut released = 0;
            for slot in config.interfaces.iter_mut() {
                if slot.owner == Some(owner) {
                    slot.owner = None;
                    released += 1;
                }
            }
            Ok(released)
        })
        .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::PipeInformation;
    use common::test_utils::bulk_device_config;

    fn information(number: u8, alt: u8, addresses: &[u8]) -> InterfaceInformation {
        InterfaceInformation {
            number,
            alternate_setting: alt,
            pipes: addresses
                .iter()
                .enumerate()
                .map(|(i, &address)| PipeInformation {
                    address,
                    pipe_type: Some(PipeType::Bulk),
                    max_packet_size: 512,
                    interval: 0,
                    max_transfer_size: 16384,
                    handle: PipeHandle(100 + i as u64 + number as u64 * 10),
                })
                .collect(),
        }
    }

    fn configured() -> PipeTable {
        let table = PipeTable::default();
        table.replace(ActiveConfiguration::selected(
            bulk_device_config(),
            ConfigurationHandle(7),
            &[information(0, 0, &[0x81, 0x02]), information(1, 0, &[0x84])],
        ));
        table
    }

    #[test]
    fn test_find_pipe_linear_scan() {
        let table = configured();
        let snapshot = table.snapshot();
        let (iface, pipe) = snapshot.find_pipe(0x84).unwrap();
        assert_eq!(iface.number, 1);
        assert_eq!(pipe.handle, PipeHandle(110));
        assert!(snapshot.find_pipe(0x85).is_none());
    }

    #[test]
    fn test_claim_twice() {
        let table = configured();
        let (a, b) = (OwnerId(1), OwnerId(2));

        table.claim(a, 0).unwrap();
        table.claim(a, 0).unwrap();
        assert!(matches!(table.claim(b, 0), Err(Error::DeviceBusy(_))));
        assert!(matches!(table.release(b, 0), Err(Error::DeviceBusy(_))));

        table.release(a, 0).unwrap();
        table.claim(b, 0).unwrap();
    }

    #[test]
    fn test_claim_unconfigured_and_unknown() {
        let table = PipeTable::default();
        assert_eq!(table.claim(OwnerId(1), 0), Err(Error::DeviceNotConfigured));

        let table = configured();
        assert!(matches!(
            table.claim(OwnerId(1), 5),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_snapshot_unaffected_by_swap() {
        let table = configured();
        let before = table.snapshot();
        table.replace(ActiveConfiguration::unconfigured(ConfigurationHandle(0)));

        assert!(before.find_pipe(0x81).is_some());
        assert!(table.snapshot().find_pipe(0x81).is_none());
    }

    #[test]
    fn test_alt_setting_keeps_claim() {
        let table = configured();
        table.claim(OwnerId(3), 0).unwrap();
        let next = table
            .snapshot()
            .with_interface(&information(0, 1, &[0x81, 0x02, 0x83]));
        table.replace(next);

        let snapshot = table.snapshot();
        let slot = snapshot.interface(0).unwrap();
        assert_eq!(slot.alternate_setting, 1);
        assert_eq!(slot.owner, Some(OwnerId(3)));
        assert_eq!(slot.pipes.len(), 3);
    }

    #[test]
    fn test_release_all() {
        let table = configured();
        table.claim(OwnerId(9), 0).unwrap();
        table.claim(OwnerId(9), 1).unwrap();
        assert_eq!(table.release_all(OwnerId(9)), 2);
        assert!(!table.snapshot().any_claimed());
    }
}
