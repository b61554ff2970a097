//! Plug and Play state machine
//!
//! `Added -> Started <-> Stopped -> SurpriseRemoved | Removed`. Stopping
//! and surprise removal only close the gate for new requests. Removal is
//! the one transition that waits: it drains the remove lock before the
//! request goes down and the record is given up.

use crate::device::{UsbDevice, lock};
use protocol::NtStatus;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PnpMinor {
    Start,
    QueryStop,
    Stop,
    CancelStop,
    QueryRemove,
    CancelRemove,
    Remove,
    SurpriseRemoval,
    QueryCapabilities,
    /// Anything else; passed down untouched
    Other(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PnpState {
    Added,
    Stopped,
    Started,
    SurpriseRemoved,
    Removed,
}

impl UsbDevice {
    fn set_pnp_state(&self, state: PnpState) {
        let previous = std::mem::replace(&mut *lock(&self.pnp_state), state);
        if previous != state {
            debug!("{}: {:?} -> {:?}", self.name(), previous, state);
        }
    }

    /// Handles a PnP request sent to this device
    pub async fn dispatch_pnp(&self, minor: PnpMinor) -> NtStatus {
        let guard = match self.acquire() {
            Ok(guard) => guard,
            Err(e) => return e.nt_status(),
        };

        match minor {
            PnpMinor::Remove => {
                info!("{}: removing", self.name());
                self.set_started(false);
                self.set_interface_enabled(false);
                self.remove_lock.release_and_wait(guard).await;

                let status = self.next_device().forward_pnp(minor);
                self.set_pnp_state(PnpState::Removed);
                self.poison();
                info!("{}: removed", self.name());
                status
            }
            PnpMinor::SurpriseRemoval => {
                warn!("{}: surprise removal", self.name());
                self.set_started(false);
                self.set_interface_enabled(false);
                self.set_pnp_state(PnpState::SurpriseRemoved);
                self.next_device().forward_pnp(minor)
            }
            PnpMinor::Stop => {
                info!("{}: stopping", self.name());
                self.set_started(false);
                self.set_interface_enabled(false);
                self.set_pnp_state(PnpState::Stopped);
                self.next_device().forward_pnp(minor)
            }
            PnpMinor::Start => self.start_device().await,
            PnpMinor::QueryCapabilities => self.query_capabilities(),
            _ => self.next_device().forward_pnp(minor),
        }
    }

    async fn start_device(&self) -> NtStatus {
        let status = self.next_device().forward_pnp(PnpMinor::Start);
        if !status.is_success() {
            warn!("{}: lower stack failed start: {}", self.name(), status);
            return status;
        }

        if !self.is_filter() {
            self.power_up();
            match self.apply_initial_configuration().await {
                Ok(0) => debug!("{}: left unconfigured", self.name()),
                Ok(value) => info!("{}: initial configuration {}", self.name(), value),
                Err(e) => warn!("{}: initial configuration failed: {}", self.name(), e),
            }
        }

        self.set_interface_enabled(true);
        self.set_started(true);
        self.set_pnp_state(PnpState::Started);
        info!("{}: started", self.name());
        NtStatus::SUCCESS
    }

    fn query_capabilities(&self) -> NtStatus {
        let status = self.next_device().forward_pnp(PnpMinor::QueryCapabilities);
        if !status.is_success() {
            return status;
        }
        let mut caps = self.next_device().capabilities();
        if !self.is_filter() {
            caps.surprise_removal_ok = self.settings.surprise_removal_ok;
        }
        debug!(
            "{}: capabilities, surprise removal {}",
            self.name(),
            if caps.surprise_removal_ok { "ok" } else { "not ok" }
        );
        *lock(&self.capabilities) = caps;
        status
    }
}
