//! Per-device record
//!
//! One [`UsbDevice`] exists per attachment to a device stack. It owns the
//! remove lock, the pipe table, the PnP and power state, and the per-endpoint
//! transfer bookkeeping. Every operation on the device runs while holding
//! the remove lock; teardown drains that lock before the record is
//! abandoned, after which any touch is counted as a use after teardown.

use crate::config::{DeviceSettings, DriverSettings};
use crate::lower::{DeviceStack, LowerDevice};
use crate::pipes::{ActiveConfiguration, OwnerId, PipeTable};
use crate::pnp::PnpState;
use crate::power::{DeviceCapabilities, PowerManager, PowerState};
use crate::remove_lock::{RemoveLock, RemoveLockGuard};
use crate::transfer::{EndpointState, TransferStats};
use common::{LogLevelHandle, Result};
use protocol::DEVICE_DESCRIPTOR_LEN;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct UsbDevice {
    id: u32,
    name: String,
    pub(crate) settings: Arc<DeviceSettings>,
    pub(crate) tunables: Arc<DriverSettings>,
    stack: DeviceStack,
    pub(crate) remove_lock: Arc<RemoveLock>,
    pub(crate) pipes: PipeTable,
    started: AtomicBool,
    pub(crate) pnp_state: Mutex<PnpState>,
    pub(crate) power: Mutex<PowerState>,
    pub(crate) capabilities: Mutex<DeviceCapabilities>,
    pub(crate) power_manager: Arc<dyn PowerManager>,
    pub(crate) device_descriptor: Mutex<Option<[u8; DEVICE_DESCRIPTOR_LEN]>>,
    endpoints: Mutex<HashMap<u8, Arc<EndpointState>>>,
    pub(crate) stats: TransferStats,
    interface_enabled: AtomicBool,
    open_handles: AtomicI32,
    alive: AtomicBool,
    use_after_teardown: AtomicUsize,
    pub(crate) log: LogLevelHandle,
}

impl UsbDevice {
    pub fn new(
        id: u32,
        settings: Arc<DeviceSettings>,
        tunables: Arc<DriverSettings>,
        stack: DeviceStack,
        power_manager: Arc<dyn PowerManager>,
        log: LogLevelHandle,
    ) -> Arc<Self> {
        let name = format!("\\\\.\\libusb0-{:04}", id);
        info!(
            "Attaching device {} ({} mode)",
            name,
            if settings.is_filter { "filter" } else { "function" }
        );
        Arc::new(Self {
            id,
            name,
            settings,
            tunables,
            stack,
            remove_lock: RemoveLock::new(),
            pipes: PipeTable::default(),
            started: AtomicBool::new(false),
            pnp_state: Mutex::new(PnpState::Added),
            power: Mutex::new(PowerState::default()),
            capabilities: Mutex::new(DeviceCapabilities::default()),
            power_manager,
            device_descriptor: Mutex::new(None),
            endpoints: Mutex::new(HashMap::new()),
            stats: TransferStats::default(),
            interface_enabled: AtomicBool::new(false),
            open_handles: AtomicI32::new(0),
            alive: AtomicBool::new(true),
            use_after_teardown: AtomicUsize::new(0),
            log,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Symbolic name clients open
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &DeviceSettings {
        &self.settings
    }

    pub fn is_filter(&self) -> bool {
        self.settings.is_filter
    }

    /// Object URBs are sent to: the next object in filter mode, the bus
    /// driver's object otherwise
    pub(crate) fn target(&self) -> &Arc<dyn LowerDevice> {
        if self.settings.is_filter {
            &self.stack.next
        } else {
            &self.stack.physical
        }
    }

    /// Object PnP and power requests are passed to
    pub(crate) fn next_device(&self) -> &Arc<dyn LowerDevice> {
        &self.stack.next
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub(crate) fn set_started(&self, started: bool) {
        self.started.store(started, Ordering::SeqCst);
    }

    pub fn pnp_state(&self) -> PnpState {
        *lock(&self.pnp_state)
    }

    pub fn configuration(&self) -> Arc<ActiveConfiguration> {
        self.pipes.snapshot()
    }

    pub fn capabilities(&self) -> DeviceCapabilities {
        lock(&self.capabilities).clone()
    }

    pub fn remove_lock_usage(&self) -> i64 {
        self.remove_lock.usage()
    }

    pub(crate) fn acquire(&self) -> Result<RemoveLockGuard> {
        self.remove_lock.acquire()
    }

    /// Bookkeeping for an endpoint address, created on first use
    pub(crate) fn endpoint(&self, address: u8) -> Arc<EndpointState> {
        lock(&self.endpoints)
            .entry(address)
            .or_insert_with(|| Arc::new(EndpointState::default()))
            .clone()
    }

    pub fn interface_enabled(&self) -> bool {
        self.interface_enabled.load(Ordering::SeqCst)
    }

    /// Enables or disables the device interface when one is registered
    pub(crate) fn set_interface_enabled(&self, enabled: bool) {
        if self.settings.device_interface_guid.is_none() {
            return;
        }
        if self.interface_enabled.swap(enabled, Ordering::SeqCst) != enabled {
            debug!(
                "Device interface {} {}",
                self.settings.device_interface_guid.as_deref().unwrap_or_default(),
                if enabled { "enabled" } else { "disabled" }
            );
        }
    }

    /// Opens a handle to the device
    pub fn open(&self) -> Result<OwnerId> {
        let _guard = self.acquire()?;
        let owner = OwnerId::next();
        let handles = self.open_handles.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("{}: open {:?}, {} handle(s)", self.name, owner, handles);
        Ok(owner)
    }

    /// Closes a handle; its interface claims are dropped
    pub fn close(&self, owner: OwnerId) {
        let handles = self.open_handles.fetch_sub(1, Ordering::SeqCst) - 1;
        let released = self.release_all_interfaces(owner);
        debug!(
            "{}: close {:?}, released {} interface(s), {} handle(s) left",
            self.name, owner, released, handles
        );
    }

    pub fn open_handles(&self) -> i32 {
        self.open_handles.load(Ordering::SeqCst)
    }

    /// Marks the record as torn down
    pub(crate) fn poison(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    /// Called from completion paths; records any touch after teardown
    pub(crate) fn touch(&self) {
        if !self.alive.load(Ordering::SeqCst) {
            self.use_after_teardown.fetch_add(1, Ordering::SeqCst);
            error!("{}: device record used after teardown", self.name);
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn use_after_teardown_count(&self) -> usize {
        self.use_after_teardown.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for UsbDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsbDevice")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("started", &self.is_started())
            .field("configuration", &self.configuration().value)
            .finish()
    }
}
