//! URBs submitted through this device by the drivers above it
//!
//! In filter mode the function driver keeps talking to the device through
//! us. Its URBs are passed down unchanged unless they would disturb an
//! interface a client handle has claimed, and selections it makes are
//! mirrored into the pipe table so client transfers see the same pipes.

use crate::device::UsbDevice;
use crate::pipes::ActiveConfiguration;
use common::{Completion, Submission, Urb, UrbFunction};
use protocol::{ConfigurationDescriptor, NtStatus, UsbdStatus};
use std::sync::Arc;
use tracing::{debug, warn};

impl UsbDevice {
    /// Whether `urb` touches a claimed interface
    fn blocks_internal(&self, urb: &Urb) -> bool {
        let config = self.configuration();
        match &urb.function {
            UrbFunction::SelectConfiguration { .. } => config.any_claimed(),
            UrbFunction::SelectInterface { interface, .. } => config
                .interface(interface.number)
                .is_some_and(|slot| slot.owner.is_some()),
            _ => urb
                .pipe()
                .and_then(|handle| config.interface_of_handle(handle))
                .is_some_and(|slot| slot.owner.is_some()),
        }
    }

    /// Passes a URB from an upper driver down the stack
    pub fn dispatch_internal_urb(self: &Arc<Self>, submission: Submission) {
        let guard = match self.acquire() {
            Ok(guard) => guard,
            Err(e) => {
                submission.finish(UsbdStatus::DEVICE_GONE, e.nt_status());
                return;
            }
        };

        if self.blocks_internal(&submission.urb) {
            debug!(
                "{}: blocked {} on a claimed interface",
                self.name(),
                submission.urb.name()
            );
            let urb_status = submission.urb.status;
            submission.finish(urb_status, NtStatus::DEVICE_BUSY);
            return;
        }

        let Submission {
            urb,
            cancel,
            completion: upper,
        } = submission;
        let device = self.clone();
        let completion = Completion::new(move |urb, status| {
            device.touch();
            if status.is_success() && urb.status.is_success() {
                device.mirror_selection(&urb);
            }
            drop(guard);
            upper.complete(urb, status);
        });
        self.next_device()
            .submit(Submission::new(urb, cancel, completion));
    }

    fn mirror_selection(&self, urb: &Urb) {
        match &urb.function {
            UrbFunction::SelectConfiguration {
                configuration: None,
                handle,
                ..
            } => {
                self.pipes.replace(ActiveConfiguration::unconfigured(*handle));
                debug!("{}: upper driver unconfigured the device", self.name());
            }
            UrbFunction::SelectConfiguration {
                configuration: Some(raw),
                interfaces,
                handle,
            } => match ConfigurationDescriptor::parse(raw) {
                Ok(descriptor) => {
                    let value = descriptor.value;
                    self.pipes.replace(ActiveConfiguration::selected(
                        descriptor, *handle, interfaces,
                    ));
                    debug!("{}: current configuration is {}", self.name(), value);
                }
                Err(e) => warn!("{}: unreadable selected configuration: {}", self.name(), e),
            },
            UrbFunction::SelectInterface { interface, .. } => {
                let _ = self.pipes.update(|config| {
                    *config = config.with_interface(interface);
                    Ok(())
                });
                debug!(
                    "{}: current alternate setting of interface {} is {}",
                    self.name(),
                    interface.number,
                    interface.alternate_setting
                );
            }
            _ => {}
        }
    }
}
