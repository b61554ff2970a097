//! Device I/O control dispatch
//!
//! Every request enters the remove lock before anything else and leaves it
//! exactly once: buffered operations release it when they return, direct
//! transfers carry the hold into the transfer engine and release it after
//! their completion has been delivered.

use crate::device::UsbDevice;
use crate::irp::{IoCompletion, IoRequest};
use crate::remove_lock::RemoveLockGuard;
use crate::transfer::{PendingTransfer, Transfer, max_transfer_size};
use common::{Error, Result};
use protocol::{
    DRIVER_VERSION, Direction, IoctlCode, MAX_BUFFERED_LEN, Params, PipeType,
    REQUEST_HEADER_LEN, Request, encode_version_reply,
};
use std::sync::Arc;
use tracing::{debug, warn};

fn narrow<T: TryFrom<u32>>(value: u32, what: &str) -> Result<T> {
    T::try_from(value).map_err(|_| Error::InvalidParameter(format!("{} {} out of range", what, value)))
}

fn require_output(code: IoctlCode, output_len: usize, needed: usize) -> Result<()> {
    if output_len < needed {
        return Err(Error::InvalidParameter(format!(
            "{:?}: output buffer of {} bytes, need {}",
            code, output_len, needed
        )));
    }
    Ok(())
}

impl UsbDevice {
    /// Handles one client request and returns its completion
    pub async fn dispatch_ioctl(self: &Arc<Self>, request: IoRequest) -> IoCompletion {
        let guard = match self.acquire() {
            Ok(guard) => guard,
            Err(e) => return IoCompletion::from_error(&e, 0),
        };

        let Some(code) = IoctlCode::from_code(request.code) else {
            warn!("{}: invalid control code {:#010x}", self.name(), request.code);
            let err = Error::InvalidParameter(format!("control code {:#010x}", request.code));
            return IoCompletion::from_error(&err, 0);
        };
        if !self.is_started() {
            return IoCompletion::from_error(&Error::DeviceNotStarted, 0);
        }

        if code.is_direct_transfer() {
            match self.start_transfer(code, request, guard).await {
                Ok(pending) => pending.await.unwrap_or_else(|_| {
                    IoCompletion::from_error(&Error::Channel("transfer completion lost".into()), 0)
                }),
                Err(e) => {
                    debug!("{}: {:?} rejected: {}", self.name(), code, e);
                    IoCompletion::from_error(&e, 0)
                }
            }
        } else {
            let result = self.dispatch_buffered(code, &request).await;
            drop(guard);
            if let Err(e) = &result {
                debug!("{}: {:?} failed: {}", self.name(), code, e);
            }
            IoCompletion::from_result(&result)
        }
    }

    /// Validates a direct transfer and hands it to the transfer engine
    async fn start_transfer(
        self: &Arc<Self>,
        code: IoctlCode,
        request: IoRequest,
        guard: RemoveLockGuard,
    ) -> Result<PendingTransfer> {
        if request.input.len() < REQUEST_HEADER_LEN {
            return Err(Error::InvalidParameter(format!(
                "{:?}: request of {} bytes",
                code,
                request.input.len()
            )));
        }
        let decoded = Request::decode(code, &request.input)?;
        let Params::Endpoint(params) = decoded.params else {
            return Err(Error::InvalidParameter(format!("{:?}: not an endpoint request", code)));
        };

        let length = request.buffer.len();
        if length > self.tunables.max_transfer_length {
            return Err(Error::InvalidParameter(format!(
                "{:?}: {} bytes exceeds the transfer ceiling of {}",
                code, length, self.tunables.max_transfer_length
            )));
        }
        if code.is_read() && length == 0 {
            return Err(Error::InvalidParameter(format!("{:?}: no transfer buffer", code)));
        }

        self.ensure_configured().await?;
        let pipe = self.pipe(params.endpoint)?;

        let expected_type_ok = if code.is_isochronous() {
            pipe.pipe_type == PipeType::Isochronous
        } else {
            pipe.pipe_type.is_bulk_or_interrupt()
        };
        if !expected_type_ok {
            return Err(Error::InvalidParameter(format!(
                "{:?}: incorrect pipe type {:?} for endpoint {:#04x}",
                code, pipe.pipe_type, pipe.address
            )));
        }
        let expected_direction = if code.is_read() { Direction::In } else { Direction::Out };
        if pipe.direction() != expected_direction {
            return Err(Error::InvalidParameter(format!(
                "{:?}: not compatible with endpoint {:#04x}",
                code, pipe.address
            )));
        }

        let max_packet = pipe.max_packet_size as usize;
        if code.is_read() && max_packet > 0 && length % max_packet != 0 {
            if self.tunables.strict_read_length {
                return Err(Error::InvalidParameter(format!(
                    "{:?}: buffer length {} is not a multiple of {} for endpoint {:#04x}",
                    code, length, max_packet, pipe.address
                )));
            }
            warn!(
                "{}: buffer length {} is not a multiple of wMaxPacketSize {} for endpoint {:#04x}",
                self.name(),
                length,
                max_packet,
                pipe.address
            );
        }

        let packet_size = if params.packet_size == 0 {
            max_packet
        } else {
            params.packet_size as usize
        };
        if code.is_isochronous() && (packet_size == 0 || length == 0) {
            return Err(Error::InvalidParameter(format!(
                "{:?}: packet size {} for {} bytes",
                code, packet_size, length
            )));
        }

        let transfer = Transfer {
            max_transfer: max_transfer_size(params.max_transfer_size, pipe.max_transfer_size),
            pipe,
            packet_size,
            flags: params.transfer_flags,
            latency: params.iso_start_frame_latency,
            buffer: request.buffer,
            cancel: request.cancel,
        };
        self.submit_transfer(transfer, guard).await
    }

    async fn dispatch_buffered(&self, code: IoctlCode, request: &IoRequest) -> Result<usize> {
        let input_len = request.input.len();
        if !(REQUEST_HEADER_LEN..=MAX_BUFFERED_LEN).contains(&input_len) {
            return Err(Error::InvalidParameter(format!(
                "{:?}: input buffer of {} bytes",
                code, input_len
            )));
        }
        let output = request.buffer.whole();
        if output.len() > MAX_BUFFERED_LEN {
            return Err(Error::InvalidParameter(format!(
                "{:?}: output buffer of {} bytes",
                code,
                output.len()
            )));
        }

        let decoded = Request::decode(code, &request.input)?;
        let timeout = decoded.timeout;
        let owner = request.owner;
        debug!("{}: {:?} {:?}", self.name(), code, decoded.params);

        match (code, decoded.params) {
            (IoctlCode::SetConfiguration, Params::Configuration { configuration }) => {
                let value = narrow(configuration, "configuration")?;
                self.set_configuration(Some(owner), value, timeout).await?;
                Ok(0)
            }
            (IoctlCode::GetConfiguration, _) => {
                require_output(code, output.len(), 1)?;
                self.get_configuration(&output, timeout).await
            }
            (IoctlCode::GetCachedConfiguration, _) => {
                require_output(code, output.len(), 1)?;
                self.get_cached_configuration(&output)
            }
            (
                IoctlCode::SetInterface,
                Params::Interface {
                    interface,
                    altsetting,
                },
            ) => {
                let interface = narrow(interface, "interface")?;
                let altsetting = narrow(altsetting, "alternate setting")?;
                self.set_interface(Some(owner), interface, altsetting, timeout)
                    .await?;
                Ok(0)
            }
            (IoctlCode::GetInterface, Params::Interface { interface, .. }) => {
                require_output(code, output.len(), 1)?;
                self.get_interface(narrow(interface, "interface")?, &output, timeout)
                    .await
            }
            (IoctlCode::ClaimInterface, Params::Interface { interface, .. }) => {
                self.claim_interface(owner, narrow(interface, "interface")?)?;
                Ok(0)
            }
            (IoctlCode::ReleaseInterface, Params::Interface { interface, .. }) => {
                self.release_interface(owner, narrow(interface, "interface")?)?;
                Ok(0)
            }
            (
                IoctlCode::SetFeature,
                Params::Feature {
                    recipient,
                    feature,
                    index,
                },
            ) => {
                self.set_feature(recipient, feature, index, timeout).await?;
                Ok(0)
            }
            (
                IoctlCode::ClearFeature,
                Params::Feature {
                    recipient,
                    feature,
                    index,
                },
            ) => {
                self.clear_feature(recipient, feature, index, timeout).await?;
                Ok(0)
            }
            (IoctlCode::GetStatus, Params::Status { recipient, index }) => {
                require_output(code, output.len(), 2)?;
                self.get_status(recipient, index, &output, timeout).await
            }
            (IoctlCode::GetDescriptor, Params::Descriptor(p)) => self
                .get_descriptor(
                    narrow(p.descriptor_type, "descriptor type")?,
                    narrow(p.index, "descriptor index")?,
                    narrow(p.language_id, "language id")?,
                    p.recipient,
                    &output,
                    timeout,
                )
                .await,
            (IoctlCode::SetDescriptor, Params::Descriptor(p)) => self
                .set_descriptor(
                    narrow(p.descriptor_type, "descriptor type")?,
                    narrow(p.index, "descriptor index")?,
                    narrow(p.language_id, "language id")?,
                    p.recipient,
                    &decoded.tail,
                    timeout,
                )
                .await
                .map(|_| 0),
            (IoctlCode::VendorRead, Params::Vendor(p)) => {
                self.vendor_class_request(&p, Direction::In, &output, timeout)
                    .await
            }
            (IoctlCode::VendorWrite, Params::Vendor(p)) => {
                let data = common::TransferBuffer::from_vec(decoded.tail.to_vec()).whole();
                self.vendor_class_request(&p, Direction::Out, &data, timeout)
                    .await
            }
            (IoctlCode::ResetEndpoint, Params::Endpoint(p)) => {
                self.reset_endpoint(p.endpoint, timeout).await?;
                Ok(0)
            }
            (IoctlCode::AbortEndpoint, Params::Endpoint(p)) => {
                self.abort_endpoint(p.endpoint, timeout).await?;
                Ok(0)
            }
            (IoctlCode::ResetDevice, _) => {
                self.reset_device(timeout).await?;
                Ok(0)
            }
            (IoctlCode::ResetDeviceEx, Params::ResetDevice { reset_type }) => {
                self.reset_device_ex(reset_type, timeout).await?;
                Ok(0)
            }
            (IoctlCode::SetDebugLevel, Params::Debug { level }) => {
                self.log.set_level(level)?;
                Ok(0)
            }
            (IoctlCode::GetVersion, _) => {
                require_output(code, output.len(), REQUEST_HEADER_LEN)?;
                Ok(output.write(0, &encode_version_reply(&DRIVER_VERSION)))
            }
            (IoctlCode::GetDeviceProperty, Params::DeviceProperty { property }) => {
                self.get_device_property(property, &output)
            }
            (IoctlCode::GetCustomRegProperty, Params::RegistryKey { name_offset, .. }) => {
                let name = decoded.name_at(name_offset)?;
                self.get_custom_property(&name, &output)
            }
            (code, params) => Err(Error::InvalidParameter(format!(
                "{:?}: unexpected parameters {:?}",
                code, params
            ))),
        }
    }
}
