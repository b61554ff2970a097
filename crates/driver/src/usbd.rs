//! Synchronous URB submission with timeout
//!
//! The caller waits for the URB to complete. If the timeout fires first the
//! URB is cancelled and the caller still waits for its completion before
//! returning, so a cancelled URB never outlives the call that issued it.

use crate::device::UsbDevice;
use common::{Completion, Error, Result, Submission, Urb};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Resolves the effective wait for a request.
///
/// With a clamp, zero or anything above the clamp becomes the clamp.
/// Without one, zero means wait indefinitely.
pub fn effective_timeout(timeout_ms: u32, clamp_ms: Option<u32>) -> Option<Duration> {
    match clamp_ms {
        Some(max) if timeout_ms == 0 || timeout_ms > max => {
            Some(Duration::from_millis(max as u64))
        }
        Some(_) => Some(Duration::from_millis(timeout_ms as u64)),
        None if timeout_ms == 0 => None,
        None => Some(Duration::from_millis(timeout_ms as u64)),
    }
}

impl UsbDevice {
    /// Submits a URB and waits for it, clamping the timeout to the
    /// configured maximum
    pub async fn call_usbd(&self, urb: Urb, timeout_ms: u32) -> Result<Urb> {
        self.call_usbd_ex(urb, timeout_ms, Some(self.tunables.max_control_timeout_ms))
            .await
    }

    /// Submits a URB and waits for it. `clamp_ms = None` leaves the timeout
    /// unclamped.
    pub async fn call_usbd_ex(&self, urb: Urb, timeout_ms: u32, clamp_ms: Option<u32>) -> Result<Urb> {
        let name = urb.name();
        let limit = effective_timeout(timeout_ms, clamp_ms);
        debug!("{}: {} (timeout {:?})", self.name(), name, limit);

        let cancel = CancellationToken::new();
        let (completion, mut rx) = Completion::channel();
        self.target()
            .submit(Submission::new(urb, cancel.clone(), completion));

        let completed = match limit {
            Some(limit) => match tokio::time::timeout(limit, &mut rx).await {
                Ok(completed) => completed,
                Err(_) => {
                    warn!("{}: {} timed out after {:?}, cancelling", self.name(), name, limit);
                    cancel.cancel();
                    let _ = rx.await;
                    return Err(Error::Timeout);
                }
            },
            None => rx.await,
        };

        let (urb, status) =
            completed.map_err(|_| Error::Channel(format!("{} completion dropped", name)))?;
        self.touch();

        match Error::from_completion(status, urb.status) {
            None => Ok(urb),
            Some(err) => {
                debug!(
                    "{}: {} failed: status {}, urb status {}",
                    self.name(),
                    name,
                    status,
                    urb.status
                );
                Err(err)
            }
        }
    }
}
