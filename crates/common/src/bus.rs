//! The lower USB stack as seen by the driver
//!
//! A [`UsbBus`] accepts URBs and completes each of them exactly once,
//! from whatever execution context it likes. Completion is a one-shot
//! callback carried inside the [`Submission`]; consuming it is the only way
//! to complete, so a second completion cannot be expressed.

use crate::urb::Urb;
use protocol::NtStatus;
use tokio_util::sync::CancellationToken;

type CompletionFn = Box<dyn FnOnce(Urb, NtStatus) + Send + 'static>;

/// One-shot completion callback
pub struct Completion(CompletionFn);

impl Completion {
    pub fn new(f: impl FnOnce(Urb, NtStatus) + Send + 'static) -> Self {
        Self(Box::new(f))
    }

    /// Completion that forwards the result into a oneshot channel
    pub fn channel() -> (Self, tokio::sync::oneshot::Receiver<(Urb, NtStatus)>) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let completion = Self::new(move |urb, status| {
            let _ = tx.send((urb, status));
        });
        (completion, rx)
    }

    pub fn complete(self, urb: Urb, status: NtStatus) {
        (self.0)(urb, status)
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Completion")
    }
}

/// A URB handed to the bus together with its cancel signal and completion
#[derive(Debug)]
pub struct Submission {
    pub urb: Urb,
    /// Cancelled when the submitter gives up on the request. The bus should
    /// finish the URB promptly with a cancelled status; it still completes it.
    pub cancel: CancellationToken,
    pub completion: Completion,
}

impl Submission {
    pub fn new(urb: Urb, cancel: CancellationToken, completion: Completion) -> Self {
        Self {
            urb,
            cancel,
            completion,
        }
    }

    /// Completes with the submission's own URB and the given statuses
    pub fn finish(mut self, urb_status: protocol::UsbdStatus, status: NtStatus) {
        self.urb.status = urb_status;
        self.completion.complete(self.urb, status)
    }
}

/// The stack below the driver
pub trait UsbBus: Send + Sync + 'static {
    /// Queues a URB. Must not block; the completion may run on any thread,
    /// possibly before this call returns.
    fn submit(&self, submission: Submission);

    /// Short name for logs
    fn name(&self) -> &str {
        "usb-bus"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::urb::UrbFunction;
    use protocol::UsbdStatus;

    #[tokio::test]
    async fn test_channel_completion() {
        let (completion, rx) = Completion::channel();
        let submission = Submission::new(
            Urb::new(UrbFunction::ResetPort),
            CancellationToken::new(),
            completion,
        );
        submission.finish(UsbdStatus::STALL_PID, NtStatus::UNSUCCESSFUL);

        let (urb, status) = rx.await.unwrap();
        assert_eq!(status, NtStatus::UNSUCCESSFUL);
        assert_eq!(urb.status, UsbdStatus::STALL_PID);
    }
}
