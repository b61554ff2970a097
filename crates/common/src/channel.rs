//! Async channel bridge between the driver and a blocking bus thread
//!
//! Backends that talk to hardware through blocking calls run on a dedicated
//! thread. The driver side hands submissions over without blocking; the
//! thread side pulls them with blocking receives.

use crate::bus::Submission;
use async_channel::{Receiver, Sender, TrySendError, bounded};
use protocol::{NtStatus, UsbdStatus};
use tracing::warn;

/// Commands from the driver to the bus thread
#[derive(Debug)]
pub enum BusCommand {
    /// Execute a URB and complete it
    Submit(Submission),

    /// Shutdown the bus thread gracefully
    Shutdown,
}

/// Handle for the driver side (never blocks)
#[derive(Clone)]
pub struct BusBridge {
    cmd_tx: Sender<BusCommand>,
}

impl BusBridge {
    /// Hands a submission to the bus thread. When the queue is full or the
    /// thread is gone the submission is completed here with a failure.
    pub fn submit(&self, submission: Submission) {
        match self.cmd_tx.try_send(BusCommand::Submit(submission)) {
            Ok(()) => {}
            Err(TrySendError::Full(BusCommand::Submit(s))) => {
                warn!("Bus queue full, failing {}", s.urb.name());
                s.finish(UsbdStatus::ERROR_BUSY, NtStatus::INSUFFICIENT_RESOURCES);
            }
            Err(TrySendError::Closed(BusCommand::Submit(s))) => {
                warn!("Bus thread gone, failing {}", s.urb.name());
                s.finish(UsbdStatus::DEVICE_GONE, NtStatus::DEVICE_NOT_CONNECTED);
            }
            Err(_) => {}
        }
    }

    /// Ask the bus thread to stop
    pub async fn shutdown(&self) -> crate::Result<()> {
        self.cmd_tx
            .send(BusCommand::Shutdown)
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Handle for the bus thread (blocking)
pub struct BusWorker {
    cmd_rx: Receiver<BusCommand>,
}

impl BusWorker {
    /// Receive a command (blocking)
    pub fn recv_command(&self) -> crate::Result<BusCommand> {
        self.cmd_rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Try to receive a command without blocking
    pub fn try_recv_command(&self) -> Option<BusCommand> {
        self.cmd_rx.try_recv().ok()
    }
}

/// Create the channel bridge between the driver and a bus thread
///
/// Returns (BusBridge for the driver, BusWorker for the bus thread)
pub fn create_bus_bridge() -> (BusBridge, BusWorker) {
    let (cmd_tx, cmd_rx) = bounded(256);
    (BusBridge { cmd_tx }, BusWorker { cmd_rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Completion;
    use crate::urb::{Urb, UrbFunction};
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_channel_bridge() {
        let (bridge, worker) = create_bus_bridge();

        // Spawn a thread to simulate the bus worker
        let handle = std::thread::spawn(move || match worker.recv_command().unwrap() {
            BusCommand::Submit(s) => {
                s.finish(UsbdStatus::SUCCESS, NtStatus::SUCCESS);
                true
            }
            BusCommand::Shutdown => false,
        });

        let (completion, rx) = Completion::channel();
        bridge.submit(Submission::new(
            Urb::new(UrbFunction::CyclePort),
            CancellationToken::new(),
            completion,
        ));

        let (_, status) = rx.await.unwrap();
        assert_eq!(status, NtStatus::SUCCESS);
        assert!(handle.join().unwrap());
    }

    #[tokio::test]
    async fn test_closed_bridge_completes_locally() {
        let (bridge, worker) = create_bus_bridge();
        drop(worker);

        let (completion, rx) = Completion::channel();
        bridge.submit(Submission::new(
            Urb::new(UrbFunction::ResetPort),
            CancellationToken::new(),
            completion,
        ));

        let (urb, status) = rx.await.unwrap();
        assert_eq!(status, NtStatus::DEVICE_NOT_CONNECTED);
        assert_eq!(urb.status, UsbdStatus::DEVICE_GONE);
    }
}
