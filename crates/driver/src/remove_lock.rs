//! Remove lock
//!
//! Counts the operations running against a device so teardown can wait for
//! them. The count starts at one, the device's own reference. Once removal
//! is pending new acquisitions fail, and the teardown waiter wakes when the
//! count reaches zero.

use common::{Error, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use tokio::sync::watch;
use tracing::{debug, error};

pub struct RemoveLock {
    usage: AtomicI64,
    removal_pending: AtomicBool,
    self_released: AtomicBool,
    drained: watch::Sender<bool>,
}

impl RemoveLock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            usage: AtomicI64::new(1),
            removal_pending: AtomicBool::new(false),
            self_released: AtomicBool::new(false),
            drained: watch::Sender::new(false),
        })
    }

    /// Enters the lock. Fails with `DeletePending` once removal has begun.
    pub fn acquire(self: &Arc<Self>) -> Result<RemoveLockGuard> {
        self.usage.fetch_add(1, Ordering::SeqCst);
        if self.removal_pending.load(Ordering::SeqCst) {
            self.release();
            return Err(Error::DeletePending);
        }
        Ok(RemoveLockGuard { lock: self.clone() })
    }

    fn release(&self) {
        let previous = self.usage.fetch_sub(1, Ordering::SeqCst);
        if previous <= 0 {
            error!("Remove lock released below zero ({})", previous - 1);
            debug_assert!(previous > 0, "remove lock count went negative");
        }
        if previous == 1 {
            debug!("Remove lock drained");
            self.drained.send_replace(true);
        }
    }

    /// Marks removal pending, drops the caller's hold and the device's own
    /// reference, then waits for every other holder to leave.
    pub async fn release_and_wait(&self, guard: RemoveLockGuard) {
        self.removal_pending.store(true, Ordering::SeqCst);
        drop(guard);
        if !self.self_released.swap(true, Ordering::SeqCst) {
            self.release();
        }

        let mut drained = self.drained.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = drained.wait_for(|done| *done).await;
    }

    pub fn usage(&self) -> i64 {
        self.usage.load(Ordering::SeqCst)
    }

    pub fn is_removal_pending(&self) -> bool {
        self.removal_pending.load(Ordering::SeqCst)
    }

    pub fn is_drained(&self) -> bool {
        *self.drained.borrow()
    }
}

/// A hold on the remove lock, released on drop
pub struct RemoveLockGuard {
    lock: Arc<RemoveLock>,
}

impl RemoveLockGuard {
    pub fn lock(&self) -> &Arc<RemoveLock> {
        &self.lock
    }
}

impl Drop for RemoveLockGuard {
    fn drop(&mut self) {
        self.lock.release();
    }
}

impl std::fmt::Debug for RemoveLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoveLockGuard")
            .field("usage", &self.lock.usage())
            .finish()
    }
}
