use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

/// How long the listener keeps answering (with 503) after a shutdown signal
/// before the serve loop is told to exit. In-flight pipeline work gets this
/// window to finish.
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Process-wide shutdown coordination.
///
/// The flag is a shared `AtomicBool` read with `SeqCst` ordering at the top
/// of every request handler; once set, all entry points refuse new work.
/// `begin` is idempotent: the first call starts the drain timer, later calls
/// are no-ops.
#[derive(Clone)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
    drained: Arc<AtomicBool>,
    notify: Arc<Notify>,
    drain_grace: Duration,
}

impl Shutdown {
    pub fn new(drain_grace: Duration) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            drained: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
            drain_grace,
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Flips the shutdown flag. Returns true only for the call that actually
    /// initiated shutdown.
    pub fn begin(&self) -> bool {
        if self.flag.swap(true, Ordering::SeqCst) {
            return false;
        }

        log::info!(
            "shutdown initiated, draining for {:?} before exit",
            self.drain_grace
        );
        let drained = self.drained.clone();
        let notify = self.notify.clone();
        let grace = self.drain_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            drained.store(true, Ordering::SeqCst);
            notify.notify_waiters();
        });
        true
    }

    /// Resolves once the drain grace period after `begin` has elapsed. Used
    /// as the server's graceful-shutdown future.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.drained.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new(DEFAULT_DRAIN_GRACE)
    }
}
