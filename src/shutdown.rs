//! Signal-driven cooperative shutdown.
//!
//! Two externally delivered signals reach a worker: *terminate* (`SIGTERM`)
//! and *reload* (`SIGHUP`). Signal context does the minimum: set an atomic
//! flag and wake the run loop's wait. The loop observes the flag before each
//! wait and between drained messages, bounding shutdown latency to one
//! message-processing step rather than one full wait timeout.
//!
//! *reload* currently only logs and wakes the wait — a placeholder until
//! configuration reload exists.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info};

/// Clonable handle over the shared terminate flag and wait waker.
///
/// Cancellation is cooperative and checked at message granularity, not
/// preemptive: a slow apply call can delay shutdown arbitrarily.
#[derive(Clone, Default)]
pub struct ShutdownController {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    terminate: AtomicBool,
    wake: Notify,
}

impl ShutdownController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request termination: set the flag and wake any blocked wait.
    pub fn terminate(&self) {
        self.inner.terminate.store(true, Ordering::SeqCst);
        self.inner.wake.notify_one();
    }

    /// Handle a reload request.
    ///
    /// Only logs and wakes the wait; configuration reload has no live
    /// effect yet.
    pub fn reload(&self) {
        info!("got reload signal");
        self.inner.wake.notify_one();
    }

    /// Whether termination was requested.
    pub fn is_terminated(&self) -> bool {
        self.inner.terminate.load(Ordering::SeqCst)
    }

    /// Wake the run loop without changing any flag.
    pub fn wake(&self) {
        self.inner.wake.notify_one();
    }

    /// Wait until some signal wakes the loop.
    pub async fn wait_wake(&self) {
        self.inner.wake.notified().await;
    }

    /// Wire `SIGTERM` to terminate and `SIGHUP` to reload.
    ///
    /// Spawns one listener task per signal; the tasks live for the process
    /// lifetime.
    #[cfg(unix)]
    pub fn install_signal_handlers(&self) -> std::io::Result<()> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let controller = self.clone();
        tokio::spawn(async move {
            if sigterm.recv().await.is_some() {
                debug!("got terminate signal");
                controller.terminate();
            }
        });

        let mut sighup = signal(SignalKind::hangup())?;
        let controller = self.clone();
        tokio::spawn(async move {
            while sighup.recv().await.is_some() {
                controller.reload();
            }
        });

        Ok(())
    }
}
