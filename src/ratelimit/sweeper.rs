//! Background task that periodically drops idle attempt state.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Default pause between sweep passes.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Owned handle to a running sweep task.
///
/// The task exits when [`Sweeper::stop`] is called or when the handle is
/// dropped, since dropping closes the shutdown channel.
#[derive(Debug)]
pub struct Sweeper {
    shutdown: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
    interval: Duration,
}

impl Sweeper {
    /// Spawn a task that calls `sweep` every `interval`.
    ///
    /// `sweep` returns how many entries it removed. Must be called from
    /// within a Tokio runtime.
    pub fn spawn<F>(interval: Duration, mut sweep: F) -> Self
    where
        F: FnMut() -> usize + Send + 'static,
    {
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it so the first
            // pass runs one full interval after start.
            ticker.tick().await;

            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let removed = sweep();
                        if removed > 0 {
                            debug!(removed = removed, "Swept idle attempt records");
                        }
                    }
                }
            }

            info!("Sweeper stopped");
        });

        info!(interval = ?interval, "Sweeper started");

        Self {
            shutdown,
            handle: Mutex::new(Some(handle)),
            interval,
        }
    }

    /// The configured pause between passes.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Whether the task is still running.
    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Signal the task to stop and wait for it to exit. Idempotent.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Sweeper task ended abnormally");
            }
        }
    }
}
