//! Background eviction of idle buckets.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use super::clock::Clock;
use super::registry::Registry;
use crate::error::{Result, TurnstileError};

/// Handle to the periodic sweep task.
///
/// The task runs until [`stop`](Sweeper::stop) is called or the handle is
/// dropped.
#[derive(Debug)]
pub struct Sweeper {
    stop_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl Sweeper {
    /// Spawn the sweep task on the current tokio runtime.
    ///
    /// The first sweep happens one `interval` after spawning.
    pub fn spawn(
        registry: Arc<Registry>,
        clock: Arc<dyn Clock>,
        interval: Duration,
        idle_horizon: Duration,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            TurnstileError::Runtime(format!("sweeper requires a tokio runtime: {}", e))
        })?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = runtime.spawn(run(registry, clock, interval, idle_horizon, stop_rx));

        Ok(Self {
            stop_tx,
            task: Some(task),
        })
    }

    /// Signal the task to stop. Idempotent.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Whether the task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |task| task.is_finished())
    }

    /// Stop the task and wait for it to exit.
    pub async fn join(mut self) {
        self.stop();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run(
    registry: Arc<Registry>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    idle_horizon: Duration,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        interval_secs = interval.as_secs(),
        idle_horizon_secs = idle_horizon.as_secs(),
        "Bucket sweeper started"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let evicted = registry.sweep(clock.now(), idle_horizon);
                debug!(
                    evicted = evicted,
                    remaining = registry.len(),
                    "Sweep complete"
                );
            }
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
            }
        }
    }

    info!("Bucket sweeper stopped");
}
