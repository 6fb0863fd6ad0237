//! Timer-driven checkpoint task.

use super::engine::CheckpointEngine;
use crate::shutdown::ShutdownCoordinator;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Handle to the background checkpoint loop.
pub struct CheckpointScheduler {
    handle: JoinHandle<()>,
    shutdown: ShutdownCoordinator,
}

impl CheckpointScheduler {
    /// Spawns a task that runs the engine every `period` until `shutdown`
    /// fires. The first run happens one full period after spawning.
    pub fn spawn(
        engine: Arc<CheckpointEngine>,
        period: Duration,
        shutdown: ShutdownCoordinator,
    ) -> Self {
        let signal = shutdown.clone();
        let handle = tokio::spawn(async move {
            info!(period = ?period, "Checkpoint scheduler started");
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match engine.run_once().await {
                            Ok(Some(checkpoint)) => {
                                debug!(checkpoint_id = %checkpoint.checkpoint_id, "Scheduled checkpoint complete");
                            }
                            Ok(None) => {}
                            Err(e) => {
                                // Pending leaves are kept; the next tick retries.
                                error!(error = %e, "Scheduled checkpoint failed");
                            }
                        }
                    }
                    _ = signal.wait_for_shutdown() => {
                        info!("Checkpoint scheduler shutting down");
                        break;
                    }
                }
            }
        });

        Self { handle, shutdown }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signals the loop to stop and waits for it, up to the coordinator's
    /// timeout. A run in progress is allowed to finish.
    pub async fn shutdown(mut self) {
        self.shutdown.shutdown();
        match tokio::time::timeout(self.shutdown.timeout(), &mut self.handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Checkpoint scheduler task failed"),
            Err(_) => {
                warn!("Checkpoint scheduler did not stop in time, aborting");
                self.handle.abort();
            }
        }
    }
}
