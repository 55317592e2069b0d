//! Periodic checkpoint flushing off the receive path.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::checkpoint::CheckpointStore;
use crate::processor::StateFlusher;

/// Repeating timer driving checkpoint flushes. A failed flush is logged and
/// retried on the next tick; transient persistence failures self-heal
/// without intervention. Cancelable, and guaranteed not to fire once
/// shutdown has completed.
pub struct CheckpointScheduler {
    cancel_token: CancellationToken,
    task: JoinHandle<()>,
}

impl CheckpointScheduler {
    pub(crate) fn start<S: CheckpointStore>(flusher: StateFlusher<S>, period: Duration) -> Self {
        let cancel_token = CancellationToken::new();
        let token = cancel_token.clone();
        let task = tokio::spawn(async move {
            let mut ticker = time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // An interval's first tick completes immediately; the first
            // flush should happen one full period after start.
            ticker.tick().await;
            loop {
                tokio::select! {
                    biased;

                    _ = token.cancelled() => {
                        return;
                    }
                    _ = ticker.tick() => {
                        match flusher.flush().await {
                            Ok(0) => debug!("No dirty partition state to flush"),
                            Ok(count) => debug!(partitions = count, "Flushed partition state"),
                            Err(err) => {
                                error!(?err, "Checkpoint flush failed, retrying on next tick")
                            }
                        }
                    }
                }
            }
        });
        CheckpointScheduler { cancel_token, task }
    }

    /// Stops the timer without waiting for the task to wind down.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Stops the timer and waits until the task has exited, after which no
    /// further flush can fire.
    pub(crate) async fn shutdown(self) {
        self.cancel_token.cancel();
        let _ = self.task.await;
    }
}
