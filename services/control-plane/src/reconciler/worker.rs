//! Reconciliation background worker.
//!
//! Runs the reconciliation pass on a periodic interval.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument};

use super::pass::Reconciler;
use crate::state::Heartbeat;

pub struct ReconcileWorker {
    reconciler: Reconciler,
    interval: Duration,
    /// How long finished operations stay queryable.
    retention: Duration,
    heartbeat: Arc<Heartbeat>,
}

impl ReconcileWorker {
    pub fn new(
        reconciler: Reconciler,
        interval: Duration,
        retention: Duration,
        heartbeat: Arc<Heartbeat>,
    ) -> Self {
        Self {
            reconciler,
            interval,
            retention,
            heartbeat,
        }
    }

    /// Run the reconciliation loop until shutdown is signaled.
    #[instrument(skip(self, shutdown), name = "reconcile_worker")]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting reconciliation worker"
        );

        let mut interval = tokio::time::interval(self.interval);
        // A slow pass delays the next one instead of bursting to catch up.
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Don't immediately tick on startup - wait for first interval
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let stats = self.reconciler.reconcile_once().await;
                    self.reconciler.prune_history(self.retention).await;
                    self.heartbeat.beat();
                    debug!(
                        processed = stats.operations_processed,
                        drift_checked = stats.drift_checked,
                        "Reconciliation tick"
                    );
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Reconciliation worker shutting down");
                        break;
                    }
                }
            }
        }
    }
}
