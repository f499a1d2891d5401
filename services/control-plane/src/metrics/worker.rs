//! Metrics aggregator background worker.
//!
//! Each tick pulls the latest samples for every live cluster and deployment.
//! Resources are fetched concurrently and independently: a provider error
//! for one resource marks only that resource stale.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use super::MetricsStore;
use crate::adapter::{Adapter, AdapterError, MetricPoint};
use crate::state::Heartbeat;
use crate::store::{MetricTarget, ResourceStore};

/// Summary of one aggregation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregateStats {
    pub resources: usize,
    pub samples: usize,
    pub failed_resources: usize,
    pub pruned_rings: usize,
}

pub struct MetricsWorker {
    resources: Arc<ResourceStore>,
    metrics: Arc<MetricsStore>,
    adapter: Adapter,
    interval: Duration,
    heartbeat: Arc<Heartbeat>,
}

impl MetricsWorker {
    pub fn new(
        resources: Arc<ResourceStore>,
        metrics: Arc<MetricsStore>,
        adapter: Adapter,
        interval: Duration,
        heartbeat: Arc<Heartbeat>,
    ) -> Self {
        Self {
            resources,
            metrics,
            adapter,
            interval,
            heartbeat,
        }
    }

    /// Run the aggregator until shutdown is signaled.
    #[instrument(skip(self, shutdown), name = "metrics_worker")]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            capacity = self.metrics.capacity(),
            "Starting metrics aggregator"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let stats = self.aggregate_once().await;
                    if stats.failed_resources > 0 {
                        warn!(
                            resources = stats.resources,
                            failed_resources = stats.failed_resources,
                            "Metrics aggregation finished with stale resources"
                        );
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Metrics aggregator shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Run a single aggregation pass.
    pub async fn aggregate_once(&self) -> AggregateStats {
        let targets = self.resources.metric_targets().await;
        let live: HashSet<String> = targets
            .iter()
            .map(|t| t.resource.resource_id.clone())
            .collect();
        let pruned_rings = self.metrics.retain_resources(&live).await;

        let results = join_all(targets.iter().map(|target| self.fetch(target))).await;

        let mut stats = AggregateStats {
            resources: targets.len(),
            pruned_rings,
            ..Default::default()
        };

        for (target, (fetched, failure)) in targets.iter().zip(results) {
            let resource_id = &target.resource.resource_id;
            for (metric, points) in fetched {
                stats.samples += self.metrics.append(resource_id, metric, &points).await;
            }
            match failure {
                None => {
                    if self.metrics.health(resource_id).await.is_stale() {
                        info!(resource = %target.resource, "Metrics fetch recovered");
                    }
                    self.metrics.mark_fresh(resource_id).await;
                }
                Some(err) => {
                    warn!(resource = %target.resource, error = %err, "Metrics fetch failed, data is stale");
                    self.metrics.mark_stale(resource_id, err.to_string()).await;
                    stats.failed_resources += 1;
                }
            }
        }

        self.heartbeat.beat();
        debug!(
            resources = stats.resources,
            samples = stats.samples,
            failed_resources = stats.failed_resources,
            pruned_rings = stats.pruned_rings,
            "Metrics aggregation pass complete"
        );
        stats
    }

    /// Fetch every metric of one resource; returns what succeeded and the last error.
    async fn fetch(
        &self,
        target: &MetricTarget,
    ) -> (Vec<(&'static str, Vec<MetricPoint>)>, Option<AdapterError>) {
        let mut fetched = Vec::with_capacity(target.metrics.len());
        let mut failure = None;

        for metric in target.metrics {
            match self
                .adapter
                .query_metrics(&target.resource.resource_id, metric, self.interval)
                .await
            {
                Ok(points) => fetched.push((*metric, points)),
                Err(err) => failure = Some(err),
            }
        }

        (fetched, failure)
    }
}
