//! A single reconciliation pass over in-flight operations and converged resources.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use portal_id::{ClusterId, DeploymentId};
use portal_reconcile::{
    detect_node_drift, detect_replica_drift, replica_convergence, Drift,
};
use tracing::{debug, info, instrument, warn};

use crate::adapter::{
    Adapter, AdapterError, AdapterResult, ClusterPhase, ClusterRequest, ObservedCluster,
    ObservedWorkload, WorkloadPhase, WorkloadSpec,
};
use crate::model::{
    Cluster, ClusterStatus, Deployment, DeploymentStatus, Operation, OperationError,
    OperationErrorKind, OperationKind, OperationStatus, ResourceRef, ResourceSnapshot,
    ResourceType,
};
use crate::operations::{OperationTracker, TrackerResult};
use crate::store::ResourceStore;

/// Counters for one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub operations_processed: usize,
    /// Operations waiting out a backoff.
    pub operations_deferred: usize,
    pub resubmitted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub retrying: usize,
    /// Operations whose resource moved to a newer generation mid-pass.
    pub stale: usize,
    pub drift_checked: usize,
    pub drifted: usize,
    pub recovered: usize,
}

/// What happened to one operation during a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Progress,
    Succeeded,
    Failed,
    Retrying,
    Stale,
}

/// Drift of a cluster against what the provider reports.
fn cluster_drift(cluster: &Cluster, observed: &ObservedCluster) -> Option<Drift> {
    match observed.phase {
        ClusterPhase::Ready => detect_node_drift(cluster.node_count, observed.node_count),
        phase => Some(Drift::new("phase", "Ready", format!("{phase:?}"))),
    }
}

/// Drift of a deployment against what the provider reports.
fn workload_drift(deployment: &Deployment, observed: &ObservedWorkload) -> Option<Drift> {
    match observed.phase {
        WorkloadPhase::Failed => Some(Drift::new("phase", "Available", "Failed")),
        _ => detect_replica_drift(deployment.replicas, observed.ready_replicas),
    }
}

fn missing(op: &Operation) -> AdapterError {
    AdapterError::NotFound(format!("{} is no longer tracked", op.target))
}

fn cluster_id(op: &Operation) -> AdapterResult<ClusterId> {
    ClusterId::parse(&op.target.resource_id).map_err(|_| missing(op))
}

fn deployment_id(op: &Operation) -> AdapterResult<DeploymentId> {
    DeploymentId::parse(&op.target.resource_id).map_err(|_| missing(op))
}

/// Drives operations and steady-state drift against the provider.
pub struct Reconciler {
    resources: Arc<ResourceStore>,
    tracker: Arc<OperationTracker>,
    adapter: Adapter,
}

impl Reconciler {
    pub fn new(
        resources: Arc<ResourceStore>,
        tracker: Arc<OperationTracker>,
        adapter: Adapter,
    ) -> Self {
        Self {
            resources,
            tracker,
            adapter,
        }
    }

    /// Forget terminal operations older than `retention`, then the tombstones
    /// no remaining operation refers to. Returns `(operations, tombstones)`.
    pub async fn prune_history(&self, retention: Duration) -> (usize, usize) {
        let operations = self.tracker.prune_finished(retention).await;
        let referenced = self.tracker.referenced_resources().await;
        let tombstones = self.resources.prune_tombstones(&referenced).await;
        if operations > 0 || tombstones > 0 {
            info!(operations, tombstones, "Pruned finished history");
        }
        (operations, tombstones)
    }

    /// Run one pass: advance every due operation, then check for drift.
    #[instrument(skip(self))]
    pub async fn reconcile_once(&self) -> ReconcileStats {
        let mut stats = ReconcileStats::default();
        let now = Utc::now();

        for op in self.tracker.in_flight().await {
            if op.next_attempt_at.is_some_and(|at| at > now) {
                stats.operations_deferred += 1;
                continue;
            }

            stats.operations_processed += 1;
            let resubmitting = !op.submitted;
            match self.advance(op).await {
                Step::Progress if resubmitting => stats.resubmitted += 1,
                Step::Progress => {}
                Step::Succeeded => stats.succeeded += 1,
                Step::Failed => stats.failed += 1,
                Step::Retrying => stats.retrying += 1,
                Step::Stale => stats.stale += 1,
            }
        }

        self.check_cluster_drift(&mut stats).await;
        self.check_deployment_drift(&mut stats).await;

        if stats.operations_processed > 0 || stats.drifted > 0 || stats.recovered > 0 {
            info!(
                processed = stats.operations_processed,
                deferred = stats.operations_deferred,
                succeeded = stats.succeeded,
                failed = stats.failed,
                retrying = stats.retrying,
                drifted = stats.drifted,
                recovered = stats.recovered,
                "Reconciliation pass complete"
            );
        }

        stats
    }

    async fn advance(&self, op: Operation) -> Step {
        let op = match self.tracker.start(op.id).await {
            Ok(op) => op,
            Err(e) => {
                // Superseded or finished since the snapshot was taken.
                debug!(operation_id = %op.id, error = %e, "Operation no longer in flight");
                return Step::Stale;
            }
        };

        if !op.submitted {
            return self.submit(&op).await;
        }

        match op.target.resource_type {
            ResourceType::Cluster => self.poll_cluster(&op).await,
            ResourceType::Deployment => self.poll_deployment(&op).await,
        }
    }

    // =========================================================================
    // Submission
    // =========================================================================

    async fn submit(&self, op: &Operation) -> Step {
        let result = match op.target.resource_type {
            ResourceType::Cluster => self.submit_cluster(op).await,
            ResourceType::Deployment => self.submit_deployment(op).await,
        };

        match result {
            Ok(()) => match self.tracker.mark_submitted(op.id).await {
                Ok(_) => {
                    info!(
                        operation_id = %op.id,
                        target = %op.target,
                        attempts = op.attempts,
                        "Operation resubmitted to provider"
                    );
                    Step::Progress
                }
                Err(_) => Step::Stale,
            },
            Err(err) => self.handle_error(op, &err).await,
        }
    }

    async fn submit_cluster(&self, op: &Operation) -> AdapterResult<()> {
        let id = cluster_id(op)?;
        if op.kind == OperationKind::Delete {
            return match self.adapter.delete_cluster(id).await {
                Err(err) if err.is_not_found() => Ok(()),
                other => other,
            };
        }

        let cluster = self.resources.cluster(id).await.ok_or_else(|| missing(op))?;
        self.adapter
            .create_cluster(&ClusterRequest::from(&cluster))
            .await
    }

    async fn submit_deployment(&self, op: &Operation) -> AdapterResult<()> {
        let id = deployment_id(op)?;
        let deployment = self
            .resources
            .deployment(id)
            .await
            .ok_or_else(|| missing(op))?;

        if op.kind == OperationKind::Delete {
            return match self.adapter.delete_workload(deployment.cluster_id, id).await {
                Err(err) if err.is_not_found() => Ok(()),
                other => other,
            };
        }

        let template = self
            .resources
            .template(deployment.template_id)
            .await
            .ok_or_else(|| missing(op))?;
        self.adapter
            .apply_workload(&WorkloadSpec::resolve(&deployment, &template))
            .await
    }

    // =========================================================================
    // Status Polling
    // =========================================================================

    async fn poll_cluster(&self, op: &Operation) -> Step {
        let id = match cluster_id(op) {
            Ok(id) => id,
            Err(err) => return self.handle_error(op, &err).await,
        };

        let observed = match self.adapter.get_cluster_status(id).await {
            Ok(observed) => observed,
            Err(err) if err.is_not_found() && op.kind == OperationKind::Delete => {
                return self.cluster_deleted(op, id).await;
            }
            Err(err) => return self.handle_error(op, &err).await,
        };

        if op.kind == OperationKind::Delete {
            return match observed.phase {
                ClusterPhase::Deleted => self.cluster_deleted(op, id).await,
                ClusterPhase::Error => {
                    let message = observed
                        .message
                        .unwrap_or_else(|| "provider reported Error during delete".to_string());
                    self.restore_prior(op).await;
                    self.fail_observed(op, message).await
                }
                _ => Step::Progress,
            };
        }

        match observed.phase {
            ClusterPhase::Provisioning | ClusterPhase::Deleting => Step::Progress,
            ClusterPhase::Ready | ClusterPhase::Degraded => {
                let written = self
                    .write_cluster(op, id, |c| {
                        c.drift = cluster_drift(c, &observed);
                        c.status = if c.drift.is_none() {
                            ClusterStatus::Ready
                        } else {
                            ClusterStatus::Degraded
                        };
                        c.observed_node_count = Some(observed.node_count);
                    })
                    .await;
                if !written {
                    return Step::Stale;
                }
                self.complete(op).await
            }
            ClusterPhase::Error | ClusterPhase::Deleted => {
                let message = observed
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("provider reported {:?}", observed.phase));
                let written = self
                    .write_cluster(op, id, |c| {
                        c.status = ClusterStatus::Error;
                        c.observed_node_count = Some(observed.node_count);
                    })
                    .await;
                if !written {
                    return Step::Stale;
                }
                self.fail_observed(op, message).await
            }
        }
    }

    async fn cluster_deleted(&self, op: &Operation, id: ClusterId) -> Step {
        let written = self
            .write_cluster(op, id, |c| {
                c.status = ClusterStatus::Deleted;
                c.observed_node_count = None;
                c.drift = None;
            })
            .await;
        if !written {
            return Step::Stale;
        }
        self.complete(op).await
    }

    async fn poll_deployment(&self, op: &Operation) -> Step {
        let deployment = match deployment_id(op) {
            Ok(id) => self.resources.deployment(id).await,
            Err(_) => None,
        };
        let Some(deployment) = deployment else {
            return self.handle_error(op, &missing(op)).await;
        };

        let observed = match self
            .adapter
            .get_workload_status(deployment.cluster_id, deployment.id)
            .await
        {
            Ok(observed) => observed,
            Err(err) if err.is_not_found() && op.kind == OperationKind::Delete => {
                return self.deployment_deleted(op, deployment.id).await;
            }
            Err(err) => return self.handle_error(op, &err).await,
        };

        if op.kind == OperationKind::Delete {
            // The provider still reports the workload; keep waiting.
            return Step::Progress;
        }

        if observed.phase == WorkloadPhase::Failed {
            let written = self
                .write_deployment(op, deployment.id, |d| {
                    d.status = DeploymentStatus::Failed;
                    d.ready_replicas = observed.ready_replicas;
                })
                .await;
            if !written {
                return Step::Stale;
            }
            let message = observed
                .message
                .unwrap_or_else(|| "provider reported workload Failed".to_string());
            return self.fail_observed(op, message).await;
        }

        let convergence = replica_convergence(
            deployment.replicas,
            observed.ready_replicas,
            observed.phase == WorkloadPhase::Progressing,
        );
        let converged = convergence.is_converged();

        let written = self
            .write_deployment(op, deployment.id, |d| {
                d.ready_replicas = observed.ready_replicas;
                if converged {
                    d.status = DeploymentStatus::Running;
                    d.drift = None;
                } else {
                    d.status = DeploymentStatus::RollingOut;
                }
            })
            .await;
        if !written {
            return Step::Stale;
        }

        if converged {
            return self.complete(op).await;
        }
        if convergence.is_converging() {
            debug!(
                operation_id = %op.id,
                desired = deployment.replicas,
                ready = observed.ready_replicas,
                "Workload still converging"
            );
            return Step::Progress;
        }

        // Settled short of the target: each such poll spends an attempt.
        let message = format!(
            "workload settled with {} of {} replicas ready",
            observed.ready_replicas, deployment.replicas
        );
        let outcome = self.tracker.record_divergence(op.id, message).await;
        self.after_attempt(op, outcome).await
    }

    async fn deployment_deleted(&self, op: &Operation, id: DeploymentId) -> Step {
        let written = self
            .write_deployment(op, id, |d| {
                d.status = DeploymentStatus::Deleted;
                d.ready_replicas = 0;
                d.drift = None;
            })
            .await;
        if !written {
            return Step::Stale;
        }
        self.complete(op).await
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    async fn write_cluster<F>(&self, op: &Operation, id: ClusterId, f: F) -> bool
    where
        F: FnOnce(&mut Cluster),
    {
        let written = self.resources.update_cluster_if(id, op.generation, f).await;
        if !written {
            debug!(operation_id = %op.id, cluster_id = %id, "Cluster generation moved on, deferring");
        }
        written
    }

    async fn write_deployment<F>(&self, op: &Operation, id: DeploymentId, f: F) -> bool
    where
        F: FnOnce(&mut Deployment),
    {
        let written = self
            .resources
            .update_deployment_if(id, op.generation, f)
            .await;
        if !written {
            debug!(operation_id = %op.id, deployment_id = %id, "Deployment generation moved on, deferring");
        }
        written
    }

    async fn complete(&self, op: &Operation) -> Step {
        match self.tracker.succeed(op.id).await {
            Ok(_) => Step::Succeeded,
            Err(_) => Step::Stale,
        }
    }

    /// Fail an operation because the provider observed a failure.
    async fn fail_observed(&self, op: &Operation, message: String) -> Step {
        match self
            .tracker
            .fail(op.id, OperationError::new(OperationErrorKind::Provider, message))
            .await
        {
            Ok(_) => Step::Failed,
            Err(_) => Step::Stale,
        }
    }

    async fn handle_error(&self, op: &Operation, err: &AdapterError) -> Step {
        let outcome = self.tracker.record_failure(op.id, err).await;
        self.after_attempt(op, outcome).await
    }

    /// Map a spent attempt onto a step, restoring the target once it fails.
    async fn after_attempt(&self, op: &Operation, outcome: TrackerResult<Operation>) -> Step {
        match outcome {
            Ok(updated) if updated.status == OperationStatus::Failed => {
                self.restore_prior(op).await;
                Step::Failed
            }
            Ok(_) => Step::Retrying,
            Err(_) => Step::Stale,
        }
    }

    /// Put the target back to its pre-operation state.
    async fn restore_prior(&self, op: &Operation) {
        match &op.prior {
            Some(ResourceSnapshot::Cluster { status }) => {
                let status = *status;
                if let Ok(id) = cluster_id(op) {
                    self.write_cluster(op, id, |c| c.status = status).await;
                }
            }
            Some(ResourceSnapshot::Deployment {
                status,
                replicas,
                param_overrides,
            }) => {
                if let Ok(id) = deployment_id(op) {
                    let (status, replicas) = (*status, *replicas);
                    let param_overrides = param_overrides.clone();
                    self.write_deployment(op, id, |d| {
                        d.status = status;
                        d.replicas = replicas;
                        d.param_overrides = param_overrides;
                    })
                    .await;
                }
            }
            None => return,
        }
        info!(operation_id = %op.id, target = %op.target, "Restored pre-operation state");
    }

    // =========================================================================
    // Drift Detection
    // =========================================================================

    async fn check_cluster_drift(&self, stats: &mut ReconcileStats) {
        for cluster in self.resources.list_clusters().await {
            if !matches!(cluster.status, ClusterStatus::Ready | ClusterStatus::Degraded) {
                continue;
            }
            if self
                .tracker
                .active_for(&ResourceRef::cluster(cluster.id))
                .await
                .is_some()
            {
                continue;
            }

            stats.drift_checked += 1;
            let observed = match self.adapter.get_cluster_status(cluster.id).await {
                Ok(observed) => observed,
                Err(e) => {
                    debug!(cluster_id = %cluster.id, error = %e, "Drift check skipped");
                    continue;
                }
            };

            let drift = cluster_drift(&cluster, &observed);
            let status = if drift.is_some() {
                ClusterStatus::Degraded
            } else {
                ClusterStatus::Ready
            };
            if status == cluster.status
                && drift == cluster.drift
                && cluster.observed_node_count == Some(observed.node_count)
            {
                continue;
            }

            let reported = drift.clone();
            let written = self
                .resources
                .update_cluster_if(cluster.id, cluster.generation, |c| {
                    c.status = status;
                    c.drift = drift;
                    c.observed_node_count = Some(observed.node_count);
                })
                .await;
            if !written {
                continue;
            }

            match (cluster.status, status) {
                (ClusterStatus::Ready, ClusterStatus::Degraded) => {
                    stats.drifted += 1;
                    if let Some(drift) = &reported {
                        warn!(cluster_id = %cluster.id, drift = %drift, "Cluster drifted");
                    }
                }
                (ClusterStatus::Degraded, ClusterStatus::Ready) => {
                    stats.recovered += 1;
                    info!(cluster_id = %cluster.id, "Cluster recovered from drift");
                }
                _ => {}
            }
        }
    }

    async fn check_deployment_drift(&self, stats: &mut ReconcileStats) {
        for deployment in self.resources.list_deployments(None).await {
            if !matches!(
                deployment.status,
                DeploymentStatus::Running | DeploymentStatus::Degraded
            ) {
                continue;
            }
            if self
                .tracker
                .active_for(&ResourceRef::deployment(deployment.id))
                .await
                .is_some()
            {
                continue;
            }

            stats.drift_checked += 1;
            let observed = match self
                .adapter
                .get_workload_status(deployment.cluster_id, deployment.id)
                .await
            {
                Ok(observed) => observed,
                Err(e) => {
                    debug!(deployment_id = %deployment.id, error = %e, "Drift check skipped");
                    continue;
                }
            };

            let drift = workload_drift(&deployment, &observed);
            let status = if drift.is_some() {
                DeploymentStatus::Degraded
            } else {
                DeploymentStatus::Running
            };
            if status == deployment.status
                && drift == deployment.drift
                && deployment.ready_replicas == observed.ready_replicas
            {
                continue;
            }

            let reported = drift.clone();
            let written = self
                .resources
                .update_deployment_if(deployment.id, deployment.generation, |d| {
                    d.status = status;
                    d.drift = drift;
                    d.ready_replicas = observed.ready_replicas;
                })
                .await;
            if !written {
                continue;
            }

            match (deployment.status, status) {
                (DeploymentStatus::Running, DeploymentStatus::Degraded) => {
                    stats.drifted += 1;
                    if let Some(drift) = &reported {
                        warn!(deployment_id = %deployment.id, drift = %drift, "Deployment drifted");
                    }
                }
                (DeploymentStatus::Degraded, DeploymentStatus::Running) => {
                    stats.recovered += 1;
                    info!(deployment_id = %deployment.id, "Deployment recovered from drift");
                }
                _ => {}
            }
        }
    }
}
