//! In-process provider used in dev mode and tests.
//!
//! Clusters report `Provisioning` for a configurable number of status polls
//! before turning `Ready`; workloads behave the same way on their way to
//! `Available`. Faults and latency can be injected per call.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use portal_id::{ClusterId, DeploymentId};

use super::{
    AdapterError, AdapterResult, ClusterOps, ClusterPhase, ClusterRequest, MetricPoint,
    MetricsOps, ObservedCluster, ObservedWorkload, WorkloadOps, WorkloadPhase, WorkloadSpec,
};

/// Call names used for fault injection, counters, and timeout reporting.
pub mod calls {
    pub const CREATE_CLUSTER: &str = "create_cluster";
    pub const GET_CLUSTER_STATUS: &str = "get_cluster_status";
    pub const DELETE_CLUSTER: &str = "delete_cluster";
    pub const APPLY_WORKLOAD: &str = "apply_workload";
    pub const GET_WORKLOAD_STATUS: &str = "get_workload_status";
    pub const DELETE_WORKLOAD: &str = "delete_workload";
    pub const QUERY_METRICS: &str = "query_metrics";
}

#[derive(Debug)]
struct SimCluster {
    node_count: u32,
    polls_remaining: u32,
    phase_override: Option<ClusterPhase>,
    observed_nodes_override: Option<u32>,
}

#[derive(Debug)]
struct SimWorkload {
    cluster_id: ClusterId,
    replicas: u32,
    polls_remaining: u32,
    phase_override: Option<WorkloadPhase>,
    ready_override: Option<u32>,
}

#[derive(Debug, Default)]
struct SimState {
    clusters: HashMap<ClusterId, SimCluster>,
    workloads: HashMap<DeploymentId, SimWorkload>,
    faults: HashMap<&'static str, VecDeque<AdapterError>>,
    metric_faults: HashMap<String, AdapterError>,
    calls: HashMap<&'static str, u32>,
    latency: Option<Duration>,
    metric_seq: u64,
}

/// Simulated cluster-management API.
#[derive(Debug)]
pub struct SimulatedClient {
    polls_to_ready: u32,
    state: Mutex<SimState>,
}

impl Default for SimulatedClient {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedClient {
    /// Resources converge after a single status poll.
    pub fn new() -> Self {
        Self::with_polls_to_ready(1)
    }

    pub fn with_polls_to_ready(polls: u32) -> Self {
        Self {
            polls_to_ready: polls,
            state: Mutex::new(SimState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        // A panic while holding the lock leaves plain data behind; keep serving.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fail the next `count` invocations of `call` with `error`.
    pub fn fail_next(&self, call: &'static str, count: usize, error: AdapterError) {
        let mut state = self.lock();
        let queue = state.faults.entry(call).or_default();
        queue.extend(std::iter::repeat_n(error, count));
    }

    /// Fail every metrics query for `resource_id` until cleared.
    pub fn fail_metrics_for(&self, resource_id: &str, error: Option<AdapterError>) {
        let mut state = self.lock();
        match error {
            Some(error) => {
                state.metric_faults.insert(resource_id.to_string(), error);
            }
            None => {
                state.metric_faults.remove(resource_id);
            }
        }
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = Some(latency);
    }

    /// Number of times `call` has been invoked.
    pub fn call_count(&self, call: &'static str) -> u32 {
        self.lock().calls.get(call).copied().unwrap_or(0)
    }

    /// Pin the reported phase of a cluster.
    pub fn set_cluster_phase(&self, id: ClusterId, phase: ClusterPhase) {
        if let Some(cluster) = self.lock().clusters.get_mut(&id) {
            cluster.phase_override = Some(phase);
        }
    }

    /// Pin the node count reported for a cluster.
    pub fn set_observed_nodes(&self, id: ClusterId, nodes: Option<u32>) {
        if let Some(cluster) = self.lock().clusters.get_mut(&id) {
            cluster.observed_nodes_override = nodes;
        }
    }

    /// Pin the reported phase of a workload.
    pub fn set_workload_phase(&self, id: DeploymentId, phase: Option<WorkloadPhase>) {
        if let Some(workload) = self.lock().workloads.get_mut(&id) {
            workload.phase_override = phase;
        }
    }

    /// Pin the ready replica count reported for a workload.
    pub fn set_ready_replicas(&self, id: DeploymentId, ready: Option<u32>) {
        if let Some(workload) = self.lock().workloads.get_mut(&id) {
            workload.ready_override = ready;
        }
    }

    pub fn has_cluster(&self, id: ClusterId) -> bool {
        self.lock().clusters.contains_key(&id)
    }

    pub fn has_workload(&self, id: DeploymentId) -> bool {
        self.lock().workloads.contains_key(&id)
    }

    /// Record the call, then surface any injected fault and the configured latency.
    async fn enter(&self, call: &'static str) -> AdapterResult<()> {
        let (latency, fault) = {
            let mut state = self.lock();
            *state.calls.entry(call).or_insert(0) += 1;
            let fault = state.faults.get_mut(call).and_then(VecDeque::pop_front);
            (state.latency, fault)
        };

        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        match fault {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ClusterOps for SimulatedClient {
    async fn create_cluster(&self, request: &ClusterRequest) -> AdapterResult<()> {
        self.enter(calls::CREATE_CLUSTER).await?;
        let polls = self.polls_to_ready;
        self.lock()
            .clusters
            .entry(request.id)
            .or_insert_with(|| SimCluster {
                node_count: request.node_count,
                polls_remaining: polls,
                phase_override: None,
                observed_nodes_override: None,
            });
        Ok(())
    }

    async fn get_cluster_status(&self, id: ClusterId) -> AdapterResult<ObservedCluster> {
        self.enter(calls::GET_CLUSTER_STATUS).await?;
        let mut state = self.lock();
        let cluster = state
            .clusters
            .get_mut(&id)
            .ok_or_else(|| AdapterError::NotFound(format!("cluster {id}")))?;

        let phase = if let Some(phase) = cluster.phase_override {
            phase
        } else if cluster.polls_remaining > 0 {
            cluster.polls_remaining -= 1;
            ClusterPhase::Provisioning
        } else {
            ClusterPhase::Ready
        };

        Ok(ObservedCluster {
            phase,
            node_count: cluster
                .observed_nodes_override
                .unwrap_or(cluster.node_count),
            message: None,
        })
    }

    async fn delete_cluster(&self, id: ClusterId) -> AdapterResult<()> {
        self.enter(calls::DELETE_CLUSTER).await?;
        let mut state = self.lock();
        state
            .clusters
            .remove(&id)
            .ok_or_else(|| AdapterError::NotFound(format!("cluster {id}")))?;
        state.workloads.retain(|_, w| w.cluster_id != id);
        Ok(())
    }
}

#[async_trait]
impl WorkloadOps for SimulatedClient {
    async fn apply_workload(&self, spec: &WorkloadSpec) -> AdapterResult<()> {
        self.enter(calls::APPLY_WORKLOAD).await?;
        let polls = self.polls_to_ready;
        let mut state = self.lock();
        if !state.clusters.contains_key(&spec.cluster_id) {
            return Err(AdapterError::NotFound(format!("cluster {}", spec.cluster_id)));
        }

        let workload = state
            .workloads
            .entry(spec.deployment_id)
            .or_insert_with(|| SimWorkload {
                cluster_id: spec.cluster_id,
                replicas: spec.replicas,
                polls_remaining: polls,
                phase_override: None,
                ready_override: None,
            });
        workload.replicas = spec.replicas;
        workload.polls_remaining = polls;
        Ok(())
    }

    async fn get_workload_status(
        &self,
        _cluster_id: ClusterId,
        deployment_id: DeploymentId,
    ) -> AdapterResult<ObservedWorkload> {
        self.enter(calls::GET_WORKLOAD_STATUS).await?;
        let mut state = self.lock();
        let workload = state
            .workloads
            .get_mut(&deployment_id)
            .ok_or_else(|| AdapterError::NotFound(format!("workload {deployment_id}")))?;

        let (phase, ready) = if let Some(phase) = workload.phase_override {
            (phase, workload.ready_override.unwrap_or(0))
        } else if workload.polls_remaining > 0 {
            workload.polls_remaining -= 1;
            (WorkloadPhase::Progressing, 0)
        } else {
            (
                WorkloadPhase::Available,
                workload.ready_override.unwrap_or(workload.replicas),
            )
        };

        Ok(ObservedWorkload {
            phase,
            desired_replicas: workload.replicas,
            ready_replicas: ready,
            message: None,
        })
    }

    async fn delete_workload(
        &self,
        _cluster_id: ClusterId,
        deployment_id: DeploymentId,
    ) -> AdapterResult<()> {
        self.enter(calls::DELETE_WORKLOAD).await?;
        self.lock()
            .workloads
            .remove(&deployment_id)
            .map(|_| ())
            .ok_or_else(|| AdapterError::NotFound(format!("workload {deployment_id}")))
    }
}

#[async_trait]
impl MetricsOps for SimulatedClient {
    async fn query_metrics(
        &self,
        resource_id: &str,
        metric: &str,
        _window: Duration,
    ) -> AdapterResult<Vec<MetricPoint>> {
        self.enter(calls::QUERY_METRICS).await?;
        let mut state = self.lock();
        if let Some(error) = state.metric_faults.get(resource_id) {
            return Err(error.clone());
        }

        state.metric_seq += 1;
        let seq = state.metric_seq as f64;
        let value = match metric {
            "pod_count" => 3.0,
            "error_rate" => (seq % 5.0) / 100.0,
            "request_rate" => 100.0 + seq % 50.0,
            _ => (seq % 100.0) / 100.0,
        };

        Ok(vec![MetricPoint {
            timestamp: Utc::now(),
            value,
        }])
    }
}
