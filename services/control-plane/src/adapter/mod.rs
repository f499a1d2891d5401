//! Resource client adapter.
//!
//! The core talks to the external cluster-management API only through the
//! capability traits defined here:
//! - [`ClusterOps`]: create, inspect, and delete clusters
//! - [`WorkloadOps`]: apply, inspect, and delete workloads on a cluster
//! - [`MetricsOps`]: query raw metric samples
//!
//! [`Adapter`] is the handle the rest of the crate holds. It bounds every
//! call with a timeout and reports elapsed calls as [`AdapterError::Timeout`],
//! so callers treat a hung provider exactly like a failing one.

mod http;
mod simulated;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use portal_id::{ClusterId, DeploymentId};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::model::{
    Cluster, Deployment, OperationError, OperationErrorKind, ResourceRequests, Template,
};

pub use http::HttpResourceClient;
pub use simulated::{calls, SimulatedClient};

/// Result type for provider calls.
pub type AdapterResult<T> = Result<T, AdapterError>;

/// Errors returned by the cluster-management API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdapterError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("{call} timed out after {after:?}")]
    Timeout { call: &'static str, after: Duration },

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("provider rejected credentials: {0}")]
    Auth(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("provider rejected request: {0}")]
    Rejected(String),
}

impl AdapterError {
    /// Whether a later attempt may succeed. Auth, not-found, and rejected
    /// requests are fatal to the current attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Timeout { .. } | Self::Unavailable(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn kind(&self) -> OperationErrorKind {
        match self {
            Self::Transport(_) => OperationErrorKind::Transport,
            Self::Timeout { .. } => OperationErrorKind::Timeout,
            Self::Unavailable(_) => OperationErrorKind::Unavailable,
            Self::Auth(_) => OperationErrorKind::Auth,
            Self::NotFound(_) => OperationErrorKind::NotFound,
            Self::Rejected(_) => OperationErrorKind::Rejected,
        }
    }
}

impl From<&AdapterError> for OperationError {
    fn from(err: &AdapterError) -> Self {
        OperationError::new(err.kind(), err.to_string())
    }
}

// =============================================================================
// Wire Types
// =============================================================================

/// Request to provision a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRequest {
    pub id: ClusterId,
    pub name: String,
    pub provider: String,
    pub region: String,
    pub node_count: u32,
}

impl From<&Cluster> for ClusterRequest {
    fn from(cluster: &Cluster) -> Self {
        Self {
            id: cluster.id,
            name: cluster.name.clone(),
            provider: cluster.provider.clone(),
            region: cluster.region.clone(),
            node_count: cluster.node_count,
        }
    }
}

/// Cluster phase as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterPhase {
    Provisioning,
    Ready,
    Degraded,
    Error,
    Deleting,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservedCluster {
    pub phase: ClusterPhase,
    pub node_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Fully resolved workload sent to the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSpec {
    pub deployment_id: DeploymentId,
    pub cluster_id: ClusterId,
    pub name: String,
    pub namespace: String,
    pub image: String,
    pub replicas: u32,
    pub resources: ResourceRequests,
    pub params: BTreeMap<String, String>,
}

impl WorkloadSpec {
    /// Resolve a deployment against its template.
    pub fn resolve(deployment: &Deployment, template: &Template) -> Self {
        Self {
            deployment_id: deployment.id,
            cluster_id: deployment.cluster_id,
            name: deployment.name.clone(),
            namespace: deployment.namespace.clone(),
            image: template.image.clone(),
            replicas: deployment.replicas,
            resources: template.resources.clone(),
            params: template.resolve_params(&deployment.param_overrides),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkloadPhase {
    Progressing,
    Available,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservedWorkload {
    pub phase: WorkloadPhase,
    pub desired_replicas: u32,
    pub ready_replicas: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

// =============================================================================
// Capabilities
// =============================================================================

#[async_trait]
pub trait ClusterOps: Send + Sync {
    async fn create_cluster(&self, request: &ClusterRequest) -> AdapterResult<()>;

    async fn get_cluster_status(&self, id: ClusterId) -> AdapterResult<ObservedCluster>;

    async fn delete_cluster(&self, id: ClusterId) -> AdapterResult<()>;
}

#[async_trait]
pub trait WorkloadOps: Send + Sync {
    async fn apply_workload(&self, spec: &WorkloadSpec) -> AdapterResult<()>;

    async fn get_workload_status(
        &self,
        cluster_id: ClusterId,
        deployment_id: DeploymentId,
    ) -> AdapterResult<ObservedWorkload>;

    async fn delete_workload(
        &self,
        cluster_id: ClusterId,
        deployment_id: DeploymentId,
    ) -> AdapterResult<()>;
}

#[async_trait]
pub trait MetricsOps: Send + Sync {
    /// Samples for `metric` on `resource_id` within the trailing `window`.
    async fn query_metrics(
        &self,
        resource_id: &str,
        metric: &str,
        window: Duration,
    ) -> AdapterResult<Vec<MetricPoint>>;
}

/// Everything the core needs from a provider.
pub trait ResourceClient: ClusterOps + WorkloadOps + MetricsOps {}

impl<T: ClusterOps + WorkloadOps + MetricsOps> ResourceClient for T {}

// =============================================================================
// Adapter Handle
// =============================================================================

/// Default bound on a single provider call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout-bounded, cloneable handle over a [`ResourceClient`].
#[derive(Clone)]
pub struct Adapter {
    client: Arc<dyn ResourceClient>,
    timeout: Duration,
}

impl Adapter {
    pub fn new(client: Arc<dyn ResourceClient>, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    async fn bounded<T>(
        &self,
        call: &'static str,
        fut: impl Future<Output = AdapterResult<T>>,
    ) -> AdapterResult<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    call,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Provider call timed out"
                );
                Err(AdapterError::Timeout {
                    call,
                    after: self.timeout,
                })
            }
        }
    }

    pub async fn create_cluster(&self, request: &ClusterRequest) -> AdapterResult<()> {
        self.bounded(calls::CREATE_CLUSTER, self.client.create_cluster(request))
            .await
    }

    pub async fn get_cluster_status(&self, id: ClusterId) -> AdapterResult<ObservedCluster> {
        self.bounded(calls::GET_CLUSTER_STATUS, self.client.get_cluster_status(id))
            .await
    }

    pub async fn delete_cluster(&self, id: ClusterId) -> AdapterResult<()> {
        self.bounded(calls::DELETE_CLUSTER, self.client.delete_cluster(id))
            .await
    }

    pub async fn apply_workload(&self, spec: &WorkloadSpec) -> AdapterResult<()> {
        self.bounded(calls::APPLY_WORKLOAD, self.client.apply_workload(spec))
            .await
    }

    pub async fn get_workload_status(
        &self,
        cluster_id: ClusterId,
        deployment_id: DeploymentId,
    ) -> AdapterResult<ObservedWorkload> {
        self.bounded(
            calls::GET_WORKLOAD_STATUS,
            self.client.get_workload_status(cluster_id, deployment_id),
        )
        .await
    }

    pub async fn delete_workload(
        &self,
        cluster_id: ClusterId,
        deployment_id: DeploymentId,
    ) -> AdapterResult<()> {
        self.bounded(
            calls::DELETE_WORKLOAD,
            self.client.delete_workload(cluster_id, deployment_id),
        )
        .await
    }

    pub async fn query_metrics(
        &self,
        resource_id: &str,
        metric: &str,
        window: Duration,
    ) -> AdapterResult<Vec<MetricPoint>> {
        self.bounded(
            calls::QUERY_METRICS,
            self.client.query_metrics(resource_id, metric, window),
        )
        .await
    }
}
