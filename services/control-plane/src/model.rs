//! Domain model shared by the store, tracker, workers, and API.
//!
//! All types serialize as camelCase JSON, which is also the REST wire shape.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use portal_id::{ClusterId, DeploymentId, OperationId, TemplateId};
use portal_reconcile::{Drift, SpecHash};
use serde::{Deserialize, Serialize};

// =============================================================================
// Clusters
// =============================================================================

/// Observed lifecycle status of a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClusterStatus {
    Provisioning,
    Ready,
    Degraded,
    Deleting,
    Error,
    Deleted,
}

impl ClusterStatus {
    /// Deployments may only reference clusters that are not going away.
    pub fn accepts_deployments(&self) -> bool {
        matches!(self, Self::Ready)
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self, Self::Deleted)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    pub id: ClusterId,
    pub name: String,
    pub provider: String,
    pub region: String,
    pub node_count: u32,
    pub status: ClusterStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_node_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drift: Option<Drift>,
    /// Bumped on every accepted mutation.
    pub generation: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Deployments
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeploymentStatus {
    Pending,
    RollingOut,
    Running,
    Degraded,
    Failed,
    Deleted,
}

impl DeploymentStatus {
    pub fn is_deleted(&self) -> bool {
        matches!(self, Self::Deleted)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    pub id: DeploymentId,
    pub cluster_id: ClusterId,
    pub template_id: TemplateId,
    pub name: String,
    pub namespace: String,
    /// Desired replica count.
    pub replicas: u32,
    /// Replica count last reported ready by the provider.
    pub ready_replicas: u32,
    pub param_overrides: BTreeMap<String, String>,
    pub status: DeploymentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drift: Option<Drift>,
    pub generation: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Templates
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequests {
    #[serde(default)]
    pub cpu: String,
    #[serde(default)]
    pub memory: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateParameter {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default)]
    pub required: bool,
}

/// An immutable, versioned application template.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    pub id: TemplateId,
    pub name: String,
    pub version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_version: Option<TemplateId>,
    pub image: String,
    pub resources: ResourceRequests,
    pub parameters: Vec<TemplateParameter>,
    pub spec_hash: SpecHash,
    pub created_at: DateTime<Utc>,
}

impl Template {
    pub fn parameter(&self, name: &str) -> Option<&TemplateParameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Resolve parameter values: declared defaults overlaid with overrides.
    pub fn resolve_params(&self, overrides: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut values: BTreeMap<String, String> = self
            .parameters
            .iter()
            .filter_map(|p| p.default.clone().map(|d| (p.name.clone(), d)))
            .collect();
        values.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        values
    }
}

// =============================================================================
// Operations
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceType {
    Cluster,
    Deployment,
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cluster => f.write_str("cluster"),
            Self::Deployment => f.write_str("deployment"),
        }
    }
}

/// The resource an operation targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    pub resource_type: ResourceType,
    pub resource_id: String,
}

impl ResourceRef {
    pub fn cluster(id: ClusterId) -> Self {
        Self {
            resource_type: ResourceType::Cluster,
            resource_id: id.to_string(),
        }
    }

    pub fn deployment(id: DeploymentId) -> Self {
        Self {
            resource_type: ResourceType::Deployment,
            resource_id: id.to_string(),
        }
    }
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.resource_type, self.resource_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    Create,
    Update,
    Delete,
    Scale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationErrorKind {
    Transport,
    Timeout,
    Unavailable,
    Auth,
    NotFound,
    Rejected,
    /// The provider reported the resource itself as failed.
    Provider,
    /// The resource stopped progressing short of its desired state.
    Diverged,
    /// A later delete replaced this operation.
    Superseded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationError {
    pub kind: OperationErrorKind,
    pub message: String,
}

impl OperationError {
    pub fn new(kind: OperationErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Mutable resource fields captured when an operation is accepted.
///
/// `prior` is restored if the operation fails for reasons other than an
/// observed provider failure; `desired` is re-applied when it is retried.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceSnapshot {
    Cluster {
        status: ClusterStatus,
    },
    Deployment {
        status: DeploymentStatus,
        replicas: u32,
        param_overrides: BTreeMap<String, String>,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: OperationId,
    pub target: ResourceRef,
    /// Human label of the target (cluster or deployment name).
    pub target_name: String,
    pub kind: OperationKind,
    pub status: OperationStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<OperationError>,
    /// Whether the current attempt reached the provider.
    #[serde(skip)]
    pub submitted: bool,
    /// Resource generation this operation was accepted against.
    #[serde(skip)]
    pub generation: u64,
    #[serde(skip)]
    pub prior: Option<ResourceSnapshot>,
    #[serde(skip)]
    pub desired: Option<ResourceSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Metrics
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSample {
    pub resource_id: String,
    pub metric: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

pub const CLUSTER_METRICS: &[&str] = &["cpu_usage", "memory_usage", "pod_count"];

pub const DEPLOYMENT_METRICS: &[&str] = &[
    "cpu_usage",
    "memory_usage",
    "pod_count",
    "request_rate",
    "error_rate",
];
