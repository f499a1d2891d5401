//! Orchestration service.
//!
//! The façade between REST intents and the provider. Each mutating call:
//! 1. validates the intent
//! 2. takes the advisory lock for the affected resource key
//! 3. submits to the provider (bounded by the adapter timeout)
//! 4. registers exactly one operation and releases the lock
//!
//! Provider failures during submission are never returned to the caller;
//! they are recorded on the operation and retried by the reconciler.
//! Reads are served from the store, tracker, and metrics rings only.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use portal_id::{ClusterId, DeploymentId, OperationId, TemplateId};
use portal_reconcile::SpecHash;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::adapter::{Adapter, AdapterError, ClusterRequest, WorkloadSpec};
use crate::locks::{self, LockGuard, LockRegistry};
use crate::metrics::{self, FetchHealth, MetricsStore};
use crate::model::{
    Cluster, ClusterStatus, Deployment, DeploymentStatus, MetricSample, Operation, OperationKind,
    OperationStatus, ResourceRef, ResourceRequests, ResourceSnapshot, ResourceType, Template,
    TemplateParameter,
};
use crate::operations::{NewOperation, OperationTracker, Submission, TrackerError};
use crate::store::ResourceStore;

/// Result type for service calls.
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Synchronous errors returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    /// Malformed or missing intent fields.
    #[error("invalid {field}: {message}")]
    Validation { field: String, message: String },

    /// A referenced resource is missing (`missing`) or in the wrong state.
    #[error("{message}")]
    Precondition { message: String, missing: bool },

    /// Another mutation holds the resource.
    #[error("{0}")]
    Conflict(String),

    /// Unknown resource on read.
    #[error("{0}")]
    NotFound(String),
}

impl ServiceError {
    fn validation(field: &str, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.to_string(),
            message: message.into(),
        }
    }

    fn missing(message: impl Into<String>) -> Self {
        Self::Precondition {
            message: message.into(),
            missing: true,
        }
    }

    fn wrong_state(message: impl Into<String>) -> Self {
        Self::Precondition {
            message: message.into(),
            missing: false,
        }
    }
}

impl From<TrackerError> for ServiceError {
    fn from(err: TrackerError) -> Self {
        match err {
            TrackerError::NotFound(id) => Self::NotFound(format!("operation {id} not found")),
            other => Self::Conflict(other.to_string()),
        }
    }
}

// =============================================================================
// Intents and Handles
// =============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateClusterRequest {
    pub name: String,
    pub provider: String,
    pub region: String,
    pub node_count: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateDeploymentRequest {
    pub template_id: String,
    pub cluster_id: String,
    pub namespace: String,
    pub replicas: Option<i64>,
    /// Defaults to the template name.
    pub name: Option<String>,
    pub param_overrides: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateTemplateRequest {
    pub name: String,
    pub image: String,
    pub resources: ResourceRequests,
    pub parameters: Vec<TemplateParameter>,
}

/// The mutable subset of a deployment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeploymentPatch {
    pub replicas: Option<u32>,
    pub param_overrides: Option<BTreeMap<String, String>>,
}

impl DeploymentPatch {
    const FIELDS: [&'static str; 2] = ["replicas", "paramOverrides"];

    /// Parse a patch body, rejecting any field that is not mutable.
    pub fn from_json(body: serde_json::Value) -> ServiceResult<Self> {
        let serde_json::Value::Object(map) = body else {
            return Err(ServiceError::validation("body", "expected a JSON object"));
        };

        if let Some(field) = map.keys().find(|k| !Self::FIELDS.contains(&k.as_str())) {
            return Err(ServiceError::validation(
                field,
                "field is immutable; only replicas and paramOverrides may change",
            ));
        }

        let replicas = match map.get("replicas") {
            None | Some(serde_json::Value::Null) => None,
            Some(value) => {
                let replicas = value
                    .as_i64()
                    .ok_or_else(|| ServiceError::validation("replicas", "must be an integer"))?;
                Some(replica_count(replicas, 0)?)
            }
        };

        let param_overrides = match map.get("paramOverrides") {
            None | Some(serde_json::Value::Null) => None,
            Some(value) => Some(
                serde_json::from_value::<BTreeMap<String, String>>(value.clone()).map_err(
                    |_| ServiceError::validation("paramOverrides", "must map names to strings"),
                )?,
            ),
        };

        if replicas.is_none() && param_overrides.is_none() {
            return Err(ServiceError::validation("body", "patch changes nothing"));
        }

        Ok(Self {
            replicas,
            param_overrides,
        })
    }

    fn kind(&self) -> OperationKind {
        if self.param_overrides.is_none() {
            OperationKind::Scale
        } else {
            OperationKind::Update
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterAccepted {
    pub operation_id: OperationId,
    pub cluster_id: ClusterId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentAccepted {
    pub operation_id: OperationId,
    pub deployment_id: DeploymentId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationAccepted {
    pub operation_id: OperationId,
}

/// A cluster with its most recent metric values.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDetail {
    #[serde(flatten)]
    pub cluster: Cluster,
    pub recent_metrics: Vec<MetricSample>,
    pub metrics_health: FetchHealth,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_operation: Option<OperationId>,
}

// =============================================================================
// Validation
// =============================================================================

const MAX_NODE_COUNT: i64 = 1000;
const MAX_REPLICAS: i64 = 1000;

/// Kubernetes-style DNS label: 1-63 lowercase alphanumerics or '-', no edge dashes.
fn validate_label(field: &str, value: &str) -> ServiceResult<()> {
    let valid = !value.is_empty()
        && value.len() <= 63
        && value
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        && !value.starts_with('-')
        && !value.ends_with('-');
    if valid {
        Ok(())
    } else {
        Err(ServiceError::validation(
            field,
            "must be 1-63 lowercase alphanumerics or '-', not starting or ending with '-'",
        ))
    }
}

fn required(field: &str, value: &str) -> ServiceResult<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ServiceError::validation(field, "is required"));
    }
    Ok(value.to_string())
}

fn replica_count(value: i64, min: i64) -> ServiceResult<u32> {
    if value < min || value > MAX_REPLICAS {
        return Err(ServiceError::validation(
            "replicas",
            format!("must be between {min} and {MAX_REPLICAS}"),
        ));
    }
    Ok(value as u32)
}

fn validate_overrides(
    template: &Template,
    overrides: &BTreeMap<String, String>,
) -> ServiceResult<()> {
    if let Some(unknown) = overrides.keys().find(|k| template.parameter(k).is_none()) {
        return Err(ServiceError::validation(
            "paramOverrides",
            format!("template {} declares no parameter '{unknown}'", template.id),
        ));
    }
    if let Some(missing) = template
        .parameters
        .iter()
        .find(|p| p.required && p.default.is_none() && !overrides.contains_key(&p.name))
    {
        return Err(ServiceError::validation(
            "paramOverrides",
            format!("required parameter '{}' has no value", missing.name),
        ));
    }
    Ok(())
}

fn submission<T>(result: Result<T, AdapterError>) -> Submission {
    match result {
        Ok(_) => Submission::Accepted,
        Err(err) => {
            warn!(error = %err, "Provider submission failed, recording on operation");
            Submission::Failed(err)
        }
    }
}

/// A delete whose target is already gone at the provider has done its job.
fn delete_submission(result: Result<(), AdapterError>) -> Submission {
    match result {
        Err(err) if err.is_not_found() => Submission::Accepted,
        other => submission(other),
    }
}

fn deployment_snapshot(deployment: &Deployment) -> ResourceSnapshot {
    ResourceSnapshot::Deployment {
        status: deployment.status,
        replicas: deployment.replicas,
        param_overrides: deployment.param_overrides.clone(),
    }
}

// =============================================================================
// Service
// =============================================================================

pub struct OrchestrationService {
    resources: Arc<ResourceStore>,
    tracker: Arc<OperationTracker>,
    metrics: Arc<MetricsStore>,
    adapter: Adapter,
    locks: LockRegistry,
    lock_wait: Duration,
}

impl OrchestrationService {
    pub fn new(
        resources: Arc<ResourceStore>,
        tracker: Arc<OperationTracker>,
        metrics: Arc<MetricsStore>,
        adapter: Adapter,
        lock_wait: Duration,
    ) -> Self {
        Self {
            resources,
            tracker,
            metrics,
            adapter,
            locks: LockRegistry::new(),
            lock_wait,
        }
    }

    pub fn resources(&self) -> &Arc<ResourceStore> {
        &self.resources
    }

    pub fn tracker(&self) -> &Arc<OperationTracker> {
        &self.tracker
    }

    pub fn metrics(&self) -> &Arc<MetricsStore> {
        &self.metrics
    }

    async fn lock(&self, key: String) -> ServiceResult<LockGuard> {
        self.locks
            .acquire(&key, self.lock_wait)
            .await
            .ok_or_else(|| {
                ServiceError::Conflict(format!("another mutation holds {key}; retry the request"))
            })
    }

    // =========================================================================
    // Clusters
    // =========================================================================

    #[instrument(skip(self, req), fields(name = %req.name))]
    pub async fn create_cluster(&self, req: CreateClusterRequest) -> ServiceResult<ClusterAccepted> {
        validate_label("name", &req.name)?;
        let provider = required("provider", &req.provider)?.to_lowercase();
        let region = required("region", &req.region)?;
        let node_count = match req.node_count {
            Some(n) if (1..=MAX_NODE_COUNT).contains(&n) => n as u32,
            Some(_) => {
                return Err(ServiceError::validation(
                    "nodeCount",
                    format!("must be between 1 and {MAX_NODE_COUNT}"),
                ))
            }
            None => return Err(ServiceError::validation("nodeCount", "is required")),
        };

        let _name_guard = self.lock(locks::cluster_name_key(&req.name)).await?;

        if let Some(op) = self
            .tracker
            .active_by_name(ResourceType::Cluster, &req.name)
            .await
        {
            return Err(ServiceError::Conflict(format!(
                "operation {} is already in flight for cluster '{}'",
                op.id, req.name
            )));
        }
        if self.resources.cluster_by_name(&req.name).await.is_some() {
            return Err(ServiceError::Conflict(format!(
                "cluster '{}' already exists",
                req.name
            )));
        }

        let id = ClusterId::new();
        let _id_guard = self.lock(locks::resource_key(&id.to_string())).await?;

        let now = Utc::now();
        self.resources
            .insert_cluster(Cluster {
                id,
                name: req.name.clone(),
                provider,
                region,
                node_count,
                status: ClusterStatus::Provisioning,
                observed_node_count: None,
                drift: None,
                generation: 1,
                created_at: now,
                updated_at: now,
            })
            .await;

        let Some(cluster) = self.resources.cluster(id).await else {
            return Err(ServiceError::NotFound(format!("cluster {id} not found")));
        };
        let submission = submission(
            self.adapter
                .create_cluster(&ClusterRequest::from(&cluster))
                .await,
        );

        let op = self
            .tracker
            .register(NewOperation {
                target: ResourceRef::cluster(id),
                target_name: req.name,
                kind: OperationKind::Create,
                generation: 1,
                prior: None,
                desired: None,
                submission,
            })
            .await?;

        info!(cluster_id = %id, operation_id = %op.id, "Cluster create accepted");
        Ok(ClusterAccepted {
            operation_id: op.id,
            cluster_id: id,
        })
    }

    /// Resolve a cluster by id or, failing that, by name.
    async fn find_cluster(&self, id_or_name: &str) -> Option<Cluster> {
        match ClusterId::parse(id_or_name) {
            Ok(id) => self.resources.cluster(id).await,
            Err(_) => self.resources.cluster_by_name(id_or_name).await,
        }
    }

    pub async fn get_cluster(&self, id_or_name: &str) -> ServiceResult<ClusterDetail> {
        let cluster = self
            .find_cluster(id_or_name)
            .await
            .filter(|c| !c.status.is_deleted())
            .ok_or_else(|| ServiceError::NotFound(format!("cluster {id_or_name} not found")))?;

        let resource_id = cluster.id.to_string();
        let active_operation = self
            .tracker
            .active_for(&ResourceRef::cluster(cluster.id))
            .await
            .map(|op| op.id);

        Ok(ClusterDetail {
            recent_metrics: self.metrics.latest(&resource_id).await,
            metrics_health: self.metrics.health(&resource_id).await,
            active_operation,
            cluster,
        })
    }

    pub async fn list_clusters(&self) -> Vec<Cluster> {
        self.resources.list_clusters().await
    }

    #[instrument(skip(self))]
    pub async fn delete_cluster(&self, id_or_name: &str) -> ServiceResult<OperationAccepted> {
        // A repeated delete by name resolves to the tombstone it left behind.
        let found = match self.find_cluster(id_or_name).await {
            Some(cluster) => cluster,
            None => self
                .resources
                .latest_cluster_by_name(id_or_name)
                .await
                .ok_or_else(|| ServiceError::NotFound(format!("cluster {id_or_name} not found")))?,
        };
        let target = ResourceRef::cluster(found.id);

        let _guard = self.lock(locks::resource_key(&target.resource_id)).await?;
        let cluster = self
            .resources
            .cluster(found.id)
            .await
            .ok_or_else(|| ServiceError::NotFound(format!("cluster {id_or_name} not found")))?;

        if let Some(existing) = self.existing_delete(&target, cluster.status.is_deleted()).await {
            return Ok(existing);
        }
        if cluster.status.is_deleted() {
            // Its delete operation has already been pruned.
            return Err(ServiceError::NotFound(format!("cluster {id_or_name} not found")));
        }

        let live = self.resources.list_deployments(Some(cluster.id)).await;
        if !live.is_empty() {
            return Err(ServiceError::wrong_state(format!(
                "cluster {} still has {} deployment(s)",
                cluster.id,
                live.len()
            )));
        }

        self.tracker.supersede(&target, OperationKind::Delete).await;

        let generation = cluster.generation + 1;
        self.resources
            .update_cluster(cluster.id, |c| {
                c.status = ClusterStatus::Deleting;
                c.generation = generation;
            })
            .await;

        let submission = delete_submission(self.adapter.delete_cluster(cluster.id).await);
        let op = self
            .tracker
            .register(NewOperation {
                target,
                target_name: cluster.name.clone(),
                kind: OperationKind::Delete,
                generation,
                prior: Some(ResourceSnapshot::Cluster {
                    status: cluster.status,
                }),
                desired: Some(ResourceSnapshot::Cluster {
                    status: ClusterStatus::Deleting,
                }),
                submission,
            })
            .await?;

        if op.status == OperationStatus::Failed {
            // Fatal submission: the cluster stays as it was.
            self.resources
                .update_cluster_if(cluster.id, generation, |c| c.status = cluster.status)
                .await;
        }

        info!(cluster_id = %cluster.id, operation_id = %op.id, "Cluster delete accepted");
        Ok(OperationAccepted {
            operation_id: op.id,
        })
    }

    /// Idempotent delete: reuse an in-flight delete, or the one that finished.
    async fn existing_delete(
        &self,
        target: &ResourceRef,
        deleted: bool,
    ) -> Option<OperationAccepted> {
        if let Some(active) = self.tracker.active_for(target).await {
            if active.kind == OperationKind::Delete {
                return Some(OperationAccepted {
                    operation_id: active.id,
                });
            }
        }
        if !deleted {
            return None;
        }
        self.tracker
            .list(Some(&target.resource_id))
            .await
            .into_iter()
            .rev()
            .find(|op| op.kind == OperationKind::Delete && op.status == OperationStatus::Succeeded)
            .map(|op| OperationAccepted {
                operation_id: op.id,
            })
    }

    pub async fn cluster_metrics(
        &self,
        id_or_name: &str,
        window: Option<&str>,
    ) -> ServiceResult<Vec<MetricSample>> {
        let cluster = self
            .find_cluster(id_or_name)
            .await
            .filter(|c| !c.status.is_deleted())
            .ok_or_else(|| ServiceError::NotFound(format!("cluster {id_or_name} not found")))?;
        self.metric_range(&cluster.id.to_string(), window).await
    }

    // =========================================================================
    // Deployments
    // =========================================================================

    #[instrument(skip(self, req), fields(cluster_id = %req.cluster_id, namespace = %req.namespace))]
    pub async fn create_deployment(
        &self,
        req: CreateDeploymentRequest,
    ) -> ServiceResult<DeploymentAccepted> {
        let template_id: TemplateId = required("templateId", &req.template_id)?
            .parse()
            .map_err(|e| ServiceError::validation("templateId", format!("{e}")))?;
        required("clusterId", &req.cluster_id)?;
        validate_label("namespace", &req.namespace)?;
        let replicas = match req.replicas {
            Some(n) => replica_count(n, 1)?,
            None => return Err(ServiceError::validation("replicas", "is required")),
        };

        let template = self
            .resources
            .template(template_id)
            .await
            .ok_or_else(|| ServiceError::missing(format!("template {template_id} not found")))?;
        let name = req.name.clone().unwrap_or_else(|| template.name.clone());
        validate_label("name", &name)?;
        validate_overrides(&template, &req.param_overrides)?;

        let cluster = self
            .find_cluster(&req.cluster_id)
            .await
            .filter(|c| !c.status.is_deleted())
            .ok_or_else(|| ServiceError::missing(format!("cluster {} not found", req.cluster_id)))?;

        let slot_key = locks::deployment_slot_key(&cluster.id.to_string(), &req.namespace, &name);
        let _slot_guard = self.lock(slot_key).await?;
        // Lock order is slot, then cluster, then the new deployment. Holding the
        // cluster keeps a concurrent cluster delete out until the insert lands.
        let _cluster_guard = self.lock(locks::resource_key(&cluster.id.to_string())).await?;

        // Re-read under the lock: the cluster may have moved on.
        let cluster = self
            .resources
            .cluster(cluster.id)
            .await
            .ok_or_else(|| ServiceError::missing(format!("cluster {} not found", cluster.id)))?;
        if !cluster.status.accepts_deployments() {
            return Err(ServiceError::wrong_state(format!(
                "cluster {} is {:?}, deployments require Ready",
                cluster.id, cluster.status
            )));
        }

        if let Some(existing) = self
            .resources
            .deployment_by_key(cluster.id, &req.namespace, &name)
            .await
        {
            return Err(ServiceError::Conflict(format!(
                "deployment '{}' already exists in {}/{} as {}",
                name, cluster.name, req.namespace, existing.id
            )));
        }

        let id = DeploymentId::new();
        let _id_guard = self.lock(locks::resource_key(&id.to_string())).await?;

        let now = Utc::now();
        let deployment = Deployment {
            id,
            cluster_id: cluster.id,
            template_id,
            name: name.clone(),
            namespace: req.namespace.clone(),
            replicas,
            ready_replicas: 0,
            param_overrides: req.param_overrides,
            status: DeploymentStatus::Pending,
            drift: None,
            generation: 1,
            created_at: now,
            updated_at: now,
        };
        self.resources.insert_deployment(deployment.clone()).await;

        let spec = WorkloadSpec::resolve(&deployment, &template);
        let submission = submission(self.adapter.apply_workload(&spec).await);

        let op = self
            .tracker
            .register(NewOperation {
                target: ResourceRef::deployment(id),
                target_name: name,
                kind: OperationKind::Create,
                generation: 1,
                prior: None,
                desired: Some(deployment_snapshot(&deployment)),
                submission,
            })
            .await?;

        info!(deployment_id = %id, operation_id = %op.id, "Deployment create accepted");
        Ok(DeploymentAccepted {
            operation_id: op.id,
            deployment_id: id,
        })
    }

    fn parse_deployment_id(id: &str) -> ServiceResult<DeploymentId> {
        id.parse()
            .map_err(|_| ServiceError::NotFound(format!("deployment {id} not found")))
    }

    async fn live_deployment(&self, id: DeploymentId) -> ServiceResult<Deployment> {
        self.resources
            .deployment(id)
            .await
            .filter(|d| !d.status.is_deleted())
            .ok_or_else(|| ServiceError::NotFound(format!("deployment {id} not found")))
    }

    #[instrument(skip(self, patch))]
    pub async fn update_deployment(
        &self,
        id: &str,
        patch: DeploymentPatch,
    ) -> ServiceResult<OperationAccepted> {
        let id = Self::parse_deployment_id(id)?;
        let target = ResourceRef::deployment(id);

        let _guard = self.lock(locks::resource_key(&target.resource_id)).await?;
        let deployment = self.live_deployment(id).await?;

        if let Some(active) = self.tracker.active_for(&target).await {
            return Err(ServiceError::Conflict(format!(
                "deployment {id} has {:?} operation {} in flight",
                active.kind, active.id
            )));
        }

        let cluster = self.resources.cluster(deployment.cluster_id).await;
        if !cluster.as_ref().is_some_and(|c| {
            matches!(c.status, ClusterStatus::Ready | ClusterStatus::Degraded)
        }) {
            return Err(ServiceError::wrong_state(format!(
                "cluster {} cannot accept changes",
                deployment.cluster_id
            )));
        }

        let template = self
            .resources
            .template(deployment.template_id)
            .await
            .ok_or_else(|| {
                ServiceError::missing(format!("template {} not found", deployment.template_id))
            })?;

        let kind = patch.kind();
        let replicas = patch.replicas.unwrap_or(deployment.replicas);
        let param_overrides = patch
            .param_overrides
            .unwrap_or_else(|| deployment.param_overrides.clone());
        validate_overrides(&template, &param_overrides)?;

        let generation = deployment.generation + 1;
        let Some(updated) = self
            .resources
            .update_deployment(id, |d| {
                d.replicas = replicas;
                d.param_overrides = param_overrides;
                d.status = DeploymentStatus::RollingOut;
                d.drift = None;
                d.generation = generation;
            })
            .await
        else {
            return Err(ServiceError::NotFound(format!("deployment {id} not found")));
        };

        let spec = WorkloadSpec::resolve(&updated, &template);
        let submission = submission(self.adapter.apply_workload(&spec).await);

        let prior = deployment_snapshot(&deployment);
        let op = self
            .tracker
            .register(NewOperation {
                target,
                target_name: deployment.name.clone(),
                kind,
                generation,
                prior: Some(prior.clone()),
                desired: Some(deployment_snapshot(&updated)),
                submission,
            })
            .await?;

        if op.status == OperationStatus::Failed {
            self.restore_deployment(id, generation, &prior).await;
        }

        info!(deployment_id = %id, operation_id = %op.id, kind = ?kind, "Deployment update accepted");
        Ok(OperationAccepted {
            operation_id: op.id,
        })
    }

    async fn restore_deployment(&self, id: DeploymentId, generation: u64, prior: &ResourceSnapshot) {
        if let ResourceSnapshot::Deployment {
            status,
            replicas,
            param_overrides,
        } = prior
        {
            self.resources
                .update_deployment_if(id, generation, |d| {
                    d.status = *status;
                    d.replicas = *replicas;
                    d.param_overrides = param_overrides.clone();
                })
                .await;
        }
    }

    #[instrument(skip(self))]
    pub async fn delete_deployment(&self, id: &str) -> ServiceResult<OperationAccepted> {
        let id = Self::parse_deployment_id(id)?;
        let target = ResourceRef::deployment(id);

        let _guard = self.lock(locks::resource_key(&target.resource_id)).await?;
        let deployment = self
            .resources
            .deployment(id)
            .await
            .ok_or_else(|| ServiceError::NotFound(format!("deployment {id} not found")))?;

        if let Some(existing) = self
            .existing_delete(&target, deployment.status.is_deleted())
            .await
        {
            return Ok(existing);
        }
        if deployment.status.is_deleted() {
            return Err(ServiceError::NotFound(format!("deployment {id} not found")));
        }

        if let Some(superseded) = self.tracker.supersede(&target, OperationKind::Delete).await {
            if let Some(prior) = &superseded.prior {
                self.restore_deployment(id, deployment.generation, prior).await;
            }
        }
        let deployment = self.resources.deployment(id).await.unwrap_or(deployment);

        let generation = deployment.generation + 1;
        self.resources
            .update_deployment(id, |d| d.generation = generation)
            .await;

        let submission = delete_submission(
            self.adapter
                .delete_workload(deployment.cluster_id, deployment.id)
                .await,
        );
        let op = self
            .tracker
            .register(NewOperation {
                target,
                target_name: deployment.name.clone(),
                kind: OperationKind::Delete,
                generation,
                prior: Some(deployment_snapshot(&deployment)),
                desired: None,
                submission,
            })
            .await?;

        info!(deployment_id = %id, operation_id = %op.id, "Deployment delete accepted");
        Ok(OperationAccepted {
            operation_id: op.id,
        })
    }

    pub async fn get_deployment(&self, id: &str) -> ServiceResult<Deployment> {
        self.live_deployment(Self::parse_deployment_id(id)?).await
    }

    pub async fn list_deployments(&self, cluster: Option<&str>) -> ServiceResult<Vec<Deployment>> {
        let cluster_id = match cluster {
            None => None,
            Some(c) => Some(
                self.find_cluster(c)
                    .await
                    .ok_or_else(|| ServiceError::NotFound(format!("cluster {c} not found")))?
                    .id,
            ),
        };
        Ok(self.resources.list_deployments(cluster_id).await)
    }

    pub async fn deployment_metrics(
        &self,
        id: &str,
        window: Option<&str>,
    ) -> ServiceResult<Vec<MetricSample>> {
        let deployment = self.live_deployment(Self::parse_deployment_id(id)?).await?;
        self.metric_range(&deployment.id.to_string(), window).await
    }

    async fn metric_range(
        &self,
        resource_id: &str,
        window: Option<&str>,
    ) -> ServiceResult<Vec<MetricSample>> {
        let window = match window {
            None => metrics::DEFAULT_WINDOW,
            Some(raw) => metrics::parse_window(raw).ok_or_else(|| {
                ServiceError::validation("window", "expected a duration such as 30s, 15m, or 1h")
            })?,
        };
        if !self.resources.is_live_resource(resource_id).await {
            return Err(ServiceError::NotFound(format!("resource {resource_id} not found")));
        }
        let since = chrono::Duration::from_std(window)
            .ok()
            .and_then(|w| Utc::now().checked_sub_signed(w))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        Ok(self.metrics.range(resource_id, since).await)
    }

    // =========================================================================
    // Templates
    // =========================================================================

    #[instrument(skip(self, req), fields(name = %req.name))]
    pub async fn create_template(&self, req: CreateTemplateRequest) -> ServiceResult<Template> {
        validate_label("name", &req.name)?;
        let image = required("image", &req.image)?;

        let mut seen = std::collections::HashSet::new();
        for param in &req.parameters {
            if param.name.trim().is_empty() {
                return Err(ServiceError::validation("parameters", "parameter names are required"));
            }
            if !seen.insert(param.name.as_str()) {
                return Err(ServiceError::validation(
                    "parameters",
                    format!("duplicate parameter '{}'", param.name),
                ));
            }
        }

        let _guard = self.lock(format!("template-name:{}", req.name)).await?;
        let previous = self.resources.latest_template(&req.name).await;

        let spec_hash = SpecHash::from_json(&serde_json::json!({
            "image": image,
            "resources": req.resources,
            "parameters": req.parameters,
        }));

        let template = Template {
            id: TemplateId::new(),
            name: req.name,
            version: previous.as_ref().map_or(1, |p| p.version + 1),
            previous_version: previous.map(|p| p.id),
            image,
            resources: req.resources,
            parameters: req.parameters,
            spec_hash,
            created_at: Utc::now(),
        };
        self.resources.insert_template(template.clone()).await;

        info!(template_id = %template.id, version = template.version, "Template created");
        Ok(template)
    }

    pub async fn get_template(&self, id: &str) -> ServiceResult<Template> {
        let not_found = || ServiceError::NotFound(format!("template {id} not found"));
        let id: TemplateId = id.parse().map_err(|_| not_found())?;
        self.resources.template(id).await.ok_or_else(not_found)
    }

    pub async fn list_templates(&self) -> Vec<Template> {
        self.resources.list_templates().await
    }

    // =========================================================================
    // Operations
    // =========================================================================

    pub async fn get_operation(&self, id: &str) -> ServiceResult<Operation> {
        let not_found = || ServiceError::NotFound(format!("operation {id} not found"));
        let id: OperationId = id.parse().map_err(|_| not_found())?;
        self.tracker.get(id).await.ok_or_else(not_found)
    }

    pub async fn list_operations(&self, resource_id: Option<&str>) -> Vec<Operation> {
        self.tracker.list(resource_id).await
    }

    /// Resubmit a failed operation as its next attempt.
    #[instrument(skip(self))]
    pub async fn retry_operation(&self, id: &str) -> ServiceResult<OperationAccepted> {
        let op = self.get_operation(id).await?;
        let _guard = self.lock(locks::resource_key(&op.target.resource_id)).await?;

        let generation = match op.target.resource_type {
            ResourceType::Cluster => {
                let cluster_id = ClusterId::parse(&op.target.resource_id)
                    .map_err(|e| ServiceError::NotFound(e.to_string()))?;
                let cluster = self
                    .resources
                    .cluster(cluster_id)
                    .await
                    .filter(|c| !c.status.is_deleted())
                    .ok_or_else(|| ServiceError::wrong_state("cluster no longer exists"))?;
                cluster.generation + 1
            }
            ResourceType::Deployment => {
                let deployment_id = DeploymentId::parse(&op.target.resource_id)
                    .map_err(|e| ServiceError::NotFound(e.to_string()))?;
                let deployment = self
                    .resources
                    .deployment(deployment_id)
                    .await
                    .filter(|d| !d.status.is_deleted())
                    .ok_or_else(|| ServiceError::wrong_state("deployment no longer exists"))?;
                deployment.generation + 1
            }
        };

        let retried = self.tracker.retry(op.id).await?;
        self.reapply(&retried, generation).await;
        self.tracker.set_generation(retried.id, generation).await?;

        Ok(OperationAccepted {
            operation_id: retried.id,
        })
    }

    /// Put the target back into the state the operation is driving toward.
    async fn reapply(&self, op: &Operation, generation: u64) {
        match (&op.target.resource_type, op.kind) {
            (ResourceType::Cluster, kind) => {
                let status = match kind {
                    OperationKind::Delete => ClusterStatus::Deleting,
                    _ => ClusterStatus::Provisioning,
                };
                if let Ok(id) = ClusterId::parse(&op.target.resource_id) {
                    self.resources
                        .update_cluster(id, |c| {
                            c.status = status;
                            c.generation = generation;
                        })
                        .await;
                }
            }
            (ResourceType::Deployment, kind) => {
                let Ok(id) = DeploymentId::parse(&op.target.resource_id) else {
                    return;
                };
                let desired = op.desired.clone();
                self.resources
                    .update_deployment(id, |d| {
                        if let Some(ResourceSnapshot::Deployment {
                            replicas,
                            param_overrides,
                            ..
                        }) = desired
                        {
                            d.replicas = replicas;
                            d.param_overrides = param_overrides;
                        }
                        d.status = match kind {
                            OperationKind::Create => DeploymentStatus::Pending,
                            OperationKind::Delete => d.status,
                            OperationKind::Update | OperationKind::Scale => {
                                DeploymentStatus::RollingOut
                            }
                        };
                        d.generation = generation;
                    })
                    .await;
            }
        }
    }
}
